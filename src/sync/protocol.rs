//! Iroh protocol handler for document op relay.
//!
//! Uses persistent bidirectional connections. Each connection exchanges a
//! snapshot on open so a reconnecting peer catches up on everything it missed,
//! then relays individual ops as they happen. Every op carries a globally
//! unique version stamp, so a stamp-keyed seen set both deduplicates
//! redelivery and stops relay loops in meshed topologies.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};

use crate::document::{Document, Origin, ReplicaId, RoomId, VersionStamp, WireOp};

/// Protocol identifier for document sync.
pub const DOC_ALPN: &[u8] = b"canvasync/doc/1";

/// Wire messages on a document connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DocMessage {
    /// Sent first on every connection; peers in different rooms disconnect.
    Hello { room: RoomId, replica: ReplicaId },
    /// Ask the peer for its full state.
    SnapshotRequest,
    /// Full serialized document state, merged (not replaced) on receipt.
    Snapshot(Vec<u8>),
    /// One object mutation.
    Op(WireOp),
}

/// Updates surfaced from connections to the sync loop.
#[derive(Debug)]
pub enum DocUpdate {
    Op(WireOp),
    Snapshot(Vec<u8>),
}

/// Document relay protocol over iroh connections.
#[derive(Clone)]
pub struct DocProtocol {
    inner: Arc<DocInner>,
}

impl std::fmt::Debug for DocProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocProtocol").finish()
    }
}

struct DocInner {
    room: RoomId,
    replica: ReplicaId,
    /// Sync-thread mirror of the document; answers snapshot requests and
    /// absorbs everything that flows through this node.
    mirror: Mutex<Document>,
    /// Stamps this node has already processed. Ops are stamped once at the
    /// minting replica, so membership here means "relayed already".
    seen: Mutex<HashSet<VersionStamp>>,
    /// Fan-out to every live connection.
    outgoing_tx: broadcast::Sender<DocMessage>,
    /// Channel to the sync loop for updates destined for the main thread.
    update_tx: mpsc::Sender<DocUpdate>,
}

impl DocProtocol {
    /// Protocol identifier.
    pub const ALPN: &'static [u8] = DOC_ALPN;

    /// Create a handler, optionally seeding the mirror from a snapshot of the
    /// main-thread document.
    pub fn new(
        room: RoomId,
        replica: ReplicaId,
        initial_snapshot: Option<&[u8]>,
        update_tx: mpsc::Sender<DocUpdate>,
    ) -> Result<Self> {
        let mut mirror = Document::new(room, replica);
        if let Some(bytes) = initial_snapshot {
            mirror.merge_snapshot(bytes)?;
        }
        let (outgoing_tx, _) = broadcast::channel(256);
        Ok(Self {
            inner: Arc::new(DocInner {
                room,
                replica,
                mirror: Mutex::new(mirror),
                seen: Mutex::new(HashSet::new()),
                outgoing_tx,
                update_tx,
            }),
        })
    }

    /// Publish a locally minted op to all connected peers.
    pub async fn broadcast_op(&self, op: WireOp) -> Result<()> {
        self.inner.seen.lock().await.insert(op.stamp);
        self.inner.mirror.lock().await.apply(&op, Origin::Local)?;
        let _ = self.inner.outgoing_tx.send(DocMessage::Op(op));
        Ok(())
    }

    /// Current mirror state, for seeding a Snapshot reply out of band.
    pub async fn snapshot(&self) -> Vec<u8> {
        self.inner.mirror.lock().await.snapshot()
    }

    /// Handle incoming connection (as acceptor).
    async fn handle_peer(&self, conn: Connection) -> Result<()> {
        let (mut send, mut recv) = conn.accept_bi().await?;
        self.run_relay(&mut send, &mut recv).await
    }

    /// Run the relay loop as initiator.
    pub async fn run_doc_loop(&self, conn: Connection) -> Result<()> {
        let (mut send, mut recv) = conn.open_bi().await?;
        self.run_relay(&mut send, &mut recv).await
    }

    /// Bidirectional relay, identical for both connection directions.
    ///
    /// Reads and writes run as separate halves: the read half owns the stream
    /// end to end so a frame is never abandoned mid-read, and routes its
    /// replies to the write half over a channel.
    async fn run_relay<S, R>(&self, send: &mut S, recv: &mut R) -> Result<()>
    where
        S: AsyncWriteExt + Unpin,
        R: AsyncReadExt + Unpin,
    {
        let mut outgoing_rx = self.inner.outgoing_tx.subscribe();
        let (reply_tx, mut reply_rx) = mpsc::channel::<DocMessage>(16);

        send_doc_msg(
            send,
            &DocMessage::Hello {
                room: self.inner.room,
                replica: self.inner.replica,
            },
        )
        .await?;
        // Pull the peer's state so a (re)connect always resynchronizes.
        send_doc_msg(send, &DocMessage::SnapshotRequest).await?;

        let write_half = async {
            loop {
                tokio::select! {
                    reply = reply_rx.recv() => {
                        match reply {
                            Some(msg) => send_doc_msg(send, &msg).await?,
                            None => break,
                        }
                    }
                    result = outgoing_rx.recv() => {
                        match result {
                            Ok(msg) => send_doc_msg(send, &msg).await?,
                            Err(broadcast::error::RecvError::Closed) => break,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                // Missed ops; a snapshot covers whatever was lost.
                                warn!(missed = n, "doc broadcast lagged, sending snapshot");
                                let bytes = self.inner.mirror.lock().await.snapshot();
                                send_doc_msg(send, &DocMessage::Snapshot(bytes)).await?;
                            }
                        }
                    }
                }
            }
            Ok::<_, anyhow::Error>(())
        };

        let read_half = async {
            loop {
                let msg = match recv_doc_msg(recv).await {
                    Ok(msg) => msg,
                    Err(_) => break, // Connection closed
                };
                if !self.handle_message(&reply_tx, msg).await {
                    break;
                }
            }
            Ok::<_, anyhow::Error>(())
        };

        tokio::select! {
            result = write_half => result,
            result = read_half => result,
        }
    }

    /// Process one inbound message. Returns false to drop the connection.
    ///
    /// A semantically bad message (malformed op, wrong-room op, corrupt
    /// snapshot) is logged and skipped; one misbehaving peer message must not
    /// cost the whole connection.
    async fn handle_message(&self, reply_tx: &mpsc::Sender<DocMessage>, msg: DocMessage) -> bool {
        match msg {
            DocMessage::Hello { room, replica } => {
                if room != self.inner.room {
                    warn!(%room, %replica, "peer is in a different room, disconnecting");
                    return false;
                }
                debug!(%replica, "peer joined doc relay");
            }
            DocMessage::SnapshotRequest => {
                let bytes = self.inner.mirror.lock().await.snapshot();
                let _ = reply_tx.send(DocMessage::Snapshot(bytes)).await;
            }
            DocMessage::Snapshot(bytes) => {
                if let Err(e) = self.inner.mirror.lock().await.merge_snapshot(&bytes) {
                    warn!(error = %e, "remote snapshot rejected");
                    return true;
                }
                let _ = self.inner.update_tx.send(DocUpdate::Snapshot(bytes)).await;
            }
            DocMessage::Op(op) => {
                if !self.inner.seen.lock().await.insert(op.stamp) {
                    return true; // Already relayed this op.
                }
                if let Err(e) = self.inner.mirror.lock().await.apply(&op, Origin::Remote) {
                    warn!(error = %e, "remote op rejected");
                    return true;
                }
                let _ = self
                    .inner
                    .update_tx
                    .send(DocUpdate::Op(op.clone()))
                    .await;
                // Relay to the rest of the mesh; receivers dedup by stamp.
                let _ = self.inner.outgoing_tx.send(DocMessage::Op(op));
            }
        }
        true
    }
}

impl ProtocolHandler for DocProtocol {
    fn accept(&self, conn: Connection) -> impl Future<Output = Result<(), AcceptError>> + Send {
        let this = self.clone();
        async move {
            this.handle_peer(conn).await.map_err(|e| {
                AcceptError::from_err(std::io::Error::other(e.to_string()))
            })
        }
    }
}

/// Send a doc message (length-prefixed msgpack).
async fn send_doc_msg<W: AsyncWriteExt + Unpin>(writer: &mut W, msg: &DocMessage) -> Result<()> {
    let data = rmp_serde::to_vec(msg)?;
    let len = data.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a doc message.
async fn recv_doc_msg<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<DocMessage> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;

    Ok(rmp_serde::from_slice(&data)?)
}
