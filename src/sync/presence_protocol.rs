//! Lightweight presence protocol for remote cursor broadcast.
//!
//! Uses ALPN "canvasync/presence/1" over iroh connections, separate from the
//! document relay: presence is ephemeral and high-frequency, and a dropped
//! cursor update must never delay a document op.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::presence::{PresenceMessage, UserId};

/// Protocol identifier for presence sync.
pub const PRESENCE_ALPN: &[u8] = b"canvasync/presence/1";

/// Presence protocol handler for iroh.
#[derive(Clone)]
pub struct PresenceProtocol {
    inner: Arc<PresenceInner>,
}

impl std::fmt::Debug for PresenceProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceProtocol").finish()
    }
}

struct PresenceInner {
    local_user: UserId,
    /// Our join announcement, replayed to peers that ask via RequestAll.
    announce: RwLock<Option<PresenceMessage>>,
    /// Fan-out to every live connection.
    outgoing_tx: broadcast::Sender<PresenceMessage>,
    /// Channel to the sync loop for incoming presence.
    incoming_tx: mpsc::Sender<PresenceMessage>,
}

impl PresenceProtocol {
    /// Protocol identifier.
    pub const ALPN: &'static [u8] = PRESENCE_ALPN;

    pub fn new(local_user: UserId, incoming_tx: mpsc::Sender<PresenceMessage>) -> Self {
        let (outgoing_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(PresenceInner {
                local_user,
                announce: RwLock::new(None),
                outgoing_tx,
                incoming_tx,
            }),
        }
    }

    pub fn local_user(&self) -> UserId {
        self.inner.local_user
    }

    /// Broadcast a presence message to all connected peers. Join messages are
    /// also remembered as our announcement.
    pub fn broadcast(&self, msg: PresenceMessage) {
        if matches!(msg, PresenceMessage::Join { .. }) {
            if let Ok(mut guard) = self.inner.announce.try_write() {
                *guard = Some(msg.clone());
            }
        }
        let _ = self.inner.outgoing_tx.send(msg);
    }

    /// Notify peers we are leaving.
    pub fn broadcast_leave(&self) {
        let _ = self.inner.outgoing_tx.send(PresenceMessage::Leave {
            user: self.inner.local_user,
        });
    }

    /// Handle incoming connection (as acceptor).
    async fn handle_peer(&self, conn: Connection) -> Result<()> {
        let (mut send, mut recv) = conn.accept_bi().await?;
        self.run_presence_sync(&mut send, &mut recv).await
    }

    /// Run the presence loop as initiator.
    pub async fn run_presence_loop(&self, conn: Connection) -> Result<()> {
        let (mut send, mut recv) = conn.open_bi().await?;
        self.run_presence_sync(&mut send, &mut recv).await
    }

    /// Reads and writes run as separate halves so a frame read is never
    /// abandoned partway; the read half routes announce replies to the write
    /// half over a channel.
    async fn run_presence_sync<S, R>(&self, send: &mut S, recv: &mut R) -> Result<()>
    where
        S: AsyncWriteExt + Unpin,
        R: AsyncReadExt + Unpin,
    {
        let mut outgoing_rx = self.inner.outgoing_tx.subscribe();
        let (reply_tx, mut reply_rx) = mpsc::channel::<PresenceMessage>(16);

        // Ask the peer to announce itself, and announce ourselves unprompted.
        send_presence_msg(send, &PresenceMessage::RequestAll).await?;
        if let Some(announce) = self.inner.announce.read().await.as_ref() {
            send_presence_msg(send, announce).await?;
        }

        let write_half = async {
            loop {
                tokio::select! {
                    reply = reply_rx.recv() => {
                        match reply {
                            Some(msg) => send_presence_msg(send, &msg).await?,
                            None => break,
                        }
                    }
                    result = outgoing_rx.recv() => {
                        match result {
                            Ok(msg) => {
                                send_presence_msg(send, &msg).await?;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                            Err(broadcast::error::RecvError::Lagged(_)) => {
                                // Dropped some updates; presence is lossy, just
                                // re-announce so the peer still knows who we are.
                                if let Some(announce) = self.inner.announce.read().await.as_ref() {
                                    send_presence_msg(send, announce).await?;
                                }
                            }
                        }
                    }
                }
            }
            Ok::<_, anyhow::Error>(())
        };

        let read_half = async {
            loop {
                let msg = match recv_presence_msg(recv).await {
                    Ok(msg) => msg,
                    Err(_) => break, // Connection closed
                };
                if matches!(msg, PresenceMessage::RequestAll) {
                    if let Some(announce) = self.inner.announce.read().await.as_ref() {
                        let _ = reply_tx.send(announce.clone()).await;
                    }
                    continue;
                }
                let _ = self.inner.incoming_tx.send(msg).await;
            }
            Ok::<_, anyhow::Error>(())
        };

        tokio::select! {
            result = write_half => result,
            result = read_half => result,
        }
    }
}

impl ProtocolHandler for PresenceProtocol {
    fn accept(&self, conn: Connection) -> impl Future<Output = Result<(), AcceptError>> + Send {
        let this = self.clone();
        async move {
            this.handle_peer(conn).await.map_err(|e| {
                AcceptError::from_err(std::io::Error::other(e.to_string()))
            })
        }
    }
}

/// Send a presence message (length-prefixed msgpack).
async fn send_presence_msg<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg: &PresenceMessage,
) -> Result<()> {
    let data = rmp_serde::to_vec(msg)?;
    let len = data.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a presence message.
async fn recv_presence_msg<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<PresenceMessage> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;

    Ok(rmp_serde::from_slice(&data)?)
}
