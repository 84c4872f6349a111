//! P2P synchronization over iroh.
//!
//! Two protocols ride the same endpoint: the document relay (ops plus
//! snapshot resync) and the presence channel (ephemeral cursors). The async
//! side runs on its own thread with a current-thread runtime; the main thread
//! talks to it over std mpsc channels and stays free of async.

pub mod presence_protocol;
pub mod protocol;

use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use iroh::discovery::{dns::DnsDiscovery, pkarr::PkarrPublisher};
use iroh::Endpoint;
use iroh_base::EndpointAddr;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{info, warn};

use crate::document::{ReplicaId, RoomId, WireOp};
use crate::presence::{PresenceMessage, UserId};
use presence_protocol::PresenceProtocol;
use protocol::{DocProtocol, DocUpdate};

const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Configuration for sync behavior.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub room: RoomId,
    pub replica: ReplicaId,
    /// Presence identity of the local user, so leave broadcasts carry the
    /// same id peers saw in our join.
    pub user: UserId,
    pub mode: SyncMode,
    /// Snapshot of the main-thread document taken at startup, used to seed
    /// the relay mirror so early snapshot requests see hydrated state.
    pub initial_snapshot: Option<Vec<u8>>,
}

/// Sync operation mode.
#[derive(Debug, Clone)]
pub enum SyncMode {
    /// No networking, standalone editing.
    Disabled,
    /// Accept connections, optionally joining a peer by ticket.
    Active { join_ticket: Option<String> },
}

/// Events from the sync thread to the main thread.
#[derive(Debug)]
pub enum SyncEvent {
    /// Endpoint is up; the ticket is ours to share.
    Ready { ticket: String },
    /// Remote op, already relayed onward, ready to merge locally.
    RemoteOp(WireOp),
    /// Remote snapshot to merge, from connect or resync.
    RemoteSnapshot(Vec<u8>),
    /// Presence update from a remote peer.
    Presence(PresenceMessage),
    /// Joined-peer connection went up or down.
    PeerStatus { connected: bool },
    /// Error occurred.
    Error(String),
}

/// Commands from the main thread to the sync thread.
#[derive(Debug)]
pub enum SyncCommand {
    /// Publish a locally minted op.
    BroadcastOp(WireOp),
    /// Broadcast local presence to all peers.
    BroadcastPresence(PresenceMessage),
    /// Shutdown sync.
    Shutdown,
}

/// Handle for communicating with the sync thread from the main thread.
pub struct SyncHandle {
    pub command_tx: std_mpsc::Sender<SyncCommand>,
    pub event_rx: std_mpsc::Receiver<SyncEvent>,
    /// Our shareable ticket, once the endpoint is bound.
    pub ticket: Option<String>,
    _thread: JoinHandle<()>,
}

impl SyncHandle {
    /// Non-blocking check for sync events.
    pub fn poll_event(&self) -> Option<SyncEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Send a command to the sync thread.
    pub fn send_command(&self, cmd: SyncCommand) -> Result<()> {
        self.command_tx.send(cmd)?;
        Ok(())
    }
}

/// Start the sync thread with the given configuration.
pub fn start_sync_thread(config: SyncConfig) -> Result<SyncHandle> {
    let (event_tx, event_rx) = std_mpsc::channel();
    let (command_tx, command_rx) = std_mpsc::channel();

    // Channel to get the ticket back from the async context.
    let (ticket_tx, ticket_rx) = std_mpsc::channel();

    let thread = thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("Failed to create tokio runtime");

        rt.block_on(async move {
            if let Err(e) = run_sync(config, event_tx.clone(), command_rx, ticket_tx).await {
                let _ = event_tx.send(SyncEvent::Error(e.to_string()));
            }
        });
    });

    let ticket = ticket_rx.recv_timeout(Duration::from_secs(10)).ok();

    Ok(SyncHandle {
        command_tx,
        event_rx,
        ticket,
        _thread: thread,
    })
}

/// Encode an EndpointAddr as a shareable ticket string.
pub fn encode_ticket(addr: &EndpointAddr) -> String {
    let bytes = postcard::to_stdvec(addr).expect("EndpointAddr serialization should not fail");
    format!("canvasync1{}", data_encoding::BASE32_NOPAD.encode(&bytes))
}

/// Decode a ticket string back to an EndpointAddr.
pub fn decode_ticket(ticket: &str) -> Result<EndpointAddr> {
    if let Some(data) = ticket.strip_prefix("canvasync1") {
        let bytes = data_encoding::BASE32_NOPAD
            .decode(data.as_bytes())
            .map_err(|e| anyhow::anyhow!("Invalid ticket encoding: {}", e))?;
        let addr: EndpointAddr = postcard::from_bytes(&bytes)
            .map_err(|e| anyhow::anyhow!("Invalid ticket data: {}", e))?;
        Ok(addr)
    } else {
        // Bare endpoint id, relay and direct addresses discovered via DNS.
        let id: iroh_base::PublicKey = ticket
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid endpoint ID: {}", e))?;
        Ok(EndpointAddr::new(id))
    }
}

/// Main async sync loop.
async fn run_sync(
    config: SyncConfig,
    event_tx: std_mpsc::Sender<SyncEvent>,
    command_rx: std_mpsc::Receiver<SyncCommand>,
    ticket_tx: std_mpsc::Sender<String>,
) -> Result<()> {
    let endpoint = Endpoint::builder()
        .discovery(DnsDiscovery::n0_dns())
        .discovery(PkarrPublisher::n0_dns())
        .bind()
        .await?;

    let addr = endpoint.addr();
    let ticket_string = encode_ticket(&addr);
    let _ = ticket_tx.send(ticket_string.clone());

    let (doc_tx, mut doc_rx) = tokio_mpsc::channel(256);
    let doc_protocol = DocProtocol::new(
        config.room,
        config.replica,
        config.initial_snapshot.as_deref(),
        doc_tx,
    )?;

    let (presence_tx, mut presence_rx) = tokio_mpsc::channel(64);
    let presence_protocol = PresenceProtocol::new(config.user, presence_tx);

    let router = iroh::protocol::Router::builder(endpoint.clone())
        .accept(DocProtocol::ALPN, doc_protocol.clone())
        .accept(PresenceProtocol::ALPN, presence_protocol.clone())
        .spawn();

    let _ = event_tx.send(SyncEvent::Ready {
        ticket: ticket_string.clone(),
    });

    match config.mode {
        SyncMode::Active { join_ticket } => {
            // Joiner side: keep a connection to the ticketed peer alive,
            // reconnecting with backoff. Each reconnect re-runs the snapshot
            // exchange, which is what catches us up on missed ops.
            let join_task = join_ticket.map(|remote_ticket| {
                let endpoint = endpoint.clone();
                let doc = doc_protocol.clone();
                let presence = presence_protocol.clone();
                let status_tx = event_tx.clone();
                tokio::spawn(async move {
                    let mut backoff = RECONNECT_INITIAL_BACKOFF;
                    loop {
                        match connect_peer(&endpoint, &remote_ticket, &doc, &presence, &status_tx)
                            .await
                        {
                            Ok(()) => {
                                // Connection was up and then dropped.
                                backoff = RECONNECT_INITIAL_BACKOFF;
                            }
                            Err(e) => {
                                warn!(error = %e, "peer connection failed");
                            }
                        }
                        let _ = status_tx.send(SyncEvent::PeerStatus { connected: false });
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
                    }
                })
            });

            loop {
                tokio::select! {
                    Some(update) = doc_rx.recv() => {
                        let event = match update {
                            DocUpdate::Op(op) => SyncEvent::RemoteOp(op),
                            DocUpdate::Snapshot(bytes) => SyncEvent::RemoteSnapshot(bytes),
                        };
                        let _ = event_tx.send(event);
                    }
                    Some(msg) = presence_rx.recv() => {
                        let _ = event_tx.send(SyncEvent::Presence(msg));
                    }
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {
                        match command_rx.try_recv() {
                            Ok(SyncCommand::BroadcastOp(op)) => {
                                if let Err(e) = doc_protocol.broadcast_op(op).await {
                                    let _ = event_tx.send(SyncEvent::Error(e.to_string()));
                                }
                            }
                            Ok(SyncCommand::BroadcastPresence(msg)) => {
                                presence_protocol.broadcast(msg);
                            }
                            Ok(SyncCommand::Shutdown) => {
                                presence_protocol.broadcast_leave();
                                if let Some(h) = &join_task {
                                    h.abort();
                                }
                                break;
                            }
                            Err(std_mpsc::TryRecvError::Empty) => {}
                            Err(std_mpsc::TryRecvError::Disconnected) => {
                                if let Some(h) = &join_task {
                                    h.abort();
                                }
                                break;
                            }
                        }
                    }
                }
            }
        }
        SyncMode::Disabled => {
            // No networking; only wait for shutdown.
            loop {
                if let Ok(SyncCommand::Shutdown) = command_rx.recv() {
                    break;
                }
            }
        }
    }

    router.shutdown().await?;
    Ok(())
}

/// Dial a ticketed peer on both protocols and run until either loop ends.
async fn connect_peer(
    endpoint: &Endpoint,
    remote_ticket: &str,
    doc: &DocProtocol,
    presence: &PresenceProtocol,
    status_tx: &std_mpsc::Sender<SyncEvent>,
) -> Result<()> {
    let addr = decode_ticket(remote_ticket)?;

    let doc_conn = endpoint.connect(addr.clone(), DocProtocol::ALPN).await?;
    let presence_conn = endpoint.connect(addr, PresenceProtocol::ALPN).await?;
    info!("connected to peer");
    let _ = status_tx.send(SyncEvent::PeerStatus { connected: true });

    let presence_clone = presence.clone();
    let presence_task = tokio::spawn(async move {
        if let Err(e) = presence_clone.run_presence_loop(presence_conn).await {
            warn!(error = %e, "presence loop ended");
        }
    });

    // The doc relay is the liveness signal; when it ends the whole
    // connection is considered down.
    let result = doc.run_doc_loop(doc_conn).await;
    presence_task.abort();
    result
}
