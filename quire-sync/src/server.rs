//! WebSocket sync server with one hub per document.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                  ┌─► Ack        → A
//!             ├── session ── Submit ─► HubHandle ┤
//! Client B ──┘      ▲                  (doc_id)  └─► RemoteOp   → B
//!                   │                                    │
//!                   └──────── ChannelLink (mpsc) ◄───────┘
//! ```
//!
//! Each connection must open with `Join`. The session registers a
//! [`ChannelLink`] with the document's hub, answers `Welcome` with the
//! snapshot, then forwards submits to the hub and hub deliveries back to
//! the socket until the client leaves or a newer session for the same
//! client id replaces it.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use quire_delta::Delta;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::hub::{HubConfig, HubError, ReplicaLink};
use crate::payload::{ChangePayload, ClientId, Revision};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::room::{HubHandle, RoomManager};

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type SessionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Configuration for every document hub
    pub hub: HubConfig,
    /// Drop a document once its last client leaves
    pub evict_empty_rooms: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            hub: HubConfig::default(),
            evict_empty_rooms: false,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_messages: u64,
    pub active_rooms: usize,
}

/// Hub deliveries for one remote session, queued for its socket writer.
pub struct ChannelLink {
    client_id: ClientId,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ChannelLink {
    pub fn new(client_id: ClientId, tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { client_id, tx }
    }

    fn forward(&self, message: Result<ServerMessage, crate::protocol::ProtocolError>) {
        match message {
            Ok(message) => {
                if self.tx.send(message).is_err() {
                    log::debug!("Session for {} already closed", self.client_id);
                }
            }
            Err(e) => log::error!("Failed to encode delivery for {}: {e}", self.client_id),
        }
    }
}

impl ReplicaLink for ChannelLink {
    fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    fn deliver_ack(&self, rev: Revision) {
        self.forward(Ok(ServerMessage::Ack { rev }));
    }

    fn deliver_remote(&self, op: &Delta, rev: Revision) {
        self.forward(ServerMessage::remote_op(op, rev));
    }

    fn deliver_resync(&self, document: &Delta, rev: Revision) {
        self.forward(ServerMessage::resync(document, rev));
    }

    fn deliver_closed(&self, reason: &str) {
        self.forward(Ok(ServerMessage::Closed {
            reason: reason.to_string(),
        }));
    }
}

/// A joined connection.
struct Session {
    client_id: ClientId,
    doc_id: Uuid,
    room: HubHandle,
    link: Arc<dyn ReplicaLink>,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    room_manager: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let room_manager = Arc::new(RoomManager::new(config.hub.clone()));
        Self {
            config,
            room_manager,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let room_manager = self.room_manager.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, room_manager, stats, config).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        room_manager: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> SessionResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let mut session: Option<Session> = None;

        let result: SessionResult = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }

                                let message = match ClientMessage::decode(&bytes) {
                                    Ok(message) => message,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        stats.write().await.rejected_messages += 1;
                                        send(&mut ws_sender, &ServerMessage::error(e.to_string())).await?;
                                        continue;
                                    }
                                };

                                match message {
                                    ClientMessage::Join { client_id, doc_id } => {
                                        if session.is_some() {
                                            send(&mut ws_sender, &ServerMessage::error("Already joined")).await?;
                                            continue;
                                        }
                                        let link: Arc<dyn ReplicaLink> =
                                            Arc::new(ChannelLink::new(client_id.clone(), out_tx.clone()));
                                        match room_manager.join(doc_id, link.clone()).await {
                                            Ok((room, document, rev)) => {
                                                send(&mut ws_sender, &ServerMessage::welcome(&document, rev)?).await?;
                                                log::info!("Client {client_id} joined doc {doc_id} at rev {rev}");
                                                session = Some(Session { client_id, doc_id, room, link });
                                                stats.write().await.active_rooms = room_manager.room_count().await;
                                            }
                                            Err(e) => {
                                                log::warn!("Client {client_id} could not join doc {doc_id}: {e}");
                                                send(&mut ws_sender, &ServerMessage::error(e.to_string())).await?;
                                                break;
                                            }
                                        }
                                    }

                                    ClientMessage::Submit(wire) => {
                                        let Some(s) = &session else {
                                            send(&mut ws_sender, &ServerMessage::error("Join before submitting")).await?;
                                            continue;
                                        };
                                        // The hub stamps the payload with the session's client id.
                                        let submitted = match ChangePayload::from_wire(wire) {
                                            Ok(payload) => s.room.submit_from(s.link.clone(), payload).await,
                                            Err(e) => Err(HubError::from(e)),
                                        };
                                        match submitted {
                                            Ok(()) => {}
                                            Err(e @ HubError::StaleSession(_)) => {
                                                log::info!("Dropping replaced session for {} at {addr}", s.client_id);
                                                stats.write().await.rejected_messages += 1;
                                                send(&mut ws_sender, &ServerMessage::Closed { reason: e.to_string() }).await?;
                                                break;
                                            }
                                            Err(e) => {
                                                log::warn!("Rejected submit from {}: {e}", s.client_id);
                                                stats.write().await.rejected_messages += 1;
                                                send(&mut ws_sender, &ServerMessage::error(e.to_string())).await?;
                                                // The client is waiting for an ack that will never come.
                                                s.room.resync(s.link.clone()).await?;
                                            }
                                        }
                                    }

                                    ClientMessage::Leave => {
                                        log::debug!("Client at {addr} left");
                                        break;
                                    }

                                    ClientMessage::Ping => {
                                        send(&mut ws_sender, &ServerMessage::Pong).await?;
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    Some(delivery) = out_rx.recv() => {
                        let closing = matches!(delivery, ServerMessage::Closed { .. });
                        send(&mut ws_sender, &delivery).await?;
                        if closing {
                            log::info!("Session from {addr} was replaced, closing");
                            break;
                        }
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        // Cleanup runs even when the socket failed mid-session.
        let _ = ws_sender.close().await;
        if let Some(s) = session {
            if let Err(e) = s.room.unregister(s.link).await {
                log::warn!("Failed to unregister {} from doc {}: {e}", s.client_id, s.doc_id);
            }
            if config.evict_empty_rooms {
                room_manager.remove_if_empty(&s.doc_id).await;
            }
        }
        let room_count = room_manager.room_count().await;
        let mut st = stats.write().await;
        st.active_connections -= 1;
        st.active_rooms = room_count;

        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get room manager reference.
    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }
}

async fn send(ws_sender: &mut WsSender, message: &ServerMessage) -> SessionResult {
    let encoded = message.encode()?;
    ws_sender.send(Message::Binary(encoded.into())).await?;
    Ok(())
}
