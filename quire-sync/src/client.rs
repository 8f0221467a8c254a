//! WebSocket sync client around a [`SharedReplica`].
//!
//! Provides:
//! - Join handshake (the `Welcome` snapshot seeds the replica)
//! - Local edits with automatic flush, one change in flight at a time
//! - Background reader that applies acks, remote ops and resyncs
//!
//! Edits made while disconnected stay pending in the replica. On connect
//! they go out if the server is still at the revision they were made
//! against; otherwise the replica resyncs and a `Resynced` event reports
//! what was dropped.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use quire_delta::Delta;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::payload::{ClientId, Revision};
use crate::protocol::{self, ClientMessage, ProtocolError, ServerMessage};
use crate::replica::{ClientReplica, SharedReplica};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Joined the document at `rev`
    Connected { rev: Revision },
    /// Connection lost
    Disconnected,
    /// Our change was applied as `rev`
    Acked { rev: Revision },
    /// Another client's change was applied as `rev`
    RemoteApplied { rev: Revision },
    /// The server rejected our change; local state was replaced
    Resynced { rev: Revision, discarded: Delta },
    /// The server reported an error
    ServerError(String),
    /// The server ended this session, e.g. a newer one took our client id
    Closed { reason: String },
    /// Reply to [`SyncClient::send_ping`]
    Pong,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Server refused to join: {0}")]
    Rejected(String),
    #[error("Not connected")]
    NotConnected,
}

/// The sync client.
pub struct SyncClient {
    client_id: ClientId,
    doc_id: Uuid,
    server_url: String,

    replica: SharedReplica,
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
}

impl SyncClient {
    pub fn new(client_id: impl Into<ClientId>, doc_id: Uuid, server_url: impl Into<String>) -> Self {
        let client_id = client_id.into();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            replica: SharedReplica::new(ClientReplica::new(client_id.clone())),
            client_id,
            doc_id,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, join the document and start the background tasks.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;
        match self.handshake().await {
            Ok((rev, discarded)) => {
                *self.state.write().await = ConnectionState::Connected;
                let _ = self.event_tx.send(SyncEvent::Connected { rev });
                if !discarded.is_empty() {
                    let _ = self.event_tx.send(SyncEvent::Resynced { rev, discarded });
                }
                log::info!("Client {} joined doc {} at rev {rev}", self.client_id, self.doc_id);
                self.flush().await?;
                Ok(())
            }
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn handshake(&mut self) -> Result<(Revision, Delta), ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.server_url)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let join = ClientMessage::Join {
            client_id: self.client_id.clone(),
            doc_id: self.doc_id,
        };
        ws_writer
            .send(Message::Binary(join.encode()?.into()))
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let welcome = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        return Some(ServerMessage::decode(&bytes));
                    }
                    Ok(Message::Close(_)) | Err(_) => return None,
                    _ => {}
                }
            }
            None
        })
        .await
        .map_err(|_| ClientError::Connect("Timed out waiting for welcome".to_string()))?;

        let (rev, discarded) = match welcome {
            Some(Ok(ServerMessage::Welcome { document, rev })) => {
                let document = protocol::decode_op(&document)?;
                let discarded = self.replica.lock().on_reconnect(document, rev);
                (rev, discarded)
            }
            Some(Ok(ServerMessage::Error { message })) => return Err(ClientError::Rejected(message)),
            Some(Ok(other)) => {
                return Err(ProtocolError::UnexpectedMessage(format!("{other:?}")).into());
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ProtocolError::ConnectionClosed.into()),
        };

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx.clone());
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: apply server messages to the replica
        let replica = self.replica.clone();
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerMessage::decode(&bytes) {
                            Ok(message) => {
                                if let Some(event) = Self::apply(&replica, &out_tx, message).await {
                                    let _ = event_tx.send(event);
                                }
                            }
                            Err(e) => log::warn!("Failed to decode server message: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected);
        });

        Ok((rev, discarded))
    }

    /// Apply one server message. Acks release the flow-control gate, so
    /// whatever was buffered meanwhile goes out right away.
    async fn apply(
        replica: &SharedReplica,
        out_tx: &mpsc::Sender<Vec<u8>>,
        message: ServerMessage,
    ) -> Option<SyncEvent> {
        match message {
            ServerMessage::Ack { rev } => {
                let next = {
                    let mut replica = replica.lock();
                    replica.on_ack(rev);
                    replica.flush()
                };
                if let Some(payload) = next {
                    match payload.to_wire().and_then(|wire| ClientMessage::Submit(wire).encode()) {
                        Ok(encoded) => {
                            let _ = out_tx.send(encoded).await;
                        }
                        Err(e) => log::error!("Failed to encode change: {e}"),
                    }
                }
                Some(SyncEvent::Acked { rev })
            }
            ServerMessage::RemoteOp { op, rev } => match protocol::decode_op(&op) {
                Ok(op) => {
                    replica.lock().on_remote_applied(&op, rev);
                    Some(SyncEvent::RemoteApplied { rev })
                }
                Err(e) => {
                    log::error!("Dropped undecodable remote op at rev {rev}: {e}");
                    Some(SyncEvent::ServerError(e.to_string()))
                }
            },
            ServerMessage::Resync { document, rev } => match protocol::decode_op(&document) {
                Ok(document) => {
                    let discarded = replica.lock().on_resync(document, rev);
                    Some(SyncEvent::Resynced { rev, discarded })
                }
                Err(e) => Some(SyncEvent::ServerError(e.to_string())),
            },
            ServerMessage::Error { message } => {
                log::warn!("Server error: {message}");
                Some(SyncEvent::ServerError(message))
            }
            ServerMessage::Closed { reason } => {
                log::warn!("Session closed by server: {reason}");
                Some(SyncEvent::Closed { reason })
            }
            ServerMessage::Pong => Some(SyncEvent::Pong),
            ServerMessage::Welcome { .. } => None,
        }
    }

    /// Record a local edit and send it if nothing is in flight.
    pub async fn apply_local(&self, op: &Delta) -> Result<bool, ClientError> {
        self.replica.apply_local(op);
        self.flush().await
    }

    /// Send buffered edits. Returns false when nothing was sent: offline,
    /// waiting for an ack, or nothing pending.
    pub async fn flush(&self) -> Result<bool, ClientError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(false);
        }
        let Some(tx) = &self.outgoing_tx else {
            return Ok(false);
        };
        let Some(payload) = self.replica.flush() else {
            return Ok(false);
        };
        let encoded = ClientMessage::Submit(payload.to_wire()?).encode()?;
        tx.send(encoded).await.map_err(|_| ClientError::NotConnected)?;
        Ok(true)
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(ClientMessage::Ping.encode()?)
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Leave the document and close the connection.
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(ClientMessage::Leave.encode()?).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// The document as this client sees it.
    pub fn document(&self) -> Delta {
        self.replica.local_document()
    }

    pub fn last_synced_rev(&self) -> Revision {
        self.replica.last_synced_rev()
    }

    pub fn replica(&self) -> &SharedReplica {
        &self.replica
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
