//! One hub task per document, and the map from document ids to hubs.
//!
//! ```text
//!   session ──┐                      ┌──────────── hub task ────────────┐
//!   session ──┼── HubCommand (mpsc) ─►  recv ─► handle ─► try_recv... ─► drain
//!   session ──┘                      └──────────────────────────────────┘
//! ```
//!
//! Any number of sessions send commands; a single task owns the
//! [`ServerHub`] and is the only caller of `drain`. Commands that observe
//! or change membership drain first so they see every earlier submit.

use std::collections::HashMap;
use std::sync::Arc;

use quire_delta::Delta;
use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

use crate::hub::{HubConfig, HubError, HubStats, ReplicaLink, ServerHub};
use crate::payload::{ChangePayload, Revision};

enum HubCommand {
    Register {
        link: Arc<dyn ReplicaLink>,
        reply: oneshot::Sender<Result<(Delta, Revision), HubError>>,
    },
    Unregister {
        link: Arc<dyn ReplicaLink>,
        reply: oneshot::Sender<bool>,
    },
    Submit {
        origin: Option<Arc<dyn ReplicaLink>>,
        payload: ChangePayload,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Resync {
        link: Arc<dyn ReplicaLink>,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<(Delta, Revision)>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// Cloneable handle to a running hub task.
///
/// The task stops once every handle is dropped.
#[derive(Clone)]
pub struct HubHandle {
    doc_id: Uuid,
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    /// Spawn a hub task for an empty document. Requires a tokio runtime.
    pub fn spawn(doc_id: Uuid, config: HubConfig) -> Self {
        Self::spawn_with(doc_id, ServerHub::new(config))
    }

    /// Spawn a task that takes ownership of an existing hub.
    pub fn spawn_with(doc_id: Uuid, hub: ServerHub) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run(doc_id, hub, rx));
        Self { doc_id, tx }
    }

    async fn run(doc_id: Uuid, mut hub: ServerHub, mut rx: mpsc::UnboundedReceiver<HubCommand>) {
        log::debug!("Hub for doc {doc_id} started");
        while let Some(command) = rx.recv().await {
            Self::handle(&mut hub, command);
            // Batch whatever else is already waiting, then apply it in one pass.
            while let Ok(command) = rx.try_recv() {
                Self::handle(&mut hub, command);
            }
            let report = hub.drain();
            if !report.is_empty() {
                log::debug!(
                    "Doc {doc_id}: applied {}, rejected {}, now at rev {}",
                    report.applied.len(),
                    report.rejected.len(),
                    hub.processed_rev()
                );
            }
        }
        log::debug!("Hub for doc {doc_id} stopped at rev {}", hub.processed_rev());
    }

    fn handle(hub: &mut ServerHub, command: HubCommand) {
        match command {
            HubCommand::Submit {
                origin,
                payload,
                reply,
            } => {
                let result = match origin {
                    Some(link) => hub.enqueue_from(&link, payload),
                    None => hub.enqueue(payload),
                };
                let _ = reply.send(result);
            }
            HubCommand::Register { link, reply } => {
                hub.drain();
                let result = hub.register(link).map(|_| hub.snapshot());
                let _ = reply.send(result);
            }
            HubCommand::Unregister { link, reply } => {
                hub.drain();
                let _ = reply.send(hub.unregister_link(&link));
            }
            HubCommand::Resync { link, reply } => {
                hub.drain();
                let _ = reply.send(hub.resync_link(&link));
            }
            HubCommand::Snapshot { reply } => {
                hub.drain();
                let _ = reply.send(hub.snapshot());
            }
            HubCommand::Stats { reply } => {
                hub.drain();
                let _ = reply.send(hub.stats());
            }
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, HubError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .map_err(|_| HubError::HubClosed)?;
        response.await.map_err(|_| HubError::HubClosed)
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Register a replica and return the snapshot it starts from.
    ///
    /// Every change applied after the snapshot is delivered to `link`.
    pub async fn register(&self, link: Arc<dyn ReplicaLink>) -> Result<(Delta, Revision), HubError> {
        self.request(|reply| HubCommand::Register { link, reply }).await?
    }

    /// Remove `link` unless a newer session has taken its client id.
    pub async fn unregister(&self, link: Arc<dyn ReplicaLink>) -> Result<bool, HubError> {
        self.request(|reply| HubCommand::Unregister { link, reply }).await
    }

    /// Queue a change. Applied on the task's next drain.
    pub async fn submit(&self, payload: ChangePayload) -> Result<(), HubError> {
        self.request(|reply| HubCommand::Submit {
            origin: None,
            payload,
            reply,
        })
        .await?
    }

    /// Queue a change from a registered session. Refused once a newer
    /// session has taken the client id.
    pub async fn submit_from(
        &self,
        link: Arc<dyn ReplicaLink>,
        payload: ChangePayload,
    ) -> Result<(), HubError> {
        self.request(|reply| HubCommand::Submit {
            origin: Some(link),
            payload,
            reply,
        })
        .await?
    }

    /// Send the current snapshot to `link` if it is still registered.
    pub async fn resync(&self, link: Arc<dyn ReplicaLink>) -> Result<bool, HubError> {
        self.request(|reply| HubCommand::Resync { link, reply }).await
    }

    pub async fn snapshot(&self) -> Result<(Delta, Revision), HubError> {
        self.request(|reply| HubCommand::Snapshot { reply }).await
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.request(|reply| HubCommand::Stats { reply }).await
    }
}

/// Room manager: maps document IDs to hub tasks.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<Uuid, HubHandle>>>,
    config: HubConfig,
}

impl RoomManager {
    pub fn new(config: HubConfig) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Get or create the hub for the given document.
    pub async fn get_or_create(&self, doc_id: Uuid) -> HubHandle {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&doc_id) {
            return room.clone();
        }

        log::info!("Opened room for doc {doc_id}");
        let room = HubHandle::spawn(doc_id, self.config.clone());
        rooms.insert(doc_id, room.clone());
        room
    }

    /// Register `link` with the document's hub, creating the room if needed.
    ///
    /// The room lock is held until registration completes, so a concurrent
    /// `remove_if_empty` cannot close the room under a joining client.
    pub async fn join(
        &self,
        doc_id: Uuid,
        link: Arc<dyn ReplicaLink>,
    ) -> Result<(HubHandle, Delta, Revision), HubError> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id) {
                let (document, rev) = room.register(link).await?;
                return Ok((room.clone(), document, rev));
            }
        }

        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(&doc_id) {
            Some(room) => room.clone(),
            None => {
                log::info!("Opened room for doc {doc_id}");
                let room = HubHandle::spawn(doc_id, self.config.clone());
                rooms.insert(doc_id, room.clone());
                room
            }
        };
        let (document, rev) = room.register(link).await?;
        Ok((room, document, rev))
    }

    /// Remove a room with no registered clients. Its document is discarded.
    pub async fn remove_if_empty(&self, doc_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            let empty = match room.stats().await {
                Ok(stats) => stats.clients == 0 && stats.queue_len == 0,
                Err(_) => true,
            };
            if empty {
                rooms.remove(doc_id);
                log::info!("Closed empty room for doc {doc_id}");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
