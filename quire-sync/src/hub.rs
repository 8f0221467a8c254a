//! The authoritative document and its revision history.
//!
//! ```text
//!   replica A ──flush──┐
//!                      ├──► enqueue ──► [ FIFO queue ] ──► drain ──► document_r
//!   replica B ──flush──┘                                    │
//!                                                           ├── deliver_ack(r)       → sender
//!                                                           └── deliver_remote(op, r) → everyone else
//! ```
//!
//! `enqueue` only appends. `drain` is the single serialization point: each
//! payload is rebased, composed, stamped with the next revision, acked and
//! fanned out before the next one is looked at. Callers that share a hub
//! between tasks run it behind one consumer (see [`crate::room::HubHandle`]).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use quire_delta::{Delta, DeltaError};
use thiserror::Error;

use crate::history::RevisionLog;
use crate::payload::{ChangePayload, ClientId, Revision};
use crate::protocol::ProtocolError;

/// How the hub reaches a registered replica.
///
/// Implementations must not block: deliveries happen inside `drain`.
pub trait ReplicaLink: Send + Sync {
    fn client_id(&self) -> &ClientId;

    /// The replica's in-flight change was applied as `rev`.
    fn deliver_ack(&self, rev: Revision);

    /// Another replica's change was applied as `rev`.
    fn deliver_remote(&self, op: &Delta, rev: Revision);

    /// The replica's change was rejected. Start over from this snapshot.
    fn deliver_resync(&self, document: &Delta, rev: Revision);

    /// A newer session registered under the same client id. Nothing more
    /// is delivered to this link and its submits are refused.
    fn deliver_closed(&self, reason: &str);
}

/// What `register` does when the client id is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// The newest session wins; the old link is returned to the caller.
    #[default]
    Replace,
    /// Refuse the new session with [`HubError::DuplicateSession`].
    Reject,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Applied ops kept for rebasing late changes
    pub history_limit: usize,
    /// Payloads that may wait for `drain`
    pub max_queue_len: usize,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            history_limit: 1024,
            max_queue_len: 10_000,
            duplicate_policy: DuplicatePolicy::Replace,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub processed_rev: Revision,
    pub document_len: usize,
    pub queue_len: usize,
    pub clients: usize,
    pub history_len: usize,
    pub applied: u64,
    pub rejected: u64,
    pub unknown_acks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("Failed to decode payload: {0}")]
    Decode(#[from] ProtocolError),
    #[error("Malformed operation: {0}")]
    Malformed(#[from] DeltaError),
    #[error("Incoming queue is full ({limit} payloads)")]
    QueueFull { limit: usize },
    #[error("Client {0} is already registered")]
    DuplicateSession(ClientId),
    #[error("Session for client {0} is no longer registered")]
    StaleSession(ClientId),
    #[error("Base revision {base} is older than the retained history (oldest {oldest})")]
    StaleBase { base: Revision, oldest: Revision },
    #[error("Base revision {base} is ahead of the hub (head {head})")]
    BaseAhead { base: Revision, head: Revision },
    #[error("Operation spans {got} characters but the document has {expected}")]
    LengthMismatch { expected: usize, got: usize },
    #[error("Hub has shut down")]
    HubClosed,
}

/// A payload that made it into the document.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    pub client_id: ClientId,
    pub rev: Revision,
    /// The op as applied, after rebasing.
    pub op: Delta,
}

/// A payload that was dropped during `drain`.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedChange {
    pub client_id: ClientId,
    pub base_rev: Revision,
    pub error: HubError,
}

/// Outcome of one `drain` call, in queue order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub applied: Vec<AppliedChange>,
    pub rejected: Vec<RejectedChange>,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty() && self.rejected.is_empty()
    }
}

/// A queued payload and the session that submitted it, if known.
struct Queued {
    payload: ChangePayload,
    origin: Option<Arc<dyn ReplicaLink>>,
}

/// The single authority for one document.
pub struct ServerHub {
    config: HubConfig,
    processed_rev: Revision,
    incoming_queue: VecDeque<Queued>,
    document: Delta,
    registry: HashMap<ClientId, Arc<dyn ReplicaLink>>,
    history: RevisionLog,
    applied: u64,
    rejected: u64,
    unknown_acks: u64,
}

impl ServerHub {
    /// An empty document at revision 0.
    pub fn new(config: HubConfig) -> Self {
        Self::with_document(config, Delta::new(), 0)
    }

    /// Resume from a known document state.
    pub fn with_document(config: HubConfig, document: Delta, rev: Revision) -> Self {
        let history = RevisionLog::starting_at(rev, config.history_limit);
        Self {
            config,
            processed_rev: rev,
            incoming_queue: VecDeque::new(),
            document,
            registry: HashMap::new(),
            history,
            applied: 0,
            rejected: 0,
            unknown_acks: 0,
        }
    }

    // ---------------------------------------------------------------
    // Registry
    // ---------------------------------------------------------------

    /// Make a replica reachable for acks and fan-out.
    ///
    /// Under [`DuplicatePolicy::Replace`] returns the link that was displaced,
    /// after telling it through [`ReplicaLink::deliver_closed`].
    pub fn register(
        &mut self,
        link: Arc<dyn ReplicaLink>,
    ) -> Result<Option<Arc<dyn ReplicaLink>>, HubError> {
        let id = link.client_id().clone();
        if self.registry.contains_key(&id) {
            match self.config.duplicate_policy {
                DuplicatePolicy::Reject => {
                    log::warn!("Rejected duplicate session for client {id}");
                    return Err(HubError::DuplicateSession(id));
                }
                DuplicatePolicy::Replace => {
                    log::info!("Client {id} re-registered, replacing previous session");
                }
            }
        } else {
            log::info!("Client {id} registered at rev {}", self.processed_rev);
        }
        let displaced = self.registry.insert(id, link);
        if let Some(old) = &displaced {
            old.deliver_closed("Replaced by a newer session");
        }
        Ok(displaced)
    }

    /// Forget a replica. Unknown ids are ignored.
    pub fn unregister(&mut self, id: &ClientId) -> Option<Arc<dyn ReplicaLink>> {
        let removed = self.registry.remove(id);
        if removed.is_some() {
            log::info!("Client {id} unregistered");
        }
        removed
    }

    /// Forget a replica only if `link` is still the registered session for
    /// its id. A session replaced by a newer one cannot remove its successor.
    pub fn unregister_link(&mut self, link: &Arc<dyn ReplicaLink>) -> bool {
        let is_current = self.is_current(link);
        if is_current {
            self.unregister(link.client_id());
        }
        is_current
    }

    /// True if `link` itself is the registered session for its client id.
    pub fn is_current(&self, link: &Arc<dyn ReplicaLink>) -> bool {
        self.registry
            .get(link.client_id())
            .is_some_and(|current| Arc::ptr_eq(current, link))
    }

    pub fn is_registered(&self, id: &ClientId) -> bool {
        self.registry.contains_key(id)
    }

    // ---------------------------------------------------------------
    // Queue
    // ---------------------------------------------------------------

    /// Queue a change for the next `drain`. Nothing changes on error.
    ///
    /// The ack goes to whichever session is registered under the payload's
    /// client id right now.
    pub fn enqueue(&mut self, payload: ChangePayload) -> Result<(), HubError> {
        let origin = self.registry.get(&payload.client_id).cloned();
        self.push_queued(payload, origin)
    }

    /// Queue a change on behalf of a specific session.
    ///
    /// Refused with [`HubError::StaleSession`] unless `link` is the current
    /// registration. The payload is stamped with the link's client id.
    pub fn enqueue_from(
        &mut self,
        link: &Arc<dyn ReplicaLink>,
        mut payload: ChangePayload,
    ) -> Result<(), HubError> {
        if !self.is_current(link) {
            return Err(HubError::StaleSession(link.client_id().clone()));
        }
        payload.client_id = link.client_id().clone();
        self.push_queued(payload, Some(link.clone()))
    }

    fn push_queued(
        &mut self,
        payload: ChangePayload,
        origin: Option<Arc<dyn ReplicaLink>>,
    ) -> Result<(), HubError> {
        if self.incoming_queue.len() >= self.config.max_queue_len {
            return Err(HubError::QueueFull {
                limit: self.config.max_queue_len,
            });
        }
        payload.op.validate()?;
        log::debug!(
            "Queued change from {} at base {} ({} ops)",
            payload.client_id,
            payload.base_rev,
            payload.op.ops().len()
        );
        self.incoming_queue.push_back(Queued { payload, origin });
        Ok(())
    }

    /// Decode a wire payload and queue it.
    pub fn enqueue_encoded(&mut self, bytes: &[u8]) -> Result<(), HubError> {
        let payload = ChangePayload::decode(bytes)?;
        self.enqueue(payload)
    }

    /// Apply every queued payload in arrival order.
    pub fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();
        while let Some(Queued { payload, origin }) = self.incoming_queue.pop_front() {
            match self.rebase(&payload) {
                Ok(op) => report.applied.push(self.apply(payload.client_id, origin, op)),
                Err(error) => {
                    self.rejected += 1;
                    log::warn!(
                        "Rejected change from {} at base {}: {error}",
                        payload.client_id,
                        payload.base_rev
                    );
                    if let Some(origin) = &origin {
                        origin.deliver_resync(&self.document, self.processed_rev);
                    }
                    report.rejected.push(RejectedChange {
                        client_id: payload.client_id,
                        base_rev: payload.base_rev,
                        error,
                    });
                }
            }
        }
        report
    }

    /// Express a payload against the current document.
    fn rebase(&self, payload: &ChangePayload) -> Result<Delta, HubError> {
        if payload.base_rev > self.processed_rev {
            return Err(HubError::BaseAhead {
                base: payload.base_rev,
                head: self.processed_rev,
            });
        }
        let concurrent = self.history.since(payload.base_rev).ok_or(HubError::StaleBase {
            base: payload.base_rev,
            oldest: self.history.oldest_base(),
        })?;
        let op = concurrent.fold(payload.op.clone(), |op, applied| applied.transform(&op, true));

        let document_len = self.document.length();
        if op.base_len() > document_len {
            return Err(HubError::LengthMismatch {
                expected: document_len,
                got: op.base_len(),
            });
        }
        Ok(op)
    }

    fn apply(
        &mut self,
        client_id: ClientId,
        origin: Option<Arc<dyn ReplicaLink>>,
        op: Delta,
    ) -> AppliedChange {
        self.document = self.document.compose(&op);
        self.processed_rev += 1;
        self.history.push(op.clone());
        self.applied += 1;
        let rev = self.processed_rev;

        match &origin {
            Some(link) => link.deliver_ack(rev),
            None => {
                self.unknown_acks += 1;
                log::warn!("Applied rev {rev} for unregistered client {client_id}, ack dropped");
            }
        }
        // Keyed by session, not id: a successor under the same id still
        // sees its predecessor's change as remote.
        for link in self.registry.values() {
            if !origin.as_ref().is_some_and(|o| Arc::ptr_eq(o, link)) {
                link.deliver_remote(&op, rev);
            }
        }

        log::debug!("Applied rev {rev} from {client_id}");
        AppliedChange { client_id, rev, op }
    }

    /// Send the current snapshot to `link`. False if it is not the current
    /// registration for its client id.
    pub fn resync_link(&self, link: &Arc<dyn ReplicaLink>) -> bool {
        if !self.is_current(link) {
            return false;
        }
        link.deliver_resync(&self.document, self.processed_rev);
        true
    }

    // ---------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------

    /// Document and the revision it reflects.
    pub fn snapshot(&self) -> (Delta, Revision) {
        (self.document.clone(), self.processed_rev)
    }

    pub fn document(&self) -> &Delta {
        &self.document
    }

    pub fn processed_rev(&self) -> Revision {
        self.processed_rev
    }

    pub fn queue_len(&self) -> usize {
        self.incoming_queue.len()
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            processed_rev: self.processed_rev,
            document_len: self.document.length(),
            queue_len: self.incoming_queue.len(),
            clients: self.registry.len(),
            history_len: self.history.len(),
            applied: self.applied,
            rejected: self.rejected,
            unknown_acks: self.unknown_acks,
        }
    }
}
