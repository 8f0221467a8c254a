//! Client-side replica: optimistic local edits with one change in flight.
//!
//! ```text
//!            apply_local                 flush                 on_ack
//!   edit ──────────────► pending_op ─────────────► sent_op ─────────────► (cleared)
//!                            ▲                        ▲
//!                            └──── on_remote_applied ─┘  both rebased over the remote op
//! ```
//!
//! A replica is `Idle` until it flushes, then `InFlight` until the hub
//! acknowledges. Flushing while in flight is a no-op; the caller retries
//! after the ack arrives.

use std::sync::{Arc, Mutex, MutexGuard};

use quire_delta::Delta;

use crate::hub::ReplicaLink;
use crate::payload::{ChangePayload, ClientId, Revision};

/// Flow-control state of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Nothing outstanding at the hub.
    Idle,
    /// A flushed change awaits its ack.
    InFlight,
}

/// One client's view of a shared document.
#[derive(Debug, Clone)]
pub struct ClientReplica {
    id: ClientId,
    last_synced_rev: Revision,
    pending_op: Delta,
    sent_op: Delta,
    /// Tracked separately from `sent_op`: a remote delete can empty the
    /// sent op while its payload is still queued at the hub.
    in_flight: bool,
    local_document: Delta,
}

impl ClientReplica {
    /// A fresh replica of an empty document at revision 0.
    pub fn new(id: impl Into<ClientId>) -> Self {
        Self::with_document(id, Delta::new(), 0)
    }

    /// A replica seeded from a server snapshot.
    pub fn with_document(id: impl Into<ClientId>, document: Delta, rev: Revision) -> Self {
        Self {
            id: id.into(),
            last_synced_rev: rev,
            pending_op: Delta::new(),
            sent_op: Delta::new(),
            in_flight: false,
            local_document: document,
        }
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn last_synced_rev(&self) -> Revision {
        self.last_synced_rev
    }

    pub fn pending_op(&self) -> &Delta {
        &self.pending_op
    }

    pub fn sent_op(&self) -> &Delta {
        &self.sent_op
    }

    /// The document as this replica sees it, own unacknowledged edits included.
    pub fn local_document(&self) -> &Delta {
        &self.local_document
    }

    pub fn state(&self) -> ReplicaState {
        if self.in_flight {
            ReplicaState::InFlight
        } else {
            ReplicaState::Idle
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Number of primitives waiting to be flushed.
    pub fn pending_len(&self) -> usize {
        self.pending_op.ops().len()
    }

    /// Number of primitives in the in-flight change.
    pub fn sent_len(&self) -> usize {
        self.sent_op.ops().len()
    }

    /// Record a local edit, expressed against [`local_document`](Self::local_document).
    pub fn apply_local(&mut self, op: &Delta) {
        self.pending_op = self.pending_op.compose(op);
        self.local_document = self.local_document.compose(op);
    }

    /// Hand the buffered edits to the caller for submission.
    ///
    /// Returns `None` while a change is in flight or when there is nothing
    /// to send. Neither case changes any state.
    pub fn flush(&mut self) -> Option<ChangePayload> {
        if self.in_flight || self.pending_op.is_empty() {
            return None;
        }

        let op = std::mem::take(&mut self.pending_op);
        self.sent_op = self.sent_op.compose(&op);
        self.in_flight = true;

        log::debug!(
            "Replica {} flushing {} ops at rev {}",
            self.id,
            op.ops().len(),
            self.last_synced_rev
        );
        Some(ChangePayload::new(op, self.id.clone(), self.last_synced_rev))
    }

    /// The hub applied our in-flight change as revision `rev`.
    ///
    /// Idempotent: a duplicate ack changes nothing and never moves the
    /// revision backwards.
    pub fn on_ack(&mut self, rev: Revision) {
        self.last_synced_rev = self.last_synced_rev.max(rev);
        self.sent_op = Delta::new();
        self.in_flight = false;
    }

    /// Merge a change another replica made, applied by the hub as `rev`.
    ///
    /// The remote op is rebased over our in-flight and pending edits, and
    /// those are rebased over it, so the next flush is expressed against the
    /// post-`rev` document.
    pub fn on_remote_applied(&mut self, op: &Delta, rev: Revision) {
        // Hub ordering: the remote op was applied before our in-flight change.
        let sent = op.transform(&self.sent_op, true);
        let remote = self.sent_op.transform(op, false);

        let pending = remote.transform(&self.pending_op, true);
        let remote = self.pending_op.transform(&remote, false);

        self.sent_op = sent;
        self.pending_op = pending;
        self.local_document = self.local_document.compose(&remote);
        self.last_synced_rev = rev;
    }

    /// Adopt the hub's snapshot on (re)connect.
    ///
    /// If the hub is still at the revision our unsynced edits were made
    /// against and they reproduce our document on top of its snapshot, they
    /// are kept as pending for the next flush. Otherwise this is a full
    /// [`on_resync`](Self::on_resync). Returns the discarded edits.
    pub fn on_reconnect(&mut self, document: Delta, rev: Revision) -> Delta {
        let unsynced = self.sent_op.compose(&self.pending_op);
        if rev == self.last_synced_rev && document.compose(&unsynced) == self.local_document {
            log::debug!(
                "Replica {} reconnected at rev {rev} with {} unsynced ops kept",
                self.id,
                unsynced.ops().len()
            );
            self.sent_op = Delta::new();
            self.pending_op = unsynced;
            self.in_flight = false;
            return Delta::new();
        }
        self.on_resync(document, rev)
    }

    /// Replace local state with the hub's snapshot.
    ///
    /// Used when the hub rejects our change. Returns the edits that were
    /// discarded (in-flight composed with pending).
    pub fn on_resync(&mut self, document: Delta, rev: Revision) -> Delta {
        let sent = std::mem::take(&mut self.sent_op);
        let pending = std::mem::take(&mut self.pending_op);
        let discarded = sent.compose(&pending);
        if !discarded.is_empty() {
            log::warn!(
                "Replica {} resynced to rev {rev}, dropping {} unsynced ops",
                self.id,
                discarded.ops().len()
            );
        }

        self.local_document = document;
        self.last_synced_rev = rev;
        self.in_flight = false;
        discarded
    }
}

/// A replica shared between an editor and a delivery path.
///
/// The mutex is the per-replica serialization point: local edits, flushes
/// and hub deliveries never interleave on one replica.
#[derive(Debug, Clone)]
pub struct SharedReplica {
    id: ClientId,
    inner: Arc<Mutex<ClientReplica>>,
}

impl SharedReplica {
    pub fn new(replica: ClientReplica) -> Self {
        Self {
            id: replica.id().clone(),
            inner: Arc::new(Mutex::new(replica)),
        }
    }

    /// Lock the replica. A panicked holder leaves the replica usable.
    pub fn lock(&self) -> MutexGuard<'_, ClientReplica> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn apply_local(&self, op: &Delta) {
        self.lock().apply_local(op);
    }

    pub fn flush(&self) -> Option<ChangePayload> {
        self.lock().flush()
    }

    pub fn state(&self) -> ReplicaState {
        self.lock().state()
    }

    pub fn last_synced_rev(&self) -> Revision {
        self.lock().last_synced_rev()
    }

    /// Clone of the current local document.
    pub fn local_document(&self) -> Delta {
        self.lock().local_document().clone()
    }
}

impl ReplicaLink for SharedReplica {
    fn client_id(&self) -> &ClientId {
        &self.id
    }

    fn deliver_ack(&self, rev: Revision) {
        self.lock().on_ack(rev);
    }

    fn deliver_remote(&self, op: &Delta, rev: Revision) {
        self.lock().on_remote_applied(op, rev);
    }

    fn deliver_resync(&self, document: &Delta, rev: Revision) {
        self.lock().on_resync(document.clone(), rev);
    }

    fn deliver_closed(&self, reason: &str) {
        log::warn!("Replica {} closed by hub: {reason}", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_replica_is_idle() {
        let replica = ClientReplica::new("alice");
        assert_eq!(replica.state(), ReplicaState::Idle);
        assert_eq!(replica.last_synced_rev(), 0);
        assert!(replica.local_document().is_empty());
        assert_eq!(replica.pending_len(), 0);
    }

    #[test]
    fn test_apply_local_updates_document() {
        let mut replica = ClientReplica::new("alice");
        replica.apply_local(&Delta::new().insert("Hello"));
        replica.apply_local(&Delta::new().retain(5).insert(" World"));

        assert_eq!(replica.local_document().text(), "Hello World");
        assert_eq!(replica.pending_op(), &Delta::new().insert("Hello World"));
    }

    #[test]
    fn test_flush_gate() {
        let mut replica = ClientReplica::new("alice");
        assert!(replica.flush().is_none(), "Nothing to send");

        replica.apply_local(&Delta::new().insert("a"));
        let payload = replica.flush().unwrap();
        assert_eq!(payload.base_rev, 0);
        assert_eq!(payload.client_id.as_str(), "alice");
        assert!(replica.is_in_flight());
        assert_eq!(replica.sent_op(), &Delta::new().insert("a"));
        assert!(replica.pending_op().is_empty());

        replica.apply_local(&Delta::new().retain(1).insert("b"));
        let before = replica.clone();
        assert!(replica.flush().is_none(), "Second flush must wait for ack");
        assert_eq!(replica.pending_op(), before.pending_op());
        assert_eq!(replica.sent_op(), before.sent_op());
    }

    #[test]
    fn test_ack_releases_gate() {
        let mut replica = ClientReplica::new("alice");
        replica.apply_local(&Delta::new().insert("a"));
        replica.flush().unwrap();
        replica.apply_local(&Delta::new().retain(1).insert("b"));

        replica.on_ack(1);
        assert_eq!(replica.state(), ReplicaState::Idle);
        assert!(replica.sent_op().is_empty());

        let next = replica.flush().unwrap();
        assert_eq!(next.base_rev, 1);
        assert_eq!(next.op, Delta::new().retain(1).insert("b"));
    }

    #[test]
    fn test_ack_is_idempotent() {
        let mut replica = ClientReplica::new("alice");
        replica.apply_local(&Delta::new().insert("a"));
        replica.flush().unwrap();

        replica.on_ack(3);
        replica.on_ack(3);
        assert_eq!(replica.last_synced_rev(), 3);
        replica.on_ack(2);
        assert_eq!(replica.last_synced_rev(), 3, "Stale ack must not rewind");
        assert!(replica.sent_op().is_empty());
    }

    #[test]
    fn test_remote_applied_rebases_pending() {
        let mut replica = ClientReplica::with_document("bob", Delta::new().insert("Hello"), 1);
        replica.apply_local(&Delta::new().retain(5).insert("!"));

        replica.on_remote_applied(&Delta::new().retain(5).insert(" World"), 2);

        assert_eq!(replica.last_synced_rev(), 2);
        assert_eq!(replica.pending_op(), &Delta::new().retain(11).insert("!"));
        assert_eq!(replica.local_document().text(), "Hello World!");
    }

    #[test]
    fn test_remote_applied_rebases_in_flight() {
        let mut replica = ClientReplica::with_document("bob", Delta::new().insert("abc"), 0);
        replica.apply_local(&Delta::new().retain(3).insert("X"));
        replica.flush().unwrap();
        replica.apply_local(&Delta::new().retain(4).insert("Y"));

        // Someone deleted "a" before our change reached the hub.
        replica.on_remote_applied(&Delta::new().delete(1), 1);

        assert_eq!(replica.sent_op(), &Delta::new().retain(2).insert("X"));
        assert_eq!(replica.pending_op(), &Delta::new().retain(3).insert("Y"));
        assert_eq!(replica.local_document().text(), "bcXY");
        assert!(replica.is_in_flight());
    }

    #[test]
    fn test_in_flight_survives_emptied_sent_op() {
        let mut replica = ClientReplica::with_document("bob", Delta::new().insert("abc"), 0);
        replica.apply_local(&Delta::new().retain(1).delete(1));
        replica.flush().unwrap();

        // The same character was deleted remotely; our delete became a no-op.
        replica.on_remote_applied(&Delta::new().retain(1).delete(1), 1);
        assert!(replica.sent_op().is_empty());
        assert!(replica.is_in_flight());

        replica.apply_local(&Delta::new().insert("z"));
        assert!(replica.flush().is_none());
        replica.on_ack(2);
        assert!(replica.flush().is_some());
    }

    #[test]
    fn test_resync_discards_unsynced_edits() {
        let mut replica = ClientReplica::new("alice");
        replica.apply_local(&Delta::new().insert("a"));
        replica.flush().unwrap();
        replica.apply_local(&Delta::new().retain(1).insert("b"));

        let discarded = replica.on_resync(Delta::new().insert("server"), 4);
        assert_eq!(discarded, Delta::new().insert("ab"));
        assert_eq!(replica.local_document().text(), "server");
        assert_eq!(replica.last_synced_rev(), 4);
        assert_eq!(replica.state(), ReplicaState::Idle);
        assert!(replica.flush().is_none());
    }

    #[test]
    fn test_reconnect_keeps_edits_made_at_same_revision() {
        let mut replica = ClientReplica::new("alice");
        replica.apply_local(&Delta::new().insert("offline"));
        replica.flush().unwrap();
        replica.apply_local(&Delta::new().retain(7).insert(" draft"));

        let discarded = replica.on_reconnect(Delta::new(), 0);
        assert!(discarded.is_empty());
        assert_eq!(replica.state(), ReplicaState::Idle);
        assert_eq!(replica.local_document().text(), "offline draft");

        let payload = replica.flush().unwrap();
        assert_eq!(payload.base_rev, 0);
        assert_eq!(payload.op, Delta::new().insert("offline draft"));
    }

    #[test]
    fn test_reconnect_resyncs_when_hub_moved_on() {
        let mut replica = ClientReplica::new("alice");
        replica.apply_local(&Delta::new().insert("draft"));

        let discarded = replica.on_reconnect(Delta::new().insert("other"), 3);
        assert_eq!(discarded, Delta::new().insert("draft"));
        assert_eq!(replica.local_document().text(), "other");
        assert_eq!(replica.last_synced_rev(), 3);
        assert!(replica.flush().is_none());
    }

    #[test]
    fn test_reconnect_resyncs_on_foreign_document() {
        // Same revision number, different content: the room was recreated.
        let mut replica = ClientReplica::with_document("alice", Delta::new().insert("abc"), 2);
        replica.apply_local(&Delta::new().retain(3).insert("!"));

        let discarded = replica.on_reconnect(Delta::new().insert("xyz"), 2);
        assert_eq!(discarded, Delta::new().retain(3).insert("!"));
        assert_eq!(replica.local_document().text(), "xyz");
    }

    #[test]
    fn test_shared_replica_link() {
        let shared = SharedReplica::new(ClientReplica::new("carol"));
        shared.apply_local(&Delta::new().insert("hi"));
        assert!(shared.flush().is_some());
        assert_eq!(shared.state(), ReplicaState::InFlight);

        shared.deliver_ack(1);
        assert_eq!(shared.state(), ReplicaState::Idle);
        assert_eq!(shared.last_synced_rev(), 1);

        shared.deliver_remote(&Delta::new().retain(2).insert("!"), 2);
        assert_eq!(shared.local_document().text(), "hi!");
        assert_eq!(shared.client_id().as_str(), "carol");
    }
}
