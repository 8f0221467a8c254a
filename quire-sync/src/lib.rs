//! # quire-sync: optimistic OT synchronization
//!
//! One authoritative document per hub, any number of replicas editing
//! optimistically against it.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   ChangePayload   ┌───────────────┐
//! │ ClientReplica │ ────────────────► │   ServerHub   │
//! │ pending/sent  │ ◄──────────────── │ queue, history│
//! └───────────────┘  ack / remote op  └───────┬───────┘
//!                                             │ one per document
//!                                     ┌───────┴───────┐
//!                                     │   HubHandle   │ ◄── RoomManager
//!                                     │ (single task) │
//!                                     └───────────────┘
//! ```
//!
//! Every replica has at most one change in flight. The hub applies changes
//! strictly in arrival order, rebasing each over whatever was applied since
//! the revision it was made against, then acks the sender and fans the
//! applied op out to everyone else.
//!
//! ```
//! use std::sync::Arc;
//! use quire_delta::Delta;
//! use quire_sync::{ClientReplica, HubConfig, ServerHub, SharedReplica};
//!
//! let mut hub = ServerHub::new(HubConfig::default());
//! let alice = SharedReplica::new(ClientReplica::new("alice"));
//! let bob = SharedReplica::new(ClientReplica::new("bob"));
//! hub.register(Arc::new(alice.clone())).unwrap();
//! hub.register(Arc::new(bob.clone())).unwrap();
//!
//! alice.apply_local(&Delta::new().insert("Hello"));
//! hub.enqueue(alice.flush().unwrap()).unwrap();
//! hub.drain();
//!
//! assert_eq!(hub.document().text(), "Hello");
//! assert_eq!(bob.local_document().text(), "Hello");
//! ```
//!
//! ## Modules
//!
//! - [`payload`]: [`ChangePayload`], the unit of submission
//! - [`replica`]: [`ClientReplica`] and its flow control
//! - [`hub`]: [`ServerHub`], the serialization point
//! - [`history`]: bounded revision log used for rebasing
//! - [`protocol`]: bincode wire messages
//! - [`room`]: hub task per document and the room map
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client

pub mod client;
pub mod history;
pub mod hub;
pub mod payload;
pub mod protocol;
pub mod replica;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use client::{ClientError, ConnectionState, SyncClient, SyncEvent};
pub use history::RevisionLog;
pub use hub::{
    AppliedChange, DrainReport, DuplicatePolicy, HubConfig, HubError, HubStats, RejectedChange,
    ReplicaLink, ServerHub,
};
pub use payload::{ChangePayload, ClientId, Revision, WirePayload};
pub use protocol::{ClientMessage, OperationEncoding, ProtocolError, ServerMessage};
pub use replica::{ClientReplica, ReplicaState, SharedReplica};
pub use room::{HubHandle, RoomManager};
pub use server::{ChannelLink, ServerConfig, ServerStats, SyncServer};
