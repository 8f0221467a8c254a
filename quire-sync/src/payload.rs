//! The change envelope a client hands to the hub on flush.

use std::fmt;

use quire_delta::Delta;
use serde::{Deserialize, Serialize};

use crate::protocol::{self, OperationEncoding, ProtocolError};

/// Server revision: the number of changes the hub has applied.
pub type Revision = u64;

/// Session identity of a replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One client's unsent edits, stamped with the revision they were made against.
///
/// Created by [`ClientReplica::flush`](crate::ClientReplica::flush), consumed
/// once by [`ServerHub::drain`](crate::ServerHub::drain).
#[derive(Debug, Clone, PartialEq)]
pub struct ChangePayload {
    pub op: Delta,
    pub client_id: ClientId,
    pub base_rev: Revision,
}

/// Wire form of a [`ChangePayload`]. The operation travels as Quill JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePayload {
    pub op: OperationEncoding,
    pub client_id: ClientId,
    pub base_rev: Revision,
}

impl ChangePayload {
    pub fn new(op: Delta, client_id: impl Into<ClientId>, base_rev: Revision) -> Self {
        Self {
            op,
            client_id: client_id.into(),
            base_rev,
        }
    }

    pub fn to_wire(&self) -> Result<WirePayload, ProtocolError> {
        Ok(WirePayload {
            op: protocol::encode_op(&self.op)?,
            client_id: self.client_id.clone(),
            base_rev: self.base_rev,
        })
    }

    pub fn from_wire(wire: WirePayload) -> Result<Self, ProtocolError> {
        Ok(Self {
            op: protocol::decode_op(&wire.op)?,
            client_id: wire.client_id,
            base_rev: wire.base_rev,
        })
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        protocol::encode(&self.to_wire()?)
    }

    /// Deserialize from the binary wire format.
    ///
    /// Fails on a broken envelope and on an operation that is not a valid
    /// Quill delta.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_wire(protocol::decode(bytes)?)
    }
}
