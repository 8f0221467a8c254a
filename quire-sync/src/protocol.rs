//! Binary protocol between replicas and the hub.
//!
//! Envelopes are bincode-encoded; operations inside them travel as Quill
//! JSON so formatting attributes of any JSON type survive the trip.
//!
//! ```text
//! client → server   Join { client_id, doc_id }
//!                   Submit { op, client_id, base_rev }
//!                   Leave | Ping
//!
//! server → client   Welcome { document, rev }      after Join
//!                   Ack { rev }                    own change applied
//!                   RemoteOp { op, rev }           someone else's change applied
//!                   Resync { document, rev }       own change rejected, start over
//!                   Closed { reason }              session replaced, socket closes next
//!                   Error { message } | Pong
//! ```

use quire_delta::Delta;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::payload::{ClientId, Revision, WirePayload};

/// An operation serialized as a Quill JSON delta.
pub type OperationEncoding = String;

/// Messages sent by a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// First message of a session: attach to a document.
    Join { client_id: ClientId, doc_id: Uuid },
    /// A flushed change.
    Submit(WirePayload),
    /// Graceful goodbye.
    Leave,
    Ping,
}

/// Messages sent by the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Current document right after a successful Join.
    Welcome {
        document: OperationEncoding,
        rev: Revision,
    },
    /// The receiver's in-flight change was applied as `rev`.
    Ack { rev: Revision },
    /// Another replica's change, as applied at `rev`.
    RemoteOp { op: OperationEncoding, rev: Revision },
    /// The receiver's change was rejected; replace local state with this.
    Resync {
        document: OperationEncoding,
        rev: Revision,
    },
    /// The session is over; the server closes the socket after this.
    Closed { reason: String },
    Error { message: String },
    Pong,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn welcome(document: &Delta, rev: Revision) -> Result<Self, ProtocolError> {
        Ok(Self::Welcome {
            document: encode_op(document)?,
            rev,
        })
    }

    pub fn remote_op(op: &Delta, rev: Revision) -> Result<Self, ProtocolError> {
        Ok(Self::RemoteOp {
            op: encode_op(op)?,
            rev,
        })
    }

    pub fn resync(document: &Delta, rev: Revision) -> Result<Self, ProtocolError> {
        Ok(Self::Resync {
            document: encode_op(document)?,
            rev,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Serialize any envelope with the standard bincode configuration.
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

pub fn encode_op(op: &Delta) -> Result<OperationEncoding, ProtocolError> {
    op.to_json()
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

pub fn decode_op(encoded: &str) -> Result<Delta, ProtocolError> {
    Delta::from_json(encoded).map_err(|e| ProtocolError::InvalidOperation(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("Connection closed")]
    ConnectionClosed,
}
