//! Edit primitives: insert, retain, delete.
//!
//! Wire shape follows the Quill delta JSON format:
//! ```text
//! { "insert": "Hello", "attributes": { "bold": true } }
//! { "retain": 5 }
//! { "delete": 3 }
//! ```

use serde::{Deserialize, Serialize};

use crate::attributes::AttributeMap;
use crate::DeltaError;

/// Primitive kind, used by the iterator to peek without cloning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Retain,
    Delete,
}

/// A single edit primitive.
///
/// Lengths are counted in Unicode scalar values, not bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawOp", into = "RawOp")]
pub enum Op {
    Insert { text: String, attributes: AttributeMap },
    Retain { count: usize, attributes: AttributeMap },
    Delete { count: usize },
}

impl Op {
    pub fn insert(text: impl Into<String>) -> Self {
        Op::Insert {
            text: text.into(),
            attributes: AttributeMap::new(),
        }
    }

    pub fn retain(count: usize) -> Self {
        Op::Retain {
            count,
            attributes: AttributeMap::new(),
        }
    }

    pub fn delete(count: usize) -> Self {
        Op::Delete { count }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Op::Insert { .. } => OpKind::Insert,
            Op::Retain { .. } => OpKind::Retain,
            Op::Delete { .. } => OpKind::Delete,
        }
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        match self {
            Op::Insert { text, .. } => text.chars().count(),
            Op::Retain { count, .. } | Op::Delete { count } => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attributes of an insert or retain. Deletes carry none.
    pub fn attributes(&self) -> Option<&AttributeMap> {
        match self {
            Op::Insert { attributes, .. } | Op::Retain { attributes, .. } => Some(attributes),
            Op::Delete { .. } => None,
        }
    }

    /// True for a retain without formatting changes.
    pub fn is_plain_retain(&self) -> bool {
        matches!(self, Op::Retain { attributes, .. } if attributes.is_empty())
    }

    /// Structural well-formedness of a single primitive.
    pub fn validate(&self) -> Result<(), DeltaError> {
        match self {
            Op::Insert { text, .. } if text.is_empty() => Err(DeltaError::EmptyInsert),
            Op::Retain { count: 0, .. } => Err(DeltaError::ZeroLength("retain")),
            Op::Delete { count: 0 } => Err(DeltaError::ZeroLength("delete")),
            _ => Ok(()),
        }
    }
}

/// Slice `len` characters of `text` starting at character `start`.
pub(crate) fn slice_chars(text: &str, start: usize, len: usize) -> String {
    text.chars().skip(start).take(len).collect()
}

/// Flat JSON form of an [`Op`]. Exactly one of the three keys must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawOp {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    insert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retain: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delete: Option<usize>,
    #[serde(default, skip_serializing_if = "AttributeMap::is_empty")]
    attributes: AttributeMap,
}

impl TryFrom<RawOp> for Op {
    type Error = DeltaError;

    fn try_from(raw: RawOp) -> Result<Self, Self::Error> {
        let op = match (raw.insert, raw.retain, raw.delete) {
            (Some(text), None, None) => Op::Insert {
                text,
                attributes: raw.attributes,
            },
            (None, Some(count), None) => Op::Retain {
                count,
                attributes: raw.attributes,
            },
            (None, None, Some(count)) => {
                if !raw.attributes.is_empty() {
                    return Err(DeltaError::Decode("delete cannot carry attributes".into()));
                }
                Op::Delete { count }
            }
            _ => {
                return Err(DeltaError::Decode(
                    "op must set exactly one of insert, retain, delete".into(),
                ))
            }
        };
        op.validate()?;
        Ok(op)
    }
}

impl From<Op> for RawOp {
    fn from(op: Op) -> Self {
        match op {
            Op::Insert { text, attributes } => RawOp {
                insert: Some(text),
                retain: None,
                delete: None,
                attributes,
            },
            Op::Retain { count, attributes } => RawOp {
                insert: None,
                retain: Some(count),
                delete: None,
                attributes,
            },
            Op::Delete { count } => RawOp {
                insert: None,
                retain: None,
                delete: Some(count),
                attributes: AttributeMap::new(),
            },
        }
    }
}
