//! # quire-delta: rich-text operation engine
//!
//! Value-type edit operations over text: sequences of insert / retain /
//! delete primitives that can be concatenated, composed and transformed.
//! This is the algebra the Quire sync protocol is built on.
//!
//! ```
//! use quire_delta::Delta;
//!
//! let doc = Delta::new().insert("Hello");
//! let alice = Delta::new().retain(5).insert(" World");
//! let bob = Delta::new().retain(5).insert("!");
//!
//! // Bob's edit rewritten to apply after Alice's (Alice went first).
//! let bob_after_alice = alice.transform(&bob, true);
//! let merged = doc.compose(&alice).compose(&bob_after_alice);
//! assert_eq!(merged.text(), "Hello World!");
//! ```
//!
//! ## Modules
//!
//! - [`delta`]: [`Delta`] and its algebra
//! - [`op`]: the [`Op`] primitive and its JSON form
//! - [`iter`]: [`OpIterator`], splits primitives at arbitrary lengths
//! - [`attributes`]: formatting attribute composition

use thiserror::Error;

pub mod attributes;
pub mod delta;
pub mod iter;
pub mod op;

pub use attributes::AttributeMap;
pub use delta::Delta;
pub use iter::OpIterator;
pub use op::{Op, OpKind};

/// Errors from decoding or validating operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeltaError {
    #[error("Invalid delta encoding: {0}")]
    Decode(String),
    #[error("Failed to encode delta: {0}")]
    Encode(String),
    #[error("Zero-length {0}")]
    ZeroLength(&'static str),
    #[error("Empty insert")]
    EmptyInsert,
}
