//! Rich-text delta: an ordered, normalized sequence of edit primitives.
//!
//! A delta made only of inserts is a document. Any other delta is a change
//! that applies to a document of [`Delta::base_len`] characters, with an
//! implicit retain of whatever follows.
//!
//! ```text
//!   document  "Hello"            [insert "Hello"]
//!   change    append " World"    [retain 5, insert " World"]
//!   compose   →                  [insert "Hello World"]
//! ```

use std::cmp::min;

use serde::{Deserialize, Serialize};

use crate::attributes::{self, AttributeMap};
use crate::iter::OpIterator;
use crate::op::{Op, OpKind};
use crate::DeltaError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDelta")]
pub struct Delta {
    ops: Vec<Op>,
}

#[derive(Deserialize)]
struct RawDelta {
    #[serde(default)]
    ops: Vec<Op>,
}

impl TryFrom<RawDelta> for Delta {
    type Error = DeltaError;

    /// Decoded primitives are validated one by one (see [`Op`]'s decoder)
    /// and then re-pushed so the result is normalized.
    fn try_from(raw: RawDelta) -> Result<Self, Self::Error> {
        let mut delta = Delta::with_capacity(raw.ops.len());
        for op in raw.ops {
            delta.push(op);
        }
        Ok(delta)
    }
}

impl FromIterator<Op> for Delta {
    fn from_iter<I: IntoIterator<Item = Op>>(iter: I) -> Self {
        let mut delta = Delta::new();
        for op in iter {
            delta.push(op);
        }
        delta
    }
}

impl Delta {
    /// The empty delta: no change, or the empty document.
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ops: Vec::with_capacity(capacity),
        }
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    // -------------------------------------------------------------
    // Builders
    // -------------------------------------------------------------

    pub fn insert(self, text: impl Into<String>) -> Self {
        self.insert_with(text, AttributeMap::new())
    }

    pub fn insert_with(mut self, text: impl Into<String>, attributes: AttributeMap) -> Self {
        let text = text.into();
        if !text.is_empty() {
            self.push(Op::Insert { text, attributes });
        }
        self
    }

    pub fn retain(self, count: usize) -> Self {
        self.retain_with(count, AttributeMap::new())
    }

    pub fn retain_with(mut self, count: usize, attributes: AttributeMap) -> Self {
        if count > 0 {
            self.push(Op::Retain { count, attributes });
        }
        self
    }

    pub fn delete(mut self, count: usize) -> Self {
        if count > 0 {
            self.push(Op::Delete { count });
        }
        self
    }

    /// Append one primitive, merging it into the tail where possible.
    ///
    /// Keeps the normal form: adjacent primitives of the same kind and
    /// attributes are merged, an insert never follows a delete, and inserts
    /// carry no `null` attribute values.
    pub fn push(&mut self, mut op: Op) -> &mut Self {
        if op.is_empty() {
            return self;
        }
        if let Op::Insert { attributes, .. } = &mut op {
            attributes.retain(|_, value| !value.is_null());
        }
        let mut index = self.ops.len();
        if let Some(last) = self.ops.last_mut() {
            if let (Op::Delete { count }, Op::Delete { count: more }) = (&mut *last, &op) {
                *count += more;
                return self;
            }
            if matches!(last, Op::Delete { .. }) && matches!(op, Op::Insert { .. }) {
                index -= 1;
            }
        }
        if index > 0 {
            match (&mut self.ops[index - 1], &op) {
                (
                    Op::Insert { text, attributes },
                    Op::Insert {
                        text: more,
                        attributes: more_attributes,
                    },
                ) if attributes == more_attributes => {
                    text.push_str(more);
                    return self;
                }
                (
                    Op::Retain { count, attributes },
                    Op::Retain {
                        count: more,
                        attributes: more_attributes,
                    },
                ) if attributes == more_attributes => {
                    *count += more;
                    return self;
                }
                _ => {}
            }
        }
        if index == self.ops.len() {
            self.ops.push(op);
        } else {
            self.ops.insert(index, op);
        }
        self
    }

    /// Drop a trailing plain retain; it is implied.
    pub fn chop(mut self) -> Self {
        if self.ops.last().is_some_and(Op::is_plain_retain) {
            self.ops.pop();
        }
        self
    }

    // -------------------------------------------------------------
    // Lengths
    // -------------------------------------------------------------

    /// Total length of all primitives.
    pub fn length(&self) -> usize {
        self.ops.iter().map(Op::len).sum()
    }

    /// Characters the delta consumes from the document it applies to.
    pub fn base_len(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| op.kind() != OpKind::Insert)
            .map(Op::len)
            .sum()
    }

    /// Characters the consumed range turns into.
    pub fn target_len(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| op.kind() != OpKind::Delete)
            .map(Op::len)
            .sum()
    }

    /// True when every primitive is an insert.
    pub fn is_document(&self) -> bool {
        self.ops.iter().all(|op| op.kind() == OpKind::Insert)
    }

    /// Plain text of a document delta. Retains and deletes contribute nothing.
    pub fn text(&self) -> String {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Insert { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Structural check for deltas built outside the builders.
    pub fn validate(&self) -> Result<(), DeltaError> {
        self.ops.iter().try_for_each(Op::validate)
    }

    // -------------------------------------------------------------
    // Algebra
    // -------------------------------------------------------------

    /// `self` followed by `other`, primitive by primitive.
    ///
    /// No conflict resolution: the two are simply sequenced, merging only at
    /// the seam.
    pub fn concat(&self, other: &Delta) -> Delta {
        let mut delta = self.clone();
        if let Some((first, rest)) = other.ops.split_first() {
            delta.push(first.clone());
            delta.ops.extend_from_slice(rest);
        }
        delta
    }

    /// Net effect of applying `self` and then `other`.
    pub fn compose(&self, other: &Delta) -> Delta {
        let mut this_iter = OpIterator::new(&self.ops);
        let mut other_iter = OpIterator::new(&other.ops);
        let mut delta = Delta::with_capacity(self.ops.len() + other.ops.len());

        // A leading plain retain in `other` keeps our leading inserts as they are.
        if let Some(Op::Retain { count, attributes }) = other_iter.peek() {
            if attributes.is_empty() {
                let mut first_left = *count;
                while this_iter.peek_kind() == OpKind::Insert
                    && this_iter.peek_length() <= first_left
                {
                    first_left -= this_iter.peek_length();
                    delta.ops.push(this_iter.next_op());
                }
                if count - first_left > 0 {
                    other_iter.next_len(count - first_left);
                }
            }
        }

        while this_iter.has_next() || other_iter.has_next() {
            if other_iter.peek_kind() == OpKind::Insert {
                delta.push(other_iter.next_op());
            } else if this_iter.peek_kind() == OpKind::Delete {
                delta.push(this_iter.next_op());
            } else {
                let length = min(this_iter.peek_length(), other_iter.peek_length());
                let this_op = this_iter.next_len(length);
                let other_op = other_iter.next_len(length);
                match (this_op, other_op) {
                    (this_op, Op::Retain { attributes: other_attrs, .. }) => {
                        let new_op = match this_op {
                            Op::Retain { attributes, .. } => Op::Retain {
                                count: length,
                                attributes: attributes::compose(&attributes, &other_attrs, true),
                            },
                            Op::Insert { text, attributes } => Op::Insert {
                                text,
                                attributes: attributes::compose(&attributes, &other_attrs, false),
                            },
                            Op::Delete { .. } => continue,
                        };
                        delta.push(new_op.clone());

                        // Once `other` is spent the rest of `self` passes through untouched.
                        if !other_iter.has_next() && delta.ops.last() == Some(&new_op) {
                            let rest = Delta { ops: this_iter.rest() };
                            return delta.concat(&rest).chop();
                        }
                    }
                    (Op::Retain { .. }, Op::Delete { count }) => {
                        delta.push(Op::Delete { count });
                    }
                    // Insert then delete cancel out.
                    _ => {}
                }
            }
        }
        delta.chop()
    }

    /// Rewrite `other` so it applies after `self`.
    ///
    /// Both deltas must apply to the same document. With `priority` set,
    /// `self` is considered to have happened first: its inserts win ties at
    /// the same position and its attributes win conflicting keys.
    ///
    /// `a.compose(&a.transform(&b, p)) == b.compose(&b.transform(&a, !p))`
    pub fn transform(&self, other: &Delta, priority: bool) -> Delta {
        let mut this_iter = OpIterator::new(&self.ops);
        let mut other_iter = OpIterator::new(&other.ops);
        let mut delta = Delta::with_capacity(other.ops.len());

        while this_iter.has_next() || other_iter.has_next() {
            if this_iter.peek_kind() == OpKind::Insert
                && (priority || other_iter.peek_kind() != OpKind::Insert)
            {
                let op = this_iter.next_op();
                delta.push(Op::retain(op.len()));
            } else if other_iter.peek_kind() == OpKind::Insert {
                delta.push(other_iter.next_op());
            } else {
                let length = min(this_iter.peek_length(), other_iter.peek_length());
                let this_op = this_iter.next_len(length);
                let other_op = other_iter.next_len(length);
                match (this_op, other_op) {
                    // Our delete already removed whatever `other` wanted to touch.
                    (Op::Delete { .. }, _) => {}
                    (_, Op::Delete { count }) => {
                        delta.push(Op::Delete { count });
                    }
                    (this_op, other_op) => {
                        let empty = AttributeMap::new();
                        let this_attrs = this_op.attributes().unwrap_or(&empty);
                        let other_attrs = other_op.attributes().unwrap_or(&empty);
                        delta.push(Op::Retain {
                            count: length,
                            attributes: attributes::transform(this_attrs, other_attrs, priority),
                        });
                    }
                }
            }
        }
        delta.chop()
    }

    /// Where a cursor at `index` ends up once `self` is applied.
    pub fn transform_index(&self, index: usize, priority: bool) -> usize {
        let mut this_iter = OpIterator::new(&self.ops);
        let mut index = index;
        let mut offset = 0;
        while this_iter.has_next() && offset <= index {
            let length = this_iter.peek_length();
            let kind = this_iter.peek_kind();
            this_iter.next_op();
            match kind {
                OpKind::Delete => {
                    index -= min(length, index - offset);
                    continue;
                }
                OpKind::Insert if offset < index || !priority => {
                    index += length;
                }
                _ => {}
            }
            offset += length;
        }
        index
    }

    /// Characters `start..end` of this delta.
    pub fn slice(&self, start: usize, end: usize) -> Delta {
        let mut iter = OpIterator::new(&self.ops);
        let mut delta = Delta::new();
        let mut index = 0;
        while index < end && iter.has_next() {
            let op = if index < start {
                iter.next_len(start - index)
            } else {
                let op = iter.next_len(end - index);
                delta.push(op.clone());
                op
            };
            index += op.len();
        }
        delta
    }

    /// The change that undoes `self` when applied after it to `base`.
    pub fn invert(&self, base: &Delta) -> Delta {
        let mut inverted = Delta::new();
        let mut base_index = 0;
        for op in &self.ops {
            match op {
                Op::Insert { .. } => {
                    inverted.push(Op::delete(op.len()));
                }
                Op::Retain { count, attributes } if attributes.is_empty() => {
                    inverted.push(Op::retain(*count));
                    base_index += count;
                }
                Op::Retain { count, attributes } => {
                    for base_op in base.slice(base_index, base_index + count).ops {
                        let empty = AttributeMap::new();
                        let base_attrs = base_op.attributes().unwrap_or(&empty);
                        inverted.push(Op::Retain {
                            count: base_op.len(),
                            attributes: attributes::invert(attributes, base_attrs),
                        });
                    }
                    base_index += count;
                }
                Op::Delete { count } => {
                    for base_op in base.slice(base_index, base_index + count).ops {
                        inverted.push(base_op);
                    }
                    base_index += count;
                }
            }
        }
        inverted.chop()
    }

    // -------------------------------------------------------------
    // Encoding
    // -------------------------------------------------------------

    /// Quill JSON form: `{"ops":[...]}`.
    pub fn to_json(&self) -> Result<String, DeltaError> {
        serde_json::to_string(self).map_err(|e| DeltaError::Encode(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, DeltaError> {
        serde_json::from_str(json).map_err(|e| DeltaError::Decode(e.to_string()))
    }
}

impl From<Vec<Op>> for Delta {
    fn from(ops: Vec<Op>) -> Self {
        ops.into_iter().collect()
    }
}
