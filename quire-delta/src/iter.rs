//! Cursor over a delta's primitives that can split them at any length.
//!
//! Past the end the iterator behaves as an endless plain retain, which is
//! what gives every delta an implicit trailing "keep the rest".

use crate::op::{slice_chars, Op, OpKind};

/// Peek length reported once the iterator is exhausted.
pub const INFINITE: usize = usize::MAX;

pub struct OpIterator<'a> {
    ops: &'a [Op],
    index: usize,
    offset: usize,
}

impl<'a> OpIterator<'a> {
    pub fn new(ops: &'a [Op]) -> Self {
        Self {
            ops,
            index: 0,
            offset: 0,
        }
    }

    pub fn has_next(&self) -> bool {
        self.peek_length() < INFINITE
    }

    /// Take up to `length` characters of the current primitive.
    pub fn next_len(&mut self, length: usize) -> Op {
        let Some(op) = self.ops.get(self.index) else {
            return Op::retain(length);
        };
        let offset = self.offset;
        let remaining = op.len() - offset;
        let length = length.min(remaining);
        if length >= remaining {
            self.index += 1;
            self.offset = 0;
        } else {
            self.offset += length;
        }
        match op {
            Op::Delete { .. } => Op::Delete { count: length },
            Op::Retain { attributes, .. } => Op::Retain {
                count: length,
                attributes: attributes.clone(),
            },
            Op::Insert { text, attributes } => Op::Insert {
                text: if offset == 0 && length == remaining {
                    text.clone()
                } else {
                    slice_chars(text, offset, length)
                },
                attributes: attributes.clone(),
            },
        }
    }

    /// Take the rest of the current primitive.
    pub fn next_op(&mut self) -> Op {
        self.next_len(INFINITE)
    }

    pub fn peek(&self) -> Option<&'a Op> {
        self.ops.get(self.index)
    }

    pub fn peek_length(&self) -> usize {
        match self.ops.get(self.index) {
            Some(op) => op.len() - self.offset,
            None => INFINITE,
        }
    }

    pub fn peek_kind(&self) -> OpKind {
        match self.ops.get(self.index) {
            Some(op) => op.kind(),
            None => OpKind::Retain,
        }
    }

    /// Everything not consumed yet, with the current primitive trimmed.
    pub fn rest(&mut self) -> Vec<Op> {
        if !self.has_next() {
            return Vec::new();
        }
        if self.offset == 0 {
            return self.ops[self.index..].to_vec();
        }
        let (index, offset) = (self.index, self.offset);
        let head = self.next_op();
        let mut rest = Vec::with_capacity(self.ops.len() - self.index + 1);
        rest.push(head);
        rest.extend_from_slice(&self.ops[self.index..]);
        self.index = index;
        self.offset = offset;
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops() -> Vec<Op> {
        vec![Op::insert("Hello"), Op::retain(3), Op::delete(4)]
    }

    #[test]
    fn test_splits_inserts() {
        let ops = ops();
        let mut iter = OpIterator::new(&ops);
        assert_eq!(iter.peek_length(), 5);
        assert_eq!(iter.next_len(2), Op::insert("He"));
        assert_eq!(iter.peek_length(), 3);
        assert_eq!(iter.next_op(), Op::insert("llo"));
        assert_eq!(iter.peek_kind(), OpKind::Retain);
        assert_eq!(iter.next_len(10), Op::retain(3));
        assert_eq!(iter.next_len(1), Op::delete(1));
        assert_eq!(iter.next_op(), Op::delete(3));
        assert!(!iter.has_next());
    }

    #[test]
    fn test_exhausted_is_retain() {
        let ops: Vec<Op> = Vec::new();
        let mut iter = OpIterator::new(&ops);
        assert!(!iter.has_next());
        assert_eq!(iter.peek_kind(), OpKind::Retain);
        assert_eq!(iter.peek_length(), INFINITE);
        assert_eq!(iter.next_len(4), Op::retain(4));
    }

    #[test]
    fn test_rest_keeps_position() {
        let ops = ops();
        let mut iter = OpIterator::new(&ops);
        iter.next_len(2);
        let rest = iter.rest();
        assert_eq!(rest, vec![Op::insert("llo"), Op::retain(3), Op::delete(4)]);
        assert_eq!(iter.peek_length(), 3);
        assert_eq!(iter.next_op(), Op::insert("llo"));
    }
}
