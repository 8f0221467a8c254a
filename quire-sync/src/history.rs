//! Bounded log of applied operations, keyed by revision.
//!
//! ```text
//!   oldest_base        retained window               head_rev
//!        │  ┌──────┬──────┬──────┬──────┬──────┐        │
//!        └─►│ r+1  │ r+2  │ ...  │ h-1  │  h   │◄───────┘
//!           └──────┴──────┴──────┴──────┴──────┘
//! ```
//!
//! The hub rebases an incoming change over every entry after its base
//! revision. Bases older than `oldest_base` can no longer be rebased.

use std::collections::VecDeque;

use quire_delta::Delta;

use crate::payload::Revision;

#[derive(Debug, Clone)]
pub struct RevisionLog {
    entries: VecDeque<(Revision, Delta)>,
    head_rev: Revision,
    limit: usize,
}

impl RevisionLog {
    /// An empty log at revision 0 keeping at most `limit` entries.
    pub fn new(limit: usize) -> Self {
        Self::starting_at(0, limit)
    }

    /// An empty log whose next entry will be `rev + 1`.
    pub fn starting_at(rev: Revision, limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.min(1024)),
            head_rev: rev,
            limit,
        }
    }

    /// Record the op applied as the next revision. Returns that revision.
    pub fn push(&mut self, op: Delta) -> Revision {
        self.head_rev += 1;
        if self.limit > 0 {
            if self.entries.len() == self.limit {
                self.entries.pop_front();
            }
            self.entries.push_back((self.head_rev, op));
        }
        self.head_rev
    }

    /// Ops applied after `base`, oldest first.
    ///
    /// `None` when `base` is ahead of the head or fell out of the window.
    pub fn since(&self, base: Revision) -> Option<impl Iterator<Item = &Delta> + '_> {
        if base > self.head_rev || base < self.oldest_base() {
            return None;
        }
        let skip = (base - self.oldest_base()) as usize;
        Some(self.entries.iter().skip(skip).map(|(_, op)| op))
    }

    /// Oldest base revision a change may still carry.
    pub fn oldest_base(&self) -> Revision {
        match self.entries.front() {
            Some((rev, _)) => rev - 1,
            None => self.head_rev,
        }
    }

    pub fn head_rev(&self) -> Revision {
        self.head_rev
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(text: &str) -> Delta {
        Delta::new().insert(text)
    }

    #[test]
    fn test_push_advances_head() {
        let mut log = RevisionLog::new(8);
        assert_eq!(log.push(op("a")), 1);
        assert_eq!(log.push(op("b")), 2);
        assert_eq!(log.head_rev(), 2);
        assert_eq!(log.len(), 2);
        assert_eq!(log.oldest_base(), 0);
    }

    #[test]
    fn test_since_returns_tail() {
        let mut log = RevisionLog::new(8);
        log.push(op("a"));
        log.push(op("b"));
        log.push(op("c"));

        let tail: Vec<_> = log.since(1).unwrap().cloned().collect();
        assert_eq!(tail, vec![op("b"), op("c")]);
        assert_eq!(log.since(3).unwrap().count(), 0);
        assert_eq!(log.since(0).unwrap().count(), 3);
        assert!(log.since(4).is_none(), "Base ahead of head");
    }

    #[test]
    fn test_window_compacts() {
        let mut log = RevisionLog::new(2);
        for text in ["a", "b", "c", "d"] {
            log.push(op(text));
        }
        assert_eq!(log.len(), 2);
        assert_eq!(log.oldest_base(), 2);
        assert!(log.since(1).is_none(), "Rev 2 has been dropped");
        let tail: Vec<_> = log.since(2).unwrap().cloned().collect();
        assert_eq!(tail, vec![op("c"), op("d")]);
    }

    #[test]
    fn test_zero_limit_keeps_nothing() {
        let mut log = RevisionLog::starting_at(5, 0);
        assert_eq!(log.push(op("a")), 6);
        assert!(log.is_empty());
        assert_eq!(log.oldest_base(), 6);
        assert!(log.since(5).is_none());
        assert_eq!(log.since(6).unwrap().count(), 0);
    }
}
