//! Core types used throughout the Raft implementation

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Election term number
///
/// Terms are used to detect stale leaders and ensure safety.
/// Each time a node starts an election, it increments its term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn increment(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Term({})", self.0)
    }
}

/// Index into the Raft log
///
/// Index 0 is the sentinel slot; real entries start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn increment(&mut self) {
        self.0 += 1;
    }

    /// The index immediately before this one, saturating at the sentinel.
    pub fn prev(self) -> LogIndex {
        LogIndex(self.0.saturating_sub(1))
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogIndex({})", self.0)
    }
}

impl std::ops::Add<u64> for LogIndex {
    type Output = LogIndex;

    fn add(self, rhs: u64) -> Self::Output {
        LogIndex(self.0 + rhs)
    }
}

impl std::ops::Sub<u64> for LogIndex {
    type Output = LogIndex;

    fn sub(self, rhs: u64) -> Self::Output {
        LogIndex(self.0 - rhs)
    }
}

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// The term when this entry was created
    pub term: Term,

    /// The log index for this entry
    pub index: LogIndex,

    /// Opaque command handed to the consumer once committed
    pub command: Bytes,
}

impl Entry {
    pub fn new(term: Term, index: LogIndex, command: impl Into<Bytes>) -> Self {
        Self {
            term,
            index,
            command: command.into(),
        }
    }

    /// The permanent entry at index 0
    pub fn sentinel() -> Self {
        Self {
            term: Term::ZERO,
            index: LogIndex::ZERO,
            command: Bytes::new(),
        }
    }
}

/// A committed command delivered to the consumer
///
/// Exactly one message is emitted per committed index, in increasing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyMsg {
    pub command_valid: bool,
    pub command: Bytes,
    pub command_index: LogIndex,
}

/// Where a successfully proposed command landed in the leader's log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub index: LogIndex,
    pub term: Term,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_increment() {
        let mut term = Term(5);
        term.increment();
        assert_eq!(term, Term(6));
    }

    #[test]
    fn test_log_index_ops() {
        let idx = LogIndex(10);
        assert_eq!(idx + 5, LogIndex(15));
        assert_eq!(idx - 3, LogIndex(7));
        assert_eq!(LogIndex::ZERO.prev(), LogIndex::ZERO);
        assert_eq!(LogIndex(4).prev(), LogIndex(3));
    }

    #[test]
    fn test_ordering() {
        assert!(LogIndex(1) < LogIndex(2));
        assert!(Term(100) > Term(50));
    }

    #[test]
    fn test_sentinel() {
        let s = Entry::sentinel();
        assert_eq!(s.term, Term::ZERO);
        assert_eq!(s.index, LogIndex::ZERO);
        assert!(s.command.is_empty());
    }
}
