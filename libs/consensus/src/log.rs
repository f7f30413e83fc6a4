//! Log storage for Raft
//!
//! The log is the source of truth for all commands that have been proposed.
//! It is 1-indexed: slot 0 always holds a sentinel entry with term 0, so
//! `prev_log_index = 0` checks succeed without special cases.
//!
//! Durability is the storage backend's concern. The in-memory backend here
//! is what the node uses unless a caller supplies its own.

use crate::types::{Entry, LogIndex, Term};
use crate::{RaftError, Result};
use parking_lot::RwLock;
use std::sync::Arc;

/// Trait for log storage backends
///
/// Implementations must keep the sentinel at index 0 and must never
/// truncate it.
pub trait LogStorage: Send + Sync {
    /// Append entries to the end of the log
    ///
    /// The first entry's index must be `last_index() + 1`.
    fn append(&mut self, entries: Vec<Entry>) -> Result<()>;

    /// Get an entry at a specific index
    fn get(&self, index: LogIndex) -> Result<Option<Entry>>;

    /// Get a range of entries [start, end)
    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>>;

    /// Delete entries from index onwards (used when log conflicts are detected)
    fn truncate_from(&mut self, index: LogIndex) -> Result<()>;

    /// Get the index of the last entry (0 when only the sentinel exists)
    fn last_index(&self) -> LogIndex;

    /// Get the term of the last entry
    fn last_term(&self) -> Term;

    /// Get the term of a specific entry
    fn get_term(&self, index: LogIndex) -> Result<Option<Term>>;
}

/// In-memory log storage
pub struct MemoryLogStorage {
    /// `entries[i]` holds log index `i`; `entries[0]` is the sentinel
    entries: Vec<Entry>,
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        Self {
            entries: vec![Entry::sentinel()],
        }
    }

    fn slot(&self, index: LogIndex) -> Option<usize> {
        let slot = usize::try_from(index.0).ok()?;
        (slot < self.entries.len()).then_some(slot)
    }
}

impl Default for MemoryLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStorage for MemoryLogStorage {
    fn append(&mut self, entries: Vec<Entry>) -> Result<()> {
        let mut expected = self.last_index() + 1;
        for entry in &entries {
            if entry.index != expected {
                return Err(RaftError::LogIndexOutOfRange(entry.index));
            }
            expected.increment();
        }
        self.entries.extend(entries);
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        Ok(self.slot(index).map(|slot| self.entries[slot].clone()))
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        // one past the last entry is a valid, empty start
        let len = self.entries.len() as u64;
        if start.0 > len {
            return Err(RaftError::LogIndexOutOfRange(start));
        }

        let end = end.0.min(len);
        if start.0 >= end {
            return Ok(vec![]);
        }
        Ok(self.entries[start.0 as usize..end as usize].to_vec())
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        if index == LogIndex::ZERO {
            return Err(RaftError::LogIndexOutOfRange(index));
        }
        if let Some(slot) = self.slot(index) {
            self.entries.truncate(slot);
        }
        Ok(())
    }

    fn last_index(&self) -> LogIndex {
        LogIndex(self.entries.len() as u64 - 1)
    }

    fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(Term::ZERO)
    }

    fn get_term(&self, index: LogIndex) -> Result<Option<Term>> {
        Ok(self.slot(index).map(|slot| self.entries[slot].term))
    }
}

/// Thread-safe wrapper around log storage
///
/// Clones share the same storage. The node's event loop is the only writer.
pub struct RaftLog {
    storage: Arc<RwLock<Box<dyn LogStorage>>>,
}

impl RaftLog {
    pub fn new(storage: Box<dyn LogStorage>) -> Self {
        Self {
            storage: Arc::new(RwLock::new(storage)),
        }
    }

    pub fn new_memory() -> Self {
        Self::new(Box::new(MemoryLogStorage::new()))
    }

    pub fn append(&self, entries: Vec<Entry>) -> Result<()> {
        self.storage.write().append(entries)
    }

    pub fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        self.storage.read().get(index)
    }

    pub fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        self.storage.read().get_range(start, end)
    }

    /// Up to `max` entries starting at `start`
    pub fn entries_from(&self, start: LogIndex, max: usize) -> Result<Vec<Entry>> {
        let storage = self.storage.read();
        if start > storage.last_index() {
            return Ok(vec![]);
        }
        storage.get_range(start, LogIndex(start.0.saturating_add(max as u64)))
    }

    pub fn truncate_from(&self, index: LogIndex) -> Result<()> {
        self.storage.write().truncate_from(index)
    }

    pub fn last_index(&self) -> LogIndex {
        self.storage.read().last_index()
    }

    pub fn last_term(&self) -> Term {
        self.storage.read().last_term()
    }

    /// Index and term of the last entry, read under one lock
    pub fn last_log_id(&self) -> (LogIndex, Term) {
        let storage = self.storage.read();
        (storage.last_index(), storage.last_term())
    }

    pub fn get_term(&self, index: LogIndex) -> Result<Option<Term>> {
        self.storage.read().get_term(index)
    }

    /// First index of the run of entries sharing the term stored at `index`
    ///
    /// Followers report this on a term conflict so the leader can skip the
    /// whole conflicting term instead of backing off one entry at a time.
    pub fn first_index_of_term_at(&self, index: LogIndex) -> Result<LogIndex> {
        let storage = self.storage.read();
        let term = storage
            .get_term(index)?
            .ok_or(RaftError::LogIndexOutOfRange(index))?;

        let mut first = index;
        while first > LogIndex(1) && storage.get_term(first.prev())? == Some(term) {
            first = first.prev();
        }
        Ok(first)
    }

    /// Whether a candidate's last entry is at least as up to date as ours
    ///
    /// Higher last term wins; on equal terms the longer log wins.
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let (our_index, our_term) = self.last_log_id();
        last_log_term > our_term || (last_log_term == our_term && last_log_index >= our_index)
    }
}

impl Clone for RaftLog {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}
