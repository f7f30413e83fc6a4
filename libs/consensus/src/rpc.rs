//! Raft RPC messages
//!
//! The messages are transport-agnostic. [`encode`] and [`decode`] give
//! transports a ready-made binary form.

use crate::types::{Entry, LogIndex, NodeId, Term};
use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// RequestVote RPC - sent by candidates to gather votes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting vote
    pub candidate_id: NodeId,

    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for candidate to update itself
    pub term: Term,

    /// True if candidate received vote
    pub vote_granted: bool,
}

/// AppendEntries RPC - sent by leader to replicate log and provide heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// So follower can redirect clients
    pub leader_id: NodeId,

    /// Index of log entry immediately preceding new ones
    pub prev_log_index: LogIndex,

    /// Term of prev_log_index entry
    pub prev_log_term: Term,

    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<Entry>,

    /// Leader's commit index
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// Create a heartbeat message (no entries)
    pub fn heartbeat(
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        leader_commit: LogIndex,
    ) -> Self {
        Self {
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries: vec![],
            leader_commit,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last entry this request covers
    pub fn last_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for leader to update itself
    pub term: Term,

    /// True if follower contained entry matching prev_log_index and prev_log_term
    pub success: bool,

    /// On failure, where the leader should resume: the first index of the
    /// conflicting term, or one past the follower's last entry when its log
    /// is too short
    pub conflict_index: Option<LogIndex>,
}

impl AppendEntriesResponse {
    pub fn rejected(term: Term) -> Self {
        Self {
            term,
            success: false,
            conflict_index: None,
        }
    }
}

/// Serialize an RPC message for the wire
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(message)?)
}

/// Deserialize an RPC message received from the wire
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
