//! Raft node state and role management

use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The role a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    /// Follower - accepts log entries from leader
    Follower,
    /// Candidate - attempting to become leader
    Candidate,
    /// Leader - accepts client requests and replicates log
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "Follower"),
            RaftRole::Candidate => write!(f, "Candidate"),
            RaftRole::Leader => write!(f, "Leader"),
        }
    }
}

/// Persistent state that a durable deployment writes before answering RPCs
///
/// The log half of the persistent state lives in [`crate::log::RaftLog`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    /// Latest term this server has seen (initialized to 0, increases monotonically)
    pub current_term: Term,

    /// Candidate that received vote in current term (or None)
    pub voted_for: Option<NodeId>,
}

/// Volatile state on all servers
#[derive(Debug, Clone, Default)]
pub struct VolatileState {
    /// Index of highest log entry known to be committed
    pub commit_index: LogIndex,

    /// Index of highest log entry handed to the consumer
    pub last_applied: LogIndex,
}

/// Volatile state on leaders (reinitialized after election)
#[derive(Debug, Clone)]
pub struct LeaderState {
    /// For each server, index of next log entry to send
    pub next_index: Vec<(NodeId, LogIndex)>,

    /// For each server, index of highest log entry known to be replicated
    pub match_index: Vec<(NodeId, LogIndex)>,
}

impl LeaderState {
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        Self {
            next_index: peers
                .iter()
                .map(|&id| (id, last_log_index + 1))
                .collect(),
            match_index: peers.iter().map(|&id| (id, LogIndex::ZERO)).collect(),
        }
    }

    pub fn get_next_index(&self, node: NodeId) -> Option<LogIndex> {
        self.next_index
            .iter()
            .find(|(id, _)| *id == node)
            .map(|(_, idx)| *idx)
    }

    pub fn set_next_index(&mut self, node: NodeId, index: LogIndex) {
        if let Some(entry) = self.next_index.iter_mut().find(|(id, _)| *id == node) {
            entry.1 = index;
        }
    }

    pub fn get_match_index(&self, node: NodeId) -> Option<LogIndex> {
        self.match_index
            .iter()
            .find(|(id, _)| *id == node)
            .map(|(_, idx)| *idx)
    }

    pub fn set_match_index(&mut self, node: NodeId, index: LogIndex) {
        if let Some(entry) = self.match_index.iter_mut().find(|(id, _)| *id == node) {
            entry.1 = index;
        }
    }
}

/// Candidate-specific state
#[derive(Debug, Clone, Default)]
pub struct CandidateState {
    /// Peers (never self) that granted a vote in this election
    pub votes_received: HashSet<NodeId>,
}

impl CandidateState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vote(&mut self, node: NodeId) {
        self.votes_received.insert(node);
    }

    pub fn has_majority(&self, cluster_size: usize) -> bool {
        // +1 for self
        (self.votes_received.len() + 1) > cluster_size / 2
    }
}

/// Complete Raft node state
#[derive(Debug)]
pub struct NodeState {
    /// Current role of this node
    pub role: RaftRole,

    /// This node's ID
    pub id: NodeId,

    /// Current leader (if known)
    pub leader_id: Option<NodeId>,

    /// Persistent state
    pub persistent: PersistentState,

    /// Volatile state
    pub volatile: VolatileState,

    /// Leader-specific state (only valid when role == Leader)
    pub leader_state: Option<LeaderState>,

    /// Candidate-specific state (only valid when role == Candidate)
    pub candidate_state: Option<CandidateState>,

    /// All nodes in the cluster (including self), in configuration order
    pub peers: Vec<NodeId>,
}

impl NodeState {
    pub fn new(id: NodeId, peers: Vec<NodeId>) -> Self {
        Self {
            role: RaftRole::Follower,
            id,
            leader_id: None,
            persistent: PersistentState::default(),
            volatile: VolatileState::default(),
            leader_state: None,
            candidate_state: None,
            peers,
        }
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term
    }

    /// Transition to follower state
    ///
    /// Adopting a newer term forgets the vote cast in the old one.
    pub fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        if term > self.persistent.current_term {
            self.persistent.current_term = term;
            self.persistent.voted_for = None;
        }
        self.role = RaftRole::Follower;
        self.leader_id = leader;
        self.leader_state = None;
        self.candidate_state = None;
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self) {
        self.role = RaftRole::Candidate;
        self.persistent.current_term.increment();
        self.persistent.voted_for = Some(self.id);
        self.leader_id = None;
        self.candidate_state = Some(CandidateState::new());
        self.leader_state = None;
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, last_log_index: LogIndex) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.id);
        self.leader_state = Some(LeaderState::new(&self.other_peers(), last_log_index));
        self.candidate_state = None;
    }

    /// Get other peers (excluding self)
    pub fn other_peers(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|&&p| p != self.id)
            .copied()
            .collect()
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len()
    }

    /// Number of nodes (including self) that make a strict majority
    pub fn quorum(&self) -> usize {
        self.cluster_size() / 2 + 1
    }
}

/// Read-only snapshot of a node, as reported by [`crate::RaftNode::status`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: RaftRole,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

impl NodeStatus {
    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }
}
