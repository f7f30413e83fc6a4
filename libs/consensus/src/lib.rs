//! Raft consensus for a fixed cluster of peers
//!
//! Each [`RaftNode`] keeps a replicated, totally ordered log in step with its
//! peers and delivers committed commands, in order and exactly once, on an
//! [`ApplyMsg`] channel. Commands are opaque bytes; what they mean is up to
//! the consumer.
//!
//! # Features
//!
//! - Leader election with randomized timeouts
//! - Log replication with conflict-hinted backoff
//! - Commit advancement under majority, restricted to current-term entries
//! - Sequential apply pipeline with consumer backpressure
//!
//! Transport and log storage are pluggable through [`RaftTransport`] and
//! [`LogStorage`]. [`InProcessNetwork`] and [`MemoryLogStorage`] are the
//! in-process implementations.
//!
//! # Example
//!
//! ```no_run
//! use raftkv_consensus::{InProcessNetwork, NodeId, RaftConfig, RaftNode};
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> raftkv_consensus::Result<()> {
//! let network = InProcessNetwork::new();
//! let peers = vec![NodeId(1), NodeId(2), NodeId(3)];
//! let (apply_tx, mut apply_rx) = mpsc::channel(128);
//!
//! // Create a Raft node and make it reachable
//! let node = RaftNode::new(
//!     NodeId(1),
//!     peers,
//!     RaftConfig::default(),
//!     network.transport(NodeId(1)),
//!     apply_tx,
//! )
//! .await?;
//! network.register(node.clone());
//!
//! // Propose a command (only works on leader)
//! let proposal = node.propose("SET key value").await?;
//!
//! // ...and wait for it to commit
//! while let Some(msg) = apply_rx.recv().await {
//!     if msg.command_index == proposal.index {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod apply;
mod config;
mod election;
mod handlers;
mod log;
mod network;
mod node;
mod raft;
mod replication;
mod rpc;
mod state;
mod types;

pub use apply::{drive_state_machine, StateMachine};
pub use config::{RaftConfig, RaftConfigBuilder};
pub use log::{LogStorage, MemoryLogStorage, RaftLog};
pub use network::{InProcessNetwork, RaftTransport};
pub use node::RaftNode;
pub use rpc::{
    decode, encode, AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest,
    RequestVoteResponse,
};
pub use state::{NodeStatus, RaftRole};
pub use types::{ApplyMsg, Entry, LogIndex, NodeId, Proposal, Term};

/// Result type for Raft operations
pub type Result<T> = std::result::Result<T, RaftError>;

/// Errors that can occur during Raft operations
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("Not the leader (current leader: {0:?})")]
    NotLeader(Option<NodeId>),

    #[error("Node is shutting down")]
    ShuttingDown,

    #[error("Log index out of range: {0}")]
    LogIndexOutOfRange(LogIndex),

    #[error("Peer unreachable: {0}")]
    Unreachable(NodeId),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid cluster: {0}")]
    InvalidCluster(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
