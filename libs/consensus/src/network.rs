//! Outbound RPC seam and an in-process network
//!
//! A deployment plugs its own transport in through [`RaftTransport`].
//! [`InProcessNetwork`] routes calls between nodes in one process and can
//! cut links to simulate crashes and partitions.

use crate::node::RaftNode;
use crate::rpc::{
    self, AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::types::NodeId;
use crate::{RaftError, Result};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

/// Sends RPCs to other members of the cluster
///
/// An `Err` means no reply arrived. The node treats it like a lost message
/// and retries on its next round.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;
}

/// Routes RPCs between nodes living in the same process
#[derive(Default)]
pub struct InProcessNetwork {
    nodes: DashMap<NodeId, RaftNode>,
    /// Directed links that drop every message
    blocked: RwLock<HashSet<(NodeId, NodeId)>>,
    /// Nodes cut off from everyone
    isolated: RwLock<HashSet<NodeId>>,
}

impl InProcessNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The transport a node with id `from` sends through
    pub fn transport(self: &Arc<Self>, from: NodeId) -> Arc<dyn RaftTransport> {
        Arc::new(InProcessTransport {
            from,
            network: Arc::clone(self),
        })
    }

    pub fn register(&self, node: RaftNode) {
        self.nodes.insert(node.id(), node);
    }

    pub fn node(&self, id: NodeId) -> Option<RaftNode> {
        self.nodes.get(&id).map(|n| n.value().clone())
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|n| *n.key()).collect();
        ids.sort();
        ids
    }

    /// Drop all traffic to and from `id`
    pub fn isolate(&self, id: NodeId) {
        self.isolated.write().insert(id);
    }

    /// Restore all links touching `id`
    pub fn reconnect(&self, id: NodeId) {
        self.isolated.write().remove(&id);
        self.blocked.write().retain(|&(a, b)| a != id && b != id);
    }

    /// Cut every link between the two groups
    pub fn partition(&self, left: &[NodeId], right: &[NodeId]) {
        let mut blocked = self.blocked.write();
        for &a in left {
            for &b in right {
                blocked.insert((a, b));
                blocked.insert((b, a));
            }
        }
    }

    /// Restore every link
    pub fn heal(&self) {
        self.isolated.write().clear();
        self.blocked.write().clear();
    }

    pub fn can_reach(&self, from: NodeId, to: NodeId) -> bool {
        let isolated = self.isolated.read();
        if isolated.contains(&from) || isolated.contains(&to) {
            return false;
        }
        !self.blocked.read().contains(&(from, to))
    }

    /// Resolve the node behind a link, cloning it out of the map so no shard
    /// lock is held while the call is in flight
    fn route(&self, from: NodeId, to: NodeId) -> Result<RaftNode> {
        if !self.can_reach(from, to) {
            trace!("Dropping message {} -> {}", from, to);
            return Err(RaftError::Unreachable(to));
        }
        self.node(to).ok_or(RaftError::Unreachable(to))
    }
}

struct InProcessTransport {
    from: NodeId,
    network: Arc<InProcessNetwork>,
}

/// Push a message through its wire form, as a real transport would
fn over_the_wire<T: Serialize + DeserializeOwned>(message: &T) -> Result<T> {
    rpc::decode(&rpc::encode(message)?)
}

#[async_trait]
impl RaftTransport for InProcessTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let node = self.network.route(self.from, target)?;
        let response = node.request_vote(over_the_wire(&request)?).await?;
        // the reply can be lost on the way back too
        self.network.route(target, self.from)?;
        over_the_wire(&response)
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let node = self.network.route(self.from, target)?;
        let response = node.append_entries(over_the_wire(&request)?).await?;
        self.network.route(target, self.from)?;
        over_the_wire(&response)
    }
}
