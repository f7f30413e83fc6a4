//! Raft node handle and event loop
//!
//! Every node runs one event loop task that owns its [`RaftCore`]. Inbound
//! RPCs, proposals and RPC replies arrive as [`RaftCommand`]s on one queue,
//! so all state changes are serialized. Outbound RPCs run in their own tasks
//! and report back through the same queue; the loop never awaits the network.

use crate::apply::run_apply_pipeline;
use crate::config::RaftConfig;
use crate::log::{LogStorage, MemoryLogStorage, RaftLog};
use crate::network::RaftTransport;
use crate::raft::{snapshot_status, RaftCore};
use crate::replication::SentAppend;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::state::{NodeState, NodeStatus, RaftRole};
use crate::types::{ApplyMsg, Entry, LogIndex, NodeId, Proposal, Term};
use crate::{RaftError, Result};

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, timeout, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Events processed by a node's event loop
enum RaftCommand {
    /// Propose a new command (only works on leader)
    Propose {
        command: Bytes,
        response: oneshot::Sender<Result<Proposal>>,
    },

    /// Handle RequestVote RPC
    RequestVote {
        request: RequestVoteRequest,
        response: oneshot::Sender<RequestVoteResponse>,
    },

    /// Handle AppendEntries RPC
    AppendEntries {
        request: AppendEntriesRequest,
        response: oneshot::Sender<AppendEntriesResponse>,
    },

    /// A peer answered one of our vote requests
    VoteReply {
        from: NodeId,
        term: Term,
        reply: RequestVoteResponse,
    },

    /// A peer answered one of our append requests
    AppendReply {
        from: NodeId,
        sent: SentAppend,
        reply: AppendEntriesResponse,
    },
}

/// Handle to a running Raft node
///
/// Handles are cheap to clone and all talk to the same event loop.
#[derive(Clone)]
pub struct RaftNode {
    id: NodeId,
    command_tx: mpsc::UnboundedSender<RaftCommand>,
    state: Arc<RwLock<NodeState>>,
    log: RaftLog,
    shutdown: CancellationToken,
}

impl RaftNode {
    /// Create a new Raft node backed by an in-memory log
    ///
    /// `peers` lists every member of the cluster, including `id`. Committed
    /// commands are delivered on `apply_tx` in index order. Must be called
    /// from within a tokio runtime.
    pub async fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        config: RaftConfig,
        transport: Arc<dyn RaftTransport>,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Result<Self> {
        Self::with_storage(
            id,
            peers,
            config,
            Box::new(MemoryLogStorage::new()),
            transport,
            apply_tx,
        )
        .await
    }

    /// Create a new Raft node on a caller-provided log backend
    pub async fn with_storage(
        id: NodeId,
        peers: Vec<NodeId>,
        config: RaftConfig,
        storage: Box<dyn LogStorage>,
        transport: Arc<dyn RaftTransport>,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Result<Self> {
        config.validate()?;
        validate_cluster(id, &peers)?;

        let log = RaftLog::new(storage);
        let (core, commit_rx) = RaftCore::new(id, peers, config, log.clone());
        let state = Arc::clone(&core.state);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tokio::spawn(run_apply_pipeline(
            Arc::clone(&state),
            log.clone(),
            commit_rx,
            apply_tx,
            shutdown.clone(),
        ));

        let driver = RaftDriver {
            core,
            transport,
            command_tx: command_tx.downgrade(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(driver.run(command_rx));

        Ok(RaftNode {
            id,
            command_tx,
            state,
            log,
            shutdown,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Propose a command to the cluster
    ///
    /// Only the leader accepts proposals; other nodes answer with
    /// [`RaftError::NotLeader`] carrying the leader they know of. On success
    /// the command is in the leader's log but not necessarily committed;
    /// watch the apply channel for `proposal.index`.
    pub async fn propose(&self, command: impl Into<Bytes>) -> Result<Proposal> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::Propose {
                command: command.into(),
                response: tx,
            })
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Handle RequestVote RPC
    pub async fn request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::RequestVote {
                request,
                response: tx,
            })
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Handle AppendEntries RPC
    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::AppendEntries {
                request,
                response: tx,
            })
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    pub fn status(&self) -> NodeStatus {
        snapshot_status(&self.state, &self.log)
    }

    /// Every entry after the sentinel, in index order
    pub fn entries(&self) -> Result<Vec<Entry>> {
        self.log.get_range(LogIndex(1), self.log.last_index() + 1)
    }

    /// Stop the event loop and the apply pipeline
    ///
    /// RPCs sent to a stopped node fail with [`RaftError::ShuttingDown`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

fn validate_cluster(id: NodeId, peers: &[NodeId]) -> Result<()> {
    if peers.is_empty() {
        return Err(RaftError::InvalidCluster("peer list is empty".into()));
    }
    let unique: HashSet<NodeId> = peers.iter().copied().collect();
    if unique.len() != peers.len() {
        return Err(RaftError::InvalidCluster("peer list has duplicates".into()));
    }
    if !unique.contains(&id) {
        return Err(RaftError::InvalidCluster(format!(
            "{} is not in its own peer list",
            id
        )));
    }
    Ok(())
}

/// The event loop side of a node
struct RaftDriver {
    core: RaftCore,
    transport: Arc<dyn RaftTransport>,
    /// Weak so the loop ends once every handle and in-flight RPC is gone
    command_tx: mpsc::WeakUnboundedSender<RaftCommand>,
    shutdown: CancellationToken,
}

impl RaftDriver {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<RaftCommand>) {
        let id = self.core.id();
        let shutdown = self.shutdown.clone();
        let mut heartbeat = interval(self.core.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Node {} started as {}", id, self.core.role());

        loop {
            let leading = self.core.role() == RaftRole::Leader;
            let deadline = self.core.election_deadline();

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                cmd = command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd, &mut heartbeat),
                    None => break,
                },

                _ = sleep_until(deadline), if !leading => {
                    self.campaign(&mut heartbeat);
                }

                _ = heartbeat.tick(), if leading => {
                    self.replicate();
                }
            }
        }

        shutdown.cancel();
        info!("Node {} shutting down", id);
    }

    fn handle_command(&mut self, cmd: RaftCommand, heartbeat: &mut Interval) {
        match cmd {
            RaftCommand::Propose { command, response } => {
                let result = self.core.propose(command);
                let accepted = result.is_ok();
                let _ = response.send(result);
                if accepted {
                    self.replicate();
                }
            }

            RaftCommand::RequestVote { request, response } => {
                let reply = self.core.handle_request_vote(request);
                let _ = response.send(reply);
            }

            RaftCommand::AppendEntries { request, response } => {
                let reply = self.core.handle_append_entries(request);
                let _ = response.send(reply);
            }

            RaftCommand::VoteReply { from, term, reply } => {
                if self.core.handle_vote_reply(from, term, reply) {
                    self.lead(heartbeat);
                }
            }

            RaftCommand::AppendReply { from, sent, reply } => {
                self.core.handle_append_reply(from, sent, reply);
            }
        }
    }

    /// Election deadline passed: stand for the next term
    fn campaign(&mut self, heartbeat: &mut Interval) {
        let requests = self.core.start_election();
        if self.core.role() == RaftRole::Leader {
            self.lead(heartbeat);
            return;
        }
        for (peer, request) in requests {
            self.send_vote_request(peer, request);
        }
    }

    /// Assert leadership right away, then keep the cadence from here
    fn lead(&mut self, heartbeat: &mut Interval) {
        heartbeat.reset();
        self.replicate();
    }

    fn replicate(&self) {
        for (peer, request, sent) in self.core.append_requests() {
            self.send_append_entries(peer, request, sent);
        }
    }

    fn send_vote_request(&self, target: NodeId, request: RequestVoteRequest) {
        let Some(reply_tx) = self.command_tx.upgrade() else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let rpc_timeout = self.core.config.rpc_timeout;
        let id = self.core.id();
        let term = request.term;

        tokio::spawn(async move {
            match timeout(rpc_timeout, transport.request_vote(target, request)).await {
                Ok(Ok(reply)) => {
                    let _ = reply_tx.send(RaftCommand::VoteReply {
                        from: target,
                        term,
                        reply,
                    });
                }
                Ok(Err(e)) => debug!("Node {} vote request to {} failed: {}", id, target, e),
                Err(_) => debug!("Node {} vote request to {} timed out", id, target),
            }
        });
    }

    fn send_append_entries(&self, target: NodeId, request: AppendEntriesRequest, sent: SentAppend) {
        let Some(reply_tx) = self.command_tx.upgrade() else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let rpc_timeout = self.core.config.rpc_timeout;
        let id = self.core.id();

        tokio::spawn(async move {
            match timeout(rpc_timeout, transport.append_entries(target, request)).await {
                Ok(Ok(reply)) => {
                    let _ = reply_tx.send(RaftCommand::AppendReply {
                        from: target,
                        sent,
                        reply,
                    });
                }
                Ok(Err(e)) => debug!("Node {} append to {} failed: {}", id, target, e),
                Err(_) => debug!("Node {} append to {} timed out", id, target),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::InProcessNetwork;

    #[test]
    fn test_cluster_validation() {
        assert!(validate_cluster(NodeId(1), &[]).is_err());
        assert!(validate_cluster(NodeId(1), &[NodeId(1), NodeId(1)]).is_err());
        assert!(validate_cluster(NodeId(4), &[NodeId(1), NodeId(2)]).is_err());
        assert!(validate_cluster(NodeId(1), &[NodeId(1), NodeId(2), NodeId(3)]).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_creation() {
        let network = InProcessNetwork::new();
        let (apply_tx, _apply_rx) = mpsc::channel(16);
        let peers = vec![NodeId(1), NodeId(2), NodeId(3)];

        let node = RaftNode::new(
            NodeId(1),
            peers,
            RaftConfig::default(),
            network.transport(NodeId(1)),
            apply_tx,
        )
        .await
        .unwrap();

        let status = node.status();
        assert_eq!(status.role, RaftRole::Follower);
        assert_eq!(status.term, Term(0));
        assert_eq!(status.voted_for, None);
        assert!(node.entries().unwrap().is_empty());

        node.shutdown();
        assert!(node.is_shutdown());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_node_elects_itself_and_applies() {
        let network = InProcessNetwork::new();
        let (apply_tx, mut apply_rx) = mpsc::channel(16);

        let node = RaftNode::new(
            NodeId(7),
            vec![NodeId(7)],
            RaftConfig::default(),
            network.transport(NodeId(7)),
            apply_tx,
        )
        .await
        .unwrap();

        tokio::time::sleep(RaftConfig::default().election_timeout_max * 2).await;
        assert!(node.status().is_leader());

        let proposal = node.propose("solo").await.unwrap();
        let msg = apply_rx.recv().await.unwrap();
        assert_eq!(msg.command_index, proposal.index);
        assert_eq!(msg.command, Bytes::from_static(b"solo"));

        node.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_node_refuses_work() {
        let network = InProcessNetwork::new();
        let (apply_tx, _apply_rx) = mpsc::channel(16);
        let node = RaftNode::new(
            NodeId(1),
            vec![NodeId(1), NodeId(2)],
            RaftConfig::default(),
            network.transport(NodeId(1)),
            apply_tx,
        )
        .await
        .unwrap();

        node.shutdown();
        tokio::task::yield_now().await;

        let err = node.propose("late").await.unwrap_err();
        assert!(matches!(err, RaftError::ShuttingDown));
    }
}
