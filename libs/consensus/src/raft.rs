//! The synchronous Raft state machine
//!
//! `RaftCore` owns a node's state and log and exposes one method per event
//! (timer expiry, inbound RPC, RPC reply, proposal). It never touches the
//! network: methods return the requests to send and the event loop in
//! `node.rs` does the sending. The engines live in `election.rs`,
//! `replication.rs` and `handlers.rs` as further `impl RaftCore` blocks.

use crate::config::RaftConfig;
use crate::log::RaftLog;
use crate::state::{NodeState, NodeStatus, RaftRole};
use crate::types::{LogIndex, NodeId, Term};

use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// Randomized election deadline
pub(crate) struct ElectionTimer {
    deadline: Instant,
    min: Duration,
    max: Duration,
}

impl ElectionTimer {
    pub(crate) fn new(min: Duration, max: Duration) -> Self {
        let mut timer = Self {
            deadline: Instant::now(),
            min,
            max,
        };
        timer.reset();
        timer
    }

    /// Push the deadline out by a fresh random timeout
    pub(crate) fn reset(&mut self) {
        let timeout = rand::thread_rng().gen_range(self.min..=self.max);
        self.deadline = Instant::now() + timeout;
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }
}

pub(crate) struct RaftCore {
    pub(crate) state: Arc<RwLock<NodeState>>,
    pub(crate) log: RaftLog,
    pub(crate) config: RaftConfig,
    pub(crate) timer: ElectionTimer,
    commit_tx: watch::Sender<LogIndex>,
}

impl RaftCore {
    pub(crate) fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        config: RaftConfig,
        log: RaftLog,
    ) -> (Self, watch::Receiver<LogIndex>) {
        let (commit_tx, commit_rx) = watch::channel(LogIndex::ZERO);
        let timer = ElectionTimer::new(config.election_timeout_min, config.election_timeout_max);

        let core = Self {
            state: Arc::new(RwLock::new(NodeState::new(id, peers))),
            log,
            config,
            timer,
            commit_tx,
        };
        (core, commit_rx)
    }

    pub(crate) fn id(&self) -> NodeId {
        self.state.read().id
    }

    pub(crate) fn role(&self) -> RaftRole {
        self.state.read().role
    }

    pub(crate) fn election_deadline(&self) -> Instant {
        self.timer.deadline()
    }

    /// Adopt `term` if it is newer than ours, stepping down to follower
    ///
    /// Returns true when the term changed. Callers must hold the state lock
    /// for the whole check-then-act sequence that follows.
    pub(crate) fn observe_term(&mut self, state: &mut NodeState, term: Term) -> bool {
        if term <= state.current_term() {
            return false;
        }

        let was = state.role;
        info!(
            "Node {} saw {} (current {}), stepping down from {}",
            state.id,
            term,
            state.current_term(),
            was
        );
        state.become_follower(term, None);

        // a deposed leader never ran its timer; give the new leader a full
        // timeout before competing with it
        if was == RaftRole::Leader {
            self.timer.reset();
        }
        true
    }

    /// Raise the commit index and wake the apply pipeline
    ///
    /// Lower values are ignored; the commit index never moves backwards.
    pub(crate) fn set_commit_index(&self, state: &mut NodeState, index: LogIndex) {
        if index <= state.volatile.commit_index {
            return;
        }
        debug!(
            "Node {} commit index {} -> {}",
            state.id, state.volatile.commit_index, index
        );
        state.volatile.commit_index = index;
        self.commit_tx.send_replace(index);
    }
}

/// Build a [`NodeStatus`] from shared node state
pub(crate) fn snapshot_status(state: &RwLock<NodeState>, log: &RaftLog) -> NodeStatus {
    let state = state.read();
    let (last_log_index, last_log_term) = log.last_log_id();
    NodeStatus {
        id: state.id,
        role: state.role,
        term: state.current_term(),
        voted_for: state.persistent.voted_for,
        leader_id: state.leader_id,
        commit_index: state.volatile.commit_index,
        last_applied: state.volatile.last_applied,
        last_log_index,
        last_log_term,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::rpc::{AppendEntriesRequest, AppendEntriesResponse};
    use crate::types::Entry;

    impl RaftCore {
        pub(crate) fn status(&self) -> NodeStatus {
            snapshot_status(&self.state, &self.log)
        }
    }

    pub(crate) fn test_config() -> RaftConfig {
        RaftConfig {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            ..RaftConfig::default()
        }
    }

    /// Core for node `id` in a cluster of nodes `0..size`
    pub(crate) fn new_core(id: u64, size: u64) -> (RaftCore, watch::Receiver<LogIndex>) {
        let peers = (0..size).map(NodeId).collect();
        RaftCore::new(NodeId(id), peers, test_config(), RaftLog::new_memory())
    }

    /// Append `terms.len()` entries with the given terms starting at index 1
    pub(crate) fn seed_log(core: &RaftCore, terms: &[u64]) {
        let entries = terms
            .iter()
            .enumerate()
            .map(|(i, &t)| Entry::new(Term(t), LogIndex(i as u64 + 1), format!("t{t}i{}", i + 1)))
            .collect();
        core.log.append(entries).unwrap();
    }

    pub(crate) fn terms(core: &RaftCore) -> Vec<u64> {
        let last = core.log.last_index();
        core.log
            .get_range(LogIndex(1), last + 1)
            .unwrap()
            .iter()
            .map(|e| e.term.0)
            .collect()
    }

    /// Ship one append request from `leader` to `follower` and feed back the reply
    pub(crate) fn deliver_append(
        leader: &mut RaftCore,
        follower: &mut RaftCore,
    ) -> Option<AppendEntriesResponse> {
        let follower_id = follower.id();
        let (request, sent): (AppendEntriesRequest, _) = leader
            .append_requests()
            .into_iter()
            .find(|(peer, _, _)| *peer == follower_id)
            .map(|(_, req, sent)| (req, sent))?;
        let reply = follower.handle_append_entries(request);
        leader.handle_append_reply(follower_id, sent, reply.clone());
        Some(reply)
    }

    #[test]
    fn test_new_core_is_follower_at_term_zero() {
        let (core, commit_rx) = new_core(0, 3);
        let status = core.status();
        assert_eq!(status.role, RaftRole::Follower);
        assert_eq!(status.term, Term::ZERO);
        assert_eq!(status.voted_for, None);
        assert_eq!(status.commit_index, LogIndex::ZERO);
        assert_eq!(status.last_applied, LogIndex::ZERO);
        assert_eq!(status.last_log_index, LogIndex::ZERO);
        assert_eq!(*commit_rx.borrow(), LogIndex::ZERO);
    }

    #[test]
    fn test_observe_term_only_moves_forward() {
        let (mut core, _rx) = new_core(0, 3);
        let lock = Arc::clone(&core.state);
        let mut state = lock.write();
        state.become_candidate();

        assert!(!core.observe_term(&mut state, Term(1)));
        assert_eq!(state.role, RaftRole::Candidate);

        assert!(core.observe_term(&mut state, Term(3)));
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term(), Term(3));
        assert_eq!(state.persistent.voted_for, None);
    }

    #[test]
    fn test_commit_index_is_monotonic() {
        let (core, commit_rx) = new_core(0, 3);
        seed_log(&core, &[1, 1, 1]);
        let mut state = core.state.write();

        core.set_commit_index(&mut state, LogIndex(2));
        core.set_commit_index(&mut state, LogIndex(1));
        assert_eq!(state.volatile.commit_index, LogIndex(2));
        assert_eq!(*commit_rx.borrow(), LogIndex(2));
    }

    #[test]
    fn test_timer_deadline_within_bounds() {
        let before = Instant::now();
        let mut timer = ElectionTimer::new(Duration::from_millis(150), Duration::from_millis(300));
        for _ in 0..20 {
            timer.reset();
            let wait = timer.deadline() - before;
            assert!(wait >= Duration::from_millis(150));
            assert!(wait <= Duration::from_millis(300) + before.elapsed());
        }
    }
}
