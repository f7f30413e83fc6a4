//! Log replication and commit advancement (leader only)

use crate::raft::RaftCore;
use crate::rpc::{AppendEntriesRequest, AppendEntriesResponse};
use crate::state::{NodeState, RaftRole};
use crate::types::{Entry, LogIndex, NodeId, Proposal, Term};
use crate::{RaftError, Result};

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a reply acknowledges: the shape of the request it answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SentAppend {
    pub(crate) term: Term,
    pub(crate) prev_log_index: LogIndex,
    pub(crate) entries: u64,
}

impl RaftCore {
    /// Append a client command to the leader's log
    ///
    /// Returns as soon as the entry is in the local log; replication happens
    /// on the next round.
    pub(crate) fn propose(&mut self, command: Bytes) -> Result<Proposal> {
        let lock = Arc::clone(&self.state);
        let mut state = lock.write();

        if state.role != RaftRole::Leader {
            return Err(RaftError::NotLeader(state.leader_id));
        }

        let term = state.current_term();
        let index = self.log.last_index() + 1;
        self.log.append(vec![Entry::new(term, index, command)])?;
        debug!("Node {} appended {} in {}", state.id, index, term);

        // a single-node cluster is its own majority
        self.advance_commit_index(&mut state);

        Ok(Proposal { index, term })
    }

    /// Build one AppendEntries per peer from its replication progress
    pub(crate) fn append_requests(&self) -> Vec<(NodeId, AppendEntriesRequest, SentAppend)> {
        let state = self.state.read();
        let Some(progress) = state.leader_state.as_ref() else {
            return vec![];
        };
        if state.role != RaftRole::Leader {
            return vec![];
        }

        let term = state.current_term();
        let mut requests = Vec::with_capacity(progress.next_index.len());

        for &(peer, next_index) in &progress.next_index {
            let prev_log_index = next_index.prev();
            let built = self.log.get_term(prev_log_index).and_then(|prev_term| {
                let prev_log_term = prev_term.ok_or(RaftError::LogIndexOutOfRange(prev_log_index))?;
                let entries = self
                    .log
                    .entries_from(next_index, self.config.max_append_entries)?;
                Ok((prev_log_term, entries))
            });

            let (prev_log_term, entries) = match built {
                Ok(parts) => parts,
                Err(e) => {
                    warn!("Node {} cannot build append for {}: {}", state.id, peer, e);
                    continue;
                }
            };

            let sent = SentAppend {
                term,
                prev_log_index,
                entries: entries.len() as u64,
            };
            let request = AppendEntriesRequest {
                term,
                leader_id: state.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: state.volatile.commit_index,
            };
            requests.push((peer, request, sent));
        }

        requests
    }

    /// Apply a peer's AppendEntries reply to its replication progress
    pub(crate) fn handle_append_reply(
        &mut self,
        from: NodeId,
        sent: SentAppend,
        reply: AppendEntriesResponse,
    ) {
        let lock = Arc::clone(&self.state);
        let mut state = lock.write();

        if self.observe_term(&mut state, reply.term) {
            return;
        }
        if state.role != RaftRole::Leader || state.current_term() != sent.term {
            return;
        }

        let id = state.id;
        let Some(progress) = state.leader_state.as_mut() else {
            return;
        };
        let match_index = progress.get_match_index(from).unwrap_or_default();
        let next_index = progress.get_next_index(from).unwrap_or_default();

        if reply.success {
            // replies may arrive out of order; progress never moves backwards
            let matched = (sent.prev_log_index + sent.entries).max(match_index);
            progress.set_match_index(from, matched);
            progress.set_next_index(from, matched + 1);

            if matched > match_index {
                debug!("Node {} replicated up to {} on {}", id, matched, from);
                self.advance_commit_index(&mut state);
            }
            return;
        }

        // only the latest probe decides where to back off to
        if next_index != sent.prev_log_index + 1 {
            return;
        }

        let fallback = sent.prev_log_index;
        let retry_from = reply
            .conflict_index
            .map_or(fallback, |hint| hint.min(fallback))
            .max(match_index + 1)
            .max(LogIndex(1));
        progress.set_next_index(from, retry_from);
        debug!(
            "Node {} log mismatch on {}, next index {} -> {}",
            id, from, next_index, retry_from
        );
    }

    /// Commit the highest index a majority holds, if it is from our term
    ///
    /// Entries from earlier terms are only committed indirectly, once an
    /// entry of the current term above them reaches a majority.
    pub(crate) fn advance_commit_index(&self, state: &mut NodeState) {
        let Some(progress) = state.leader_state.as_ref() else {
            return;
        };

        let mut matched: Vec<LogIndex> = progress.match_index.iter().map(|&(_, i)| i).collect();
        matched.push(self.log.last_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let Some(&candidate) = matched.get(state.quorum() - 1) else {
            return;
        };
        if candidate <= state.volatile.commit_index {
            return;
        }

        match self.log.get_term(candidate) {
            Ok(Some(term)) if term == state.current_term() => {
                self.set_commit_index(state, candidate);
            }
            Ok(_) => {
                debug!(
                    "Node {} holding {} back: not from {}",
                    state.id,
                    candidate,
                    state.current_term()
                );
            }
            Err(e) => warn!("Node {} failed to read log: {}", state.id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::tests::{deliver_append, new_core, seed_log, terms};
    use crate::raft::RaftCore;
    use crate::rpc::RequestVoteResponse;

    /// Make `node` leader of its term with the votes of every other peer
    fn elect(node: &mut RaftCore) {
        let requests = node.start_election();
        for (peer, req) in requests {
            node.handle_vote_reply(
                peer,
                req.term,
                RequestVoteResponse {
                    term: req.term,
                    vote_granted: true,
                },
            );
        }
        assert_eq!(node.role(), RaftRole::Leader);
    }

    fn cluster(size: u64) -> Vec<RaftCore> {
        (0..size).map(|id| new_core(id, size).0).collect()
    }

    #[test]
    fn test_propose_requires_leadership() {
        let (mut follower, _rx) = new_core(1, 3);
        follower.handle_append_entries(AppendEntriesRequest::heartbeat(
            Term(1),
            NodeId(0),
            LogIndex::ZERO,
            Term::ZERO,
            LogIndex::ZERO,
        ));

        let err = follower.propose(Bytes::from_static(b"x")).unwrap_err();
        assert!(matches!(err, RaftError::NotLeader(Some(NodeId(0)))));
        assert_eq!(follower.log.last_index(), LogIndex::ZERO);
    }

    #[test]
    fn test_single_node_commits_on_propose() {
        let (mut node, rx) = new_core(0, 1);
        node.start_election();

        let proposal = node.propose(Bytes::from_static(b"x")).unwrap();
        assert_eq!(proposal, Proposal { index: LogIndex(1), term: Term(1) });
        assert_eq!(node.status().commit_index, LogIndex(1));
        assert_eq!(*rx.borrow(), LogIndex(1));
    }

    #[test]
    fn test_heartbeat_shape() {
        let mut nodes = cluster(3);
        elect(&mut nodes[0]);

        let requests = nodes[0].append_requests();
        assert_eq!(requests.len(), 2);
        for (_, req, sent) in &requests {
            assert!(req.is_heartbeat());
            assert_eq!(req.prev_log_index, LogIndex::ZERO);
            assert_eq!(req.prev_log_term, Term::ZERO);
            assert_eq!(sent.entries, 0);
        }
    }

    #[test]
    fn test_replicate_and_commit_in_three_node_cluster() {
        let mut nodes = cluster(3);
        elect(&mut nodes[0]);
        nodes[0].propose(Bytes::from_static(b"X")).unwrap();

        let (leader, rest) = nodes.split_at_mut(1);
        let reply = deliver_append(&mut leader[0], &mut rest[0]).unwrap();
        assert!(reply.success);

        // one follower + leader is a majority of three
        assert_eq!(leader[0].status().commit_index, LogIndex(1));
        {
            let state = leader[0].state.read();
            let progress = state.leader_state.as_ref().unwrap();
            assert_eq!(progress.get_match_index(NodeId(1)), Some(LogIndex(1)));
            assert_eq!(progress.get_next_index(NodeId(1)), Some(LogIndex(2)));
            assert_eq!(progress.get_match_index(NodeId(2)), Some(LogIndex::ZERO));
        }

        // the follower learns the commit on the next round
        deliver_append(&mut leader[0], &mut rest[0]).unwrap();
        deliver_append(&mut leader[0], &mut rest[1]).unwrap();
        for node in rest.iter() {
            assert_eq!(terms(node), vec![1]);
        }
        assert_eq!(rest[0].status().commit_index, LogIndex(1));
    }

    #[test]
    fn test_no_commit_without_majority() {
        let mut nodes = cluster(5);
        elect(&mut nodes[0]);
        nodes[0].propose(Bytes::from_static(b"X")).unwrap();

        let (leader, rest) = nodes.split_at_mut(1);
        deliver_append(&mut leader[0], &mut rest[0]).unwrap();
        assert_eq!(leader[0].status().commit_index, LogIndex::ZERO);

        deliver_append(&mut leader[0], &mut rest[1]).unwrap();
        assert_eq!(leader[0].status().commit_index, LogIndex(1));
    }

    #[test]
    fn test_backoff_repairs_divergent_follower() {
        let mut nodes = cluster(3);
        // follower 1 holds an uncommitted suffix from an abandoned term 2
        seed_log(&nodes[0], &[1, 1, 3, 3]);
        seed_log(&nodes[1], &[1, 1, 2, 2, 2]);
        for node in nodes.iter_mut() {
            node.handle_request_vote(crate::rpc::RequestVoteRequest {
                term: Term(3),
                candidate_id: NodeId(0),
                last_log_index: LogIndex(4),
                last_log_term: Term(3),
            });
        }
        elect(&mut nodes[0]);
        assert_eq!(nodes[0].status().term, Term(4));

        let (leader, rest) = nodes.split_at_mut(1);
        // first probe at prev=4 fails with a hint to the start of term 2
        let reply = deliver_append(&mut leader[0], &mut rest[0]).unwrap();
        assert!(!reply.success);
        assert_eq!(reply.conflict_index, Some(LogIndex(3)));
        {
            let state = leader[0].state.read();
            let progress = state.leader_state.as_ref().unwrap();
            assert_eq!(progress.get_next_index(NodeId(1)), Some(LogIndex(3)));
        }

        let reply = deliver_append(&mut leader[0], &mut rest[0]).unwrap();
        assert!(reply.success);
        assert_eq!(terms(&rest[0]), vec![1, 1, 3, 3]);
        // entries from term 3 replicated by a term 4 leader are not committed yet
        assert_eq!(leader[0].status().commit_index, LogIndex::ZERO);

        leader[0].propose(Bytes::from_static(b"now")).unwrap();
        deliver_append(&mut leader[0], &mut rest[0]).unwrap();
        assert_eq!(leader[0].status().commit_index, LogIndex(5));
    }

    #[test]
    fn test_single_entry_backoff_without_hint() {
        let mut nodes = cluster(3);
        seed_log(&nodes[0], &[1, 1, 1]);
        elect(&mut nodes[0]);

        let sent = SentAppend {
            term: Term(1),
            prev_log_index: LogIndex(3),
            entries: 0,
        };
        nodes[0].handle_append_reply(NodeId(1), sent, AppendEntriesResponse::rejected(Term(1)));

        let state = nodes[0].state.read();
        let progress = state.leader_state.as_ref().unwrap();
        assert_eq!(progress.get_next_index(NodeId(1)), Some(LogIndex(3)));
    }

    #[test]
    fn test_stale_failure_does_not_rewind() {
        let mut nodes = cluster(3);
        seed_log(&nodes[0], &[1, 1, 1]);
        elect(&mut nodes[0]);

        // progress already moved on to next=4; a failure for prev=1 is old news
        let old = SentAppend {
            term: Term(1),
            prev_log_index: LogIndex(1),
            entries: 0,
        };
        nodes[0].handle_append_reply(NodeId(1), old, AppendEntriesResponse::rejected(Term(1)));

        let state = nodes[0].state.read();
        let progress = state.leader_state.as_ref().unwrap();
        assert_eq!(progress.get_next_index(NodeId(1)), Some(LogIndex(4)));
    }

    #[test]
    fn test_out_of_order_success_keeps_highest_match() {
        let mut nodes = cluster(3);
        elect(&mut nodes[0]);
        for cmd in ["a", "b", "c"] {
            nodes[0].propose(Bytes::from(cmd)).unwrap();
        }

        let ok = AppendEntriesResponse {
            term: Term(1),
            success: true,
            conflict_index: None,
        };
        let long = SentAppend { term: Term(1), prev_log_index: LogIndex(0), entries: 3 };
        let short = SentAppend { term: Term(1), prev_log_index: LogIndex(0), entries: 1 };
        nodes[0].handle_append_reply(NodeId(1), long, ok.clone());
        nodes[0].handle_append_reply(NodeId(1), short, ok);

        let state = nodes[0].state.read();
        let progress = state.leader_state.as_ref().unwrap();
        assert_eq!(progress.get_match_index(NodeId(1)), Some(LogIndex(3)));
        assert_eq!(progress.get_next_index(NodeId(1)), Some(LogIndex(4)));
        assert_eq!(state.volatile.commit_index, LogIndex(3));
    }

    #[test]
    fn test_higher_term_reply_deposes_leader() {
        let mut nodes = cluster(3);
        elect(&mut nodes[0]);

        let sent = SentAppend { term: Term(1), prev_log_index: LogIndex(0), entries: 0 };
        nodes[0].handle_append_reply(NodeId(2), sent, AppendEntriesResponse::rejected(Term(5)));

        let status = nodes[0].status();
        assert_eq!(status.role, RaftRole::Follower);
        assert_eq!(status.term, Term(5));
        assert!(nodes[0].append_requests().is_empty());
        assert!(nodes[0].propose(Bytes::from_static(b"late")).is_err());
    }
}
