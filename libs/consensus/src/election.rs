//! Leader election
//!
//! The event loop calls [`RaftCore::start_election`] when the election
//! deadline passes and feeds every vote reply to
//! [`RaftCore::handle_vote_reply`].

use crate::raft::RaftCore;
use crate::rpc::{RequestVoteRequest, RequestVoteResponse};
use crate::state::RaftRole;
use crate::types::{NodeId, Term};

use std::sync::Arc;
use tracing::{debug, info};

impl RaftCore {
    /// Become a candidate for the next term and build the vote requests
    ///
    /// A single-node cluster wins on the spot and gets no requests back.
    pub(crate) fn start_election(&mut self) -> Vec<(NodeId, RequestVoteRequest)> {
        let lock = Arc::clone(&self.state);
        let mut state = lock.write();

        if state.role == RaftRole::Leader {
            return vec![];
        }

        state.become_candidate();
        self.timer.reset();

        let term = state.current_term();
        let (last_log_index, last_log_term) = self.log.last_log_id();
        info!("Node {} starting election for term {}", state.id, term);

        let cluster_size = state.cluster_size();
        let won = state
            .candidate_state
            .as_ref()
            .is_some_and(|c| c.has_majority(cluster_size));
        if won {
            state.become_leader(last_log_index);
            info!("Node {} is the only voter, leading term {}", state.id, term);
            return vec![];
        }

        let request = RequestVoteRequest {
            term,
            candidate_id: state.id,
            last_log_index,
            last_log_term,
        };

        state
            .other_peers()
            .into_iter()
            .map(|peer| (peer, request.clone()))
            .collect()
    }

    /// Tally a vote reply for the election held in `election_term`
    ///
    /// Returns true when this reply made the node leader.
    pub(crate) fn handle_vote_reply(
        &mut self,
        from: NodeId,
        election_term: Term,
        reply: RequestVoteResponse,
    ) -> bool {
        let lock = Arc::clone(&self.state);
        let mut state = lock.write();

        if self.observe_term(&mut state, reply.term) {
            return false;
        }

        if state.role != RaftRole::Candidate || state.current_term() != election_term {
            debug!(
                "Node {} ignoring vote from {} for abandoned election in {}",
                state.id, from, election_term
            );
            return false;
        }

        if !reply.vote_granted {
            debug!("Node {} denied vote by {} in {}", state.id, from, election_term);
            return false;
        }

        let id = state.id;
        let cluster_size = state.cluster_size();
        let Some(candidate) = state.candidate_state.as_mut() else {
            return false;
        };
        candidate.add_vote(from);
        let votes = candidate.votes_received.len() + 1;
        let won = candidate.has_majority(cluster_size);
        debug!("Node {} has {} votes in {}", id, votes, election_term);

        if !won {
            return false;
        }

        state.become_leader(self.log.last_index());
        info!(
            "Node {} won election for {} with {}/{} votes",
            id, election_term, votes, cluster_size
        );
        true
    }
}
