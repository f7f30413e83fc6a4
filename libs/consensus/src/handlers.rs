//! Inbound RPC handlers
//!
//! These are the only paths a peer's message drives. Each handler holds the
//! state lock from the term check to the reply.

use crate::raft::RaftCore;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::state::RaftRole;
use crate::types::{Entry, LogIndex};
use crate::{RaftError, Result};

use std::sync::Arc;
use tracing::{debug, error, info, warn};

impl RaftCore {
    /// Handle RequestVote RPC
    pub(crate) fn handle_request_vote(&mut self, req: RequestVoteRequest) -> RequestVoteResponse {
        let lock = Arc::clone(&self.state);
        let mut state = lock.write();

        if req.term < state.current_term() {
            debug!(
                "Node {} rejecting vote for {}: stale {}",
                state.id, req.candidate_id, req.term
            );
            return RequestVoteResponse {
                term: state.current_term(),
                vote_granted: false,
            };
        }

        self.observe_term(&mut state, req.term);

        // Grant vote if:
        // 1. We haven't voted for anyone else this term
        // 2. Candidate's log is at least as up-to-date as ours
        let free_to_vote = state
            .persistent
            .voted_for
            .map_or(true, |v| v == req.candidate_id);
        let vote_granted =
            free_to_vote && self.log.is_up_to_date(req.last_log_index, req.last_log_term);

        if vote_granted {
            state.persistent.voted_for = Some(req.candidate_id);
            self.timer.reset();
            debug!(
                "Node {} granted vote to {} for term {}",
                state.id, req.candidate_id, req.term
            );
        }

        RequestVoteResponse {
            term: state.current_term(),
            vote_granted,
        }
    }

    /// Handle AppendEntries RPC
    pub(crate) fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let lock = Arc::clone(&self.state);
        let mut state = lock.write();

        // Reject if term is old
        if req.term < state.current_term() {
            debug!(
                "Node {} rejecting append from {}: stale {}",
                state.id, req.leader_id, req.term
            );
            return AppendEntriesResponse::rejected(state.current_term());
        }

        self.observe_term(&mut state, req.term);
        let term = state.current_term();

        match state.role {
            RaftRole::Leader => {
                error!(
                    "Node {} got AppendEntries from {} while leading {}",
                    state.id, req.leader_id, term
                );
                return AppendEntriesResponse::rejected(term);
            }
            RaftRole::Candidate => {
                info!(
                    "Node {} found leader {} for {}, abandoning candidacy",
                    state.id, req.leader_id, term
                );
                state.become_follower(term, Some(req.leader_id));
            }
            RaftRole::Follower => {}
        }

        // Valid leader heartbeat
        self.timer.reset();
        state.leader_id = Some(req.leader_id);

        // Check if our log contains an entry at prev_log_index with matching term
        match self.log.get_term(req.prev_log_index) {
            Ok(Some(prev_term)) if prev_term == req.prev_log_term => {}
            Ok(Some(_)) => {
                let conflict_index = self.log.first_index_of_term_at(req.prev_log_index).ok();
                debug!(
                    "Node {} term mismatch at {}, hinting {:?}",
                    state.id, req.prev_log_index, conflict_index
                );
                return AppendEntriesResponse {
                    term,
                    success: false,
                    conflict_index,
                };
            }
            Ok(None) => {
                let conflict_index = self.log.last_index() + 1;
                debug!(
                    "Node {} missing {}, hinting {}",
                    state.id, req.prev_log_index, conflict_index
                );
                return AppendEntriesResponse {
                    term,
                    success: false,
                    conflict_index: Some(conflict_index),
                };
            }
            Err(e) => {
                warn!("Node {} failed to read log: {}", state.id, e);
                return AppendEntriesResponse::rejected(term);
            }
        }

        if let Err(e) = self.merge_entries(&req, state.volatile.commit_index) {
            warn!(
                "Node {} failed to store entries from {}: {}",
                state.id, req.leader_id, e
            );
            return AppendEntriesResponse::rejected(term);
        }

        if req.leader_commit > state.volatile.commit_index {
            let last_new_index = req.last_index();
            self.set_commit_index(&mut state, req.leader_commit.min(last_new_index));
        }

        AppendEntriesResponse {
            term,
            success: true,
            conflict_index: None,
        }
    }

    /// Reconcile the log with entries that follow a verified `prev_log_index`
    ///
    /// Entries we already hold with the same term are skipped, so redelivery
    /// of an old request never shortens the log. The first conflicting entry
    /// truncates our suffix and the rest of the request replaces it.
    fn merge_entries(&self, req: &AppendEntriesRequest, commit_index: LogIndex) -> Result<()> {
        for (offset, incoming) in req.entries.iter().enumerate() {
            let index = req.prev_log_index + 1 + offset as u64;

            match self.log.get_term(index)? {
                Some(existing) if existing == incoming.term => continue,
                Some(existing) => {
                    if index <= commit_index {
                        return Err(RaftError::Internal(format!(
                            "leader sent {} for committed {} holding {}",
                            incoming.term, index, existing
                        )));
                    }
                    debug!("Truncating log from {} ({} vs {})", index, existing, incoming.term);
                    self.log.truncate_from(index)?;
                }
                None => {}
            }

            self.log.append(restamp(&req.entries[offset..], index))?;
            break;
        }
        Ok(())
    }
}

/// Copy entries, numbering them consecutively from `first`
fn restamp(entries: &[Entry], first: LogIndex) -> Vec<Entry> {
    entries
        .iter()
        .enumerate()
        .map(|(i, e)| Entry::new(e.term, first + i as u64, e.command.clone()))
        .collect()
}
