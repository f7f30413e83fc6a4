//! Apply pipeline
//!
//! One task per node hands committed entries to the consumer channel, in
//! index order, exactly once each. It reads entries under the log lock and
//! sends with no lock held, so a slow consumer stalls only this task.

use crate::log::RaftLog;
use crate::state::NodeState;
use crate::types::{ApplyMsg, LogIndex};

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Trait for state machines that consume the committed log
///
/// Implement this trait to build a replicated application on top of the
/// apply channel; see [`drive_state_machine`].
pub trait StateMachine: Send + Sync + 'static {
    /// Apply a committed command to the state machine
    ///
    /// This is called in log order for all committed commands
    fn apply(&mut self, index: LogIndex, command: &[u8]);
}

/// Apply every message from `apply_rx` to `state_machine` until the channel closes
pub async fn drive_state_machine<SM: StateMachine>(
    mut apply_rx: mpsc::Receiver<ApplyMsg>,
    state_machine: Arc<RwLock<SM>>,
) {
    while let Some(msg) = apply_rx.recv().await {
        if msg.command_valid {
            state_machine.write().apply(msg.command_index, &msg.command);
        }
    }
}

pub(crate) async fn run_apply_pipeline(
    state: Arc<RwLock<NodeState>>,
    log: RaftLog,
    mut commit_rx: watch::Receiver<LogIndex>,
    apply_tx: mpsc::Sender<ApplyMsg>,
    shutdown: CancellationToken,
) {
    let id = state.read().id;

    loop {
        let commit_index = *commit_rx.borrow_and_update();

        loop {
            let next = {
                let state = state.read();
                if state.volatile.last_applied >= commit_index {
                    break;
                }
                state.volatile.last_applied + 1
            };

            let entry = match log.get(next) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    error!("Node {} committed entry {} is missing", id, next);
                    return;
                }
                Err(e) => {
                    error!("Node {} failed to read committed entry {}: {}", id, next, e);
                    return;
                }
            };

            let msg = ApplyMsg {
                command_valid: true,
                command: entry.command,
                command_index: next,
            };

            tokio::select! {
                _ = shutdown.cancelled() => return,
                sent = apply_tx.send(msg) => {
                    if sent.is_err() {
                        warn!("Node {} apply consumer hung up at {}", id, next);
                        return;
                    }
                }
            }

            state.write().volatile.last_applied = next;
            debug!("Node {} applied {}", id, next);
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            changed = commit_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Entry, NodeId, Term};
    use bytes::Bytes;

    struct Recorder {
        seen: Vec<(LogIndex, Vec<u8>)>,
    }

    impl StateMachine for Recorder {
        fn apply(&mut self, index: LogIndex, command: &[u8]) {
            self.seen.push((index, command.to_vec()));
        }
    }

    fn fixture(commands: &[&'static str]) -> (Arc<RwLock<NodeState>>, RaftLog) {
        let state = Arc::new(RwLock::new(NodeState::new(NodeId(0), vec![NodeId(0)])));
        let log = RaftLog::new_memory();
        let entries = commands
            .iter()
            .enumerate()
            .map(|(i, c)| Entry::new(Term(1), LogIndex(i as u64 + 1), *c))
            .collect();
        log.append(entries).unwrap();
        (state, log)
    }

    #[tokio::test]
    async fn test_applies_in_order_once() {
        let (state, log) = fixture(&["a", "b", "c"]);
        let (commit_tx, commit_rx) = watch::channel(LogIndex::ZERO);
        let (apply_tx, mut apply_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_apply_pipeline(
            state.clone(),
            log,
            commit_rx,
            apply_tx,
            shutdown.clone(),
        ));

        commit_tx.send_replace(LogIndex(2));
        let first = apply_rx.recv().await.unwrap();
        let second = apply_rx.recv().await.unwrap();
        assert_eq!(first.command_index, LogIndex(1));
        assert_eq!(first.command, Bytes::from_static(b"a"));
        assert_eq!(second.command_index, LogIndex(2));
        assert!(first.command_valid && second.command_valid);

        commit_tx.send_replace(LogIndex(3));
        let third = apply_rx.recv().await.unwrap();
        assert_eq!(third.command_index, LogIndex(3));

        // nothing is delivered twice
        tokio::task::yield_now().await;
        assert!(apply_rx.try_recv().is_err());
        assert_eq!(state.read().volatile.last_applied, LogIndex(3));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stops_when_consumer_hangs_up() {
        let (state, log) = fixture(&["a"]);
        let (_commit_tx, commit_rx) = watch::channel(LogIndex(1));
        let (apply_tx, apply_rx) = mpsc::channel(1);
        drop(apply_rx);

        run_apply_pipeline(state.clone(), log, commit_rx, apply_tx, CancellationToken::new()).await;
        assert_eq!(state.read().volatile.last_applied, LogIndex::ZERO);
    }

    #[tokio::test]
    async fn test_drive_state_machine() {
        let (apply_tx, apply_rx) = mpsc::channel(4);
        let sm = Arc::new(RwLock::new(Recorder { seen: vec![] }));

        for i in 1..=3u64 {
            apply_tx
                .send(ApplyMsg {
                    command_valid: true,
                    command: Bytes::from(format!("cmd{i}")),
                    command_index: LogIndex(i),
                })
                .await
                .unwrap();
        }
        drop(apply_tx);

        drive_state_machine(apply_rx, sm.clone()).await;

        let seen = &sm.read().seen;
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], (LogIndex(3), b"cmd3".to_vec()));
    }
}
