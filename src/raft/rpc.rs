//! RPC message types and the follower-side handlers.
//!
//! Handlers take the state lock's contents by `&mut` and do no I/O other
//! than persistence, so the node can run them inside its critical section
//! and reply after the disk write completes.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::raft::log::LogEntry;
use crate::raft::state::{RaftState, StagedSnapshot};
use crate::raft::{LogIndex, NodeId, Term};
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
    /// On failure, the first index the leader should retry from.
    pub conflict_index: LogIndex,
    /// Term of the conflicting entry, if the mismatch was a term conflict
    /// rather than a missing entry.
    pub conflict_term: Option<Term>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: Term,
}

/// Handle an incoming RequestVote. Grants at most one vote per term, and
/// only to candidates whose log is at least as up-to-date as ours.
pub fn handle_request_vote(
    state: &mut RaftState,
    args: &RequestVoteArgs,
) -> Result<RequestVoteReply> {
    if args.term < state.current_term {
        debug!(
            node_id = state.id,
            candidate = args.candidate_id,
            term = args.term,
            current_term = state.current_term,
            "Rejecting vote request from stale term"
        );
        return Ok(RequestVoteReply {
            term: state.current_term,
            vote_granted: false,
        });
    }

    let mut changed = false;
    if args.term > state.current_term {
        state.become_follower(args.term);
        changed = true;
    }

    let can_vote = state.voted_for.is_none() || state.voted_for == Some(args.candidate_id);
    let granted = can_vote && state.is_log_up_to_date(args.last_log_index, args.last_log_term);

    if granted {
        state.voted_for = Some(args.candidate_id);
        changed = true;
        debug!(
            node_id = state.id,
            candidate = args.candidate_id,
            term = state.current_term,
            "Granting vote"
        );
    } else {
        debug!(
            node_id = state.id,
            candidate = args.candidate_id,
            term = state.current_term,
            voted_for = ?state.voted_for,
            "Refusing vote"
        );
    }

    if changed {
        state.persist()?;
    }

    Ok(RequestVoteReply {
        term: state.current_term,
        vote_granted: granted,
    })
}

/// Handle an incoming AppendEntries: consistency check, merge, and commit
/// advance. On rejection the reply carries a conflict hint so the leader
/// can back up by a term at a time instead of one entry per round trip.
pub fn handle_append_entries(
    state: &mut RaftState,
    args: &AppendEntriesArgs,
) -> Result<AppendEntriesReply> {
    if args.term < state.current_term {
        return Ok(AppendEntriesReply {
            term: state.current_term,
            success: false,
            conflict_index: 0,
            conflict_term: None,
        });
    }

    let mut changed = args.term > state.current_term;
    // A valid AppendEntries means its sender is the leader for this term;
    // a candidate with the same term steps down.
    state.become_follower(args.term);
    state.leader_id = Some(args.leader_id);

    // Consistency check against the entry at prev_log_index. An index the
    // snapshot already covers passes by construction.
    if args.prev_log_index > state.log.snapshot_index() {
        match state.log.term(args.prev_log_index) {
            None => {
                // Log too short: leader should resend from our end.
                let conflict_index = state.log.last_index() + 1;
                debug!(
                    node_id = state.id,
                    leader = args.leader_id,
                    prev_log_index = args.prev_log_index,
                    conflict_index,
                    "Append rejected, log too short"
                );
                if changed {
                    state.persist()?;
                }
                return Ok(AppendEntriesReply {
                    term: state.current_term,
                    success: false,
                    conflict_index,
                    conflict_term: None,
                });
            }
            Some(term) if term != args.prev_log_term => {
                // Term conflict: report the whole run of the bad term and
                // drop it so the leader's replacement lands cleanly.
                let conflict_index = state
                    .log
                    .first_index_of_term(term)
                    .unwrap_or(args.prev_log_index);
                debug!(
                    node_id = state.id,
                    leader = args.leader_id,
                    prev_log_index = args.prev_log_index,
                    conflict_term = term,
                    conflict_index,
                    "Append rejected, term mismatch"
                );
                state.log.truncate_from(args.prev_log_index);
                state.persist()?;
                return Ok(AppendEntriesReply {
                    term: state.current_term,
                    success: false,
                    conflict_index,
                    conflict_term: Some(term),
                });
            }
            Some(_) => {}
        }
    }

    if !args.entries.is_empty() {
        state.log.merge(args.entries.clone());
        changed = true;
    }
    if changed {
        state.persist()?;
    }

    // Only trust leader_commit up to what this request actually confirmed.
    let last_new = if args.entries.is_empty() {
        args.prev_log_index.max(state.log.snapshot_index())
    } else {
        args.entries.last().map(|e| e.index).unwrap_or(0)
    };
    if args.leader_commit > state.commit_index {
        state.commit_index = args.leader_commit.min(last_new).max(state.commit_index);
    }

    Ok(AppendEntriesReply {
        term: state.current_term,
        success: true,
        conflict_index: 0,
        conflict_term: None,
    })
}

/// Handle an incoming InstallSnapshot. The snapshot is staged, not applied:
/// the state machine learns about it through the apply channel and decides
/// via `cond_install_snapshot` whether to switch over.
pub fn handle_install_snapshot(
    state: &mut RaftState,
    args: &InstallSnapshotArgs,
) -> Result<InstallSnapshotReply> {
    if args.term < state.current_term {
        return Ok(InstallSnapshotReply {
            term: state.current_term,
        });
    }

    let changed = args.term > state.current_term;
    state.become_follower(args.term);
    state.leader_id = Some(args.leader_id);
    if changed {
        state.persist()?;
    }

    if args.last_included_index <= state.commit_index {
        debug!(
            node_id = state.id,
            last_included_index = args.last_included_index,
            commit_index = state.commit_index,
            "Ignoring snapshot behind commit index"
        );
        return Ok(InstallSnapshotReply {
            term: state.current_term,
        });
    }

    debug!(
        node_id = state.id,
        leader = args.leader_id,
        last_included_index = args.last_included_index,
        last_included_term = args.last_included_term,
        "Staging snapshot for state machine"
    );
    state.pending_snapshot = Some(StagedSnapshot {
        last_included_index: args.last_included_index,
        last_included_term: args.last_included_term,
        data: args.data.clone(),
    });

    Ok(InstallSnapshotReply {
        term: state.current_term,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::state::RaftRole;
    use crate::storage::MemoryStorage;

    fn fresh_state(id: NodeId, peers: Vec<NodeId>) -> RaftState {
        RaftState::restore(id, peers, Box::new(MemoryStorage::new())).unwrap()
    }

    fn entry(index: LogIndex, term: Term) -> LogEntry {
        LogEntry::new(index, term, format!("cmd{}", index).into_bytes())
    }

    fn append_args(term: Term, prev: (LogIndex, Term), entries: Vec<LogEntry>) -> AppendEntriesArgs {
        AppendEntriesArgs {
            term,
            leader_id: 9,
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries,
            leader_commit: 0,
        }
    }

    #[test]
    fn vote_granted_for_up_to_date_candidate() {
        let mut state = fresh_state(1, vec![2, 3]);
        let reply = handle_request_vote(
            &mut state,
            &RequestVoteArgs {
                term: 1,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            },
        )
        .unwrap();

        assert!(reply.vote_granted);
        assert_eq!(state.voted_for, Some(2));
        assert_eq!(state.current_term, 1);
    }

    #[test]
    fn vote_rejected_for_stale_term() {
        let mut state = fresh_state(1, vec![2, 3]);
        state.current_term = 5;

        let reply = handle_request_vote(
            &mut state,
            &RequestVoteArgs {
                term: 3,
                candidate_id: 2,
                last_log_index: 10,
                last_log_term: 3,
            },
        )
        .unwrap();

        assert!(!reply.vote_granted);
        assert_eq!(reply.term, 5);
    }

    #[test]
    fn one_vote_per_term() {
        let mut state = fresh_state(1, vec![2, 3]);

        let first = handle_request_vote(
            &mut state,
            &RequestVoteArgs {
                term: 1,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            },
        )
        .unwrap();
        let second = handle_request_vote(
            &mut state,
            &RequestVoteArgs {
                term: 1,
                candidate_id: 3,
                last_log_index: 0,
                last_log_term: 0,
            },
        )
        .unwrap();

        assert!(first.vote_granted);
        assert!(!second.vote_granted);
        assert_eq!(state.voted_for, Some(2));
    }

    #[test]
    fn repeat_vote_for_same_candidate_is_granted() {
        let mut state = fresh_state(1, vec![2, 3]);
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        };

        assert!(handle_request_vote(&mut state, &args).unwrap().vote_granted);
        assert!(handle_request_vote(&mut state, &args).unwrap().vote_granted);
    }

    #[test]
    fn vote_rejected_for_stale_log() {
        let mut state = fresh_state(1, vec![2, 3]);
        state.log.append_command(2, b"x".to_vec());
        state.current_term = 2;

        let reply = handle_request_vote(
            &mut state,
            &RequestVoteArgs {
                term: 3,
                candidate_id: 2,
                last_log_index: 5,
                last_log_term: 1,
            },
        )
        .unwrap();

        // Term adopted, vote withheld.
        assert!(!reply.vote_granted);
        assert_eq!(state.current_term, 3);
        assert_eq!(state.voted_for, None);
    }

    #[test]
    fn heartbeat_accepted_and_term_adopted() {
        let mut state = fresh_state(1, vec![2, 3]);
        state.become_candidate();

        let reply =
            handle_append_entries(&mut state, &append_args(1, (0, 0), Vec::new())).unwrap();

        assert!(reply.success);
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.leader_id, Some(9));
    }

    #[test]
    fn append_rejected_for_stale_term() {
        let mut state = fresh_state(1, vec![2, 3]);
        state.current_term = 5;

        let reply =
            handle_append_entries(&mut state, &append_args(3, (0, 0), vec![entry(1, 3)])).unwrap();

        assert!(!reply.success);
        assert_eq!(reply.term, 5);
    }

    #[test]
    fn append_short_log_reports_next_index() {
        let mut state = fresh_state(1, vec![2, 3]);
        state.log.append_command(1, b"a".to_vec());

        let reply =
            handle_append_entries(&mut state, &append_args(1, (5, 1), vec![entry(6, 1)])).unwrap();

        assert!(!reply.success);
        assert_eq!(reply.conflict_index, 2);
        assert_eq!(reply.conflict_term, None);
    }

    #[test]
    fn append_term_conflict_reports_first_of_term() {
        let mut state = fresh_state(1, vec![2, 3]);
        state.log.merge(vec![entry(1, 1), entry(2, 2), entry(3, 2)]);
        state.current_term = 3;

        let reply =
            handle_append_entries(&mut state, &append_args(3, (3, 3), vec![entry(4, 3)])).unwrap();

        assert!(!reply.success);
        assert_eq!(reply.conflict_term, Some(2));
        assert_eq!(reply.conflict_index, 2);
        // The conflicting suffix is gone.
        assert_eq!(state.log.last_index(), 2);
    }

    #[test]
    fn append_merges_and_commits() {
        let mut state = fresh_state(1, vec![2, 3]);

        let mut args = append_args(1, (0, 0), vec![entry(1, 1), entry(2, 1)]);
        args.leader_commit = 2;
        let reply = handle_append_entries(&mut state, &args).unwrap();

        assert!(reply.success);
        assert_eq!(state.log.last_index(), 2);
        assert_eq!(state.commit_index, 2);
    }

    #[test]
    fn commit_capped_by_confirmed_entries() {
        let mut state = fresh_state(1, vec![2, 3]);
        state.log.append_command(1, b"a".to_vec());

        // Heartbeat confirming only index 1; leader is further ahead.
        let mut args = append_args(1, (1, 1), Vec::new());
        args.leader_commit = 7;
        handle_append_entries(&mut state, &args).unwrap();

        assert_eq!(state.commit_index, 1);
    }

    #[test]
    fn stale_append_does_not_truncate() {
        let mut state = fresh_state(1, vec![2, 3]);
        state.log.merge(vec![entry(1, 1), entry(2, 1), entry(3, 1)]);

        // Delayed retransmission covering an already-held prefix.
        let reply =
            handle_append_entries(&mut state, &append_args(1, (0, 0), vec![entry(1, 1)])).unwrap();

        assert!(reply.success);
        assert_eq!(state.log.last_index(), 3);
    }

    #[test]
    fn snapshot_staged_when_ahead_of_commit() {
        let mut state = fresh_state(1, vec![2, 3]);

        let reply = handle_install_snapshot(
            &mut state,
            &InstallSnapshotArgs {
                term: 2,
                leader_id: 9,
                last_included_index: 10,
                last_included_term: 2,
                data: b"snap".to_vec(),
            },
        )
        .unwrap();

        assert_eq!(reply.term, 2);
        let staged = state.pending_snapshot.as_ref().unwrap();
        assert_eq!(staged.last_included_index, 10);
        assert_eq!(staged.data, b"snap");
    }

    #[test]
    fn snapshot_behind_commit_is_ignored() {
        let mut state = fresh_state(1, vec![2, 3]);
        state.commit_index = 10;

        handle_install_snapshot(
            &mut state,
            &InstallSnapshotArgs {
                term: 1,
                leader_id: 9,
                last_included_index: 5,
                last_included_term: 1,
                data: b"old".to_vec(),
            },
        )
        .unwrap();

        assert!(state.pending_snapshot.is_none());
    }

    #[test]
    fn snapshot_from_stale_term_is_ignored() {
        let mut state = fresh_state(1, vec![2, 3]);
        state.current_term = 5;

        let reply = handle_install_snapshot(
            &mut state,
            &InstallSnapshotArgs {
                term: 2,
                leader_id: 9,
                last_included_index: 10,
                last_included_term: 2,
                data: b"snap".to_vec(),
            },
        )
        .unwrap();

        assert_eq!(reply.term, 5);
        assert!(state.pending_snapshot.is_none());
    }
}
