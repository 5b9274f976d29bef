use std::collections::HashMap;
use std::io;

use crate::raft::log::RaftLog;
use crate::raft::{LogIndex, NodeId, Term};
use crate::storage::{HardState, Storage};

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// A snapshot received over InstallSnapshot, parked until the state machine
/// accepts it through `cond_install_snapshot`.
#[derive(Debug, Clone)]
pub struct StagedSnapshot {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub data: Vec<u8>,
}

/// All mutable consensus state for one node, guarded by a single lock owned
/// by the node. Every accessor holds the lock for the minimum critical
/// section and never blocks on network I/O while holding it.
///
/// # Safety invariants
///
/// - Election safety: at most one leader per term, enforced by the one-vote-
///   per-term rule (`voted_for`) plus the majority requirement.
/// - Log matching: the AppendEntries consistency check plus conflict
///   truncation keep logs identical up through any shared (index, term).
/// - Leader completeness: the up-to-date vote restriction plus committing
///   only current-term entries by counting.
/// - State machine safety: `last_applied` never passes `commit_index`, and
///   committed entries are never overwritten.
pub struct RaftState {
    pub id: NodeId,
    pub peers: Vec<NodeId>,

    // Persistent state
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: RaftLog,

    // Volatile state on all servers
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<NodeId, LogIndex>,
    pub match_index: HashMap<NodeId, LogIndex>,

    pub role: RaftRole,

    // Known leader (if any), so hosts can redirect clients
    pub leader_id: Option<NodeId>,

    // Votes received in the current election (for candidates)
    pub votes_received: usize,

    // Snapshot waiting for the state machine's verdict
    pub pending_snapshot: Option<StagedSnapshot>,

    storage: Box<dyn Storage>,
}

impl RaftState {
    /// Load persisted state (or initialize fresh) and start as a follower.
    pub fn restore(
        id: NodeId,
        peers: Vec<NodeId>,
        storage: Box<dyn Storage>,
    ) -> io::Result<Self> {
        let (current_term, voted_for, log) = match storage.load()? {
            Some(hard) => (
                hard.current_term,
                hard.voted_for,
                RaftLog::from_parts(hard.snapshot_index, hard.snapshot_term, hard.entries),
            ),
            None => (0, None, RaftLog::new()),
        };
        let baseline = log.snapshot_index();

        Ok(Self {
            id,
            peers,
            current_term,
            voted_for,
            log,
            commit_index: baseline,
            last_applied: baseline,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            role: RaftRole::Follower,
            leader_id: None,
            votes_received: 0,
            pending_snapshot: None,
            storage,
        })
    }

    /// Flush term, vote, and log to durable storage. Must complete before
    /// any reply or request that depends on the change leaves the node.
    pub fn persist(&mut self) -> io::Result<()> {
        let hard = self.hard_state();
        self.storage.save(&hard)
    }

    /// Flush state together with new snapshot bytes.
    pub fn persist_with_snapshot(&mut self, snapshot: &[u8]) -> io::Result<()> {
        let hard = self.hard_state();
        self.storage.save_with_snapshot(&hard, snapshot)
    }

    pub fn load_snapshot(&self) -> io::Result<Option<Vec<u8>>> {
        self.storage.load_snapshot()
    }

    fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            snapshot_index: self.log.snapshot_index(),
            snapshot_term: self.log.snapshot_term(),
            entries: self.log.entries().to_vec(),
        }
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Check if a candidate's log is at least as up-to-date as ours:
    /// higher last term wins, equal terms compare last index.
    pub fn is_log_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let our_last_term = self.log.last_term();
        let our_last_index = self.log.last_index();

        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    /// Transition to follower. The only path that adopts a new term.
    /// Adopting a newer term invalidates the leader hint; the new term's
    /// leader is unknown until it makes contact.
    pub fn become_follower(&mut self, term: Term) {
        debug_assert!(term >= self.current_term);
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        self.role = RaftRole::Follower;
        self.votes_received = 0;
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Transition to candidate: new term, vote for self.
    pub fn become_candidate(&mut self) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.votes_received = 1;
        self.leader_id = None;
    }

    /// Transition to leader; progress maps are rebuilt from scratch.
    pub fn become_leader(&mut self) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.id);

        let last_log_index = self.log.last_index();
        self.next_index.clear();
        self.match_index.clear();
        for &peer in &self.peers {
            self.next_index.insert(peer, last_log_index + 1);
            self.match_index.insert(peer, 0);
        }
    }

    /// Advance the leader's commit index to the highest entry replicated on
    /// a majority, provided that entry carries the current term. Entries
    /// from earlier terms commit only transitively. Returns true if the
    /// commit index moved.
    pub fn advance_leader_commit(&mut self) -> bool {
        if self.role != RaftRole::Leader {
            return false;
        }

        let mut match_indices: Vec<LogIndex> = self.match_index.values().copied().collect();
        match_indices.push(self.log.last_index()); // self counts
        match_indices.sort_unstable();

        // The value at this position is matched by a majority.
        let quorum_pos = match_indices.len() - self.majority();
        let candidate = match_indices[quorum_pos];

        if candidate > self.commit_index && self.log.term(candidate) == Some(self.current_term) {
            self.commit_index = candidate;
            return true;
        }
        false
    }
}
