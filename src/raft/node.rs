//! The consensus node runtime: election loop, per-peer replication loops,
//! and the apply loop, all driven by tokio tasks over one shared state lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RaftConfig;
use crate::raft::rpc::{
    self, AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::timer::random_election_timeout;
use crate::raft::{LogIndex, NodeId, Term};
use crate::storage::Storage;
use crate::transport::RaftTransport;
use crate::{RaftError, Result};

/// A message delivered to the state machine over the apply channel.
/// Commands arrive in log order, each exactly once. A snapshot message asks
/// the service to restore from the snapshot and confirm through
/// [`RaftNode::cond_install_snapshot`].
#[derive(Debug, Clone)]
pub enum ApplyMsg {
    Command { index: LogIndex, command: Vec<u8> },
    Snapshot {
        index: LogIndex,
        term: Term,
        data: Vec<u8>,
    },
}

/// One member of a consensus cluster. Cheap to share; all methods take
/// `&self` and synchronize on the internal state lock.
pub struct RaftNode {
    id: NodeId,
    config: RaftConfig,
    state: Mutex<RaftState>,
    transport: Arc<dyn RaftTransport>,
    apply_tx: mpsc::Sender<ApplyMsg>,
    commit_tx: watch::Sender<LogIndex>,
    /// Wakes the apply loop when commits advance or a snapshot is staged.
    apply_notify: Notify,
    /// One wakeup handle per replication loop.
    replicate: HashMap<NodeId, Arc<Notify>>,
    /// When the election timer last restarted (vote granted, valid leader
    /// contact, or election start).
    last_reset: RwLock<Instant>,
    shutdown: CancellationToken,
}

impl RaftNode {
    /// Restore persistent state and launch the background loops. The node
    /// starts as a follower and runs until [`RaftNode::shutdown`].
    pub fn start_node(
        config: RaftConfig,
        transport: Arc<dyn RaftTransport>,
        storage: Box<dyn Storage>,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Result<Arc<Self>> {
        let state = RaftState::restore(config.node_id, config.peers.clone(), storage)?;
        let (commit_tx, _) = watch::channel(state.commit_index);

        let replicate = config
            .peers
            .iter()
            .map(|&peer| (peer, Arc::new(Notify::new())))
            .collect();

        let node = Arc::new(Self {
            id: config.node_id,
            config,
            state: Mutex::new(state),
            transport,
            apply_tx,
            commit_tx,
            apply_notify: Notify::new(),
            replicate,
            last_reset: RwLock::new(Instant::now()),
            shutdown: CancellationToken::new(),
        });

        info!(node_id = node.id, peers = ?node.config.peers, "Starting consensus node");

        tokio::spawn(Arc::clone(&node).run_election_loop());
        for &peer in &node.config.peers {
            tokio::spawn(Arc::clone(&node).run_replication_loop(peer));
        }
        tokio::spawn(Arc::clone(&node).run_apply_loop());

        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Stop all background loops. Idempotent.
    pub fn shutdown(&self) {
        info!(node_id = self.id, "Shutting down consensus node");
        self.shutdown.cancel();
    }

    /// Propose a command. Only the leader accepts; the entry is assigned an
    /// index and persisted before this returns, but commitment happens
    /// later through the apply channel.
    pub async fn start(&self, command: &[u8]) -> Result<(LogIndex, Term)> {
        if self.shutdown.is_cancelled() {
            return Err(RaftError::Stopped);
        }

        let (index, term, committed) = {
            let mut state = self.state.lock().await;
            if state.role != RaftRole::Leader {
                return Err(RaftError::NotLeader(state.leader_id));
            }
            let term = state.current_term;
            let index = state.log.append_command(term, command.to_vec());
            state.persist()?;
            debug!(node_id = self.id, index, term, "Accepted command");
            // A cluster of one commits on append.
            let committed = if state.advance_leader_commit() {
                Some(state.commit_index)
            } else {
                None
            };
            (index, term, committed)
        };

        if let Some(commit_index) = committed {
            self.signal_commit(commit_index);
        }
        self.wake_replicators();
        Ok((index, term))
    }

    /// Current term and whether this node believes it is the leader.
    pub async fn get_state(&self) -> (Term, bool) {
        let state = self.state.lock().await;
        (state.current_term, state.role == RaftRole::Leader)
    }

    pub async fn is_leader(&self) -> bool {
        self.get_state().await.1
    }

    /// Best guess at the current leader, for client redirection.
    pub async fn leader_hint(&self) -> Option<NodeId> {
        self.state.lock().await.leader_id
    }

    /// A watch over the highest committed index.
    pub fn subscribe_commits(&self) -> watch::Receiver<LogIndex> {
        self.commit_tx.subscribe()
    }

    /// Service-initiated compaction: the service has serialized its state
    /// through `index` and the log prefix can go.
    pub async fn snapshot(&self, index: LogIndex, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        if index <= state.log.snapshot_index() {
            return Ok(());
        }
        if index > state.last_applied {
            return Err(RaftError::InvalidSnapshotIndex {
                index,
                last_applied: state.last_applied,
            });
        }
        let term = match state.log.term(index) {
            Some(term) => term,
            None => {
                return Err(RaftError::InvalidSnapshotIndex {
                    index,
                    last_applied: state.last_applied,
                })
            }
        };

        state.log.compact_to(index, term);
        state.persist_with_snapshot(data)?;
        info!(node_id = self.id, index, term, "Compacted log to snapshot");
        Ok(())
    }

    /// The service's verdict on a snapshot delivered over the apply
    /// channel. Returns false if the node has committed past the snapshot
    /// in the meantime; the service must then discard it.
    pub async fn cond_install_snapshot(
        &self,
        last_included_term: Term,
        last_included_index: LogIndex,
        data: &[u8],
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        if last_included_index <= state.commit_index {
            debug!(
                node_id = self.id,
                last_included_index,
                commit_index = state.commit_index,
                "Refusing snapshot install behind commit index"
            );
            return Ok(false);
        }

        state
            .log
            .reset_to_snapshot(last_included_index, last_included_term);
        state.commit_index = last_included_index;
        state.last_applied = last_included_index;
        state.persist_with_snapshot(data)?;

        info!(
            node_id = self.id,
            last_included_index, last_included_term, "Installed snapshot"
        );
        self.signal_commit(last_included_index);
        Ok(true)
    }

    // -- inbound RPC entry points --

    pub async fn handle_request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        let mut state = self.state.lock().await;
        let term_adopted = args.term > state.current_term;
        let reply = rpc::handle_request_vote(&mut state, &args)?;
        // A grant or a term adoption both restart the timer; a refused
        // same-term request does not.
        if reply.vote_granted || term_adopted {
            self.reset_election_timer();
        }
        Ok(reply)
    }

    pub async fn handle_append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply> {
        let mut state = self.state.lock().await;
        let reply = rpc::handle_append_entries(&mut state, &args)?;
        if args.term >= reply.term {
            // Contact from a live leader, successful or not.
            self.reset_election_timer();
        }
        let commit_index = state.commit_index;
        drop(state);

        self.signal_commit(commit_index);
        Ok(reply)
    }

    pub async fn handle_install_snapshot(
        &self,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply> {
        let mut state = self.state.lock().await;
        let reply = rpc::handle_install_snapshot(&mut state, &args)?;
        let staged = state.pending_snapshot.is_some();
        if args.term >= reply.term {
            self.reset_election_timer();
        }
        drop(state);

        if staged {
            self.apply_notify.notify_one();
        }
        Ok(reply)
    }

    // -- election --

    async fn run_election_loop(self: Arc<Self>) {
        loop {
            let timeout = random_election_timeout(
                self.config.election_timeout_min_ms,
                self.config.election_timeout_max_ms,
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(node_id = self.id, "Election loop stopped");
                    return;
                }
                _ = sleep(timeout) => {}
            }

            // A reset during the sleep means the timer restarted; only a
            // full quiet interval triggers an election.
            let elapsed = self.last_reset.read().unwrap().elapsed();
            if elapsed < timeout {
                continue;
            }

            if self.state.lock().await.role == RaftRole::Leader {
                continue;
            }

            self.begin_election().await;
        }
    }

    async fn begin_election(self: &Arc<Self>) {
        self.reset_election_timer();

        let args = {
            let mut state = self.state.lock().await;
            state.become_candidate();
            if let Err(e) = state.persist() {
                error!(node_id = self.id, error = %e, "Failed to persist candidacy");
                return;
            }
            info!(
                node_id = self.id,
                term = state.current_term,
                "Election timeout, starting election"
            );

            // A single-node cluster elects itself on the spot.
            if state.votes_received >= state.majority() {
                state.become_leader();
                info!(node_id = self.id, term = state.current_term, "Became leader");
                return;
            }

            RequestVoteArgs {
                term: state.current_term,
                candidate_id: self.id,
                last_log_index: state.log.last_index(),
                last_log_term: state.log.last_term(),
            }
        };

        // Fan out in parallel; every reply funnels back through the state
        // lock, and whichever grant completes the majority promotes us.
        for &peer in &self.config.peers {
            let node = Arc::clone(self);
            let args = args.clone();
            tokio::spawn(async move {
                node.solicit_vote(peer, args).await;
            });
        }
    }

    async fn solicit_vote(self: Arc<Self>, peer: NodeId, args: RequestVoteArgs) {
        let Some(reply) = self.transport.request_vote(peer, args.clone()).await else {
            return;
        };

        let mut state = self.state.lock().await;
        if reply.term > state.current_term {
            debug!(
                node_id = self.id,
                peer,
                term = reply.term,
                "Vote reply from newer term, stepping down"
            );
            state.become_follower(reply.term);
            self.reset_election_timer();
            if let Err(e) = state.persist() {
                error!(node_id = self.id, error = %e, "Failed to persist term update");
            }
            return;
        }

        // Replies for an older candidacy no longer count.
        if state.role != RaftRole::Candidate || state.current_term != args.term {
            return;
        }

        if reply.vote_granted {
            state.votes_received += 1;
            debug!(
                node_id = self.id,
                peer,
                votes = state.votes_received,
                term = state.current_term,
                "Vote granted"
            );
            if state.votes_received >= state.majority() {
                state.become_leader();
                info!(node_id = self.id, term = state.current_term, "Became leader");
                drop(state);
                self.wake_replicators();
            }
        }
    }

    // -- replication --

    async fn run_replication_loop(self: Arc<Self>, peer: NodeId) {
        let heartbeat = Duration::from_millis(self.config.heartbeat_interval_ms);
        let notify = Arc::clone(&self.replicate[&peer]);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(node_id = self.id, peer, "Replication loop stopped");
                    return;
                }
                _ = notify.notified() => {}
                _ = sleep(heartbeat) => {}
            }

            self.replicate_to(peer).await;
        }
    }

    /// One round toward a peer: an AppendEntries (possibly an empty
    /// heartbeat), or an InstallSnapshot when the peer is so far behind
    /// that the needed entries are compacted away.
    async fn replicate_to(self: &Arc<Self>, peer: NodeId) {
        enum Payload {
            Entries(AppendEntriesArgs),
            Snapshot(InstallSnapshotArgs),
        }

        let payload = {
            let state = self.state.lock().await;
            if state.role != RaftRole::Leader {
                return;
            }
            let next = state.next_index.get(&peer).copied().unwrap_or(1);

            if next <= state.log.snapshot_index() {
                let data = match state.load_snapshot() {
                    Ok(Some(data)) => data,
                    Ok(None) => Vec::new(),
                    Err(e) => {
                        error!(node_id = self.id, peer, error = %e, "Failed to load snapshot");
                        return;
                    }
                };
                Payload::Snapshot(InstallSnapshotArgs {
                    term: state.current_term,
                    leader_id: self.id,
                    last_included_index: state.log.snapshot_index(),
                    last_included_term: state.log.snapshot_term(),
                    data,
                })
            } else {
                let prev_log_index = next - 1;
                // next > snapshot_index, so prev is covered by the marker
                // or a live entry.
                let prev_log_term = match state.log.term(prev_log_index) {
                    Some(term) => term,
                    None => return,
                };
                Payload::Entries(AppendEntriesArgs {
                    term: state.current_term,
                    leader_id: self.id,
                    prev_log_index,
                    prev_log_term,
                    entries: state
                        .log
                        .entries_from(next, self.config.max_entries_per_append),
                    leader_commit: state.commit_index,
                })
            }
        };

        match payload {
            Payload::Entries(args) => {
                let Some(reply) = self.transport.append_entries(peer, args.clone()).await else {
                    return;
                };
                self.on_append_reply(peer, &args, &reply).await;
            }
            Payload::Snapshot(args) => {
                let Some(reply) = self.transport.install_snapshot(peer, args.clone()).await
                else {
                    return;
                };
                self.on_snapshot_reply(peer, &args, &reply).await;
            }
        }
    }

    async fn on_append_reply(
        self: &Arc<Self>,
        peer: NodeId,
        args: &AppendEntriesArgs,
        reply: &AppendEntriesReply,
    ) {
        let mut state = self.state.lock().await;
        if reply.term > state.current_term {
            info!(
                node_id = self.id,
                peer,
                term = reply.term,
                "Peer has newer term, stepping down"
            );
            state.become_follower(reply.term);
            self.reset_election_timer();
            if let Err(e) = state.persist() {
                error!(node_id = self.id, error = %e, "Failed to persist term update");
            }
            return;
        }
        // The reply belongs to an earlier leadership; its bookkeeping is
        // stale.
        if state.role != RaftRole::Leader || state.current_term != args.term {
            return;
        }

        if reply.success {
            let matched = args.prev_log_index + args.entries.len() as u64;
            let match_entry = state.match_index.entry(peer).or_insert(0);
            if matched > *match_entry {
                *match_entry = matched;
            }
            state.next_index.insert(peer, matched + 1);

            if state.advance_leader_commit() {
                let commit_index = state.commit_index;
                debug!(node_id = self.id, commit_index, "Commit index advanced");
                drop(state);
                self.signal_commit(commit_index);
                // Followers learn the new commit index on the next round.
                self.wake_replicators();
            }
            return;
        }

        // Conflict hint: jump past the follower's run of the conflicting
        // term instead of probing one entry at a time.
        let next = match reply.conflict_term {
            Some(term) => state
                .log
                .last_index_of_term(term)
                .map(|index| index + 1)
                .unwrap_or(reply.conflict_index),
            None => reply.conflict_index,
        };
        debug!(
            node_id = self.id,
            peer,
            next_index = next,
            conflict_term = ?reply.conflict_term,
            "Append rejected, backing up"
        );
        state.next_index.insert(peer, next.max(1));
        drop(state);

        // Retry immediately with the corrected index.
        self.replicate[&peer].notify_one();
    }

    async fn on_snapshot_reply(
        self: &Arc<Self>,
        peer: NodeId,
        args: &InstallSnapshotArgs,
        reply: &InstallSnapshotReply,
    ) {
        let mut state = self.state.lock().await;
        if reply.term > state.current_term {
            state.become_follower(reply.term);
            self.reset_election_timer();
            if let Err(e) = state.persist() {
                error!(node_id = self.id, error = %e, "Failed to persist term update");
            }
            return;
        }
        if state.role != RaftRole::Leader || state.current_term != args.term {
            return;
        }

        debug!(
            node_id = self.id,
            peer,
            last_included_index = args.last_included_index,
            "Snapshot installed on peer"
        );
        let match_entry = state.match_index.entry(peer).or_insert(0);
        if args.last_included_index > *match_entry {
            *match_entry = args.last_included_index;
        }
        state.next_index.insert(peer, args.last_included_index + 1);
        drop(state);

        // Ship the entries after the snapshot without waiting a tick.
        self.replicate[&peer].notify_one();
    }

    // -- apply --

    async fn run_apply_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(node_id = self.id, "Apply loop stopped");
                    return;
                }
                _ = self.apply_notify.notified() => {}
            }

            if !self.drain_apply().await {
                return;
            }
        }
    }

    /// Deliver everything currently deliverable. Returns false when the
    /// apply channel is gone.
    async fn drain_apply(&self) -> bool {
        loop {
            // Take one message per lock hold; the channel send must not
            // happen under the lock.
            let msg = {
                let mut state = self.state.lock().await;

                if let Some(staged) = state.pending_snapshot.take() {
                    Some(ApplyMsg::Snapshot {
                        index: staged.last_included_index,
                        term: staged.last_included_term,
                        data: staged.data,
                    })
                } else if state.last_applied < state.commit_index {
                    let next = state.last_applied + 1;
                    match state.log.get(next) {
                        Some(entry) => {
                            let msg = ApplyMsg::Command {
                                index: next,
                                command: entry.command.clone(),
                            };
                            state.last_applied = next;
                            Some(msg)
                        }
                        None => {
                            // Compacted out from under us; a snapshot
                            // message will cover the gap.
                            warn!(
                                node_id = self.id,
                                index = next,
                                "Committed entry missing from log, awaiting snapshot"
                            );
                            None
                        }
                    }
                } else {
                    None
                }
            };

            let Some(msg) = msg else {
                return true;
            };
            if self.apply_tx.send(msg).await.is_err() {
                warn!(node_id = self.id, "Apply channel closed, stopping apply loop");
                return false;
            }
        }
    }

    // -- shared plumbing --

    fn reset_election_timer(&self) {
        *self.last_reset.write().unwrap() = Instant::now();
    }

    fn wake_replicators(&self) {
        for notify in self.replicate.values() {
            notify.notify_one();
        }
    }

    /// Publish a commit index and wake the apply loop. Monotonic; stale
    /// values are dropped.
    fn signal_commit(&self, commit_index: LogIndex) {
        let advanced = self.commit_tx.send_if_modified(|current| {
            if commit_index > *current {
                *current = commit_index;
                true
            } else {
                false
            }
        });
        if advanced {
            self.apply_notify.notify_one();
        }
    }
}
