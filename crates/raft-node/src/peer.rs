//! # peer
//!
//! why: give a service one handle to a running raft peer
//! relations: owns the RaftNode behind one mutex; timer, replication and apply tasks share it
//! what: Peer (spawn/start/get_state/kill/status), ApplyMsg, PeerStatus, the RaftHandler impl
//!
//! Lock discipline: `Shared::state` is a parking_lot mutex and is never held
//! across an `.await`. Anything that changed term, vote or log is persisted
//! while the lock is still held, before a reply or an outbound RPC can
//! reflect it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, NodeId, NodeState, PersistentState, RaftConfig,
    RaftError, RaftNode, RequestVoteArgs, RequestVoteReply, Result,
};
use raft_storage::Storage;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::transport::{RaftClient, RaftHandler};
use crate::{apply, election};

/// A committed command handed to the service, in log order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyMsg {
    pub command_valid: bool,
    pub command: Vec<u8>,
    pub command_index: u64,
}

/// Point-in-time view of a peer, for consumers and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub id: NodeId,
    pub role: NodeState,
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

pub(crate) struct PeerState {
    pub(crate) node: RaftNode,
    pub(crate) election_deadline: Instant,
}

pub(crate) struct Shared {
    pub(crate) id: NodeId,
    pub(crate) config: RaftConfig,
    /// every other member; never contains `id`
    pub(crate) clients: BTreeMap<NodeId, Arc<dyn RaftClient>>,
    storage: Arc<dyn Storage>,
    pub(crate) state: Mutex<PeerState>,
    dead: AtomicBool,
    pub(crate) shutdown: CancellationToken,
    /// election deadline moved; the timer must re-read it
    pub(crate) timer_reset: Notify,
    /// commit index moved past last_applied
    pub(crate) apply_ready: Notify,
    /// new entries to push to followers
    pub(crate) replicate: Notify,
}

impl Shared {
    pub(crate) fn killed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub(crate) fn kill(&self) {
        if !self.dead.swap(true, Ordering::SeqCst) {
            info!(node = self.id, "peer killed");
        }
        self.shutdown.cancel();
    }

    /// Write term, vote and log if any of them changed. Must be called with
    /// the state lock held. A failed write kills the peer.
    pub(crate) fn persist(&self, node: &mut RaftNode) -> Result<()> {
        if !node.take_persist_pending() {
            return Ok(());
        }
        let written = node
            .encode_persistent()
            .and_then(|bytes| self.storage.save(&bytes, &[]).map_err(RaftError::Storage));
        if let Err(e) = &written {
            error!(node = self.id, term = node.current_term, error = %e, "failed to persist raft state, stopping peer");
            self.kill();
        }
        written
    }

    /// Push the election deadline one fresh random timeout into the future.
    pub(crate) fn reset_election_timer(&self, state: &mut PeerState) {
        state.election_deadline = Instant::now() + self.config.random_election_timeout();
        self.timer_reset.notify_one();
    }

    /// Log a role or term change made by a handler.
    pub(crate) fn note_transition(&self, before: (NodeState, u64), node: &RaftNode) {
        let (role, term) = before;
        if node.state != role {
            info!(
                node = self.id,
                term = node.current_term,
                from = ?role,
                to = ?node.state,
                "role changed"
            );
        } else if node.current_term != term {
            debug!(node = self.id, term = node.current_term, "adopted newer term");
        }
    }

    fn wake_applier_if_needed(&self, node: &RaftNode) {
        if node.commit_index > node.last_applied {
            self.apply_ready.notify_one();
        }
    }
}

/// Handle to a running peer. Clones share the same peer.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<Shared>,
}

impl Peer {
    /// Restore (or initialize) persistent state and start the background
    /// tasks. Must be called from within a tokio runtime.
    ///
    /// `clients` maps every other member to a transport client; an entry for
    /// `id` itself is ignored. Committed commands arrive on the returned
    /// receiver in index order.
    pub fn spawn(
        id: NodeId,
        config: RaftConfig,
        mut clients: BTreeMap<NodeId, Arc<dyn RaftClient>>,
        storage: Arc<dyn Storage>,
    ) -> Result<(Self, mpsc::Receiver<ApplyMsg>)> {
        config.validate()?;
        clients.remove(&id);

        let cluster: Vec<NodeId> = clients.keys().copied().chain(std::iter::once(id)).collect();
        let mut node = RaftNode::with_config(id, cluster, config.clone());

        let (state, _snapshot) = storage.read()?;
        match PersistentState::decode(&state)? {
            Some(persisted) => {
                info!(
                    node = id,
                    term = persisted.current_term,
                    voted_for = ?persisted.voted_for,
                    last_log_index = persisted.log.last_index(),
                    "restored persistent state"
                );
                node.restore(persisted);
            }
            // a fresh peer persists its sentinel log before serving anything
            None => node.mark_persist_pending(),
        }
        if node.take_persist_pending() {
            storage.save(&node.encode_persistent()?, &[])?;
        }

        let (apply_tx, apply_rx) = mpsc::channel(config.apply_buffer);
        let election_deadline = Instant::now() + config.random_election_timeout();
        let peers = clients.len();
        let shared = Arc::new(Shared {
            id,
            config,
            clients,
            storage,
            state: Mutex::new(PeerState {
                node,
                election_deadline,
            }),
            dead: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            timer_reset: Notify::new(),
            apply_ready: Notify::new(),
            replicate: Notify::new(),
        });

        tokio::spawn(election::run_timer(Arc::clone(&shared)));
        tokio::spawn(apply::run_applier(Arc::clone(&shared), apply_tx));
        info!(node = id, peers, "peer started");

        Ok((Self { inner: shared }, apply_rx))
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Propose `command` for the log.
    ///
    /// Returns `(index, term, is_leader)` right away, without waiting for
    /// the entry to commit. A follower or killed peer answers with its last
    /// index and `is_leader = false` and changes nothing. The error arm only
    /// carries a persistence failure, after which the peer is dead.
    pub fn start(&self, command: Vec<u8>) -> Result<(u64, u64, bool)> {
        let shared = &self.inner;
        let mut st = shared.state.lock();
        if shared.killed() {
            return Ok((st.node.last_log_index(), st.node.current_term, false));
        }

        let (index, term, is_leader) = st.node.propose(command);
        if !is_leader {
            return Ok((index, term, false));
        }
        shared.persist(&mut st.node)?;
        if shared.config.debug {
            debug!(node = shared.id, term, index, "appended client command");
        }
        shared.wake_applier_if_needed(&st.node);
        drop(st);

        shared.replicate.notify_waiters();
        Ok((index, term, true))
    }

    /// `(current_term, is_leader)`. A killed peer never reports leadership.
    pub fn get_state(&self) -> (u64, bool) {
        let st = self.inner.state.lock();
        (st.node.current_term, st.node.is_leader() && !self.inner.killed())
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.inner.state.lock().node.leader_id
    }

    pub fn status(&self) -> PeerStatus {
        let st = self.inner.state.lock();
        let node = &st.node;
        PeerStatus {
            id: node.id,
            role: node.state,
            term: node.current_term,
            voted_for: node.voted_for,
            leader_id: node.leader_id,
            commit_index: node.commit_index,
            last_applied: node.last_applied,
            last_log_index: node.last_log_index(),
            last_log_term: node.last_log_term(),
        }
    }

    /// Stop the peer. Background tasks exit at their next check; handlers
    /// already running finish. Calling it again does nothing.
    pub fn kill(&self) {
        self.inner.kill();
    }

    pub fn killed(&self) -> bool {
        self.inner.killed()
    }
}

impl RaftHandler for Peer {
    fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        let shared = &self.inner;
        if shared.killed() {
            return Err(RaftError::Killed(shared.id));
        }

        let mut st = shared.state.lock();
        let before = (st.node.state, st.node.current_term);
        let (reply, reset_timer) = st.node.handle_vote_request(&args);
        shared.persist(&mut st.node)?;
        if reset_timer {
            shared.reset_election_timer(&mut st);
        }
        shared.note_transition(before, &st.node);

        if shared.config.debug {
            debug!(
                node = shared.id,
                term = reply.term,
                candidate = args.candidate_id,
                granted = reply.vote_granted,
                "answered RequestVote"
            );
        }
        Ok(reply)
    }

    fn append_entries(&self, args: AppendEntriesArgs) -> Result<AppendEntriesReply> {
        let shared = &self.inner;
        if shared.killed() {
            return Err(RaftError::Killed(shared.id));
        }

        let leader = args.leader_id;
        let sent = args.entries.len();
        let mut st = shared.state.lock();
        let before = (st.node.state, st.node.current_term);
        let (reply, reset_timer) = st.node.handle_append_entries(args);
        shared.persist(&mut st.node)?;
        if reset_timer {
            shared.reset_election_timer(&mut st);
        }
        shared.note_transition(before, &st.node);
        shared.wake_applier_if_needed(&st.node);

        if shared.config.debug {
            debug!(
                node = shared.id,
                term = reply.term,
                leader,
                entries = sent,
                success = reply.success,
                commit_index = st.node.commit_index,
                "answered AppendEntries"
            );
        }
        Ok(reply)
    }
}
