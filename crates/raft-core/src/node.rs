//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management, election.rs for vote counting
//! what: NodeState enum, RaftNode struct, vote/append handlers, leader bookkeeping, commit rule
//!
//! Nothing here sleeps, spawns or touches the network. Every handler takes
//! the node from one consistent state to the next and reports what changed;
//! the runtime owns clocks, transport and durability. Handlers that change
//! term, vote or log raise a persist flag the runtime must honor before it
//! lets any reply leave.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::RaftConfig;
use crate::election::{VoteOutcome, VoteTally};
use crate::error::Result;
use crate::log::{Log, LogEntry};
use crate::message::{
    AppendEntriesArgs, AppendEntriesReply, NodeId, RequestVoteArgs, RequestVoteReply,
};
use crate::state::{PersistentState, PersistentStateRef};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// What an AppendEntries reply did on the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// The reply carried a higher term; the node is now a follower
    SteppedDown,
    /// The reply answers a request from an earlier term or role
    Stale,
    /// The follower stored the entries
    Replicated { commit_advanced: bool },
    /// The follower's log did not match; retry from `next_index`
    Backtracked { next_index: u64 },
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Every voting member, including this node
    pub cluster_nodes: Vec<NodeId>,
    pub config: RaftConfig,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<NodeId>,
    pub log: Log,
    /// Highest index known to be committed
    pub commit_index: u64,
    /// Highest index handed to the apply pipeline
    pub last_applied: u64,
    /// Last leader heard from in the current term
    pub leader_id: Option<NodeId>,
    /// Leader only: next index to send to each follower
    pub next_index: HashMap<NodeId, u64>,
    /// Leader only: highest index known replicated on each follower
    pub match_index: HashMap<NodeId, u64>,
    persist_pending: bool,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: NodeId, cluster_nodes: Vec<NodeId>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    pub fn with_config(id: NodeId, mut cluster_nodes: Vec<NodeId>, config: RaftConfig) -> Self {
        if !cluster_nodes.contains(&id) {
            cluster_nodes.push(id);
        }
        cluster_nodes.sort_unstable();
        cluster_nodes.dedup();
        Self {
            id,
            cluster_nodes,
            config,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            log: Log::new(),
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            persist_pending: false,
        }
    }

    // -- persistence --

    /// Replace term, vote and log with what was loaded from storage.
    pub fn restore(&mut self, persisted: PersistentState) {
        self.current_term = persisted.current_term;
        self.voted_for = persisted.voted_for;
        self.log = persisted.log;
        self.persist_pending = false;
    }

    pub fn persistent_state(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
        }
    }

    /// Encode term, vote and log without copying the log.
    pub fn encode_persistent(&self) -> Result<Vec<u8>> {
        PersistentStateRef {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: &self.log,
        }
        .encode()
    }

    /// Whether term, vote or log changed since the last call
    pub fn take_persist_pending(&mut self) -> bool {
        std::mem::take(&mut self.persist_pending)
    }

    /// Force the next `take_persist_pending` to report a change.
    pub fn mark_persist_pending(&mut self) {
        self.persist_pending = true;
    }

    // -- cluster helpers --

    /// Votes (or acks) needed for a strict majority, self included
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    /// Every member except this node
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.cluster_nodes.iter().copied().filter(move |&n| n != self.id)
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    /// A candidate's log is at least as up to date as ours: later last
    /// term wins, equal last terms compare by length.
    pub fn candidate_log_is_current(&self, last_log_term: u64, last_log_index: u64) -> bool {
        let our_term = self.log.last_term();
        if last_log_term != our_term {
            return last_log_term > our_term;
        }
        last_log_index >= self.log.last_index()
    }

    // -- state transitions --

    /// Step down to follower for `term`. The vote is only cleared when the
    /// term actually moves forward; it stays scoped to its own term.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.persist_pending = true;
        }
        self.state = NodeState::Follower;
    }

    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        let next = self.log.last_index() + 1;
        let peers: Vec<NodeId> = self.peers().collect();
        self.next_index = peers.iter().map(|&p| (p, next)).collect();
        self.match_index = peers.iter().map(|&p| (p, 0)).collect();
    }

    // -- election --

    /// Begin a new term as candidate, voting for ourselves.
    ///
    /// Returns the request to fan out and the tally for this round. A
    /// single-member cluster is leader as soon as this returns.
    pub fn start_election(&mut self) -> (RequestVoteArgs, VoteTally) {
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.persist_pending = true;

        let tally = VoteTally::new(self.current_term, self.quorum_size(), self.id);
        if tally.has_quorum() {
            self.become_leader();
        }

        let request = RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        (request, tally)
    }

    /// Handle an incoming RequestVote. The flag says whether the caller
    /// should push back its election deadline (only when a vote is granted).
    pub fn handle_vote_request(&mut self, args: &RequestVoteArgs) -> (RequestVoteReply, bool) {
        if args.term < self.current_term {
            return (self.vote_reply(false), false);
        }
        if args.term > self.current_term {
            self.become_follower(args.term);
        }

        let free_to_vote = self.voted_for.map_or(true, |v| v == args.candidate_id);
        if free_to_vote && self.candidate_log_is_current(args.last_log_term, args.last_log_index) {
            if self.voted_for != Some(args.candidate_id) {
                self.voted_for = Some(args.candidate_id);
                self.persist_pending = true;
            }
            return (self.vote_reply(true), true);
        }
        (self.vote_reply(false), false)
    }

    fn vote_reply(&self, vote_granted: bool) -> RequestVoteReply {
        RequestVoteReply {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Count a reply to one of our RequestVotes.
    pub fn handle_vote_response(
        &mut self,
        from: NodeId,
        reply: &RequestVoteReply,
        tally: &mut VoteTally,
    ) -> VoteOutcome {
        if reply.term > self.current_term {
            self.become_follower(reply.term);
            return VoteOutcome::SteppedDown;
        }
        if self.state != NodeState::Candidate || self.current_term != tally.term() {
            return VoteOutcome::Stale;
        }
        if !reply.vote_granted {
            return VoteOutcome::Pending;
        }
        tally.record(from);
        if tally.has_quorum() {
            self.become_leader();
            return VoteOutcome::Elected;
        }
        VoteOutcome::Pending
    }

    // -- client entry --

    /// Append a client command if we are leader.
    ///
    /// Returns `(index, term, is_leader)`. A non-leader reports its last
    /// index and term and leaves the log untouched.
    pub fn propose(&mut self, command: Vec<u8>) -> (u64, u64, bool) {
        if !self.is_leader() {
            return (self.log.last_index(), self.current_term, false);
        }
        let index = self.log.append(LogEntry::new(self.current_term, command));
        self.persist_pending = true;
        // a lone leader is its own majority
        self.advance_commit_index();
        (index, self.current_term, true)
    }

    // -- replication (leader side) --

    /// Build the AppendEntries for `peer`: everything from its next index on.
    pub fn append_entries_for(&self, peer: NodeId) -> Option<AppendEntriesArgs> {
        if !self.is_leader() || peer == self.id {
            return None;
        }
        let last = self.log.last_index();
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(last + 1)
            .clamp(1, last + 1);
        let prev_log_index = next - 1;
        Some(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries: self.log.entries_from(next),
            leader_commit: self.commit_index,
        })
    }

    /// Apply a follower's answer to the request we sent it.
    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        sent: &AppendEntriesArgs,
        reply: &AppendEntriesReply,
    ) -> ReplicationOutcome {
        if reply.term > self.current_term {
            self.become_follower(reply.term);
            return ReplicationOutcome::SteppedDown;
        }
        if !self.is_leader() || self.current_term != sent.term {
            return ReplicationOutcome::Stale;
        }

        if reply.success {
            let matched = self.match_index.entry(from).or_insert(0);
            *matched = (*matched).max(sent.last_index());
            let next = *matched + 1;
            self.next_index.insert(from, next);
            let commit_advanced = self.advance_commit_index();
            return ReplicationOutcome::Replicated { commit_advanced };
        }

        // one step back from what this request probed
        let next_index = sent.prev_log_index.max(1);
        self.next_index.insert(from, next_index);
        ReplicationOutcome::Backtracked { next_index }
    }

    /// Move `commit_index` to the highest index stored on a majority whose
    /// entry belongs to the current term. Returns whether it moved.
    pub fn advance_commit_index(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }
        let quorum = self.quorum_size();
        let mut n = self.log.last_index();
        while n > self.commit_index {
            // terms never decrease along the log, so older-term entries below
            // can only be committed indirectly through a current-term one
            if self.log.term_at(n) != Some(self.current_term) {
                break;
            }
            let replicas = 1 + self.match_index.values().filter(|&&m| m >= n).count();
            if replicas >= quorum {
                self.commit_index = n;
                return true;
            }
            n -= 1;
        }
        false
    }

    // -- replication (follower side) --

    /// Handle an incoming AppendEntries. The flag says whether the caller
    /// should push back its election deadline (any current-term leader).
    pub fn handle_append_entries(&mut self, args: AppendEntriesArgs) -> (AppendEntriesReply, bool) {
        if args.term < self.current_term {
            return (self.append_reply(false), false);
        }
        self.become_follower(args.term);
        self.leader_id = Some(args.leader_id);

        if !self.log.matches(args.prev_log_index, args.prev_log_term) {
            return (self.append_reply(false), true);
        }

        let last_new = args.last_index();
        if self.log.merge(args.prev_log_index, args.entries) {
            self.persist_pending = true;
        }
        let target = args.leader_commit.min(last_new);
        if target > self.commit_index {
            self.commit_index = target;
        }
        (self.append_reply(true), true)
    }

    fn append_reply(&self, success: bool) -> AppendEntriesReply {
        AppendEntriesReply {
            term: self.current_term,
            success,
        }
    }

    // -- apply pipeline --

    /// Committed entries not yet handed to the service, in index order.
    pub fn entries_to_apply(&self) -> Vec<(u64, LogEntry)> {
        (self.last_applied + 1..=self.commit_index)
            .filter_map(|i| self.log.get(i).map(|e| (i, e.clone())))
            .collect()
    }

    /// Record that `index` reached the service. Indices must arrive in order.
    pub fn mark_applied(&mut self, index: u64) {
        debug_assert_eq!(index, self.last_applied + 1, "entries applied out of order");
        if index > self.last_applied {
            self.last_applied = index;
        }
    }
}
