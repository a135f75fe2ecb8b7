//! # election
//!
//! why: count votes for one election round without touching the node's own lock
//! relations: created by node.rs start_election, fed by handle_vote_response
//! what: VoteTally, VoteOutcome

use std::collections::BTreeSet;

use crate::message::NodeId;

/// Votes granted to a candidate during one term.
///
/// A tally belongs to exactly one election round; replies for an older
/// round can never be counted toward a newer one.
#[derive(Debug, Clone)]
pub struct VoteTally {
    term: u64,
    quorum: usize,
    granted: BTreeSet<NodeId>,
}

impl VoteTally {
    /// Start a tally that already holds the candidate's own vote.
    pub fn new(term: u64, quorum: usize, candidate: NodeId) -> Self {
        Self {
            term,
            quorum,
            granted: BTreeSet::from([candidate]),
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    /// Record a granted vote; duplicates from the same voter count once.
    pub fn record(&mut self, voter: NodeId) -> usize {
        self.granted.insert(voter);
        self.granted.len()
    }

    pub fn count(&self) -> usize {
        self.granted.len()
    }

    pub fn has_quorum(&self) -> bool {
        self.granted.len() >= self.quorum
    }
}

/// What a vote reply did to the candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// The reply carried a higher term; the node is now a follower
    SteppedDown,
    /// This reply completed a majority; the node is now leader
    Elected,
    /// Still collecting votes
    Pending,
    /// The reply belongs to an election this node is no longer running
    Stale,
}
