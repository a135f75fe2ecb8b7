//! # comprehensive raft tests
//!
//! why: verify the raft state machine makes the right transition for every message
//! relations: tests raft-core only; the async runtime is covered in raft-node
//! what: election, voting, replication, commit rule, apply ordering, persistence

use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, LogEntry, NodeState, PersistentState, RaftConfig,
    RaftNode, ReplicationOutcome, RequestVoteArgs, RequestVoteReply, VoteOutcome,
};

fn vote_request(term: u64, candidate_id: u64, last_log_index: u64, last_log_term: u64) -> RequestVoteArgs {
    RequestVoteArgs {
        term,
        candidate_id,
        last_log_index,
        last_log_term,
    }
}

fn heartbeat(term: u64, leader_id: u64, prev_log_index: u64, prev_log_term: u64, leader_commit: u64) -> AppendEntriesArgs {
    AppendEntriesArgs {
        term,
        leader_id,
        prev_log_index,
        prev_log_term,
        entries: vec![],
        leader_commit,
    }
}

fn entry(term: u64, byte: u8) -> LogEntry {
    LogEntry::new(term, vec![byte])
}

/// Elect node 1 of a three-node cluster in term 1.
fn leader_of_three() -> RaftNode {
    let mut node = RaftNode::new(1, vec![1, 2, 3]);
    let (_, mut tally) = node.start_election();
    let outcome = node.handle_vote_response(
        2,
        &RequestVoteReply {
            term: 1,
            vote_granted: true,
        },
        &mut tally,
    );
    assert_eq!(outcome, VoteOutcome::Elected);
    node.take_persist_pending();
    node
}

fn ack(term: u64) -> AppendEntriesReply {
    AppendEntriesReply { term, success: true }
}

fn nack(term: u64) -> AppendEntriesReply {
    AppendEntriesReply { term, success: false }
}

// =============================================================================
// SECTION 1: INITIALIZATION TESTS
// =============================================================================

mod initialization {
    use super::*;

    #[test]
    fn new_node_starts_as_follower() {
        let node = RaftNode::new(1, vec![1, 2, 3]);
        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 0);
        assert_eq!(node.voted_for, None);
        assert!(node.log.is_empty());
        assert_eq!(node.commit_index, 0);
        assert_eq!(node.last_applied, 0);
        assert_eq!(node.leader_id, None);
    }

    #[test]
    fn node_knows_cluster_membership() {
        let node = RaftNode::new(2, vec![3, 1, 2]);
        assert_eq!(node.cluster_nodes, vec![1, 2, 3]);
        assert_eq!(node.peers().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn custom_config_is_applied() {
        let config = RaftConfig {
            election_timeout_min: 200,
            election_timeout_max: 400,
            heartbeat_interval: 100,
            ..RaftConfig::default()
        };
        let node = RaftNode::with_config(1, vec![1, 2, 3], config);
        assert_eq!(node.config.election_timeout_min, 200);
        assert_eq!(node.config.election_timeout_max, 400);
        assert_eq!(node.config.heartbeat_interval, 100);
    }
}

// =============================================================================
// SECTION 2: QUORUM CALCULATION TESTS
// =============================================================================

mod quorum {
    use super::*;

    #[test]
    fn quorum_for_odd_clusters() {
        assert_eq!(RaftNode::new(1, vec![1]).quorum_size(), 1);
        assert_eq!(RaftNode::new(1, vec![1, 2, 3]).quorum_size(), 2);
        assert_eq!(RaftNode::new(1, vec![1, 2, 3, 4, 5]).quorum_size(), 3);
        assert_eq!(RaftNode::new(1, vec![1, 2, 3, 4, 5, 6, 7]).quorum_size(), 4);
    }

    #[test]
    fn quorum_for_even_cluster_is_strict_majority() {
        assert_eq!(RaftNode::new(1, vec![1, 2, 3, 4]).quorum_size(), 3);
    }
}

// =============================================================================
// SECTION 3: ELECTION TESTS
// =============================================================================

mod election {
    use super::*;

    #[test]
    fn start_election_becomes_candidate() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);

        let (request, tally) = node.start_election();

        assert_eq!(node.state, NodeState::Candidate);
        assert_eq!(node.current_term, 1);
        assert_eq!(node.voted_for, Some(1));
        assert_eq!(tally.count(), 1);
        assert_eq!(request, vote_request(1, 1, 0, 0));
        assert!(node.take_persist_pending());
    }

    #[test]
    fn vote_request_includes_log_info() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.log.append(entry(1, 1));
        node.log.append(entry(2, 2));
        node.current_term = 2;

        let (request, _) = node.start_election();

        assert_eq!(request.term, 3);
        assert_eq!(request.last_log_index, 2);
        assert_eq!(request.last_log_term, 2);
    }

    #[test]
    fn majority_vote_wins_election() {
        let node = leader_of_three();
        assert_eq!(node.state, NodeState::Leader);
        assert_eq!(node.leader_id, Some(1));
    }

    #[test]
    fn single_node_cluster_elects_itself() {
        let mut node = RaftNode::new(7, vec![7]);
        node.start_election();
        assert!(node.is_leader());
    }

    #[test]
    fn single_vote_not_enough_in_five() {
        let mut node = RaftNode::new(1, vec![1, 2, 3, 4, 5]);
        let (_, mut tally) = node.start_election();

        let outcome = node.handle_vote_response(2, &RequestVoteReply { term: 1, vote_granted: true }, &mut tally);

        assert_eq!(outcome, VoteOutcome::Pending);
        assert_eq!(node.state, NodeState::Candidate);
    }

    #[test]
    fn duplicate_votes_count_once() {
        let mut node = RaftNode::new(1, vec![1, 2, 3, 4, 5]);
        let (_, mut tally) = node.start_election();
        let granted = RequestVoteReply { term: 1, vote_granted: true };

        node.handle_vote_response(2, &granted, &mut tally);
        let outcome = node.handle_vote_response(2, &granted, &mut tally);

        assert_eq!(outcome, VoteOutcome::Pending);
        assert_eq!(tally.count(), 2);
    }

    #[test]
    fn rejected_votes_dont_count() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        let (_, mut tally) = node.start_election();

        let outcome = node.handle_vote_response(2, &RequestVoteReply { term: 1, vote_granted: false }, &mut tally);

        assert_eq!(outcome, VoteOutcome::Pending);
        assert_eq!(tally.count(), 1);
        assert_eq!(node.state, NodeState::Candidate);
    }

    #[test]
    fn stale_vote_response_ignored() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        let (_, mut old_tally) = node.start_election(); // term 1
        node.start_election(); // term 2

        let outcome = node.handle_vote_response(2, &RequestVoteReply { term: 1, vote_granted: true }, &mut old_tally);

        assert_eq!(outcome, VoteOutcome::Stale);
        assert_eq!(node.state, NodeState::Candidate);
    }

    #[test]
    fn vote_response_with_higher_term_steps_down() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        let (_, mut tally) = node.start_election();

        let outcome = node.handle_vote_response(2, &RequestVoteReply { term: 5, vote_granted: false }, &mut tally);

        assert_eq!(outcome, VoteOutcome::SteppedDown);
        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 5);
        assert_eq!(node.voted_for, None);
    }

    #[test]
    fn late_vote_after_winning_is_stale() {
        let mut node = RaftNode::new(1, vec![1, 2, 3, 4, 5]);
        let (_, mut tally) = node.start_election();
        let granted = RequestVoteReply { term: 1, vote_granted: true };
        node.handle_vote_response(2, &granted, &mut tally);
        assert_eq!(node.handle_vote_response(3, &granted, &mut tally), VoteOutcome::Elected);

        assert_eq!(node.handle_vote_response(4, &granted, &mut tally), VoteOutcome::Stale);
        assert!(node.is_leader());
    }
}

// =============================================================================
// SECTION 4: VOTE REQUEST HANDLING TESTS
// =============================================================================

mod vote_requests {
    use super::*;

    #[test]
    fn grant_vote_to_valid_candidate() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);

        let (reply, should_reset) = node.handle_vote_request(&vote_request(1, 2, 0, 0));

        assert_eq!(reply, RequestVoteReply { term: 1, vote_granted: true });
        assert!(should_reset);
        assert_eq!(node.voted_for, Some(2));
        assert!(node.take_persist_pending());
    }

    #[test]
    fn reject_vote_for_lower_term() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.current_term = 5;

        let (reply, should_reset) = node.handle_vote_request(&vote_request(3, 2, 0, 0));

        assert_eq!(reply, RequestVoteReply { term: 5, vote_granted: false });
        assert!(!should_reset);
    }

    #[test]
    fn higher_term_request_clears_old_vote() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.current_term = 1;
        node.voted_for = Some(3);
        node.state = NodeState::Candidate;

        let (reply, _) = node.handle_vote_request(&vote_request(5, 2, 0, 0));

        assert!(reply.vote_granted);
        assert_eq!(node.current_term, 5);
        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.voted_for, Some(2));
    }

    #[test]
    fn reject_vote_if_already_voted() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.handle_vote_request(&vote_request(1, 2, 0, 0));

        let (reply, should_reset) = node.handle_vote_request(&vote_request(1, 3, 0, 0));

        assert!(!reply.vote_granted);
        assert!(!should_reset);
        assert_eq!(node.voted_for, Some(2));
    }

    #[test]
    fn can_revote_for_same_candidate() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.handle_vote_request(&vote_request(1, 2, 0, 0));
        node.take_persist_pending();

        let (reply, _) = node.handle_vote_request(&vote_request(1, 2, 0, 0));

        assert!(reply.vote_granted);
        assert!(!node.take_persist_pending(), "repeat grant changes nothing durable");
    }

    #[test]
    fn reject_candidate_with_lower_last_term() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.log.append(entry(5, 1));
        node.current_term = 5;

        let (reply, _) = node.handle_vote_request(&vote_request(5, 2, 3, 3));

        assert!(!reply.vote_granted, "longer log with older term is not more up to date");
    }

    #[test]
    fn reject_candidate_with_shorter_log_same_term() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.log.append(entry(1, 1));
        node.log.append(entry(1, 2));
        node.current_term = 1;

        let (reply, _) = node.handle_vote_request(&vote_request(1, 2, 1, 1));

        assert!(!reply.vote_granted);
        assert_eq!(node.voted_for, None);
    }

    #[test]
    fn stale_log_candidate_still_bumps_term() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.log.append(entry(2, 1));
        node.current_term = 2;

        let (reply, should_reset) = node.handle_vote_request(&vote_request(4, 3, 0, 0));

        assert!(!reply.vote_granted);
        assert!(!should_reset);
        assert_eq!(reply.term, 4);
        assert_eq!(node.current_term, 4);
        assert!(node.take_persist_pending());
    }

    #[test]
    fn grant_vote_to_candidate_with_higher_term_log() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.log.append(entry(1, 1));
        node.log.append(entry(1, 2));
        node.current_term = 2;

        let (reply, _) = node.handle_vote_request(&vote_request(2, 2, 1, 2));

        assert!(reply.vote_granted, "later last term wins even when shorter");
    }
}

// =============================================================================
// SECTION 5: LEADER STATE MANAGEMENT
// =============================================================================

mod leader_state {
    use super::*;

    #[test]
    fn leader_initializes_next_and_match_index() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.log.append(entry(1, 1));
        node.log.append(entry(1, 2));
        node.current_term = 1;

        let (_, mut tally) = node.start_election();
        node.handle_vote_response(3, &RequestVoteReply { term: 2, vote_granted: true }, &mut tally);

        assert!(node.is_leader());
        assert_eq!(node.next_index.get(&2), Some(&3));
        assert_eq!(node.next_index.get(&3), Some(&3));
        assert_eq!(node.match_index.get(&2), Some(&0));
        assert!(!node.next_index.contains_key(&1));
    }

    #[test]
    fn leader_steps_down_on_higher_term_heartbeat() {
        let mut node = leader_of_three();

        let (reply, should_reset) = node.handle_append_entries(heartbeat(3, 2, 0, 0, 0));

        assert!(reply.success);
        assert!(should_reset);
        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.leader_id, Some(2));
    }

    #[test]
    fn candidate_defers_to_same_term_leader() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.start_election();

        let (reply, _) = node.handle_append_entries(heartbeat(1, 3, 0, 0, 0));

        assert!(reply.success);
        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.voted_for, Some(1), "vote stays with its own term");
    }
}

// =============================================================================
// SECTION 6: LOG REPLICATION TESTS
// =============================================================================

mod log_replication {
    use super::*;

    #[test]
    fn leader_appends_client_command() {
        let mut node = leader_of_three();

        let (index, term, is_leader) = node.propose(b"set x".to_vec());

        assert_eq!((index, term, is_leader), (1, 1, true));
        assert_eq!(node.log.get(1).map(|e| e.command.as_slice()), Some(&b"set x"[..]));
        assert!(node.take_persist_pending());
    }

    #[test]
    fn follower_rejects_client_command() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.current_term = 4;

        let (index, term, is_leader) = node.propose(b"set x".to_vec());

        assert!(!is_leader);
        assert_eq!((index, term), (0, 4));
        assert!(node.log.is_empty());
        assert!(!node.take_persist_pending());
    }

    #[test]
    fn indices_are_consecutive() {
        let mut node = leader_of_three();
        let a = node.propose(vec![1]).0;
        let b = node.propose(vec![2]).0;
        let c = node.propose(vec![3]).0;
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn append_entries_carries_everything_from_next_index() {
        let mut node = leader_of_three();
        node.propose(vec![1]);
        node.propose(vec![2]);

        let args = node.append_entries_for(2).unwrap();

        assert_eq!(args.prev_log_index, 0);
        assert_eq!(args.prev_log_term, 0);
        assert_eq!(args.entries.len(), 2);
        assert_eq!(args.leader_commit, 0);
    }

    #[test]
    fn followers_do_not_build_append_entries() {
        let node = RaftNode::new(1, vec![1, 2, 3]);
        assert!(node.append_entries_for(2).is_none());
    }

    #[test]
    fn idle_leader_sends_heartbeat() {
        let node = leader_of_three();
        let args = node.append_entries_for(3).unwrap();
        assert!(args.is_heartbeat());
    }
}

// =============================================================================
// SECTION 7: APPEND ENTRIES HANDLING (FOLLOWER SIDE)
// =============================================================================

mod append_entries_handling {
    use super::*;

    #[test]
    fn reject_lower_term() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.current_term = 5;

        let (reply, should_reset) = node.handle_append_entries(heartbeat(3, 2, 0, 0, 0));

        assert_eq!(reply, AppendEntriesReply { term: 5, success: false });
        assert!(!should_reset);
        assert_eq!(node.leader_id, None);
    }

    #[test]
    fn accept_entries_and_record_leader() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        let args = AppendEntriesArgs {
            entries: vec![entry(1, 1), entry(1, 2)],
            ..heartbeat(1, 2, 0, 0, 0)
        };

        let (reply, should_reset) = node.handle_append_entries(args);

        assert!(reply.success);
        assert!(should_reset);
        assert_eq!(node.log.last_index(), 2);
        assert_eq!(node.leader_id, Some(2));
        assert!(node.take_persist_pending());
    }

    #[test]
    fn reject_missing_prev_entry() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);

        let (reply, should_reset) = node.handle_append_entries(heartbeat(1, 2, 3, 1, 0));

        assert!(!reply.success);
        assert!(should_reset, "a live leader still resets the timer");
    }

    #[test]
    fn reject_prev_term_mismatch() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.log.append(entry(1, 1));
        node.current_term = 2;

        let (reply, _) = node.handle_append_entries(heartbeat(2, 2, 1, 2, 0));

        assert!(!reply.success);
        assert_eq!(node.log.last_index(), 1, "rejection leaves the log alone");
    }

    #[test]
    fn conflicting_suffix_is_replaced() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.log.append(entry(1, 1));
        node.log.append(entry(1, 2));
        node.log.append(entry(1, 3));
        node.current_term = 1;

        let args = AppendEntriesArgs {
            entries: vec![entry(2, 9)],
            ..heartbeat(2, 3, 1, 1, 0)
        };
        let (reply, _) = node.handle_append_entries(args);

        assert!(reply.success);
        assert_eq!(node.log.last_index(), 2);
        assert_eq!(node.log.term_at(2), Some(2));
    }

    #[test]
    fn reordered_short_append_keeps_longer_log() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        let long = AppendEntriesArgs {
            entries: vec![entry(1, 1), entry(1, 2), entry(1, 3)],
            ..heartbeat(1, 2, 0, 0, 0)
        };
        let short = AppendEntriesArgs {
            entries: vec![entry(1, 1)],
            ..heartbeat(1, 2, 0, 0, 0)
        };

        node.handle_append_entries(long);
        node.take_persist_pending();
        let (reply, _) = node.handle_append_entries(short);

        assert!(reply.success);
        assert_eq!(node.log.last_index(), 3);
        assert!(!node.take_persist_pending());
    }

    #[test]
    fn commit_follows_leader_commit() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        let args = AppendEntriesArgs {
            entries: vec![entry(1, 1), entry(1, 2)],
            ..heartbeat(1, 2, 0, 0, 2)
        };

        node.handle_append_entries(args);

        assert_eq!(node.commit_index, 2);
    }

    #[test]
    fn commit_capped_by_last_new_entry() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        let args = AppendEntriesArgs {
            entries: vec![entry(1, 1)],
            ..heartbeat(1, 2, 0, 0, 10)
        };

        node.handle_append_entries(args);

        assert_eq!(node.commit_index, 1);
    }

    #[test]
    fn heartbeat_never_moves_commit_past_verified_prefix() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        // entries 2 and 3 are stale leftovers the leader has not vouched for
        node.log.append(entry(1, 1));
        node.log.append(entry(1, 2));
        node.log.append(entry(1, 3));
        node.current_term = 2;

        node.handle_append_entries(heartbeat(2, 2, 1, 1, 3));

        assert_eq!(node.commit_index, 1);
    }

    #[test]
    fn commit_index_never_decreases() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        let args = AppendEntriesArgs {
            entries: vec![entry(1, 1), entry(1, 2)],
            ..heartbeat(1, 2, 0, 0, 2)
        };
        node.handle_append_entries(args);

        node.handle_append_entries(heartbeat(1, 2, 0, 0, 0));

        assert_eq!(node.commit_index, 2);
    }
}

// =============================================================================
// SECTION 8: APPEND ENTRIES RESPONSE (LEADER SIDE)
// =============================================================================

mod append_entries_response {
    use super::*;

    #[test]
    fn success_advances_match_and_next() {
        let mut node = leader_of_three();
        node.propose(vec![1]);
        node.propose(vec![2]);
        let sent = node.append_entries_for(2).unwrap();

        let outcome = node.handle_append_entries_response(2, &sent, &ack(1));

        assert_eq!(outcome, ReplicationOutcome::Replicated { commit_advanced: true });
        assert_eq!(node.match_index[&2], 2);
        assert_eq!(node.next_index[&2], 3);
    }

    #[test]
    fn failure_backs_off_one_step() {
        let mut node = leader_of_three();
        node.propose(vec![1]);
        node.propose(vec![2]);
        node.next_index.insert(2, 3);
        let sent = node.append_entries_for(2).unwrap();
        assert_eq!(sent.prev_log_index, 2);

        let outcome = node.handle_append_entries_response(2, &sent, &nack(1));

        assert_eq!(outcome, ReplicationOutcome::Backtracked { next_index: 2 });
        assert_eq!(node.next_index[&2], 2);
    }

    #[test]
    fn next_index_never_below_one() {
        let mut node = leader_of_three();
        let sent = node.append_entries_for(2).unwrap();

        let outcome = node.handle_append_entries_response(2, &sent, &nack(1));

        assert_eq!(outcome, ReplicationOutcome::Backtracked { next_index: 1 });
    }

    #[test]
    fn reordered_ack_does_not_regress_match() {
        let mut node = leader_of_three();
        node.propose(vec![1]);
        let early = node.append_entries_for(2).unwrap();
        node.propose(vec![2]);
        let late = node.append_entries_for(2).unwrap();

        node.handle_append_entries_response(2, &late, &ack(1));
        node.handle_append_entries_response(2, &early, &ack(1));

        assert_eq!(node.match_index[&2], 2);
    }

    #[test]
    fn higher_term_reply_steps_down() {
        let mut node = leader_of_three();
        let sent = node.append_entries_for(2).unwrap();

        let outcome = node.handle_append_entries_response(2, &sent, &nack(4));

        assert_eq!(outcome, ReplicationOutcome::SteppedDown);
        assert_eq!(node.state, NodeState::Follower);
        assert_eq!(node.current_term, 4);
        assert!(node.take_persist_pending());
    }

    #[test]
    fn reply_to_older_term_is_stale() {
        let mut node = leader_of_three();
        let sent = node.append_entries_for(2).unwrap();
        // lose leadership and win again in a later term
        node.become_follower(2);
        let (_, mut tally) = node.start_election();
        node.handle_vote_response(3, &RequestVoteReply { term: 3, vote_granted: true }, &mut tally);
        assert!(node.is_leader());

        let outcome = node.handle_append_entries_response(2, &sent, &ack(1));

        assert_eq!(outcome, ReplicationOutcome::Stale);
        assert_eq!(node.match_index[&2], 0);
    }
}

// =============================================================================
// SECTION 9: COMMIT ADVANCEMENT
// =============================================================================

mod commit_advancement {
    use super::*;

    #[test]
    fn majority_commits_entry() {
        let mut node = RaftNode::new(1, vec![1, 2, 3, 4, 5]);
        let (_, mut tally) = node.start_election();
        let granted = RequestVoteReply { term: 1, vote_granted: true };
        node.handle_vote_response(2, &granted, &mut tally);
        node.handle_vote_response(3, &granted, &mut tally);
        node.propose(vec![1]);
        let sent = node.append_entries_for(2).unwrap();

        node.handle_append_entries_response(2, &sent, &ack(1));
        assert_eq!(node.commit_index, 0, "2 of 5 is not a majority");

        node.handle_append_entries_response(4, &sent, &ack(1));
        assert_eq!(node.commit_index, 1);
    }

    #[test]
    fn lone_leader_commits_on_propose() {
        let mut node = RaftNode::new(1, vec![1]);
        node.start_election();

        node.propose(vec![42]);

        assert_eq!(node.commit_index, 1);
    }

    #[test]
    fn cannot_commit_previous_term_by_counting() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.log.append(entry(1, 1));
        node.current_term = 1;
        let (_, mut tally) = node.start_election(); // term 2
        node.handle_vote_response(2, &RequestVoteReply { term: 2, vote_granted: true }, &mut tally);
        node.next_index.insert(2, 1);
        let sent = node.append_entries_for(2).unwrap();

        node.handle_append_entries_response(2, &sent, &ack(2));

        assert_eq!(node.match_index[&2], 1);
        assert_eq!(node.commit_index, 0, "term-1 entry needs a term-2 entry above it");
    }

    #[test]
    fn current_term_entry_commits_older_ones_too() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.log.append(entry(1, 1));
        node.current_term = 1;
        let (_, mut tally) = node.start_election(); // term 2
        node.handle_vote_response(2, &RequestVoteReply { term: 2, vote_granted: true }, &mut tally);
        node.propose(vec![2]);
        node.next_index.insert(3, 1);
        let sent = node.append_entries_for(3).unwrap();

        node.handle_append_entries_response(3, &sent, &ack(2));

        assert_eq!(node.commit_index, 2);
    }

    #[test]
    fn followers_never_advance_by_counting() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.log.append(entry(1, 1));
        node.match_index.insert(2, 1);
        assert!(!node.advance_commit_index());
    }
}

// =============================================================================
// SECTION 10: APPLY PIPELINE
// =============================================================================

mod state_machine {
    use super::*;

    #[test]
    fn nothing_to_apply_before_commit() {
        let mut node = leader_of_three();
        node.propose(vec![1]);
        assert!(node.entries_to_apply().is_empty());
    }

    #[test]
    fn committed_entries_come_out_in_order() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        let args = AppendEntriesArgs {
            entries: vec![entry(1, 10), entry(1, 20), entry(1, 30)],
            ..heartbeat(1, 2, 0, 0, 2)
        };
        node.handle_append_entries(args);

        let batch = node.entries_to_apply();

        assert_eq!(batch.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(batch[1].1.command, vec![20]);
    }

    #[test]
    fn applied_entries_are_not_repeated() {
        let mut node = RaftNode::new(1, vec![1]);
        node.start_election();
        node.propose(vec![1]);
        node.propose(vec![2]);

        for (index, _) in node.entries_to_apply() {
            node.mark_applied(index);
        }
        node.propose(vec![3]);

        let batch = node.entries_to_apply();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].0, 3);
        assert_eq!(node.last_applied, 2);
    }
}

// =============================================================================
// SECTION 11: PERSISTENCE
// =============================================================================

mod persistence {
    use super::*;

    #[test]
    fn restart_restores_term_vote_and_log() {
        let mut node = leader_of_three();
        node.propose(b"a".to_vec());
        node.propose(b"b".to_vec());
        let blob = node.encode_persistent().unwrap();

        let mut restarted = RaftNode::new(1, vec![1, 2, 3]);
        restarted.restore(PersistentState::decode(&blob).unwrap().unwrap());

        assert_eq!(restarted.current_term, 1);
        assert_eq!(restarted.voted_for, Some(1));
        assert_eq!(restarted.log, node.log);
        assert_eq!(restarted.state, NodeState::Follower);
        assert_eq!(restarted.commit_index, 0, "volatile state starts over");
    }

    #[test]
    fn persistent_state_matches_encoded_blob() {
        let mut node = leader_of_three();
        node.propose(vec![9]);

        let blob = node.encode_persistent().unwrap();

        assert_eq!(blob, node.persistent_state().encode().unwrap());
    }

    #[test]
    fn rejected_stale_rpc_requires_no_persist() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        node.current_term = 3;

        node.handle_vote_request(&vote_request(2, 2, 0, 0));
        node.handle_append_entries(heartbeat(2, 2, 0, 0, 0));

        assert!(!node.take_persist_pending());
    }
}

// =============================================================================
// SECTION 12: EDGE CASES
// =============================================================================

mod edge_cases {
    use super::*;

    #[test]
    fn follower_ignores_replication_replies() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        let sent = heartbeat(0, 1, 0, 0, 0);

        let outcome = node.handle_append_entries_response(2, &sent, &ack(0));

        assert_eq!(outcome, ReplicationOutcome::Stale);
    }

    #[test]
    fn repeated_elections_keep_raising_term() {
        let mut node = RaftNode::new(1, vec![1, 2, 3]);
        for _ in 0..5 {
            node.start_election();
        }
        assert_eq!(node.current_term, 5);
        assert_eq!(node.state, NodeState::Candidate);
    }

    #[test]
    fn follower_catches_up_after_backtracking() {
        let mut leader = leader_of_three();
        leader.propose(vec![1]);
        leader.propose(vec![2]);
        leader.propose(vec![3]);
        let mut follower = RaftNode::new(2, vec![1, 2, 3]);
        // pretend the leader overestimated the follower
        leader.next_index.insert(2, 4);

        loop {
            let args = leader.append_entries_for(2).unwrap();
            let (reply, _) = follower.handle_append_entries(args.clone());
            match leader.handle_append_entries_response(2, &args, &reply) {
                ReplicationOutcome::Replicated { .. } => break,
                ReplicationOutcome::Backtracked { .. } => continue,
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        assert_eq!(follower.log, leader.log);
        assert_eq!(leader.match_index[&2], 3);
        assert_eq!(leader.commit_index, 3);
    }
}
