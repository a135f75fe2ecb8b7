//! # election
//!
//! why: turn an elapsed election timeout into a candidacy
//! relations: spawned by peer.rs, hands a won election to replication.rs
//! what: the per-peer timer loop and per-peer vote solicitation tasks

use std::sync::Arc;

use parking_lot::Mutex;
use raft_core::{RequestVoteArgs, VoteOutcome, VoteTally};
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::peer::Shared;
use crate::replication;

/// Sleep until the election deadline; on expiry campaign, on reset re-read it.
pub(crate) async fn run_timer(shared: Arc<Shared>) {
    let first = shared.state.lock().election_deadline;
    let sleep = time::sleep_until(first);
    tokio::pin!(sleep);

    loop {
        if shared.killed() {
            break;
        }
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = shared.timer_reset.notified() => {
                let deadline = shared.state.lock().election_deadline;
                sleep.as_mut().reset(deadline);
            }
            _ = &mut sleep => {
                let next = on_deadline(&shared);
                sleep.as_mut().reset(next);
            }
        }
    }
    debug!(node = shared.id, "election timer stopped");
}

/// Returns the next instant the timer should fire at.
fn on_deadline(shared: &Arc<Shared>) -> Instant {
    let mut st = shared.state.lock();
    let now = Instant::now();
    if now < st.election_deadline {
        // pushed back by a heartbeat we have not been notified about yet
        return st.election_deadline;
    }
    st.election_deadline = now + shared.config.random_election_timeout();
    let next = st.election_deadline;
    if st.node.is_leader() {
        return next;
    }

    let (request, tally) = st.node.start_election();
    let term = request.term;
    info!(node = shared.id, term, "election timeout, starting campaign");
    if shared.persist(&mut st.node).is_err() {
        return next;
    }

    if st.node.is_leader() {
        info!(node = shared.id, term, votes = tally.count(), "won election");
        drop(st);
        replication::spawn_replicators(shared, term);
        return next;
    }
    drop(st);

    solicit_votes(shared, request, tally);
    next
}

/// One task per peer; each reply is counted under the tally's own mutex.
fn solicit_votes(shared: &Arc<Shared>, request: RequestVoteArgs, tally: VoteTally) {
    let term = request.term;
    let tally = Arc::new(Mutex::new(tally));

    for (&peer, client) in &shared.clients {
        let shared = Arc::clone(shared);
        let client = Arc::clone(client);
        let tally = Arc::clone(&tally);
        let request = request.clone();

        tokio::spawn(async move {
            let reply = match time::timeout(shared.config.rpc_deadline(), client.request_vote(request)).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    if shared.config.debug {
                        debug!(node = shared.id, term, peer, error = %e, "RequestVote failed");
                    }
                    return;
                }
                Err(_) => {
                    if shared.config.debug {
                        debug!(node = shared.id, term, peer, "RequestVote timed out");
                    }
                    return;
                }
            };
            if shared.killed() {
                return;
            }

            let mut st = shared.state.lock();
            let mut tally = tally.lock();
            let outcome = st.node.handle_vote_response(peer, &reply, &mut tally);
            match outcome {
                VoteOutcome::Elected => {
                    info!(node = shared.id, term, votes = tally.count(), "won election");
                    drop(tally);
                    drop(st);
                    replication::spawn_replicators(&shared, term);
                }
                VoteOutcome::SteppedDown => {
                    info!(
                        node = shared.id,
                        term = st.node.current_term,
                        peer,
                        "saw newer term in vote reply, stepping down"
                    );
                    if shared.persist(&mut st.node).is_ok() {
                        shared.reset_election_timer(&mut st);
                    }
                }
                VoteOutcome::Pending | VoteOutcome::Stale => {}
            }
        });
    }
}
