//! # replication
//!
//! why: keep every follower's log in step with the leader's and advance the commit index
//! relations: started by election.rs on a won election, woken by Peer::start
//! what: one AppendEntries loop per follower for the duration of one term's leadership

use std::sync::Arc;

use raft_core::{NodeId, ReplicationOutcome};
use tokio::time;
use tracing::{debug, info};

use crate::peer::Shared;
use crate::transport::RaftClient;

/// Start one replicator per follower for leadership of `term`.
pub(crate) fn spawn_replicators(shared: &Arc<Shared>, term: u64) {
    for (&peer, client) in &shared.clients {
        tokio::spawn(replicate_to(Arc::clone(shared), peer, Arc::clone(client), term));
    }
}

/// Send AppendEntries to `peer` until this node stops leading `term`.
async fn replicate_to(shared: Arc<Shared>, peer: NodeId, client: Arc<dyn RaftClient>, term: u64) {
    loop {
        if shared.killed() {
            break;
        }
        let args = {
            let st = shared.state.lock();
            if !st.node.is_leader() || st.node.current_term != term {
                break;
            }
            match st.node.append_entries_for(peer) {
                Some(args) => args,
                None => break,
            }
        };

        // retry right away while the follower is behind
        let mut behind = false;
        match time::timeout(shared.config.rpc_deadline(), client.append_entries(args.clone())).await {
            Ok(Ok(reply)) => {
                if shared.killed() {
                    break;
                }
                let mut st = shared.state.lock();
                match st.node.handle_append_entries_response(peer, &args, &reply) {
                    ReplicationOutcome::SteppedDown => {
                        info!(
                            node = shared.id,
                            term = st.node.current_term,
                            peer,
                            "saw newer term in AppendEntries reply, stepping down"
                        );
                        if shared.persist(&mut st.node).is_ok() {
                            shared.reset_election_timer(&mut st);
                        }
                        break;
                    }
                    ReplicationOutcome::Stale => break,
                    ReplicationOutcome::Replicated { commit_advanced } => {
                        if commit_advanced {
                            if shared.config.debug {
                                debug!(node = shared.id, term, commit_index = st.node.commit_index, "commit index advanced");
                            }
                            shared.apply_ready.notify_one();
                        }
                        let last = st.node.last_log_index();
                        behind = st.node.next_index.get(&peer).is_some_and(|&next| next <= last);
                    }
                    ReplicationOutcome::Backtracked { next_index } => {
                        debug!(node = shared.id, term, peer, next_index, "log mismatch, backing up");
                        behind = true;
                    }
                }
            }
            Ok(Err(e)) => {
                if shared.config.debug {
                    debug!(node = shared.id, term, peer, error = %e, "AppendEntries failed");
                }
            }
            Err(_) => {
                if shared.config.debug {
                    debug!(node = shared.id, term, peer, "AppendEntries timed out");
                }
            }
        }
        if behind {
            continue;
        }

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = shared.replicate.notified() => {}
            _ = time::sleep(shared.config.heartbeat()) => {}
        }
    }
    debug!(node = shared.id, term, peer, "replicator stopped");
}
