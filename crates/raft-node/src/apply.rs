//! # apply
//!
//! why: hand committed commands to the service exactly once and in index order
//! relations: spawned by peer.rs, woken whenever a handler or replicator moves commit_index
//! what: the applier task, sole writer of last_applied

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::peer::{ApplyMsg, Shared};

pub(crate) async fn run_applier(shared: Arc<Shared>, tx: mpsc::Sender<ApplyMsg>) {
    loop {
        if shared.killed() {
            break;
        }
        let batch = shared.state.lock().node.entries_to_apply();
        if batch.is_empty() {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = shared.apply_ready.notified() => continue,
            }
        }

        for (index, entry) in batch {
            if shared.killed() {
                return;
            }
            let msg = ApplyMsg {
                command_valid: true,
                command: entry.command,
                command_index: index,
            };
            tokio::select! {
                sent = tx.send(msg) => {
                    if sent.is_err() {
                        warn!(node = shared.id, index, "apply channel closed, stopping applier");
                        return;
                    }
                }
                _ = shared.shutdown.cancelled() => return,
            }
            shared.state.lock().node.mark_applied(index);
        }
    }
    debug!(node = shared.id, "applier stopped");
}
