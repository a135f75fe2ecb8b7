//! In-process transport for tests.
//!
//! Every call goes straight to the registered handler of the target node.
//! Nodes can be cut off and reattached, and the whole network can be made
//! unreliable: each request and each reply is then delayed by up to
//! [`MAX_DELAY_MS`] and lost with probability [`LOSS_RATE`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, NodeId, RaftError, RequestVoteArgs, RequestVoteReply,
};
use tokio::time;

use super::{RaftClient, RaftHandler, TransportError};

pub const MAX_DELAY_MS: u64 = 27;
pub const LOSS_RATE: f64 = 0.1;

#[derive(Default)]
struct NetworkInner {
    handlers: RwLock<HashMap<NodeId, Arc<dyn RaftHandler>>>,
    disconnected: RwLock<HashSet<NodeId>>,
    unreliable: AtomicBool,
    rpc_count: AtomicU64,
}

impl NetworkInner {
    fn is_connected(&self, node: NodeId) -> bool {
        !self.disconnected.read().contains(&node)
    }

    fn link_up(&self, from: NodeId, to: NodeId) -> bool {
        self.is_connected(from) && self.is_connected(to)
    }
}

/// Shared fake network; clones address the same set of nodes.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route calls for `id` to `handler`, replacing any earlier registration.
    pub fn register(&self, id: NodeId, handler: Arc<dyn RaftHandler>) {
        self.inner.handlers.write().insert(id, handler);
    }

    pub fn unregister(&self, id: NodeId) {
        self.inner.handlers.write().remove(&id);
    }

    /// A client that calls `to` on behalf of `from`.
    pub fn client(&self, from: NodeId, to: NodeId) -> Arc<dyn RaftClient> {
        Arc::new(MemoryClient {
            net: Arc::clone(&self.inner),
            from,
            to,
        })
    }

    /// Clients from `from` to every other member of `cluster`.
    pub fn clients_for(&self, from: NodeId, cluster: &[NodeId]) -> BTreeMap<NodeId, Arc<dyn RaftClient>> {
        cluster
            .iter()
            .copied()
            .filter(|&to| to != from)
            .map(|to| (to, self.client(from, to)))
            .collect()
    }

    /// Cut every link into and out of `id`.
    pub fn disconnect(&self, id: NodeId) {
        self.inner.disconnected.write().insert(id);
    }

    pub fn reconnect(&self, id: NodeId) {
        self.inner.disconnected.write().remove(&id);
    }

    pub fn set_reliable(&self, reliable: bool) {
        self.inner.unreliable.store(!reliable, Ordering::SeqCst);
    }

    /// Calls attempted since the network was created, successful or not.
    pub fn rpc_count(&self) -> u64 {
        self.inner.rpc_count.load(Ordering::SeqCst)
    }
}

struct MemoryClient {
    net: Arc<NetworkInner>,
    from: NodeId,
    to: NodeId,
}

fn random_delay() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_DELAY_MS))
}

fn message_lost() -> bool {
    rand::thread_rng().gen_bool(LOSS_RATE)
}

impl MemoryClient {
    async fn call<R>(
        &self,
        invoke: impl FnOnce(&dyn RaftHandler) -> Result<R, RaftError>,
    ) -> Result<R, TransportError> {
        let net = &self.net;
        net.rpc_count.fetch_add(1, Ordering::SeqCst);
        let unreachable = || TransportError::Unreachable {
            from: self.from,
            to: self.to,
        };

        if !net.link_up(self.from, self.to) {
            time::sleep(random_delay()).await;
            return Err(unreachable());
        }

        let unreliable = net.unreliable.load(Ordering::SeqCst);
        if unreliable {
            time::sleep(random_delay()).await;
            if message_lost() {
                return Err(TransportError::Dropped);
            }
        }

        let handler = net.handlers.read().get(&self.to).cloned();
        let handler = handler.ok_or_else(unreachable)?;
        let reply = invoke(handler.as_ref()).map_err(|e| TransportError::Rejected(e.to_string()))?;

        if unreliable {
            time::sleep(random_delay()).await;
            if message_lost() {
                return Err(TransportError::Dropped);
            }
        }
        // the target may have been cut off while serving the call
        if !net.link_up(self.from, self.to) {
            return Err(unreachable());
        }
        Ok(reply)
    }
}

#[async_trait]
impl RaftClient for MemoryClient {
    async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply, TransportError> {
        self.call(move |h| h.request_vote(args)).await
    }

    async fn append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError> {
        self.call(move |h| h.append_entries(args)).await
    }
}
