//! # raft-node
//!
//! why: run the pure raft state machine as a live peer on a tokio runtime
//! relations: wraps raft-core's RaftNode, persists through raft-storage, talks through transport
//! what: Peer handle (start/get_state/kill), election timer, replication driver, apply pipeline

mod apply;
mod election;
mod peer;
mod replication;
pub mod transport;

pub use peer::{ApplyMsg, Peer, PeerStatus};
pub use transport::memory::MemoryNetwork;
pub use transport::tcp::{TcpClient, TcpServer};
pub use transport::{dispatch, RaftClient, RaftHandler, TransportError};
