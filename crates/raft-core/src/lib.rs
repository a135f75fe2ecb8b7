//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-node (timers, transport, apply channel), persisted via raft-storage
//! what: state machine, election logic, log management, message types, persistent-state codec

pub mod config;
pub mod election;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod state;

pub use config::RaftConfig;
pub use election::{VoteOutcome, VoteTally};
pub use error::{RaftError, Result};
pub use log::{Log, LogEntry};
pub use message::{
    AppendEntriesArgs, AppendEntriesReply, NodeId, RaftMessage, RequestVoteArgs,
    RequestVoteReply,
};
pub use node::{NodeState, RaftNode, ReplicationOutcome};
pub use state::PersistentState;
