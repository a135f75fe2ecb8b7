//! # error
//!
//! why: give every failure a peer can hit a typed, matchable shape
//! relations: returned by state.rs decoding, config.rs validation and the raft-node peer
//! what: RaftError enum and the crate Result alias

use crate::message::NodeId;
use thiserror::Error;

/// Errors raised by the consensus core and the peer runtime built on it.
#[derive(Debug, Error)]
pub enum RaftError {
    /// Persisted bytes exist but cannot be decoded into term/vote/log.
    #[error("persisted raft state is corrupt: {0}")]
    CorruptState(String),

    /// The persistent state could not be serialized.
    #[error("failed to encode persistent state: {0}")]
    Encode(#[source] serde_json::Error),

    /// The durable store refused a read or write.
    #[error("storage failure: {0}")]
    Storage(#[from] std::io::Error),

    /// A configuration value is out of range.
    #[error("invalid raft configuration: {0}")]
    InvalidConfig(String),

    /// The peer has been killed and no longer serves requests.
    #[error("peer {0} has been killed")]
    Killed(NodeId),
}

pub type Result<T, E = RaftError> = std::result::Result<T, E>;
