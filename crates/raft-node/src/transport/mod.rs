//! # transport
//!
//! why: let a peer call RequestVote / AppendEntries on another peer without caring how bytes move
//! relations: RaftClient used by election.rs and replication.rs, RaftHandler implemented by Peer
//! what: client and handler traits, TransportError, message dispatch, memory and tcp transports
//!
//! Delivery is not guaranteed and there are no retries at this layer. A
//! failed call is an ordinary value; the caller tries again on its next
//! heartbeat or election round.

pub mod memory;
pub mod tcp;

use async_trait::async_trait;
use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, NodeId, RaftError, RaftMessage, RequestVoteArgs,
    RequestVoteReply,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("node {to} is unreachable from node {from}")]
    Unreachable { from: NodeId, to: NodeId },

    #[error("message was dropped in transit")]
    Dropped,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),

    /// The remote peer refused to answer, e.g. because it was killed.
    #[error("remote rejected the call: {0}")]
    Rejected(String),

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
}

/// Outbound side: one client per remote peer.
#[async_trait]
pub trait RaftClient: Send + Sync {
    async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply, TransportError>;

    async fn append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError>;
}

/// Inbound side: answers RPCs addressed to a local peer.
///
/// Handlers never block on I/O other than the synchronous persist they
/// must finish before replying.
pub trait RaftHandler: Send + Sync {
    fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply, RaftError>;

    fn append_entries(&self, args: AppendEntriesArgs) -> Result<AppendEntriesReply, RaftError>;
}

/// Route a request envelope to `handler` and wrap its reply.
pub fn dispatch(handler: &dyn RaftHandler, msg: RaftMessage) -> Result<RaftMessage, TransportError> {
    let rejected = |e: RaftError| TransportError::Rejected(e.to_string());
    match msg {
        RaftMessage::RequestVote(args) => handler
            .request_vote(args)
            .map(RaftMessage::RequestVoteReply)
            .map_err(rejected),
        RaftMessage::AppendEntries(args) => handler
            .append_entries(args)
            .map(RaftMessage::AppendEntriesReply)
            .map_err(rejected),
        other => Err(TransportError::UnexpectedMessage(other.kind())),
    }
}
