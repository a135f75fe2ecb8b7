//! TCP transport.
//!
//! One connection per call. A frame is a 4-byte big-endian length followed
//! by a json-encoded [`RaftMessage`]. The server keeps reading frames from a
//! connection until the client closes it, so a pooled client would also work.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, RaftMessage, RequestVoteArgs, RequestVoteReply,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{dispatch, RaftClient, RaftHandler, TransportError};

/// Largest frame either side will read or write
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    // Read length prefix (4 bytes)
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<(), TransportError> {
    if data.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(data.len()));
    }
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Client for one remote peer's [`TcpServer`].
#[derive(Debug, Clone)]
pub struct TcpClient {
    addr: SocketAddr,
}

impl TcpClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    async fn call(&self, request: RaftMessage) -> Result<RaftMessage, TransportError> {
        let mut stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, &request.encode()?).await?;
        let frame = read_frame(&mut stream).await?;
        Ok(RaftMessage::decode(&frame)?)
    }
}

#[async_trait]
impl RaftClient for TcpClient {
    async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply, TransportError> {
        match self.call(RaftMessage::RequestVote(args)).await? {
            RaftMessage::RequestVoteReply(reply) => Ok(reply),
            other => Err(TransportError::UnexpectedMessage(other.kind())),
        }
    }

    async fn append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError> {
        match self.call(RaftMessage::AppendEntries(args)).await? {
            RaftMessage::AppendEntriesReply(reply) => Ok(reply),
            other => Err(TransportError::UnexpectedMessage(other.kind())),
        }
    }
}

/// Accepts peer connections and answers them with a [`RaftHandler`].
///
/// Binding and serving are separate so every peer's address is known before
/// any peer (and so any handler) exists.
pub struct TcpServer {
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl TcpServer {
    pub async fn bind(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token that stops the accept loop and every open connection when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until the shutdown token is cancelled.
    pub async fn serve(self, handler: Arc<dyn RaftHandler>) {
        let local_addr = self.listener.local_addr().ok();
        info!(addr = ?local_addr, "raft tcp server listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let handler = Arc::clone(&handler);
                        let token = self.shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, handler, token).await {
                                debug!(%remote, error = %e, "raft connection closed with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to accept raft connection"),
                },
            }
        }
        info!(addr = ?local_addr, "raft tcp server stopped");
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    handler: Arc<dyn RaftHandler>,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = read_frame(&mut stream) => match frame {
                Ok(frame) => frame,
                // client hung up between calls
                Err(TransportError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            },
        };
        // a refused call (e.g. killed peer) closes the connection without a reply
        let reply = dispatch_off_worker(handler.as_ref(), RaftMessage::decode(&frame)?)?;
        write_frame(&mut stream, &reply.encode()?).await?;
    }
}

/// Handlers persist synchronously, so a slow disk would stall the worker.
/// On a multi-thread runtime the worker's other tasks move to another
/// thread for the duration; `block_in_place` panics on a current-thread runtime.
fn dispatch_off_worker(handler: &dyn RaftHandler, msg: RaftMessage) -> Result<RaftMessage, TransportError> {
    match Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(|| dispatch(handler, msg)),
        _ => dispatch(handler, msg),
    }
}
