//! Transport abstraction for the Raft RPC surface.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::rpc::{
    AppendEntriesArgs, AppendEntriesResult, ClientRequestArgs, ClientRequestResult,
    RequestVoteArgs, RequestVoteResult,
};

/// Transport abstraction for the three RPC kinds.
///
/// A killed or partitioned target surfaces as `ConnectionFailed` or
/// `Timeout`; callers treat both as indefinite non-response, since Raft
/// cannot distinguish slow from dead.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a RequestVote RPC to a peer server
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError>;

    /// Send an AppendEntries RPC to a peer server
    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError>;

    /// Submit a client message to a server
    async fn client_request(
        &self,
        target: u64,
        args: ClientRequestArgs,
    ) -> Result<ClientRequestResult, TransportError>;
}

/// Errors that can occur during transport operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection to the target server failed
    #[error("connection failed")]
    ConnectionFailed,
    /// Request timed out
    #[error("request timed out")]
    Timeout,
    /// Target server not found
    #[error("target server not found")]
    NodeNotFound,
}
