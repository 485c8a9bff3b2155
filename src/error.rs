//! Error types exposed by this crate.

use std::sync::Arc;

use thiserror::Error;

use crate::client::RaftException;
use crate::NodeId;

/// A result type where the error variant is always a `ClientError`.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// A failure raised by the transport for a single request attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The addressed server is not the current leader.
    #[error("server {server} is not the leader")]
    NotLeader {
        /// The server which rejected the request.
        server: NodeId,
        /// The leader suggested by the rejecting server, if it knows one.
        suggested_leader: Option<NodeId>,
    },

    /// The addressed server is not a member of the request's Raft group.
    ///
    /// This is terminal: retrying against the same group can never succeed.
    #[error("group {group_id} does not match server {server}")]
    GroupMismatch { server: NodeId, group_id: String },

    /// A transient I/O failure, subject to the retry policy.
    #[error("io error: {0}")]
    Io(anyhow::Error),

    /// Any non-I/O transport failure. Terminal.
    #[error("fatal transport error: {0}")]
    Fatal(anyhow::Error),
}

/// Error variants surfaced to callers of [`crate::RaftClient::send`].
///
/// Terminal failures are fate-shared: once one request in a window fails
/// terminally, every other outstanding request in the same window fails with
/// the same cause, since delivering around a gap would break in-order
/// delivery. That is why the transport-carrying variants hold their cause
/// behind an `Arc`.
#[derive(Clone, Debug, Error)]
pub enum ClientError {
    /// The client is shutting down.
    ///
    /// When returned from `send` directly, the request was never admitted and
    /// never registered on a window.
    #[error("the raft client is shutting down")]
    ShuttingDown,

    /// The server returned a normal reply whose payload carries a Raft-level
    /// exception.
    #[error("raft exception: {0}")]
    Raft(#[from] RaftException),

    /// The request's group id was rejected by the addressed server.
    #[error("group {group_id} does not match server {server}")]
    GroupMismatch { server: NodeId, group_id: String },

    /// The retry policy refused further attempts.
    #[error("no more retries after {attempts} attempts: {cause}")]
    RetriesExhausted { attempts: usize, cause: Arc<TransportError> },

    /// A terminal transport failure.
    #[error("transport error: {0}")]
    Transport(Arc<TransportError>),
}
