//! An ordered asynchronous client core for Raft clusters.
//!
//! This crate implements the client half of a per-client request window:
//! it submits a stream of requests (writes, linearizable reads, stale reads,
//! watches) to a Raft service while preserving submission order, bounding the
//! number of in-flight requests, and recovering from leader changes and
//! transient failures.
//!
//! Each target gets its own sliding window: a dedicated window per server for
//! stale reads, and one shared window for everything routed to the leader.
//! Within a window, requests carry strictly increasing sequence numbers,
//! exactly one outstanding request is flagged as the window's first (the
//! anchor the server uses for its own window state), and replies are
//! delivered to callers in sequence order no matter how the transport
//! reorders them.
//!
//! The crate does not speak a wire protocol itself; applications provide a
//! [`ClientTransport`] implementation, and may provide a [`RetryPolicy`] and
//! a [`LeaderEventHandler`] to customize retry pacing and leader-change
//! handling.

pub mod client;
pub mod config;
mod core;
pub mod error;
pub mod metrics;
pub mod network;
pub mod retry;

pub use async_trait;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use crate::client::ClientId;
pub use crate::client::RaftClient;
pub use crate::client::RaftClientReply;
pub use crate::client::RaftClientRequest;
pub use crate::client::RaftException;
pub use crate::client::ReplicationLevel;
pub use crate::client::RequestKind;
pub use crate::client::RequestTarget;
pub use crate::client::SlidingWindowEntry;
pub use crate::config::Config;
pub use crate::config::ConfigError;
pub use crate::error::ClientError;
pub use crate::error::ClientResult;
pub use crate::error::TransportError;
pub use crate::metrics::ClientMetrics;
pub use crate::network::ClientTransport;
pub use crate::network::DefaultLeaderEventHandler;
pub use crate::network::LeaderEventHandler;
pub use crate::network::ResetSignal;
pub use crate::retry::ExponentialBackoff;
pub use crate::retry::RetryForeverNoSleep;
pub use crate::retry::RetryForeverWithSleep;
pub use crate::retry::RetryPolicy;
pub use crate::retry::RetryUpToMaximumCount;

/// A Raft node's ID.
pub type NodeId = u64;

/// A process-wide id attached to every logical call, used for server-side
/// idempotence and for logging. Independent of window sequence numbers.
pub type CallId = u64;

/// A trait defining application specific request data.
///
/// The intention of this trait is that applications which are using this
/// crate will be able to use their own concrete data types throughout their
/// application without having to serialize and deserialize their data as it
/// passes through the client.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppData for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific reply data, returned by the cluster
/// for a client request.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppDataResponse for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

pub trait MessageSummary {
    /// Return a brief summary of the message for logging purpose.
    fn summary(&self) -> String;
}
