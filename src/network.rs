//! The client's collaborator seams: the RPC transport and leadership hooks.

use std::cell::Cell;

use async_trait::async_trait;

use crate::client::RaftClientReply;
use crate::client::RaftClientRequest;
use crate::error::TransportError;
use crate::AppData;
use crate::AppDataResponse;
use crate::CallId;
use crate::NodeId;

/// A trait defining the interface for sending client requests to a Raft
/// cluster.
///
/// Routing is the transport's concern: requests carry a
/// [`crate::RequestTarget`] naming either a specific server or the leader
/// (with the client's latest hint), and the transport resolves it to an
/// actual connection.
#[async_trait]
pub trait ClientTransport<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// Send one attempt of a client request.
    ///
    /// An `Ok(None)` reply means the server has accepted the request but has
    /// nothing to report yet; the client will retry the attempt without
    /// treating it as a failure.
    async fn send_request(&self, request: RaftClientRequest<D>) -> Result<Option<RaftClientReply<R>>, TransportError>;
}

/// A window-reset request slot handed to leadership hooks.
///
/// Calling [`ResetSignal::request`] asks the window to re-stamp its smallest
/// outstanding sequence number as the window's first, so that its next
/// rebuild re-anchors the server-side window.
pub struct ResetSignal {
    requested: Cell<bool>,
}

impl ResetSignal {
    pub(crate) fn new() -> Self {
        Self {
            requested: Cell::new(false),
        }
    }

    /// Request a window reset once the current hook returns.
    pub fn request(&self) {
        self.requested.set(true);
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.requested.get()
    }
}

/// Hooks invoked by the retry orchestrator on leadership events and on
/// retryable I/O failures.
///
/// The provided method bodies request a window reset on both leader-change
/// paths, which is what a client needs for correct re-anchoring; implementors
/// typically layer routing-table updates or extra logging on top and keep the
/// reset behavior.
pub trait LeaderEventHandler: Send + Sync + 'static {
    /// A normal reply carried a not-leader exception.
    fn handle_leader_exception(&self, _call_id: CallId, _suggested_leader: Option<NodeId>, reset: &ResetSignal) {
        reset.request();
    }

    /// The transport failed an attempt with a not-leader error.
    fn handle_not_leader_exception(&self, _call_id: CallId, _suggested_leader: Option<NodeId>, reset: &ResetSignal) {
        reset.request();
    }

    /// The transport failed an attempt with a retryable I/O error.
    fn handle_io_exception(&self, _call_id: CallId, _error: &anyhow::Error, _reset: &ResetSignal) {}
}

/// The default leadership handler: re-anchors the window on leader changes
/// and takes no other action.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultLeaderEventHandler;

impl LeaderEventHandler for DefaultLeaderEventHandler {}
