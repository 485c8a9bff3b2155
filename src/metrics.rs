//! Client metrics, published over a watch channel.
//!
//! The client publishes a fresh [`ClientMetrics`] snapshot whenever a request
//! is admitted, delivered, failed or retried, and whenever the leader hint
//! changes. Callers obtain the receiver via [`crate::RaftClient::metrics`].

use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;

use crate::NodeId;

/// A set of metrics describing the current state of a Raft client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetrics {
    /// Requests admitted and not yet completed.
    pub outstanding_requests: u64,
    /// Requests admitted since the client was created.
    pub submitted: u64,
    /// Requests completed with a reply.
    pub delivered: u64,
    /// Requests completed with a terminal failure.
    pub failed: u64,
    /// Retry attempts scheduled.
    pub retries: u64,
    /// The latest leader hint observed from the cluster, if any.
    pub current_leader: Option<NodeId>,
}

/// The write half of the metrics channel, shared by the client handle and
/// every window task.
pub(crate) struct MetricsReporter {
    state: Mutex<ClientMetrics>,
    tx: watch::Sender<ClientMetrics>,
}

impl MetricsReporter {
    pub(crate) fn new() -> (Arc<Self>, watch::Receiver<ClientMetrics>) {
        let (tx, rx) = watch::channel(ClientMetrics::default());
        let reporter = Self {
            state: Mutex::new(ClientMetrics::default()),
            tx,
        };
        (Arc::new(reporter), rx)
    }

    pub(crate) fn on_submit(&self) {
        self.update(|m| {
            m.outstanding_requests += 1;
            m.submitted += 1;
        });
    }

    pub(crate) fn on_delivered(&self) {
        self.update(|m| {
            m.outstanding_requests = m.outstanding_requests.saturating_sub(1);
            m.delivered += 1;
        });
    }

    pub(crate) fn on_failed(&self) {
        self.update(|m| {
            m.outstanding_requests = m.outstanding_requests.saturating_sub(1);
            m.failed += 1;
        });
    }

    pub(crate) fn on_retry(&self) {
        self.update(|m| m.retries += 1);
    }

    pub(crate) fn set_leader(&self, leader: Option<NodeId>) {
        self.update(|m| m.current_leader = leader);
    }

    pub(crate) fn current_leader(&self) -> Option<NodeId> {
        self.lock_state().current_leader
    }

    fn update(&self, f: impl FnOnce(&mut ClientMetrics)) {
        let snapshot = {
            let mut state = self.lock_state();
            f(&mut state);
            state.clone()
        };
        if let Err(err) = self.tx.send(snapshot) {
            tracing::error!(error = %err, "error reporting client metrics");
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ClientMetrics> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
