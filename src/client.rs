//! Public Raft client interface and wire data types.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use rand::RngCore;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::core::WindowCore;
use crate::core::WindowEvent;
use crate::core::WindowHandle;
use crate::error::ClientError;
use crate::error::ClientResult;
use crate::metrics::ClientMetrics;
use crate::metrics::MetricsReporter;
use crate::network::ClientTransport;
use crate::network::LeaderEventHandler;
use crate::retry::RetryPolicy;
use crate::AppData;
use crate::AppDataResponse;
use crate::CallId;
use crate::MessageSummary;
use crate::NodeId;

/// The window key shared by every leader-directed request.
pub(crate) const RAFT_WINDOW_KEY: &str = "RAFT";

struct ClientInner<D, R, T, E>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
    E: LeaderEventHandler,
{
    config: Arc<Config>,
    transport: Arc<T>,
    retry_policy: Arc<dyn RetryPolicy>,
    events: Arc<E>,
    client_id: ClientId,
    next_call_id: AtomicU64,
    admission: Arc<Semaphore>,
    windows: Mutex<HashMap<String, WindowHandle<D, R>>>,
    metrics: Arc<MetricsReporter>,
    rx_metrics: watch::Receiver<ClientMetrics>,
}

impl<D, R, T, E> ClientInner<D, R, T, E>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
    E: LeaderEventHandler,
{
    fn next_call_id(&self) -> CallId {
        self.next_call_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Get or lazily create the sliding window a request of the given kind
    /// belongs to: a dedicated window per server for stale reads, the shared
    /// `"RAFT"` window for everything else.
    fn window_for(&self, kind: &RequestKind) -> WindowHandle<D, R> {
        let key = match kind {
            RequestKind::StaleRead { server } => server.to_string(),
            _ => RAFT_WINDOW_KEY.to_string(),
        };

        let mut windows = self.lock_windows();
        windows
            .entry(key.clone())
            .or_insert_with(|| {
                WindowCore::spawn(
                    key,
                    self.client_id,
                    self.config.group_id.clone(),
                    self.transport.clone(),
                    self.retry_policy.clone(),
                    self.events.clone(),
                    self.metrics.clone(),
                )
            })
            .clone()
    }

    fn lock_windows(&self) -> MutexGuard<'_, HashMap<String, WindowHandle<D, R>>> {
        match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The ordered asynchronous Raft client.
///
/// All request submission flows through [`RaftClient::send`]: the call is
/// admitted against the client-wide in-flight limit, assigned a call id,
/// sequenced onto its sliding window, and completed when the cluster's reply
/// for it can be delivered in submission order.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone
/// itself is very cheap and helps to facilitate use with async workflows.
pub struct RaftClient<D, R, T, E>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
    E: LeaderEventHandler,
{
    inner: Arc<ClientInner<D, R, T, E>>,
}

impl<D, R, T, E> RaftClient<D, R, T, E>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
    E: LeaderEventHandler,
{
    /// Create a new Raft client.
    ///
    /// ### `config`
    /// The client's runtime config. See the docs on the `Config` object for
    /// more details.
    ///
    /// ### `transport`
    /// An implementation of the `ClientTransport` trait which will be used
    /// for sending request attempts to the cluster.
    ///
    /// ### `retry_policy`
    /// The policy applied between attempts of a request which failed with a
    /// retryable error. A distinguished no-sleep policy is substituted
    /// automatically while a leader hint is in hand.
    ///
    /// ### `events`
    /// An implementation of the `LeaderEventHandler` trait, invoked on
    /// leader-change signals and retryable I/O failures.
    pub fn new(config: Arc<Config>, transport: Arc<T>, retry_policy: Arc<dyn RetryPolicy>, events: Arc<E>) -> Self {
        let admission = Arc::new(Semaphore::new(config.max_outstanding_requests));
        let (metrics, rx_metrics) = MetricsReporter::new();
        let inner = ClientInner {
            config,
            transport,
            retry_policy,
            events,
            client_id: ClientId::random(),
            next_call_id: AtomicU64::new(0),
            admission,
            windows: Mutex::new(HashMap::new()),
            metrics,
            rx_metrics,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit a client request to the cluster.
    ///
    /// The returned future resolves once the request's reply can be handed
    /// out in submission order relative to every other request on the same
    /// window. If the request or any window-mate of it fails terminally, the
    /// future resolves with the shared failure instead.
    ///
    /// This method suspends while the client is at its
    /// `max_outstanding_requests` limit. A request which could not be
    /// admitted (because the client is shutting down) was never registered
    /// anywhere and holds no resources.
    #[tracing::instrument(level = "debug", skip(self, message))]
    pub async fn send(&self, kind: RequestKind, message: Option<D>) -> ClientResult<RaftClientReply<R>> {
        let permit = self
            .inner
            .admission
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClientError::ShuttingDown)?;

        let span = tracing::debug_span!("CH");
        let call_id = self.inner.next_call_id();
        let window = self.inner.window_for(&kind);

        let (tx, rx) = oneshot::channel();
        window
            .tx
            .send((
                WindowEvent::Submit {
                    call_id,
                    kind,
                    message,
                    tx,
                    permit,
                },
                span,
            ))
            .map_err(|_| ClientError::ShuttingDown)?;

        rx.await.map_err(|_| ClientError::ShuttingDown).and_then(|res| res)
    }

    /// Submit a mutating request, to be appended to the Raft log and applied
    /// to the cluster's state machine.
    pub async fn write(&self, message: D) -> ClientResult<RaftClientReply<R>> {
        self.send(RequestKind::Write, Some(message)).await
    }

    /// Submit a linearizable read, served by the leader.
    pub async fn read(&self, message: D) -> ClientResult<RaftClientReply<R>> {
        self.send(RequestKind::Read, Some(message)).await
    }

    /// Submit a read served locally by the addressed server, which may lag
    /// behind the leader.
    ///
    /// Stale reads are sequenced on a window dedicated to the addressed
    /// server and are unordered relative to leader-directed requests.
    pub async fn stale_read(&self, message: D, server: NodeId) -> ClientResult<RaftClientReply<R>> {
        self.send(RequestKind::StaleRead { server }, Some(message)).await
    }

    /// Watch the log entry at `index` until it reaches the given replication
    /// level.
    pub async fn watch(&self, index: u64, replication: ReplicationLevel) -> ClientResult<RaftClientReply<R>> {
        self.send(RequestKind::Watch { index, replication }, None).await
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<ClientMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// The latest leader hint observed from the cluster.
    ///
    /// This is only a routing hint: it is updated from not-leader rejections
    /// and may lag behind an election in progress.
    pub fn current_leader(&self) -> Option<NodeId> {
        self.inner.rx_metrics.borrow().current_leader
    }

    /// This client's identity, carried on every request.
    pub fn client_id(&self) -> ClientId {
        self.inner.client_id
    }

    /// Shut this client down.
    ///
    /// Callers blocked on admission fail immediately with `ShuttingDown`;
    /// outstanding requests are failed the same way, and their admission
    /// permits are released.
    pub fn shutdown(&self) {
        self.inner.admission.close();
        let windows = self.inner.lock_windows();
        for window in windows.values() {
            let _ = window.tx.send((WindowEvent::Shutdown, tracing::debug_span!("shutdown")));
        }
    }
}

impl<D, R, T, E> Clone for RaftClient<D, R, T, E>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
    E: LeaderEventHandler,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A 128-bit identity for a client process.
///
/// It is carried on every request, next to the call id, so servers can key
/// their per-client dedup and window state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId([u8; 16]);

impl ClientId {
    /// Generate a fresh random client identity.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// The per-request window coordinates serialized onto the wire.
///
/// Exactly one outstanding request per window carries `is_first = true` at
/// any time: the one whose seq equals the window's current first seq. The
/// server uses it to anchor its own per-client window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindowEntry {
    pub seq: u64,
    pub is_first: bool,
}

impl MessageSummary for SlidingWindowEntry {
    fn summary(&self) -> String {
        format!("seq={}, first={}", self.seq, self.is_first)
    }
}

/// How broadly a watched log entry must be replicated before the watch
/// completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationLevel {
    Majority,
    All,
    MajorityCommitted,
    AllCommitted,
}

/// The kind of a client request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// A mutating request appended to the Raft log.
    Write,
    /// A linearizable read served by the leader.
    Read,
    /// A read served locally by the addressed server, possibly stale.
    StaleRead { server: NodeId },
    /// Wait until the log entry at `index` reaches the given replication
    /// level.
    Watch { index: u64, replication: ReplicationLevel },
}

/// Where an attempt is routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestTarget {
    /// Routed to the cluster leader. The hint is the client's latest known
    /// leader, if any; the transport falls back to its own discovery when
    /// the hint is absent or wrong.
    Leader { hint: Option<NodeId> },
    /// Routed to a specific server.
    Server(NodeId),
}

/// A Raft-level exception embedded in an otherwise normal reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum RaftException {
    /// The addressed server is not the leader. Handled by the client: the
    /// window is re-anchored and the request retried, so callers never
    /// observe this variant unless a transport hands it back abnormally.
    #[error("server {server} is not the leader")]
    NotLeader {
        server: NodeId,
        suggested_leader: Option<NodeId>,
    },

    /// The addressed server is the leader but has not caught up enough to
    /// serve the request yet. Handled by the client as a plain retry.
    #[error("leader {server} is not ready to serve requests")]
    LeaderNotReady { server: NodeId },

    /// A watched entry has not reached its requested replication level.
    #[error("call {call_id} has not reached replication level {replication:?}")]
    NotReplicated {
        call_id: CallId,
        replication: ReplicationLevel,
    },

    /// The state machine rejected the request.
    #[error("state machine exception: {message}")]
    StateMachine { message: String },
}

/// A single attempt of a client call, as handed to the transport.
///
/// Rebuilt before every attempt, so the sliding-window entry and the leader
/// hint are current at the moment the attempt leaves the client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RaftClientRequest<D: AppData> {
    pub client_id: ClientId,
    pub call_id: CallId,
    pub group_id: String,
    pub kind: RequestKind,
    pub target: RequestTarget,
    pub entry: SlidingWindowEntry,
    /// The application payload. Watch requests carry none.
    #[serde(bound = "D: AppData")]
    pub message: Option<D>,
}

impl<D: AppData> MessageSummary for RaftClientRequest<D> {
    fn summary(&self) -> String {
        format!(
            "call_id={}, kind={:?}, target={:?}, {}",
            self.call_id,
            self.kind,
            self.target,
            self.entry.summary()
        )
    }
}

/// The cluster's reply to a client request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RaftClientReply<R: AppDataResponse> {
    /// The call id of the request this reply answers.
    pub call_id: CallId,
    /// The log index assigned to a committed write, when the server reports
    /// one.
    pub index: Option<u64>,
    /// Application specific response data.
    #[serde(bound = "R: AppDataResponse")]
    pub data: Option<R>,
    /// A Raft-level exception carried inside the reply, if any.
    pub exception: Option<RaftException>,
}

impl<R: AppDataResponse> RaftClientReply<R> {
    /// Create a successful reply.
    pub fn new(call_id: CallId, data: Option<R>) -> Self {
        Self {
            call_id,
            index: None,
            data,
            exception: None,
        }
    }

    /// Create a reply carrying an embedded exception.
    pub fn with_exception(call_id: CallId, exception: RaftException) -> Self {
        Self {
            call_id,
            index: None,
            data: None,
            exception: Some(exception),
        }
    }
}

impl<R: AppDataResponse> MessageSummary for RaftClientReply<R> {
    fn summary(&self) -> String {
        match &self.exception {
            Some(exception) => format!("call_id={}, exception={}", self.call_id, exception),
            None => format!("call_id={}, index={:?}", self.call_id, self.index),
        }
    }
}
