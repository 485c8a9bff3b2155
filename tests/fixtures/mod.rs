//! Fixtures for testing the ordered Raft client.

#![allow(dead_code)]

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;
use raft_client::async_trait::async_trait;
use raft_client::CallId;
use raft_client::ClientMetrics;
use raft_client::ClientTransport;
use raft_client::Config;
use raft_client::ExponentialBackoff;
use raft_client::LeaderEventHandler;
use raft_client::NodeId;
use raft_client::RaftClient;
use raft_client::RaftClientReply;
use raft_client::RaftClientRequest;
use raft_client::RaftException;
use raft_client::RequestKind;
use raft_client::ResetSignal;
use raft_client::RetryPolicy;
use raft_client::TransportError;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing_subscriber::prelude::*;

/// A concrete client type used during testing.
pub type TestClient = RaftClient<String, String, TestTransport, CountingHandler>;

/// Initialize the tracing system.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let fmt_layer = tracing_subscriber::fmt::Layer::default()
            .with_span_events(tracing_subscriber::fmt::format::FmtSpan::FULL)
            .with_ansi(false);
        let subscriber = tracing_subscriber::Registry::default()
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber).expect("error setting global tracing subscriber");
    });
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// One scripted transport behavior, consumed per attempt arrival.
pub enum Action {
    /// Reply echoing the request's message.
    Reply,
    /// Reply carrying an embedded Raft exception.
    ReplyException(RaftException),
    /// A `None` reply: the client retries without an error.
    NullReply,
    /// Fail the attempt with a not-leader error.
    NotLeader { server: NodeId, suggested: Option<NodeId> },
    /// Fail the attempt with a group-mismatch error.
    GroupMismatch { server: NodeId },
    /// Fail the attempt with a retryable I/O error.
    IoError,
    /// Fail the attempt with a terminal non-I/O error.
    Fatal,
    /// Never resolve.
    Hold,
    /// Reply with the echo once the trigger fires.
    ReplyOn(oneshot::Receiver<()>),
    /// Perform the inner action once the trigger fires. The inner action must
    /// resolve immediately (no `Hold`, `ReplyOn` or nested `After`).
    After(oneshot::Receiver<()>, Box<Action>),
}

/// Resolve an immediately-resolvable action.
fn resolve_now(
    action: Action,
    request: &RaftClientRequest<String>,
) -> Result<Option<RaftClientReply<String>>, TransportError> {
    match action {
        Action::Reply => Ok(Some(echo(request))),
        Action::ReplyException(exception) => Ok(Some(RaftClientReply::with_exception(request.call_id, exception))),
        Action::NullReply => Ok(None),
        Action::NotLeader { server, suggested } => Err(TransportError::NotLeader {
            server,
            suggested_leader: suggested,
        }),
        Action::GroupMismatch { server } => Err(TransportError::GroupMismatch {
            server,
            group_id: request.group_id.clone(),
        }),
        Action::IoError => Err(TransportError::Io(anyhow::anyhow!("connection refused"))),
        Action::Fatal => Err(TransportError::Fatal(anyhow::anyhow!("codec failure"))),
        Action::Hold | Action::ReplyOn(_) | Action::After(..) => {
            panic!("action cannot be resolved immediately")
        }
    }
}

/// A type which emulates the cluster-facing transport.
///
/// Behaviors are scripted per `(window key, seq)` and consumed one per
/// attempt; unscripted attempts echo the request's message back. Every
/// request handed to the transport is recorded in arrival order so tests can
/// assert on the wire traffic.
pub struct TestTransport {
    script: Mutex<HashMap<(String, u64), VecDeque<Action>>>,
    log: Mutex<Vec<RaftClientRequest<String>>>,
    arrivals_tx: watch::Sender<u64>,
    arrivals_rx: watch::Receiver<u64>,
}

impl TestTransport {
    pub fn new() -> Arc<Self> {
        let (arrivals_tx, arrivals_rx) = watch::channel(0);
        Arc::new(Self {
            script: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            arrivals_tx,
            arrivals_rx,
        })
    }

    /// Script the behaviors for attempts of `seq` on the window named `key`.
    pub fn script(&self, key: &str, seq: u64, actions: Vec<Action>) {
        self.script.lock().unwrap().insert((key.to_string(), seq), actions.into());
    }

    /// Every request the transport has seen, in arrival order.
    pub fn requests(&self) -> Vec<RaftClientRequest<String>> {
        self.log.lock().unwrap().clone()
    }

    /// Every request routed to the window named `key`, in arrival order.
    pub fn requests_for(&self, key: &str) -> Vec<RaftClientRequest<String>> {
        self.requests().into_iter().filter(|request| window_key(request) == key).collect()
    }

    /// Wait until the transport has seen at least `n` requests.
    pub async fn wait_for_requests(&self, n: u64, timeout: Duration, msg: &str) -> Result<()> {
        let mut rx = self.arrivals_rx.clone();
        loop {
            if *rx.borrow() >= n {
                return Ok(());
            }
            tokio::time::timeout(timeout, rx.changed()).await.context(msg.to_string())??;
        }
    }
}

/// The window key the client derives for a request.
pub fn window_key(request: &RaftClientRequest<String>) -> String {
    match request.kind {
        RequestKind::StaleRead { server } => server.to_string(),
        _ => "RAFT".to_string(),
    }
}

fn echo(request: &RaftClientRequest<String>) -> RaftClientReply<String> {
    let mut reply = RaftClientReply::new(request.call_id, request.message.clone());
    reply.index = Some(request.entry.seq);
    reply
}

#[async_trait]
impl ClientTransport<String, String> for TestTransport {
    async fn send_request(
        &self,
        request: RaftClientRequest<String>,
    ) -> Result<Option<RaftClientReply<String>>, TransportError> {
        let key = window_key(&request);
        let seq = request.entry.seq;

        let count = {
            let mut log = self.log.lock().unwrap();
            log.push(request.clone());
            log.len() as u64
        };
        let _ = self.arrivals_tx.send(count);

        let action = {
            let mut script = self.script.lock().unwrap();
            script.get_mut(&(key, seq)).and_then(|actions| actions.pop_front())
        };

        match action.unwrap_or(Action::Reply) {
            Action::Hold => {
                futures::future::pending::<()>().await;
                Ok(None)
            }
            Action::ReplyOn(trigger) => {
                let _ = trigger.await;
                Ok(Some(echo(&request)))
            }
            Action::After(trigger, inner) => {
                let _ = trigger.await;
                resolve_now(*inner, &request)
            }
            action => resolve_now(action, &request),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A leadership handler which counts hook invocations and keeps the default
/// reset behavior.
#[derive(Default)]
pub struct CountingHandler {
    pub leader_exceptions: AtomicUsize,
    pub not_leader: AtomicUsize,
    pub io_errors: AtomicUsize,
}

impl LeaderEventHandler for CountingHandler {
    fn handle_leader_exception(&self, _call_id: CallId, _suggested_leader: Option<NodeId>, reset: &ResetSignal) {
        self.leader_exceptions.fetch_add(1, Ordering::SeqCst);
        reset.request();
    }

    fn handle_not_leader_exception(&self, _call_id: CallId, _suggested_leader: Option<NodeId>, reset: &ResetSignal) {
        self.not_leader.fetch_add(1, Ordering::SeqCst);
        reset.request();
    }

    fn handle_io_exception(&self, _call_id: CallId, _error: &anyhow::Error, _reset: &ResetSignal) {
        self.io_errors.fetch_add(1, Ordering::SeqCst);
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A tight backoff so retry paths run quickly under test.
pub fn fast_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        base_sleep: Duration::from_millis(5),
        max_sleep: Duration::from_millis(20),
        max_attempts: None,
    }
}

/// Build a client over the given transport with the stock test tuning.
pub fn new_client(transport: Arc<TestTransport>) -> (TestClient, Arc<CountingHandler>) {
    new_client_with(transport, 100, Arc::new(fast_backoff()))
}

/// Build a client with an explicit admission limit and retry policy.
pub fn new_client_with(
    transport: Arc<TestTransport>,
    max_outstanding: usize,
    retry_policy: Arc<dyn RetryPolicy>,
) -> (TestClient, Arc<CountingHandler>) {
    let config = Arc::new(
        Config::build("test-group".into())
            .max_outstanding_requests(max_outstanding)
            .validate()
            .expect("failed to build client config"),
    );
    let handler = Arc::new(CountingHandler::default());
    let client = RaftClient::new(config, transport, retry_policy, handler.clone());
    (client, handler)
}

/// Wait for the client metrics to satisfy the given condition.
pub async fn wait_for_metrics<F>(client: &TestClient, condition: F, timeout: Duration, msg: &str) -> Result<()>
where
    F: Fn(&ClientMetrics) -> bool,
{
    let mut rx = client.metrics();
    loop {
        if condition(&rx.borrow()) {
            return Ok(());
        }
        tokio::time::timeout(timeout, rx.changed()).await.context(msg.to_string())??;
    }
}
