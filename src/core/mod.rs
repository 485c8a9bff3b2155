//! The sliding-window engine.
//!
//! Each window is a spawned task owning the window's entire state: the
//! outstanding map, the first-seq anchor and the next seq to assign. Every
//! mutation arrives as an event on the window's channel, so the event loop is
//! the window's single linearization point and no lock is held anywhere in
//! the engine. Transport attempts and retry sleeps run as separate tasks
//! which post their outcome back onto the same channel.

pub(crate) mod pending;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::sleep;
use tracing::Span;
use tracing_futures::Instrument;

use crate::client::ClientId;
use crate::client::RaftClientReply;
use crate::client::RaftException;
use crate::client::RequestKind;
use crate::core::pending::PendingRequest;
use crate::core::pending::ReplyTx;
use crate::error::ClientError;
use crate::error::TransportError;
use crate::metrics::MetricsReporter;
use crate::network::ClientTransport;
use crate::network::LeaderEventHandler;
use crate::network::ResetSignal;
use crate::retry::RetryForeverNoSleep;
use crate::retry::RetryPolicy;
use crate::AppData;
use crate::AppDataResponse;
use crate::CallId;
use crate::MessageSummary;
use crate::NodeId;

/// Just ensure the event loop yields periodically when draining a REALLY hot
/// window feed.
const DRAIN_LIMIT: usize = 64;

/// The public handle to a spawned window task.
pub(crate) struct WindowHandle<D, R>
where
    D: AppData,
    R: AppDataResponse,
{
    /// The channel used for communicating with the window task.
    pub tx: mpsc::UnboundedSender<(WindowEvent<D, R>, Span)>,
}

impl<D, R> Clone for WindowHandle<D, R>
where
    D: AppData,
    R: AppDataResponse,
{
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

/// An event driving a window task.
pub(crate) enum WindowEvent<D, R>
where
    D: AppData,
    R: AppDataResponse,
{
    /// A newly admitted call to sequence onto this window.
    Submit {
        call_id: CallId,
        kind: RequestKind,
        message: Option<D>,
        tx: ReplyTx<R>,
        permit: OwnedSemaphorePermit,
    },
    /// A retry timer fired: re-send the attempt for `seq`. Never reassigns
    /// the seq.
    Attempt { seq: u64 },
    /// The transport finished one attempt for `seq`.
    TransportResult {
        seq: u64,
        result: Result<Option<RaftClientReply<R>>, TransportError>,
    },
    /// Re-stamp the smallest outstanding seq as the window's first.
    ResetFirst,
    /// Fail everything outstanding and stop the task.
    Shutdown,
}

/// A task owning one sliding window: it assigns sequence numbers, tracks the
/// outstanding requests, drives retries, and delivers replies to callers in
/// seq order.
pub(crate) struct WindowCore<D, R, T, E>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
    E: LeaderEventHandler,
{
    /// The key this window is registered under.
    key: String,
    client_id: ClientId,
    group_id: String,

    /// The `ClientTransport` implementation.
    transport: Arc<T>,
    /// The configured retry policy; leader-hinted retries substitute the
    /// no-sleep policy instead.
    retry_policy: Arc<dyn RetryPolicy>,
    /// The leadership hooks.
    events: Arc<E>,
    metrics: Arc<MetricsReporter>,

    /// The next seq to assign. Strictly increasing for the lifetime of the
    /// window; never reset.
    next_seq: u64,
    /// The seq currently anchoring the window, or `None` when the window is
    /// empty.
    first_seq: Option<u64>,
    /// Outstanding requests by seq. Entries are removed only from the head,
    /// and only once resolved, which is what keeps delivery in seq order.
    outstanding: BTreeMap<u64, PendingRequest<D, R>>,

    tx_self: mpsc::UnboundedSender<(WindowEvent<D, R>, Span)>,
    rx: mpsc::UnboundedReceiver<(WindowEvent<D, R>, Span)>,
}

impl<D, R, T, E> WindowCore<D, R, T, E>
where
    D: AppData,
    R: AppDataResponse,
    T: ClientTransport<D, R>,
    E: LeaderEventHandler,
{
    /// Spawn a new window task for the given key.
    pub(crate) fn spawn(
        key: String,
        client_id: ClientId,
        group_id: String,
        transport: Arc<T>,
        retry_policy: Arc<dyn RetryPolicy>,
        events: Arc<E>,
        metrics: Arc<MetricsReporter>,
    ) -> WindowHandle<D, R> {
        let (tx, rx) = mpsc::unbounded_channel();
        let this = Self {
            key,
            client_id,
            group_id,
            transport,
            retry_policy,
            events,
            metrics,
            next_seq: 1,
            first_seq: None,
            outstanding: BTreeMap::new(),
            tx_self: tx.clone(),
            rx,
        };

        let _handle = tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")));

        WindowHandle { tx }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(window = %self.key))]
    async fn main(mut self) {
        loop {
            let (event, span) = match self.rx.recv().await {
                Some(event_span) => event_span,
                None => break,
            };
            if self.drain_events(event, span) {
                break;
            }
        }
        self.fail_window(ClientError::ShuttingDown);
        tracing::debug!("window task has shutdown");
    }

    /// Process the received event, then keep draining whatever else is
    /// already queued before parking again. Returns `true` on shutdown.
    fn drain_events(&mut self, first: WindowEvent<D, R>, span: Span) -> bool {
        let mut event_opt = Some((first, span));
        let mut iters = 0;
        loop {
            let (event, span) = match event_opt.take() {
                Some(event) => event,
                None => return false,
            };

            let _ent = span.enter();

            if let WindowEvent::Shutdown = event {
                return true;
            }
            self.handle_event(event, &span);

            // Stop looking ahead once the limit is reached; an event dequeued
            // here is always handled before the loop may return.
            if iters >= DRAIN_LIMIT {
                return false;
            }
            if let Some(next) = self.rx.recv().now_or_never() {
                match next {
                    Some(event_span) => event_opt = Some(event_span),
                    None => return true,
                }
            }
            iters += 1;
        }
    }

    fn handle_event(&mut self, event: WindowEvent<D, R>, span: &Span) {
        match event {
            WindowEvent::Submit {
                call_id,
                kind,
                message,
                tx,
                permit,
            } => self.handle_submit(call_id, kind, message, tx, permit, span),
            WindowEvent::Attempt { seq } => self.handle_attempt(seq),
            WindowEvent::TransportResult { seq, result } => self.handle_transport_result(seq, result),
            WindowEvent::ResetFirst => self.reset_first_seq(),
            // Handled by the event loop before dispatch.
            WindowEvent::Shutdown => {}
        }
    }

    /// Assign the next seq, register the pending, and hand its first attempt
    /// to the transport. The new request becomes the window's first iff the
    /// window was empty.
    fn handle_submit(
        &mut self,
        call_id: CallId,
        kind: RequestKind,
        message: Option<D>,
        tx: ReplyTx<R>,
        permit: OwnedSemaphorePermit,
        span: &Span,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let pending = PendingRequest::new(
            seq,
            self.client_id,
            call_id,
            self.group_id.clone(),
            kind,
            message,
            tx,
            span.clone(),
            permit,
        );

        if self.first_seq.is_none() {
            self.first_seq = Some(seq);
        }
        self.outstanding.insert(seq, pending);
        self.metrics.on_submit();

        tracing::debug!(seq, call_id, "registered new request");
        self.send_attempt(seq);
    }

    /// A retry timer fired. Retrying re-sends the same pending: the seq is
    /// never reassigned.
    fn handle_attempt(&mut self, seq: u64) {
        self.send_attempt(seq);
    }

    /// Whether `seq` is the window's current first.
    fn is_first(&self, seq: u64) -> bool {
        self.first_seq == Some(seq)
    }

    /// Hand one attempt of `seq` to the transport.
    fn send_attempt(&mut self, seq: u64) {
        let leader_hint = self.metrics.current_leader();
        let is_first = self.is_first(seq);

        let pending = match self.outstanding.get_mut(&seq) {
            Some(pending) => pending,
            None => return,
        };
        if pending.is_resolved() {
            return;
        }
        if is_first {
            pending.set_first();
        }

        let request = pending.build(leader_hint);
        let attempt = pending.note_attempt();
        let span = pending.span();
        tracing::debug!(attempt, request = %request.summary(), "sending request");

        let transport = self.transport.clone();
        let tx_self = self.tx_self.clone();
        tokio::spawn(
            async move {
                let result = transport.send_request(request).await;
                let _ = tx_self.send((WindowEvent::TransportResult { seq, result }, span));
            }
            .instrument(tracing::debug_span!("attempt", seq, attempt)),
        );
    }

    fn handle_transport_result(&mut self, seq: u64, result: Result<Option<RaftClientReply<R>>, TransportError>) {
        // Late results for a seq which has already been delivered or failed
        // are dropped here.
        if !self.outstanding.contains_key(&seq) {
            tracing::trace!(seq, "dropping result for a request no longer outstanding");
            return;
        }

        match result {
            Ok(Some(reply)) => match reply.exception {
                Some(RaftException::NotLeader {
                    server,
                    suggested_leader,
                }) => self.on_leader_exception(seq, server, suggested_leader),
                Some(RaftException::LeaderNotReady { server }) => {
                    tracing::debug!(seq, server, "leader not ready, scheduling retry");
                    self.schedule_retry(seq, None);
                }
                _ => self.receive_reply(seq, reply),
            },
            Ok(None) => {
                tracing::debug!(seq, "no reply yet, scheduling retry");
                self.schedule_retry(seq, None);
            }
            Err(TransportError::NotLeader {
                server,
                suggested_leader,
            }) => self.on_not_leader(seq, server, suggested_leader),
            Err(TransportError::GroupMismatch { server, group_id }) => {
                tracing::error!(seq, server, %group_id, "group mismatch, failing window");
                self.fail_window(ClientError::GroupMismatch { server, group_id });
            }
            Err(TransportError::Io(cause)) => self.on_io_error(seq, cause),
            Err(error @ TransportError::Fatal(_)) => {
                tracing::error!(seq, error = %error, "fatal transport error, failing window");
                self.fail_window(ClientError::Transport(Arc::new(error)));
            }
        }
    }

    /// A normal reply carried a not-leader exception.
    fn on_leader_exception(&mut self, seq: u64, server: NodeId, suggested: Option<NodeId>) {
        tracing::debug!(seq, server, ?suggested, "reply carried a not-leader exception");
        let call_id = match self.outstanding.get(&seq) {
            Some(pending) => pending.call_id(),
            None => return,
        };

        if let Some(leader) = suggested {
            self.metrics.set_leader(Some(leader));
        }
        let reset = ResetSignal::new();
        self.events.handle_leader_exception(call_id, suggested, &reset);
        if reset.is_requested() {
            self.reset_first_seq();
        }
        self.schedule_retry(seq, no_sleep_when_hinted(suggested));
    }

    /// The transport rejected an attempt with a not-leader error.
    fn on_not_leader(&mut self, seq: u64, server: NodeId, suggested: Option<NodeId>) {
        tracing::debug!(seq, server, ?suggested, "server is not the leader");
        let call_id = match self.outstanding.get(&seq) {
            Some(pending) => pending.call_id(),
            None => return,
        };

        if let Some(leader) = suggested {
            self.metrics.set_leader(Some(leader));
        }
        let reset = ResetSignal::new();
        self.events.handle_not_leader_exception(call_id, suggested, &reset);
        if reset.is_requested() {
            self.reset_first_seq();
        }
        self.schedule_retry(seq, no_sleep_when_hinted(suggested));
    }

    /// A retryable I/O failure: retry per the configured policy, or fail the
    /// window once the policy refuses.
    fn on_io_error(&mut self, seq: u64, cause: anyhow::Error) {
        let (call_id, attempts, kind, last) = match self.outstanding.get(&seq) {
            Some(pending) => (
                pending.call_id(),
                pending.attempts(),
                *pending.kind(),
                pending.last_built().map(|request| request.summary()),
            ),
            None => return,
        };

        if !self.retry_policy.should_retry(attempts, &kind) {
            tracing::warn!(seq, attempts, last = ?last, error = %cause, "no more retries, failing window");
            self.fail_window(ClientError::RetriesExhausted {
                attempts,
                cause: Arc::new(TransportError::Io(cause)),
            });
            return;
        }

        tracing::warn!(seq, attempts, error = %cause, "io error, scheduling retry");
        let reset = ResetSignal::new();
        self.events.handle_io_exception(call_id, &cause, &reset);
        if reset.is_requested() {
            self.reset_first_seq();
        }
        self.schedule_retry(seq, None);
    }

    /// Arm the retry timer for `seq`. The timer posts an `Attempt` event
    /// back; scheduling never reassigns the seq.
    ///
    /// `policy` overrides the configured retry policy for this one attempt
    /// (the no-sleep policy while a leader hint is in hand).
    fn schedule_retry(&mut self, seq: u64, policy: Option<&dyn RetryPolicy>) {
        let pending = match self.outstanding.get(&seq) {
            Some(pending) => pending,
            None => return,
        };
        let policy = policy.unwrap_or(&*self.retry_policy);
        let sleep_for = policy.sleep_time(pending.attempts(), pending.kind());
        let span = pending.span();
        tracing::debug!(seq, attempt = pending.attempts(), ?sleep_for, "scheduling retry");

        self.metrics.on_retry();
        let tx_self = self.tx_self.clone();
        tokio::spawn(
            async move {
                sleep(sleep_for).await;
                let _ = tx_self.send((WindowEvent::Attempt { seq }, span));
            }
            .instrument(tracing::debug_span!("retry", seq)),
        );
    }

    /// Record a reply and surface every now-contiguous reply from the head of
    /// the window, in seq order.
    fn receive_reply(&mut self, seq: u64, reply: RaftClientReply<R>) {
        if let Some(pending) = self.outstanding.get_mut(&seq) {
            tracing::debug!(seq, reply = %reply.summary(), "received reply");
            pending.record_reply(reply);
        }
        self.deliver_from_head();
    }

    fn deliver_from_head(&mut self) {
        loop {
            let head = match self.outstanding.keys().next().copied() {
                Some(head) => head,
                None => break,
            };
            match self.outstanding.get(&head) {
                Some(pending) if pending.has_reply() => {}
                _ => break,
            }
            if let Some(pending) = self.outstanding.remove(&head) {
                pending.deliver();
                self.metrics.on_delivered();
            }
        }

        // If the head shifted, the new first is re-sent immediately so the
        // server sees the window's new anchor on the wire.
        match self.outstanding.keys().next().copied() {
            Some(head) => {
                if self.first_seq != Some(head) {
                    self.first_seq = Some(head);
                    tracing::debug!(first = head, "window first moved, re-sending");
                    self.send_attempt(head);
                }
            }
            None => self.first_seq = None,
        }
    }

    /// Re-stamp the smallest outstanding seq as the window's first so its
    /// next rebuild anchors the server window again. Idempotent.
    fn reset_first_seq(&mut self) {
        let head = match self.outstanding.keys().next().copied() {
            Some(head) => head,
            None => {
                self.first_seq = None;
                return;
            }
        };
        self.first_seq = Some(head);
        if let Some(pending) = self.outstanding.get_mut(&head) {
            pending.set_first();
        }
        tracing::debug!(first = head, "window first seq reset");
    }

    /// Terminal failure: every outstanding request in this window shares
    /// `error`'s fate, since delivering around a gap would break in-order
    /// delivery.
    fn fail_window(&mut self, error: ClientError) {
        let outstanding = std::mem::take(&mut self.outstanding);
        let failed = outstanding.len();
        if failed > 0 {
            tracing::warn!(failed, error = %error, "failing all outstanding requests in window");
        }
        for (_seq, pending) in outstanding {
            pending.fail(error.clone());
            self.metrics.on_failed();
        }
        self.first_seq = None;
    }
}

/// The no-sleep policy applies while a leader hint is in hand; otherwise the
/// configured policy decides the pacing.
fn no_sleep_when_hinted(suggested: Option<NodeId>) -> Option<&'static dyn RetryPolicy> {
    static NO_SLEEP: RetryForeverNoSleep = RetryForeverNoSleep;
    match suggested {
        Some(_) => Some(&NO_SLEEP),
        None => None,
    }
}
