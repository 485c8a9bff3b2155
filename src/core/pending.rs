use tokio::sync::oneshot;
use tokio::sync::OwnedSemaphorePermit;
use tracing::Span;

use crate::client::ClientId;
use crate::client::RaftClientReply;
use crate::client::RaftClientRequest;
use crate::client::RequestKind;
use crate::client::RequestTarget;
use crate::client::SlidingWindowEntry;
use crate::error::ClientError;
use crate::error::ClientResult;
use crate::AppData;
use crate::AppDataResponse;
use crate::CallId;
use crate::NodeId;

/// The caller's completion cell for one logical call.
pub(crate) type ReplyTx<R> = oneshot::Sender<ClientResult<RaftClientReply<R>>>;

/// One in-flight logical call on a sliding window: its wire template, attempt
/// bookkeeping, and the caller's completion cell.
///
/// The admission permit travels inside the pending and is released when the
/// pending is dropped, so exactly one permit is held per admitted call no
/// matter how the call ends.
pub(crate) struct PendingRequest<D, R>
where
    D: AppData,
    R: AppDataResponse,
{
    seq: u64,
    is_first: bool,
    client_id: ClientId,
    call_id: CallId,
    group_id: String,
    kind: RequestKind,
    message: Option<D>,
    last_built: Option<RaftClientRequest<D>>,
    attempts: usize,
    reply: Option<RaftClientReply<R>>,
    tx: Option<ReplyTx<R>>,
    span: Span,
    _permit: OwnedSemaphorePermit,
}

impl<D, R> PendingRequest<D, R>
where
    D: AppData,
    R: AppDataResponse,
{
    pub(crate) fn new(
        seq: u64,
        client_id: ClientId,
        call_id: CallId,
        group_id: String,
        kind: RequestKind,
        message: Option<D>,
        tx: ReplyTx<R>,
        span: Span,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            seq,
            is_first: false,
            client_id,
            call_id,
            group_id,
            kind,
            message,
            last_built: None,
            attempts: 0,
            reply: None,
            tx: Some(tx),
            span,
            _permit: permit,
        }
    }

    pub(crate) fn call_id(&self) -> CallId {
        self.call_id
    }

    pub(crate) fn kind(&self) -> &RequestKind {
        &self.kind
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts
    }

    /// The most recently built wire request, for logging.
    pub(crate) fn last_built(&self) -> Option<&RaftClientRequest<D>> {
        self.last_built.as_ref()
    }

    pub(crate) fn span(&self) -> Span {
        self.span.clone()
    }

    /// Whether the caller's completion cell has already been consumed.
    pub(crate) fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }

    pub(crate) fn has_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Flag this request as its window's first. Idempotent; once a request
    /// is the window's first it stays flagged until it is removed.
    pub(crate) fn set_first(&mut self) {
        self.is_first = true;
    }

    /// (Re)build the wire request with the current first flag and leader
    /// hint. Does not touch the attempt counter; attempts are counted when
    /// they are handed to the transport.
    pub(crate) fn build(&mut self, leader_hint: Option<NodeId>) -> RaftClientRequest<D> {
        let target = match self.kind {
            RequestKind::StaleRead { server } => RequestTarget::Server(server),
            _ => RequestTarget::Leader { hint: leader_hint },
        };
        let request = RaftClientRequest {
            client_id: self.client_id,
            call_id: self.call_id,
            group_id: self.group_id.clone(),
            kind: self.kind,
            target,
            entry: SlidingWindowEntry {
                seq: self.seq,
                is_first: self.is_first,
            },
            message: self.message.clone(),
        };
        self.last_built = Some(request.clone());
        request
    }

    /// Count one attempt handed to the transport, returning the new total.
    pub(crate) fn note_attempt(&mut self) -> usize {
        self.attempts += 1;
        self.attempts
    }

    /// Record the reply for this request. It is surfaced to the caller later,
    /// once every smaller seq on the window has completed.
    pub(crate) fn record_reply(&mut self, reply: RaftClientReply<R>) {
        if self.reply.is_none() {
            self.reply = Some(reply);
        }
    }

    /// Complete the caller with the recorded reply, translating an embedded
    /// exception into a caller-visible failure. No-op if already resolved.
    pub(crate) fn deliver(mut self) {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => return,
        };
        let mut reply = match self.reply.take() {
            Some(reply) => reply,
            None => return,
        };
        let res = match reply.exception.take() {
            Some(exception) => Err(ClientError::Raft(exception)),
            None => Ok(reply),
        };
        let _ = tx.send(res);
    }

    /// Terminally fail the caller. No-op if already resolved.
    pub(crate) fn fail(mut self, error: ClientError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(error));
        }
    }
}
