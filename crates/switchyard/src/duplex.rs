//! Request/reply correlation over a duplex channel.
//!
//! ```text
//!   send_request ──► pending[message_id] ──► channel.send
//!                          ▲
//!   pump ── receive ──► route_incoming(relates_to) ──► complete request
//!                          │ miss
//!                          ├─► tombstone hit: late reply, dropped
//!                          └─► fresh inbound request
//! ```
//!
//! A pending request completes exactly once, with whichever of reply, send
//! failure, timeout or abort gets there first, and only after its send has
//! finished. The correlation entry is removed exactly once as well; an entry
//! that times out while its send is still running stays in the table until
//! the send finishes, so a late reply can still be recognised.
//!
//! Someone receives whenever the table is not empty: the pump, a blocking
//! caller waiting on its own reply, or a drain worker that such a caller
//! hands the channel to when it leaves with requests still pending.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use switchyard_core::{
    Completer, Completion, DispatchError, DuplexChannel, EndpointAddress, Message, MessageId,
    Received, Scheduler, TransportError, DEFAULT_MAX_REPLY_TOMBSTONES, INFINITE_TIMEOUT,
};
use tokio::task::JoinHandle;

/// Why a duplex request produced no reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplexError {
    Timeout(Duration),
    /// The binder or its channel was aborted.
    Aborted,
    Send(TransportError),
    /// The channel reached end of stream.
    Closed,
}

impl fmt::Display for DuplexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(after) => write!(f, "no reply within {after:?}"),
            Self::Aborted => write!(f, "duplex channel aborted"),
            Self::Send(e) => write!(f, "request send failed: {e}"),
            Self::Closed => write!(f, "duplex channel closed"),
        }
    }
}

impl std::error::Error for DuplexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Send(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DuplexError> for DispatchError {
    fn from(e: DuplexError) -> Self {
        match e {
            DuplexError::Timeout(after) => DispatchError::Timeout(after),
            DuplexError::Aborted => DispatchError::Transport(TransportError::Aborted),
            DuplexError::Send(e) => DispatchError::Transport(e),
            DuplexError::Closed => DispatchError::Transport(TransportError::Closed),
        }
    }
}

pub type ReplyResult = Result<Message, DuplexError>;

/// How long a blocking caller or drain worker waits on one receive before
/// checking whether it is still needed.
const RECEIVE_SLICE: Duration = Duration::from_millis(50);

type Observer = Arc<dyn Fn(MessageId, &ReplyResult) + Send + Sync>;

// ============================================================================
// Pending requests
// ============================================================================

struct Completed {
    completer: Completer<ReplyResult>,
    outcome: ReplyResult,
    timer: Option<JoinHandle<()>>,
}

struct PendingState {
    /// The send finished; only now may the request complete.
    enable_complete: bool,
    sending: bool,
    outcome: Option<ReplyResult>,
    done: bool,
    completer: Option<Completer<ReplyResult>>,
    timer: Option<JoinHandle<()>>,
}

impl PendingState {
    /// Record `outcome` unless another one got there first.
    fn offer(&mut self, outcome: ReplyResult) -> bool {
        if self.done || self.outcome.is_some() {
            return false;
        }
        self.outcome = Some(outcome);
        true
    }

    fn try_complete(&mut self) -> Option<Completed> {
        if self.done || !self.enable_complete {
            return None;
        }
        let outcome = self.outcome.take()?;
        let completer = self.completer.take()?;
        self.done = true;
        Some(Completed {
            completer,
            outcome,
            timer: self.timer.take(),
        })
    }

    fn timed_out(&self) -> bool {
        matches!(self.outcome, Some(Err(DuplexError::Timeout(_))))
    }
}

struct PendingRequest {
    id: MessageId,
    state: Mutex<PendingState>,
}

impl PendingRequest {
    fn is_done(&self) -> bool {
        self.state.lock().done
    }
}

struct PendingTable {
    requests: HashMap<MessageId, Arc<PendingRequest>>,
    /// Timed out while their send was still running.
    timed_out: Vec<MessageId>,
    /// Set once the channel is gone; new requests fail with it.
    closed: Option<DuplexError>,
    /// Workers receiving from the channel.
    receivers: usize,
}

impl PendingTable {
    /// Nobody needs replies routed any more.
    fn settled(&self) -> bool {
        self.requests.is_empty() || self.closed.is_some()
    }

    fn forget(&mut self, id: MessageId) -> Option<Arc<PendingRequest>> {
        self.timed_out.retain(|t| *t != id);
        self.requests.remove(&id)
    }
}

/// Correlation keys of requests that finished without their reply.
struct Tombstones {
    order: VecDeque<MessageId>,
    set: HashSet<MessageId>,
    capacity: usize,
}

impl Tombstones {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: MessageId) {
        if self.capacity == 0 || !self.set.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    fn take(&mut self, id: MessageId) -> bool {
        if !self.set.remove(&id) {
            return false;
        }
        self.order.retain(|t| *t != id);
        true
    }
}

// ============================================================================
// Request handle
// ============================================================================

/// Resolves to the reply of one request.
pub struct RequestHandle {
    id: MessageId,
    completion: Completion<ReplyResult>,
}

impl RequestHandle {
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Block until the request completes. Must not be called from within an
    /// async task.
    pub fn wait_blocking(self) -> ReplyResult {
        self.completion
            .wait_blocking()
            .unwrap_or(Err(DuplexError::Aborted))
    }

    pub async fn wait(self) -> ReplyResult {
        self.completion.wait().await.unwrap_or(Err(DuplexError::Aborted))
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle").field("id", &self.id).finish()
    }
}

// ============================================================================
// Binder
// ============================================================================

/// Correlates requests sent on a duplex channel with the replies that come
/// back on it.
///
/// Replies are delivered by whoever receives from the channel: [`Self::pump`],
/// or a caller of [`Self::request`] that found nobody receiving and waits
/// for its reply inline.
pub struct DuplexBinder {
    channel: Arc<dyn DuplexChannel>,
    scheduler: Scheduler,
    pending: Mutex<PendingTable>,
    tombstones: Mutex<Tombstones>,
    observer: Option<Observer>,
}

impl DuplexBinder {
    pub fn new(channel: Arc<dyn DuplexChannel>, scheduler: Scheduler) -> Self {
        Self {
            channel,
            scheduler,
            pending: Mutex::new(PendingTable {
                requests: HashMap::new(),
                timed_out: Vec::new(),
                closed: None,
                receivers: 0,
            }),
            tombstones: Mutex::new(Tombstones::new(DEFAULT_MAX_REPLY_TOMBSTONES)),
            observer: None,
        }
    }

    /// How many late-reply keys to remember. Zero disables tombstones.
    pub fn with_max_tombstones(self, capacity: usize) -> Self {
        *self.tombstones.lock() = Tombstones::new(capacity);
        self
    }

    /// Called once per request with its final outcome.
    pub fn with_observer(
        mut self,
        observer: impl Fn(MessageId, &ReplyResult) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn channel(&self) -> &Arc<dyn DuplexChannel> {
        &self.channel
    }

    /// Requests still in the correlation table.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().requests.len()
    }

    /// Timed-out requests whose send has not finished yet.
    pub fn timed_out_count(&self) -> usize {
        self.pending.lock().timed_out.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.lock().set.len()
    }

    /// Whether a pump, blocking caller or drain worker is receiving.
    pub fn is_receiving(&self) -> bool {
        self.pending.lock().receivers > 0
    }

    /// Register `message` under its message id, send it, and hand back a
    /// handle for its reply.
    pub fn send_request(
        self: &Arc<Self>,
        message: Message,
        timeout: Duration,
    ) -> Result<RequestHandle, DuplexError> {
        self.register_and_send(message, timeout).map(|(_, handle)| handle)
    }

    fn register_and_send(
        self: &Arc<Self>,
        mut message: Message,
        timeout: Duration,
    ) -> Result<(Arc<PendingRequest>, RequestHandle), DuplexError> {
        let id = stamp(&mut message);
        let (completer, completion) = Completion::pending();
        let request = Arc::new(PendingRequest {
            id,
            state: Mutex::new(PendingState {
                enable_complete: false,
                sending: true,
                outcome: None,
                done: false,
                completer: Some(completer),
                timer: None,
            }),
        });
        {
            let mut table = self.pending.lock();
            if let Some(error) = &table.closed {
                return Err(error.clone());
            }
            table.requests.insert(id, request.clone());
            tracing::debug!(%id, pending = table.requests.len(), "request registered");
        }

        let this = Arc::downgrade(self);
        let timer = self.scheduler.after(timeout, move || {
            if let Some(binder) = this.upgrade() {
                binder.on_timeout(id, timeout);
            }
        });
        {
            let mut state = request.state.lock();
            if state.done {
                timer.abort();
            } else {
                state.timer = Some(timer);
            }
        }

        match self.channel.begin_send(message, timeout) {
            Completion::Ready(result) => self.send_finished(&request, result),
            Completion::Pending(rx) => {
                let this = self.clone();
                let sending = request.clone();
                self.scheduler.resume_when(rx, move |sent| {
                    this.send_finished(&sending, sent.unwrap_or(Err(TransportError::Aborted)));
                });
            }
        }
        Ok((request, RequestHandle { id, completion }))
    }

    fn send_finished(&self, request: &PendingRequest, result: Result<(), TransportError>) {
        let id = request.id;
        let completed = {
            let mut table = self.pending.lock();
            let mut state = request.state.lock();
            state.sending = false;
            state.enable_complete = true;
            match result {
                Err(error) => {
                    tracing::debug!(%id, %error, "request send failed");
                    state.offer(Err(DuplexError::Send(error)));
                    table.forget(id);
                }
                Ok(()) if state.timed_out() => {
                    if table.forget(id).is_some() {
                        self.tombstones.lock().insert(id);
                    }
                }
                Ok(()) => {}
            }
            state.try_complete()
        };
        self.finish(id, completed);
    }

    fn on_timeout(&self, id: MessageId, after: Duration) {
        let completed = {
            let mut table = self.pending.lock();
            let Some(request) = table.requests.get(&id).cloned() else {
                return;
            };
            let mut state = request.state.lock();
            if !state.offer(Err(DuplexError::Timeout(after))) {
                return;
            }
            if state.sending {
                table.timed_out.push(id);
            } else {
                table.forget(id);
                self.tombstones.lock().insert(id);
            }
            tracing::debug!(%id, ?after, sending = state.sending, "request timed out");
            state.try_complete()
        };
        self.finish(id, completed);
    }

    fn finish(&self, id: MessageId, completed: Option<Completed>) {
        let Some(Completed {
            completer,
            outcome,
            timer,
        }) = completed
        else {
            return;
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(observer) = &self.observer {
            observer(id, &outcome);
        }
        if !completer.complete(outcome) {
            tracing::debug!(%id, "request completed after its caller went away");
        }
    }

    /// Deliver `message` to the pending request it relates to.
    ///
    /// Returns `None` when the message was consumed: delivered, or
    /// recognised as a late reply and dropped. Anything else comes back to
    /// the caller as a fresh inbound message.
    pub fn route_incoming(&self, message: Message) -> Option<Message> {
        let Some(id) = message.relates_to() else {
            return Some(message);
        };
        let request = self.pending.lock().forget(id);
        if let Some(request) = request {
            let completed = {
                let mut state = request.state.lock();
                if !state.offer(Ok(message)) {
                    tracing::warn!(%id, "late reply after the request completed; dropped");
                }
                state.try_complete()
            };
            self.finish(id, completed);
            return None;
        }
        if self.tombstones.lock().take(id) {
            tracing::warn!(%id, "late reply for a timed-out request; dropped");
            return None;
        }
        Some(message)
    }

    /// Fail every pending request with [`DuplexError::Aborted`] and abort the
    /// channel.
    pub fn abort(&self) {
        if self.fail_all(DuplexError::Aborted) {
            self.channel.abort();
        }
    }

    /// Drain the table and complete everything in it with `error`. False if
    /// the binder was already closed.
    fn fail_all(&self, error: DuplexError) -> bool {
        let (drained, swept) = {
            let mut table = self.pending.lock();
            if table.closed.is_some() {
                return false;
            }
            table.closed = Some(error.clone());
            let swept = std::mem::take(&mut table.timed_out).len();
            let drained: Vec<_> = table.requests.drain().map(|(_, r)| r).collect();
            (drained, swept)
        };
        tracing::debug!(
            pending = drained.len(),
            swept,
            %error,
            "failing pending requests"
        );
        for request in drained {
            let completed = {
                let mut state = request.state.lock();
                state.offer(Err(error.clone()));
                state.enable_complete = true;
                state.try_complete()
            };
            self.finish(request.id, completed);
        }
        true
    }

    /// Send `message` and wait for its reply, blocking the thread.
    ///
    /// When nobody is receiving from the channel the caller receives itself
    /// until its reply is in: other replies met on the way go to their
    /// requests, and messages that match no request are dropped. If requests
    /// are still pending when it leaves, a drain worker takes over receiving
    /// for them.
    pub fn request(self: &Arc<Self>, message: Message, timeout: Duration) -> ReplyResult {
        let (request, handle) = self.register_and_send(message, timeout)?;
        if self.claim_receive() {
            tracing::trace!(id = %request.id, "nobody receiving; waiting for the reply inline");
            self.receive_while(|| !request.is_done());
            self.leave_receive();
        }
        handle.wait_blocking()
    }

    /// Become the receiver if there is none.
    fn claim_receive(&self) -> bool {
        let mut table = self.pending.lock();
        if table.receivers > 0 || table.closed.is_some() {
            return false;
        }
        table.receivers = 1;
        true
    }

    /// Stop receiving, or hand the job on when requests are still waiting
    /// for replies.
    fn leave_receive(self: &Arc<Self>) {
        {
            let mut table = self.pending.lock();
            if table.settled() {
                table.receivers -= 1;
                return;
            }
        }
        tracing::debug!("requests still pending; handing receive to a drain worker");
        let this = self.clone();
        self.scheduler.schedule(move || this.drain());
    }

    /// Receive for other callers until the table settles.
    fn drain(&self) {
        loop {
            self.receive_while(|| !self.pending.lock().settled());
            let mut table = self.pending.lock();
            if table.settled() {
                table.receivers -= 1;
                return;
            }
        }
    }

    /// Receive and route replies while `wanted` holds. End of stream fails
    /// everything pending; a receive error aborts.
    fn receive_while(&self, wanted: impl Fn() -> bool) {
        while wanted() {
            match self.channel.try_receive(RECEIVE_SLICE) {
                Ok(Received::Item(message)) => {
                    if let Some(unmatched) = self.route_incoming(message) {
                        tracing::warn!(
                            action = ?unmatched.action(),
                            relates_to = ?unmatched.relates_to(),
                            "no pump for unmatched message; dropped"
                        );
                    }
                }
                Ok(Received::TimedOut) => {}
                Ok(Received::Eof) => {
                    self.fail_all(DuplexError::Closed);
                    return;
                }
                Err(error) => {
                    tracing::debug!(%error, "receive failed while waiting for replies");
                    self.abort();
                    return;
                }
            }
        }
    }

    /// Receive until end of stream, routing replies and handing every other
    /// message to `on_message`. Pending requests fail once the channel is
    /// gone.
    pub fn pump(&self, mut on_message: impl FnMut(Message)) -> Result<(), DuplexError> {
        self.pending.lock().receivers += 1;
        let result = loop {
            match self.channel.try_receive(INFINITE_TIMEOUT) {
                Ok(Received::Item(message)) => {
                    let Some(message) = self.route_incoming(message) else {
                        continue;
                    };
                    if message.relates_to().is_some() {
                        tracing::warn!(
                            relates_to = ?message.relates_to(),
                            "reply matches no pending request; dropped"
                        );
                        continue;
                    }
                    on_message(message);
                }
                Ok(Received::TimedOut) => {}
                Ok(Received::Eof) => {
                    self.fail_all(DuplexError::Closed);
                    break Ok(());
                }
                Err(error) => {
                    tracing::warn!(%error, "duplex receive failed; aborting");
                    self.abort();
                    break Err(DuplexError::Aborted);
                }
            }
        };
        self.pending.lock().receivers -= 1;
        result
    }
}

impl fmt::Debug for DuplexBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexBinder")
            .field("pending", &self.pending_count())
            .field("tombstones", &self.tombstone_count())
            .finish_non_exhaustive()
    }
}

/// Give `message` a message id and an anonymous reply address if it has
/// none, returning the id.
fn stamp(message: &mut Message) -> MessageId {
    let headers = message.headers_mut();
    let id = *headers.message_id.get_or_insert_with(MessageId::new_unique);
    headers.reply_to.get_or_insert(EndpointAddress::Anonymous);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::mem::MemDuplexChannel;

    fn echo_peer(peer: Arc<MemDuplexChannel>) -> std::thread::JoinHandle<usize> {
        std::thread::spawn(move || {
            let mut served = 0;
            while let Ok(Received::Item(request)) = peer.try_receive(INFINITE_TIMEOUT) {
                let mut reply = Message::new("urn:reply");
                if let Some(id) = request.message_id() {
                    reply = reply.with_relates_to(id);
                }
                if peer.send(reply, Duration::from_secs(1)).is_err() {
                    break;
                }
                served += 1;
            }
            served
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pumped_reply_completes_the_request() {
        let (local, peer) = MemDuplexChannel::pair();
        let peer_thread = echo_peer(peer);
        let binder = Arc::new(DuplexBinder::new(
            local.clone(),
            Scheduler::try_current().unwrap(),
        ));
        let pump = {
            let binder = binder.clone();
            std::thread::spawn(move || binder.pump(|_| {}))
        };

        let handle = binder
            .send_request(Message::new("urn:ping"), Duration::from_secs(5))
            .unwrap();
        let reply = handle.wait().await.unwrap();
        assert_eq!(reply.action(), Some("urn:reply"));
        assert_eq!(binder.pending_count(), 0);

        local.close(Duration::from_secs(1)).unwrap();
        assert_eq!(peer_thread.join().unwrap(), 1);
        local.abort();
        assert!(pump.join().is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timeout_leaves_a_tombstone_for_the_late_reply() {
        let (local, _peer) = MemDuplexChannel::pair();
        let binder = Arc::new(DuplexBinder::new(local, Scheduler::try_current().unwrap()));
        let handle = binder
            .send_request(Message::new("urn:slow"), Duration::from_millis(20))
            .unwrap();
        let id = handle.id();
        assert_eq!(
            handle.wait().await.unwrap_err(),
            DuplexError::Timeout(Duration::from_millis(20))
        );
        assert_eq!(binder.pending_count(), 0);
        assert_eq!(binder.tombstone_count(), 1);

        let late = Message::new("urn:reply").with_relates_to(id);
        assert!(binder.route_incoming(late).is_none());
        assert_eq!(binder.tombstone_count(), 0);

        let stray = Message::new("urn:reply").with_relates_to(MessageId::new_unique());
        assert!(binder.route_incoming(stray).is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn abort_fails_and_drains_everything() {
        let (local, _peer) = MemDuplexChannel::pair();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let binder = Arc::new(
            DuplexBinder::new(local, Scheduler::try_current().unwrap())
                .with_observer(move |id, outcome| sink.lock().push((id, outcome.is_ok()))),
        );
        let handles: Vec<_> = (0..3)
            .map(|_| {
                binder
                    .send_request(Message::new("urn:work"), Duration::from_secs(30))
                    .unwrap()
            })
            .collect();
        binder.abort();
        for handle in handles {
            assert_eq!(handle.wait().await.unwrap_err(), DuplexError::Aborted);
        }
        assert_eq!(binder.pending_count(), 0);
        assert_eq!(binder.timed_out_count(), 0);
        assert_eq!(seen.lock().len(), 3);
        assert!(matches!(
            binder.send_request(Message::new("urn:work"), Duration::from_secs(1)),
            Err(DuplexError::Aborted)
        ));
    }

    #[test]
    fn tombstones_are_bounded_fifo() {
        let mut tombstones = Tombstones::new(2);
        let ids: Vec<_> = (1..=3).map(MessageId::from_raw).collect();
        for id in &ids {
            tombstones.insert(*id);
        }
        assert!(!tombstones.take(ids[0]));
        assert!(tombstones.take(ids[1]));
        assert!(tombstones.take(ids[2]));
        assert!(!tombstones.take(ids[2]));
    }
}
