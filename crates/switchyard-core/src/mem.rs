//! In-memory channels.
//!
//! [`MemReplyChannel`] is the receiving half of a request/reply channel and
//! [`MemClient`] the sending half. [`MemDuplexChannel::pair`] builds two
//! connected duplex endpoints.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;

use crate::{
    BoxedRequest, CommunicationState, Completion, DuplexChannel, Message, Received,
    RequestContext, RequestReceiver, TransportError,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    waiters: VecDeque<oneshot::Sender<Received<T>>>,
}

/// A closable FIFO with blocking and completion-based receive.
struct MemQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

impl<T> MemQueue<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
                waiters: VecDeque::new(),
            }),
            ready: Condvar::new(),
        }
    }

    fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(item);
        }
        let mut item = item;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(Received::Item(item)) {
                Ok(()) => return Ok(()),
                Err(Received::Item(back)) => item = back,
                Err(_) => return Ok(()),
            }
        }
        state.items.push_back(item);
        self.ready.notify_one();
        Ok(())
    }

    fn pop(&self, timeout: Duration) -> Received<T> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Received::Item(item);
            }
            if state.closed {
                return Received::Eof;
            }
            match deadline {
                None => self.ready.wait(&mut state),
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out() {
                        return match state.items.pop_front() {
                            Some(item) => Received::Item(item),
                            None if state.closed => Received::Eof,
                            None => Received::TimedOut,
                        };
                    }
                }
            }
        }
    }

    /// Receive without blocking; the completion stays pending until an item
    /// arrives or the queue closes.
    fn begin_pop(&self) -> Completion<Received<T>> {
        let mut state = self.state.lock();
        if let Some(item) = state.items.pop_front() {
            return Completion::Ready(Received::Item(item));
        }
        if state.closed {
            return Completion::Ready(Received::Eof);
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        Completion::Pending(rx)
    }

    fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if !state.items.is_empty() || state.closed {
                return true;
            }
            match deadline {
                None => self.ready.wait(&mut state),
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out() {
                        return !state.items.is_empty() || state.closed;
                    }
                }
            }
        }
    }

    fn close(&self) {
        let waiters = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.waiters)
        };
        self.ready.notify_all();
        for waiter in waiters {
            let _ = waiter.send(Received::Eof);
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

// ============================================================================
// Request/reply
// ============================================================================

/// What the client observed for one request.
#[derive(Debug)]
pub enum ReplyOutcome {
    Replied(Option<Message>),
    Closed,
    Aborted,
}

struct Delivery {
    message: Message,
    reply: oneshot::Sender<ReplyOutcome>,
}

/// The receiving half of an in-memory request/reply channel.
pub struct MemReplyChannel {
    queue: Arc<MemQueue<Delivery>>,
    session_id: Option<u64>,
    state: Mutex<CommunicationState>,
}

/// The sending half of an in-memory request/reply channel.
#[derive(Clone)]
pub struct MemClient {
    queue: Arc<MemQueue<Delivery>>,
}

impl MemReplyChannel {
    /// A session-less channel: every request is routed independently.
    pub fn datagram() -> (Arc<Self>, MemClient) {
        Self::build(None)
    }

    /// A session channel with a fresh session id.
    pub fn session() -> (Arc<Self>, MemClient) {
        Self::build(Some(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)))
    }

    fn build(session_id: Option<u64>) -> (Arc<Self>, MemClient) {
        let queue = Arc::new(MemQueue::new());
        let channel = Arc::new(Self {
            queue: queue.clone(),
            session_id,
            state: Mutex::new(CommunicationState::Opened),
        });
        (channel, MemClient { queue })
    }

    fn wrap(delivery: Delivery) -> BoxedRequest {
        Box::new(MemRequestContext {
            message: delivery.message,
            reply: Some(delivery.reply),
        })
    }
}

impl RequestReceiver for MemReplyChannel {
    fn try_receive(&self, timeout: Duration) -> Result<Received<BoxedRequest>, TransportError> {
        if *self.state.lock() == CommunicationState::Faulted {
            return Err(TransportError::Aborted);
        }
        Ok(match self.queue.pop(timeout) {
            Received::Item(delivery) => Received::Item(Self::wrap(delivery)),
            Received::Eof => Received::Eof,
            Received::TimedOut => Received::TimedOut,
        })
    }

    fn begin_try_receive(
        &self,
        timeout: Duration,
    ) -> Completion<Result<Received<BoxedRequest>, TransportError>> {
        match self.queue.begin_pop() {
            Completion::Ready(Received::Item(delivery)) => {
                Completion::Ready(Ok(Received::Item(Self::wrap(delivery))))
            }
            Completion::Ready(Received::Eof) => Completion::Ready(Ok(Received::Eof)),
            Completion::Ready(Received::TimedOut) => Completion::Ready(Ok(Received::TimedOut)),
            Completion::Pending(rx) => {
                // Re-wrap on a helper task so the caller gets request contexts.
                let (completer, completion) = Completion::pending();
                let Some(scheduler) = crate::Scheduler::try_current() else {
                    // No runtime: fall back to a blocking receive.
                    drop(rx);
                    return Completion::Ready(self.try_receive(timeout));
                };
                scheduler.spawn(async move {
                    let outcome = match rx.await {
                        Ok(Received::Item(delivery)) => Ok(Received::Item(Self::wrap(delivery))),
                        Ok(Received::Eof) | Err(_) => Ok(Received::Eof),
                        Ok(Received::TimedOut) => Ok(Received::TimedOut),
                    };
                    completer.complete(outcome);
                });
                completion
            }
        }
    }

    fn wait_for_message(&self, timeout: Duration) -> Result<bool, TransportError> {
        Ok(self.queue.wait_ready(timeout))
    }

    fn has_session(&self) -> bool {
        self.session_id.is_some()
    }

    fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    fn state(&self) -> CommunicationState {
        *self.state.lock()
    }

    fn close(&self, _timeout: Duration) -> Result<(), TransportError> {
        *self.state.lock() = CommunicationState::Closed;
        self.queue.close();
        Ok(())
    }

    fn abort(&self) {
        *self.state.lock() = CommunicationState::Faulted;
        self.queue.close();
    }
}

impl MemClient {
    /// Enqueue a request and get a handle to its outcome.
    pub fn send(&self, message: Message) -> Result<ReplyWaiter, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .push(Delivery { message, reply: tx })
            .map_err(|_| TransportError::Closed)?;
        Ok(ReplyWaiter { rx })
    }

    /// Signal end-of-stream to the receiver.
    pub fn close(&self) {
        self.queue.close();
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

/// Resolves when the service replies to, closes or aborts a request.
pub struct ReplyWaiter {
    rx: oneshot::Receiver<ReplyOutcome>,
}

impl ReplyWaiter {
    pub async fn outcome(self) -> ReplyOutcome {
        self.rx.await.unwrap_or(ReplyOutcome::Aborted)
    }

    pub async fn outcome_within(self, timeout: Duration) -> Option<ReplyOutcome> {
        tokio::time::timeout(timeout, self.outcome()).await.ok()
    }
}

struct MemRequestContext {
    message: Message,
    reply: Option<oneshot::Sender<ReplyOutcome>>,
}

impl RequestContext for MemRequestContext {
    fn request_message(&self) -> &Message {
        &self.message
    }

    fn request_message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    fn reply(&mut self, reply: Option<Message>, _timeout: Duration) -> Result<(), TransportError> {
        let tx = self.reply.take().ok_or(TransportError::Closed)?;
        tx.send(ReplyOutcome::Replied(reply))
            .map_err(|_| TransportError::Io("client went away".into()))
    }

    fn close(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(ReplyOutcome::Closed);
        }
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(ReplyOutcome::Aborted);
        }
    }
}

impl Drop for MemRequestContext {
    fn drop(&mut self) {
        if let Some(tx) = self.reply.take() {
            tracing::warn!("request context dropped without reply, close or abort");
            let _ = tx.send(ReplyOutcome::Aborted);
        }
    }
}

// ============================================================================
// Duplex
// ============================================================================

/// One end of an in-memory duplex channel.
pub struct MemDuplexChannel {
    inbound: Arc<MemQueue<Message>>,
    outbound: Arc<MemQueue<Message>>,
    session_id: u64,
    state: Mutex<CommunicationState>,
}

impl MemDuplexChannel {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a_to_b = Arc::new(MemQueue::new());
        let b_to_a = Arc::new(MemQueue::new());
        let session_id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let a = Arc::new(Self {
            inbound: b_to_a.clone(),
            outbound: a_to_b.clone(),
            session_id,
            state: Mutex::new(CommunicationState::Opened),
        });
        let b = Arc::new(Self {
            inbound: a_to_b,
            outbound: b_to_a,
            session_id,
            state: Mutex::new(CommunicationState::Opened),
        });
        (a, b)
    }
}

impl DuplexChannel for MemDuplexChannel {
    fn send(&self, message: Message, _timeout: Duration) -> Result<(), TransportError> {
        if !self.state.lock().is_open() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .push(message)
            .map_err(|_| TransportError::Closed)
    }

    fn try_receive(&self, timeout: Duration) -> Result<Received<Message>, TransportError> {
        if *self.state.lock() == CommunicationState::Faulted {
            return Err(TransportError::Aborted);
        }
        Ok(self.inbound.pop(timeout))
    }

    fn begin_try_receive(
        &self,
        _timeout: Duration,
    ) -> Completion<Result<Received<Message>, TransportError>> {
        match self.inbound.begin_pop() {
            Completion::Ready(received) => Completion::Ready(Ok(received)),
            Completion::Pending(rx) => {
                let (completer, completion) = Completion::pending();
                match crate::Scheduler::try_current() {
                    Some(scheduler) => {
                        scheduler.spawn(async move {
                            let received = rx.await.unwrap_or(Received::Eof);
                            completer.complete(Ok(received));
                        });
                        completion
                    }
                    None => Completion::Ready(Ok(rx.blocking_recv().unwrap_or(Received::Eof))),
                }
            }
        }
    }

    fn session_id(&self) -> Option<u64> {
        Some(self.session_id)
    }

    fn state(&self) -> CommunicationState {
        *self.state.lock()
    }

    fn close(&self, _timeout: Duration) -> Result<(), TransportError> {
        *self.state.lock() = CommunicationState::Closed;
        self.outbound.close();
        Ok(())
    }

    fn abort(&self) {
        *self.state.lock() = CommunicationState::Faulted;
        self.outbound.close();
        self.inbound.close();
    }
}
