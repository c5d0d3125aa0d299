//! switchyard-testkit: fixtures and shared scenarios for switchyard.
//!
//! Provides receivers that record how every request ended, stage hooks for
//! failure injection, scripted handlers, and scenarios that pump requests
//! end to end and check that nothing leaks.
//!
//! # Usage
//!
//! ```ignore
//! use switchyard::PumpMode;
//!
//! #[tokio::test(flavor = "multi_thread")]
//! async fn request_reply_async_pump() {
//!     switchyard_testkit::init_tracing();
//!     switchyard_testkit::run_request_reply(PumpMode::Async).await;
//! }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use switchyard::{
    ActionDemuxer, ChannelDispatcher, ConcurrencyMode, DispatchRuntime, Endpoint, EndpointTable,
    InstanceContextMode, Operation, PumpMode, Rpc, Stage, StageHook,
};
use switchyard_core::mem::{MemClient, MemReplyChannel, ReplyOutcome, ReplyWaiter};
use switchyard_core::{
    BoxedRequest, CommunicationState, Completion, DispatchError, DispatcherConfig, Message,
    Received, RequestContext, RequestReceiver, Scheduler, TransportError,
};

/// How long scenarios wait for anything before giving up.
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Fixture construction failed.
    Setup(String),
    Dispatch(DispatchError),
    Transport(TransportError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {}", msg),
            TestError::Dispatch(e) => write!(f, "dispatch error: {}", e),
            TestError::Transport(e) => write!(f, "transport error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<DispatchError> for TestError {
    fn from(e: DispatchError) -> Self {
        TestError::Dispatch(e)
    }
}

impl From<TransportError> for TestError {
    fn from(e: TransportError) -> Self {
        TestError::Transport(e)
    }
}

/// Install a test-friendly subscriber, filtered by `RUST_LOG`. Safe to call
/// from every test.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// The scheduler of the current tokio runtime.
pub fn scheduler() -> Result<Scheduler, TestError> {
    Scheduler::try_current()
        .ok_or_else(|| TestError::Setup("scenarios must run inside a tokio runtime".into()))
}

/// Poll `condition` until it holds or [`SCENARIO_TIMEOUT`] passes.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) -> Result<(), TestError> {
    let deadline = tokio::time::Instant::now() + SCENARIO_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return Err(TestError::Assertion(format!("timed out waiting for {what}")));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

/// Wait for a request's outcome.
pub async fn outcome(waiter: ReplyWaiter) -> Result<ReplyOutcome, TestError> {
    waiter
        .outcome_within(SCENARIO_TIMEOUT)
        .await
        .ok_or_else(|| TestError::Assertion("request never finished".into()))
}

/// Wait for a reply message, failing on anything else.
pub async fn expect_reply(waiter: ReplyWaiter) -> Result<Message, TestError> {
    match outcome(waiter).await? {
        ReplyOutcome::Replied(Some(reply)) => Ok(reply),
        other => Err(TestError::Assertion(format!("expected a reply, got {other:?}"))),
    }
}

/// Wait for a fault reply, failing on anything else.
pub async fn expect_fault(waiter: ReplyWaiter) -> Result<Message, TestError> {
    let reply = expect_reply(waiter).await?;
    if !reply.is_fault() {
        return Err(TestError::Assertion(format!(
            "expected a fault, got action {:?}",
            reply.action()
        )));
    }
    Ok(reply)
}

// ============================================================================
// Recording receivers
// ============================================================================

/// What happened to one request context.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RequestRecord {
    pub replies: usize,
    pub closes: usize,
    pub aborts: usize,
}

impl RequestRecord {
    pub fn terminations(&self) -> usize {
        self.closes + self.aborts
    }
}

/// Wraps a request context and counts every reply, close and abort.
pub struct RecordingRequest {
    inner: BoxedRequest,
    record: Arc<Mutex<RequestRecord>>,
}

impl RequestContext for RecordingRequest {
    fn request_message(&self) -> &Message {
        self.inner.request_message()
    }

    fn request_message_mut(&mut self) -> &mut Message {
        self.inner.request_message_mut()
    }

    fn reply(&mut self, reply: Option<Message>, timeout: Duration) -> Result<(), TransportError> {
        self.record.lock().replies += 1;
        self.inner.reply(reply, timeout)
    }

    fn close(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.record.lock().closes += 1;
        self.inner.close(timeout)
    }

    fn abort(&mut self) {
        self.record.lock().aborts += 1;
        self.inner.abort();
    }
}

/// A receiver that hands out [`RecordingRequest`]s and keeps their records.
/// Closes and aborts of the receiver itself are counted too.
pub struct RecordingReceiver {
    inner: Arc<dyn RequestReceiver>,
    records: Mutex<Vec<Arc<Mutex<RequestRecord>>>>,
    closes: AtomicUsize,
    aborts: AtomicUsize,
    this: Weak<RecordingReceiver>,
}

impl RecordingReceiver {
    pub fn new(inner: Arc<dyn RequestReceiver>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            inner,
            records: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            this: this.clone(),
        })
    }

    /// A recording session-less in-memory channel and its client.
    pub fn datagram() -> (Arc<Self>, MemClient) {
        let (channel, client) = MemReplyChannel::datagram();
        (Self::new(channel), client)
    }

    /// A recording in-memory session channel and its client.
    pub fn session() -> (Arc<Self>, MemClient) {
        let (channel, client) = MemReplyChannel::session();
        (Self::new(channel), client)
    }

    pub fn received(&self) -> usize {
        self.records.lock().len()
    }

    pub fn records(&self) -> Vec<RequestRecord> {
        self.records.lock().iter().map(|r| *r.lock()).collect()
    }

    /// Times the receiver itself was closed or aborted.
    pub fn terminations(&self) -> usize {
        self.closes.load(Ordering::SeqCst) + self.aborts.load(Ordering::SeqCst)
    }

    /// Requests that were closed or aborted.
    pub fn finished(&self) -> usize {
        self.records()
            .iter()
            .filter(|r| r.terminations() > 0)
            .count()
    }

    /// Every request was closed or aborted exactly once and replied to at
    /// most once.
    pub fn check_exactly_once(&self) -> Result<(), TestError> {
        for (index, record) in self.records().iter().enumerate() {
            if record.terminations() != 1 || record.replies > 1 {
                return Err(TestError::Assertion(format!(
                    "request #{index} was not finished exactly once: {record:?}"
                )));
            }
        }
        Ok(())
    }

    fn wrap(&self, request: BoxedRequest) -> BoxedRequest {
        let record = Arc::new(Mutex::new(RequestRecord::default()));
        self.records.lock().push(record.clone());
        Box::new(RecordingRequest {
            inner: request,
            record,
        })
    }

    fn wrap_received(
        &self,
        received: Result<Received<BoxedRequest>, TransportError>,
    ) -> Result<Received<BoxedRequest>, TransportError> {
        Ok(match received? {
            Received::Item(request) => Received::Item(self.wrap(request)),
            Received::Eof => Received::Eof,
            Received::TimedOut => Received::TimedOut,
        })
    }
}

impl RequestReceiver for RecordingReceiver {
    fn try_receive(&self, timeout: Duration) -> Result<Received<BoxedRequest>, TransportError> {
        let received = self.inner.try_receive(timeout);
        self.wrap_received(received)
    }

    fn begin_try_receive(
        &self,
        timeout: Duration,
    ) -> Completion<Result<Received<BoxedRequest>, TransportError>> {
        match self.inner.begin_try_receive(timeout) {
            Completion::Ready(received) => Completion::Ready(self.wrap_received(received)),
            Completion::Pending(rx) => {
                let (Some(scheduler), Some(this)) = (Scheduler::try_current(), self.this.upgrade())
                else {
                    return Completion::Ready(Ok(Received::Eof));
                };
                let (completer, completion) = Completion::pending();
                scheduler.resume_when(rx, move |received| {
                    let received = received.unwrap_or(Ok(Received::Eof));
                    completer.complete(this.wrap_received(received));
                });
                completion
            }
        }
    }

    fn wait_for_message(&self, timeout: Duration) -> Result<bool, TransportError> {
        self.inner.wait_for_message(timeout)
    }

    fn has_session(&self) -> bool {
        self.inner.has_session()
    }

    fn session_id(&self) -> Option<u64> {
        self.inner.session_id()
    }

    fn state(&self) -> CommunicationState {
        self.inner.state()
    }

    fn close(&self, timeout: Duration) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close(timeout)
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.inner.abort();
    }
}

// ============================================================================
// Handlers and hooks
// ============================================================================

/// Replies with the request's `n` header, counting calls.
pub fn echo_operation(action: &str, calls: Arc<AtomicUsize>) -> Operation {
    Operation::sync("echo", action, move |invocation| {
        calls.fetch_add(1, Ordering::SeqCst);
        let mut reply = Message::new("unused");
        if let Some(n) = invocation.message.header("n") {
            reply = reply.with_header("n", n);
        }
        Ok(Some(reply))
    })
}

/// [`echo_operation`] as an async handler, so every stage after the
/// invocation runs on a resumed continuation.
pub fn async_echo_operation(action: &str, calls: Arc<AtomicUsize>) -> Operation {
    Operation::future("echo", action, move |invocation| {
        let calls = calls.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            calls.fetch_add(1, Ordering::SeqCst);
            let mut reply = Message::new("unused");
            if let Some(n) = invocation.message.header("n") {
                reply = reply.with_header("n", n);
            }
            Ok(Some(reply))
        }
    })
}

/// A handler that blocks until the gate opens.
pub fn gated_operation(action: &str, gate: Arc<Gate>) -> Operation {
    Operation::sync("gated", action, move |_| {
        gate.pass();
        Ok(Some(Message::new("unused")))
    })
}

/// Holds handlers until opened, tracking how many ran at once.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
    entered: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block until the gate is open.
    pub fn pass(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
        drop(open);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

/// Fails the pipeline right before `stage` runs.
pub struct FailAt {
    stage: Stage,
    fired: AtomicUsize,
}

impl FailAt {
    pub fn new(stage: Stage) -> Arc<Self> {
        Arc::new(Self {
            stage,
            fired: AtomicUsize::new(0),
        })
    }

    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }
}

impl StageHook for FailAt {
    fn before_stage(&self, stage: Stage, _call: &Rpc) -> Result<(), DispatchError> {
        if stage != self.stage {
            return Ok(());
        }
        self.fired.fetch_add(1, Ordering::SeqCst);
        Err(DispatchError::handler(format!("injected failure before {stage}")))
    }
}

/// Records the stages every call passes through.
#[derive(Default)]
pub struct StageRecorder {
    seen: Mutex<Vec<(u64, Stage)>>,
}

impl StageRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stages of one call, in the order they ran.
    pub fn stages(&self, call_id: u64) -> Vec<Stage> {
        self.seen
            .lock()
            .iter()
            .filter(|(id, _)| *id == call_id)
            .map(|(_, stage)| *stage)
            .collect()
    }

    pub fn calls(&self) -> Vec<u64> {
        let mut calls: Vec<u64> = self.seen.lock().iter().map(|(id, _)| *id).collect();
        calls.dedup();
        calls
    }
}

impl StageHook for StageRecorder {
    fn before_stage(&self, stage: Stage, call: &Rpc) -> Result<(), DispatchError> {
        self.seen.lock().push((call.id(), stage));
        Ok(())
    }
}

/// An endpoint table with one catch-all endpoint.
pub fn single_endpoint(runtime: Arc<DispatchRuntime>) -> EndpointTable {
    EndpointTable::new().with_endpoint(Endpoint::new("test", runtime))
}

// ============================================================================
// Scenarios
// ============================================================================

/// Three sequential requests on a datagram channel all get their replies.
pub async fn run_request_reply(mode: PumpMode) {
    let result = run_request_reply_inner(mode).await;
    if let Err(e) = result {
        panic!("run_request_reply failed: {}", e);
    }
}

async fn run_request_reply_inner(mode: PumpMode) -> Result<(), TestError> {
    let scheduler = scheduler()?;
    let calls = Arc::new(AtomicUsize::new(0));
    let runtime = DispatchRuntime::builder(
        ActionDemuxer::new().with_operation(echo_operation("urn:echo", calls.clone())),
        scheduler.clone(),
    )
    .instance_mode(InstanceContextMode::PerCall)
    .build();
    let dispatcher =
        ChannelDispatcher::new(single_endpoint(runtime), DispatcherConfig::default(), scheduler)
            .with_pump_mode(mode);
    let (receiver, client) = RecordingReceiver::datagram();
    let handler = dispatcher.listen(receiver.clone());

    for n in 0..3 {
        let request = Message::request("urn:echo").with_header("n", n.to_string());
        let id = request.message_id();
        let reply = expect_reply(client.send(request)?).await?;
        if reply.relates_to() != id {
            return Err(TestError::Assertion(format!(
                "reply relates to {:?}, expected {:?}",
                reply.relates_to(),
                id
            )));
        }
        if reply.action() != Some("urn:echoResponse") {
            return Err(TestError::Assertion(format!(
                "unexpected reply action {:?}",
                reply.action()
            )));
        }
        let echoed = n.to_string();
        if reply.header("n") != Some(echoed.as_str()) {
            return Err(TestError::Assertion(format!("reply for #{n} lost its header")));
        }
    }

    client.close();
    wait_until("the pump to stop", || handler.is_stopped() && !handler.is_pumping()).await?;
    receiver.check_exactly_once()?;
    if calls.load(Ordering::SeqCst) != 3 {
        return Err(TestError::Assertion("handler did not run three times".into()));
    }
    let throttle = dispatcher.throttle();
    if throttle.active_calls() != 0 || throttle.active_instance_contexts() != 0 {
        return Err(TestError::Assertion(format!(
            "throttle slots leaked: calls={} instances={}",
            throttle.active_calls(),
            throttle.active_instance_contexts()
        )));
    }
    Ok(())
}

/// Where [`run_failure_at`] injects its failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureScenario {
    /// Datagram receiver, synchronous handler.
    Datagram,
    /// Session receiver: the service channel is torn down exactly once.
    Session,
    /// Async handler: stages after the invocation run on the continuation
    /// the scheduler resumed.
    Suspended,
}

impl FailureScenario {
    pub const ALL: [FailureScenario; 3] = [Self::Datagram, Self::Session, Self::Suspended];
}

/// A failure injected right before `stage` still finishes the request
/// exactly once, tears the receiver down exactly once, and leaves no lock or
/// throttle slot behind.
pub async fn run_failure_at(stage: Stage, scenario: FailureScenario) {
    let result = run_failure_at_inner(stage, scenario).await;
    if let Err(e) = result {
        panic!("run_failure_at({stage}, {scenario:?}) failed: {}", e);
    }
}

async fn run_failure_at_inner(stage: Stage, scenario: FailureScenario) -> Result<(), TestError> {
    let scheduler = scheduler()?;
    let calls = Arc::new(AtomicUsize::new(0));
    let fail = FailAt::new(stage);
    let operation = match scenario {
        FailureScenario::Suspended => async_echo_operation("urn:echo", calls.clone()),
        FailureScenario::Datagram | FailureScenario::Session => {
            echo_operation("urn:echo", calls.clone())
        }
    };
    let runtime = DispatchRuntime::builder(
        ActionDemuxer::new().with_operation(operation),
        scheduler.clone(),
    )
    .instance_mode(InstanceContextMode::Single)
    .concurrency_mode(ConcurrencyMode::Single)
    .stage_hook(fail.clone())
    .build();
    let dispatcher = ChannelDispatcher::new(
        single_endpoint(runtime.clone()),
        DispatcherConfig::default(),
        scheduler,
    );
    let (receiver, client) = match scenario {
        FailureScenario::Session => RecordingReceiver::session(),
        FailureScenario::Datagram | FailureScenario::Suspended => RecordingReceiver::datagram(),
    };
    let handler = dispatcher.listen(receiver.clone());

    let outcome = outcome(client.send(Message::request("urn:echo"))?).await?;
    tracing::debug!(%stage, ?scenario, ?outcome, "injected failure outcome");
    let before_invoke = stage <= Stage::BeginInvoke;
    if before_invoke && calls.load(Ordering::SeqCst) != 0 {
        return Err(TestError::Assertion(format!(
            "handler ran despite a failure before {stage}"
        )));
    }

    client.close();
    wait_until("the pump to stop", || handler.is_stopped() && !handler.is_pumping()).await?;
    receiver.check_exactly_once()?;
    if receiver.terminations() != 1 {
        return Err(TestError::Assertion(format!(
            "receiver closed or aborted {} times",
            receiver.terminations()
        )));
    }
    if let Some(channel) = handler.session_channel() {
        if !channel.is_closed() {
            return Err(TestError::Assertion("session channel left open".into()));
        }
    }
    if fail.fired() != 1 {
        return Err(TestError::Assertion(format!(
            "hook fired {} times",
            fail.fired()
        )));
    }
    if let Some(instance) = runtime.singleton() {
        let stats = instance.lock_stats();
        if instance.is_locked() || stats.locks != stats.unlocks {
            return Err(TestError::Assertion(format!(
                "instance lock left unbalanced: {stats:?}"
            )));
        }
    }
    let throttle = dispatcher.throttle();
    if throttle.active_calls() != 0
        || throttle.active_instance_contexts() > 1
        || throttle.active_sessions() != 0
    {
        return Err(TestError::Assertion(format!(
            "throttle slots leaked: calls={} instances={} sessions={}",
            throttle.active_calls(),
            throttle.active_instance_contexts(),
            throttle.active_sessions()
        )));
    }
    Ok(())
}

/// With one call slot, concurrent requests park behind the throttle and
/// each is resumed exactly once when the slot frees up.
pub async fn run_throttle_parks_and_resumes(mode: PumpMode) {
    let result = run_throttle_parks_and_resumes_inner(mode).await;
    if let Err(e) = result {
        panic!("run_throttle_parks_and_resumes failed: {}", e);
    }
}

async fn run_throttle_parks_and_resumes_inner(mode: PumpMode) -> Result<(), TestError> {
    let scheduler = scheduler()?;
    let gate = Gate::new();
    let runtime = DispatchRuntime::builder(
        ActionDemuxer::new().with_operation(gated_operation("urn:work", gate.clone())),
        scheduler.clone(),
    )
    .instance_mode(InstanceContextMode::PerCall)
    .concurrency_mode(ConcurrencyMode::Multiple)
    .build();
    let config = DispatcherConfig {
        max_concurrent_calls: 1,
        ..DispatcherConfig::default()
    };
    let dispatcher = ChannelDispatcher::new(single_endpoint(runtime), config, scheduler)
        .with_pump_mode(mode);
    let (receiver, client) = RecordingReceiver::datagram();
    let handler = dispatcher.listen(receiver.clone());

    let waiters = (0..3)
        .map(|_| client.send(Message::request("urn:work")))
        .collect::<Result<Vec<_>, _>>()?;
    wait_until("the first call to enter", || gate.entered() == 1).await?;
    wait_until("a request to park", || handler.parked() == 1).await?;
    if dispatcher.throttle().active_calls() != 1 {
        return Err(TestError::Assertion("call throttle is not saturated".into()));
    }

    gate.open();
    for waiter in waiters {
        expect_reply(waiter).await?;
    }
    if gate.entered() != 3 || gate.max_active() != 1 {
        return Err(TestError::Assertion(format!(
            "expected 3 serialized calls, saw {} with {} at once",
            gate.entered(),
            gate.max_active()
        )));
    }

    client.close();
    wait_until("the pump to stop", || handler.is_stopped() && !handler.is_pumping()).await?;
    receiver.check_exactly_once()?;
    if handler.parked() != 0 || dispatcher.throttle().active_calls() != 0 {
        return Err(TestError::Assertion("parked admissions or call slots leaked".into()));
    }
    Ok(())
}
