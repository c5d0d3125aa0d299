//! The channel pump.
//!
//! A [`ChannelHandler`] drains one receiver. Only the holder of the pump
//! token may receive; the token travels with a call that pauses or parks and
//! comes back through [`ChannelHandler::dispatch_done`] when that call
//! finishes, which schedules the next pump.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use switchyard_core::{
    BoxedRequest, Completion, DispatchError, DispatcherConfig, FatalError, Fault, FaultCode,
    LocalTransactionManager, Message, OperationContextScope, Received, RequestReceiver, Scheduler,
    ServiceThrottle, TransactionManager, TransactionScope, TransportError, INFINITE_TIMEOUT,
};
use switchyard_filter::FilterError;

use crate::admission::{self, Admission};
use crate::batch::SharedTransactedBatch;
use crate::idle::IdleManager;
use crate::{Endpoint, EndpointTable, ErrorBehavior, ErrorHandler, Lookup, ServiceChannel};

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// How the pump waits for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PumpMode {
    /// Block a worker on receive.
    #[default]
    Sync,
    /// Start a receive and yield the worker until it completes.
    Async,
}

/// Why a request never got a channel.
pub(crate) enum Refusal {
    /// Answer with this fault and close the request.
    Fault(Fault),
    /// Abort the request.
    Error(FilterError),
}

/// Shared configuration for every channel the host listens on.
pub struct ChannelDispatcher {
    endpoints: Arc<EndpointTable>,
    throttle: Arc<ServiceThrottle>,
    config: DispatcherConfig,
    scheduler: Scheduler,
    error_handlers: Vec<Arc<dyn ErrorHandler>>,
    transaction_manager: Arc<dyn TransactionManager>,
    pump_mode: PumpMode,
}

impl ChannelDispatcher {
    pub fn new(endpoints: EndpointTable, config: DispatcherConfig, scheduler: Scheduler) -> Self {
        Self {
            endpoints: Arc::new(endpoints),
            throttle: ServiceThrottle::new(&config, scheduler.clone()),
            config,
            scheduler,
            error_handlers: Vec::new(),
            transaction_manager: Arc::new(LocalTransactionManager),
            pump_mode: PumpMode::default(),
        }
    }

    /// Handlers for receive failures. Call failures go to the endpoint
    /// runtime's handlers instead.
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handlers.push(handler);
        self
    }

    pub fn with_pump_mode(mut self, mode: PumpMode) -> Self {
        self.pump_mode = mode;
        self
    }

    /// Manager for batch transactions.
    pub fn with_transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.transaction_manager = manager;
        self
    }

    pub fn throttle(&self) -> &Arc<ServiceThrottle> {
        &self.throttle
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// A handler for `receiver` that has not started pumping.
    pub fn attach(&self, receiver: Arc<dyn RequestReceiver>) -> Arc<ChannelHandler> {
        let batch = (self.config.max_batch_size > 0).then(|| {
            SharedTransactedBatch::new(
                self.transaction_manager.clone(),
                self.config.max_batch_size,
                self.config.transaction_timeout,
                self.scheduler.clone(),
            )
        });
        let handler = Arc::new(ChannelHandler {
            id: NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed),
            receiver,
            endpoints: self.endpoints.clone(),
            config: self.config.clone(),
            scheduler: self.scheduler.clone(),
            throttle: self.throttle.clone(),
            error_behavior: ErrorBehavior::new(self.error_handlers.clone(), false),
            mode: self.pump_mode,
            pump: AtomicBool::new(false),
            session_channel: Mutex::new(None),
            datagram_channels: Mutex::new(Vec::new()),
            parked: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            session_slot: AtomicBool::new(false),
            idle: Mutex::new(None),
            batch,
        });
        tracing::debug!(
            handler_id = handler.id,
            session = handler.receiver.has_session(),
            mode = ?handler.mode,
            "channel handler attached"
        );
        handler
    }

    /// Attach and start pumping.
    pub fn listen(&self, receiver: Arc<dyn RequestReceiver>) -> Arc<ChannelHandler> {
        let handler = self.attach(receiver);
        handler.open();
        handler
    }
}

impl std::fmt::Debug for ChannelDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelDispatcher")
            .field("endpoints", &self.endpoints.len())
            .field("pump_mode", &self.pump_mode)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Pumps one receiver into the dispatch pipeline.
pub struct ChannelHandler {
    id: u64,
    receiver: Arc<dyn RequestReceiver>,
    endpoints: Arc<EndpointTable>,
    config: DispatcherConfig,
    scheduler: Scheduler,
    throttle: Arc<ServiceThrottle>,
    error_behavior: ErrorBehavior,
    mode: PumpMode,
    pump: AtomicBool,
    session_channel: Mutex<Option<Arc<ServiceChannel>>>,
    datagram_channels: Mutex<Vec<Arc<ServiceChannel>>>,
    parked: AtomicUsize,
    stopped: AtomicBool,
    /// Set when this side tore the receiver down on purpose.
    closing: AtomicBool,
    session_slot: AtomicBool,
    idle: Mutex<Option<Arc<IdleManager>>>,
    batch: Option<Arc<SharedTransactedBatch>>,
}

impl ChannelHandler {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn receiver(&self) -> &Arc<dyn RequestReceiver> {
        &self.receiver
    }

    pub fn throttle(&self) -> &Arc<ServiceThrottle> {
        &self.throttle
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn mode(&self) -> PumpMode {
        self.mode
    }

    /// The receiver reached end of stream or was torn down.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// The service channel of a session receiver, once the first request
    /// created it.
    pub fn session_channel(&self) -> Option<Arc<ServiceChannel>> {
        self.session_channel.lock().clone()
    }

    /// Admissions waiting on a throttle.
    pub fn parked(&self) -> usize {
        self.parked.load(Ordering::Acquire)
    }

    pub(crate) fn batch(&self) -> Option<&Arc<SharedTransactedBatch>> {
        self.batch.as_ref()
    }

    pub(crate) fn park(&self) {
        self.parked.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpark(&self) {
        self.parked.fetch_sub(1, Ordering::AcqRel);
    }

    /// Start pumping. A session receiver first waits for a session slot.
    pub fn open(self: &Arc<Self>) {
        if !self.receiver.has_session() {
            self.ensure_pump();
            return;
        }
        let this = Arc::downgrade(self);
        let throttle = self.throttle.clone();
        let admitted = self.throttle.acquire_session(move || match this.upgrade() {
            Some(handler) => handler.session_admitted(),
            None => throttle.deactivate_channel(),
        });
        if admitted {
            self.session_admitted();
        } else {
            tracing::debug!(handler_id = self.id, "session parked behind throttle");
        }
    }

    fn session_admitted(self: &Arc<Self>) {
        self.session_slot.store(true, Ordering::Release);
        if self.is_stopped() {
            if self.session_slot.swap(false, Ordering::AcqRel) {
                self.throttle.deactivate_channel();
            }
            return;
        }
        if let Some(timeout) = self.config.session_idle_timeout {
            let this = Arc::downgrade(self);
            let idle = IdleManager::start(self.scheduler.clone(), timeout, move || {
                if let Some(handler) = this.upgrade() {
                    handler.on_idle();
                }
            });
            *self.idle.lock() = Some(idle);
        }
        tracing::debug!(handler_id = self.id, "session admitted");
        self.ensure_pump();
    }

    /// Take the pump token. Fails while another worker holds it.
    pub fn acquire_pump(&self) -> bool {
        let acquired = self
            .pump
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if acquired {
            tracing::debug!(handler_id = self.id, "pump acquired");
        }
        acquired
    }

    pub fn release_pump(&self) {
        if self.pump.swap(false, Ordering::AcqRel) {
            tracing::debug!(handler_id = self.id, "pump released");
        } else {
            tracing::warn!(handler_id = self.id, "pump released while not held");
        }
    }

    pub fn is_pumping(&self) -> bool {
        self.pump.load(Ordering::Acquire)
    }

    /// Schedule a pump on a fresh worker unless the receiver is done.
    pub fn ensure_pump(self: &Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        let this = self.clone();
        self.scheduler.schedule(move || this.pump());
    }

    /// A call that carried the pump token finished.
    pub fn dispatch_done(self: &Arc<Self>) {
        self.release_pump();
        self.ensure_pump();
    }

    /// Receive and dispatch until end of stream, or until a call takes the
    /// token with it.
    pub fn pump(self: &Arc<Self>) {
        if self.is_stopped() || !self.acquire_pump() {
            return;
        }
        match self.mode {
            PumpMode::Sync => self.pump_sync(),
            PumpMode::Async => self.pump_async(),
        }
    }

    fn pump_sync(self: &Arc<Self>) {
        let _context = OperationContextScope::preserve();
        loop {
            let _batch = self.batch_scope();
            let received = self.receiver.try_receive(INFINITE_TIMEOUT);
            match self.process(received) {
                Ok(true) => continue,
                Ok(false) => return,
                Err(fatal) => {
                    self.scheduler.fail_fast(fatal);
                    return;
                }
            }
        }
    }

    fn pump_async(self: &Arc<Self>) {
        let _context = OperationContextScope::preserve();
        loop {
            let _batch = self.batch_scope();
            match self.receiver.begin_try_receive(INFINITE_TIMEOUT) {
                Completion::Ready(received) => match self.process(received) {
                    Ok(true) => continue,
                    Ok(false) => return,
                    Err(fatal) => {
                        self.scheduler.fail_fast(fatal);
                        return;
                    }
                },
                Completion::Pending(rx) => {
                    let this = self.clone();
                    self.scheduler.resume_when(rx, move |received| {
                        let received = received.unwrap_or(Ok(Received::Eof));
                        let outcome = {
                            let _context = OperationContextScope::preserve();
                            let _batch = this.batch_scope();
                            this.process(received)
                        };
                        match outcome {
                            Ok(true) => this.pump_async(),
                            Ok(false) => {}
                            Err(fatal) => this.scheduler.fail_fast(fatal),
                        }
                    });
                    return;
                }
            }
        }
    }

    /// Ambient batch transaction for one receive and the dispatch it starts.
    fn batch_scope(&self) -> Option<TransactionScope> {
        self.batch
            .as_ref()
            .map(|batch| TransactionScope::enter(Some(batch.transaction())))
    }

    /// Handle one receive outcome while holding the pump. True means keep
    /// receiving.
    fn process(
        self: &Arc<Self>,
        received: Result<Received<BoxedRequest>, TransportError>,
    ) -> Result<bool, FatalError> {
        match received {
            Ok(Received::Item(request)) => self.handle_request(request),
            Ok(Received::TimedOut) => Ok(true),
            Ok(Received::Eof) => {
                self.on_eof();
                self.release_pump();
                Ok(false)
            }
            Err(error) => self.on_receive_error(error),
        }
    }

    /// Admit and dispatch a request received while holding the pump.
    ///
    /// Returns true when the caller still holds the pump. False means the
    /// request was parked behind a throttle or paused in the pipeline, and
    /// the pump is handed back through [`Self::dispatch_done`] later.
    pub fn handle_request(self: &Arc<Self>, request: BoxedRequest) -> Result<bool, FatalError> {
        self.touch_idle();
        tracing::debug!(
            handler_id = self.id,
            action = ?request.request_message().action(),
            "request received"
        );
        admission::admit(Admission::new(self.clone(), request))
    }

    pub fn touch_idle(&self) {
        if let Some(idle) = self.idle.lock().as_ref() {
            idle.touch();
        }
    }

    pub(crate) fn resolve_channel(
        &self,
        message: &Message,
    ) -> Result<Arc<ServiceChannel>, Refusal> {
        if self.receiver.has_session() {
            let mut slot = self.session_channel.lock();
            if let Some(channel) = slot.as_ref() {
                return Ok(channel.clone());
            }
            let channel = ServiceChannel::new(self.lookup(message)?, self.receiver.clone());
            *slot = Some(channel.clone());
            return Ok(channel);
        }

        let endpoint = self.lookup(message)?;
        let mut channels = self.datagram_channels.lock();
        if let Some(channel) = channels
            .iter()
            .find(|channel| Arc::ptr_eq(channel.endpoint(), &endpoint))
        {
            return Ok(channel.clone());
        }
        let channel = ServiceChannel::new(endpoint, self.receiver.clone());
        channels.push(channel.clone());
        Ok(channel)
    }

    fn lookup(&self, message: &Message) -> Result<Arc<Endpoint>, Refusal> {
        match self.endpoints.lookup(message) {
            Ok(Lookup::Matched(endpoint)) => Ok(endpoint),
            Ok(Lookup::AddressMismatch) => Err(Refusal::Fault(Fault::address_filter_mismatch(
                message.headers().to.as_deref(),
            ))),
            Ok(Lookup::ContractMismatch) => Err(Refusal::Fault(
                Fault::contract_filter_mismatch(message.action()),
            )),
            Ok(Lookup::Ambiguous(names)) => Err(Refusal::Fault(Fault::new(
                FaultCode::MultipleFilterMatches,
                format!("endpoints {} all accept the message", names.join(", ")),
            ))),
            Err(error @ (FilterError::MultipleMatches | FilterError::QuotaExceeded { .. })) => {
                Err(Refusal::Fault(error.into()))
            }
            Err(error) => Err(Refusal::Error(error)),
        }
    }

    /// The receiver finished. Runs once.
    fn on_eof(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(handler_id = self.id, "receiver reached end of stream");
        let timeout = self.config.send_timeout;
        match self.session_channel() {
            Some(channel) => channel.close(timeout),
            None => {
                if let Err(error) = self.receiver.close(timeout) {
                    tracing::debug!(handler_id = self.id, %error, "receiver close failed; aborting");
                    self.receiver.abort();
                }
            }
        }
        let channels = std::mem::take(&mut *self.datagram_channels.lock());
        for channel in channels {
            channel.close(timeout);
        }
        if let Some(batch) = &self.batch {
            batch.flush();
        }
        self.release_session();
    }

    /// A receive failed while holding the pump. The pump is released either
    /// way; an error no handler claims is fatal.
    fn on_receive_error(&self, error: TransportError) -> Result<bool, FatalError> {
        let locally_closed = self.is_stopped()
            || self.closing.load(Ordering::Acquire)
            || self
                .session_channel()
                .is_some_and(|channel| channel.is_closed());
        if locally_closed {
            tracing::debug!(handler_id = self.id, %error, "receive failed after local close");
            self.on_eof();
            self.release_pump();
            return Ok(false);
        }

        let handled = self
            .error_behavior
            .report(&DispatchError::Transport(error.clone()));
        self.abort_pending();
        self.release_pump();
        if handled {
            tracing::warn!(handler_id = self.id, %error, "receive failed; pump stopped");
            Ok(false)
        } else {
            tracing::error!(handler_id = self.id, %error, "unhandled receive failure");
            Err(FatalError::new(format!("unhandled receive failure: {error}")))
        }
    }

    /// Tear down everything still pending on this receiver.
    fn abort_pending(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.session_channel() {
            Some(channel) => channel.abort(),
            None => self.receiver.abort(),
        }
        let channels = std::mem::take(&mut *self.datagram_channels.lock());
        for channel in channels {
            channel.abort();
        }
        if let Some(batch) = &self.batch {
            batch.abort();
        }
        self.release_session();
    }

    fn release_session(&self) {
        if let Some(idle) = self.idle.lock().take() {
            idle.cancel();
        }
        if self.session_slot.swap(false, Ordering::AcqRel) {
            self.throttle.deactivate_channel();
        }
    }

    fn on_idle(&self) {
        tracing::warn!(handler_id = self.id, "session idle; aborting");
        self.closing.store(true, Ordering::Release);
        match self.session_channel() {
            Some(channel) => channel.abort(),
            None => self.receiver.abort(),
        }
    }
}

impl std::fmt::Debug for ChannelHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandler")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("pumping", &self.is_pumping())
            .field("stopped", &self.is_stopped())
            .field("parked", &self.parked())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::mem::MemReplyChannel;

    use crate::{ActionDemuxer, DispatchRuntime};

    fn dispatcher(scheduler: &Scheduler) -> ChannelDispatcher {
        let runtime = DispatchRuntime::builder(ActionDemuxer::new(), scheduler.clone()).build();
        ChannelDispatcher::new(
            EndpointTable::new().with_endpoint(Endpoint::new("empty", runtime)),
            DispatcherConfig::default(),
            scheduler.clone(),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pump_token_is_exclusive_and_reusable() {
        let scheduler = Scheduler::try_current().unwrap();
        let (receiver, client) = MemReplyChannel::session();
        let handler = dispatcher(&scheduler).attach(receiver);

        assert!(handler.acquire_pump());
        assert!(!handler.acquire_pump());
        handler.release_pump();
        assert!(handler.acquire_pump());
        handler.release_pump();
        assert!(!handler.is_pumping());
        client.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn eof_stops_the_handler_and_frees_the_session_slot() {
        let scheduler = Scheduler::try_current().unwrap();
        let dispatcher = dispatcher(&scheduler);
        let (receiver, client) = MemReplyChannel::session();
        let handler = dispatcher.listen(receiver);
        assert_eq!(dispatcher.throttle().active_sessions(), 1);

        client.close();
        for _ in 0..100 {
            if !handler.is_pumping() && dispatcher.throttle().active_sessions() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(handler.is_stopped());
        assert!(!handler.is_pumping());
        assert_eq!(dispatcher.throttle().active_sessions(), 0);
    }
}
