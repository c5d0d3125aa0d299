//! The immutable per-endpoint dispatch runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use switchyard_core::{
    Completion, DispatchError, DispatcherConfig, LocalTransactionManager, Message, Scheduler,
    TransactionManager,
};

use crate::{
    Authenticator, AuthorizationManager, ConcurrencyMode, ErrorBehavior, ErrorHandler,
    InstanceContext, InstanceContextMode, InstanceProvider, MessageInspector, OperationDemuxer,
    Rpc, Stage, StageHook, StatelessProvider, ThreadBinder,
};

/// Handshake a transport needs before a reply counts as sent.
pub trait ReplyFinalizer: Send + Sync {
    fn finalize(&self, reply: &Message) -> Completion<Result<(), DispatchError>>;
}

/// Everything the pipeline needs to know about one endpoint.
///
/// Built once with [`DispatchRuntime::builder`] and shared by every call to
/// the endpoint.
pub struct DispatchRuntime {
    demuxer: Box<dyn OperationDemuxer>,
    instance_mode: InstanceContextMode,
    concurrency_mode: ConcurrencyMode,
    instance_provider: Arc<dyn InstanceProvider>,
    inspectors: Vec<Arc<dyn MessageInspector>>,
    authenticators: Vec<Arc<dyn Authenticator>>,
    authorization: Vec<Arc<dyn AuthorizationManager>>,
    error_behavior: ErrorBehavior,
    manual_addressing: bool,
    thread_binder: Option<Arc<dyn ThreadBinder>>,
    reply_finalizer: Option<Arc<dyn ReplyFinalizer>>,
    transaction_manager: Arc<dyn TransactionManager>,
    stage_hook: Option<Arc<dyn StageHook>>,
    config: DispatcherConfig,
    scheduler: Scheduler,
    singleton: Mutex<Option<Arc<InstanceContext>>>,
    concurrent_calls: AtomicUsize,
}

impl DispatchRuntime {
    pub fn builder(
        demuxer: impl OperationDemuxer + 'static,
        scheduler: Scheduler,
    ) -> DispatchRuntimeBuilder {
        DispatchRuntimeBuilder {
            demuxer: Box::new(demuxer),
            instance_mode: InstanceContextMode::default(),
            concurrency_mode: ConcurrencyMode::default(),
            instance_provider: Arc::new(StatelessProvider),
            inspectors: Vec::new(),
            authenticators: Vec::new(),
            authorization: Vec::new(),
            error_handlers: Vec::new(),
            include_exception_detail: false,
            manual_addressing: false,
            thread_binder: None,
            reply_finalizer: None,
            transaction_manager: Arc::new(LocalTransactionManager),
            stage_hook: None,
            config: DispatcherConfig::default(),
            scheduler,
        }
    }

    pub fn demuxer(&self) -> &dyn OperationDemuxer {
        self.demuxer.as_ref()
    }

    pub fn instance_mode(&self) -> InstanceContextMode {
        self.instance_mode
    }

    pub fn concurrency_mode(&self) -> ConcurrencyMode {
        self.concurrency_mode
    }

    pub fn instance_provider(&self) -> &Arc<dyn InstanceProvider> {
        &self.instance_provider
    }

    pub fn inspectors(&self) -> &[Arc<dyn MessageInspector>] {
        &self.inspectors
    }

    pub fn authenticators(&self) -> &[Arc<dyn Authenticator>] {
        &self.authenticators
    }

    pub fn authorization(&self) -> &[Arc<dyn AuthorizationManager>] {
        &self.authorization
    }

    pub fn error_behavior(&self) -> &ErrorBehavior {
        &self.error_behavior
    }

    /// Replies are sent exactly as the handler built them.
    pub fn manual_addressing(&self) -> bool {
        self.manual_addressing
    }

    pub fn thread_binder(&self) -> Option<&Arc<dyn ThreadBinder>> {
        self.thread_binder.as_ref()
    }

    pub fn reply_finalizer(&self) -> Option<&Arc<dyn ReplyFinalizer>> {
        self.reply_finalizer.as_ref()
    }

    pub fn transaction_manager(&self) -> &dyn TransactionManager {
        self.transaction_manager.as_ref()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Calls currently inside a handler on a concurrent endpoint.
    pub fn concurrent_calls(&self) -> usize {
        self.concurrent_calls.load(Ordering::Acquire)
    }

    pub(crate) fn enter_concurrent(&self) {
        self.concurrent_calls.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn exit_concurrent(&self) {
        self.concurrent_calls.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn before_stage(&self, stage: Stage, call: &Rpc) -> Result<(), DispatchError> {
        match &self.stage_hook {
            Some(hook) => hook.before_stage(stage, call),
            None => Ok(()),
        }
    }

    /// The shared instance of a `Single` endpoint, if it exists yet.
    pub fn singleton(&self) -> Option<Arc<InstanceContext>> {
        self.singleton.lock().clone()
    }

    /// The shared instance, and whether this call created it.
    pub(crate) fn singleton_or_create(&self) -> (Arc<InstanceContext>, bool) {
        let mut slot = self.singleton.lock();
        if let Some(instance) = slot.as_ref() {
            return (instance.clone(), false);
        }
        let instance = InstanceContext::new(self.instance_provider.clone());
        *slot = Some(instance.clone());
        (instance, true)
    }
}

impl std::fmt::Debug for DispatchRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRuntime")
            .field("instance_mode", &self.instance_mode)
            .field("concurrency_mode", &self.concurrency_mode)
            .field("inspectors", &self.inspectors.len())
            .field("manual_addressing", &self.manual_addressing)
            .finish_non_exhaustive()
    }
}

pub struct DispatchRuntimeBuilder {
    demuxer: Box<dyn OperationDemuxer>,
    instance_mode: InstanceContextMode,
    concurrency_mode: ConcurrencyMode,
    instance_provider: Arc<dyn InstanceProvider>,
    inspectors: Vec<Arc<dyn MessageInspector>>,
    authenticators: Vec<Arc<dyn Authenticator>>,
    authorization: Vec<Arc<dyn AuthorizationManager>>,
    error_handlers: Vec<Arc<dyn ErrorHandler>>,
    include_exception_detail: bool,
    manual_addressing: bool,
    thread_binder: Option<Arc<dyn ThreadBinder>>,
    reply_finalizer: Option<Arc<dyn ReplyFinalizer>>,
    transaction_manager: Arc<dyn TransactionManager>,
    stage_hook: Option<Arc<dyn StageHook>>,
    config: DispatcherConfig,
    scheduler: Scheduler,
}

impl DispatchRuntimeBuilder {
    pub fn instance_mode(mut self, mode: InstanceContextMode) -> Self {
        self.instance_mode = mode;
        self
    }

    pub fn concurrency_mode(mut self, mode: ConcurrencyMode) -> Self {
        self.concurrency_mode = mode;
        self
    }

    pub fn instance_provider(mut self, provider: impl InstanceProvider + 'static) -> Self {
        self.instance_provider = Arc::new(provider);
        self
    }

    pub fn inspector(mut self, inspector: impl MessageInspector + 'static) -> Self {
        self.inspectors.push(Arc::new(inspector));
        self
    }

    pub fn authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticators.push(Arc::new(authenticator));
        self
    }

    pub fn authorization(mut self, manager: impl AuthorizationManager + 'static) -> Self {
        self.authorization.push(Arc::new(manager));
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handlers.push(handler);
        self
    }

    /// Put the underlying error text into last-resort faults.
    pub fn include_exception_detail(mut self, include: bool) -> Self {
        self.include_exception_detail = include;
        self
    }

    pub fn manual_addressing(mut self, manual: bool) -> Self {
        self.manual_addressing = manual;
        self
    }

    pub fn thread_binder(mut self, binder: Arc<dyn ThreadBinder>) -> Self {
        self.thread_binder = Some(binder);
        self
    }

    pub fn reply_finalizer(mut self, finalizer: Arc<dyn ReplyFinalizer>) -> Self {
        self.reply_finalizer = Some(finalizer);
        self
    }

    pub fn transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.transaction_manager = manager;
        self
    }

    pub fn stage_hook(mut self, hook: Arc<dyn StageHook>) -> Self {
        self.stage_hook = Some(hook);
        self
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<DispatchRuntime> {
        tracing::debug!(
            instance_mode = ?self.instance_mode,
            concurrency_mode = ?self.concurrency_mode,
            inspectors = self.inspectors.len(),
            error_handlers = self.error_handlers.len(),
            "dispatch runtime built"
        );
        Arc::new(DispatchRuntime {
            demuxer: self.demuxer,
            instance_mode: self.instance_mode,
            concurrency_mode: self.concurrency_mode,
            instance_provider: self.instance_provider,
            inspectors: self.inspectors,
            authenticators: self.authenticators,
            authorization: self.authorization,
            error_behavior: ErrorBehavior::new(self.error_handlers, self.include_exception_detail),
            manual_addressing: self.manual_addressing,
            thread_binder: self.thread_binder,
            reply_finalizer: self.reply_finalizer,
            transaction_manager: self.transaction_manager,
            stage_hook: self.stage_hook,
            config: self.config,
            scheduler: self.scheduler,
            singleton: Mutex::new(None),
            concurrent_calls: AtomicUsize::new(0),
        })
    }
}
