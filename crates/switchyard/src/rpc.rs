//! The per-call record and the stages it moves through.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use switchyard_core::{
    BoxedRequest, DispatchError, FatalError, Message, ReceiveContext, ServiceThrottle, Transaction,
};

use crate::batch::SharedTransactedBatch;
use crate::channel_handler::ChannelHandler;
use crate::inspector::Correlation;
use crate::operation::HandlerResult;
use crate::{
    DispatchRuntime, InstanceContext, InstanceLease, Operation, ServiceChannel, ServiceObject,
};

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Pipeline stages, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    ReceiveContext,
    ValidateHeaders,
    Authorize,
    AcquireInstance,
    InspectRequest,
    LockInstance,
    AttachTransaction,
    CompleteReceive,
    BindThread,
    ContinuePumping,
    EnsureInstance,
    BeginInvoke,
    EndInvoke,
    ProvideFault,
    PrepareReply,
    FinalizeCorrelation,
    ResolveTransaction,
    SendReply,
    Cleanup,
}

impl Stage {
    pub const ALL: [Stage; 19] = [
        Stage::ReceiveContext,
        Stage::ValidateHeaders,
        Stage::Authorize,
        Stage::AcquireInstance,
        Stage::InspectRequest,
        Stage::LockInstance,
        Stage::AttachTransaction,
        Stage::CompleteReceive,
        Stage::BindThread,
        Stage::ContinuePumping,
        Stage::EnsureInstance,
        Stage::BeginInvoke,
        Stage::EndInvoke,
        Stage::ProvideFault,
        Stage::PrepareReply,
        Stage::FinalizeCorrelation,
        Stage::ResolveTransaction,
        Stage::SendReply,
        Stage::Cleanup,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn next(self) -> Option<Stage> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ReceiveContext => "receive-context",
            Self::ValidateHeaders => "validate-headers",
            Self::Authorize => "authorize",
            Self::AcquireInstance => "acquire-instance",
            Self::InspectRequest => "inspect-request",
            Self::LockInstance => "lock-instance",
            Self::AttachTransaction => "attach-transaction",
            Self::CompleteReceive => "complete-receive",
            Self::BindThread => "bind-thread",
            Self::ContinuePumping => "continue-pumping",
            Self::EnsureInstance => "ensure-instance",
            Self::BeginInvoke => "begin-invoke",
            Self::EndInvoke => "end-invoke",
            Self::ProvideFault => "provide-fault",
            Self::PrepareReply => "prepare-reply",
            Self::FinalizeCorrelation => "finalize-correlation",
            Self::ResolveTransaction => "resolve-transaction",
            Self::SendReply => "send-reply",
            Self::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

type CompletionCallback = Box<dyn FnOnce(bool) + Send>;

/// One request on its way through the pipeline.
///
/// Exactly one thread owns the record at a time. It is boxed so that a
/// paused stage can move it into the continuation that resumes it.
pub struct Rpc {
    pub(crate) id: u64,
    pub(crate) runtime: Arc<DispatchRuntime>,
    pub(crate) handler: Arc<ChannelHandler>,
    pub(crate) channel: Arc<ServiceChannel>,
    pub(crate) throttle: Arc<ServiceThrottle>,
    pub(crate) request: Option<BoxedRequest>,
    pub(crate) message: Message,
    pub(crate) operation: Option<Arc<Operation>>,
    pub(crate) instance: Option<Arc<InstanceContext>>,
    pub(crate) service: Option<ServiceObject>,
    pub(crate) receive_context: Option<Arc<dyn ReceiveContext>>,
    pub(crate) flowed_transaction: Option<Transaction>,
    pub(crate) transaction: Option<Transaction>,
    pub(crate) batch: Option<Arc<SharedTransactedBatch>>,
    pub(crate) correlation: Vec<Option<Correlation>>,
    pub(crate) outcome: Option<HandlerResult>,
    pub(crate) reply: Option<Message>,
    pub(crate) error: Option<DispatchError>,
    pub(crate) error_handled: bool,
    pub(crate) on_complete: Vec<CompletionCallback>,
    pub(crate) can_send_reply: bool,
    pub(crate) reply_attempted: bool,
    pub(crate) replied: bool,
    pub(crate) lease: Option<Arc<InstanceLease>>,
    pub(crate) bound_thread: bool,
    pub(crate) counted_concurrent: bool,
    pub(crate) owns_call_throttle: bool,
    pub(crate) owns_instance_throttle: bool,
    pub(crate) owns_pump: bool,
    pub(crate) paused: bool,
}

impl Rpc {
    pub(crate) fn new(
        handler: Arc<ChannelHandler>,
        channel: Arc<ServiceChannel>,
        request: BoxedRequest,
        owns_call_throttle: bool,
        owns_instance_throttle: bool,
    ) -> Box<Self> {
        let runtime = channel.runtime().clone();
        let message = request.request_message().clone();
        let slots = runtime.inspectors().len();
        Box::new(Self {
            id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
            throttle: handler.throttle().clone(),
            runtime,
            handler,
            channel,
            request: Some(request),
            message,
            operation: None,
            instance: None,
            service: None,
            receive_context: None,
            flowed_transaction: None,
            transaction: None,
            batch: None,
            correlation: (0..slots).map(|_| None).collect(),
            outcome: None,
            reply: None,
            error: None,
            error_handled: true,
            on_complete: Vec::new(),
            can_send_reply: true,
            reply_attempted: false,
            replied: false,
            lease: None,
            bound_thread: false,
            counted_concurrent: false,
            owns_call_throttle,
            owns_instance_throttle,
            owns_pump: true,
            paused: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel_id(&self) -> u64 {
        self.channel.id()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn operation(&self) -> Option<&Operation> {
        self.operation.as_deref()
    }

    pub fn error(&self) -> Option<&DispatchError> {
        self.error.as_ref()
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub(crate) fn on_complete(&mut self, callback: impl FnOnce(bool) + Send + 'static) {
        self.on_complete.push(Box::new(callback));
    }

    /// Record a stage failure. Fatal errors are handed back untouched.
    pub(crate) fn fail(&mut self, error: DispatchError) -> Result<(), FatalError> {
        let error = error.reraise_fatal()?;
        let handled = self.runtime.error_behavior().report(&error) || is_recoverable(&error);
        if handled {
            tracing::debug!(call_id = self.id, %error, "call failed; error handled");
        } else {
            tracing::error!(
                call_id = self.id,
                channel_id = self.channel.id(),
                action = ?self.message.action(),
                %error,
                "unhandled error in dispatch"
            );
        }
        match self.error {
            None => {
                self.error = Some(error);
                self.error_handled = handled;
            }
            Some(_) => self.error_handled &= handled,
        }
        Ok(())
    }

    /// Whether cleanup should tear things down instead of closing them.
    pub(crate) fn is_unhandled(&self) -> bool {
        self.error.is_some() && !self.error_handled
    }
}

/// Protocol faults and transport hiccups do not by themselves condemn the
/// session.
fn is_recoverable(error: &DispatchError) -> bool {
    matches!(error, DispatchError::Fault(_) | DispatchError::Transport(_))
}

impl std::fmt::Debug for Rpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rpc")
            .field("id", &self.id)
            .field("channel_id", &self.channel.id())
            .field("action", &self.message.action())
            .field("operation", &self.operation.as_ref().map(|op| op.name()))
            .field("error", &self.error)
            .field("paused", &self.paused)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_run_in_declaration_order() {
        assert_eq!(Stage::ALL.len(), 19);
        for (i, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
        assert_eq!(Stage::ReceiveContext.next(), Some(Stage::ValidateHeaders));
        assert_eq!(Stage::SendReply.next(), Some(Stage::Cleanup));
        assert_eq!(Stage::Cleanup.next(), None);
        assert!(Stage::EndInvoke < Stage::ProvideFault);
    }
}
