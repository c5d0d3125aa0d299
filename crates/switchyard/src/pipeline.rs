//! The staged dispatch pipeline.
//!
//! A call moves through [`Stage`]s in order. Each stage either finishes
//! synchronously, and the driver falls straight through to the next one in
//! the same stack frame, or returns a [`Suspension`]. A suspended call is
//! moved into a continuation that the scheduler runs on a fresh worker once
//! the awaited value arrives; the continuation re-enters the driver at the
//! stage after the one that paused.
//!
//! Failures go through [`Rpc::fail`] and then jump to fault handling. Fatal
//! errors are never recorded; they leave the driver as `Err` and the outermost
//! entry point hands them to the scheduler's fail-fast hook.

use std::sync::Arc;

use switchyard_core::{
    Abandoned, Completion, DispatchError, EndpointAddress, FatalError, Fault, FaultCode, Message,
    OperationContext, OperationContextScope, TransactionScope, TransportError,
};
use tokio::sync::oneshot;

use crate::operation::{invoke_async, invoke_sync, TransactionMode};
use crate::{
    ConcurrencyMode, InstanceContext, InstanceContextMode, InstanceLease, Invocation, Invoker,
    Operation, Rpc, Stage,
};

/// What a stage asks the driver to do next.
pub(crate) enum Flow {
    Next,
    Suspend(Suspension),
}

/// How far a drive got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatched {
    /// The call ran to the end of cleanup. `owns_pump` is set when the call
    /// still held the channel pump when it finished.
    Completed { owns_pump: bool },
    /// The call is parked; a continuation owns it now.
    Paused,
}

type Continuation = Box<dyn FnOnce(Box<Rpc>, Stage) + Send>;

/// The rest of a paused call, waiting on one value.
pub(crate) struct Suspension(Continuation);

impl Suspension {
    /// Resume once `rx` resolves. `apply` stores the value on the call; an
    /// error from it fails the paused stage.
    fn on<T, F>(rx: oneshot::Receiver<T>, apply: F) -> Self
    where
        T: Send + 'static,
        F: FnOnce(&mut Rpc, Result<T, Abandoned>) -> Result<(), DispatchError> + Send + 'static,
    {
        Self(Box::new(move |rpc: Box<Rpc>, paused: Stage| {
            let scheduler = rpc.runtime.scheduler().clone();
            scheduler.resume_when(rx, move |outcome| {
                let mut rpc = rpc;
                rpc.paused = false;
                let next = match apply(&mut rpc, outcome) {
                    Ok(()) => paused.next(),
                    Err(error) => match rpc.fail(error) {
                        Ok(()) => recover(&mut rpc, paused),
                        Err(fatal) => {
                            rpc.runtime.scheduler().fail_fast(fatal);
                            return;
                        }
                    },
                };
                resume(rpc, next);
            });
        }))
    }
}

/// Run a freshly admitted call from the first stage.
pub(crate) fn start(rpc: Box<Rpc>) -> Result<Dispatched, FatalError> {
    drive(rpc, Stage::ReceiveContext)
}

/// Continue a call after a pause, settling pump ownership when it finishes.
fn resume(rpc: Box<Rpc>, next: Option<Stage>) {
    let handler = rpc.handler.clone();
    let scheduler = rpc.runtime.scheduler().clone();
    let result = match next {
        Some(stage) => drive(rpc, stage),
        None => Ok(Dispatched::Completed {
            owns_pump: rpc.owns_pump,
        }),
    };
    match result {
        Ok(Dispatched::Completed { owns_pump: true }) => handler.dispatch_done(),
        Ok(_) => {}
        Err(fatal) => scheduler.fail_fast(fatal),
    }
}

fn drive(mut rpc: Box<Rpc>, mut stage: Stage) -> Result<Dispatched, FatalError> {
    loop {
        tracing::trace!(call_id = rpc.id, %stage, "stage");
        let result = match rpc.runtime.before_stage(stage, &rpc) {
            Ok(()) => run(stage, &mut rpc),
            Err(error) if stage == Stage::Cleanup => {
                rpc.fail(error)?;
                run(stage, &mut rpc)
            }
            Err(error) => Err(error),
        };
        let next = match result {
            Ok(Flow::Next) => stage.next(),
            Ok(Flow::Suspend(Suspension(continuation))) => {
                tracing::debug!(call_id = rpc.id, %stage, "call paused");
                rpc.paused = true;
                continuation(rpc, stage);
                return Ok(Dispatched::Paused);
            }
            Err(error) => {
                rpc.fail(error)?;
                recover(&mut rpc, stage)
            }
        };
        match next {
            Some(next) => stage = next,
            None => {
                return Ok(Dispatched::Completed {
                    owns_pump: rpc.owns_pump,
                })
            }
        }
    }
}

/// Where a call goes after `failed` failed.
///
/// Failures before fault handling skip ahead to it. Failures while the reply
/// is being prepared replace it with a fault of last resort, unless a reply
/// was already attempted.
fn recover(rpc: &mut Rpc, failed: Stage) -> Option<Stage> {
    if failed < Stage::ProvideFault {
        return Some(Stage::ProvideFault);
    }
    if failed < Stage::SendReply && rpc.can_send_reply && !rpc.reply_attempted {
        if let Some(error) = rpc.error.as_ref() {
            rpc.reply = Some(rpc.runtime.error_behavior().provide_fault(error));
        }
    }
    failed.next()
}

fn run(stage: Stage, rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    match stage {
        Stage::ReceiveContext => receive_context(rpc),
        Stage::ValidateHeaders => validate_headers(rpc),
        Stage::Authorize => authorize(rpc),
        Stage::AcquireInstance => acquire_instance(rpc),
        Stage::InspectRequest => inspect_request(rpc),
        Stage::LockInstance => lock_instance(rpc),
        Stage::AttachTransaction => attach_transaction(rpc),
        Stage::CompleteReceive => complete_receive(rpc),
        Stage::BindThread => bind_thread(rpc),
        Stage::ContinuePumping => continue_pumping(rpc),
        Stage::EnsureInstance => ensure_instance(rpc),
        Stage::BeginInvoke => begin_invoke(rpc),
        Stage::EndInvoke => end_invoke(rpc),
        Stage::ProvideFault => provide_fault(rpc),
        Stage::PrepareReply => prepare_reply(rpc),
        Stage::FinalizeCorrelation => finalize_correlation(rpc),
        Stage::ResolveTransaction => resolve_transaction(rpc),
        Stage::SendReply => send_reply(rpc),
        Stage::Cleanup => cleanup(rpc),
    }
}

fn selected(rpc: &Rpc) -> Result<Arc<Operation>, DispatchError> {
    rpc.operation
        .clone()
        .ok_or_else(|| DispatchError::handler("no operation selected for the call"))
}

fn instance(rpc: &Rpc) -> Result<Arc<InstanceContext>, DispatchError> {
    rpc.instance
        .clone()
        .ok_or_else(|| DispatchError::handler("no instance context for the call"))
}

// ============================================================================
// Request side
// ============================================================================

fn receive_context(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    rpc.receive_context = rpc.message.properties().receive_context.clone();
    Ok(Flow::Next)
}

fn validate_headers(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    let Some(operation) = rpc.runtime.demuxer().select(&rpc.message)? else {
        return Err(Fault::contract_filter_mismatch(rpc.message.action()).into());
    };
    rpc.can_send_reply = !operation.is_one_way();
    tracing::debug!(
        call_id = rpc.id,
        operation = operation.name(),
        one_way = operation.is_one_way(),
        "operation selected"
    );
    rpc.operation = Some(operation);

    if rpc.can_send_reply
        && !rpc.runtime.manual_addressing()
        && rpc.message.message_id().is_none()
    {
        return Err(Fault::missing_header("MessageID").into());
    }
    if rpc.runtime.concurrency_mode() == ConcurrencyMode::Multiple {
        rpc.runtime.enter_concurrent();
        rpc.counted_concurrent = true;
    }
    Ok(Flow::Next)
}

fn authorize(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    let operation = selected(rpc)?;
    for authenticator in rpc.runtime.authenticators() {
        authenticator.authenticate(&rpc.message)?;
    }
    for manager in rpc.runtime.authorization() {
        if !manager.check_access(&rpc.message, &operation) {
            tracing::warn!(
                call_id = rpc.id,
                operation = operation.name(),
                "access denied"
            );
            return Err(Fault::new(
                FaultCode::AccessDenied,
                format!("access to operation '{}' is denied", operation.name()),
            )
            .into());
        }
    }
    Ok(Flow::Next)
}

fn acquire_instance(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    let (instance, created) = match rpc.channel.instance_mode() {
        InstanceContextMode::PerCall => (
            InstanceContext::new(rpc.runtime.instance_provider().clone()),
            true,
        ),
        InstanceContextMode::PerSession => rpc.channel.instance_or_create(),
        InstanceContextMode::Single => rpc.runtime.singleton_or_create(),
    };
    if created && rpc.owns_instance_throttle {
        instance.own_throttle_slot(rpc.throttle.clone());
        rpc.owns_instance_throttle = false;
    }
    if rpc.channel.take_pending() {
        instance.attach_channel(rpc.channel.id());
    }
    tracing::trace!(call_id = rpc.id, instance_id = instance.id(), created, "instance located");
    rpc.instance = Some(instance);
    Ok(Flow::Next)
}

fn inspect_request(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    let runtime = rpc.runtime.clone();
    for (slot, inspector) in runtime.inspectors().iter().enumerate() {
        rpc.correlation[slot] = inspector.after_receive_request(&mut rpc.message)?;
    }
    rpc.flowed_transaction = rpc.message.properties().transaction.clone();
    Ok(Flow::Next)
}

fn lock_instance(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    if !rpc.runtime.concurrency_mode().locks_instance() {
        return Ok(Flow::Next);
    }
    let instance = instance(rpc)?;
    match instance.lock() {
        Completion::Ready(()) => {
            rpc.lease = Some(InstanceLease::held(instance));
            Ok(Flow::Next)
        }
        Completion::Pending(rx) => Ok(Flow::Suspend(Suspension::on(rx, move |rpc, granted| {
            granted.map_err(|Abandoned| TransportError::Aborted)?;
            rpc.lease = Some(InstanceLease::held(instance));
            Ok(())
        }))),
    }
}

fn attach_transaction(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    if rpc.batch.is_some() {
        return Ok(Flow::Next);
    }
    let operation = selected(rpc)?;
    if operation.transaction_mode() == TransactionMode::NotAllowed {
        return Ok(Flow::Next);
    }
    let manager = rpc.runtime.transaction_manager();
    let transaction = match &rpc.flowed_transaction {
        Some(flowed) => manager.attach(flowed)?,
        None => manager.create(
            operation.isolation(),
            rpc.runtime.config().transaction_timeout,
        ),
    };
    tracing::debug!(
        call_id = rpc.id,
        transaction_id = transaction.id(),
        flowed = rpc.flowed_transaction.is_some(),
        "transaction attached"
    );
    rpc.transaction = Some(transaction);
    Ok(Flow::Next)
}

fn complete_receive(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    if let Some(context) = rpc.receive_context.take() {
        context.complete(rpc.transaction.as_ref())?;
    }
    Ok(Flow::Next)
}

fn bind_thread(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    let Some(binder) = rpc.runtime.thread_binder().cloned() else {
        return Ok(Flow::Next);
    };
    match binder.bind() {
        Completion::Ready(()) => {
            rpc.bound_thread = true;
            Ok(Flow::Next)
        }
        Completion::Pending(rx) => Ok(Flow::Suspend(Suspension::on(rx, |rpc, bound| {
            bound.map_err(|Abandoned| DispatchError::handler("thread binding was abandoned"))?;
            rpc.bound_thread = true;
            Ok(())
        }))),
    }
}

fn continue_pumping(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    if rpc.owns_pump && rpc.runtime.concurrency_mode().releases_pump() {
        rpc.owns_pump = false;
        rpc.handler.release_pump();
        rpc.handler.ensure_pump();
    }
    Ok(Flow::Next)
}

fn ensure_instance(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    rpc.service = Some(instance(rpc)?.service_object()?);
    Ok(Flow::Next)
}

// ============================================================================
// Invocation
// ============================================================================

fn begin_invoke(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    let operation = selected(rpc)?;
    let service = match rpc.service.clone() {
        Some(service) => service,
        None => instance(rpc)?.service_object()?,
    };
    let context = Arc::new(OperationContext {
        channel_id: rpc.channel.id(),
        session_id: rpc.channel.session_id(),
        action: rpc.message.action().map(str::to_owned),
        message_id: rpc.message.message_id(),
        transaction: rpc.transaction.clone(),
    });
    let mut invocation = Invocation::new(rpc.message.clone(), service, context.clone());
    if rpc.runtime.concurrency_mode() == ConcurrencyMode::Reentrant {
        invocation.lease = rpc.lease.clone();
    }
    match operation.invoker() {
        Invoker::Sync(handler) => {
            let _context = OperationContextScope::enter(Some(context));
            let _transaction = TransactionScope::enter(rpc.transaction.clone());
            rpc.outcome = Some(invoke_sync(handler, invocation));
            Ok(Flow::Next)
        }
        Invoker::Async(handler) => {
            let future = {
                let _context = OperationContextScope::enter(Some(context));
                let _transaction = TransactionScope::enter(rpc.transaction.clone());
                invoke_async(handler, invocation)
            };
            let (tx, rx) = oneshot::channel();
            drop(rpc.runtime.scheduler().spawn(async move {
                let _ = tx.send(future.await);
            }));
            Ok(Flow::Suspend(Suspension::on(rx, |rpc, outcome| {
                rpc.outcome = Some(outcome.unwrap_or_else(|Abandoned| {
                    Err(DispatchError::handler("handler task ended without a result"))
                }));
                Ok(())
            })))
        }
    }
}

fn end_invoke(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    match rpc.outcome.take() {
        Some(Ok(reply)) => {
            if rpc.can_send_reply {
                rpc.reply = reply;
            } else if reply.is_some() {
                tracing::debug!(call_id = rpc.id, "one-way operation produced a reply; dropped");
            }
            Ok(Flow::Next)
        }
        Some(Err(error)) => Err(error),
        None => Ok(Flow::Next),
    }
}

fn provide_fault(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    if let Some(error) = rpc.error.as_ref() {
        if rpc.can_send_reply && !rpc.reply_attempted {
            if let Some(fault) = error.as_fault() {
                tracing::warn!(call_id = rpc.id, code = %fault.code, "replying with fault");
            }
            rpc.reply = Some(rpc.runtime.error_behavior().provide_fault(error));
        }
    }
    Ok(Flow::Next)
}

// ============================================================================
// Reply side
// ============================================================================

fn prepare_reply(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    if rpc.can_send_reply && !rpc.runtime.manual_addressing() {
        address_reply(rpc);
    }
    let runtime = rpc.runtime.clone();
    for (slot, inspector) in runtime.inspectors().iter().enumerate() {
        let correlation = rpc.correlation[slot].take();
        inspector.before_send_reply(&mut rpc.reply, correlation);
    }
    Ok(Flow::Next)
}

/// Stamp correlation and route the reply. Session replies always go back on
/// the session; session-less replies follow `fault_to`, then `reply_to`.
fn address_reply(rpc: &mut Rpc) {
    let request_id = rpc.message.message_id();
    let reply_action = rpc.operation.as_ref().map(|op| op.reply_action());
    if let Some(reply) = rpc.reply.as_mut() {
        if let Some(id) = request_id {
            reply.headers_mut().relates_to = Some(id);
        }
        if !reply.is_fault() {
            if let Some(action) = reply_action {
                reply.headers_mut().action = Some(action);
            }
        }
    }
    if rpc.channel.has_session() {
        return;
    }

    let is_fault = rpc.reply.as_ref().is_some_and(Message::is_fault);
    let headers = rpc.message.headers();
    let target = if is_fault {
        headers.fault_to.clone().or_else(|| headers.reply_to.clone())
    } else {
        headers.reply_to.clone()
    };
    match target {
        Some(EndpointAddress::None) => {
            tracing::debug!(call_id = rpc.id, "reply address is none; reply suppressed");
            rpc.can_send_reply = false;
            rpc.reply = None;
        }
        Some(EndpointAddress::Uri(uri)) => {
            if let Some(reply) = rpc.reply.as_mut() {
                reply.headers_mut().to = Some(uri);
            }
        }
        Some(EndpointAddress::Anonymous) | None => {}
    }
}

fn finalize_correlation(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    if !rpc.can_send_reply {
        return Ok(Flow::Next);
    }
    let (Some(finalizer), Some(reply)) = (rpc.runtime.reply_finalizer(), rpc.reply.as_ref()) else {
        return Ok(Flow::Next);
    };
    match finalizer.finalize(reply) {
        Completion::Ready(result) => result.map(|()| Flow::Next),
        Completion::Pending(rx) => Ok(Flow::Suspend(Suspension::on(rx, |_rpc, finalized| {
            finalized.unwrap_or_else(|Abandoned| {
                Err(DispatchError::handler("reply finalization was abandoned"))
            })
        }))),
    }
}

fn resolve_transaction(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    let Some(transaction) = rpc.transaction.clone() else {
        return Ok(Flow::Next);
    };
    let failed = rpc.error.is_some();
    if rpc.batch.is_some() || rpc.flowed_transaction.is_some() {
        if failed {
            transaction.set_rollback_only();
        }
        return Ok(Flow::Next);
    }
    let auto_complete = rpc.operation.as_ref().is_some_and(|op| {
        matches!(
            op.transaction_mode(),
            TransactionMode::Required {
                auto_complete: true
            }
        )
    });
    if failed {
        transaction.rollback();
    } else if auto_complete {
        transaction.commit()?;
    } else if transaction.is_active() {
        tracing::debug!(
            call_id = rpc.id,
            transaction_id = transaction.id(),
            "handler left its transaction open; rolling back"
        );
        transaction.rollback();
    }
    Ok(Flow::Next)
}

fn send_reply(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    if !rpc.can_send_reply || rpc.reply_attempted {
        return Ok(Flow::Next);
    }
    rpc.reply_attempted = true;
    let reply = match rpc.reply.take() {
        Some(reply) => Some(reply),
        None => rpc
            .error
            .as_ref()
            .map(|error| rpc.runtime.error_behavior().provide_fault(error)),
    };
    let timeout = rpc.runtime.config().send_timeout;
    let Some(request) = rpc.request.as_mut() else {
        return Ok(Flow::Next);
    };
    match request.begin_reply(reply, timeout) {
        Completion::Ready(result) => {
            result?;
            rpc.replied = true;
            rpc.handler.touch_idle();
            Ok(Flow::Next)
        }
        Completion::Pending(rx) => Ok(Flow::Suspend(Suspension::on(rx, |rpc, sent| {
            sent.map_err(|Abandoned| TransportError::Aborted)??;
            rpc.replied = true;
            rpc.handler.touch_idle();
            Ok(())
        }))),
    }
}

/// Release everything the call holds. Never fails.
fn cleanup(rpc: &mut Rpc) -> Result<Flow, DispatchError> {
    let unhandled = rpc.is_unhandled();
    let config = rpc.runtime.config().clone();

    if let Some(context) = rpc.receive_context.take() {
        context.abandon();
    }
    if let Some(mut request) = rpc.request.take() {
        if unhandled && !rpc.replied {
            request.abort();
        } else if let Err(error) = request.close(config.send_timeout) {
            tracing::debug!(call_id = rpc.id, %error, "request close failed; aborting");
            request.abort();
        }
    }

    if rpc.channel.has_session() {
        if unhandled {
            if rpc.replied {
                rpc.channel.close_after_fault(config.close_after_fault_timeout);
            } else {
                rpc.channel.abort();
            }
        }
        if rpc.operation.as_ref().is_some_and(|op| op.is_terminating()) {
            rpc.channel.terminate();
        }
    }

    if let Some(transaction) = rpc.transaction.take() {
        let local = rpc.batch.is_none() && rpc.flowed_transaction.is_none();
        if local && transaction.is_active() {
            transaction.rollback();
        }
    }
    if rpc.counted_concurrent {
        rpc.counted_concurrent = false;
        rpc.runtime.exit_concurrent();
    }
    if rpc.bound_thread {
        rpc.bound_thread = false;
        if let Some(binder) = rpc.runtime.thread_binder() {
            binder.unbind();
        }
    }
    if let Some(lease) = rpc.lease.take() {
        lease.release();
    }
    if let Some(instance) = rpc.instance.take() {
        let close = match rpc.channel.instance_mode() {
            InstanceContextMode::PerCall => true,
            InstanceContextMode::PerSession => unhandled,
            InstanceContextMode::Single => false,
        };
        if close {
            instance.close();
        }
    }
    if rpc.owns_instance_throttle {
        rpc.owns_instance_throttle = false;
        rpc.throttle.deactivate_instance_context();
    }
    if rpc.owns_call_throttle {
        rpc.owns_call_throttle = false;
        rpc.throttle.deactivate_call();
    }

    let failed = rpc.error.is_some();
    for callback in rpc.on_complete.drain(..) {
        callback(failed);
    }
    rpc.handler.touch_idle();
    tracing::debug!(
        call_id = rpc.id,
        replied = rpc.replied,
        failed,
        unhandled,
        "call completed"
    );
    Ok(Flow::Next)
}
