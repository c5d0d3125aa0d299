//! Request admission.
//!
//! Turns a bare request into a call: find the service channel it belongs to,
//! then pass the call and instance throttles. A saturated throttle parks the
//! whole admission; the throttle runs it again on a fresh worker once a slot
//! is handed over, and admission resumes where it stopped. Throttle slots
//! move from the admission to the call record exactly once.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use switchyard_core::{
    BoxedRequest, EndpointAddress, FatalError, Fault, Message, ServiceThrottle, ThrottleWaiter,
};

use crate::channel_handler::{ChannelHandler, Refusal};
use crate::pipeline::{self, Dispatched};
use crate::{Rpc, ServiceChannel};

pub(crate) struct Admission {
    handler: Arc<ChannelHandler>,
    request: BoxedRequest,
    channel: Option<Arc<ServiceChannel>>,
    owns_call: bool,
    owns_instance: bool,
}

impl Admission {
    pub(crate) fn new(handler: Arc<ChannelHandler>, request: BoxedRequest) -> Self {
        Self {
            handler,
            request,
            channel: None,
            owns_call: false,
            owns_instance: false,
        }
    }

    /// Give back any slots taken so far.
    fn release(&mut self) {
        let throttle = self.handler.throttle();
        if std::mem::take(&mut self.owns_instance) {
            throttle.deactivate_instance_context();
        }
        if std::mem::take(&mut self.owns_call) {
            throttle.deactivate_call();
        }
    }
}

/// Admit and dispatch one request.
///
/// Returns true when the caller still owns the pump and may keep receiving,
/// false when the request was parked or paused and ownership went with it.
pub(crate) fn admit(mut admission: Admission) -> Result<bool, FatalError> {
    let channel = match admission.channel.clone() {
        Some(channel) => channel,
        None => {
            let resolved = admission
                .handler
                .resolve_channel(admission.request.request_message());
            match resolved {
                Ok(channel) => {
                    admission.channel = Some(channel.clone());
                    channel
                }
                Err(Refusal::Fault(fault)) => {
                    reject(admission, fault);
                    return Ok(true);
                }
                Err(Refusal::Error(error)) => {
                    tracing::warn!(
                        handler_id = admission.handler.id(),
                        %error,
                        "channel resolution failed; aborting request"
                    );
                    admission.release();
                    admission.request.abort();
                    return Ok(true);
                }
            }
        }
    };
    if channel.is_terminated() {
        reject(admission, Fault::session_terminated());
        return Ok(true);
    }

    if !admission.owns_call {
        match acquire_or_park(
            admission,
            |a| a.owns_call = true,
            |throttle, waiter| throttle.acquire_call(waiter),
        ) {
            Some(admitted) => admission = admitted,
            None => return Ok(false),
        }
    }
    if !admission.owns_instance && channel.needs_instance_context() {
        match acquire_or_park(
            admission,
            |a| a.owns_instance = true,
            |throttle, waiter| throttle.acquire_instance_context(true, waiter),
        ) {
            Some(admitted) => admission = admitted,
            None => return Ok(false),
        }
    }

    let Admission {
        handler,
        request,
        owns_call,
        owns_instance,
        ..
    } = admission;
    tracing::debug!(
        handler_id = handler.id(),
        channel_id = channel.id(),
        owns_instance,
        "request admitted"
    );
    let mut rpc = Rpc::new(handler.clone(), channel, request, owns_call, owns_instance);
    if let Some(batch) = handler.batch() {
        let transaction = batch.enlist();
        rpc.transaction = Some(transaction.clone());
        rpc.batch = Some(batch.clone());
        let batch = batch.clone();
        rpc.on_complete(move |failed| batch.complete(&transaction, failed));
    }
    match pipeline::start(rpc)? {
        Dispatched::Completed { owns_pump } => Ok(owns_pump),
        Dispatched::Paused => Ok(false),
    }
}

/// Try to take a throttle slot. When the throttle is saturated the
/// admission is parked inside the waiter and `None` comes back.
///
/// The admission sits in a shared slot before the throttle sees the waiter,
/// so a grant handed over on another worker always finds it there.
fn acquire_or_park(
    admission: Admission,
    grant: fn(&mut Admission),
    acquire: impl FnOnce(&ServiceThrottle, ThrottleWaiter) -> bool,
) -> Option<Admission> {
    let handler = admission.handler.clone();
    let throttle = handler.throttle().clone();
    let slot = Arc::new(Mutex::new(Some(admission)));
    let parked = slot.clone();
    let waiter: ThrottleWaiter = Box::new(move || {
        let Some(mut admission) = parked.lock().take() else {
            return;
        };
        admission.handler.unpark();
        grant(&mut admission);
        resume(admission);
    });
    handler.park();
    if acquire(&throttle, waiter) {
        handler.unpark();
        let mut admission = slot.lock().take()?;
        grant(&mut admission);
        return Some(admission);
    }
    tracing::debug!(handler_id = handler.id(), "admission parked behind throttle");
    None
}

fn resume(admission: Admission) {
    let handler = admission.handler.clone();
    match admit(admission) {
        Ok(true) => handler.dispatch_done(),
        Ok(false) => {}
        Err(fatal) => handler.scheduler().fail_fast(fatal),
    }
}

fn reject(mut admission: Admission, fault: Fault) {
    admission.release();
    let Admission {
        handler, request, ..
    } = admission;
    refuse(handler.id(), request, fault, handler.config().send_timeout);
}

/// Answer a request that never reached the pipeline with `fault`, then close
/// it. A `none` fault address means close without answering.
fn refuse(handler_id: u64, mut request: BoxedRequest, fault: Fault, timeout: Duration) {
    let message = request.request_message();
    tracing::warn!(
        handler_id,
        code = %fault.code,
        action = ?message.action(),
        "request refused"
    );
    let headers = message.headers();
    let target = headers.fault_to.clone().or_else(|| headers.reply_to.clone());
    let relates_to = message.message_id();

    if !matches!(target, Some(EndpointAddress::None)) {
        let mut reply = Message::from_fault(fault);
        if let Some(id) = relates_to {
            reply = reply.with_relates_to(id);
        }
        if let Some(EndpointAddress::Uri(uri)) = target {
            reply = reply.with_to(uri);
        }
        if let Err(error) = request.reply(Some(reply), timeout) {
            tracing::debug!(handler_id, %error, "fault reply failed; aborting request");
            request.abort();
            return;
        }
    }
    if let Err(error) = request.close(timeout) {
        tracing::debug!(handler_id, %error, "request close failed; aborting");
        request.abort();
    }
}
