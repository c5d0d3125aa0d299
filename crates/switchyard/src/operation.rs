//! Operation descriptors and the handlers behind them.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use switchyard_core::{
    Abandoned, DispatchError, IsolationLevel, Message, OperationContext, Transaction,
};

use crate::{InstanceLease, ServiceObject};

/// What a handler returns: an optional reply, or the error to fault with.
pub type HandlerResult = Result<Option<Message>, DispatchError>;

pub type SyncHandler = Arc<dyn Fn(Invocation) -> HandlerResult + Send + Sync>;

pub type AsyncHandler = Arc<dyn Fn(Invocation) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Everything a handler is given for one call.
pub struct Invocation {
    pub message: Message,
    pub instance: ServiceObject,
    pub context: Arc<OperationContext>,
    /// Set on `Reentrant` endpoints while the call holds the instance lock.
    pub(crate) lease: Option<Arc<InstanceLease>>,
}

impl Invocation {
    pub fn new(message: Message, instance: ServiceObject, context: Arc<OperationContext>) -> Self {
        Self {
            message,
            instance,
            context,
            lease: None,
        }
    }

    /// Run outgoing work, such as a [`DuplexBinder::request`](crate::DuplexBinder::request)
    /// to a peer that may call back into this instance.
    ///
    /// On a `Reentrant` endpoint the instance lock is given up while `work`
    /// runs and taken back before this returns, after any call that got the
    /// lock meanwhile. Elsewhere `work` simply runs. Blocks the thread; async
    /// handlers use [`Self::call_out_async`].
    pub fn call_out<T>(&self, work: impl FnOnce() -> T) -> Result<T, DispatchError> {
        let Some(lease) = self.released_lease() else {
            return Ok(work());
        };
        let result = work();
        lease.reacquire_blocking().map_err(instance_gone)?;
        Ok(result)
    }

    pub async fn call_out_async<F: Future>(&self, work: F) -> Result<F::Output, DispatchError> {
        let Some(lease) = self.released_lease() else {
            return Ok(work.await);
        };
        let result = work.await;
        lease.reacquire().await.map_err(instance_gone)?;
        Ok(result)
    }

    fn released_lease(&self) -> Option<&Arc<InstanceLease>> {
        let lease = self.lease.as_ref()?;
        lease.release().then_some(lease)
    }

    /// The transaction the call runs in, if the operation has one.
    pub fn transaction(&self) -> Option<&Transaction> {
        self.context.transaction.as_ref()
    }

    /// The service object, downcast to its concrete type.
    pub fn instance<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.instance.downcast_ref::<T>()
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("action", &self.message.action())
            .field("channel_id", &self.context.channel_id)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub enum Invoker {
    /// Runs to completion on the dispatching thread.
    Sync(SyncHandler),
    /// Started on the dispatching thread and awaited on the runtime; the
    /// pipeline pauses until it resolves.
    Async(AsyncHandler),
}

impl fmt::Debug for Invoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Invoker::Sync"),
            Self::Async(_) => f.write_str("Invoker::Async"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    #[default]
    NotAllowed,
    /// Run inside a transaction: the flowed one if the message carries one,
    /// otherwise a fresh one. With `auto_complete` a transaction created for
    /// the call commits when the handler succeeds.
    Required { auto_complete: bool },
}

/// One operation of a service contract.
#[derive(Debug)]
pub struct Operation {
    name: String,
    action: Option<String>,
    reply_action: Option<String>,
    one_way: bool,
    terminating: bool,
    transaction: TransactionMode,
    isolation: IsolationLevel,
    invoker: Invoker,
}

impl Operation {
    pub fn new(name: impl Into<String>, action: Option<&str>, invoker: Invoker) -> Self {
        Self {
            name: name.into(),
            action: action.map(str::to_owned),
            reply_action: None,
            one_way: false,
            terminating: false,
            transaction: TransactionMode::NotAllowed,
            isolation: IsolationLevel::default(),
            invoker,
        }
    }

    /// An operation backed by a synchronous handler.
    pub fn sync<F>(name: impl Into<String>, action: &str, handler: F) -> Self
    where
        F: Fn(Invocation) -> HandlerResult + Send + Sync + 'static,
    {
        Self::new(name, Some(action), Invoker::Sync(Arc::new(handler)))
    }

    /// An operation backed by an async handler.
    pub fn future<F, Fut>(name: impl Into<String>, action: &str, handler: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |invocation| handler(invocation).boxed());
        Self::new(name, Some(action), Invoker::Async(handler))
    }

    pub fn with_reply_action(mut self, action: impl Into<String>) -> Self {
        self.reply_action = Some(action.into());
        self
    }

    /// The caller expects no reply; the request is closed once handled.
    pub fn one_way(mut self) -> Self {
        self.one_way = true;
        self
    }

    /// Completing this operation ends the session.
    pub fn terminating(mut self) -> Self {
        self.terminating = true;
        self
    }

    pub fn with_transaction(mut self, mode: TransactionMode) -> Self {
        self.transaction = mode;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    /// Action stamped on replies that do not carry one.
    pub fn reply_action(&self) -> String {
        match (&self.reply_action, &self.action) {
            (Some(reply), _) => reply.clone(),
            (None, Some(action)) => format!("{action}Response"),
            (None, None) => format!("{}Response", self.name),
        }
    }

    pub fn is_one_way(&self) -> bool {
        self.one_way
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating
    }

    pub fn transaction_mode(&self) -> TransactionMode {
        self.transaction
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }
}

/// Run a synchronous handler, turning a panic into a handler error.
pub(crate) fn invoke_sync(handler: &SyncHandler, invocation: Invocation) -> HandlerResult {
    match std::panic::catch_unwind(AssertUnwindSafe(|| handler(invocation))) {
        Ok(result) => result,
        Err(panic) => Err(panic_error(panic)),
    }
}

/// Start an async handler. Panics while creating or polling the future come
/// back as handler errors.
pub(crate) fn invoke_async(
    handler: &AsyncHandler,
    invocation: Invocation,
) -> BoxFuture<'static, HandlerResult> {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(invocation))) {
        Ok(future) => future,
        Err(panic) => return futures::future::ready(Err(panic_error(panic))).boxed(),
    };
    AssertUnwindSafe(future)
        .catch_unwind()
        .map(|outcome| outcome.unwrap_or_else(|panic| Err(panic_error(panic))))
        .boxed()
}

fn instance_gone(_: Abandoned) -> DispatchError {
    DispatchError::handler("instance context closed while the call was out")
}

fn panic_error(panic: Box<dyn Any + Send>) -> DispatchError {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    };
    DispatchError::handler(format!("handler panicked: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(action: &str) -> Invocation {
        Invocation::new(
            Message::request(action),
            Arc::new(()),
            Arc::new(OperationContext {
                channel_id: 1,
                session_id: None,
                action: Some(action.to_owned()),
                message_id: None,
                transaction: None,
            }),
        )
    }

    #[test]
    fn call_out_without_a_lease_just_runs() {
        let call = invocation("urn:a");
        assert_eq!(call.call_out(|| 7).unwrap(), 7);
    }

    #[test]
    fn call_out_gives_the_lock_up_and_takes_it_back() {
        let instance = crate::InstanceContext::new(Arc::new(crate::StatelessProvider));
        assert!(instance.lock().is_ready());
        let mut call = invocation("urn:a");
        call.lease = Some(InstanceLease::held(instance.clone()));

        let inside = call.call_out(|| {
            // A callback can take the lock while the call is out.
            let callback = instance.lock();
            let entered = callback.is_ready();
            instance.unlock();
            entered
        });
        assert!(inside.unwrap());
        assert!(instance.is_locked());
        assert!(call.lease.as_ref().is_some_and(|lease| lease.is_held()));
    }

    #[test]
    fn reply_action_defaults_to_the_response_suffix() {
        let echo = Operation::sync("Echo", "urn:echo", |_| Ok(None));
        assert_eq!(echo.reply_action(), "urn:echoResponse");
        let echo = echo.with_reply_action("urn:echo/reply");
        assert_eq!(echo.reply_action(), "urn:echo/reply");
    }

    #[test]
    fn sync_panics_become_handler_errors() {
        let handler: SyncHandler = Arc::new(|_| panic!("boom"));
        match invoke_sync(&handler, invocation("urn:a")) {
            Err(DispatchError::Handler { message }) => assert!(message.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn async_panics_become_handler_errors() {
        let op = Operation::future("Boom", "urn:boom", |invocation| async move {
            if invocation.message.action() == Some("urn:boom") {
                panic!("async boom");
            }
            Ok(None)
        });
        let Invoker::Async(handler) = op.invoker() else {
            panic!("expected an async invoker");
        };
        match invoke_async(handler, invocation("urn:boom")).await {
            Err(DispatchError::Handler { message }) => assert!(message.contains("async boom")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
