//! Suspension primitives.
//!
//! Every operation that may finish later returns a [`Completion`]: either the
//! value right away, or a receiver that a [`Completer`] fills in. Callers on
//! the synchronous path check for `Ready` and keep going in the same stack
//! frame; callers that get `Pending` hand the receiver and the rest of their
//! work to [`Scheduler::resume_when`], which runs it on a fresh worker once the
//! value arrives.

use core::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::FatalError;

/// The completer was dropped without producing a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abandoned;

impl fmt::Display for Abandoned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "completion abandoned before a value was produced")
    }
}

impl std::error::Error for Abandoned {}

/// A value that is either available now or will be delivered later.
pub enum Completion<T> {
    Ready(T),
    Pending(oneshot::Receiver<T>),
}

impl<T> Completion<T> {
    /// A pending completion and the handle that completes it.
    pub fn pending() -> (Completer<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (Completer { tx }, Self::Pending(rx))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Block the current thread until the value is available.
    ///
    /// Must not be called from within an async task.
    pub fn wait_blocking(self) -> Result<T, Abandoned> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::Pending(rx) => rx.blocking_recv().map_err(|_| Abandoned),
        }
    }

    pub async fn wait(self) -> Result<T, Abandoned> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::Pending(rx) => rx.await.map_err(|_| Abandoned),
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(_) => f.write_str("Completion::Ready"),
            Self::Pending(_) => f.write_str("Completion::Pending"),
        }
    }
}

/// Fills in a pending [`Completion`].
#[derive(Debug)]
pub struct Completer<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Completer<T> {
    /// Deliver the value. Returns false if nobody is waiting any more.
    pub fn complete(self, value: T) -> bool {
        self.tx.send(value).is_ok()
    }

    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

type FatalHook = Arc<dyn Fn(&FatalError) + Send + Sync>;

/// Runs continuations on the tokio worker pool.
#[derive(Clone)]
pub struct Scheduler {
    handle: Handle,
    on_fatal: FatalHook,
}

impl Scheduler {
    /// A scheduler whose fatal hook aborts the process.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            on_fatal: Arc::new(|_| std::process::abort()),
        }
    }

    /// Scheduler for the runtime the caller is running in, if any.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Replace what happens after a fatal error has been logged.
    pub fn with_fatal_hook(mut self, hook: impl Fn(&FatalError) + Send + Sync + 'static) -> Self {
        self.on_fatal = Arc::new(hook);
        self
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run a blocking continuation on a fresh worker.
    pub fn schedule<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        drop(self.handle.spawn_blocking(job));
    }

    /// Run `job` on a fresh worker once `rx` resolves.
    pub fn resume_when<T, F>(&self, rx: oneshot::Receiver<T>, job: F)
    where
        T: Send + 'static,
        F: FnOnce(Result<T, Abandoned>) + Send + 'static,
    {
        let handle = self.handle.clone();
        drop(self.handle.spawn(async move {
            let outcome = rx.await.map_err(|_| Abandoned);
            drop(handle.spawn_blocking(move || job(outcome)));
        }));
    }

    /// Run `job` on a fresh worker after `delay`. Aborting the returned
    /// handle before the delay elapses cancels it.
    pub fn after<F>(&self, delay: Duration, job: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.handle.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            drop(handle.spawn_blocking(job));
        })
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Report a fatal error from the outermost entry point.
    pub fn fail_fast(&self, error: FatalError) {
        tracing::error!(%error, "fatal dispatcher error");
        (self.on_fatal)(&error);
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}
