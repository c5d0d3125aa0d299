//! Session idle timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use switchyard_core::Scheduler;
use tokio::task::JoinHandle;

struct IdleState {
    last_activity: Instant,
    timer: Option<JoinHandle<()>>,
}

/// Fires `on_idle` once when no activity was recorded for `timeout`.
pub struct IdleManager {
    timeout: Duration,
    scheduler: Scheduler,
    on_idle: Box<dyn Fn() + Send + Sync>,
    state: Mutex<IdleState>,
    cancelled: AtomicBool,
    fired: AtomicBool,
    this: Weak<IdleManager>,
}

impl IdleManager {
    pub fn start(
        scheduler: Scheduler,
        timeout: Duration,
        on_idle: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|this| Self {
            timeout,
            scheduler,
            on_idle: Box::new(on_idle),
            state: Mutex::new(IdleState {
                last_activity: Instant::now(),
                timer: None,
            }),
            cancelled: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            this: this.clone(),
        });
        manager.arm(timeout);
        manager
    }

    /// Record activity, pushing the deadline out by a full timeout.
    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    /// Stop the timer for good.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(timer) = self.state.lock().timer.take() {
            timer.abort();
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn arm(&self, delay: Duration) {
        let this = self.this.clone();
        let timer = self.scheduler.after(delay, move || {
            if let Some(manager) = this.upgrade() {
                manager.check();
            }
        });
        let mut state = self.state.lock();
        if self.cancelled.load(Ordering::Acquire) {
            timer.abort();
            return;
        }
        state.timer = Some(timer);
    }

    /// The timer went off: fire if the session really was idle, otherwise
    /// sleep for the rest of the new deadline.
    fn check(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let idle_for = self.state.lock().last_activity.elapsed();
        if idle_for < self.timeout {
            self.arm(self.timeout - idle_for);
            return;
        }
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::warn!(idle_for = ?idle_for, timeout = ?self.timeout, "session idle timeout elapsed");
        (self.on_idle)();
    }
}

impl Drop for IdleManager {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}
