//! Admission throttles.
//!
//! A [`ServiceThrottle`] bounds concurrent calls, instance contexts and
//! sessions. An acquire that finds its flow saturated parks the caller's
//! waiter and returns `false`; the waiter runs later, on a fresh worker, once a
//! slot is handed to it by a matching deactivate.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{DispatcherConfig, Scheduler};

/// Callback run once a parked acquire has been granted its slot.
pub type ThrottleWaiter = Box<dyn FnOnce() + Send>;

struct FlowThrottle {
    name: &'static str,
    capacity: usize,
    count: usize,
    waiters: VecDeque<ThrottleWaiter>,
}

impl FlowThrottle {
    fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            count: 0,
            waiters: VecDeque::new(),
        }
    }

    fn acquire(&mut self, waiter: ThrottleWaiter) -> bool {
        if self.count < self.capacity {
            self.count += 1;
            return true;
        }
        self.waiters.push_back(waiter);
        tracing::debug!(
            throttle = self.name,
            capacity = self.capacity,
            waiting = self.waiters.len(),
            "throttle saturated; parking waiter"
        );
        false
    }

    /// Release one slot, or hand it straight to the oldest waiter.
    fn release(&mut self) -> Option<ThrottleWaiter> {
        if let Some(waiter) = self.waiters.pop_front() {
            return Some(waiter);
        }
        if self.count == 0 {
            tracing::warn!(throttle = self.name, "throttle released more often than acquired");
            return None;
        }
        self.count -= 1;
        None
    }
}

pub struct ServiceThrottle {
    calls: Mutex<FlowThrottle>,
    instances: Mutex<FlowThrottle>,
    sessions: Mutex<FlowThrottle>,
    scheduler: Scheduler,
}

impl ServiceThrottle {
    pub fn new(config: &DispatcherConfig, scheduler: Scheduler) -> Arc<Self> {
        Self::with_limits(
            config.max_concurrent_calls,
            config.max_concurrent_instances,
            config.max_concurrent_sessions,
            scheduler,
        )
    }

    pub fn with_limits(
        calls: usize,
        instances: usize,
        sessions: usize,
        scheduler: Scheduler,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(FlowThrottle::new("calls", calls)),
            instances: Mutex::new(FlowThrottle::new("instances", instances)),
            sessions: Mutex::new(FlowThrottle::new("sessions", sessions)),
            scheduler,
        })
    }

    /// Take a call slot. Returns false and parks `waiter` when saturated.
    pub fn acquire_call(&self, waiter: impl FnOnce() + Send + 'static) -> bool {
        self.calls.lock().acquire(Box::new(waiter))
    }

    /// Take an instance-context slot, but only when `acquire` is set (no
    /// existing instance context was found for the request).
    pub fn acquire_instance_context(
        &self,
        acquire: bool,
        waiter: impl FnOnce() + Send + 'static,
    ) -> bool {
        if !acquire {
            return true;
        }
        self.instances.lock().acquire(Box::new(waiter))
    }

    pub fn acquire_session(&self, waiter: impl FnOnce() + Send + 'static) -> bool {
        self.sessions.lock().acquire(Box::new(waiter))
    }

    pub fn deactivate_call(&self) {
        let next = self.calls.lock().release();
        self.hand_off(next);
    }

    pub fn deactivate_instance_context(&self) {
        let next = self.instances.lock().release();
        self.hand_off(next);
    }

    pub fn deactivate_channel(&self) {
        let next = self.sessions.lock().release();
        self.hand_off(next);
    }

    pub fn active_calls(&self) -> usize {
        self.calls.lock().count
    }

    pub fn active_instance_contexts(&self) -> usize {
        self.instances.lock().count
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().count
    }

    fn hand_off(&self, next: Option<ThrottleWaiter>) {
        if let Some(waiter) = next {
            self.scheduler.schedule(waiter);
        }
    }
}

impl std::fmt::Debug for ServiceThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceThrottle")
            .field("calls", &self.active_calls())
            .field("instances", &self.active_instance_contexts())
            .field("sessions", &self.active_sessions())
            .finish()
    }
}
