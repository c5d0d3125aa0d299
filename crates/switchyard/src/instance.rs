//! Instance contexts: the service object a call runs against, and the lock
//! that serializes calls on it.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use switchyard_core::{Abandoned, Completer, Completion, DispatchError, ServiceThrottle};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// The user's service object, shared by every call on one instance context.
pub type ServiceObject = Arc<dyn Any + Send + Sync>;

/// How long an instance context lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceContextMode {
    /// One per session. Session-less channels fall back to one per call.
    #[default]
    PerSession,
    PerCall,
    /// One for the whole endpoint.
    Single,
}

/// How calls on one instance context may overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
    /// One call at a time, in arrival order.
    #[default]
    Single,
    /// One call at a time, but a call gives the lock up while it waits on
    /// outgoing work through [`Invocation::call_out`](crate::Invocation::call_out),
    /// so a callback into the same instance can run meanwhile.
    Reentrant,
    /// No instance lock; calls run in parallel and the pump keeps receiving
    /// while they do.
    Multiple,
}

impl ConcurrencyMode {
    pub fn locks_instance(self) -> bool {
        !matches!(self, Self::Multiple)
    }

    /// Whether a call hands the pump back once it is ready to invoke.
    pub fn releases_pump(self) -> bool {
        !matches!(self, Self::Single)
    }
}

/// Creates service objects for new instance contexts.
pub trait InstanceProvider: Send + Sync {
    fn create(&self, context: &InstanceContext) -> Result<ServiceObject, DispatchError>;

    fn release(&self, _context: &InstanceContext, _instance: ServiceObject) {}
}

impl<F> InstanceProvider for F
where
    F: Fn() -> ServiceObject + Send + Sync,
{
    fn create(&self, _context: &InstanceContext) -> Result<ServiceObject, DispatchError> {
        Ok(self())
    }
}

/// Provider for services that keep no per-instance state.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatelessProvider;

impl InstanceProvider for StatelessProvider {
    fn create(&self, _context: &InstanceContext) -> Result<ServiceObject, DispatchError> {
        Ok(Arc::new(()))
    }
}

struct LockState {
    held: bool,
    waiters: VecDeque<Completer<()>>,
}

/// Lock and unlock counts, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockStats {
    pub locks: usize,
    pub unlocks: usize,
}

pub struct InstanceContext {
    id: u64,
    provider: Arc<dyn InstanceProvider>,
    lock: Mutex<LockState>,
    service: Mutex<Option<ServiceObject>>,
    /// Instance-throttle slot this context releases when it closes.
    throttle: Mutex<Option<Arc<ServiceThrottle>>>,
    channels: Mutex<Vec<u64>>,
    closed: AtomicBool,
    locks: AtomicUsize,
    unlocks: AtomicUsize,
}

impl InstanceContext {
    pub fn new(provider: Arc<dyn InstanceProvider>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            provider,
            lock: Mutex::new(LockState {
                held: false,
                waiters: VecDeque::new(),
            }),
            service: Mutex::new(None),
            throttle: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            locks: AtomicUsize::new(0),
            unlocks: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Take the lock, or queue behind the current holder. Waiters are granted
    /// the lock in the order they asked for it.
    pub fn lock(&self) -> Completion<()> {
        let mut state = self.lock.lock();
        if !state.held {
            state.held = true;
            self.locks.fetch_add(1, Ordering::Relaxed);
            return Completion::Ready(());
        }
        let (completer, completion) = Completion::pending();
        state.waiters.push_back(completer);
        tracing::debug!(
            instance_id = self.id,
            waiting = state.waiters.len(),
            "instance busy; call queued"
        );
        completion
    }

    /// Release the lock, handing it straight to the oldest live waiter.
    pub fn unlock(&self) {
        self.unlocks.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock.lock();
        if !state.held {
            tracing::warn!(instance_id = self.id, "instance unlocked while not locked");
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.complete(()) {
                self.locks.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        state.held = false;
    }

    pub fn is_locked(&self) -> bool {
        self.lock.lock().held
    }

    pub fn lock_stats(&self) -> LockStats {
        LockStats {
            locks: self.locks.load(Ordering::Relaxed),
            unlocks: self.unlocks.load(Ordering::Relaxed),
        }
    }

    /// The service object, created on first use.
    pub fn service_object(&self) -> Result<ServiceObject, DispatchError> {
        let mut service = self.service.lock();
        if let Some(object) = service.as_ref() {
            return Ok(object.clone());
        }
        let object = self.provider.create(self)?;
        tracing::debug!(instance_id = self.id, "service object created");
        *service = Some(object.clone());
        Ok(object)
    }

    pub fn has_service_object(&self) -> bool {
        self.service.lock().is_some()
    }

    pub(crate) fn own_throttle_slot(&self, throttle: Arc<ServiceThrottle>) {
        let previous = self.throttle.lock().replace(throttle);
        if let Some(previous) = previous {
            previous.deactivate_instance_context();
        }
    }

    pub(crate) fn attach_channel(&self, channel_id: u64) {
        self.channels.lock().push(channel_id);
    }

    /// Ids of the channels attached to this context.
    pub fn channels(&self) -> Vec<u64> {
        self.channels.lock().clone()
    }

    /// Release the service object and the throttle slot. Calls still queued
    /// on the lock see their wait abandoned.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let abandoned = std::mem::take(&mut self.lock.lock().waiters);
        if !abandoned.is_empty() {
            tracing::debug!(
                instance_id = self.id,
                waiters = abandoned.len(),
                "instance closed with calls waiting"
            );
        }
        drop(abandoned);
        if let Some(object) = self.service.lock().take() {
            self.provider.release(self, object);
        }
        if let Some(throttle) = self.throttle.lock().take() {
            throttle.deactivate_instance_context();
        }
        tracing::debug!(instance_id = self.id, "instance context closed");
    }
}

/// One call's hold on an instance lock.
///
/// The lock is released at most once per hold; a released lease can be taken
/// back, queueing behind every call that asked for the lock in the meantime.
pub struct InstanceLease {
    instance: Arc<InstanceContext>,
    held: AtomicBool,
}

impl InstanceLease {
    /// Wrap a lock the caller already holds.
    pub(crate) fn held(instance: Arc<InstanceContext>) -> Arc<Self> {
        Arc::new(Self {
            instance,
            held: AtomicBool::new(true),
        })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Give the lock up. False when it was not held.
    pub(crate) fn release(&self) -> bool {
        if !self.held.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.instance.unlock();
        true
    }

    /// Take the lock back, blocking the current thread.
    pub(crate) fn reacquire_blocking(&self) -> Result<(), Abandoned> {
        let granted = self.instance.lock().wait_blocking();
        self.regained(granted)
    }

    pub(crate) async fn reacquire(&self) -> Result<(), Abandoned> {
        let granted = self.instance.lock().wait().await;
        self.regained(granted)
    }

    fn regained(&self, granted: Result<(), Abandoned>) -> Result<(), Abandoned> {
        granted?;
        self.held.store(true, Ordering::Release);
        tracing::trace!(instance_id = self.instance.id, "instance lock regained");
        Ok(())
    }
}

impl std::fmt::Debug for InstanceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLease")
            .field("instance_id", &self.instance.id)
            .field("held", &self.is_held())
            .finish()
    }
}

impl std::fmt::Debug for InstanceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceContext")
            .field("id", &self.id)
            .field("locked", &self.is_locked())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::Abandoned;

    fn context() -> Arc<InstanceContext> {
        InstanceContext::new(Arc::new(StatelessProvider))
    }

    #[test]
    fn waiters_are_granted_in_fifo_order() {
        let instance = context();
        assert!(instance.lock().is_ready());
        let first = instance.lock();
        let second = instance.lock();
        assert!(!first.is_ready());

        instance.unlock();
        assert_eq!(first.wait_blocking(), Ok(()));
        assert!(instance.is_locked());

        instance.unlock();
        assert_eq!(second.wait_blocking(), Ok(()));
        instance.unlock();
        assert!(!instance.is_locked());
        assert_eq!(
            instance.lock_stats(),
            LockStats {
                locks: 3,
                unlocks: 3
            }
        );
    }

    #[test]
    fn abandoned_waiters_are_skipped() {
        let instance = context();
        assert!(instance.lock().is_ready());
        drop(instance.lock());
        let live = instance.lock();
        instance.unlock();
        assert_eq!(live.wait_blocking(), Ok(()));
    }

    #[test]
    fn closing_abandons_queued_calls_and_releases_the_object() {
        let instance = context();
        assert!(instance.service_object().is_ok());
        assert!(instance.lock().is_ready());
        let queued = instance.lock();
        instance.close();
        instance.close();
        assert_eq!(queued.wait_blocking(), Err(Abandoned));
        assert!(!instance.has_service_object());
    }

    #[test]
    fn released_lease_lets_a_waiter_in_and_queues_behind_it() {
        let instance = context();
        assert!(instance.lock().is_ready());
        let lease = InstanceLease::held(instance.clone());
        let callback = instance.lock();
        assert!(!callback.is_ready());

        assert!(lease.release());
        assert!(!lease.release());
        assert_eq!(callback.wait_blocking(), Ok(()));

        // The callback holds the lock; the lease waits for it.
        let regained = std::thread::scope(|scope| {
            let waiter = scope.spawn(|| lease.reacquire_blocking());
            while instance.lock.lock().waiters.is_empty() {
                std::thread::yield_now();
            }
            assert!(!lease.is_held());
            instance.unlock();
            waiter.join().unwrap()
        });
        assert_eq!(regained, Ok(()));
        assert!(lease.is_held());
        assert!(lease.release());
        assert!(!instance.is_locked());
        let stats = instance.lock_stats();
        assert_eq!(stats.locks, stats.unlocks);
    }

    #[test]
    fn only_single_concurrency_keeps_the_pump() {
        assert!(!ConcurrencyMode::Single.releases_pump());
        assert!(ConcurrencyMode::Reentrant.releases_pump());
        assert!(ConcurrencyMode::Multiple.releases_pump());
        assert!(ConcurrencyMode::Reentrant.locks_instance());
    }

    #[test]
    fn closures_provide_service_objects() {
        let provider = || -> ServiceObject { Arc::new(41u32) };
        let instance = InstanceContext::new(Arc::new(provider));
        let object = instance.service_object().unwrap();
        assert_eq!(object.downcast_ref::<u32>(), Some(&41));
        let again = instance.service_object().unwrap();
        assert!(Arc::ptr_eq(&object, &again));
    }
}
