//! The logical channel a call belongs to.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use switchyard_core::RequestReceiver;

use crate::{DispatchRuntime, Endpoint, InstanceContext, InstanceContextMode};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Binds an endpoint to the receiver its requests arrive on.
///
/// A session receiver gets exactly one service channel for its lifetime and
/// closing it closes the receiver. Datagram receivers share one service
/// channel per endpoint, and closing it leaves the receiver alone.
pub struct ServiceChannel {
    id: u64,
    session_id: Option<u64>,
    endpoint: Arc<Endpoint>,
    receiver: Arc<dyn RequestReceiver>,
    instance: Mutex<Option<Arc<InstanceContext>>>,
    /// Set until the first call attaches the channel to its instance.
    pending: AtomicBool,
    terminated: AtomicBool,
    closed: AtomicBool,
}

impl ServiceChannel {
    pub fn new(endpoint: Arc<Endpoint>, receiver: Arc<dyn RequestReceiver>) -> Arc<Self> {
        let session_id = receiver.session_id();
        let channel = Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            session_id,
            endpoint,
            receiver,
            instance: Mutex::new(None),
            pending: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        tracing::debug!(
            channel_id = channel.id,
            session_id = ?session_id,
            endpoint = channel.endpoint.name(),
            "service channel opened"
        );
        channel
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    pub fn has_session(&self) -> bool {
        self.session_id.is_some()
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn runtime(&self) -> &Arc<DispatchRuntime> {
        self.endpoint.runtime()
    }

    /// The instance mode actually in force: per-session instancing without a
    /// session degrades to per-call.
    pub fn instance_mode(&self) -> InstanceContextMode {
        match self.runtime().instance_mode() {
            InstanceContextMode::PerSession if !self.has_session() => InstanceContextMode::PerCall,
            mode => mode,
        }
    }

    /// Whether the next call will create a new instance context.
    pub fn needs_instance_context(&self) -> bool {
        match self.instance_mode() {
            InstanceContextMode::PerCall => true,
            InstanceContextMode::PerSession => self.instance.lock().is_none(),
            InstanceContextMode::Single => self.runtime().singleton().is_none(),
        }
    }

    pub fn instance_context(&self) -> Option<Arc<InstanceContext>> {
        self.instance.lock().clone()
    }

    /// The session's instance context, and whether this call created it.
    pub(crate) fn instance_or_create(&self) -> (Arc<InstanceContext>, bool) {
        let mut slot = self.instance.lock();
        if let Some(instance) = slot.as_ref() {
            return (instance.clone(), false);
        }
        let instance = InstanceContext::new(self.runtime().instance_provider().clone());
        *slot = Some(instance.clone());
        (instance, true)
    }

    /// True exactly once, for the first call on the channel.
    pub(crate) fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Refuse further calls. Used after a terminating operation completes.
    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            tracing::debug!(channel_id = self.id, "service channel terminated");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close gracefully. A session channel closes its receiver.
    pub fn close(&self, timeout: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.has_session() {
            if let Err(error) = self.receiver.close(timeout) {
                tracing::debug!(channel_id = self.id, %error, "receiver close failed; aborting");
                self.receiver.abort();
            }
        }
        self.release_instance();
        tracing::debug!(channel_id = self.id, "service channel closed");
    }

    /// Tear down without a graceful close.
    pub fn abort(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.has_session() {
            self.receiver.abort();
        }
        self.release_instance();
        tracing::debug!(channel_id = self.id, "service channel aborted");
    }

    /// Close after an unhandled error whose fault reached the peer. The peer
    /// gets `timeout` to observe the fault before the receiver goes away.
    pub fn close_after_fault(&self, timeout: Duration) {
        tracing::debug!(channel_id = self.id, ?timeout, "closing channel after fault");
        self.close(timeout);
    }

    fn release_instance(&self) {
        if self.instance_mode() != InstanceContextMode::PerSession {
            return;
        }
        if let Some(instance) = self.instance.lock().take() {
            instance.close();
        }
    }
}

impl std::fmt::Debug for ServiceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceChannel")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("endpoint", &self.endpoint.name())
            .field("terminated", &self.is_terminated())
            .field("closed", &self.is_closed())
            .finish()
    }
}
