//! Ambient per-call context.

use std::cell::RefCell;
use std::sync::Arc;

use crate::{MessageId, Transaction};

/// Describes the call the current thread is working on.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub channel_id: u64,
    pub session_id: Option<u64>,
    pub action: Option<String>,
    pub message_id: Option<MessageId>,
    pub transaction: Option<Transaction>,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<OperationContext>>> = const { RefCell::new(None) };
}

impl OperationContext {
    pub fn current() -> Option<Arc<OperationContext>> {
        CURRENT.with(|current| current.borrow().clone())
    }
}

/// Sets the ambient [`OperationContext`] and puts the previous one back when
/// dropped, including during unwinding.
#[must_use = "the previous context is restored when the scope is dropped"]
pub struct OperationContextScope {
    previous: Option<Arc<OperationContext>>,
}

impl OperationContextScope {
    pub fn enter(context: Option<Arc<OperationContext>>) -> Self {
        let previous = CURRENT.with(|current| current.replace(context));
        Self { previous }
    }

    /// Leave the current context in place but restore it on drop.
    pub fn preserve() -> Self {
        Self {
            previous: OperationContext::current(),
        }
    }
}

impl Drop for OperationContextScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| {
            current.replace(previous);
        });
    }
}
