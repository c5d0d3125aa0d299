//! Error handlers and the fault of last resort.

use std::sync::Arc;

use switchyard_core::{DispatchError, Fault, Message};

/// Extension point for dispatch errors.
pub trait ErrorHandler: Send + Sync {
    /// Report an error. Returning true marks it handled: the request and its
    /// session are closed gracefully instead of aborted.
    fn handle_error(&self, error: &DispatchError) -> bool;

    /// Choose the fault returned to the caller. Handlers run in order and
    /// each sees what the previous ones chose; `None` keeps the default.
    fn provide_fault(&self, _error: &DispatchError, _fault: &mut Option<Fault>) {}
}

/// The error handlers of one runtime, applied as a unit.
#[derive(Clone, Default)]
pub struct ErrorBehavior {
    handlers: Vec<Arc<dyn ErrorHandler>>,
    include_exception_detail: bool,
}

impl ErrorBehavior {
    pub fn new(handlers: Vec<Arc<dyn ErrorHandler>>, include_exception_detail: bool) -> Self {
        Self {
            handlers,
            include_exception_detail,
        }
    }

    /// Offer the error to every handler. True if any of them handled it.
    pub fn report(&self, error: &DispatchError) -> bool {
        let mut handled = false;
        for handler in &self.handlers {
            handled |= handler.handle_error(error);
        }
        handled
    }

    /// Build the fault reply for `error`.
    pub fn provide_fault(&self, error: &DispatchError) -> Message {
        let mut fault = None;
        for handler in &self.handlers {
            handler.provide_fault(error, &mut fault);
        }
        Message::from_fault(fault.unwrap_or_else(|| self.last_resort(error)))
    }

    fn last_resort(&self, error: &DispatchError) -> Fault {
        match error {
            DispatchError::Fault(fault) => fault.clone(),
            other => Fault::internal(self.include_exception_detail.then(|| other.to_string())),
        }
    }
}

impl std::fmt::Debug for ErrorBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorBehavior")
            .field("handlers", &self.handlers.len())
            .field("include_exception_detail", &self.include_exception_detail)
            .finish()
    }
}
