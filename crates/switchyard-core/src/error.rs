//! Error types.

use core::fmt;
use std::time::Duration;

use crate::Fault;

/// Errors reported by channel and request-context collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel or request context was already closed.
    Closed,
    /// The channel or request context was aborted.
    Aborted,
    /// The operation did not complete within its timeout.
    Timeout(Duration),
    /// Any other I/O failure, described by the transport.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Aborted => write!(f, "transport aborted"),
            Self::Timeout(after) => write!(f, "transport timed out after {after:?}"),
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// An unrecoverable host-level failure.
///
/// Fatal errors are never handled. Every catch site forwards them with
/// [`DispatchError::reraise_fatal`] and the outermost entry point hands them to
/// [`Scheduler::fail_fast`](crate::Scheduler::fail_fast).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError {
    message: String,
}

impl FatalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal: {}", self.message)
    }
}

impl std::error::Error for FatalError {}

/// Errors raised while admitting, dispatching or replying to a request.
#[derive(Debug, Clone)]
pub enum DispatchError {
    /// Unrecoverable; never caught.
    Fatal(FatalError),
    /// A protocol fault that should be returned to the caller as-is.
    Fault(Fault),
    /// The user's operation failed.
    Handler { message: String },
    /// A channel or request context failed.
    Transport(TransportError),
    /// The ambient transaction could not be created, attached or resolved.
    Transaction(String),
    /// A dispatch-level timeout elapsed.
    Timeout(Duration),
}

impl DispatchError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Forward the fatal class, hand back everything else for handling.
    pub fn reraise_fatal(self) -> Result<Self, FatalError> {
        match self {
            Self::Fatal(fatal) => Err(fatal),
            other => Ok(other),
        }
    }

    pub fn as_fault(&self) -> Option<&Fault> {
        match self {
            Self::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal(e) => write!(f, "{e}"),
            Self::Fault(fault) => write!(f, "fault: {fault}"),
            Self::Handler { message } => write!(f, "handler error: {message}"),
            Self::Transport(e) => write!(f, "{e}"),
            Self::Transaction(msg) => write!(f, "transaction error: {msg}"),
            Self::Timeout(after) => write!(f, "dispatch timed out after {after:?}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fatal(e) => Some(e),
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for DispatchError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<Fault> for DispatchError {
    fn from(fault: Fault) -> Self {
        Self::Fault(fault)
    }
}

impl From<FatalError> for DispatchError {
    fn from(e: FatalError) -> Self {
        Self::Fatal(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FaultCode;

    #[test]
    fn reraise_only_forwards_fatal() {
        let fatal = DispatchError::Fatal(FatalError::new("heap corrupted"));
        assert_eq!(
            fatal.reraise_fatal().unwrap_err().message(),
            "heap corrupted"
        );

        let fault = DispatchError::from(Fault::new(FaultCode::AccessDenied, "nope"));
        assert!(fault.reraise_fatal().is_ok());
    }
}
