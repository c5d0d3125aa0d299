//! Protocol faults.

use core::fmt;

/// Addressing action carried by every fault reply.
pub const FAULT_ACTION: &str = "urn:switchyard:addressing/fault";

/// Fault codes produced by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCode {
    /// No endpoint's address filter accepted the `To` header.
    AddressFilterDidNotMatch,
    /// An endpoint's address matched but no contract accepted the action.
    ContractFilterDidNotMatch,
    /// More than one endpoint filter matched at the same priority.
    MultipleFilterMatches,
    /// A request arrived after a terminating operation ended the session.
    SessionTerminated,
    /// Authentication or authorization refused the caller.
    AccessDenied,
    /// A required addressing header was missing or malformed.
    MessageHeaderError,
    /// A filter exhausted its work budget.
    QuotaExceeded,
    /// Last-resort fault for an unhandled service error.
    InternalServiceFault,
    /// Generic sender-side fault supplied by an error handler.
    Sender,
    /// Generic receiver-side fault supplied by an error handler.
    Receiver,
}

impl FaultCode {
    /// True when the fault blames the sender rather than the service.
    pub fn is_sender_fault(self) -> bool {
        !matches!(
            self,
            Self::InternalServiceFault | Self::Receiver | Self::QuotaExceeded
        )
    }

    /// Wire subcode name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddressFilterDidNotMatch => "DestinationUnreachable",
            Self::ContractFilterDidNotMatch => "ActionNotSupported",
            Self::MultipleFilterMatches => "MultipleFilterMatches",
            Self::SessionTerminated => "SessionTerminated",
            Self::AccessDenied => "AccessDenied",
            Self::MessageHeaderError => "MessageAddressingHeaderRequired",
            Self::QuotaExceeded => "QuotaExceeded",
            Self::InternalServiceFault => "InternalServiceFault",
            Self::Sender => "Sender",
            Self::Receiver => "Receiver",
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fault returned to the caller instead of a normal reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub code: FaultCode,
    pub reason: String,
    pub detail: Option<String>,
}

impl Fault {
    pub fn new(code: FaultCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn address_filter_mismatch(to: Option<&str>) -> Self {
        Self::new(
            FaultCode::AddressFilterDidNotMatch,
            format!(
                "the message with To '{}' cannot be processed at the receiver; no endpoint address matched",
                to.unwrap_or("")
            ),
        )
    }

    pub fn contract_filter_mismatch(action: Option<&str>) -> Self {
        Self::new(
            FaultCode::ContractFilterDidNotMatch,
            format!(
                "the message with Action '{}' cannot be processed at the receiver; no contract matched",
                action.unwrap_or("")
            ),
        )
    }

    pub fn missing_header(header: &str) -> Self {
        Self::new(
            FaultCode::MessageHeaderError,
            format!("required addressing header '{header}' is missing"),
        )
    }

    pub fn session_terminated() -> Self {
        Self::new(
            FaultCode::SessionTerminated,
            "the session was terminated by a previous operation",
        )
    }

    /// The fault of last resort, optionally exposing the underlying error.
    pub fn internal(detail: Option<String>) -> Self {
        let fault = Self::new(
            FaultCode::InternalServiceFault,
            "the server was unable to process the request due to an internal error",
        );
        match detail {
            Some(detail) => fault.with_detail(detail),
            None => fault,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.reason)
    }
}
