//! Filter errors.

use core::fmt;

use switchyard_core::{Fault, FaultCode};

#[derive(Debug, Clone, PartialEq)]
pub enum FilterError {
    /// The query text is not well-formed.
    Parse { position: usize, message: String },
    UnknownFunction(String),
    Arity {
        function: String,
        expected: String,
        found: usize,
    },
    /// Predicates nested deeper than the compiler allows.
    PredicateDepthExceeded { max: usize },
    /// Evaluation ran out of its work budget.
    QuotaExceeded { quota: usize },
    /// An operand had the wrong type for its operator, e.g. a path step over
    /// a number.
    TypeMismatch(String),
    UnresolvedVariable(String),
    UnresolvedFunction(String),
    /// More than one filter matched where at most one was expected.
    MultipleMatches,
    /// The program violated one of the VM's structural assumptions.
    InvalidProgram(String),
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse { position, message } => {
                write!(f, "parse error at {position}: {message}")
            }
            Self::UnknownFunction(name) => write!(f, "unknown function '{name}'"),
            Self::Arity {
                function,
                expected,
                found,
            } => write!(f, "{function}() expects {expected} arguments, found {found}"),
            Self::PredicateDepthExceeded { max } => {
                write!(f, "predicates nested deeper than {max} levels")
            }
            Self::QuotaExceeded { quota } => {
                write!(f, "filter evaluation exceeded its quota of {quota} nodes")
            }
            Self::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            Self::UnresolvedVariable(name) => write!(f, "unresolved variable '${name}'"),
            Self::UnresolvedFunction(name) => write!(f, "unresolved function '{name}'"),
            Self::MultipleMatches => write!(f, "more than one filter matched"),
            Self::InvalidProgram(msg) => write!(f, "invalid filter program: {msg}"),
        }
    }
}

impl std::error::Error for FilterError {}

impl From<FilterError> for Fault {
    fn from(e: FilterError) -> Self {
        let code = match e {
            FilterError::QuotaExceeded { .. } => FaultCode::QuotaExceeded,
            FilterError::MultipleMatches => FaultCode::MultipleFilterMatches,
            _ => FaultCode::Receiver,
        };
        Fault::new(code, e.to_string())
    }
}
