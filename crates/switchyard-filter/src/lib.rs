//! switchyard-filter: compiled queries over message documents.
//!
//! This crate provides:
//! - A parser for an XPath-style query language ([`parse`], [`ast`])
//! - A reference interpreter over the expression tree ([`Interpreter`])
//! - A compiler to an opcode arena and a VM that runs it ([`Query`], [`Program`])
//! - Many filters merged into one program ([`FilterTable`])
//! - Filters over whole messages ([`MessageFilter`])
//!
//! Every evaluation charges a [`WorkCounter`]; exceeding its quota fails the
//! evaluation with [`FilterError::QuotaExceeded`].

pub mod ast;
mod axis;
mod branch;
mod compiler;
mod error;
mod functions;
mod interpreter;
mod message_filter;
pub mod opcode;
mod optimizer;
mod parser;
mod query;
mod quota;
mod resolve;
mod stack;
mod table;
mod value;
mod vm;

pub use ast::{Expr, ValueType};
pub use branch::{branch_needs_always, BranchId, BranchIndex, Literal};
pub use compiler::{CompileMode, MAX_PREDICATE_DEPTH};
pub use error::FilterError;
pub use interpreter::Interpreter;
pub use message_filter::*;
pub use opcode::{FilterId, Opcode, OpcodeId, Program};
pub use optimizer::optimize;
pub use parser::{parse, MAX_NESTING};
pub use query::{Evaluation, Query, QueryOptions};
pub use quota::WorkCounter;
pub use resolve::{FunctionResolver, VariableResolver};
pub use table::FilterTable;
pub use value::{compare, format_number, parse_number, Value};
pub use vm::ExecStats;
