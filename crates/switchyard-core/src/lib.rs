//! switchyard-core: shared types for the switchyard dispatcher.
//!
//! This crate defines:
//! - Messages and addressing headers ([`Message`], [`Headers`], [`EndpointAddress`])
//! - The document tree message bodies are made of ([`Document`], [`DocumentBuilder`])
//! - Protocol faults ([`Fault`], [`FaultCode`])
//! - Error taxonomy ([`DispatchError`], [`TransportError`], [`FatalError`])
//! - Suspension primitives ([`Completion`], [`Completer`], [`Scheduler`])
//! - Collaborator traits ([`RequestReceiver`], [`RequestContext`], [`DuplexChannel`])
//! - Admission throttles ([`ServiceThrottle`])
//! - Transactions and the ambient operation context
//! - Configuration ([`DispatcherConfig`])
//! - In-memory channels for tests and embedding (`mem` feature)

mod channel;
mod completion;
mod config;
mod context;
mod document;
mod error;
mod fault;
mod message;
mod throttle;
mod transaction;

#[cfg(feature = "mem")]
pub mod mem;

pub use channel::*;
pub use completion::*;
pub use config::*;
pub use context::*;
pub use document::*;
pub use error::*;
pub use fault::*;
pub use message::*;
pub use throttle::*;
pub use transaction::*;
