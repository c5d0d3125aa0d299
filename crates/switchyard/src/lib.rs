//! switchyard: message dispatch for service endpoints.
//!
//! This crate defines:
//! - Channel pumps that receive requests and hand them to endpoints
//!   ([`ChannelDispatcher`], [`ChannelHandler`], [`PumpMode`])
//! - Endpoint selection by address and contract filters ([`EndpointTable`])
//! - Service channels and their instance contexts ([`ServiceChannel`], [`InstanceContext`])
//! - The staged, resumable call pipeline ([`Rpc`], [`Stage`])
//! - Per-endpoint dispatch configuration ([`DispatchRuntime`], [`Operation`])
//! - Extension points: demuxers, inspectors, authorization, error handlers, stage hooks
//! - Transaction batching ([`SharedTransactedBatch`]) and session idle timers ([`IdleManager`])
//! - Request/reply correlation over duplex channels ([`DuplexBinder`])
//!
//! A request flows pump → admission (throttles) → pipeline. Any stage that has
//! to wait (a throttle slot, the instance lock, a thread binding, an async
//! handler) suspends the call; it resumes later on another worker, carrying
//! pump ownership with it.

mod admission;
mod auth;
mod batch;
mod channel_handler;
mod demux;
mod duplex;
mod endpoint;
mod error_handler;
mod hook;
mod idle;
mod inspector;
mod instance;
mod operation;
mod pipeline;
mod rpc;
mod runtime;
mod service_channel;
mod sync_context;

pub use auth::{Authenticator, AuthorizationManager, HeaderAuthenticator, RoleAuthorization};
pub use batch::SharedTransactedBatch;
pub use channel_handler::{ChannelDispatcher, ChannelHandler, PumpMode};
pub use demux::{ActionDemuxer, FilterDemuxer, OperationDemuxer, SelectorDemuxer};
pub use duplex::{DuplexBinder, DuplexError, ReplyResult, RequestHandle};
pub use endpoint::{Endpoint, EndpointTable, Lookup};
pub use error_handler::{ErrorBehavior, ErrorHandler};
pub use hook::StageHook;
pub use idle::IdleManager;
pub use inspector::{Correlation, MessageInspector};
pub use instance::{
    ConcurrencyMode, InstanceContext, InstanceContextMode, InstanceLease, InstanceProvider,
    LockStats, ServiceObject, StatelessProvider,
};
pub use operation::{
    AsyncHandler, HandlerResult, Invocation, Invoker, Operation, SyncHandler, TransactionMode,
};
pub use rpc::{Rpc, Stage};
pub use runtime::{DispatchRuntime, DispatchRuntimeBuilder, ReplyFinalizer};
pub use service_channel::ServiceChannel;
pub use sync_context::{SerialContext, ThreadBinder};
