//! Message inspectors.

use std::any::Any;

use switchyard_core::{DispatchError, Message};

/// Opaque state an inspector hands from the request side to the reply side.
pub type Correlation = Box<dyn Any + Send>;

/// Sees every request before the handler runs and every reply before it is
/// sent.
///
/// Each inspector owns one correlation slot in the call record; whatever
/// `after_receive_request` returns is given back to `before_send_reply` of the
/// same inspector for the same call.
pub trait MessageInspector: Send + Sync {
    fn after_receive_request(
        &self,
        request: &mut Message,
    ) -> Result<Option<Correlation>, DispatchError>;

    /// `reply` is `None` for one-way operations and suppressed replies.
    fn before_send_reply(&self, reply: &mut Option<Message>, correlation: Option<Correlation>);
}
