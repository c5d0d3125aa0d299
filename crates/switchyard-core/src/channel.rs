//! Collaborator traits for channels and request contexts.

use std::time::Duration;

use crate::{Completion, Message, Transaction, TransportError};

/// Effectively unbounded timeout used by the receive pump.
pub const INFINITE_TIMEOUT: Duration = Duration::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunicationState {
    Created,
    Opened,
    Closing,
    Closed,
    Faulted,
}

impl CommunicationState {
    pub fn is_open(self) -> bool {
        matches!(self, Self::Created | Self::Opened)
    }
}

/// Outcome of a try-receive.
#[derive(Debug)]
pub enum Received<T> {
    Item(T),
    /// The peer finished sending; no more items will arrive.
    Eof,
    TimedOut,
}

/// An inbound request that must be replied to, closed or aborted exactly once.
pub trait RequestContext: Send {
    fn request_message(&self) -> &Message;

    fn request_message_mut(&mut self) -> &mut Message;

    /// Send the reply. `None` acknowledges without a body.
    fn reply(&mut self, reply: Option<Message>, timeout: Duration) -> Result<(), TransportError>;

    fn begin_reply(
        &mut self,
        reply: Option<Message>,
        timeout: Duration,
    ) -> Completion<Result<(), TransportError>> {
        Completion::Ready(self.reply(reply, timeout))
    }

    /// Finish the request gracefully.
    fn close(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Tear the request down without a graceful close.
    fn abort(&mut self);
}

pub type BoxedRequest = Box<dyn RequestContext>;

/// The inbound side of a channel.
pub trait RequestReceiver: Send + Sync {
    fn try_receive(&self, timeout: Duration) -> Result<Received<BoxedRequest>, TransportError>;

    fn begin_try_receive(
        &self,
        timeout: Duration,
    ) -> Completion<Result<Received<BoxedRequest>, TransportError>> {
        Completion::Ready(self.try_receive(timeout))
    }

    /// Wait until a request is available without dequeuing it.
    fn wait_for_message(&self, timeout: Duration) -> Result<bool, TransportError>;

    /// Session channels deliver every request to one logical service channel.
    fn has_session(&self) -> bool;

    fn session_id(&self) -> Option<u64>;

    fn state(&self) -> CommunicationState;

    fn close(&self, timeout: Duration) -> Result<(), TransportError>;

    fn abort(&self);
}

/// A bidirectional channel where requests and replies share one pipe.
pub trait DuplexChannel: Send + Sync {
    fn send(&self, message: Message, timeout: Duration) -> Result<(), TransportError>;

    fn begin_send(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Completion<Result<(), TransportError>> {
        Completion::Ready(self.send(message, timeout))
    }

    fn try_receive(&self, timeout: Duration) -> Result<Received<Message>, TransportError>;

    fn begin_try_receive(
        &self,
        timeout: Duration,
    ) -> Completion<Result<Received<Message>, TransportError>> {
        Completion::Ready(self.try_receive(timeout))
    }

    fn session_id(&self) -> Option<u64>;

    fn state(&self) -> CommunicationState;

    fn close(&self, timeout: Duration) -> Result<(), TransportError>;

    fn abort(&self);
}

/// Explicit receive acknowledgement for transports that need one.
pub trait ReceiveContext: Send + Sync {
    /// Acknowledge the message, inside `transaction` when one is active.
    fn complete(&self, transaction: Option<&Transaction>) -> Result<(), TransportError>;

    /// Return the message to the transport for redelivery.
    fn abandon(&self);
}
