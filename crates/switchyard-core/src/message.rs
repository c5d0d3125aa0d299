//! Messages and addressing headers.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::{Document, DocumentBuilder, Fault, ReceiveContext, Transaction, FAULT_ACTION};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique message identifier used for request/reply correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl MessageId {
    /// Allocate a process-unique id.
    pub fn new_unique() -> Self {
        Self(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "urn:switchyard:msg:{}", self.0)
    }
}

/// Where replies and faults should be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointAddress {
    /// Reply on the back channel the request arrived on.
    Anonymous,
    /// Do not reply at all.
    None,
    Uri(String),
}

impl EndpointAddress {
    pub fn uri(uri: impl Into<String>) -> Self {
        Self::Uri(uri.into())
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Anonymous => "urn:switchyard:anonymous",
            Self::None => "urn:switchyard:none",
            Self::Uri(uri) => uri,
        }
    }
}

/// Addressing headers plus any application headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    pub action: Option<String>,
    pub to: Option<String>,
    pub message_id: Option<MessageId>,
    pub relates_to: Option<MessageId>,
    pub reply_to: Option<EndpointAddress>,
    pub fault_to: Option<EndpointAddress>,
    pub custom: Vec<(String, String)>,
}

/// Out-of-band properties that travel with a message but are never serialized.
#[derive(Clone, Default)]
pub struct Properties {
    /// Transaction flowed in with the request.
    pub transaction: Option<Transaction>,
    /// Acknowledgement handle for transports with explicit receive completion.
    pub receive_context: Option<Arc<dyn ReceiveContext>>,
}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Properties")
            .field("transaction", &self.transaction.as_ref().map(|t| t.id()))
            .field("receive_context", &self.receive_context.is_some())
            .finish()
    }
}

/// A message: headers, properties, a body document and an optional fault.
#[derive(Debug, Clone)]
pub struct Message {
    headers: Headers,
    properties: Properties,
    body: Arc<Document>,
    fault: Option<Fault>,
}

impl Message {
    /// A message with the given action and an empty body.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            headers: Headers {
                action: Some(action.into()),
                ..Headers::default()
            },
            properties: Properties::default(),
            body: Arc::new(Document::empty()),
            fault: None,
        }
    }

    /// A request expecting a reply: fresh message id, anonymous reply-to.
    pub fn request(action: impl Into<String>) -> Self {
        let mut message = Self::new(action);
        message.headers.message_id = Some(MessageId::new_unique());
        message.headers.reply_to = Some(EndpointAddress::Anonymous);
        message
    }

    /// A message with no action header at all.
    pub fn without_action() -> Self {
        let mut message = Self::new("");
        message.headers.action = None;
        message
    }

    pub fn from_fault(fault: Fault) -> Self {
        let mut message = Self::new(FAULT_ACTION);
        message.body = Arc::new(
            DocumentBuilder::new()
                .start("Fault", &[])
                .leaf("Code", fault.code.as_str())
                .leaf("Reason", &fault.reason)
                .end()
                .finish(),
        );
        message.fault = Some(fault);
        message
    }

    pub fn with_body(mut self, body: Document) -> Self {
        self.body = Arc::new(body);
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.headers.to = Some(to.into());
        self
    }

    pub fn with_message_id(mut self, id: MessageId) -> Self {
        self.headers.message_id = Some(id);
        self
    }

    pub fn with_relates_to(mut self, id: MessageId) -> Self {
        self.headers.relates_to = Some(id);
        self
    }

    pub fn with_reply_to(mut self, address: EndpointAddress) -> Self {
        self.headers.reply_to = Some(address);
        self
    }

    pub fn with_fault_to(mut self, address: EndpointAddress) -> Self {
        self.headers.fault_to = Some(address);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.custom.push((name.into(), value.into()));
        self
    }

    pub fn with_transaction(mut self, transaction: Transaction) -> Self {
        self.properties.transaction = Some(transaction);
        self
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    pub fn body(&self) -> &Document {
        &self.body
    }

    pub fn action(&self) -> Option<&str> {
        self.headers.action.as_deref()
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.headers.message_id
    }

    pub fn relates_to(&self) -> Option<MessageId> {
        self.headers.relates_to
    }

    pub fn is_fault(&self) -> bool {
        self.fault.is_some()
    }

    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .custom
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// An `Envelope/Header/Body` view of the message for query filters.
    ///
    /// Addressing headers appear as `Action`, `To`, `MessageID`, `RelatesTo`,
    /// `ReplyTo` and `FaultTo` elements, followed by the custom headers. The
    /// body document is copied under `Body`.
    pub fn envelope(&self) -> Document {
        let h = &self.headers;
        let mut builder = DocumentBuilder::new().start("Envelope", &[]).start("Header", &[]);
        if let Some(action) = &h.action {
            builder = builder.leaf("Action", action);
        }
        if let Some(to) = &h.to {
            builder = builder.leaf("To", to);
        }
        if let Some(id) = h.message_id {
            builder = builder.leaf("MessageID", &id.to_string());
        }
        if let Some(id) = h.relates_to {
            builder = builder.leaf("RelatesTo", &id.to_string());
        }
        if let Some(reply_to) = &h.reply_to {
            builder = builder.leaf("ReplyTo", reply_to.as_str());
        }
        if let Some(fault_to) = &h.fault_to {
            builder = builder.leaf("FaultTo", fault_to.as_str());
        }
        for (name, value) in &h.custom {
            builder = builder.leaf(name, value);
        }
        builder
            .end()
            .start("Body", &[])
            .copy_subtree(&self.body, self.body.root())
            .end()
            .end()
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FaultCode;

    #[test]
    fn request_gets_unique_ids() {
        let a = Message::request("urn:a");
        let b = Message::request("urn:a");
        assert_ne!(a.message_id(), b.message_id());
        assert_eq!(a.headers().reply_to, Some(EndpointAddress::Anonymous));
    }

    #[test]
    fn envelope_exposes_headers_and_body() {
        let message = Message::new("urn:orders/submit")
            .with_to("urn:orders")
            .with_header("Priority", "high")
            .with_body(DocumentBuilder::new().leaf("order", "42").finish());
        let doc = message.envelope();
        let envelope = doc.document_element().unwrap();
        let header = doc.child_element(envelope, "Header").unwrap();
        let action = doc.child_element(header, "Action").unwrap();
        assert_eq!(doc.string_value(action), "urn:orders/submit");
        let priority = doc.child_element(header, "Priority").unwrap();
        assert_eq!(doc.string_value(priority), "high");
        let body = doc.child_element(envelope, "Body").unwrap();
        assert_eq!(doc.string_value(body), "42");
    }

    #[test]
    fn fault_messages_carry_the_fault() {
        let message = Message::from_fault(Fault::new(FaultCode::AccessDenied, "denied"));
        assert!(message.is_fault());
        assert_eq!(message.action(), Some(FAULT_ACTION));
        assert_eq!(message.fault().unwrap().code, FaultCode::AccessDenied);
    }
}
