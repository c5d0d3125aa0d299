//! Endpoints and the table that routes requests to them.

use std::sync::Arc;

use switchyard_core::Message;
use switchyard_filter::{FilterError, MatchAllFilter, MessageFilter};

use crate::DispatchRuntime;

/// A dispatch runtime guarded by an address filter and a contract filter.
pub struct Endpoint {
    name: String,
    address_filter: Box<dyn MessageFilter>,
    contract_filter: Box<dyn MessageFilter>,
    priority: i32,
    runtime: Arc<DispatchRuntime>,
}

impl Endpoint {
    /// An endpoint accepting every message until filters are set.
    pub fn new(name: impl Into<String>, runtime: Arc<DispatchRuntime>) -> Self {
        Self {
            name: name.into(),
            address_filter: Box::new(MatchAllFilter),
            contract_filter: Box::new(MatchAllFilter),
            priority: 0,
            runtime,
        }
    }

    pub fn with_address_filter(mut self, filter: impl MessageFilter + 'static) -> Self {
        self.address_filter = Box::new(filter);
        self
    }

    pub fn with_contract_filter(mut self, filter: impl MessageFilter + 'static) -> Self {
        self.contract_filter = Box::new(filter);
        self
    }

    /// Higher priorities are tried first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn runtime(&self) -> &Arc<DispatchRuntime> {
        &self.runtime
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Result of routing one message.
#[derive(Debug, Clone)]
pub enum Lookup {
    Matched(Arc<Endpoint>),
    /// No endpoint's address filter accepted the message.
    AddressMismatch,
    /// Some address matched, but none of those endpoints' contracts did.
    ContractMismatch,
    /// Several endpoints matched at the highest matching priority.
    Ambiguous(Vec<String>),
}

/// Endpoints ordered by descending priority; equal priorities keep
/// insertion order.
#[derive(Debug, Default)]
pub struct EndpointTable {
    endpoints: Vec<Arc<Endpoint>>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.add(endpoint);
        self
    }

    pub fn add(&mut self, endpoint: Endpoint) {
        let at = self
            .endpoints
            .partition_point(|e| e.priority >= endpoint.priority);
        self.endpoints.insert(at, Arc::new(endpoint));
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// Route `message`: address filter first, then contract filter, one
    /// priority level at a time.
    pub fn lookup(&self, message: &Message) -> Result<Lookup, FilterError> {
        let mut address_matched = false;
        for group in self.endpoints.chunk_by(|a, b| a.priority == b.priority) {
            let mut matched = Vec::new();
            for endpoint in group {
                if !endpoint.address_filter.matches(message)? {
                    continue;
                }
                address_matched = true;
                if endpoint.contract_filter.matches(message)? {
                    matched.push(endpoint);
                }
            }
            match matched.as_slice() {
                [] => continue,
                [endpoint] => return Ok(Lookup::Matched(Arc::clone(*endpoint))),
                many => {
                    return Ok(Lookup::Ambiguous(
                        many.iter().map(|e| e.name.clone()).collect(),
                    ))
                }
            }
        }
        Ok(if address_matched {
            Lookup::ContractMismatch
        } else {
            Lookup::AddressMismatch
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::Scheduler;
    use switchyard_filter::{ActionFilter, EndpointAddressFilter};

    use crate::ActionDemuxer;

    fn endpoint(name: &str, scheduler: &Scheduler) -> Endpoint {
        Endpoint::new(
            name,
            DispatchRuntime::builder(ActionDemuxer::new(), scheduler.clone()).build(),
        )
    }

    fn name(lookup: Lookup) -> String {
        match lookup {
            Lookup::Matched(endpoint) => endpoint.name().to_owned(),
            other => format!("{other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn address_then_contract() {
        let scheduler = Scheduler::try_current().unwrap();
        let table = EndpointTable::new()
            .with_endpoint(
                endpoint("orders", &scheduler)
                    .with_address_filter(EndpointAddressFilter::new("http://host/orders"))
                    .with_contract_filter(ActionFilter::new(["urn:submit"])),
            )
            .with_endpoint(
                endpoint("billing", &scheduler)
                    .with_address_filter(EndpointAddressFilter::new("http://host/billing"))
                    .with_contract_filter(ActionFilter::new(["urn:pay"])),
            );

        let to = |uri: &str, action: &str| Message::new(action).with_to(uri);
        assert_eq!(
            name(table.lookup(&to("http://host/orders", "urn:submit")).unwrap()),
            "orders"
        );
        assert!(matches!(
            table.lookup(&to("http://host/orders", "urn:pay")).unwrap(),
            Lookup::ContractMismatch
        ));
        assert!(matches!(
            table.lookup(&to("http://host/shipping", "urn:submit")).unwrap(),
            Lookup::AddressMismatch
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn higher_priority_wins_and_ties_are_ambiguous() {
        let scheduler = Scheduler::try_current().unwrap();
        let table = EndpointTable::new()
            .with_endpoint(endpoint("fallback", &scheduler))
            .with_endpoint(
                endpoint("special", &scheduler)
                    .with_contract_filter(ActionFilter::new(["urn:special"]))
                    .with_priority(10),
            );
        assert_eq!(
            name(table.lookup(&Message::new("urn:special")).unwrap()),
            "special"
        );
        assert_eq!(
            name(table.lookup(&Message::new("urn:other")).unwrap()),
            "fallback"
        );

        let table = table.with_endpoint(endpoint("twin", &scheduler));
        match table.lookup(&Message::new("urn:other")).unwrap() {
            Lookup::Ambiguous(names) => assert_eq!(names, ["fallback", "twin"]),
            other => panic!("unexpected {other:?}"),
        }
    }
}
