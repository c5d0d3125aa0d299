//! Picking the operation a message is meant for.

use std::collections::HashMap;
use std::sync::Arc;

use switchyard_core::{DispatchError, Fault, Message};
use switchyard_filter::{FilterError, FilterTable};

use crate::Operation;

/// Maps a request to one of an endpoint's operations.
///
/// `Ok(None)` means no operation claims the message; the pipeline answers
/// with a contract-mismatch fault.
pub trait OperationDemuxer: Send + Sync {
    fn select(&self, message: &Message) -> Result<Option<Arc<Operation>>, DispatchError>;
}

/// Dispatch on the action header.
#[derive(Debug, Default)]
pub struct ActionDemuxer {
    by_action: HashMap<String, Arc<Operation>>,
    unhandled: Option<Arc<Operation>>,
}

impl ActionDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation under its action. Operations without an action
    /// can only be installed with [`Self::with_unhandled`].
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.add(operation);
        self
    }

    pub fn add(&mut self, operation: Operation) {
        let Some(action) = operation.action().map(str::to_owned) else {
            tracing::warn!(operation = operation.name(), "operation has no action; not routable");
            return;
        };
        if let Some(previous) = self.by_action.insert(action.clone(), Arc::new(operation)) {
            tracing::warn!(%action, replaced = previous.name(), "action registered twice");
        }
    }

    /// Operation receiving every message whose action is not registered.
    pub fn with_unhandled(mut self, operation: Operation) -> Self {
        self.unhandled = Some(Arc::new(operation));
        self
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.by_action.keys().map(String::as_str)
    }
}

impl OperationDemuxer for ActionDemuxer {
    fn select(&self, message: &Message) -> Result<Option<Arc<Operation>>, DispatchError> {
        let found = message
            .action()
            .and_then(|action| self.by_action.get(action))
            .or(self.unhandled.as_ref());
        Ok(found.cloned())
    }
}

type Selector = Box<dyn Fn(&Message) -> Option<String> + Send + Sync>;

/// Dispatch on an operation name computed by a user-supplied selector.
pub struct SelectorDemuxer {
    by_name: HashMap<String, Arc<Operation>>,
    selector: Selector,
}

impl SelectorDemuxer {
    pub fn new(selector: impl Fn(&Message) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            by_name: HashMap::new(),
            selector: Box::new(selector),
        }
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.by_name
            .insert(operation.name().to_owned(), Arc::new(operation));
        self
    }
}

impl OperationDemuxer for SelectorDemuxer {
    fn select(&self, message: &Message) -> Result<Option<Arc<Operation>>, DispatchError> {
        let Some(name) = (self.selector)(message) else {
            return Ok(None);
        };
        match self.by_name.get(&name) {
            Some(operation) => Ok(Some(operation.clone())),
            None => {
                tracing::warn!(operation = %name, "selector named an unknown operation");
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for SelectorDemuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorDemuxer")
            .field("operations", &self.by_name.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Dispatch on message content: each operation is guarded by a query over
/// the message envelope, and all queries run as one merged program.
#[derive(Default)]
pub struct FilterDemuxer {
    table: FilterTable<Arc<Operation>>,
}

impl FilterDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            table: FilterTable::with_quota(quota),
        }
    }

    pub fn add(&mut self, query: &str, operation: Operation) -> Result<(), FilterError> {
        self.table.add(query, Arc::new(operation))?;
        Ok(())
    }

    pub fn with_operation(mut self, query: &str, operation: Operation) -> Result<Self, FilterError> {
        self.add(query, operation)?;
        Ok(self)
    }
}

impl OperationDemuxer for FilterDemuxer {
    fn select(&self, message: &Message) -> Result<Option<Arc<Operation>>, DispatchError> {
        match self.table.get_match(&message.envelope()) {
            Ok(found) => Ok(found.cloned()),
            Err(e) => {
                tracing::warn!(error = %e, action = ?message.action(), "operation filter failed");
                Err(Fault::from(e).into())
            }
        }
    }
}
