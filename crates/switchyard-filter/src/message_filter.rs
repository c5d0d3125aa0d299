//! Filters over whole messages.

use std::collections::BTreeSet;

use switchyard_core::Message;

use crate::{FilterError, Query};

/// A predicate over messages, used by endpoint tables and demuxers.
pub trait MessageFilter: Send + Sync {
    fn matches(&self, message: &Message) -> Result<bool, FilterError>;
}

/// Matches messages whose action is one of a fixed set.
#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    actions: BTreeSet<String>,
}

impl ActionFilter {
    pub fn new<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().map(String::as_str)
    }
}

impl MessageFilter for ActionFilter {
    fn matches(&self, message: &Message) -> Result<bool, FilterError> {
        Ok(message
            .action()
            .is_some_and(|action| self.actions.contains(action)))
    }
}

/// Matches messages addressed to an endpoint.
///
/// URIs compare case-insensitively in their scheme and authority and ignore
/// a trailing `/`. With `ignore_host` only the path is compared, for
/// endpoints reachable under several host names.
#[derive(Debug, Clone)]
pub struct EndpointAddressFilter {
    address: String,
    ignore_host: bool,
}

impl EndpointAddressFilter {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ignore_host: false,
        }
    }

    pub fn ignore_host(mut self, ignore_host: bool) -> Self {
        self.ignore_host = ignore_host;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn normalize(&self, uri: &str) -> String {
        let uri = uri.strip_suffix('/').unwrap_or(uri);
        let (authority, path) = split_authority(uri);
        if self.ignore_host {
            path.to_owned()
        } else {
            format!("{}{path}", authority.to_ascii_lowercase())
        }
    }
}

/// Split `scheme://host:port/path` into `scheme://host:port` and `/path`.
/// URIs without `//` (such as `urn:` names) are all authority.
fn split_authority(uri: &str) -> (&str, &str) {
    let Some(start) = uri.find("//") else {
        return (uri, "");
    };
    match uri[start + 2..].find('/') {
        Some(slash) => uri.split_at(start + 2 + slash),
        None => (uri, ""),
    }
}

impl MessageFilter for EndpointAddressFilter {
    fn matches(&self, message: &Message) -> Result<bool, FilterError> {
        Ok(message
            .headers()
            .to
            .as_deref()
            .is_some_and(|to| self.normalize(to) == self.normalize(&self.address)))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAllFilter;

impl MessageFilter for MatchAllFilter {
    fn matches(&self, _message: &Message) -> Result<bool, FilterError> {
        Ok(true)
    }
}

/// Matches messages whose envelope satisfies a query.
#[derive(Debug, Clone)]
pub struct QueryFilter {
    query: Query,
}

impl QueryFilter {
    pub fn new(source: &str) -> Result<Self, FilterError> {
        Ok(Self {
            query: Query::compile(source)?,
        })
    }

    pub fn query(&self) -> &Query {
        &self.query
    }
}

impl From<Query> for QueryFilter {
    fn from(query: Query) -> Self {
        Self { query }
    }
}

impl MessageFilter for QueryFilter {
    fn matches(&self, message: &Message) -> Result<bool, FilterError> {
        self.query.evaluate(&message.envelope())
    }
}
