//! Authentication and authorization.

use std::collections::HashSet;

use switchyard_core::{Fault, FaultCode, Message};

use crate::Operation;

/// Establishes who sent a request. A fault refuses the request.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, message: &Message) -> Result<(), Fault>;
}

impl<F> Authenticator for F
where
    F: Fn(&Message) -> Result<(), Fault> + Send + Sync,
{
    fn authenticate(&self, message: &Message) -> Result<(), Fault> {
        self(message)
    }
}

/// Decides whether an authenticated request may call an operation.
pub trait AuthorizationManager: Send + Sync {
    fn check_access(&self, message: &Message, operation: &Operation) -> bool;
}

/// Requires a header whose value is one of a set of accepted tokens.
#[derive(Debug, Clone)]
pub struct HeaderAuthenticator {
    header: String,
    accepted: HashSet<String>,
}

impl HeaderAuthenticator {
    pub fn new<I, S>(header: impl Into<String>, accepted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            header: header.into(),
            accepted: accepted.into_iter().map(Into::into).collect(),
        }
    }
}

impl Authenticator for HeaderAuthenticator {
    fn authenticate(&self, message: &Message) -> Result<(), Fault> {
        match message.header(&self.header) {
            Some(token) if self.accepted.contains(token) => Ok(()),
            Some(_) => Err(Fault::new(
                FaultCode::AccessDenied,
                format!("credential in '{}' was not accepted", self.header),
            )),
            None => Err(Fault::new(
                FaultCode::AccessDenied,
                format!("missing credential header '{}'", self.header),
            )),
        }
    }
}

/// Grants each operation to callers presenting one of its roles in a header.
#[derive(Debug, Clone, Default)]
pub struct RoleAuthorization {
    header: String,
    grants: Vec<(String, String)>,
}

impl RoleAuthorization {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            grants: Vec::new(),
        }
    }

    pub fn grant(mut self, operation: impl Into<String>, role: impl Into<String>) -> Self {
        self.grants.push((operation.into(), role.into()));
        self
    }
}

impl AuthorizationManager for RoleAuthorization {
    fn check_access(&self, message: &Message, operation: &Operation) -> bool {
        let Some(roles) = message.header(&self.header) else {
            return false;
        };
        self.grants.iter().any(|(name, role)| {
            name == operation.name() && roles.split(',').any(|r| r.trim() == role)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_authenticator_checks_the_token() {
        let auth = HeaderAuthenticator::new("token", ["s3cret"]);
        let ok = Message::new("urn:a").with_header("token", "s3cret");
        assert!(auth.authenticate(&ok).is_ok());
        let bad = Message::new("urn:a").with_header("token", "guess");
        assert_eq!(
            auth.authenticate(&bad).unwrap_err().code,
            FaultCode::AccessDenied
        );
        assert!(auth.authenticate(&Message::new("urn:a")).is_err());
    }

    #[test]
    fn roles_are_granted_per_operation() {
        let authz = RoleAuthorization::new("roles").grant("Refund", "admin");
        let refund = Operation::sync("Refund", "urn:refund", |_| Ok(None));
        let status = Operation::sync("Status", "urn:status", |_| Ok(None));
        let admin = Message::new("urn:refund").with_header("roles", "user, admin");
        let user = Message::new("urn:refund").with_header("roles", "user");
        assert!(authz.check_access(&admin, &refund));
        assert!(!authz.check_access(&user, &refund));
        assert!(!authz.check_access(&admin, &status));
    }
}
