//! Connection identity.
//!
//! An identity is resolved once, when the connection opens, and never
//! changes afterwards. Applications supply an [`IdentityResolver`] that maps
//! the upgrade [`Handshake`] to named claims such as `user`.

use crate::connection::Connection;
use async_trait::async_trait;
use cable_protocol::Handshake;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Prefix of the per-identity control topic.
pub const INTERNAL_TOPIC_PREFIX: &str = "internal/";

/// Identification errors.
#[derive(Debug, Error)]
pub enum IdentificationError {
    /// The resolver refused the handshake.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// An identity is required but none was resolved.
    #[error("No identity resolved")]
    Missing,
}

/// Immutable, name-ordered identity claims.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identity {
    claims: BTreeMap<String, Value>,
}

impl Identity {
    /// Create an empty identity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a claim.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.claims.insert(name.into(), value.into());
        self
    }

    /// Get a claim.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    /// Get a string claim.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Check if there are no claims.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Iterate over claims in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.claims.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Stable string form of the identity: claim values in name order,
    /// joined with `:`.
    ///
    /// Returns `None` for an empty identity.
    #[must_use]
    pub fn connection_identifier(&self) -> Option<String> {
        if self.claims.is_empty() {
            return None;
        }

        let parts: Vec<String> = self
            .claims
            .values()
            .map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        Some(parts.join(":"))
    }
}

/// Control topic that every connection with `identifier` listens on.
#[must_use]
pub fn internal_topic(identifier: &str) -> String {
    format!("{INTERNAL_TOPIC_PREFIX}{identifier}")
}

/// Resolves the identity of a connecting client.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Derive identity claims from the handshake, or refuse the connection.
    async fn resolve(&self, handshake: &Handshake) -> Result<Identity, IdentificationError>;
}

#[async_trait]
impl<F> IdentityResolver for F
where
    F: Fn(&Handshake) -> Result<Identity, IdentificationError> + Send + Sync,
{
    async fn resolve(&self, handshake: &Handshake) -> Result<Identity, IdentificationError> {
        self(handshake)
    }
}

/// Resolver that accepts everyone with an empty identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

#[async_trait]
impl IdentityResolver for Anonymous {
    async fn resolve(&self, _handshake: &Handshake) -> Result<Identity, IdentificationError> {
        Ok(Identity::new())
    }
}

/// Application callbacks around the connection lifecycle.
#[async_trait]
pub trait ConnectionHooks: Send + Sync {
    /// Called once the connection is registered and welcomed.
    async fn connected(&self, _connection: &Connection) {}

    /// Called once the connection has been torn down.
    async fn disconnected(&self, _connection: &Connection) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl ConnectionHooks for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connection_identifier() {
        assert_eq!(Identity::new().connection_identifier(), None);

        let identity = Identity::new().with("user", "ada").with("account", 7);
        assert_eq!(identity.connection_identifier().as_deref(), Some("7:ada"));
        assert_eq!(identity.get_str("user"), Some("ada"));
        assert_eq!(identity.get("account"), Some(&json!(7)));
    }

    #[test]
    fn test_internal_topic() {
        assert_eq!(internal_topic("ada"), "internal/ada");
    }

    #[tokio::test]
    async fn test_closure_resolver() {
        let resolver = |handshake: &Handshake| match handshake.query_param("user") {
            Some(user) => Ok(Identity::new().with("user", user)),
            None => Err(IdentificationError::Unauthorized("no user".into())),
        };

        let identity = resolver
            .resolve(&Handshake::new("/cable?user=ada"))
            .await
            .unwrap();
        assert_eq!(identity.get_str("user"), Some("ada"));

        assert!(resolver.resolve(&Handshake::new("/cable")).await.is_err());
        assert!(Anonymous
            .resolve(&Handshake::new("/cable"))
            .await
            .unwrap()
            .is_empty());
    }
}
