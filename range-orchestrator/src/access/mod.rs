//! Access service collaborator
//!
//! Users, remote-access connections and the permission edges between them.
//! Every call after the token exchange carries the run's `AuthToken`.

mod guacamole;

pub use guacamole::GuacamoleClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors returned by the access service
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("access service authentication failed: {0}")]
    Auth(String),
    #[error("access service returned {status}: {detail}")]
    Api { status: u16, detail: String },
    #[error("access service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected access service response: {0}")]
    Decode(String),
}

impl AccessError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Short-lived session token obtained once per run.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

/// Capability granted on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Permission {
    Read,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "READ",
        }
    }
}

/// A remote-access connection as listed by the access service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessConnection {
    pub identifier: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessUser {
    pub username: String,
}

/// Everything needed to create a connection to one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSpec {
    pub name: String,
    pub protocol: String,
    pub port: u16,
    /// Empty when the instance address is unknown.
    pub hostname: String,
    pub username: String,
    pub password: String,
}

/// Operations consumed from the access service.
#[async_trait]
pub trait AccessApi: Send + Sync {
    /// Credential exchange; the token is valid for the rest of the run.
    async fn authenticate(&self) -> Result<AuthToken, AccessError>;

    async fn list_connections(&self, token: &AuthToken) -> Result<Vec<AccessConnection>, AccessError>;

    /// Returns the identifier assigned to the new connection.
    async fn create_connection(&self, token: &AuthToken, spec: &ConnectionSpec) -> Result<String, AccessError>;

    async fn delete_connection(&self, token: &AuthToken, identifier: &str) -> Result<(), AccessError>;

    /// `None` when no user has this name.
    async fn get_user(&self, token: &AuthToken, username: &str) -> Result<Option<AccessUser>, AccessError>;

    async fn create_user(&self, token: &AuthToken, username: &str, password: &str) -> Result<(), AccessError>;

    async fn delete_user(&self, token: &AuthToken, username: &str) -> Result<(), AccessError>;

    /// Add a permission edge; adding an existing edge succeeds.
    async fn grant_connection(
        &self,
        token: &AuthToken,
        username: &str,
        connection_id: &str,
        permission: Permission,
    ) -> Result<(), AccessError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_debug_is_redacted() {
        let token = AuthToken::new("C0FFEE");
        assert_eq!(format!("{:?}", token), "AuthToken(***)");
        assert_eq!(token.as_str(), "C0FFEE");
    }

    #[test]
    fn test_permission_wire_name() {
        assert_eq!(Permission::Read.as_str(), "READ");
        assert_eq!(serde_json::to_string(&Permission::Read).unwrap(), "\"READ\"");
    }
}
