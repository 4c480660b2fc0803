//! Access reconciliation
//!
//! Keeps the access service in line with the instances of a run. Every
//! operation is keyed by name and safe to repeat: creation only happens when
//! the resource is missing, deletion of a missing resource counts as done.

use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::access::{AccessApi, AccessConnection, AccessError, AuthToken, ConnectionSpec, Permission};
use crate::config::ConnectionTemplate;
use crate::models::{FailureStage, InstanceFailure, ProvisionedAccount};

/// What a revoke pass did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RevokeReport {
    pub connections_deleted: Vec<String>,
    pub users_deleted: Vec<String>,
    /// `connection <name>` / `user <name>` entries that were already gone.
    pub already_absent: Vec<String>,
    pub failures: Vec<InstanceFailure>,
}

pub struct AccessReconciler {
    api: Arc<dyn AccessApi>,
    token: AuthToken,
    template: ConnectionTemplate,
}

impl AccessReconciler {
    /// Exchange credentials once; the token serves the whole run.
    pub async fn connect(api: Arc<dyn AccessApi>, template: ConnectionTemplate) -> Result<Self, AccessError> {
        let token = api.authenticate().await?;
        Ok(Self { api, token, template })
    }

    async fn find_connection(&self, name: &str) -> Result<Option<AccessConnection>, AccessError> {
        let connections = self.api.list_connections(&self.token).await?;
        Ok(connections.into_iter().find(|c| c.name == name))
    }

    /// Identifier of the connection called `name`, created if missing.
    pub async fn ensure_connection(&self, name: &str, ip: Option<Ipv4Addr>) -> Result<String, AccessError> {
        if let Some(existing) = self.find_connection(name).await? {
            info!("Connection {} already exists", name);
            return Ok(existing.identifier);
        }

        let spec = ConnectionSpec {
            name: name.to_string(),
            protocol: self.template.protocol.clone(),
            port: self.template.port,
            hostname: ip.map(|ip| ip.to_string()).unwrap_or_default(),
            username: self.template.username.clone(),
            password: self.template.password.clone(),
        };
        let identifier = self.api.create_connection(&self.token, &spec).await?;
        info!("Connection {} created (id {})", name, identifier);
        Ok(identifier)
    }

    pub async fn ensure_user(&self, name: &str, secret: &str) -> Result<(), AccessError> {
        if self.api.get_user(&self.token, name).await?.is_some() {
            info!("User {} already exists", name);
            return Ok(());
        }
        self.api.create_user(&self.token, name, secret).await?;
        info!("User {} created", name);
        Ok(())
    }

    pub async fn grant(&self, name: &str, connection_id: &str) -> Result<(), AccessError> {
        self.api
            .grant_connection(&self.token, name, connection_id, Permission::Read)
            .await?;
        info!("User {} granted {} on connection {}", name, Permission::Read.as_str(), connection_id);
        Ok(())
    }

    /// Connection, user and grant for one instance.
    pub async fn reconcile_account(
        &self,
        hostname: &str,
        secret: &str,
        ip: Option<Ipv4Addr>,
    ) -> Result<ProvisionedAccount, AccessError> {
        let connection_id = self.ensure_connection(hostname, ip).await?;
        self.ensure_user(hostname, secret).await?;
        self.grant(hostname, &connection_id).await?;

        Ok(ProvisionedAccount {
            username: hostname.to_string(),
            password: secret.to_string(),
            connection_name: hostname.to_string(),
            ip,
        })
    }

    /// Delete the connection and the user of every name tied to a tenant.
    ///
    /// Names are the connections whose name contains `tenant_prefix`, plus
    /// `known_names` (hostnames of deleted instances). Failing to list the
    /// connections is an error; anything failing for one name is reported.
    ///
    /// The match is a substring match, unlike compute deletion which matches
    /// the tenant exactly: revoking `acme` also revokes `acmecorp-*`.
    pub async fn revoke_all(&self, tenant_prefix: &str, known_names: &[String]) -> Result<RevokeReport, AccessError> {
        let mut names: Vec<String> = if tenant_prefix.is_empty() {
            Vec::new()
        } else {
            self.api
                .list_connections(&self.token)
                .await?
                .into_iter()
                .filter(|c| c.name.contains(tenant_prefix))
                .map(|c| c.name)
                .collect()
        };
        for name in known_names {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        debug!("Revoking access for {} name(s) of tenant {}", names.len(), tenant_prefix);

        let mut report = RevokeReport::default();
        for name in &names {
            self.revoke_connection(name, &mut report).await;
            self.revoke_user(name, &mut report).await;
        }
        Ok(report)
    }

    async fn revoke_connection(&self, name: &str, report: &mut RevokeReport) {
        let deleted = match self.find_connection(name).await {
            Ok(Some(conn)) => self.api.delete_connection(&self.token, &conn.identifier).await,
            Ok(None) => Err(AccessError::NotFound {
                what: format!("connection {name}"),
            }),
            Err(e) => Err(e),
        };

        match deleted {
            Ok(()) => {
                info!("Connection {} deleted", name);
                report.connections_deleted.push(name.to_string());
            }
            Err(e) if e.is_not_found() => {
                info!("Connection {} already deleted", name);
                report.already_absent.push(format!("connection {name}"));
            }
            Err(e) => {
                warn!("Failed to delete connection {}: {}", name, e);
                report
                    .failures
                    .push(InstanceFailure::new(format!("connection {name}"), None, FailureStage::Access, e.to_string()));
            }
        }
    }

    async fn revoke_user(&self, name: &str, report: &mut RevokeReport) {
        let deleted = match self.api.get_user(&self.token, name).await {
            Ok(Some(_)) => self.api.delete_user(&self.token, name).await,
            Ok(None) => Err(AccessError::NotFound {
                what: format!("user {name}"),
            }),
            Err(e) => Err(e),
        };

        match deleted {
            Ok(()) => {
                info!("User {} deleted", name);
                report.users_deleted.push(name.to_string());
            }
            Err(e) if e.is_not_found() => {
                info!("User {} already deleted", name);
                report.already_absent.push(format!("user {name}"));
            }
            Err(e) => {
                warn!("Failed to delete user {}: {}", name, e);
                report
                    .failures
                    .push(InstanceFailure::new(format!("user {name}"), None, FailureStage::Access, e.to_string()));
            }
        }
    }
}
