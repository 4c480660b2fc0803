//! Compute fleet collaborator
//!
//! The orchestrator only needs a handful of fleet operations:
//! - Host utilization (CPU busy fraction, free memory, free disk)
//! - Instance listing, configuration and runtime status
//! - Clone / start / stop / delete of instances
//!
//! `ComputeApi` is the seam; `ProxmoxClient` is the HTTP implementation.

mod proxmox;

pub use proxmox::ProxmoxClient;

use async_trait::async_trait;

use crate::models::{InstanceConfig, InstanceId, InstanceStatus, InstanceSummary, ResourceSnapshot};

/// Errors returned by the compute fleet
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("compute API returned {status}: {detail}")]
    Api { status: u16, detail: String },
    #[error("compute API authentication failed: {0}")]
    Auth(String),
    #[error("compute API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected compute API response: {0}")]
    Decode(String),
}

impl ComputeError {
    /// True when the error text carries `signature` (e.g. the fleet's "is locked" message).
    pub fn matches(&self, signature: &str) -> bool {
        !signature.is_empty() && self.to_string().contains(signature)
    }

    /// Absent resources: explicit 404s, and the fleet's "does not exist" errors.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Api { detail, .. } => detail.contains("does not exist"),
            _ => false,
        }
    }
}

/// Parameters of a clone request
#[derive(Debug, Clone, PartialEq)]
pub struct CloneRequest {
    pub new_id: InstanceId,
    pub hostname: String,
    /// Full copy instead of a linked clone.
    pub full: bool,
    /// Host that receives the clone.
    pub target: String,
    pub description: String,
}

/// Operations consumed from the compute fleet.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn node_status(&self, node: &str) -> Result<ResourceSnapshot, ComputeError>;

    async fn list_instances(&self, node: &str) -> Result<Vec<InstanceSummary>, ComputeError>;

    async fn instance_config(&self, node: &str, id: InstanceId) -> Result<InstanceConfig, ComputeError>;

    async fn set_protection(&self, node: &str, id: InstanceId, enabled: bool) -> Result<(), ComputeError>;

    /// Clone `template_id` according to `request`.
    async fn clone_instance(
        &self,
        node: &str,
        template_id: InstanceId,
        request: &CloneRequest,
    ) -> Result<(), ComputeError>;

    async fn start_instance(&self, node: &str, id: InstanceId) -> Result<(), ComputeError>;

    async fn stop_instance(&self, node: &str, id: InstanceId) -> Result<(), ComputeError>;

    async fn instance_status(&self, node: &str, id: InstanceId) -> Result<InstanceStatus, ComputeError>;

    /// Delete an instance (forced, purging its references).
    async fn delete_instance(&self, node: &str, id: InstanceId) -> Result<(), ComputeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_signature_matching() {
        let err = ComputeError::Api {
            status: 500,
            detail: "CT is locked (disk)".into(),
        };
        assert!(err.matches("is locked"));
        assert!(!err.matches("timeout"));
        assert!(!err.matches(""));
    }

    #[test]
    fn test_not_found_detection() {
        assert!(ComputeError::NotFound { what: "lxc/2001".into() }.is_not_found());
        let missing = ComputeError::Api {
            status: 500,
            detail: "Configuration file 'nodes/pve1/lxc/2001.conf' does not exist".into(),
        };
        assert!(missing.is_not_found());
        let other = ComputeError::Api { status: 500, detail: "boom".into() };
        assert!(!other.is_not_found());
    }
}
