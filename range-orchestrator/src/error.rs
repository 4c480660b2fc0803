//! Run-level errors
//!
//! Only shared-setup failures abort a run. Anything local to one instance
//! is recorded in the run report instead of being returned here.

use crate::access::AccessError;
use crate::compute::ComputeError;
use crate::models::InstanceId;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("no capacity: no host meets the placement thresholds")]
    NoCapacity,

    #[error("template {template_id} not found on host {host}")]
    TemplateNotFound { host: String, template_id: InstanceId },

    #[error("cannot allocate instance ids: listing host {host} failed: {source}")]
    IdentityAllocation {
        host: String,
        #[source]
        source: ComputeError,
    },

    #[error("access service authentication failed: {0}")]
    Authentication(#[source] AccessError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("another run holds the lock (pid {pid}, since {since})")]
    ConcurrentRun { pid: u32, since: String },

    #[error("cannot use run lock {path}: {source}")]
    Lock {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("compute fleet error on {entity}: {source}")]
    Compute {
        entity: String,
        #[source]
        source: ComputeError,
    },

    #[error("access service error: {0}")]
    Access(#[from] AccessError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_entity() {
        let err = OrchestratorError::TemplateNotFound {
            host: "proxmox09".into(),
            template_id: 103,
        };
        assert_eq!(err.to_string(), "template 103 not found on host proxmox09");

        let err = OrchestratorError::IdentityAllocation {
            host: "proxmox03".into(),
            source: ComputeError::Api { status: 500, detail: "boom".into() },
        };
        assert!(err.to_string().contains("proxmox03"));
        assert!(err.to_string().contains("boom"));
    }
}
