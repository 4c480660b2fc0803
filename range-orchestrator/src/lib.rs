//! Range Manager - tenant sandbox provisioning across a compute host pool
//!
//! One-shot, idempotent batch runs:
//! - Create: place, clone and start N instances for a tenant, discover their
//!   addresses, reconcile their access accounts and write a credential manifest
//! - Delete: stop and delete a tenant's instances, then revoke its access
//!
//! Nothing is persisted between runs; every run rediscovers the state of the
//! compute fleet and of the access service.

pub mod access;
pub mod compute;
pub mod config;
pub mod discovery;
pub mod error;
pub mod lock;
pub mod manifest;
pub mod models;
pub mod orchestrator;
pub mod poll;
pub mod provision;
pub mod reconcile;
pub mod remote;
pub mod scorer;
pub mod wizard;

pub use config::{load_config, RangeConfig};
pub use error::OrchestratorError;
pub use orchestrator::{AccessOutcome, CreateReport, DeleteReport, Orchestrator, TenantSelector};
