//! Run configuration
//!
//! Loaded once at startup from YAML (path in `RANGE_MANAGER_CONFIG`, default
//! `range.yaml`) and handed to the orchestrator by value. Secrets can come
//! from the environment (or a `.env` file) instead of the YAML file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::models::{Host, InstanceId};
use crate::poll::PollPolicy;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeConfig {
    pub compute: ComputeConfig,
    pub ssh: SshConfig,
    pub access: AccessConfig,
    pub hosts: Vec<HostConf>,
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    pub connection: ConnectionTemplate,
    #[serde(default)]
    pub manifest: ManifestConfig,
    #[serde(default)]
    pub run_lock: RunLockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeConfig {
    pub base_url: String, // ex: "https://pve09:8006"
    #[serde(default = "default_compute_user")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Fleet hosts use self-signed certificates.
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    pub base_url: String, // ex: "http://guacamole:8080/api"
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_data_source")]
    pub data_source: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConf {
    pub name: String,
    pub address: String,
    pub template_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    pub weights: ResourceWeights,
    pub min_required: MinRequired,
    pub min_free_fraction: MinFreeFraction,
    pub max_cpu_busy: f64,
    pub fraction_basis: FractionBasis,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceWeights {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MinRequired {
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MinFreeFraction {
    pub memory: f64,
    pub disk: f64,
}

/// What the free-fraction threshold is measured against.
///
/// `Free` compares a free amount with a fraction of itself, which always
/// holds for non-negative readings. It stays the default until the intended
/// comparison is confirmed; `Total` measures against total capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FractionBasis {
    #[default]
    Free,
    Total,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Instance ids at or above this value belong to tenants.
    pub id_floor: InstanceId,
    pub max_accounts: u32,
    pub max_clone_attempts: u32,
    pub clone_retry_delay_ms: u64,
    /// Error text the fleet returns while the template disk is locked.
    pub lock_signature: String,
    /// Wait for a cloned instance to become startable.
    pub readiness: PollPolicy,
    /// Wait for a stopped instance before deleting it.
    pub shutdown: PollPolicy,
    pub linked_clone: bool,
    pub account_secret_suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Only addresses starting with one of these prefixes are reported.
    pub address_prefixes: Vec<String>,
    pub poll: PollPolicy,
}

/// Parameters of the access connections created for new instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionTemplate {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_rdp_port")]
    pub port: u16,
    #[serde(default = "default_connection_user")]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunLockConfig {
    pub path: PathBuf,
    pub stale_after_secs: u64,
}

fn default_true() -> bool { true }
fn default_compute_user() -> String { "root@pam".into() }
fn default_request_timeout() -> u64 { 30 }
fn default_ssh_port() -> u16 { 22 }
fn default_ssh_timeout() -> u64 { 5 }
fn default_data_source() -> String { "mysql".into() }
fn default_protocol() -> String { "rdp".into() }
fn default_rdp_port() -> u16 { 3389 }
fn default_connection_user() -> String { "root".into() }

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            // CPU first, disk last
            weights: ResourceWeights { cpu: 2.0, memory: 1.0, disk: 0.5 },
            min_required: MinRequired {
                memory_bytes: 2048 * MIB,
                disk_bytes: 20 * GIB,
            },
            min_free_fraction: MinFreeFraction { memory: 0.1, disk: 0.05 },
            max_cpu_busy: 0.9,
            fraction_basis: FractionBasis::Free,
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            id_floor: 2000,
            max_accounts: 50,
            max_clone_attempts: 5,
            clone_retry_delay_ms: 5000,
            lock_signature: "is locked".into(),
            readiness: PollPolicy::new(2000, 120_000),
            shutdown: PollPolicy::new(2000, 60_000),
            linked_clone: true,
            account_secret_suffix: String::new(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            address_prefixes: vec!["147.".into(), "192.".into()],
            poll: PollPolicy::new(3000, 60_000),
        }
    }
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self { output_dir: PathBuf::from("output") }
    }
}

impl Default for RunLockConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("range-manager.lock"),
            stale_after_secs: 6 * 3600,
        }
    }
}

impl ProvisioningConfig {
    pub fn clone_retry_delay(&self) -> Duration {
        Duration::from_millis(self.clone_retry_delay_ms)
    }
}

impl ComputeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl AccessConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl RangeConfig {
    pub fn from_yaml_str(txt: &str) -> Result<Self, ConfigError> {
        let cfg: RangeConfig = serde_yaml::from_str(txt)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Fresh host pool for one run; every host starts available.
    pub fn host_pool(&self) -> Vec<Host> {
        self.hosts
            .iter()
            .map(|h| Host {
                name: h.name.clone(),
                address: h.address.clone(),
                template_id: h.template_id,
                available: true,
            })
            .collect()
    }

    /// Secrets from the environment take precedence over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RANGE_COMPUTE_PASSWORD") { self.compute.password = v; }
        if let Ok(v) = std::env::var("RANGE_ACCESS_PASSWORD") { self.access.password = v; }
        if let Ok(v) = std::env::var("RANGE_SSH_PASSWORD") { self.ssh.password = v; }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::Invalid("at least one host is required".into()));
        }
        if self.compute.base_url.trim().is_empty() || self.access.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("compute and access base_url are required".into()));
        }
        let w = self.placement.weights;
        let f = self.placement.min_free_fraction;
        if [w.cpu, w.memory, w.disk, f.memory, f.disk].iter().any(|v| *v < 0.0) {
            return Err(ConfigError::Invalid("weights and fractions must be non-negative".into()));
        }
        if self.provisioning.max_clone_attempts == 0 {
            return Err(ConfigError::Invalid("max_clone_attempts must be at least 1".into()));
        }
        if self.provisioning.max_accounts == 0 {
            return Err(ConfigError::Invalid("max_accounts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Load the configuration named by `RANGE_MANAGER_CONFIG` (default `range.yaml`).
pub async fn load_config() -> Result<RangeConfig, ConfigError> {
    let path = std::env::var("RANGE_MANAGER_CONFIG").unwrap_or_else(|_| "range.yaml".into());
    load_config_from(Path::new(&path)).await
}

pub async fn load_config_from(path: &Path) -> Result<RangeConfig, ConfigError> {
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg: RangeConfig = serde_yaml::from_str(&txt)?;
    cfg.apply_env_overrides();
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
compute:
  base_url: "https://pve09:8006"
  password: "secret"
ssh:
  username: "root"
access:
  base_url: "http://guac:8080/api"
  username: "guacadmin"
hosts:
  - { name: "proxmox09", address: "147.16.16.57", template_id: 103 }
  - { name: "proxmox03", address: "147.16.16.13", template_id: 123 }
connection:
  username: "root"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = RangeConfig::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(cfg.compute.username, "root@pam");
        assert!(cfg.compute.accept_invalid_certs);
        assert_eq!(cfg.ssh.port, 22);
        assert_eq!(cfg.access.data_source, "mysql");
        assert_eq!(cfg.connection.protocol, "rdp");
        assert_eq!(cfg.connection.port, 3389);
        assert_eq!(cfg.provisioning.id_floor, 2000);
        assert_eq!(cfg.provisioning.max_clone_attempts, 5);
        assert_eq!(cfg.placement.min_required.memory_bytes, 2048 * 1024 * 1024);
        assert_eq!(cfg.placement.fraction_basis, FractionBasis::Free);
        assert_eq!(cfg.discovery.address_prefixes, vec!["147.", "192."]);
    }

    #[test]
    fn test_host_pool_starts_available() {
        let cfg = RangeConfig::from_yaml_str(MINIMAL).unwrap();
        let pool = cfg.host_pool();
        assert_eq!(pool.len(), 2);
        assert!(pool.iter().all(|h| h.available));
        assert_eq!(pool[0].template_id, 103);
    }

    #[test]
    fn test_empty_host_pool_rejected() {
        let txt = MINIMAL
            .lines()
            .filter(|l| !l.trim_start().starts_with("- { name"))
            .map(|l| if l == "hosts:" { "hosts: []" } else { l })
            .collect::<Vec<_>>()
            .join("\n");
        assert!(matches!(RangeConfig::from_yaml_str(&txt), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_fraction_basis_total() {
        let txt = format!("{MINIMAL}placement:\n  fraction_basis: total\n");
        let cfg = RangeConfig::from_yaml_str(&txt).unwrap();
        assert_eq!(cfg.placement.fraction_basis, FractionBasis::Total);
        // other placement fields keep their defaults
        assert_eq!(cfg.placement.max_cpu_busy, 0.9);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let err = load_config_from(Path::new("/nonexistent/range.yaml")).await.unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
