use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Numeric identity of a compute instance (vmid).
pub type InstanceId = u32;

/// Placeholder written wherever an instance address could not be discovered.
pub const NO_IP_SENTINEL: &str = "No IP Address found";

/// A compute host of the pool, loaded from configuration at the start of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub address: String,
    pub template_id: InstanceId,
    /// Cleared for the rest of the run when a status probe fails.
    pub available: bool,
}

/// Live utilization of one host, read fresh for every provisioning run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// CPU busy fraction in [0, 1].
    pub cpu_busy: f64,
    pub free_memory: u64,
    pub total_memory: u64,
    pub free_disk: u64,
    pub total_disk: u64,
}

impl ResourceSnapshot {
    /// CPU reading as used for placement: busy fraction rounded to one decimal.
    pub fn cpu_reading(&self) -> f64 {
        (self.cpu_busy * 10.0).round() / 10.0
    }
}

/// Runtime state reported by the compute fleet for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Stopped,
    #[serde(other)]
    Unknown,
}

/// One entry of a host's instance listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub name: String,
    pub template: bool,
    pub state: RunState,
}

/// Instance configuration fields the orchestrator reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub hostname: Option<String>,
    pub protection: bool,
}

/// Current runtime status of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub state: RunState,
    /// Set while the fleet holds a lock on the instance (clone, disk, backup...).
    pub lock: Option<String>,
}

/// Lifecycle of an instance inside one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Cloning,
    LockedRetry { attempt: u32 },
    StartPending,
    Started,
    Failed { reason: String },
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cloning => write!(f, "cloning"),
            Self::LockedRetry { attempt } => write!(f, "locked (attempt {attempt})"),
            Self::StartPending => write!(f, "start pending"),
            Self::Started => write!(f, "started"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// A tenant instance produced by a create run.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub hostname: String,
    pub host: String,
    pub state: InstanceState,
    pub ip: Option<Ipv4Addr>,
}

impl Instance {
    pub fn new(id: InstanceId, hostname: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id,
            hostname: hostname.into(),
            host: host.into(),
            state: InstanceState::Cloning,
            ip: None,
        }
    }
}

/// Credentials handed to the tenant for one provisioned instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedAccount {
    pub username: String,
    pub password: String,
    pub connection_name: String,
    pub ip: Option<Ipv4Addr>,
}

impl ProvisionedAccount {
    /// Address as written to the manifest.
    pub fn ip_display(&self) -> String {
        self.ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| NO_IP_SENTINEL.to_string())
    }
}

/// Pipeline stage where a per-instance failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Clone,
    Start,
    Access,
    Manifest,
    Stop,
    Delete,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Clone => "clone",
            Self::Start => "start",
            Self::Access => "access",
            Self::Manifest => "manifest",
            Self::Stop => "stop",
            Self::Delete => "delete",
        };
        f.write_str(label)
    }
}

/// A failure local to one entity; never aborts the batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceFailure {
    pub entity: String,
    pub id: Option<InstanceId>,
    pub stage: FailureStage,
    pub detail: String,
}

impl InstanceFailure {
    pub fn new(
        entity: impl Into<String>,
        id: Option<InstanceId>,
        stage: FailureStage,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            id,
            stage,
            detail: detail.into(),
        }
    }
}

/// Tenant name encoded in an instance name: text before the first `-`,
/// with anything non-alphanumeric replaced by `-`.
pub fn tenant_of(instance_name: &str) -> String {
    instance_name
        .split('-')
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}
