//! Clone/start state machine
//!
//! Turns one template into a batch of tenant instances on the chosen host:
//! - Locate the template and lift its write protection for the clone phase
//! - Allocate a block of ids above every id in use across the pool
//! - Clone sequentially, retrying while the template disk is locked
//! - Start each clone once the fleet has released its lock
//!
//! Failures of one instance are recorded and never stop the batch.

use futures::future::join_all;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::compute::{CloneRequest, ComputeApi, ComputeError};
use crate::config::ProvisioningConfig;
use crate::error::{OrchestratorError, Result};
use crate::models::{FailureStage, Host, Instance, InstanceFailure, InstanceId, InstanceState, InstanceSummary};
use crate::poll::{poll_until, PollError};

/// Locked retries from this attempt on are logged as warnings.
const NOISY_RETRY_ATTEMPT: u32 = 4;

/// `max(existing ids, floor - 1) + 1`
pub fn next_free_id(existing: impl IntoIterator<Item = InstanceId>, floor: InstanceId) -> InstanceId {
    existing
        .into_iter()
        .fold(floor.saturating_sub(1), InstanceId::max)
        .saturating_add(1)
}

/// Hostname of the `index`-th instance of a tenant.
pub fn instance_hostname(tenant: &str, index: u32) -> String {
    format!("{tenant}-{index}")
}

/// Outcome of a clone/start batch.
#[derive(Debug, Default)]
pub struct CloneBatch {
    /// Instances that cloned and accepted the start command.
    pub started: Vec<Instance>,
    pub failures: Vec<InstanceFailure>,
}

/// Write protection lifted from a template for the duration of a clone phase.
///
/// Call [`ProtectionGuard::restore`]; if the guard is dropped first, the
/// restore is spawned on the current runtime.
pub struct ProtectionGuard {
    compute: Arc<dyn ComputeApi>,
    node: String,
    id: InstanceId,
    armed: bool,
}

impl ProtectionGuard {
    /// Disable protection on `id` if it is set.
    pub async fn lift(compute: Arc<dyn ComputeApi>, node: &str, id: InstanceId) -> std::result::Result<Self, ComputeError> {
        let config = compute.instance_config(node, id).await?;
        if config.protection {
            info!("Protection enabled on template {} of {}, disabling it for cloning", id, node);
            compute.set_protection(node, id, false).await?;
        }

        Ok(Self {
            compute,
            node: node.to_string(),
            id,
            armed: config.protection,
        })
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Re-enable protection if it was lifted.
    pub async fn restore(mut self) -> std::result::Result<(), ComputeError> {
        if !self.armed {
            return Ok(());
        }
        self.armed = false;
        self.compute.set_protection(&self.node, self.id, true).await?;
        info!("Protection re-enabled on template {} of {}", self.id, self.node);
        Ok(())
    }
}

impl Drop for ProtectionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let compute = Arc::clone(&self.compute);
        let node = self.node.clone();
        let id = self.id;
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match compute.set_protection(&node, id, true).await {
                        Ok(()) => info!("Protection re-enabled on template {} of {}", id, node),
                        Err(e) => error!("Failed to re-enable protection on template {} of {}: {}", id, node, e),
                    }
                });
            }
            Err(_) => error!("No runtime to re-enable protection on template {} of {}", id, node),
        }
    }
}

pub struct Provisioner {
    compute: Arc<dyn ComputeApi>,
    cfg: ProvisioningConfig,
}

impl Provisioner {
    pub fn new(compute: Arc<dyn ComputeApi>, cfg: ProvisioningConfig) -> Self {
        Self { compute, cfg }
    }

    /// Base id for a batch; instance `i` of the batch gets `base + i`.
    ///
    /// Every host of the pool is listed concurrently, including hosts whose
    /// status probe failed: their instances still hold ids. A listing failure
    /// makes the pool's id space unknown and aborts the run.
    pub async fn allocate_base_id(&self, hosts: &[Host]) -> Result<InstanceId> {
        let listings = join_all(
            hosts
                .iter()
                .map(|h| async move { (h, self.compute.list_instances(&h.name).await) }),
        )
        .await;

        let mut ids = Vec::new();
        for (host, listing) in listings {
            let instances = listing.map_err(|source| OrchestratorError::IdentityAllocation {
                host: host.name.clone(),
                source,
            })?;
            ids.extend(instances.iter().map(|i| i.id));
        }

        let base = next_free_id(ids, self.cfg.id_floor);
        info!("Next available id is {}", base);
        Ok(base)
    }

    /// The template must be listed on `host` and flagged as a template.
    pub async fn find_template(&self, host: &Host) -> Result<InstanceSummary> {
        let instances = self
            .compute
            .list_instances(&host.name)
            .await
            .map_err(|source| OrchestratorError::Compute {
                entity: format!("host {}", host.name),
                source,
            })?;

        let template = instances
            .into_iter()
            .find(|i| i.template && i.id == host.template_id)
            .ok_or_else(|| OrchestratorError::TemplateNotFound {
                host: host.name.clone(),
                template_id: host.template_id,
            })?;
        info!("Template {} found on {}: {}", template.id, host.name, template.name);
        Ok(template)
    }

    /// Clone `count` instances of `template` on `host` for `tenant` and start them.
    ///
    /// Only protection handling and id allocation abort the batch;
    /// per-instance failures land in `CloneBatch::failures`.
    pub async fn clone_and_start(
        &self,
        host: &Host,
        pool: &[Host],
        template: &InstanceSummary,
        tenant: &str,
        count: u32,
    ) -> Result<CloneBatch> {
        let base = self.allocate_base_id(pool).await?;

        let guard = ProtectionGuard::lift(Arc::clone(&self.compute), &host.name, template.id)
            .await
            .map_err(|source| OrchestratorError::Compute {
                entity: format!("template {}", template.id),
                source,
            })?;

        let mut batch = CloneBatch::default();
        let mut cloned = Vec::new();
        for index in 1..=count {
            let mut instance = Instance::new(base + index, instance_hostname(tenant, index), &host.name);
            let request = CloneRequest {
                new_id: instance.id,
                hostname: instance.hostname.clone(),
                full: !self.cfg.linked_clone,
                target: host.name.clone(),
                description: format!("VM for {tenant} account {index}"),
            };

            match self.clone_with_retry(host, template.id, &mut instance, &request).await {
                Ok(()) => {
                    info!("Instance {} ({}) cloned on {}", instance.hostname, instance.id, host.name);
                    instance.state = InstanceState::StartPending;
                    cloned.push(instance);
                }
                Err(e) => {
                    error!(
                        "Failed to clone instance {} ({}) after {}: {}",
                        instance.hostname, instance.id, instance.state, e
                    );
                    instance.state = InstanceState::Failed { reason: e.to_string() };
                    batch.failures.push(InstanceFailure::new(
                        &instance.hostname,
                        Some(instance.id),
                        FailureStage::Clone,
                        e.to_string(),
                    ));
                }
            }
        }

        if let Err(e) = guard.restore().await {
            error!("Failed to re-enable protection on template {} of {}: {}", template.id, host.name, e);
        }

        for mut instance in cloned {
            match self.start(host, &instance).await {
                Ok(()) => {
                    info!("Instance {} ({}) started", instance.hostname, instance.id);
                    instance.state = InstanceState::Started;
                    batch.started.push(instance);
                }
                Err(detail) => {
                    error!("Failed to start instance {} ({}): {}", instance.hostname, instance.id, detail);
                    instance.state = InstanceState::Failed { reason: detail.clone() };
                    batch.failures.push(InstanceFailure::new(
                        &instance.hostname,
                        Some(instance.id),
                        FailureStage::Start,
                        detail,
                    ));
                }
            }
        }

        Ok(batch)
    }

    /// Clone, retrying with a fixed delay while the error carries the lock
    /// signature, up to `max_clone_attempts` attempts in total.
    async fn clone_with_retry(
        &self,
        host: &Host,
        template_id: InstanceId,
        instance: &mut Instance,
        request: &CloneRequest,
    ) -> std::result::Result<(), ComputeError> {
        let max_attempts = self.cfg.max_clone_attempts.max(1);
        let mut attempt = 1;

        loop {
            instance.state = InstanceState::Cloning;
            match self.compute.clone_instance(&host.name, template_id, request).await {
                Ok(()) => return Ok(()),
                Err(e) if e.matches(&self.cfg.lock_signature) => {
                    instance.state = InstanceState::LockedRetry { attempt };
                    if attempt >= max_attempts {
                        return Err(e);
                    }
                    if attempt >= NOISY_RETRY_ATTEMPT {
                        warn!(
                            "Template {} is locked (attempt {}/{} for {}), retrying",
                            template_id, attempt, max_attempts, instance.hostname
                        );
                    } else {
                        debug!(
                            "Template {} is locked (attempt {}/{} for {}), retrying",
                            template_id, attempt, max_attempts, instance.hostname
                        );
                    }
                    sleep(self.cfg.clone_retry_delay()).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait for the fleet to release the clone lock, then issue the start.
    async fn start(&self, host: &Host, instance: &Instance) -> std::result::Result<(), String> {
        self.wait_until_unlocked(host, instance.id).await.map_err(|e| e.to_string())?;
        self.compute
            .start_instance(&host.name, instance.id)
            .await
            .map_err(|e| e.to_string())
    }

    async fn wait_until_unlocked(&self, host: &Host, id: InstanceId) -> std::result::Result<(), PollError> {
        let compute = &self.compute;
        let node = host.name.as_str();
        poll_until(&self.cfg.readiness, &format!("instance {id} to be unlocked"), move || async move {
            match compute.instance_status(node, id).await {
                Ok(status) if status.lock.is_none() => Some(()),
                Ok(status) => {
                    debug!("Instance {} still locked ({:?})", id, status.lock);
                    None
                }
                Err(e) => {
                    debug!("Status of instance {} not available yet: {}", id, e);
                    None
                }
            }
        })
        .await
    }
}
