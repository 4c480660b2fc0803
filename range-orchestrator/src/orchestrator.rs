//! Provisioning orchestrator
//!
//! Create: pick a host, clone and start the batch, discover each address,
//! reconcile the access accounts, write the manifest.
//!
//! Delete: find the tenant's instances across the pool, stop and delete
//! them, then revoke their access resources.

use futures::future::join_all;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::access::{AccessApi, GuacamoleClient};
use crate::compute::{ComputeApi, ProxmoxClient};
use crate::config::RangeConfig;
use crate::discovery::NetworkDiscovery;
use crate::error::{OrchestratorError, Result};
use crate::manifest::write_manifest;
use crate::models::{
    tenant_of, FailureStage, Host, Instance, InstanceFailure, InstanceId, InstanceSummary, ProvisionedAccount, RunState,
};
use crate::poll::poll_until;
use crate::provision::Provisioner;
use crate::reconcile::{AccessReconciler, RevokeReport};
use crate::scorer::select_best_host;
use crate::remote::{RemoteShell, SshShell};

/// Lets the operator pick the tenant to delete among the discovered ones.
pub trait TenantSelector {
    /// `None` cancels the deletion.
    fn select_tenant(&self, candidates: &[String]) -> io::Result<Option<String>>;
}

#[derive(Debug)]
pub struct CreateReport {
    pub tenant: String,
    pub host: String,
    pub requested: u32,
    /// Started instances, with their discovered address.
    pub instances: Vec<Instance>,
    pub accounts: Vec<ProvisionedAccount>,
    /// `None` when no instance was produced or the write failed.
    pub manifest: Option<PathBuf>,
    pub failures: Vec<InstanceFailure>,
}

impl CreateReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.accounts.len() == self.requested as usize
    }
}

#[derive(Debug)]
pub enum AccessOutcome {
    Revoked(RevokeReport),
    /// Authentication or listing failed; compute teardown still happened.
    Failed(String),
}

#[derive(Debug)]
pub struct DeleteReport {
    pub tenant: String,
    pub deleted: Vec<InstanceId>,
    /// Instances that vanished between listing and deletion.
    pub already_absent: Vec<InstanceId>,
    pub failures: Vec<InstanceFailure>,
    pub access: AccessOutcome,
}

pub struct Orchestrator {
    cfg: RangeConfig,
    compute: Arc<dyn ComputeApi>,
    access: Arc<dyn AccessApi>,
    provisioner: Provisioner,
    discovery: NetworkDiscovery,
}

impl Orchestrator {
    pub fn new(
        cfg: RangeConfig,
        compute: Arc<dyn ComputeApi>,
        access: Arc<dyn AccessApi>,
        shell: Arc<dyn RemoteShell>,
    ) -> Self {
        let provisioner = Provisioner::new(Arc::clone(&compute), cfg.provisioning.clone());
        let discovery = NetworkDiscovery::new(shell, cfg.discovery.clone());
        Self {
            cfg,
            compute,
            access,
            provisioner,
            discovery,
        }
    }

    /// Wire the HTTP and SSH clients described by `cfg`.
    pub fn from_config(cfg: RangeConfig) -> Result<Self> {
        let compute = ProxmoxClient::new(&cfg.compute).map_err(|source| OrchestratorError::Compute {
            entity: cfg.compute.base_url.clone(),
            source,
        })?;
        let access = GuacamoleClient::new(&cfg.access)?;
        let shell = SshShell::new(&cfg.ssh);
        Ok(Self::new(cfg, Arc::new(compute), Arc::new(access), Arc::new(shell)))
    }

    pub fn config(&self) -> &RangeConfig {
        &self.cfg
    }

    /// Tenant names are ASCII alphanumeric; at most `max_accounts` instances per run.
    pub fn validate_request(&self, tenant: &str, count: u32) -> Result<()> {
        if tenant.is_empty() || !tenant.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "tenant name {tenant:?} must be non-empty and alphanumeric"
            )));
        }
        let max = self.cfg.provisioning.max_accounts;
        if count == 0 || count > max {
            return Err(OrchestratorError::InvalidRequest(format!(
                "account count must be between 1 and {max}, got {count}"
            )));
        }
        Ok(())
    }

    fn account_secret(&self, hostname: &str) -> String {
        format!("{}{}", hostname, self.cfg.provisioning.account_secret_suffix)
    }

    pub async fn create_for_tenant(&self, tenant: &str, count: u32) -> Result<CreateReport> {
        self.validate_request(tenant, count)?;
        info!("Creating {} account(s) for tenant {}", count, tenant);

        let mut pool = self.cfg.host_pool();
        let host = select_best_host(self.compute.as_ref(), &mut pool, &self.cfg.placement)
            .await
            .ok_or(OrchestratorError::NoCapacity)?;
        let template = self.provisioner.find_template(&host).await?;

        // Shared setup: without a token no account can be reconciled.
        let reconciler = AccessReconciler::connect(Arc::clone(&self.access), self.cfg.connection.clone())
            .await
            .map_err(OrchestratorError::Authentication)?;

        let batch = self
            .provisioner
            .clone_and_start(&host, &pool, &template, tenant, count)
            .await?;

        let mut report = CreateReport {
            tenant: tenant.to_string(),
            host: host.name.clone(),
            requested: count,
            instances: Vec::new(),
            accounts: Vec::new(),
            manifest: None,
            failures: batch.failures,
        };

        for mut instance in batch.started {
            instance.ip = self.discovery.discover_ip(&host, instance.id).await;

            let secret = self.account_secret(&instance.hostname);
            match reconciler.reconcile_account(&instance.hostname, &secret, instance.ip).await {
                Ok(account) => report.accounts.push(account),
                Err(e) => {
                    error!("Failed to reconcile access for {} ({}): {}", instance.hostname, instance.id, e);
                    report.failures.push(InstanceFailure::new(
                        &instance.hostname,
                        Some(instance.id),
                        FailureStage::Access,
                        e.to_string(),
                    ));
                }
            }
            report.instances.push(instance);
        }

        if report.instances.is_empty() {
            warn!("No instance was produced for tenant {}, no manifest written", tenant);
            return Ok(report);
        }

        match write_manifest(&self.cfg.manifest.output_dir, tenant, &report.accounts).await {
            Ok(path) => report.manifest = Some(path),
            Err(e) => {
                error!("Failed to write manifest for tenant {}: {}", tenant, e);
                report
                    .failures
                    .push(InstanceFailure::new(tenant, None, FailureStage::Manifest, e.to_string()));
            }
        }

        info!(
            "Tenant {}: {}/{} account(s) provisioned, {} failure(s)",
            tenant,
            report.accounts.len(),
            count,
            report.failures.len()
        );
        Ok(report)
    }

    /// Tenant instances (`id >= id_floor`) of every host, with their host.
    async fn tenant_instances(&self) -> (Vec<(Host, InstanceSummary)>, Vec<InstanceFailure>) {
        let pool = self.cfg.host_pool();
        let floor = self.cfg.provisioning.id_floor;
        let listings = join_all(
            pool.iter()
                .map(|h| async move { (h, self.compute.list_instances(&h.name).await) }),
        )
        .await;

        let mut found = Vec::new();
        let mut failures = Vec::new();
        for (host, listing) in listings {
            match listing {
                Ok(instances) => found.extend(
                    instances
                        .into_iter()
                        .filter(|i| i.id >= floor)
                        .map(|i| (host.clone(), i)),
                ),
                Err(e) => {
                    warn!("Cannot list instances of host {}: {}", host.name, e);
                    failures.push(InstanceFailure::new(
                        format!("host {}", host.name),
                        None,
                        FailureStage::Delete,
                        e.to_string(),
                    ));
                }
            }
        }
        (found, failures)
    }

    /// Tenant names found on the pool, in discovery order.
    pub async fn tenant_candidates(&self) -> Vec<String> {
        let (instances, _) = self.tenant_instances().await;
        let mut candidates: Vec<String> = Vec::new();
        for (_, instance) in instances {
            let tenant = tenant_of(&instance.name);
            if tenant.len() > 1 && !candidates.contains(&tenant) {
                candidates.push(tenant);
            }
        }
        candidates
    }

    /// Discover the tenants, let `selector` pick one, delete it.
    ///
    /// `Ok(None)` when there is nothing to delete or the operator cancelled.
    pub async fn delete_with_selection(&self, selector: &dyn TenantSelector) -> Result<Option<DeleteReport>> {
        let candidates = self.tenant_candidates().await;
        if candidates.is_empty() {
            info!("No tenant found on the host pool");
            return Ok(None);
        }

        let selected = selector
            .select_tenant(&candidates)
            .map_err(|e| OrchestratorError::InvalidRequest(format!("tenant selection failed: {e}")))?;
        let Some(tenant) = selected else {
            info!("Deletion cancelled");
            return Ok(None);
        };
        if !candidates.contains(&tenant) {
            return Err(OrchestratorError::InvalidRequest(format!("unknown tenant {tenant}")));
        }

        self.delete_for_tenant(&tenant).await.map(Some)
    }

    pub async fn delete_for_tenant(&self, tenant: &str) -> Result<DeleteReport> {
        if tenant.is_empty() {
            return Err(OrchestratorError::InvalidRequest("tenant name is empty".into()));
        }
        info!("Deleting instances and access of tenant {}", tenant);

        let (instances, failures) = self.tenant_instances().await;
        let mut report = DeleteReport {
            tenant: tenant.to_string(),
            deleted: Vec::new(),
            already_absent: Vec::new(),
            failures,
            access: AccessOutcome::Failed("not attempted".into()),
        };

        let targets: Vec<(Host, InstanceSummary)> = instances
            .into_iter()
            .filter(|(_, i)| tenant_of(&i.name) == tenant)
            .collect();

        let mut hostnames = Vec::new();
        for (host, instance) in &targets {
            hostnames.push(instance.name.clone());
            self.teardown_instance(host, instance, &mut report).await;
        }

        // Instance teardown is done whatever happens on the access side.
        report.access = match AccessReconciler::connect(Arc::clone(&self.access), self.cfg.connection.clone()).await {
            Ok(reconciler) => match reconciler.revoke_all(tenant, &hostnames).await {
                Ok(revoked) => AccessOutcome::Revoked(revoked),
                Err(e) => {
                    error!("Failed to revoke access of tenant {}: {}", tenant, e);
                    AccessOutcome::Failed(e.to_string())
                }
            },
            Err(e) => {
                error!("Access service authentication failed, access of tenant {} not revoked: {}", tenant, e);
                AccessOutcome::Failed(e.to_string())
            }
        };

        info!(
            "Tenant {}: {} instance(s) deleted, {} already absent, {} failure(s)",
            tenant,
            report.deleted.len(),
            report.already_absent.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Stop (if running) then delete one instance; absent instances count as deleted.
    async fn teardown_instance(&self, host: &Host, instance: &InstanceSummary, report: &mut DeleteReport) {
        let id = instance.id;
        let record = |stage: FailureStage, detail: String| InstanceFailure::new(&instance.name, Some(id), stage, detail);

        let running = match self.compute.instance_status(&host.name, id).await {
            Ok(status) => status.state == RunState::Running,
            Err(e) if e.is_not_found() => {
                info!("Instance {} ({}) already deleted", instance.name, id);
                report.already_absent.push(id);
                return;
            }
            // fall back on the listing
            Err(_) => instance.state == RunState::Running,
        };

        if running {
            info!("Instance {} ({}) is running, stopping it first", instance.name, id);
            if let Err(e) = self.stop_and_wait(host, id).await {
                error!("Failed to stop instance {} ({}): {}", instance.name, id, e);
                report.failures.push(record(FailureStage::Stop, e));
                return;
            }
        }

        match self.compute.delete_instance(&host.name, id).await {
            Ok(()) => {
                info!("Instance {} ({}) deleted from {}", instance.name, id, host.name);
                report.deleted.push(id);
            }
            Err(e) if e.is_not_found() => {
                info!("Instance {} ({}) already deleted", instance.name, id);
                report.already_absent.push(id);
            }
            Err(e) => {
                error!("Failed to delete instance {} ({}): {}", instance.name, id, e);
                report.failures.push(record(FailureStage::Delete, e.to_string()));
            }
        }
    }

    async fn stop_and_wait(&self, host: &Host, id: InstanceId) -> std::result::Result<(), String> {
        match self.compute.stop_instance(&host.name, id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.to_string()),
        }

        let compute = &self.compute;
        let node = host.name.as_str();
        poll_until(
            &self.cfg.provisioning.shutdown,
            &format!("instance {id} to stop"),
            move || async move {
                match compute.instance_status(node, id).await {
                    Ok(status) if status.state == RunState::Stopped => Some(()),
                    Err(e) if e.is_not_found() => Some(()),
                    _ => None,
                }
            },
        )
        .await
        .map_err(|e| e.to_string())
    }
}
