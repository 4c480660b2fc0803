/*!
Test Harness pour le Range Manager

Assemble un orchestrateur complet sur les mocks :
- Flotte de deux hôtes (pve1 avec template protégé, pve2)
- Service d'accès en mémoire
- Canal SSH simulé
- Répertoire de sortie temporaire pour les manifestes

Les délais de la configuration sont ramenés à quelques millisecondes.
*/

use crate::access_stub::MockAccessApi;
use crate::compute_stub::MockComputeApi;
use crate::shell_stub::MockRemoteShell;
use anyhow::Result;
use range_orchestrator::models::ResourceSnapshot;
use range_orchestrator::{Orchestrator, RangeConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const GIB: u64 = 1024 * 1024 * 1024;

pub const PRIMARY_HOST: &str = "pve1";
pub const PRIMARY_ADDRESS: &str = "10.0.0.1";
pub const PRIMARY_TEMPLATE: u32 = 103;
pub const SECONDARY_HOST: &str = "pve2";
pub const SECONDARY_ADDRESS: &str = "10.0.0.2";
pub const SECONDARY_TEMPLATE: u32 = 123;

/// Relevé de ressources d'un hôte (CPU en fraction, mémoire et disque libres en Gio)
pub fn snapshot(cpu_busy: f64, free_memory_gib: u64, free_disk_gib: u64) -> ResourceSnapshot {
    ResourceSnapshot {
        cpu_busy,
        free_memory: free_memory_gib * GIB,
        total_memory: 64 * GIB,
        free_disk: free_disk_gib * GIB,
        total_disk: 1024 * GIB,
    }
}

/// Configuration YAML de test, sorties dans `output_dir`
pub fn test_config_yaml(output_dir: &Path) -> String {
    format!(
        r#"
compute:
  base_url: "https://pve.test:8006"
  password: "secret"
ssh:
  username: "root"
access:
  base_url: "http://guacamole.test/api"
  username: "guacadmin"
  password: "guacadmin"
hosts:
  - name: "{PRIMARY_HOST}"
    address: "{PRIMARY_ADDRESS}"
    template_id: {PRIMARY_TEMPLATE}
  - name: "{SECONDARY_HOST}"
    address: "{SECONDARY_ADDRESS}"
    template_id: {SECONDARY_TEMPLATE}
provisioning:
  clone_retry_delay_ms: 1
  readiness: {{ interval_ms: 1, timeout_ms: 50 }}
  shutdown: {{ interval_ms: 1, timeout_ms: 50 }}
discovery:
  address_prefixes: ["192.", "147."]
  poll: {{ interval_ms: 1, timeout_ms: 50 }}
connection:
  username: "student"
  password: "student"
manifest:
  output_dir: "{}"
run_lock:
  path: "{}"
"#,
        output_dir.display(),
        output_dir.join("range-manager.lock").display()
    )
}

/// Harness de test complet
pub struct TestHarness {
    pub compute: Arc<MockComputeApi>,
    pub access: Arc<MockAccessApi>,
    pub shell: Arc<MockRemoteShell>,
    pub config: RangeConfig,
    output: TempDir,
}

impl TestHarness {
    /// Flotte de base : pve1 (plus de mémoire libre) et pve2, templates en place
    pub fn new() -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        let output = tempfile::tempdir()?;
        let config = RangeConfig::from_yaml_str(&test_config_yaml(output.path()))?;

        let compute = Arc::new(MockComputeApi::new());
        compute.add_host(PRIMARY_HOST, snapshot(0.2, 48, 500));
        compute.add_host(SECONDARY_HOST, snapshot(0.1, 24, 400));
        compute.add_template(PRIMARY_HOST, PRIMARY_TEMPLATE, "win10-template", true);
        compute.add_template(SECONDARY_HOST, SECONDARY_TEMPLATE, "win10-template", false);

        log::info!("🧪 Test harness ready in {}", output.path().display());
        Ok(Self {
            compute,
            access: Arc::new(MockAccessApi::new()),
            shell: Arc::new(MockRemoteShell::new()),
            config,
            output,
        })
    }

    /// Modifie la configuration avant de construire l'orchestrateur
    pub fn with_config(mut self, edit: impl FnOnce(&mut RangeConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.config.clone(),
            self.compute.clone(),
            self.access.clone(),
            self.shell.clone(),
        )
    }

    pub fn output_dir(&self) -> &Path {
        self.output.path()
    }

    pub fn manifest_path(&self, tenant: &str) -> PathBuf {
        range_orchestrator::manifest::manifest_path(self.output.path(), tenant)
    }

    /// Contenu du manifeste d'un tenant, `None` s'il n'a pas été écrit
    pub fn read_manifest(&self, tenant: &str) -> Option<String> {
        std::fs::read_to_string(self.manifest_path(tenant)).ok()
    }
}
