/*!
Mock de la flotte compute (API Proxmox) pour tests sans cluster

Garde en mémoire les hôtes, leurs conteneurs et leurs templates.
Permet d'injecter des pannes : hôte injoignable, verrou disque sur le
clonage, échec de clonage ou de démarrage, listing en erreur.
*/

use async_trait::async_trait;
use range_orchestrator::compute::{CloneRequest, ComputeApi, ComputeError};
use range_orchestrator::models::{
    InstanceConfig, InstanceId, InstanceStatus, InstanceSummary, ResourceSnapshot, RunState,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

/// Message renvoyé par Proxmox quand le disque du template est verrouillé
pub const LOCKED_MESSAGE: &str = "CT is locked (disk)";

#[derive(Debug, Clone)]
struct MockInstance {
    summary: InstanceSummary,
    protection: bool,
    /// Lectures de statut restantes avant libération du verrou
    lock_reads: u32,
}

#[derive(Debug, Default)]
struct MockNode {
    /// `None` : l'appel de statut échoue (hôte injoignable)
    snapshot: Option<ResourceSnapshot>,
    instances: BTreeMap<InstanceId, MockInstance>,
    listing_fails: bool,
}

#[derive(Debug, Default)]
struct Inner {
    nodes: HashMap<String, MockNode>,
    locked_clones_remaining: u32,
    failing_clones: HashSet<String>,
    failing_starts: HashSet<InstanceId>,
    lock_reads_after_clone: u32,
    clone_calls: Vec<CloneRequest>,
    started: Vec<InstanceId>,
    stopped: Vec<InstanceId>,
    deleted: Vec<InstanceId>,
    protection_changes: Vec<(InstanceId, bool)>,
}

/// Mock de `ComputeApi`, état partagé derrière un `Mutex`
#[derive(Default)]
pub struct MockComputeApi {
    inner: Mutex<Inner>,
}

fn not_found(what: String) -> ComputeError {
    ComputeError::NotFound { what }
}

impl MockComputeApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ajoute un hôte avec son relevé de ressources
    pub fn add_host(&self, name: &str, snapshot: ResourceSnapshot) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.entry(name.to_string()).or_default().snapshot = Some(snapshot);
    }

    /// Hôte présent mais dont le statut est en erreur
    pub fn add_unreachable_host(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.entry(name.to_string()).or_default().snapshot = None;
    }

    pub fn set_snapshot(&self, name: &str, snapshot: Option<ResourceSnapshot>) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.entry(name.to_string()).or_default().snapshot = snapshot;
    }

    pub fn add_template(&self, node: &str, id: InstanceId, name: &str, protected: bool) {
        self.insert(node, id, name, true, RunState::Stopped, protected);
    }

    pub fn add_instance(&self, node: &str, id: InstanceId, name: &str, state: RunState) {
        self.insert(node, id, name, false, state, false);
    }

    fn insert(&self, node: &str, id: InstanceId, name: &str, template: bool, state: RunState, protection: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.entry(node.to_string()).or_default().instances.insert(
            id,
            MockInstance {
                summary: InstanceSummary {
                    id,
                    name: name.to_string(),
                    template,
                    state,
                },
                protection,
                lock_reads: 0,
            },
        );
    }

    /// Les `count` prochains clonages échouent avec le message de verrou
    pub fn fail_next_clones_locked(&self, count: u32) {
        self.inner.lock().unwrap().locked_clones_remaining = count;
    }

    /// Le clonage de ce hostname échoue (erreur autre que le verrou)
    pub fn fail_clone_of(&self, hostname: &str) {
        self.inner.lock().unwrap().failing_clones.insert(hostname.to_string());
    }

    pub fn fail_start_of(&self, id: InstanceId) {
        self.inner.lock().unwrap().failing_starts.insert(id);
    }

    pub fn fail_listing_of(&self, node: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.entry(node.to_string()).or_default().listing_fails = true;
    }

    /// Un clone reste verrouillé pendant `reads` lectures de statut
    pub fn lock_clones_for(&self, reads: u32) {
        self.inner.lock().unwrap().lock_reads_after_clone = reads;
    }

    /// Suppression hors bande (simule un opérateur)
    pub fn remove_instance(&self, node: &str, id: InstanceId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(n) = inner.nodes.get_mut(node) {
            n.instances.remove(&id);
        }
    }

    // Inspection

    pub fn clone_calls(&self) -> Vec<CloneRequest> {
        self.inner.lock().unwrap().clone_calls.clone()
    }

    pub fn started(&self) -> Vec<InstanceId> {
        self.inner.lock().unwrap().started.clone()
    }

    pub fn stopped(&self) -> Vec<InstanceId> {
        self.inner.lock().unwrap().stopped.clone()
    }

    pub fn deleted(&self) -> Vec<InstanceId> {
        self.inner.lock().unwrap().deleted.clone()
    }

    pub fn protection_changes(&self) -> Vec<(InstanceId, bool)> {
        self.inner.lock().unwrap().protection_changes.clone()
    }

    pub fn is_protected(&self, node: &str, id: InstanceId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .get(node)
            .and_then(|n| n.instances.get(&id))
            .map(|i| i.protection)
            .unwrap_or(false)
    }

    pub fn instances_on(&self, node: &str) -> Vec<InstanceSummary> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .get(node)
            .map(|n| n.instances.values().map(|i| i.summary.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ComputeApi for MockComputeApi {
    async fn node_status(&self, node: &str) -> Result<ResourceSnapshot, ComputeError> {
        let inner = self.inner.lock().unwrap();
        match inner.nodes.get(node).and_then(|n| n.snapshot) {
            Some(snapshot) => Ok(snapshot),
            None => Err(ComputeError::Api {
                status: 595,
                detail: format!("no route to host {node}"),
            }),
        }
    }

    async fn list_instances(&self, node: &str) -> Result<Vec<InstanceSummary>, ComputeError> {
        let inner = self.inner.lock().unwrap();
        let n = inner.nodes.get(node).ok_or_else(|| not_found(format!("node {node}")))?;
        if n.listing_fails {
            return Err(ComputeError::Api {
                status: 500,
                detail: format!("cannot list containers of {node}"),
            });
        }
        Ok(n.instances.values().map(|i| i.summary.clone()).collect())
    }

    async fn instance_config(&self, node: &str, id: InstanceId) -> Result<InstanceConfig, ComputeError> {
        let inner = self.inner.lock().unwrap();
        let instance = inner
            .nodes
            .get(node)
            .and_then(|n| n.instances.get(&id))
            .ok_or_else(|| not_found(format!("lxc/{id}")))?;
        Ok(InstanceConfig {
            hostname: Some(instance.summary.name.clone()),
            protection: instance.protection,
        })
    }

    async fn set_protection(&self, node: &str, id: InstanceId, enabled: bool) -> Result<(), ComputeError> {
        let mut inner = self.inner.lock().unwrap();
        let instance = inner
            .nodes
            .get_mut(node)
            .and_then(|n| n.instances.get_mut(&id))
            .ok_or_else(|| not_found(format!("lxc/{id}")))?;
        instance.protection = enabled;
        inner.protection_changes.push((id, enabled));
        log::info!("🔒 [MOCK] Protection of {} set to {}", id, enabled);
        Ok(())
    }

    async fn clone_instance(
        &self,
        node: &str,
        template_id: InstanceId,
        request: &CloneRequest,
    ) -> Result<(), ComputeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.clone_calls.push(request.clone());

        if inner.locked_clones_remaining > 0 {
            inner.locked_clones_remaining -= 1;
            return Err(ComputeError::Api {
                status: 500,
                detail: LOCKED_MESSAGE.to_string(),
            });
        }
        if inner.failing_clones.contains(&request.hostname) {
            return Err(ComputeError::Api {
                status: 500,
                detail: format!("unable to create CT {} - storage full", request.new_id),
            });
        }

        let lock_reads = inner.lock_reads_after_clone;
        let n = inner.nodes.get_mut(node).ok_or_else(|| not_found(format!("node {node}")))?;
        let template = n.instances.get(&template_id).ok_or_else(|| not_found(format!("lxc/{template_id}")))?;
        if template.protection {
            return Err(ComputeError::Api {
                status: 500,
                detail: format!("CT {template_id} is protected"),
            });
        }
        if n.instances.contains_key(&request.new_id) {
            return Err(ComputeError::Api {
                status: 500,
                detail: format!("CT {} already exists", request.new_id),
            });
        }

        n.instances.insert(
            request.new_id,
            MockInstance {
                summary: InstanceSummary {
                    id: request.new_id,
                    name: request.hostname.clone(),
                    template: false,
                    state: RunState::Stopped,
                },
                protection: false,
                lock_reads,
            },
        );
        log::info!("🧬 [MOCK] Cloned {} into {} ({})", template_id, request.new_id, request.hostname);
        Ok(())
    }

    async fn start_instance(&self, node: &str, id: InstanceId) -> Result<(), ComputeError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_starts.contains(&id) {
            return Err(ComputeError::Api {
                status: 500,
                detail: format!("startup for container '{id}' failed"),
            });
        }
        let instance = inner
            .nodes
            .get_mut(node)
            .and_then(|n| n.instances.get_mut(&id))
            .ok_or_else(|| not_found(format!("lxc/{id}")))?;
        if instance.lock_reads > 0 {
            return Err(ComputeError::Api {
                status: 500,
                detail: format!("CT {id} is locked (create)"),
            });
        }
        instance.summary.state = RunState::Running;
        inner.started.push(id);
        Ok(())
    }

    async fn stop_instance(&self, node: &str, id: InstanceId) -> Result<(), ComputeError> {
        let mut inner = self.inner.lock().unwrap();
        let instance = inner
            .nodes
            .get_mut(node)
            .and_then(|n| n.instances.get_mut(&id))
            .ok_or_else(|| not_found(format!("lxc/{id}")))?;
        instance.summary.state = RunState::Stopped;
        inner.stopped.push(id);
        Ok(())
    }

    async fn instance_status(&self, node: &str, id: InstanceId) -> Result<InstanceStatus, ComputeError> {
        let mut inner = self.inner.lock().unwrap();
        let instance = inner
            .nodes
            .get_mut(node)
            .and_then(|n| n.instances.get_mut(&id))
            .ok_or_else(|| ComputeError::Api {
                status: 500,
                detail: format!("Configuration file 'nodes/{node}/lxc/{id}.conf' does not exist"),
            })?;

        let lock = if instance.lock_reads > 0 {
            instance.lock_reads -= 1;
            Some("create".to_string())
        } else {
            None
        };
        Ok(InstanceStatus {
            state: instance.summary.state.clone(),
            lock,
        })
    }

    async fn delete_instance(&self, node: &str, id: InstanceId) -> Result<(), ComputeError> {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.nodes.get_mut(node).ok_or_else(|| not_found(format!("node {node}")))?;
        let running = match n.instances.get(&id) {
            None => {
                return Err(ComputeError::Api {
                    status: 500,
                    detail: format!("Configuration file 'nodes/{node}/lxc/{id}.conf' does not exist"),
                })
            }
            Some(i) => i.summary.state == RunState::Running,
        };
        if running {
            return Err(ComputeError::Api {
                status: 500,
                detail: format!("CT {id} is running - destroy failed"),
            });
        }

        n.instances.remove(&id);
        inner.deleted.push(id);
        log::info!("🗑️ [MOCK] Deleted {} from {}", id, node);
        Ok(())
    }
}
