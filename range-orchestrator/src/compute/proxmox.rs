//! Proxmox VE HTTP client
//!
//! Ticket login (`/access/ticket`) once per run, then cookie authentication
//! on every call and the CSRF header on writes. Every response is wrapped in
//! a `{"data": ...}` envelope.

use async_trait::async_trait;
use reqwest::header::COOKIE;
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{CloneRequest, ComputeApi, ComputeError};
use crate::config::ComputeConfig;
use crate::models::{InstanceConfig, InstanceId, InstanceStatus, InstanceSummary, ResourceSnapshot, RunState};

const API_PREFIX: &str = "/api2/json";
const CSRF_HEADER: &str = "CSRFPreventionToken";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

#[derive(Debug, Deserialize)]
struct NodeStatusData {
    cpu: f64,
    memory: Usage,
    rootfs: Usage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    free: u64,
    total: u64,
}

#[derive(Debug, Deserialize)]
struct LxcEntry {
    vmid: Value,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    template: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct LxcConfigData {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    protection: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct LxcStatusData {
    status: String,
    #[serde(default)]
    lock: Option<String>,
}

/// Proxmox answers booleans and numbers as ints, strings or bools depending on the endpoint.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_u64().map(|v| v != 0).unwrap_or(false),
        Value::String(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn parse_vmid(value: &Value) -> Result<InstanceId, ComputeError> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| InstanceId::try_from(v).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| ComputeError::Decode(format!("invalid vmid: {value}")))
}

fn parse_run_state(status: Option<&str>) -> RunState {
    match status {
        Some("running") => RunState::Running,
        Some("stopped") => RunState::Stopped,
        _ => RunState::Unknown,
    }
}

struct Ticket {
    cookie: String,
    csrf_token: String,
}

/// HTTP client for the Proxmox VE API
pub struct ProxmoxClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    ticket: OnceCell<Ticket>,
}

impl ProxmoxClient {
    pub fn new(cfg: &ComputeConfig) -> Result<Self, ComputeError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(cfg.accept_invalid_certs)
            .timeout(cfg.request_timeout())
            .build()?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            ticket: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    async fn login(&self) -> Result<Ticket, ComputeError> {
        let response = self
            .http
            .post(self.url("/access/ticket"))
            .form(&[("username", self.username.as_str()), ("password", self.password.as_str())])
            .send()
            .await?;

        if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(ComputeError::Auth(format!("login rejected for {}", self.username)));
        }
        let ticket: TicketData = Self::decode(response, "/access/ticket").await?;

        info!("Compute API ticket acquired for {}", self.username);
        Ok(Ticket {
            cookie: format!("PVEAuthCookie={}", ticket.ticket),
            csrf_token: ticket.csrf_token,
        })
    }

    async fn ticket(&self) -> Result<&Ticket, ComputeError> {
        self.ticket.get_or_try_init(|| self.login()).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ComputeError> {
        let ticket = self.ticket().await?;
        let response = self
            .http
            .get(self.url(path))
            .header(COOKIE, &ticket.cookie)
            .send()
            .await?;
        Self::decode(response, path).await
    }

    async fn write(&self, method: Method, path: &str, form: &[(&str, String)]) -> Result<(), ComputeError> {
        let ticket = self.ticket().await?;
        debug!("{} {}", method, path);

        let mut request = self
            .http
            .request(method.clone(), self.url(path))
            .header(COOKIE, &ticket.cookie)
            .header(CSRF_HEADER, &ticket.csrf_token);
        request = if method == Method::DELETE {
            request.query(form)
        } else {
            request.form(form)
        };

        let response = request.send().await?;
        let _: Value = Self::decode(response, path).await?;
        Ok(())
    }

    async fn decode<T: DeserializeOwned>(response: Response, path: &str) -> Result<T, ComputeError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ComputeError::NotFound { what: path.to_string() });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ComputeError::Api {
                status: status.as_u16(),
                detail: Self::error_detail(status, &body),
            });
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| ComputeError::Decode(format!("{path}: {e}")))?;
        Ok(envelope.data)
    }

    /// Proxmox puts the reason in `message` and per-parameter errors in `errors`.
    fn error_detail(status: StatusCode, body: &str) -> String {
        let Ok(json) = serde_json::from_str::<Value>(body) else {
            return if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("error").to_string()
            } else {
                body.trim().to_string()
            };
        };

        let mut parts = Vec::new();
        if let Some(message) = json.get("message").and_then(Value::as_str) {
            parts.push(message.trim().to_string());
        }
        if let Some(errors) = json.get("errors").and_then(Value::as_object) {
            for (field, reason) in errors {
                parts.push(format!("{field}: {}", reason.as_str().unwrap_or_default().trim()));
            }
        }
        if parts.is_empty() {
            body.trim().to_string()
        } else {
            parts.join("; ")
        }
    }
}

#[async_trait]
impl ComputeApi for ProxmoxClient {
    async fn node_status(&self, node: &str) -> Result<ResourceSnapshot, ComputeError> {
        let data: NodeStatusData = self.get(&format!("/nodes/{node}/status")).await?;
        Ok(ResourceSnapshot {
            cpu_busy: data.cpu,
            free_memory: data.memory.free,
            total_memory: data.memory.total,
            free_disk: data.rootfs.free,
            total_disk: data.rootfs.total,
        })
    }

    async fn list_instances(&self, node: &str) -> Result<Vec<InstanceSummary>, ComputeError> {
        let entries: Vec<LxcEntry> = self.get(&format!("/nodes/{node}/lxc")).await?;
        entries
            .into_iter()
            .map(|entry| {
                Ok(InstanceSummary {
                    id: parse_vmid(&entry.vmid)?,
                    name: entry.name.unwrap_or_default(),
                    template: entry.template.as_ref().map(truthy).unwrap_or(false),
                    state: parse_run_state(entry.status.as_deref()),
                })
            })
            .collect()
    }

    async fn instance_config(&self, node: &str, id: InstanceId) -> Result<InstanceConfig, ComputeError> {
        let data: LxcConfigData = self.get(&format!("/nodes/{node}/lxc/{id}/config")).await?;
        Ok(InstanceConfig {
            hostname: data.hostname,
            protection: data.protection.as_ref().map(truthy).unwrap_or(false),
        })
    }

    async fn set_protection(&self, node: &str, id: InstanceId, enabled: bool) -> Result<(), ComputeError> {
        let flag = if enabled { "1" } else { "0" };
        self.write(
            Method::PUT,
            &format!("/nodes/{node}/lxc/{id}/config"),
            &[("protection", flag.to_string())],
        )
        .await
    }

    async fn clone_instance(
        &self,
        node: &str,
        template_id: InstanceId,
        request: &CloneRequest,
    ) -> Result<(), ComputeError> {
        let full = if request.full { "1" } else { "0" };
        self.write(
            Method::POST,
            &format!("/nodes/{node}/lxc/{template_id}/clone"),
            &[
                ("newid", request.new_id.to_string()),
                ("hostname", request.hostname.clone()),
                ("full", full.to_string()),
                ("target", request.target.clone()),
                ("description", request.description.clone()),
            ],
        )
        .await
    }

    async fn start_instance(&self, node: &str, id: InstanceId) -> Result<(), ComputeError> {
        self.write(Method::POST, &format!("/nodes/{node}/lxc/{id}/status/start"), &[]).await
    }

    async fn stop_instance(&self, node: &str, id: InstanceId) -> Result<(), ComputeError> {
        self.write(Method::POST, &format!("/nodes/{node}/lxc/{id}/status/stop"), &[]).await
    }

    async fn instance_status(&self, node: &str, id: InstanceId) -> Result<InstanceStatus, ComputeError> {
        let data: LxcStatusData = self.get(&format!("/nodes/{node}/lxc/{id}/status/current")).await?;
        Ok(InstanceStatus {
            state: parse_run_state(Some(data.status.as_str())),
            lock: data.lock.filter(|l| !l.is_empty()),
        })
    }

    async fn delete_instance(&self, node: &str, id: InstanceId) -> Result<(), ComputeError> {
        self.write(
            Method::DELETE,
            &format!("/nodes/{node}/lxc/{id}"),
            &[("force", "1".to_string()), ("purge", "1".to_string())],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> ComputeConfig {
        ComputeConfig {
            base_url: base_url.to_string(),
            username: "root@pam".into(),
            password: "pw".into(),
            accept_invalid_certs: true,
            request_timeout_secs: 5,
        }
    }

    async fn mount_login(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api2/json/access/ticket"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "ticket": "PVE:root@pam:ABC", "CSRFPreventionToken": "csrf-1", "username": "root@pam" }
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_node_status_and_single_login() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve1/status"))
            .and(header("cookie", "PVEAuthCookie=PVE:root@pam:ABC"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "cpu": 0.25,
                    "memory": { "free": 8_000_000_000u64, "total": 16_000_000_000u64, "used": 8_000_000_000u64 },
                    "rootfs": { "free": 50_000_000_000u64, "total": 100_000_000_000u64, "used": 50_000_000_000u64 }
                }
            })))
            .mount(&server)
            .await;

        let client = ProxmoxClient::new(&config(&server.uri())).unwrap();
        let snapshot = client.node_status("pve1").await.unwrap();
        assert_eq!(snapshot.free_memory, 8_000_000_000);
        assert_eq!(snapshot.total_disk, 100_000_000_000);
        // second call reuses the ticket (login expects exactly one call)
        client.node_status("pve1").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_instances_parses_mixed_types() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve1/lxc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    { "vmid": 103, "name": "kali-template", "status": "stopped", "template": 1 },
                    { "vmid": "2001", "name": "acme-1", "status": "running" }
                ]
            })))
            .mount(&server)
            .await;

        let client = ProxmoxClient::new(&config(&server.uri())).unwrap();
        let list = client.list_instances("pve1").await.unwrap();
        assert_eq!(list.len(), 2);
        assert!(list[0].template);
        assert_eq!(list[1].id, 2001);
        assert_eq!(list[1].state, RunState::Running);
        assert!(!list[1].template);
    }

    #[tokio::test]
    async fn test_locked_clone_keeps_message() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("POST"))
            .and(path("/api2/json/nodes/pve1/lxc/103/clone"))
            .and(header("CSRFPreventionToken", "csrf-1"))
            .and(body_string_contains("hostname=acme-1"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "data": null,
                "message": "CT is locked (disk)\n"
            })))
            .mount(&server)
            .await;

        let client = ProxmoxClient::new(&config(&server.uri())).unwrap();
        let request = CloneRequest {
            new_id: 2001,
            hostname: "acme-1".into(),
            full: false,
            target: "pve1".into(),
            description: "VM for acme account 1".into(),
        };
        let err = client.clone_instance("pve1", 103, &request).await.unwrap_err();
        assert!(err.matches("is locked"), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_delete_missing_instance_is_not_found() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("DELETE"))
            .and(path("/api2/json/nodes/pve1/lxc/2002"))
            .and(query_param("purge", "1"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "data": null,
                "message": "Configuration file 'nodes/pve1/lxc/2002.conf' does not exist\n"
            })))
            .mount(&server)
            .await;

        let client = ProxmoxClient::new(&config(&server.uri())).unwrap();
        let err = client.delete_instance("pve1", 2002).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_rejected_login() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api2/json/access/ticket"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = ProxmoxClient::new(&config(&server.uri())).unwrap();
        let err = client.list_instances("pve1").await.unwrap_err();
        assert!(matches!(err, ComputeError::Auth(_)));
    }

    #[test]
    fn test_truthy() {
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!("1")));
        assert!(truthy(&json!(true)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!(null)));
    }
}
