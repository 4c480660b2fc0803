//! Guacamole REST client
//!
//! `POST /tokens` exchanges the admin credentials for an `authToken`, which
//! is then sent as the `token` query parameter. Users and connections live
//! under `/session/data/<source>/`.

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{AccessApi, AccessConnection, AccessError, AccessUser, AuthToken, ConnectionSpec, Permission};
use crate::config::AccessConfig;

const USER_ORGANIZATION: &str = "RDP client";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(rename = "authToken")]
    auth_token: String,
}

#[derive(Debug, Deserialize)]
struct RawConnection {
    #[serde(default)]
    identifier: Option<String>,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    username: String,
}

#[derive(Debug, Deserialize)]
struct CreatedConnection {
    identifier: String,
}

/// HTTP client for the Guacamole REST API
pub struct GuacamoleClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    data_source: String,
}

impl GuacamoleClient {
    pub fn new(cfg: &AccessConfig) -> Result<Self, AccessError> {
        let http = reqwest::Client::builder().timeout(cfg.request_timeout()).build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            data_source: cfg.data_source.clone(),
        })
    }

    fn data_url(&self, path: &str) -> String {
        format!("{}/session/data/{}{}", self.base_url, self.data_source, path)
    }

    fn with_token(request: RequestBuilder, token: &AuthToken) -> RequestBuilder {
        request.query(&[("token", token.as_str())])
    }

    async fn check(response: Response, what: &str) -> Result<Response, AccessError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(AccessError::NotFound { what: what.to_string() });
        }
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(AccessError::Auth(format!("{what}: {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AccessError::Api {
                status: status.as_u16(),
                detail: Self::error_detail(&body),
            });
        }
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T, AccessError> {
        response
            .json()
            .await
            .map_err(|e| AccessError::Decode(format!("{what}: {e}")))
    }

    /// Guacamole errors are `{"message": ..., "type": ...}`.
    fn error_detail(body: &str) -> String {
        serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| body.trim().to_string())
    }
}

#[async_trait]
impl AccessApi for GuacamoleClient {
    async fn authenticate(&self) -> Result<AuthToken, AccessError> {
        let response = self
            .http
            .post(format!("{}/tokens", self.base_url))
            .form(&[("username", self.username.as_str()), ("password", self.password.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AccessError::Auth(format!(
                "token exchange for {} returned {}: {}",
                self.username,
                status,
                Self::error_detail(&body)
            )));
        }

        let token: TokenResponse = Self::json(response, "token").await?;
        info!("Access service token acquired for {}", self.username);
        Ok(AuthToken::new(token.auth_token))
    }

    async fn list_connections(&self, token: &AuthToken) -> Result<Vec<AccessConnection>, AccessError> {
        let request = self.http.get(self.data_url("/connections"));
        let response = Self::check(Self::with_token(request, token).send().await?, "connections").await?;

        // Keyed by identifier; the BTreeMap keeps the listing order stable.
        let raw: BTreeMap<String, RawConnection> = Self::json(response, "connections").await?;
        Ok(raw
            .into_iter()
            .map(|(key, conn)| AccessConnection {
                identifier: conn.identifier.unwrap_or(key),
                name: conn.name,
            })
            .collect())
    }

    async fn create_connection(&self, token: &AuthToken, spec: &ConnectionSpec) -> Result<String, AccessError> {
        let body = json!({
            "parentIdentifier": "ROOT",
            "name": spec.name,
            "protocol": spec.protocol,
            "parameters": {
                "hostname": spec.hostname,
                "port": spec.port.to_string(),
                "username": spec.username,
                "password": spec.password,
            },
            "attributes": {},
        });

        let request = self.http.post(self.data_url("/connections")).json(&body);
        let what = format!("connection {}", spec.name);
        let response = Self::check(Self::with_token(request, token).send().await?, &what).await?;
        let created: CreatedConnection = Self::json(response, &what).await?;

        debug!("Connection {} created with id {}", spec.name, created.identifier);
        Ok(created.identifier)
    }

    async fn delete_connection(&self, token: &AuthToken, identifier: &str) -> Result<(), AccessError> {
        let request = self.http.delete(self.data_url(&format!("/connections/{identifier}")));
        Self::check(
            Self::with_token(request, token).send().await?,
            &format!("connection id {identifier}"),
        )
        .await?;
        Ok(())
    }

    async fn get_user(&self, token: &AuthToken, username: &str) -> Result<Option<AccessUser>, AccessError> {
        let request = self.http.get(self.data_url(&format!("/users/{username}")));
        let what = format!("user {username}");
        match Self::check(Self::with_token(request, token).send().await?, &what).await {
            Ok(response) => {
                let user: RawUser = Self::json(response, &what).await?;
                Ok(Some(AccessUser { username: user.username }))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_user(&self, token: &AuthToken, username: &str, password: &str) -> Result<(), AccessError> {
        let body = json!({
            "username": username,
            "password": password,
            "attributes": {
                "guac-full-name": username,
                "guac-organization": USER_ORGANIZATION,
            },
        });

        let request = self.http.post(self.data_url("/users")).json(&body);
        Self::check(Self::with_token(request, token).send().await?, &format!("user {username}")).await?;
        Ok(())
    }

    async fn delete_user(&self, token: &AuthToken, username: &str) -> Result<(), AccessError> {
        let request = self.http.delete(self.data_url(&format!("/users/{username}")));
        Self::check(Self::with_token(request, token).send().await?, &format!("user {username}")).await?;
        Ok(())
    }

    async fn grant_connection(
        &self,
        token: &AuthToken,
        username: &str,
        connection_id: &str,
        permission: Permission,
    ) -> Result<(), AccessError> {
        let patch = json!([{
            "op": "add",
            "path": format!("/connectionPermissions/{connection_id}"),
            "value": permission.as_str(),
        }]);

        let request = self
            .http
            .patch(self.data_url(&format!("/users/{username}/permissions")))
            .json(&patch);
        Self::check(
            Self::with_token(request, token).send().await?,
            &format!("permissions of user {username}"),
        )
        .await?;
        Ok(())
    }
}
