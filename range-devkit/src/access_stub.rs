/*!
Mock du service d'accès (API Guacamole) en mémoire

Utilisateurs, connexions et permissions gardés dans des maps. Un token est
délivré à chaque authentification et vérifié sur chaque appel, comme le
ferait le vrai service.
*/

use async_trait::async_trait;
use range_orchestrator::access::{
    AccessApi, AccessConnection, AccessError, AccessUser, AuthToken, ConnectionSpec, Permission,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct MockConnection {
    pub name: String,
    pub hostname: String,
    pub protocol: String,
    pub port: u16,
}

#[derive(Debug, Default)]
struct Inner {
    users: BTreeMap<String, String>,
    connections: BTreeMap<String, MockConnection>,
    grants: BTreeSet<(String, String, Permission)>,
    next_id: u32,
    tokens: HashSet<String>,
    auth_fails: bool,
    failing_users: HashSet<String>,
    connection_creations: u32,
    user_creations: u32,
    grant_calls: u32,
}

impl Inner {
    fn check(&self, token: &AuthToken) -> Result<(), AccessError> {
        if self.tokens.contains(token.as_str()) {
            Ok(())
        } else {
            Err(AccessError::Auth("invalid token".to_string()))
        }
    }

    fn add_connection(&mut self, name: &str, hostname: &str, protocol: &str, port: u16) -> String {
        self.next_id += 1;
        let id = self.next_id.to_string();
        self.connections.insert(
            id.clone(),
            MockConnection {
                name: name.to_string(),
                hostname: hostname.to_string(),
                protocol: protocol.to_string(),
                port,
            },
        );
        id
    }

    fn connection_id(&self, name: &str) -> Option<String> {
        self.connections
            .iter()
            .find(|(_, c)| c.name == name)
            .map(|(id, _)| id.clone())
    }
}

#[derive(Default)]
pub struct MockAccessApi {
    inner: Mutex<Inner>,
}

impl MockAccessApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connexion existante (créée avant le run)
    pub fn add_connection(&self, name: &str, hostname: &str) -> String {
        self.inner.lock().unwrap().add_connection(name, hostname, "rdp", 3389)
    }

    pub fn add_user(&self, name: &str, password: &str) {
        self.inner.lock().unwrap().users.insert(name.to_string(), password.to_string());
    }

    pub fn add_grant(&self, user: &str, connection_name: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(id) = inner.connection_id(connection_name) {
            inner.grants.insert((user.to_string(), id, Permission::Read));
        }
    }

    /// Toutes les authentifications échouent
    pub fn fail_authentication(&self) {
        self.inner.lock().unwrap().auth_fails = true;
    }

    /// La création de cet utilisateur échoue
    pub fn fail_user_creation(&self, name: &str) {
        self.inner.lock().unwrap().failing_users.insert(name.to_string());
    }

    /// Suppression hors bande d'une connexion (sans toucher à l'utilisateur)
    pub fn remove_connection_out_of_band(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(id) = inner.connection_id(name) {
            inner.connections.remove(&id);
            inner.grants.retain(|(_, c, _)| *c != id);
        }
    }

    // Inspection

    pub fn connection_names(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.connections.values().map(|c| c.name.clone()).collect()
    }

    pub fn connection(&self, name: &str) -> Option<MockConnection> {
        let inner = self.inner.lock().unwrap();
        inner.connections.values().find(|c| c.name == name).cloned()
    }

    pub fn usernames(&self) -> Vec<String> {
        self.inner.lock().unwrap().users.keys().cloned().collect()
    }

    pub fn password_of(&self, name: &str) -> Option<String> {
        self.inner.lock().unwrap().users.get(name).cloned()
    }

    /// Arêtes (utilisateur, nom de connexion)
    pub fn grants(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock().unwrap();
        inner
            .grants
            .iter()
            .filter_map(|(user, id, _)| inner.connections.get(id).map(|c| (user.clone(), c.name.clone())))
            .collect()
    }

    pub fn connection_creations(&self) -> u32 {
        self.inner.lock().unwrap().connection_creations
    }

    pub fn user_creations(&self) -> u32 {
        self.inner.lock().unwrap().user_creations
    }

    pub fn grant_calls(&self) -> u32 {
        self.inner.lock().unwrap().grant_calls
    }

    pub fn tokens_issued(&self) -> usize {
        self.inner.lock().unwrap().tokens.len()
    }
}

#[async_trait]
impl AccessApi for MockAccessApi {
    async fn authenticate(&self) -> Result<AuthToken, AccessError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.auth_fails {
            return Err(AccessError::Auth("token exchange returned 403: Permission Denied.".to_string()));
        }
        let token = format!("mock-token-{}", inner.tokens.len() + 1);
        inner.tokens.insert(token.clone());
        log::info!("🔑 [MOCK] Issued {}", token);
        Ok(AuthToken::new(token))
    }

    async fn list_connections(&self, token: &AuthToken) -> Result<Vec<AccessConnection>, AccessError> {
        let inner = self.inner.lock().unwrap();
        inner.check(token)?;
        Ok(inner
            .connections
            .iter()
            .map(|(id, c)| AccessConnection {
                identifier: id.clone(),
                name: c.name.clone(),
            })
            .collect())
    }

    async fn create_connection(&self, token: &AuthToken, spec: &ConnectionSpec) -> Result<String, AccessError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(token)?;
        inner.connection_creations += 1;
        let id = inner.add_connection(&spec.name, &spec.hostname, &spec.protocol, spec.port);
        log::info!("🔌 [MOCK] Connection {} created ({})", spec.name, id);
        Ok(id)
    }

    async fn delete_connection(&self, token: &AuthToken, identifier: &str) -> Result<(), AccessError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(token)?;
        if inner.connections.remove(identifier).is_none() {
            return Err(AccessError::NotFound {
                what: format!("connection id {identifier}"),
            });
        }
        inner.grants.retain(|(_, c, _)| c != identifier);
        Ok(())
    }

    async fn get_user(&self, token: &AuthToken, username: &str) -> Result<Option<AccessUser>, AccessError> {
        let inner = self.inner.lock().unwrap();
        inner.check(token)?;
        Ok(inner.users.contains_key(username).then(|| AccessUser {
            username: username.to_string(),
        }))
    }

    async fn create_user(&self, token: &AuthToken, username: &str, password: &str) -> Result<(), AccessError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(token)?;
        if inner.failing_users.contains(username) {
            return Err(AccessError::Api {
                status: 500,
                detail: format!("cannot create user {username}"),
            });
        }
        if inner.users.contains_key(username) {
            return Err(AccessError::Api {
                status: 400,
                detail: format!("User \"{username}\" already exists."),
            });
        }
        inner.user_creations += 1;
        inner.users.insert(username.to_string(), password.to_string());
        Ok(())
    }

    async fn delete_user(&self, token: &AuthToken, username: &str) -> Result<(), AccessError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(token)?;
        if inner.users.remove(username).is_none() {
            return Err(AccessError::NotFound {
                what: format!("user {username}"),
            });
        }
        inner.grants.retain(|(u, _, _)| u != username);
        Ok(())
    }

    async fn grant_connection(
        &self,
        token: &AuthToken,
        username: &str,
        connection_id: &str,
        permission: Permission,
    ) -> Result<(), AccessError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(token)?;
        inner.grant_calls += 1;
        if !inner.users.contains_key(username) {
            return Err(AccessError::NotFound {
                what: format!("user {username}"),
            });
        }
        if !inner.connections.contains_key(connection_id) {
            return Err(AccessError::NotFound {
                what: format!("connection id {connection_id}"),
            });
        }
        // set semantics: an existing edge is kept as is
        inner
            .grants
            .insert((username.to_string(), connection_id.to_string(), permission));
        Ok(())
    }
}
