/*!
Mock du canal de commandes distantes (SSH)

Répond à `pct exec <id> -- ip -4 addr show` avec une sortie `ip` réaliste
pour les conteneurs dont l'adresse est connue. Une adresse peut n'apparaître
qu'après quelques lectures (bail DHCP en cours).
*/

use async_trait::async_trait;
use range_orchestrator::models::InstanceId;
use range_orchestrator::remote::{CommandOutput, RemoteError, RemoteShell};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    addresses: HashMap<InstanceId, Ipv4Addr>,
    empty_reads: HashMap<InstanceId, u32>,
    unreachable: HashSet<String>,
    commands: Vec<(String, String)>,
}

#[derive(Default)]
pub struct MockRemoteShell {
    inner: Mutex<Inner>,
}

/// Sortie de `ip -4 addr show` avec loopback + eth0
pub fn interface_listing(ip: Ipv4Addr) -> String {
    format!(
        "1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN group default qlen 1000\n\
         \x20   inet 127.0.0.1/8 scope host lo\n\
         \x20      valid_lft forever preferred_lft forever\n\
         2: eth0@if42: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP group default qlen 1000\n\
         \x20   inet {ip}/24 brd 192.168.1.255 scope global dynamic eth0\n\
         \x20      valid_lft 86391sec preferred_lft 86391sec\n"
    )
}

/// Extrait l'id de `pct exec <id> -- ...`
fn instance_id(command: &str) -> Option<InstanceId> {
    command
        .strip_prefix("pct exec ")?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

impl MockRemoteShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_address(&self, id: InstanceId, ip: Ipv4Addr) {
        self.inner.lock().unwrap().addresses.insert(id, ip);
    }

    /// L'adresse n'apparaît qu'après `reads` lectures sans bail
    pub fn delay_address(&self, id: InstanceId, reads: u32) {
        self.inner.lock().unwrap().empty_reads.insert(id, reads);
    }

    /// Connexion SSH refusée vers cette adresse d'hôte
    pub fn make_unreachable(&self, host: &str) {
        self.inner.lock().unwrap().unreachable.insert(host.to_string());
    }

    /// (hôte, commande) dans l'ordre d'exécution
    pub fn commands(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().commands.clone()
    }
}

#[async_trait]
impl RemoteShell for MockRemoteShell {
    async fn exec(&self, host: &str, command: &str) -> Result<CommandOutput, RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        inner.commands.push((host.to_string(), command.to_string()));

        if inner.unreachable.contains(host) {
            return Err(RemoteError::Connect {
                host: host.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused"),
            });
        }

        let Some(id) = instance_id(command) else {
            return Ok(CommandOutput {
                output: format!("unknown command: {command}"),
                exit_status: 127,
            });
        };

        if let Some(remaining) = inner.empty_reads.get_mut(&id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(CommandOutput {
                    output: interface_listing(Ipv4Addr::LOCALHOST)
                        .lines()
                        .take(3)
                        .collect::<Vec<_>>()
                        .join("\n"),
                    exit_status: 0,
                });
            }
        }

        match inner.addresses.get(&id) {
            Some(ip) => Ok(CommandOutput {
                output: interface_listing(*ip),
                exit_status: 0,
            }),
            None => Ok(CommandOutput {
                output: format!("Configuration file 'nodes/pve/lxc/{id}.conf' does not exist"),
                exit_status: 255,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_from_command() {
        assert_eq!(instance_id("pct exec 2001 -- ip -4 addr show"), Some(2001));
        assert_eq!(instance_id("uptime"), None);
    }
}
