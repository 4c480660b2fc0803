//! Network discovery
//!
//! Asks the owning host for the instance's interface listing over the remote
//! command channel until an address matching the configured prefixes shows
//! up. Not finding one is a soft failure: the caller gets `None`.

use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::models::{Host, InstanceId};
use crate::poll::poll_until;
use crate::remote::RemoteShell;

static INET_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"inet\s+(\d+\.\d+\.\d+\.\d+)").expect("valid inet pattern"));

/// Interface listing command, run on the host that owns the instance.
pub fn listing_command(id: InstanceId) -> String {
    format!("pct exec {id} -- ip -4 addr show")
}

/// First `inet` address accepted by `prefixes`; loopback is never accepted.
///
/// An empty prefix list accepts any address.
pub fn extract_ipv4(output: &str, prefixes: &[String]) -> Option<Ipv4Addr> {
    INET_PATTERN
        .captures_iter(output)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|ip| prefixes.is_empty() || prefixes.iter().any(|p| ip.starts_with(p.as_str())))
        .filter_map(|ip| ip.parse::<Ipv4Addr>().ok())
        .find(|ip| !ip.is_loopback())
}

pub struct NetworkDiscovery {
    shell: Arc<dyn RemoteShell>,
    cfg: DiscoveryConfig,
}

impl NetworkDiscovery {
    pub fn new(shell: Arc<dyn RemoteShell>, cfg: DiscoveryConfig) -> Self {
        Self { shell, cfg }
    }

    /// Poll until the instance reports an address, or give up with `None`.
    pub async fn discover_ip(&self, host: &Host, id: InstanceId) -> Option<Ipv4Addr> {
        let shell = &self.shell;
        let prefixes = self.cfg.address_prefixes.as_slice();
        let address = host.address.as_str();
        let command = listing_command(id);
        let command = command.as_str();

        let found = poll_until(&self.cfg.poll, &format!("address of instance {id}"), move || async move {
            match shell.exec(address, command).await {
                Ok(out) => {
                    let ip = extract_ipv4(&out.output, prefixes);
                    if ip.is_none() {
                        debug!("Instance {} has no matching address yet", id);
                    }
                    ip
                }
                Err(e) => {
                    debug!("Interface listing of instance {} on {} failed: {}", id, address, e);
                    None
                }
            }
        })
        .await;

        match found {
            Ok(ip) => {
                info!("Instance {} has address {}", id, ip);
                Some(ip)
            }
            Err(e) => {
                warn!("No address found for instance {} on {}: {}", id, host.name, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN group default qlen 1000
    inet 127.0.0.1/8 scope host lo
       valid_lft forever preferred_lft forever
2: eth0@if41: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP group default qlen 1000 link-netnsid 0
    inet 10.0.3.5/24 brd 10.0.3.255 scope global eth0
       valid_lft forever preferred_lft forever
3: eth1@if42: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP group default qlen 1000 link-netnsid 0
    inet 147.16.16.201/22 brd 147.16.19.255 scope global dynamic eth1
";

    fn prefixes() -> Vec<String> {
        vec!["147.".into(), "192.".into()]
    }

    #[test]
    fn test_extract_first_matching_prefix() {
        assert_eq!(extract_ipv4(LISTING, &prefixes()), Some(Ipv4Addr::new(147, 16, 16, 201)));
    }

    #[test]
    fn test_no_matching_address() {
        let out = "    inet 10.0.3.5/24 brd 10.0.3.255 scope global eth0\n";
        assert_eq!(extract_ipv4(out, &prefixes()), None);
        assert_eq!(extract_ipv4("", &prefixes()), None);
    }

    #[test]
    fn test_empty_prefixes_skip_loopback() {
        assert_eq!(extract_ipv4(LISTING, &[]), Some(Ipv4Addr::new(10, 0, 3, 5)));
    }

    #[test]
    fn test_inet_pattern_compiles() {
        assert!(INET_PATTERN.is_match("inet 10.0.0.1/24"));
    }

    #[test]
    fn test_listing_command() {
        assert_eq!(listing_command(2001), "pct exec 2001 -- ip -4 addr show");
    }
}
