//! Address discovery over the mock command channel.

use range_devkit::test_utils::PRIMARY_ADDRESS;
use range_devkit::{MockRemoteShell, TestHarness};
use range_orchestrator::discovery::NetworkDiscovery;
use std::net::Ipv4Addr;
use std::sync::Arc;

fn discovery(harness: &TestHarness, shell: &Arc<MockRemoteShell>) -> NetworkDiscovery {
    NetworkDiscovery::new(shell.clone(), harness.config.discovery.clone())
}

#[tokio::test]
async fn test_address_found_on_owning_host() {
    let harness = TestHarness::new().unwrap();
    let shell = Arc::new(MockRemoteShell::new());
    shell.set_address(2001, Ipv4Addr::new(192, 168, 1, 41));
    let pool = harness.config.host_pool();

    let ip = discovery(&harness, &shell).discover_ip(&pool[0], 2001).await;

    assert_eq!(ip, Some(Ipv4Addr::new(192, 168, 1, 41)));
    let commands = shell.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].0, PRIMARY_ADDRESS);
    assert_eq!(commands[0].1, "pct exec 2001 -- ip -4 addr show");
}

#[tokio::test]
async fn test_polls_until_lease_appears() {
    let harness = TestHarness::new().unwrap();
    let shell = Arc::new(MockRemoteShell::new());
    shell.set_address(2002, Ipv4Addr::new(147, 12, 3, 4));
    shell.delay_address(2002, 3);
    let pool = harness.config.host_pool();

    let ip = discovery(&harness, &shell).discover_ip(&pool[0], 2002).await;

    assert_eq!(ip, Some(Ipv4Addr::new(147, 12, 3, 4)));
    assert_eq!(shell.commands().len(), 4);
}

#[tokio::test]
async fn test_address_outside_prefixes_is_ignored() {
    let harness = TestHarness::new().unwrap();
    let shell = Arc::new(MockRemoteShell::new());
    shell.set_address(2003, Ipv4Addr::new(10, 20, 0, 5));
    let pool = harness.config.host_pool();

    let ip = discovery(&harness, &shell).discover_ip(&pool[0], 2003).await;

    assert_eq!(ip, None);
}

#[tokio::test]
async fn test_unreachable_host_is_a_soft_failure() {
    let harness = TestHarness::new().unwrap();
    let shell = Arc::new(MockRemoteShell::new());
    shell.set_address(2004, Ipv4Addr::new(192, 168, 1, 44));
    shell.make_unreachable(PRIMARY_ADDRESS);
    let pool = harness.config.host_pool();

    let ip = discovery(&harness, &shell).discover_ip(&pool[0], 2004).await;

    assert_eq!(ip, None);
    assert!(shell.commands().len() > 1);
}
