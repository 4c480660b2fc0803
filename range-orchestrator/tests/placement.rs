//! Host selection against the mock fleet.

use range_devkit::{snapshot, MockComputeApi, TestHarness};
use range_orchestrator::config::PlacementConfig;
use range_orchestrator::models::Host;
use range_orchestrator::scorer::select_best_host;
use range_orchestrator::OrchestratorError;

fn host(name: &str) -> Host {
    Host {
        name: name.to_string(),
        address: format!("{name}.lab"),
        template_id: 103,
        available: true,
    }
}

#[tokio::test]
async fn test_ineligible_disk_host_is_skipped() {
    let compute = MockComputeApi::new();
    // pve1 has more free memory but only 10 GiB of disk
    compute.add_host("pve1", snapshot(0.1, 48, 10));
    compute.add_host("pve2", snapshot(0.3, 16, 300));
    let mut hosts = vec![host("pve1"), host("pve2")];

    let best = select_best_host(&compute, &mut hosts, &PlacementConfig::default()).await;

    assert_eq!(best.map(|h| h.name), Some("pve2".to_string()));
    assert!(hosts.iter().all(|h| h.available));
}

#[tokio::test]
async fn test_highest_score_wins() {
    let compute = MockComputeApi::new();
    compute.add_host("pve1", snapshot(0.1, 16, 300));
    compute.add_host("pve2", snapshot(0.1, 32, 300));
    compute.add_host("pve3", snapshot(0.1, 24, 300));
    let mut hosts = vec![host("pve1"), host("pve2"), host("pve3")];

    let best = select_best_host(&compute, &mut hosts, &PlacementConfig::default()).await;

    assert_eq!(best.map(|h| h.name), Some("pve2".to_string()));
}

#[tokio::test]
async fn test_tie_keeps_earliest_host() {
    let compute = MockComputeApi::new();
    compute.add_host("pve1", snapshot(0.2, 32, 300));
    compute.add_host("pve2", snapshot(0.2, 32, 300));
    let mut hosts = vec![host("pve1"), host("pve2")];

    let best = select_best_host(&compute, &mut hosts, &PlacementConfig::default()).await;

    assert_eq!(best.map(|h| h.name), Some("pve1".to_string()));
}

#[tokio::test]
async fn test_no_eligible_host() {
    let compute = MockComputeApi::new();
    compute.add_host("pve1", snapshot(0.95, 48, 300)); // CPU saturated
    compute.add_host("pve2", snapshot(0.1, 1, 300)); // memory below 2 GiB
    let mut hosts = vec![host("pve1"), host("pve2")];

    let best = select_best_host(&compute, &mut hosts, &PlacementConfig::default()).await;

    assert!(best.is_none());
}

#[tokio::test]
async fn test_unreachable_host_marked_unavailable() {
    let compute = MockComputeApi::new();
    compute.add_unreachable_host("pve1");
    compute.add_host("pve2", snapshot(0.5, 8, 100));
    let mut hosts = vec![host("pve1"), host("pve2")];

    let best = select_best_host(&compute, &mut hosts, &PlacementConfig::default()).await;

    assert_eq!(best.map(|h| h.name), Some("pve2".to_string()));
    assert!(!hosts[0].available);
    assert!(hosts[1].available);
}

#[tokio::test]
async fn test_create_without_capacity_has_no_side_effects() {
    let harness = TestHarness::new().unwrap();
    harness.compute.set_snapshot("pve1", Some(snapshot(0.1, 48, 5)));
    harness.compute.set_snapshot("pve2", None);

    let err = harness.orchestrator().create_for_tenant("acme", 2).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::NoCapacity));
    assert!(harness.compute.clone_calls().is_empty());
    assert!(harness.compute.protection_changes().is_empty());
    assert_eq!(harness.access.tokens_issued(), 0);
    assert!(harness.read_manifest("acme").is_none());
}
