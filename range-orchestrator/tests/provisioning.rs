//! Clone/start batches on the mock fleet.

use range_devkit::test_utils::{PRIMARY_HOST, PRIMARY_TEMPLATE, SECONDARY_HOST};
use range_devkit::TestHarness;
use range_orchestrator::models::{FailureStage, InstanceState, RunState};
use range_orchestrator::provision::{ProtectionGuard, Provisioner};
use range_orchestrator::OrchestratorError;
use std::time::Duration;

fn provisioner(harness: &TestHarness) -> Provisioner {
    Provisioner::new(harness.compute.clone(), harness.config.provisioning.clone())
}

#[tokio::test]
async fn test_batch_ids_and_hostnames() {
    let harness = TestHarness::new().unwrap();
    harness.compute.add_instance(SECONDARY_HOST, 2500, "globex-1", RunState::Running);
    let provisioner = provisioner(&harness);
    let pool = harness.config.host_pool();
    let host = &pool[0];

    let template = provisioner.find_template(host).await.unwrap();
    let batch = provisioner.clone_and_start(host, &pool, &template, "acme", 3).await.unwrap();

    let ids: Vec<u32> = batch.started.iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![2502, 2503, 2504]);
    let names: Vec<&str> = batch.started.iter().map(|i| i.hostname.as_str()).collect();
    assert_eq!(names, vec!["acme-1", "acme-2", "acme-3"]);
    assert!(batch.started.iter().all(|i| i.state == InstanceState::Started));
    assert!(batch.failures.is_empty());
    assert_eq!(harness.compute.started(), vec![2502, 2503, 2504]);

    let calls = harness.compute.clone_calls();
    assert_eq!(calls[0].description, "VM for acme account 1");
    assert!(!calls[0].full);
    assert_eq!(calls[0].target, PRIMARY_HOST);
}

#[tokio::test]
async fn test_template_protection_restored() {
    let harness = TestHarness::new().unwrap();
    let provisioner = provisioner(&harness);
    let pool = harness.config.host_pool();

    let template = provisioner.find_template(&pool[0]).await.unwrap();
    provisioner.clone_and_start(&pool[0], &pool, &template, "acme", 2).await.unwrap();

    assert_eq!(
        harness.compute.protection_changes(),
        vec![(PRIMARY_TEMPLATE, false), (PRIMARY_TEMPLATE, true)]
    );
    assert!(harness.compute.is_protected(PRIMARY_HOST, PRIMARY_TEMPLATE));
}

#[tokio::test]
async fn test_unprotected_template_left_alone() {
    let harness = TestHarness::new().unwrap();
    let provisioner = provisioner(&harness);
    let pool = harness.config.host_pool();

    let template = provisioner.find_template(&pool[1]).await.unwrap();
    let batch = provisioner.clone_and_start(&pool[1], &pool, &template, "acme", 1).await.unwrap();

    assert_eq!(batch.started.len(), 1);
    assert!(harness.compute.protection_changes().is_empty());
}

#[tokio::test]
async fn test_dropped_guard_restores_protection() {
    let harness = TestHarness::new().unwrap();

    let guard = ProtectionGuard::lift(harness.compute.clone(), PRIMARY_HOST, PRIMARY_TEMPLATE)
        .await
        .unwrap();
    assert!(guard.is_armed());
    assert!(!harness.compute.is_protected(PRIMARY_HOST, PRIMARY_TEMPLATE));

    drop(guard);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(harness.compute.is_protected(PRIMARY_HOST, PRIMARY_TEMPLATE));
}

#[tokio::test]
async fn test_clone_gives_up_after_five_locked_attempts() {
    let harness = TestHarness::new().unwrap();
    harness.compute.fail_next_clones_locked(100);
    let provisioner = provisioner(&harness);
    let pool = harness.config.host_pool();

    let template = provisioner.find_template(&pool[0]).await.unwrap();
    let batch = provisioner.clone_and_start(&pool[0], &pool, &template, "acme", 1).await.unwrap();

    assert_eq!(harness.compute.clone_calls().len(), 5);
    assert!(batch.started.is_empty());
    assert_eq!(batch.failures.len(), 1);
    assert_eq!(batch.failures[0].stage, FailureStage::Clone);
    assert_eq!(batch.failures[0].entity, "acme-1");
    assert!(batch.failures[0].detail.contains("is locked"));
    assert!(harness.compute.is_protected(PRIMARY_HOST, PRIMARY_TEMPLATE));
}

#[tokio::test]
async fn test_locked_clone_recovers() {
    let harness = TestHarness::new().unwrap();
    harness.compute.fail_next_clones_locked(2);
    let provisioner = provisioner(&harness);
    let pool = harness.config.host_pool();

    let template = provisioner.find_template(&pool[0]).await.unwrap();
    let batch = provisioner.clone_and_start(&pool[0], &pool, &template, "acme", 2).await.unwrap();

    // 3 attempts for acme-1, 1 for acme-2
    assert_eq!(harness.compute.clone_calls().len(), 4);
    assert_eq!(batch.started.len(), 2);
    assert!(batch.failures.is_empty());
}

#[tokio::test]
async fn test_partial_failures_do_not_stop_the_batch() {
    let harness = TestHarness::new().unwrap();
    harness.compute.fail_clone_of("acme-2");
    harness.compute.fail_start_of(2003);
    let provisioner = provisioner(&harness);
    let pool = harness.config.host_pool();

    let template = provisioner.find_template(&pool[0]).await.unwrap();
    let batch = provisioner.clone_and_start(&pool[0], &pool, &template, "acme", 4).await.unwrap();

    let started: Vec<&str> = batch.started.iter().map(|i| i.hostname.as_str()).collect();
    assert_eq!(started, vec!["acme-1", "acme-4"]);
    // a failed clone is not retried
    assert_eq!(harness.compute.clone_calls().len(), 4);

    let failures: Vec<(&str, FailureStage)> = batch.failures.iter().map(|f| (f.entity.as_str(), f.stage)).collect();
    assert_eq!(failures, vec![("acme-2", FailureStage::Clone), ("acme-3", FailureStage::Start)]);
    assert_eq!(batch.failures[1].id, Some(2003));
}

#[tokio::test]
async fn test_start_waits_for_clone_lock() {
    let harness = TestHarness::new().unwrap();
    harness.compute.lock_clones_for(3);
    let provisioner = provisioner(&harness);
    let pool = harness.config.host_pool();

    let template = provisioner.find_template(&pool[0]).await.unwrap();
    let batch = provisioner.clone_and_start(&pool[0], &pool, &template, "acme", 2).await.unwrap();

    assert_eq!(batch.started.len(), 2);
    assert_eq!(harness.compute.started(), vec![2001, 2002]);
}

#[tokio::test]
async fn test_start_fails_when_lock_never_clears() {
    let harness = TestHarness::new().unwrap();
    harness.compute.lock_clones_for(u32::MAX);
    let provisioner = provisioner(&harness);
    let pool = harness.config.host_pool();

    let template = provisioner.find_template(&pool[0]).await.unwrap();
    let batch = provisioner.clone_and_start(&pool[0], &pool, &template, "acme", 1).await.unwrap();

    assert!(batch.started.is_empty());
    assert_eq!(batch.failures[0].stage, FailureStage::Start);
    assert!(batch.failures[0].detail.contains("timed out"));
    assert!(harness.compute.started().is_empty());
}

#[tokio::test]
async fn test_missing_template_aborts() {
    let harness = TestHarness::new().unwrap();
    harness.compute.remove_instance(PRIMARY_HOST, PRIMARY_TEMPLATE);

    let err = harness.orchestrator().create_for_tenant("acme", 1).await.unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::TemplateNotFound { ref host, template_id: 103 } if host == "pve1"
    ));
    assert!(harness.compute.clone_calls().is_empty());
}

#[tokio::test]
async fn test_listing_failure_aborts_id_allocation() {
    let harness = TestHarness::new().unwrap();
    harness.compute.fail_listing_of(SECONDARY_HOST);
    let provisioner = provisioner(&harness);
    let pool = harness.config.host_pool();

    let err = provisioner.allocate_base_id(&pool).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::IdentityAllocation { ref host, .. } if host == "pve2"));
}

#[tokio::test]
async fn test_unavailable_host_still_holds_ids() {
    let harness = TestHarness::new().unwrap();
    harness.compute.add_instance(SECONDARY_HOST, 2500, "globex-1", RunState::Running);
    let provisioner = provisioner(&harness);
    let mut pool = harness.config.host_pool();
    pool[1].available = false;

    assert_eq!(provisioner.allocate_base_id(&pool).await.unwrap(), 2501);
}
