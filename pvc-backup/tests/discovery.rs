#![cfg(feature = "test-utils")]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pvc_backup::catalog::{
    DiscoveryError, DiscoveryScope, DiscoveryStage, OwnerCandidate, OwnerResolution,
    VolumeCatalog, annotate_last_success,
};
use pvc_backup::test_utils::{FakeK8sClient, claim, controller, pod};
use pvc_backup_telemetry::init_test_tracing;

const BUDGET: Duration = Duration::from_secs(5);

fn catalog(client: &Arc<FakeK8sClient>) -> VolumeCatalog {
    VolumeCatalog::new(client.clone(), 100)
}

/// `apps/data-pvc` mounted by a pod of Deployment `web` through ReplicaSet `web-abc`.
fn web_deployment(client: &FakeK8sClient) {
    client.add_claim(claim("apps", "data-pvc"));
    client.add_pod(pod(
        "apps",
        "web-abc-123",
        &["data-pvc"],
        Some(("ReplicaSet", "web-abc")),
    ));
    client.add_owner("apps", "ReplicaSet", "web-abc", vec![controller("Deployment", "web")]);
    client.add_owner("apps", "Deployment", "web", vec![]);
}

#[tokio::test]
async fn test_owner_chain_resolves_to_deployment() {
    init_test_tracing();

    let client = Arc::new(FakeK8sClient::new());
    web_deployment(&client);

    let records = catalog(&client)
        .discover(DiscoveryScope::AllNamespaces, BUDGET)
        .await
        .unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].qualified_name(), "apps/data-pvc");
    assert_eq!(
        records[0].owner,
        OwnerResolution::Resolved(OwnerCandidate::new("Deployment", "web"))
    );
    assert_eq!(records[0].capacity.as_deref(), Some("1Gi"));
}

#[tokio::test]
async fn test_claim_without_pods_is_unknown() {
    init_test_tracing();

    let client = Arc::new(FakeK8sClient::new());
    client.add_claim(claim("apps", "orphan"));

    let records = catalog(&client)
        .discover(DiscoveryScope::AllNamespaces, BUDGET)
        .await
        .unwrap();

    assert_eq!(records[0].owner, OwnerResolution::Unknown);
}

#[tokio::test]
async fn test_distinct_controllers_are_ambiguous() {
    init_test_tracing();

    let client = Arc::new(FakeK8sClient::new());
    web_deployment(&client);
    client.add_pod(pod(
        "apps",
        "db-0",
        &["data-pvc"],
        Some(("StatefulSet", "db")),
    ));
    client.add_pod(pod(
        "apps",
        "db-1",
        &["data-pvc"],
        Some(("StatefulSet", "db")),
    ));
    client.add_owner("apps", "StatefulSet", "db", vec![]);

    let records = catalog(&client)
        .discover(DiscoveryScope::AllNamespaces, BUDGET)
        .await
        .unwrap();

    assert_eq!(
        records[0].owner,
        OwnerResolution::Ambiguous(vec![
            OwnerCandidate::new("Deployment", "web"),
            OwnerCandidate::new("StatefulSet", "db"),
        ])
    );
}

#[tokio::test]
async fn test_bare_pod_owns_its_claim() {
    init_test_tracing();

    let client = Arc::new(FakeK8sClient::new());
    client.add_claim(claim("tools", "scratch"));
    client.add_pod(pod("tools", "debug", &["scratch"], None));

    let records = catalog(&client)
        .discover(DiscoveryScope::AllNamespaces, BUDGET)
        .await
        .unwrap();

    assert_eq!(
        records[0].owner,
        OwnerResolution::Resolved(OwnerCandidate::new("Pod", "debug"))
    );
}

#[tokio::test]
async fn test_missing_owner_object_truncates_without_failing() {
    init_test_tracing();

    let client = Arc::new(FakeK8sClient::new());
    client.add_claim(claim("apps", "data-pvc"));
    client.add_claim(claim("apps", "logs"));
    // The ReplicaSet was deleted while its pod lingers.
    client.add_pod(pod(
        "apps",
        "web-old-1",
        &["data-pvc"],
        Some(("ReplicaSet", "web-old")),
    ));

    let records = catalog(&client)
        .discover(DiscoveryScope::AllNamespaces, BUDGET)
        .await
        .unwrap();

    assert_eq!(records.len(), 2);
    assert!(
        records
            .iter()
            .all(|record| record.owner == OwnerResolution::Unknown)
    );
}

#[tokio::test]
async fn test_unfetchable_kind_ends_the_chain() {
    init_test_tracing();

    let client = Arc::new(FakeK8sClient::new());
    client.add_claim(claim("ml", "weights"));
    client.add_pod(pod(
        "ml",
        "trainer-0",
        &["weights"],
        Some(("TrainingRun", "nightly")),
    ));

    let records = catalog(&client)
        .discover(DiscoveryScope::AllNamespaces, BUDGET)
        .await
        .unwrap();

    assert_eq!(
        records[0].owner,
        OwnerResolution::Resolved(OwnerCandidate::new("TrainingRun", "nightly"))
    );
}

#[tokio::test]
async fn test_forbidden_owner_fetch_aborts_with_stage() {
    init_test_tracing();

    let client = Arc::new(FakeK8sClient::new());
    web_deployment(&client);
    client.fail_owner_fetch("ReplicaSet", "web-abc", 403);

    let err = catalog(&client)
        .discover(DiscoveryScope::AllNamespaces, BUDGET)
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(DiscoveryStage::OwnerFetch));
    assert!(matches!(err, DiscoveryError::Api { .. }));
    assert!(err.to_string().contains("owner fetch"));
}

#[tokio::test(start_paused = true)]
async fn test_slow_pod_list_times_out_naming_the_stage() {
    init_test_tracing();

    let client = Arc::new(FakeK8sClient::new());
    web_deployment(&client);
    client.set_list_pods_delay(Duration::from_secs(30));

    let err = catalog(&client)
        .discover(DiscoveryScope::AllNamespaces, BUDGET)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DiscoveryError::Timeout {
            stage: DiscoveryStage::PodList
        }
    ));
    assert_eq!(
        err.to_string(),
        "discovery exceeded its time budget during pod list"
    );
}

#[tokio::test]
async fn test_namespace_scan_limit_is_enforced() {
    init_test_tracing();

    let client = Arc::new(FakeK8sClient::new());
    client.add_claim(claim("a", "one"));
    client.add_claim(claim("b", "two"));
    let catalog = VolumeCatalog::new(client.clone(), 1);

    let err = catalog
        .discover(DiscoveryScope::AllNamespaces, BUDGET)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DiscoveryError::ScanLimitExceeded {
            requested: 2,
            limit: 1
        }
    ));

    let err = catalog
        .discover(
            DiscoveryScope::from_filter(["a", "b"]),
            BUDGET,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::ScanLimitExceeded { .. }));

    let records = catalog
        .discover(DiscoveryScope::from_filter(["b"]), BUDGET)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "two");
}

#[tokio::test]
async fn test_results_are_sorted_and_annotated() {
    init_test_tracing();

    let client = Arc::new(FakeK8sClient::new());
    client.add_claim(claim("zeta", "a"));
    client.add_claim(claim("alpha", "b"));
    client.add_claim(claim("alpha", "a"));

    let mut records = catalog(&client)
        .discover(DiscoveryScope::AllNamespaces, BUDGET)
        .await
        .unwrap();
    let names: Vec<String> = records.iter().map(|r| r.qualified_name()).collect();
    assert_eq!(names, ["alpha/a", "alpha/b", "zeta/a"]);

    let backed_up_at = Utc::now();
    let history = HashMap::from([(("alpha".to_owned(), "b".to_owned()), backed_up_at)]);
    annotate_last_success(&mut records, &history);

    assert_eq!(records[0].last_successful_backup_at, None);
    assert_eq!(records[1].last_successful_backup_at, Some(backed_up_at));
}

#[tokio::test]
async fn test_summary_counts_objects() {
    init_test_tracing();

    let client = Arc::new(FakeK8sClient::new());
    web_deployment(&client);
    client.add_claim(claim("db", "pg-data"));

    let summary = catalog(&client).summary(BUDGET).await.unwrap();

    assert_eq!(summary.namespaces, 2);
    assert_eq!(summary.pods, 1);
    assert_eq!(summary.claims, 2);
}
