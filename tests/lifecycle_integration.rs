//! Lifecycle integration tests
//!
//! Drives the state machine and rebalancer against the in-memory store and
//! serving backend, checking both the stored statuses and the deployments.

#[allow(dead_code)]
mod common;

use canaria::lifecycle::RebalanceMode;
use canaria::store::list_runs;
use canaria::types::{ModelStatus, NewRun};
use canaria::CanariaError;
use common::*;
use std::collections::BTreeMap;
use std::time::Duration;

fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

// =============================================================================
// Rebalance
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_promote_then_narrow() {
    let h = Harness::new();
    h.seed("r1", ModelStatus::New, 0.0).await;
    h.seed("r2", ModelStatus::New, 0.0).await;

    let report = h
        .rebalancer
        .rebalance(&weights(&[("r1", 2.0), ("r2", 1.0)]), &h.scope, RebalanceMode::Promote)
        .await
        .unwrap();
    assert_eq!(report.succeeded().len(), 2);

    let r1 = h.run("r1").await;
    let r2 = h.run("r2").await;
    assert_eq!(r1.status, ModelStatus::Active);
    assert_eq!(r2.status, ModelStatus::Active);
    assert_fraction(r1.test_fraction, 2.0 / 3.0);
    assert_fraction(r2.test_fraction, 1.0 / 3.0);
    assert!(h.backend.contains(&deployment("r1")));
    assert!(h.backend.contains(&deployment("r2")));

    h.rebalancer
        .rebalance(&weights(&[("r1", 1.0)]), &h.scope, RebalanceMode::Promote)
        .await
        .unwrap();

    let r1 = h.run("r1").await;
    let r2 = h.run("r2").await;
    assert_eq!(r1.status, ModelStatus::Active);
    assert_fraction(r1.test_fraction, 1.0);
    assert_eq!(r2.status, ModelStatus::Disabled);
    assert_eq!(r2.test_fraction, 0.0);

    // r2 stays deployed until the removal delay has passed.
    assert!(h.backend.contains(&deployment("r2")));
    assert!(h.queue.is_pending(&removal_job("r2")));

    tokio::time::sleep(h.reconciler.removal_delay() + Duration::from_secs(1)).await;
    tokio::task::yield_now().await;
    assert!(!h.backend.contains(&deployment("r2")));
    assert!(h.backend.contains(&deployment("r1")));
}

#[tokio::test]
async fn test_live_fractions_sum_to_one() {
    let h = Harness::new();
    for id in ["a", "b", "c", "d"] {
        h.seed(id, ModelStatus::New, 0.0).await;
    }

    h.rebalancer
        .rebalance(
            &weights(&[("a", 5.0), ("b", 3.0), ("c", 0.0), ("d", 2.0)]),
            &h.scope,
            RebalanceMode::Promote,
        )
        .await
        .unwrap();

    let live = list_runs(h.store.as_ref(), &h.scope, Some(ModelStatus::Active))
        .await
        .unwrap();
    let total: f64 = live.iter().map(|r| r.test_fraction).sum();
    assert_eq!(live.len(), 3);
    assert_fraction(total, 1.0);

    let c = h.run("c").await;
    assert_eq!(c.status, ModelStatus::Disabled);
}

#[tokio::test]
async fn test_validation_rejects_before_writing() {
    let h = Harness::new();
    h.seed("r1", ModelStatus::Active, 1.0).await;
    h.seed("other-version", ModelStatus::New, 0.0).await;
    let mut foreign = h.run("other-version").await;
    foreign.version = canaria::types::SemanticVersion::new(9, 0, 0);
    h.store.insert(foreign).await;

    let writes = h.store.write_count();

    let err = h
        .rebalancer
        .rebalance(&weights(&[("r1", 1.0), ("other-version", 1.0)]), &h.scope, RebalanceMode::Promote)
        .await
        .unwrap_err();
    assert!(matches!(err, CanariaError::UnknownRun(ref ids) if ids == &vec!["other-version".to_string()]));

    let err = h
        .rebalancer
        .rebalance(&weights(&[("r1", 0.0)]), &h.scope, RebalanceMode::Promote)
        .await
        .unwrap_err();
    assert!(matches!(err, CanariaError::InvalidWeight(_)));

    let err = h
        .rebalancer
        .rebalance(&weights(&[("r1", -1.0)]), &h.scope, RebalanceMode::Promote)
        .await
        .unwrap_err();
    assert!(matches!(err, CanariaError::InvalidWeight(_)));

    assert_eq!(h.store.write_count(), writes);
    assert_eq!(h.run("r1").await.status, ModelStatus::Active);
}

#[tokio::test]
async fn test_empty_map_drains_scope() {
    let h = Harness::new();
    h.seed("r1", ModelStatus::Active, 0.5).await;
    h.seed("r2", ModelStatus::Canary, 0.5).await;
    h.seed("r3", ModelStatus::New, 0.0).await;

    let report = h
        .rebalancer
        .rebalance(&BTreeMap::new(), &h.scope, RebalanceMode::Promote)
        .await
        .unwrap();
    assert_eq!(report.outcomes.len(), 3);

    for id in ["r1", "r2", "r3"] {
        let run = h.run(id).await;
        assert_eq!(run.status, ModelStatus::Disabled);
        assert_eq!(run.test_fraction, 0.0);
    }
}

#[tokio::test]
async fn test_cohort_keeps_status() {
    let h = Harness::new();
    h.seed("active", ModelStatus::Active, 1.0).await;
    h.seed("c1", ModelStatus::Canary, 0.0).await;
    h.seed("c2", ModelStatus::Canary, 0.0).await;

    h.rebalancer
        .rebalance(
            &weights(&[("c1", 1.0), ("c2", 3.0)]),
            &h.scope,
            RebalanceMode::Cohort(ModelStatus::Canary),
        )
        .await
        .unwrap();

    let c1 = h.run("c1").await;
    let c2 = h.run("c2").await;
    assert_eq!(c1.status, ModelStatus::Canary);
    assert_eq!(c2.status, ModelStatus::Canary);
    assert_fraction(c1.test_fraction, 0.25);
    assert_fraction(c2.test_fraction, 0.75);

    // Outside the cohort, untouched.
    let active = h.run("active").await;
    assert_eq!(active.status, ModelStatus::Active);
    assert_fraction(active.test_fraction, 1.0);

    // The active run is not part of the canary cohort.
    let err = h
        .rebalancer
        .rebalance(&weights(&[("active", 1.0)]), &h.scope, RebalanceMode::Cohort(ModelStatus::Canary))
        .await
        .unwrap_err();
    assert!(matches!(err, CanariaError::UnknownRun(_)));
}

#[tokio::test]
async fn test_partial_failure_reports_runs() {
    let h = Harness::new();
    h.seed("ok", ModelStatus::New, 0.0).await;
    h.seed("broken", ModelStatus::New, 0.0).await;
    h.store.fail_updates_for("broken");

    let err = h
        .rebalancer
        .rebalance(&weights(&[("ok", 1.0), ("broken", 1.0)]), &h.scope, RebalanceMode::Promote)
        .await
        .unwrap_err();

    let report = match err {
        CanariaError::PartialRebalance(report) => report,
        other => panic!("expected partial rebalance, got {:?}", other),
    };
    let broken = report.outcome("broken").unwrap();
    assert_eq!(broken.committed, Some(false));
    assert!(broken.error.is_some());
    assert!(report.outcome("ok").unwrap().is_success());

    assert_eq!(h.run("ok").await.status, ModelStatus::Active);
    assert_eq!(h.run("broken").await.status, ModelStatus::New);
}

// =============================================================================
// Single-run transitions
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_reenable_before_removal_keeps_deployment() {
    let h = Harness::new();
    h.seed("r1", ModelStatus::New, 0.0).await;

    h.machine.enable("r1").await.unwrap();
    assert!(h.backend.contains(&deployment("r1")));

    h.machine.disable("r1").await.unwrap();
    tokio::time::sleep(h.reconciler.removal_delay() / 2).await;
    h.machine.enable("r1").await.unwrap();

    tokio::time::sleep(h.reconciler.removal_delay() * 2).await;
    tokio::task::yield_now().await;

    assert!(h.backend.contains(&deployment("r1")));
    assert_eq!(h.backend.delete_count(), 0);
    assert_eq!(h.run("r1").await.status, ModelStatus::Active);
}

#[tokio::test]
async fn test_backend_failure_keeps_status() {
    let h = Harness::new();
    h.seed("r1", ModelStatus::New, 0.0).await;
    h.backend.set_failing(true);

    let err = h.machine.enable("r1").await.unwrap_err();
    assert!(matches!(err, CanariaError::DeploymentFailed { ref run_id, .. } if run_id == "r1"));
    assert!(err.is_retryable());

    let run = h.run("r1").await;
    assert_eq!(run.status, ModelStatus::Active);

    // Retrying once the backend is back converges.
    h.backend.set_failing(false);
    h.machine.enable("r1").await.unwrap();
    assert_eq!(
        h.backend.artifact_path(&deployment("r1")).as_deref(),
        Some("0/r1/artifacts")
    );
}

#[tokio::test]
async fn test_register_and_list() {
    let h = Harness::new();
    let run = h
        .machine
        .register(
            NewRun::new(VERSION)
                .with_immutable("region", "eu")
                .with_mutable("auc", 0.91),
        )
        .await
        .unwrap();
    assert_eq!(run.status, ModelStatus::New);
    assert_eq!(run.test_fraction, 0.0);
    assert_eq!(run.submodel_name.as_deref(), Some(MODEL));

    let found = list_runs(
        h.store.as_ref(),
        &h.scope.clone().with_immutable("region", "eu"),
        Some(ModelStatus::New),
    )
    .await
    .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].run_id, run.run_id);

    let none = list_runs(
        h.store.as_ref(),
        &h.scope.clone().with_immutable("region", "us"),
        None,
    )
    .await
    .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_transition_unknown_run() {
    let h = Harness::new();
    let err = h.machine.disable("ghost").await.unwrap_err();
    assert!(matches!(err, CanariaError::NotFound(_)));
}
