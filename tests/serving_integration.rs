//! Serving integration tests
//!
//! Model cache expiry, weighted routing through the inference service, and
//! the HTTP application served over TCP.

#[allow(dead_code)]
mod common;

use canaria::backend::LocalDeployer;
use canaria::cache::ModelCache;
use canaria::config::{CanariaConfig, DeploymentMode};
use canaria::lifecycle::RebalanceMode;
use canaria::router::Router;
use canaria::serving::{InferenceService, JsonModelLoader, LocalModel};
use canaria::shutdown::ShutdownCoordinator;
use canaria::types::ModelStatus;
use canaria::{Canaria, CanariaError};
use common::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

fn service(h: &Harness, runtime: TableRuntime, ttl: Duration, mode: DeploymentMode) -> InferenceService {
    InferenceService::new(
        h.store.clone(),
        Arc::new(runtime),
        ModelCache::new(ttl, 10),
        h.scope.clone(),
        mode,
    )
    .with_router(Router::with_seed(42))
}

#[tokio::test(start_paused = true)]
async fn test_cache_serves_snapshot_until_ttl() {
    let h = Harness::new();
    h.seed("r1", ModelStatus::Active, 1.0).await;
    let svc = service(&h, TableRuntime::default(), Duration::from_secs(10), DeploymentMode::Weighted);

    assert_eq!(svc.active_set().await.unwrap().run_ids(), vec!["r1"]);
    let searches = h.store.search_count();

    h.seed("r2", ModelStatus::Active, 1.0).await;
    tokio::time::advance(Duration::from_secs(9)).await;
    assert_eq!(svc.active_set().await.unwrap().run_ids(), vec!["r1"]);
    assert_eq!(h.store.search_count(), searches);

    tokio::time::advance(Duration::from_secs(2)).await;
    let set = svc.active_set().await.unwrap();
    assert_eq!(set.run_ids().len(), 2);
    let fractions = set.fractions();
    assert_fraction(fractions["r1"], 0.5);
    assert_fraction(fractions["r2"], 0.5);
}

#[tokio::test]
async fn test_empty_set_is_not_cached() {
    let h = Harness::new();
    let svc = service(&h, TableRuntime::default(), Duration::from_secs(600), DeploymentMode::Weighted);

    assert!(matches!(svc.active_set().await, Err(CanariaError::UnhealthyState(_))));
    assert!(!svc.health().await);

    h.seed("r1", ModelStatus::Canary, 0.3).await;
    assert!(svc.health().await);
    assert_fraction(svc.active_set().await.unwrap().fractions()["r1"], 1.0);
}

#[tokio::test]
async fn test_weighted_routing_follows_fractions() {
    let h = Harness::new();
    h.seed("a", ModelStatus::New, 0.0).await;
    h.seed("b", ModelStatus::New, 0.0).await;
    h.rebalancer
        .rebalance(
            &BTreeMap::from([("a".to_string(), 7.0), ("b".to_string(), 3.0)]),
            &h.scope,
            RebalanceMode::Promote,
        )
        .await
        .unwrap();

    let svc = service(
        &h,
        TableRuntime::new([("a", 1.0), ("b", 2.0)]),
        Duration::from_secs(600),
        DeploymentMode::Weighted,
    );

    let mut counts: HashMap<String, usize> = HashMap::new();
    let draws = 20_000;
    for _ in 0..draws {
        let prediction = svc.predict(&[]).await.unwrap();
        let run_id = &prediction.metadata[0].model_id;
        let expected = if run_id == "a" { 1.0 } else { 2.0 };
        assert_eq!(prediction.value, expected);
        *counts.entry(run_id.clone()).or_default() += 1;
    }

    let share = counts["a"] as f64 / draws as f64;
    assert!((0.68..=0.72).contains(&share), "share of a was {}", share);
}

#[tokio::test]
async fn test_single_mode_ignores_canaries() {
    let h = Harness::new();
    h.seed("canary", ModelStatus::Canary, 1.0).await;
    let svc = service(&h, TableRuntime::default(), Duration::from_secs(600), DeploymentMode::Single);
    assert!(!svc.health().await);

    h.seed("old", ModelStatus::Active, 0.5).await;
    h.seed("new", ModelStatus::Active, 0.5).await;
    let prediction = svc.predict(&[]).await.unwrap();
    assert_eq!(prediction.metadata[0].model_id, "new");
    assert_eq!(prediction.metadata[0].submodel_name, MODEL);
    assert_eq!(prediction.metadata[0].model_version, "1.2.0");
}

#[tokio::test]
async fn test_reload_sees_rebalance() {
    let h = Harness::new();
    h.seed("a", ModelStatus::Active, 1.0).await;
    h.seed("b", ModelStatus::New, 0.0).await;
    let svc = service(&h, TableRuntime::default(), Duration::from_secs(600), DeploymentMode::Weighted);
    assert_eq!(svc.active_set().await.unwrap().run_ids(), vec!["a"]);

    h.rebalancer
        .rebalance(&BTreeMap::from([("b".to_string(), 1.0)]), &h.scope, RebalanceMode::Promote)
        .await
        .unwrap();
    assert_eq!(svc.active_set().await.unwrap().run_ids(), vec!["a"]);

    assert!(svc.reload().await);
    assert_eq!(svc.active_set().await.unwrap().run_ids(), vec!["b"]);
}

#[tokio::test]
async fn test_http_end_to_end() {
    let models = tempfile::tempdir().unwrap();
    let h = Harness::new();
    for (id, bias) in [("r1", 10.0), ("r2", 20.0)] {
        let location = write_linear_model(models.path(), id, &[1.0, 1.0], bias);
        let mut run = h.seed(id, ModelStatus::New, 0.0).await;
        run.artifact_location = location;
        h.store.insert(run).await;
    }

    let port = find_available_port();
    let mut config = CanariaConfig::development();
    config.model.name = MODEL.to_string();
    config.model.version = "1.2.0".to_string();
    config.server.bind_addr = format!("127.0.0.1:{}", port).parse().unwrap();

    let runtime = Arc::new(LocalModel::new(Arc::new(JsonModelLoader::new())));
    let app = Canaria::from_parts(config, h.store.clone(), Arc::new(LocalDeployer), runtime).unwrap();
    let coordinator = ShutdownCoordinator::new();
    let server = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { canaria::serve(&app, None, coordinator).await })
    };

    let addr = format!("127.0.0.1:{}", port);
    assert!(wait_for_server(&addr, 5).await);
    let client = reqwest::Client::new();

    let health = client.get(format!("http://{}/health", addr)).send().await.unwrap();
    assert_eq!(health.status().as_u16(), 503);
    assert_eq!(health.text().await.unwrap(), "Unhealthy");

    let rebalance = client
        .post(format!("http://{}/admin/rebalance", addr))
        .json(&serde_json::json!({"weights": {"r2": 1}}))
        .send()
        .await
        .unwrap();
    assert!(rebalance.status().is_success());

    let health = client.get(format!("http://{}/health", addr)).send().await.unwrap();
    assert_eq!(health.status().as_u16(), 200);
    assert_eq!(health.text().await.unwrap(), "Ok");

    let prediction: serde_json::Value = client
        .post(format!("http://{}/predict", addr))
        .json(&serde_json::json!({"features": [1.0, 2.0]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(prediction["value"], 23.0);
    assert_eq!(prediction["metadata"][0]["model_id"], "r2");
    assert_eq!(h.run("r1").await.status, ModelStatus::Disabled);

    coordinator.shutdown();
    let stopped = tokio::time::timeout(Duration::from_secs(5), server).await;
    assert!(matches!(stopped, Ok(Ok(Ok(())))));
}
