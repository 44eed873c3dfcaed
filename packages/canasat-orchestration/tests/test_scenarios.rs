//! End-to-end runs against a local catalog mirror:
//! - a clean scene within the cloud bound
//! - no scene within the cloud bound
//! - a scene missing one band

mod common;

use canasat_orchestration::{
    ErrorKind, IndexOutcome, JobManager, JobManagerConfig, JobState, OrchestratorError, RunLog,
    WorkflowRunner, WorkflowStep,
};
use canasat_raster::{Band, Raster};
use canasat_storage::InMemoryHistoryStore;
use common::{band_grid, params, Fixture};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn manager(fixture: &Fixture) -> JobManager {
    JobManager::init(
        Arc::new(fixture.orchestrator()),
        Arc::new(InMemoryHistoryStore::new()),
        JobManagerConfig {
            max_workers: 2,
            history_retention: 20,
            log_capacity: 200,
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_clean_scene_produces_all_requested_indices() {
    let fixture = Fixture::new();
    fixture.add_full_product("S2A_MSIL2A_20240807_T23KLP", 8.0);

    let log = RunLog::new(200);
    let result = fixture
        .orchestrator()
        .run(&params((0.0, 30.0), &["ndvi", "ndwi"]), &log, &CancellationToken::new())
        .await
        .expect("workflow failed");

    assert_eq!(result.scene.id(), "S2A_MSIL2A_20240807_T23KLP");
    assert_eq!(result.succeeded_indices(), vec!["ndvi", "ndwi"]);
    assert!(result.failed_indices().is_empty());

    // Everything lands on the native NIR grid.
    let nir_grid = band_grid(Band::Nir.native_resolution());
    assert!(result.bands.grid.matches(&nir_grid));
    for name in ["ndvi", "ndwi"] {
        let raster = Raster::read(result.indices.path(name).unwrap()).unwrap();
        assert!(raster.grid().matches(&nir_grid), "{} is off the reference grid", name);
    }

    // nir 0.30, red 0.10 at the top-left pixel
    let ndvi = Raster::read(result.indices.path("ndvi").unwrap()).unwrap();
    assert!((ndvi.data()[0] as f64 - 0.5).abs() < 1e-5);

    assert_eq!(result.export_outputs.len(), 1);
    assert!(result.export_outputs[0].is_file());
    assert!(result.export_error.is_none());

    let steps: Vec<WorkflowStep> = log.lines().iter().map(|l| l.step).collect();
    assert_eq!(steps.first(), Some(&WorkflowStep::Resolving));
    assert_eq!(steps.last(), Some(&WorkflowStep::Completed));
}

#[tokio::test]
async fn test_clean_scene_job_succeeds() {
    let fixture = Fixture::new();
    fixture.add_full_product("S2A_MSIL2A_20240807_T23KLP", 8.0);
    let manager = manager(&fixture).await;

    let id = manager.submit(params((0.0, 30.0), &["ndvi", "ndwi"])).await.unwrap();
    let snap = manager.wait(&id, Duration::from_secs(30)).await.unwrap();

    assert_eq!(snap.status, JobState::Succeeded);
    assert_eq!(snap.product.as_deref(), Some("S2A_MSIL2A_20240807_T23KLP"));
    assert!(snap.error.is_none());
    assert!(snap.started_at.is_some() && snap.finished_at.is_some());
    assert!(!snap.logs.is_empty());
    let last_seq = snap.logs.last().unwrap().seq;
    assert_eq!(manager.logs_since(&id, last_seq).await.unwrap().len(), 1);
    let result = snap.result.expect("result recorded");
    assert_eq!(result.succeeded_indices(), vec!["ndvi", "ndwi"]);
}

#[tokio::test]
async fn test_no_scene_within_cloud_bound() {
    let fixture = Fixture::new();
    fixture.add_product("S2A_CLOUDY_A", 12.0, 5, &[Band::Red, Band::Nir]);
    fixture.add_product("S2A_CLOUDY_B", 40.0, 9, &[Band::Red, Band::Nir]);

    match fixture
        .orchestrator()
        .run(&params((0.0, 5.0), &["ndvi"]), &RunLog::default(), &CancellationToken::new())
        .await
    {
        Err(OrchestratorError::NoMatchingScene(_)) => {}
        other => panic!("Expected NoMatchingScene, got {:?}", other.map(|r| r.scene)),
    }
    assert_eq!(fixture.catalog.download_count(), 0);
}

#[tokio::test]
async fn test_no_scene_job_fails_with_no_matching_scene() {
    let fixture = Fixture::new();
    fixture.add_product("S2A_CLOUDY_A", 12.0, 5, &[Band::Red, Band::Nir]);
    let manager = manager(&fixture).await;

    let id = manager.submit(params((0.0, 5.0), &["ndvi"])).await.unwrap();
    let snap = manager.wait(&id, Duration::from_secs(30)).await.unwrap();

    assert_eq!(snap.status, JobState::Failed);
    let error = snap.error.expect("error recorded");
    assert_eq!(error.kind, ErrorKind::NoMatchingScene);
    assert!(!error.retryable);
    assert!(snap.result.is_none());
}

#[tokio::test]
async fn test_missing_band_fails_only_dependent_index() {
    let fixture = Fixture::new();
    fixture.add_product(
        "S2A_NO_SWIR",
        3.0,
        7,
        &[Band::Blue, Band::Green, Band::Red, Band::Nir],
    );
    let manager = manager(&fixture).await;

    let id = manager.submit(params((0.0, 30.0), &["ndvi", "msi"])).await.unwrap();
    let snap = manager.wait(&id, Duration::from_secs(30)).await.unwrap();

    assert_eq!(snap.status, JobState::Succeeded);
    let result = snap.result.expect("result recorded");
    assert_eq!(result.succeeded_indices(), vec!["ndvi"]);
    assert_eq!(result.failed_indices(), vec!["msi"]);
    match result.indices.outcome("msi") {
        Some(IndexOutcome::Failed { kind, message }) => {
            assert_eq!(*kind, ErrorKind::UnsupportedIndex);
            assert!(message.contains("swir1"), "unexpected reason: {}", message);
        }
        other => panic!("Expected failed msi outcome, got {:?}", other),
    }
    assert!(result.bands.missing.contains_key(&Band::Swir1));
    assert_eq!(result.artifacts.failures["msi"].kind, ErrorKind::UnsupportedIndex);
}

#[tokio::test]
async fn test_selects_least_cloudy_candidate() {
    let fixture = Fixture::new();
    fixture.add_product("S2A_HAZY", 20.0, 10, &[Band::Red, Band::Nir]);
    fixture.add_product("S2A_CLEAR", 8.0, 3, &[Band::Red, Band::Nir]);

    let result = fixture
        .orchestrator()
        .run(&params((0.0, 30.0), &["ndvi"]), &RunLog::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.scene.id(), "S2A_CLEAR");
    assert_eq!(fixture.catalog.download_count(), 1);
}

#[tokio::test]
async fn test_reuse_path_skips_catalog() {
    let fixture = Fixture::new();
    let archive = fixture.add_full_product("S2A_LOCAL", 50.0);

    // Cloud bound does not apply to an explicitly supplied product.
    let request = params((0.0, 5.0), &["ndvi"]).with_reuse_path(&archive);
    let result = fixture
        .orchestrator()
        .run(&request, &RunLog::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.scene.id(), "S2A_LOCAL");
    assert_eq!(fixture.catalog.download_count(), 0);
    assert_eq!(result.succeeded_indices(), vec!["ndvi"]);
}

#[tokio::test]
async fn test_repeated_run_reuses_store_and_cache() {
    let fixture = Fixture::new();
    fixture.add_full_product("S2A_REPEAT", 8.0);
    let orchestrator = fixture.orchestrator();
    let request = params((0.0, 30.0), &["ndvi"]);

    let first = orchestrator
        .run(&request, &RunLog::default(), &CancellationToken::new())
        .await
        .unwrap();
    let second = orchestrator
        .run(&request, &RunLog::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fixture.catalog.download_count(), 1);
    assert_eq!(first.indices.path("ndvi"), second.indices.path("ndvi"));
    assert_eq!(second.bands.metrics.cache_hits, second.bands.len());
    assert_eq!(second.indices.metrics.cache_hits, 1);
}

#[tokio::test]
async fn test_cancelled_before_start_fails_fast() {
    let fixture = Fixture::new();
    fixture.add_full_product("S2A_CANCEL", 8.0);
    let token = CancellationToken::new();
    token.cancel();

    let err = fixture
        .orchestrator()
        .run(&params((0.0, 30.0), &["ndvi"]), &RunLog::default(), &token)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(fixture.catalog.download_count(), 0);
}
