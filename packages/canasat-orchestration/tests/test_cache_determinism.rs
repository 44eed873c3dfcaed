//! Concurrent runs share one download and one computation per artifact, and
//! identical inputs give byte-identical outputs.

mod common;

use canasat_orchestration::{RunLog, WorkflowParams, WorkflowRunner};
use common::{params, Fixture};
use futures::future::join_all;
use proptest::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_download_once() {
    let fixture = Fixture::new();
    fixture.add_full_product("S2A_SHARED", 8.0);
    let orchestrator = Arc::new(fixture.orchestrator());
    let request = params((0.0, 30.0), &["ndvi", "ndwi"]);

    let runs = (0..6).map(|_| {
        let orchestrator = orchestrator.clone();
        let request = request.clone();
        tokio::spawn(async move {
            orchestrator
                .run(&request, &RunLog::default(), &CancellationToken::new())
                .await
        })
    });
    let results: Vec<_> = join_all(runs)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(fixture.catalog.download_count(), 1);
    let ndvi = results[0].indices.path("ndvi").unwrap().to_path_buf();
    let total_computed: usize = results
        .iter()
        .map(|r| r.indices.metrics.artifacts - r.indices.metrics.cache_hits)
        .sum();
    assert_eq!(total_computed, 2, "each index computed exactly once");
    for result in &results {
        assert_eq!(result.indices.path("ndvi"), Some(ndvi.as_path()));
    }
}

#[tokio::test]
async fn test_identical_inputs_give_identical_bytes() {
    let request = params((0.0, 30.0), &["ndvi", "msi", "evi"]);
    let mut outputs = Vec::new();
    for _ in 0..2 {
        let fixture = Fixture::new();
        fixture.add_full_product("S2A_DETERMINISM", 8.0);
        let result = fixture
            .orchestrator()
            .run(&request, &RunLog::default(), &CancellationToken::new())
            .await
            .unwrap();
        let mut files = Vec::new();
        for (name, path) in result.indices.paths() {
            files.push((name, std::fs::read(path).unwrap()));
        }
        for (band, path) in &result.bands.bands {
            files.push((band.to_string(), std::fs::read(path).unwrap()));
        }
        outputs.push(files);
    }
    assert!(!outputs[0].is_empty());
    assert_eq!(outputs[0], outputs[1]);
}

fn request_with(indices: &[String]) -> WorkflowParams {
    let names: Vec<&str> = indices.iter().map(String::as_str).collect();
    params((0.0, 30.0), &names)
}

proptest! {
    #[test]
    fn prop_fingerprint_ignores_index_order_and_case(
        indices in proptest::collection::vec("[a-z]{3,6}", 1..6),
        seed in any::<u64>(),
    ) {
        let mut shuffled: Vec<String> = indices.iter().map(|n| n.to_ascii_uppercase()).collect();
        let len = shuffled.len();
        shuffled.rotate_left((seed as usize) % len);
        prop_assert_eq!(request_with(&indices).fingerprint(), request_with(&shuffled).fingerprint());
    }

    #[test]
    fn prop_fingerprint_ignores_cloud_bounds(max in 1.0f64..100.0) {
        let base = params((0.0, 30.0), &["ndvi"]);
        let other = base.clone().with_cloud(canasat_orchestration::CloudBounds::new(0.0, max).unwrap());
        prop_assert_eq!(base.fingerprint(), other.fingerprint());
    }
}
