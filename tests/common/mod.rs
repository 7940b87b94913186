//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use navigraph::recall::{exact_neighbors, recall_at_k};
use navigraph::{HnswIndex, IndexOptions, MetricKind, RowId, Settings};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

pub type Points = Vec<(RowId, Vec<f32>)>;

pub fn row(id: u64) -> RowId {
    RowId::new_unchecked(id)
}

/// `n` uniform random vectors with rows 1..=n, reproducible per seed.
pub fn random_points(n: usize, dims: usize, seed: u64) -> Points {
    let mut rng = StdRng::seed_from_u64(seed);
    (1..=n as u64)
        .map(|i| (row(i), (0..dims).map(|_| rng.random::<f32>()).collect()))
        .collect()
}

pub fn random_queries(n: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
    random_points(n, dims, seed).into_iter().map(|(_, v)| v).collect()
}

/// Settings with a fixed search width.
pub fn settings_with_ef(ef_search: usize) -> Settings {
    let mut settings = Settings::default();
    settings.search.ef_search = ef_search;
    settings
}

/// Bulk-build an in-memory index over `points`.
pub fn build_index(
    points: &Points,
    m: usize,
    ef_construction: usize,
    parallelism: usize,
    settings: &Settings,
) -> HnswIndex {
    let dims = points[0].1.len();
    let options = IndexOptions::from_settings(dims, settings)
        .with_m(m)
        .with_ef_construction(ef_construction);
    let index = HnswIndex::in_memory(options, settings).expect("Failed to create index");
    let mut build = index.begin_build(parallelism).expect("Failed to begin build");
    for (row, vector) in points {
        build.feed(vector, *row).expect("Failed to feed row");
    }
    build.finish().expect("Failed to finish build");
    index
}

/// Average recall@k of `index` over `queries`, against brute force on `points`.
pub fn mean_recall(index: &HnswIndex, points: &Points, queries: &[Vec<f32>], k: usize) -> f64 {
    let total: f64 = queries
        .iter()
        .map(|query| {
            let truth: Vec<RowId> = exact_neighbors(points, query, k, index.metric())
                .into_iter()
                .map(|(row, _)| row)
                .collect();
            let found: Vec<RowId> = index
                .search(query, k)
                .expect("Search failed")
                .into_iter()
                .map(|hit| hit.row_id)
                .collect();
            recall_at_k(&found, &truth)
        })
        .sum();
    total / queries.len() as f64
}

pub fn cosine_settings() -> Settings {
    let mut settings = Settings::default();
    settings.index.metric = MetricKind::Cosine;
    settings
}

pub struct TestStore {
    pub dir: TempDir,
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }
}
