//! Indexes stored in page files survive a reopen.

use crate::common::{TestStore, random_points, random_queries, row};
use navigraph::{HnswError, HnswIndex, IndexOptions, MetricKind, RowId, Settings};

fn options() -> IndexOptions {
    IndexOptions::new(16).with_m(8).with_ef_construction(32)
}

fn top_rows(index: &HnswIndex, query: &[f32]) -> Vec<RowId> {
    index.search(query, 10).unwrap().into_iter().map(|hit| hit.row_id).collect()
}

#[test]
fn test_reopen_gives_same_results() {
    let store = TestStore::new();
    let path = store.path("vectors.pages");
    let settings = Settings::default();
    let points = random_points(500, 16, 50);
    let queries = random_queries(10, 16, 51);

    let before: Vec<Vec<RowId>> = {
        let index = HnswIndex::create_file(&path, options(), &settings).unwrap();
        let mut build = index.begin_build(2).unwrap();
        for (row, vector) in &points {
            build.feed(vector, *row).unwrap();
        }
        build.finish().unwrap();
        queries.iter().map(|q| top_rows(&index, q)).collect()
    };

    let index = HnswIndex::open_file(&path, &settings).unwrap();
    let stats = index.stats().unwrap();
    assert_eq!(stats.dimensions, 16);
    assert_eq!(stats.m, 8);
    assert!(stats.entry.is_some());

    let after: Vec<Vec<RowId>> = queries.iter().map(|q| top_rows(&index, q)).collect();
    assert_eq!(before, after);
    assert!(index.verify().unwrap().is_healthy());
}

#[test]
fn test_inserts_and_vacuum_persist() {
    let store = TestStore::new();
    let path = store.path("nested/dir/vectors.pages");
    let settings = Settings::default();

    {
        let index = HnswIndex::create_file(&path, options(), &settings).unwrap();
        for (row, vector) in random_points(200, 16, 60) {
            index.insert(&vector, row).unwrap();
        }
        index.vacuum(|row| row.get() > 150).unwrap();
        index.sync().unwrap();
    }

    let index = HnswIndex::open_file(&path, &settings).unwrap();
    let report = index.verify().unwrap();
    assert!(report.is_healthy(), "{:?}", report.violations);
    assert_eq!(report.rows, 150);
    assert_eq!(report.reclaimable, 50);

    // the reopened index keeps accepting rows
    index.insert(&[0.5; 16], row(1000)).unwrap();
    assert_eq!(index.search(&[0.5; 16], 1).unwrap()[0].row_id, row(1000));
}

#[test]
fn test_open_with_other_metric_fails() {
    let store = TestStore::new();
    let path = store.path("vectors.pages");
    let inner_product = options().with_metric(MetricKind::InnerProduct);
    HnswIndex::create_file(&path, inner_product, &Settings::default()).unwrap();

    let err = HnswIndex::open_file(&path, &Settings::default()).unwrap_err();
    assert!(matches!(err, HnswError::MetricMismatch { .. }));
    assert_eq!(err.status_code(), "METRIC_MISMATCH");
}

#[test]
fn test_settings_file_drives_index() {
    let store = TestStore::new();
    let config = store.path(".navigraph/settings.toml");
    let mut settings = Settings::default();
    settings.index.m = 6;
    settings.index.ef_construction = 24;
    settings.index.metric = MetricKind::L1;
    settings.storage.synchronous = false;
    settings.save(&config).unwrap();

    let loaded = Settings::load_from(&config).unwrap();
    assert_eq!(loaded, settings);

    let path = store.path("vectors.pages");
    let options = IndexOptions::from_settings(4, &loaded);
    let index = HnswIndex::create_file(&path, options, &loaded).unwrap();
    index.insert(&[1.0, 2.0, 3.0, 4.0], row(1)).unwrap();
    drop(index);

    let index = HnswIndex::open_file(&path, &loaded).unwrap();
    let stats = index.stats().unwrap();
    assert_eq!(stats.m, 6);
    assert_eq!(stats.metric, MetricKind::L1);
}
