//! Build quality: recall against brute force, before and after deleting half
//! of the rows.

use crate::common::{
    Points, build_index, mean_recall, random_points, random_queries, settings_with_ef,
};
use navigraph::{HnswIndex, IndexOptions, MemoryBackend, PageStore, Settings};
use std::collections::HashSet;

/// Build over `n` points, check recall@10, delete every even row, vacuum and
/// check again on the survivors.
fn recall_scenario(n: usize, dims: usize, queries: usize, before: f64, after: f64) {
    let points = random_points(n, dims, 42);
    let queries = random_queries(queries, dims, 4242);
    let settings = settings_with_ef(40);
    let index = build_index(&points, 16, 64, 4, &settings);

    let recall = mean_recall(&index, &points, &queries, 10);
    println!("recall@10 over {n}x{dims}: {recall:.4}");
    assert!(recall >= before, "recall {recall:.4} below {before}");

    let deleted: HashSet<u64> =
        points.iter().map(|(row, _)| row.get()).filter(|id| id % 2 == 0).collect();
    let stats = index.vacuum(|row| deleted.contains(&row.get())).unwrap();
    assert_eq!(stats.rows_removed, n / 2);
    assert_eq!(stats.reclaimed, n / 2);

    let report = index.verify().unwrap();
    assert!(report.is_healthy(), "{:?}", report.violations);
    assert_eq!(report.live_elements, n - n / 2);

    for query in &queries {
        for hit in index.search(query, 10).unwrap() {
            assert!(!deleted.contains(&hit.row_id.get()), "deleted row {} returned", hit.row_id);
        }
    }

    let survivors: Points =
        points.into_iter().filter(|(row, _)| !deleted.contains(&row.get())).collect();
    let recall = mean_recall(&index, &survivors, &queries, 10);
    println!("recall@10 after vacuum: {recall:.4}");
    assert!(recall >= after, "recall after vacuum {recall:.4} below {after}");
}

#[test]
fn test_recall_before_and_after_vacuum() {
    recall_scenario(1500, 32, 50, 0.9, 0.85);
}

#[test]
#[ignore = "slow: 10k x 128 build"]
fn test_recall_full_scale() {
    recall_scenario(10_000, 128, 100, 0.95, 0.90);
}

#[test]
fn test_recall_grows_with_ef_search() {
    let points = random_points(1000, 16, 9);
    let queries = random_queries(40, 16, 99);
    let backend = MemoryBackend::new();

    let narrow_settings = settings_with_ef(5);
    let options = IndexOptions::new(16).with_m(8).with_ef_construction(32);
    let store = PageStore::open(backend.clone()).unwrap();
    let narrow = HnswIndex::create(store, options, &narrow_settings).unwrap();
    let mut build = narrow.begin_build(2).unwrap();
    for (row, vector) in &points {
        build.feed(vector, *row).unwrap();
    }
    build.finish().unwrap();
    let narrow_recall = mean_recall(&narrow, &points, &queries, 10);

    // the same pages searched with a wider candidate list
    let wide = HnswIndex::open(PageStore::open(backend).unwrap(), &settings_with_ef(200)).unwrap();
    let wide_recall = mean_recall(&wide, &points, &queries, 10);
    assert!(
        wide_recall >= narrow_recall,
        "ef 200 recall {wide_recall:.4} below ef 5 recall {narrow_recall:.4}"
    );
    assert!(wide_recall > 0.95);
}

#[test]
fn test_incremental_inserts_match_build_quality() {
    let points = random_points(800, 16, 17);
    let queries = random_queries(30, 16, 1717);
    let settings = Settings::default();
    let options = IndexOptions::new(16).with_m(8).with_ef_construction(32);
    let index = HnswIndex::in_memory(options, &settings).unwrap();
    for (row, vector) in &points {
        index.insert(vector, *row).unwrap();
    }
    assert!(index.verify().unwrap().is_healthy());
    assert!(mean_recall(&index, &points, &queries, 10) > 0.9);
}
