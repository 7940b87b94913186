//! The scan protocol: iterative re-querying and ordering modes.

use crate::common::{build_index, random_points, row};
use navigraph::{HnswIndex, IndexOptions, IterativeScan, Settings};
use std::collections::HashSet;

fn line(n: u64) -> HnswIndex {
    let options = IndexOptions::new(1).with_m(4).with_ef_construction(16);
    let index = HnswIndex::in_memory(options, &Settings::default()).unwrap();
    for i in 1..=n {
        index.insert(&[i as f32], row(i)).unwrap();
    }
    index
}

fn drain(
    index: &HnswIndex,
    ef: usize,
    mode: IterativeScan,
    query: f32,
) -> Vec<navigraph::SearchHit> {
    let mut scan = index.begin_scan(ef).with_iterative_scan(mode);
    scan.rescan(&[query]).unwrap();
    let mut hits = Vec::new();
    while let Some(hit) = scan.next_hit().unwrap() {
        hits.push(hit);
    }
    scan.end().unwrap();
    hits
}

#[test]
fn test_off_stops_after_first_pass() {
    let index = line(300);
    let hits = drain(&index, 20, IterativeScan::Off, 150.0);
    assert_eq!(hits.len(), 20);
}

#[test]
fn test_relaxed_scan_reaches_far_rows() {
    let index = line(300);
    let hits = drain(&index, 10, IterativeScan::Relaxed, 150.0);
    let rows: HashSet<u64> = hits.iter().map(|h| h.row_id.get()).collect();
    assert_eq!(rows.len(), hits.len());
    assert!(hits.len() >= 250, "scan stopped after {} rows", hits.len());
}

#[test]
fn test_strict_scan_is_ordered() {
    let index = line(300);
    let hits = drain(&index, 10, IterativeScan::Strict, 42.0);
    assert!(hits.len() > 10);
    assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
}

#[test]
fn test_scan_respects_tuple_limit() {
    let mut settings = Settings::default();
    settings.search.max_scan_tuples = 50;
    let points = random_points(2000, 4, 70);
    let index = build_index(&points, 4, 16, 1, &settings);

    let mut scan = index.begin_scan(10);
    scan.rescan(&[0.5; 4]).unwrap();
    let mut returned = 0;
    while scan.next().unwrap().is_some() {
        returned += 1;
    }
    assert!(returned < 2000);
    assert!(scan.tuples_visited() >= 50);
}

#[test]
fn test_search_returns_k_nearest_first() {
    let index = line(100);
    let hits = index.search(&[10.0], 5).unwrap();
    let rows: Vec<u64> = hits.iter().map(|h| h.row_id.get()).collect();
    assert_eq!(rows[0], 10);
    let mut expected: Vec<u64> = vec![8, 9, 10, 11, 12];
    let mut sorted = rows.clone();
    sorted.sort_unstable();
    expected.sort_unstable();
    assert_eq!(sorted, expected);
}

#[test]
fn test_search_on_empty_index() {
    let index = line(0);
    assert!(index.search(&[1.0], 10).unwrap().is_empty());
}
