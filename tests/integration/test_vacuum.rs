//! Vacuum behavior through the public API.

use crate::common::{build_index, random_points, row};
use navigraph::{HnswIndex, IndexOptions, InsertOutcome, Settings};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
fn test_second_vacuum_changes_nothing() {
    let points = random_points(500, 8, 1);
    let index = build_index(&points, 8, 32, 1, &Settings::default());

    let first = index.vacuum(|row| row.get() % 4 == 0).unwrap();
    assert_eq!(first.rows_removed, 125);
    let stats = index.stats().unwrap();

    let second = index.vacuum(|row| row.get() % 4 == 0).unwrap();
    assert_eq!(second.rows_removed, 0);
    assert_eq!(second.tombstoned, 0);
    assert_eq!(second.repaired, 0);
    assert_eq!(second.reclaimed, 0);
    assert_eq!(index.stats().unwrap(), stats);
}

#[test]
fn test_inserts_after_vacuum_reuse_space() {
    let points = random_points(600, 64, 2);
    let index = build_index(&points, 8, 32, 1, &Settings::default());
    let pages = index.stats().unwrap().pages;

    index.vacuum(|row| row.get() <= 300).unwrap();
    for (row, vector) in random_points(300, 64, 3) {
        let reinserted = navigraph::RowId::new_unchecked(row.get() + 10_000);
        let outcome = index.insert(&vector, reinserted).unwrap();
        assert!(matches!(outcome, InsertOutcome::Inserted(_)));
    }

    // most of the freed slots are taken again instead of growing the file
    let grown = index.stats().unwrap().pages - pages;
    assert!(grown < pages / 4, "grew by {grown} pages from {pages}");
    let report = index.verify().unwrap();
    assert!(report.is_healthy(), "{:?}", report.violations);
    assert_eq!(report.rows, 600);
}

#[test]
fn test_vacuum_alongside_inserts_and_scans() {
    let points = random_points(800, 8, 4);
    let index = build_index(&points, 8, 32, 2, &Settings::default());
    let stop = Arc::new(AtomicBool::new(false));

    let scanner = {
        let index = index.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let queries = random_points(20, 8, 5);
            while !stop.load(Ordering::Relaxed) {
                for (_, query) in &queries {
                    let hits = index.search(query, 5).unwrap();
                    assert!(hits.iter().all(|hit| hit.distance.is_finite()));
                }
            }
        })
    };
    let inserter = {
        let index = index.clone();
        thread::spawn(move || {
            for (id, vector) in random_points(200, 8, 6) {
                index.insert(&vector, row(id.get() + 1000)).unwrap();
            }
        })
    };

    let stats = index.vacuum(|row| row.get() <= 800 && row.get() % 2 == 0).unwrap();
    inserter.join().unwrap();
    stop.store(true, Ordering::Relaxed);
    scanner.join().unwrap();

    assert_eq!(stats.rows_removed, 400);
    let report = index.verify().unwrap();
    assert!(report.is_healthy(), "{:?}", report.violations);
    assert_eq!(report.rows, 600);
}

#[test]
fn test_deleted_rows_never_returned() {
    let options = IndexOptions::new(2).with_m(4).with_ef_construction(16);
    let index = HnswIndex::in_memory(options, &Settings::default()).unwrap();
    for i in 1..=100u64 {
        index.insert(&[i as f32, 0.0], row(i)).unwrap();
    }
    let deleted: HashSet<u64> = (40..=60).collect();
    index.vacuum(|row| deleted.contains(&row.get())).unwrap();

    let mut scan = index.begin_scan(10);
    scan.rescan(&[50.0, 0.0]).unwrap();
    let mut returned = 0;
    while let Some(row) = scan.next().unwrap() {
        assert!(!deleted.contains(&row.get()));
        returned += 1;
    }
    scan.end().unwrap();
    assert_eq!(returned, 79);
}

#[test]
fn test_element_states_after_vacuum() {
    let points = random_points(100, 4, 8);
    let index = build_index(&points, 4, 16, 1, &Settings::default());
    index.vacuum(|row| row.get() > 50).unwrap();

    let report = index.verify().unwrap();
    assert_eq!(report.live_elements, 50);
    assert_eq!(report.tombstoned, 0);
    assert_eq!(report.reclaimable, 50);
}
