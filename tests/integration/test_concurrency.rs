//! Many writers and readers on one index.

use crate::common::{TestStore, random_points, row};
use navigraph::{HnswIndex, IndexOptions, Settings};
use std::sync::Arc;
use std::sync::Barrier;
use std::thread;

const THREADS: usize = 4;
const PER_THREAD: usize = 250;

fn options() -> IndexOptions {
    IndexOptions::new(8).with_m(8).with_ef_construction(32)
}

#[test]
fn test_concurrent_inserts_keep_graph_consistent() {
    let index = HnswIndex::in_memory(options(), &Settings::default()).unwrap();
    let points = Arc::new(random_points(THREADS * PER_THREAD, 8, 21));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let index = index.clone();
            let points = Arc::clone(&points);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for (row, vector) in points.iter().skip(t * PER_THREAD).take(PER_THREAD) {
                    index.insert(vector, *row).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let report = index.verify().unwrap();
    assert!(report.is_healthy(), "{:?}", report.violations);
    assert_eq!(report.rows, THREADS * PER_THREAD);
    assert_eq!(report.entry.map(|e| e.level), report.max_live_level);

    // every vector finds itself
    let found = points
        .iter()
        .filter(|(row, vector)| {
            index.search(vector, 1).unwrap().first().map(|h| h.row_id) == Some(*row)
        })
        .count();
    assert!(found * 100 >= points.len() * 98, "only {found} of {} found themselves", points.len());
}

#[test]
fn test_readers_during_writes() {
    let index = HnswIndex::in_memory(options(), &Settings::default()).unwrap();
    for (row, vector) in random_points(200, 8, 30) {
        index.insert(&vector, row).unwrap();
    }

    let writer = {
        let index = index.clone();
        thread::spawn(move || {
            for (id, vector) in random_points(400, 8, 31) {
                index.insert(&vector, row(id.get() + 200)).unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|seed| {
            let index = index.clone();
            thread::spawn(move || {
                for (_, query) in random_points(100, 8, 40 + seed) {
                    let hits = index.search(&query, 10).unwrap();
                    assert_eq!(hits.len(), 10);
                    assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(index.verify().unwrap().rows, 600);
}

#[test]
fn test_same_vector_from_many_threads() {
    let index = HnswIndex::in_memory(options(), &Settings::default()).unwrap();
    index.insert(&[0.5; 8], row(1)).unwrap();

    let handles: Vec<_> = (0..THREADS as u64)
        .map(|t| {
            let index = index.clone();
            thread::spawn(move || {
                for i in 0..5u64 {
                    index.insert(&[0.5; 8], row(100 + t * 10 + i)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let report = index.verify().unwrap();
    assert!(report.is_healthy(), "{:?}", report.violations);
    assert_eq!(report.rows, 1 + THREADS * 5);
    // heap ref lists hold at most ten rows, so the copies span several elements
    assert!(report.live_elements >= 3);
}

#[test]
fn test_concurrent_inserts_on_page_file_survive_reopen() {
    let store = TestStore::new();
    let path = store.path("concurrent.pages");
    let settings = Settings::default();
    let points = Arc::new(random_points(THREADS * 100, 8, 61));

    {
        let index = HnswIndex::create_file(&path, options(), &settings).unwrap();
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let index = index.clone();
                let points = Arc::clone(&points);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for (row, vector) in points.iter().skip(t * 100).take(100) {
                        index.insert(vector, *row).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
    assert!(!path.with_extension("journal").exists());

    let index = HnswIndex::open_file(&path, &settings).unwrap();
    let report = index.verify().unwrap();
    assert!(report.is_healthy(), "{:?}", report.violations);
    assert_eq!(report.rows, THREADS * 100);
    let found = points
        .iter()
        .filter(|(row, vector)| {
            index.search(vector, 1).unwrap().first().map(|h| h.row_id) == Some(*row)
        })
        .count();
    assert!(found * 100 >= points.len() * 98, "only {found} of {} found themselves", points.len());
}
