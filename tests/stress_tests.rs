//! Concurrent stress tests.
//!
//! These exercise the latch-free protocols under real parallelism: racing
//! inserts of one key, racing upserts, insert storms across splits, and
//! mixed workloads. Node sizes are kept small so structural modifications
//! (freeze, split, root replacement) happen constantly.
//!
//! ```bash
//! cargo test --test stress_tests --release
//! ```

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use bztree::{BzTree, Error, Params};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

// =============================================================================
// Test Configuration
// =============================================================================

const THREADS: usize = 8;

fn small_tree() -> BzTree {
    BzTree::with_params(Params {
        split_threshold: 256,
        merge_threshold: 0,
        leaf_node_size: 256,
    })
}

// =============================================================================
// Single-key races
// =============================================================================

/// Exactly one of N racing inserts of the same key may win.
#[test]
fn concurrent_insert_same_key() {
    for _round in 0..50 {
        let tree = BzTree::new();
        let wins = AtomicUsize::new(0);
        let losses = AtomicUsize::new(0);

        thread::scope(|scope| {
            for payload in 0..THREADS as u64 {
                let tree = &tree;
                let wins = &wins;
                let losses = &losses;

                scope.spawn(move || match tree.insert(b"contended", payload) {
                    Ok(()) => {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }

                    Err(Error::KeyExists) => {
                        losses.fetch_add(1, Ordering::Relaxed);
                    }

                    Err(other) => panic!("unexpected outcome: {other}"),
                });
            }
        });

        assert_eq!(wins.load(Ordering::Relaxed), 1);
        assert_eq!(losses.load(Ordering::Relaxed), THREADS - 1);

        // The winner's payload is the one stored.
        let stored = tree.read(b"contended").unwrap();
        assert!(stored < THREADS as u64);
    }
}

/// Racing upserts all succeed, and the key converges to one of the written
/// payloads.
#[test]
fn concurrent_upsert_same_key() {
    for _round in 0..50 {
        let tree = BzTree::new();

        thread::scope(|scope| {
            for payload in 1..=2u64 {
                let tree = &tree;

                scope.spawn(move || {
                    tree.upsert(b"x", payload).unwrap();
                });
            }
        });

        let stored = tree.read(b"x").unwrap();
        assert!(stored == 1 || stored == 2, "stored {stored}");

        // From here on the value is stable.
        assert_eq!(tree.read(b"x").unwrap(), stored);
    }
}

// =============================================================================
// Insert storms across splits
// =============================================================================

/// Distinct keys from many threads: everything lands, scans stay sorted.
#[test]
fn concurrent_insert_distinct_keys() {
    const PER_THREAD: usize = 400;

    let tree = small_tree();

    thread::scope(|scope| {
        for thread_id in 0..THREADS {
            let tree = &tree;

            scope.spawn(move || {
                for index in 0..PER_THREAD {
                    let key = format!("t{thread_id}-{index:05}").into_bytes();
                    tree.insert(&key, (thread_id * PER_THREAD + index) as u64)
                        .unwrap();
                }
            });
        }
    });

    // Every record is readable with its payload.
    for thread_id in 0..THREADS {
        for index in 0..PER_THREAD {
            let key = format!("t{thread_id}-{index:05}").into_bytes();
            assert_eq!(
                tree.read(&key),
                Some((thread_id * PER_THREAD + index) as u64),
                "missing {}",
                String::from_utf8_lossy(&key),
            );
        }
    }

    // Full scan: complete, strictly ascending, duplicate-free.
    let records: Vec<_> = tree.range_scan(b"t", b"u").collect();
    assert_eq!(records.len(), THREADS * PER_THREAD);

    for pair in records.windows(2) {
        assert!(pair[0].key() < pair[1].key());
    }
}

/// Interleaved key ranges force every thread through the same leaves.
#[test]
fn concurrent_insert_interleaved_keys() {
    const TOTAL: usize = 2000;

    let tree = small_tree();

    thread::scope(|scope| {
        for thread_id in 0..THREADS {
            let tree = &tree;

            scope.spawn(move || {
                let mut index = thread_id;

                while index < TOTAL {
                    let key = format!("k{index:06}").into_bytes();
                    tree.insert(&key, index as u64).unwrap();
                    index += THREADS;
                }
            });
        }
    });

    for index in 0..TOTAL {
        let key = format!("k{index:06}").into_bytes();
        assert_eq!(tree.read(&key), Some(index as u64));
    }
}

// =============================================================================
// Mixed workloads
// =============================================================================

/// Inserts, upserts, deletes and reads over an overlapping key space. The
/// stable subset (never deleted) must survive; the scan must stay ordered
/// and duplicate-free.
#[test]
fn concurrent_mixed_workload() {
    const STABLE: usize = 500;
    const CHURN: usize = 200;

    let tree = small_tree();

    thread::scope(|scope| {
        // Writers of the stable subset.
        for thread_id in 0..4usize {
            let tree = &tree;

            scope.spawn(move || {
                let mut index = thread_id;

                while index < STABLE {
                    let key = format!("stable-{index:05}").into_bytes();
                    tree.insert(&key, index as u64).unwrap();
                    index += 4;
                }
            });
        }

        // Churners hammering a small shared key set.
        for thread_id in 0..4usize {
            let tree = &tree;

            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(0xC0FFEE + thread_id as u64);

                for _ in 0..CHURN {
                    let which: usize = rng.gen_range(0..32);
                    let key = format!("churn-{which:03}").into_bytes();

                    match rng.gen_range(0..4) {
                        0 => {
                            let _ = tree.insert(&key, which as u64);
                        }

                        1 => tree.upsert(&key, which as u64).unwrap(),

                        2 => {
                            let _ = tree.delete(&key);
                        }

                        _ => {
                            if let Some(found) = tree.read(&key) {
                                assert_eq!(found, which as u64);
                            }
                        }
                    }
                }
            });
        }
    });

    for index in 0..STABLE {
        let key = format!("stable-{index:05}").into_bytes();
        assert_eq!(tree.read(&key), Some(index as u64));
    }

    let records: Vec<_> = tree.range_scan(b"churn-", b"t").collect();
    let mut seen = BTreeSet::new();

    for pair in records.windows(2) {
        assert!(pair[0].key() < pair[1].key());
    }

    for record in &records {
        assert!(seen.insert(record.key().to_vec()), "duplicate key in scan");
    }
}

/// Readers and scanners run while writers split the tree underneath them.
#[test]
fn scans_during_splits() {
    const TOTAL: usize = 1500;

    let tree = small_tree();

    thread::scope(|scope| {
        for thread_id in 0..4usize {
            let tree = &tree;

            scope.spawn(move || {
                let mut index = thread_id;

                while index < TOTAL {
                    let key = format!("k{index:06}").into_bytes();
                    tree.insert(&key, index as u64).unwrap();
                    index += 4;
                }
            });
        }

        for _ in 0..4 {
            let tree = &tree;

            scope.spawn(move || {
                for _ in 0..20 {
                    // Snapshot-free scan: whatever it sees must be ordered.
                    let records: Vec<_> = tree.range_scan(b"k", b"l").collect();

                    for pair in records.windows(2) {
                        assert!(pair[0].key() < pair[1].key());
                    }

                    for record in &records {
                        let index: usize = std::str::from_utf8(&record.key()[1..])
                            .unwrap()
                            .parse()
                            .unwrap();
                        assert_eq!(record.payload(), index as u64);
                    }
                }
            });
        }
    });

    let records: Vec<_> = tree.range_scan(b"k", b"l").collect();
    assert_eq!(records.len(), TOTAL);
}

// =============================================================================
// Randomized single-thread scenario
// =============================================================================

/// 1024 random distinct keys inserted in shuffled order scan back sorted.
#[test]
fn random_inserts_scan_in_order() {
    let tree = small_tree();
    let mut rng = StdRng::seed_from_u64(42);

    let mut keys: Vec<Vec<u8>> = (0..1024u32)
        .map(|_| {
            let len = rng.gen_range(4..=12);
            (0..len)
                .map(|_| rng.gen_range(b'a'..=b'z'))
                .collect::<Vec<u8>>()
        })
        .collect();
    keys.sort();
    keys.dedup();
    keys.shuffle(&mut rng);

    for (index, key) in keys.iter().enumerate() {
        tree.insert(key, index as u64).unwrap();
    }

    keys.sort();
    let scanned: Vec<Vec<u8>> = tree
        .range_scan(b"a", b"zzzzzzzzzzzzz")
        .map(|record| record.key().to_vec())
        .collect();

    assert_eq!(scanned, keys);
}
