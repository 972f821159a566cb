//! Concurrent tests for the trust tracker and buffer
//!
//! These verify behavior under actual multi-threaded execution:
//!
//! 1. **Commutativity under load** - thousands of updates across threads in
//!    different interleavings produce identical posteriors
//! 2. **Shard safety** - concurrent writers on the same rule never lose
//!    updates
//! 3. **Buffer drain** - close() observes every enqueued outcome

use rand::seq::SliceRandom;
use rand::SeedableRng;
use retrodict_core::RuleId;
use retrodict_trust::{TrustBuffer, TrustBufferConfig, TrustTracker};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn spread_updates(
    tracker: &Arc<TrustTracker>,
    updates: Vec<(RuleId, bool)>,
    workers: usize,
) {
    let chunk = (updates.len() + workers - 1) / workers;
    let barrier = Arc::new(Barrier::new(workers));
    let mut handles = Vec::new();
    for slice in updates.chunks(chunk) {
        let tracker = Arc::clone(tracker);
        let barrier = Arc::clone(&barrier);
        let slice = slice.to_vec();
        handles.push(thread::spawn(move || {
            barrier.wait();
            for (rule, outcome) in slice {
                tracker.update(&rule, outcome, 1);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn concurrent_update_orders_converge() {
    // 10k updates over 20 rules, applied in two different random orders
    // across 4 workers, must yield identical per-rule posteriors.
    let mut updates: Vec<(RuleId, bool)> = (0..10_000)
        .map(|i| (RuleId::new(format!("R{}", i % 20)), i % 3 != 0))
        .collect();

    let first = Arc::new(TrustTracker::with_shards(8));
    spread_updates(&first, updates.clone(), 4);

    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    updates.shuffle(&mut rng);
    let second = Arc::new(TrustTracker::with_shards(8));
    spread_updates(&second, updates, 4);

    assert_eq!(first.snapshot(), second.snapshot());
}

#[test]
fn concurrent_same_rule_loses_nothing() {
    let tracker = Arc::new(TrustTracker::with_shards(8));
    let rule = RuleId::new("contended");
    let workers = 8;
    let per_worker = 500;

    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|w| {
            let tracker = Arc::clone(&tracker);
            let barrier = Arc::clone(&barrier);
            let rule = rule.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..per_worker {
                    tracker.update(&rule, (w + i) % 2 == 0, 1);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let state = tracker.get(&rule).unwrap();
    assert_eq!(state.sample_count as usize, workers * per_worker);
    assert_eq!(
        (state.alpha - 1.0 + state.beta - 1.0) as usize,
        workers * per_worker
    );
}

#[test]
fn buffer_under_concurrent_writers_drains_fully() {
    let tracker = Arc::new(TrustTracker::with_shards(8));
    let buffer = TrustBuffer::new(
        Arc::clone(&tracker),
        TrustBufferConfig {
            flush_threshold: 32,
            auto_flush_interval: Duration::from_millis(10),
        },
    );

    let workers = 4;
    let per_worker = 1_000;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|w| {
            let buffer = Arc::clone(&buffer);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..per_worker {
                    let rule = RuleId::new(format!("R{}", i % 10));
                    buffer.enqueue(&rule, (w + i) % 4 != 0, 1);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    buffer.close();

    let total: u64 = tracker
        .snapshot()
        .rules
        .values()
        .map(|s| s.sample_count)
        .sum();
    assert_eq!(total as usize, workers * per_worker);
}

#[test]
fn batch_update_groups_match_interleaved_singles() {
    let singles = Arc::new(TrustTracker::with_shards(4));
    let batched = Arc::new(TrustTracker::with_shards(4));
    let rules: Vec<RuleId> = (0..6).map(|i| RuleId::new(format!("R{}", i))).collect();

    for (i, rule) in rules.iter().enumerate() {
        for _ in 0..(i * 7 + 1) {
            singles.update(rule, true, 2);
        }
        for _ in 0..(i * 3) {
            singles.update(rule, false, 2);
        }
    }

    let deltas: Vec<_> = rules
        .iter()
        .enumerate()
        .map(|(i, r)| (r.clone(), (i * 7 + 1) as u64, (i * 3) as u64))
        .collect();
    // two half-batches from two threads
    let mid = deltas.len() / 2;
    let (left, right) = (deltas[..mid].to_vec(), deltas[mid..].to_vec());
    let b1 = Arc::clone(&batched);
    let b2 = Arc::clone(&batched);
    let t1 = thread::spawn(move || b1.batch_update(&left, 2));
    let t2 = thread::spawn(move || b2.batch_update(&right, 2));
    t1.join().unwrap();
    t2.join().unwrap();

    assert_eq!(singles.snapshot(), batched.snapshot());
}
