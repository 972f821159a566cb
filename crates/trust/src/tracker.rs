//! Lock-sharded Bayesian trust tracker
//!
//! Per-rule Beta posteriors partitioned across N lock shards, N a power of
//! two at least the CPU count. A single rule's state lives in exactly one
//! shard; `batch_update` groups deltas by shard and visits shards in
//! ascending index order, so no operation ever holds two shard locks at
//! once and lock ordering is trivially deadlock-free.

use crate::state::TrustState;
use parking_lot::Mutex;
use retrodict_core::RuleId;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

/// Serializable snapshot of the whole tracker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustSnapshot {
    /// Per-rule posteriors, key-ordered
    pub rules: BTreeMap<RuleId, TrustState>,
}

/// Aggregated (successes, failures) delta for one rule
pub type TrustDelta = (RuleId, u64, u64);

/// Concurrent Beta(α, β) tracker
pub struct TrustTracker {
    shards: Vec<Mutex<FxHashMap<RuleId, TrustState>>>,
    mask: u64,
}

impl TrustTracker {
    /// Create a tracker with shard count derived from the CPU count
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_shards(cpus.next_power_of_two())
    }

    /// Create a tracker with an explicit shard count (rounded up to a
    /// power of two)
    pub fn with_shards(shards: usize) -> Self {
        let n = shards.max(1).next_power_of_two();
        let shards = (0..n).map(|_| Mutex::new(FxHashMap::default())).collect();
        TrustTracker {
            shards,
            mask: (n - 1) as u64,
        }
    }

    /// Number of lock shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, rule_id: &RuleId) -> usize {
        (xxh3_64(rule_id.as_str().as_bytes()) & self.mask) as usize
    }

    /// Record a single outcome for a rule
    pub fn update(&self, rule_id: &RuleId, outcome: bool, turn: u64) {
        let idx = self.shard_index(rule_id);
        let mut shard = self.shards[idx].lock();
        let state = shard.entry(rule_id.clone()).or_default();
        if outcome {
            state.record(1, 0, turn);
        } else {
            state.record(0, 1, turn);
        }
    }

    /// Record aggregated outcomes for many rules
    ///
    /// Deltas are grouped per shard first; shards are then visited in
    /// ascending index order, one lock at a time. Because per-rule updates
    /// are associative and commutative, any grouping or ordering yields
    /// the same final posteriors.
    pub fn batch_update(&self, deltas: &[TrustDelta], turn: u64) {
        let mut by_shard: BTreeMap<usize, Vec<&TrustDelta>> = BTreeMap::new();
        for delta in deltas {
            by_shard.entry(self.shard_index(&delta.0)).or_default().push(delta);
        }
        for (idx, bucket) in by_shard {
            let mut shard = self.shards[idx].lock();
            for (rule_id, successes, failures) in bucket {
                shard
                    .entry(rule_id.clone())
                    .or_default()
                    .record(*successes, *failures, turn);
            }
        }
    }

    /// Posterior mean for a rule; 0.5 for an unseen rule
    pub fn trust(&self, rule_id: &RuleId) -> f64 {
        self.get(rule_id).map(|s| s.mean()).unwrap_or(0.5)
    }

    /// Confidence interval for a rule; [0, 1] for an unseen rule
    pub fn ci(&self, rule_id: &RuleId, level: f64) -> (f64, f64) {
        self.get(rule_id).map(|s| s.ci(level)).unwrap_or((0.0, 1.0))
    }

    /// Full posterior for a rule, if any outcome was ever recorded
    pub fn get(&self, rule_id: &RuleId) -> Option<TrustState> {
        let idx = self.shard_index(rule_id);
        self.shards[idx].lock().get(rule_id).copied()
    }

    /// Number of tracked rules
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Whether any rule has been tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply temporal forgetting across all rules
    ///
    /// Lazy: callers invoke this at checkpoints rather than per update.
    pub fn decay(&self, half_life_turns: u64, current_turn: u64) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            for state in shard.values_mut() {
                state.decay(half_life_turns, current_turn);
            }
        }
    }

    /// Key-ordered snapshot of every posterior
    pub fn snapshot(&self) -> TrustSnapshot {
        let mut rules = BTreeMap::new();
        for shard in &self.shards {
            let shard = shard.lock();
            for (id, state) in shard.iter() {
                rules.insert(id.clone(), *state);
            }
        }
        TrustSnapshot { rules }
    }

    /// Replace all posteriors from a snapshot
    pub fn restore(&self, snapshot: &TrustSnapshot) {
        for shard in &self.shards {
            shard.lock().clear();
        }
        for (id, state) in &snapshot.rules {
            let idx = self.shard_index(id);
            self.shards[idx].lock().insert(id.clone(), *state);
        }
        debug!(target: "retrodict::trust", rules = snapshot.rules.len(), "tracker restored");
    }

    /// The `n` rules with the widest 95% confidence intervals
    ///
    /// Ties break by rule id so the ranking is deterministic.
    pub fn top_uncertain(&self, n: usize) -> Vec<(RuleId, f64)> {
        let mut all: Vec<(RuleId, f64)> = self
            .snapshot()
            .rules
            .into_iter()
            .map(|(id, state)| (id, state.ci_width(0.95)))
            .collect();
        all.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        all.truncate(n);
        all
    }
}
