//! World state container
//!
//! The full typed snapshot of the simulation at a turn: variables, capital
//! exposures, overlays, event log, and free-form metadata.
//!
//! ## Invariants
//!
//! - every overlay value stays in [0, 1] (clamped on write)
//! - every capital bucket stays >= 0 (violations rejected at apply time)
//! - `turn` is monotonically non-decreasing across a run
//! - `from_snapshot(snapshot())` is the identity modulo float tolerance
//! - `clone_state()` yields a deep-independent copy
//!
//! ## Ownership
//!
//! A world is created by the coordinator at batch start and mutated only by
//! the turn runner inside a single worker. It is cloned before each replay
//! branch and serialized into the audit trail at checkpoint boundaries.

use crate::overlay::Overlays;
use retrodict_core::{now_seconds, RetrodictError, Result, SimId};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use xxhash_rust::xxh3::xxh3_64;

/// Named capital exposures plus the distinguished cash bucket
///
/// All buckets are non-negative at all times; operations that would go
/// negative are rejected, not clamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capital {
    /// The distinguished cash bucket
    pub cash: f64,
    exposures: FxHashMap<String, f64>,
}

impl Capital {
    /// Create capital holding only cash
    pub fn with_cash(cash: f64) -> Result<Self> {
        if cash < 0.0 || !cash.is_finite() {
            return Err(RetrodictError::OutOfRange {
                name: "cash".to_string(),
                value: cash,
            });
        }
        Ok(Capital {
            cash,
            exposures: FxHashMap::default(),
        })
    }

    /// Read an exposure; absent assets read as zero
    pub fn exposure(&self, asset: &str) -> f64 {
        self.exposures.get(asset).copied().unwrap_or(0.0)
    }

    /// Adjust a named exposure by `delta`, rejecting negative results
    pub fn adjust_exposure(&mut self, asset: &str, delta: f64) -> Result<()> {
        let next = self.exposure(asset) + delta;
        if next < 0.0 || !next.is_finite() {
            return Err(RetrodictError::OutOfRange {
                name: asset.to_string(),
                value: next,
            });
        }
        self.exposures.insert(asset.to_string(), next);
        Ok(())
    }

    /// Adjust the cash bucket by `delta`, rejecting negative results
    pub fn adjust_cash(&mut self, delta: f64) -> Result<()> {
        let next = self.cash + delta;
        if next < 0.0 || !next.is_finite() {
            return Err(RetrodictError::OutOfRange {
                name: "cash".to_string(),
                value: next,
            });
        }
        self.cash = next;
        Ok(())
    }

    /// Total capital across cash and all exposures
    pub fn total(&self) -> f64 {
        self.cash + self.exposures.values().sum::<f64>()
    }

    /// All exposures, key-ordered
    pub fn exposures_ordered(&self) -> BTreeMap<String, f64> {
        self.exposures
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

/// Structured event appended to the world's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldEvent {
    /// Turn at which the event was logged
    pub turn: u64,
    /// Event kind (user-defined category)
    pub kind: String,
    /// Human-readable description
    pub description: String,
    /// Arbitrary structured payload
    pub data: serde_json::Value,
}

/// Fully serializable world snapshot
///
/// Canonical key-ordered layout: `from_snapshot(snapshot())` is the
/// identity modulo float tolerance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    /// Turn counter
    pub turn: u64,
    /// Simulation id
    pub sim_id: SimId,
    /// Wall-clock seconds
    pub timestamp: f64,
    /// Variables, key-ordered
    pub variables: BTreeMap<String, f64>,
    /// Cash bucket
    pub cash: f64,
    /// Exposures, key-ordered
    pub exposures: BTreeMap<String, f64>,
    /// Overlay container (values + metadata)
    pub overlays: Overlays,
    /// Ordered event log
    pub event_log: Vec<WorldEvent>,
    /// Free-form metadata
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl WorldSnapshot {
    /// Content hash of the canonical JSON form
    ///
    /// Stable across processes for identical snapshots; used for audit
    /// records and replay fidelity checks.
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        format!("{:016x}", xxh3_64(&canonical))
    }
}

/// Per-turn observed change between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldDelta {
    /// Variable changes: name -> (before, after)
    pub variables: BTreeMap<String, (f64, f64)>,
    /// Overlay changes: name -> (before, after)
    pub overlays: BTreeMap<String, (f64, f64)>,
    /// Capital changes (cash under the `cash` key): name -> (before, after)
    pub capital: BTreeMap<String, (f64, f64)>,
}

impl WorldDelta {
    /// True when nothing changed between the snapshots
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty() && self.overlays.is_empty() && self.capital.is_empty()
    }

    /// Net change of a variable, when it changed
    pub fn variable_change(&self, name: &str) -> Option<f64> {
        self.variables.get(name).map(|(pre, post)| post - pre)
    }
}

const FLOAT_TOLERANCE: f64 = 1e-9;

fn diff_maps(
    pre: &BTreeMap<String, f64>,
    post: &BTreeMap<String, f64>,
) -> BTreeMap<String, (f64, f64)> {
    let mut out = BTreeMap::new();
    for (name, post_v) in post {
        let pre_v = pre.get(name).copied().unwrap_or(0.0);
        if (post_v - pre_v).abs() > FLOAT_TOLERANCE {
            out.insert(name.clone(), (pre_v, *post_v));
        }
    }
    for (name, pre_v) in pre {
        if !post.contains_key(name) {
            out.insert(name.clone(), (*pre_v, 0.0));
        }
    }
    out
}

/// The typed world container
#[derive(Debug, Clone)]
pub struct WorldState {
    turn: u64,
    sim_id: SimId,
    timestamp: f64,
    variables: FxHashMap<String, f64>,
    capital: Capital,
    overlays: Overlays,
    event_log: Vec<WorldEvent>,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl WorldState {
    /// Construct a world at turn zero
    ///
    /// Validates that every initial variable is finite and every capital
    /// bucket non-negative.
    pub fn new(
        initial_variables: impl IntoIterator<Item = (String, f64)>,
        initial_capital: Capital,
        sim_id: SimId,
    ) -> Result<Self> {
        let mut variables = FxHashMap::default();
        for (name, value) in initial_variables {
            if !value.is_finite() {
                return Err(RetrodictError::InvalidValue { name, value });
            }
            variables.insert(name, value);
        }
        Ok(WorldState {
            turn: 0,
            sim_id,
            timestamp: now_seconds(),
            variables,
            capital: initial_capital,
            overlays: Overlays::new(),
            event_log: Vec::new(),
            metadata: BTreeMap::new(),
        })
    }

    /// Current turn
    pub fn turn(&self) -> u64 {
        self.turn
    }

    /// Simulation id
    pub fn sim_id(&self) -> &SimId {
        &self.sim_id
    }

    /// Wall-clock seconds of the world
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Set the wall-clock seconds; `advance_turn` never touches this
    pub fn set_timestamp(&mut self, seconds: f64) {
        self.timestamp = seconds;
    }

    /// Read a variable with a fallback default
    pub fn get_variable(&self, name: &str, default: f64) -> f64 {
        self.variables.get(name).copied().unwrap_or(default)
    }

    /// Whether a variable exists
    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// Write a variable; non-finite values are rejected
    pub fn set_variable(&mut self, name: &str, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(RetrodictError::InvalidValue {
                name: name.to_string(),
                value,
            });
        }
        self.variables.insert(name.to_string(), value);
        Ok(())
    }

    /// Add `delta` to a variable (absent variables start at zero)
    pub fn adjust_variable(&mut self, name: &str, delta: f64) -> Result<()> {
        let next = self.get_variable(name, 0.0) + delta;
        self.set_variable(name, next)
    }

    /// Variable names currently present
    pub fn variable_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.variables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Overlay container (read)
    pub fn overlays(&self) -> &Overlays {
        &self.overlays
    }

    /// Saturating overlay adjustment, clamped to [0, 1]
    ///
    /// Creates a dynamic overlay when `name` is unknown. Core overlays are
    /// predeclared, so this never fails.
    pub fn adjust_overlay(&mut self, name: &str, delta: f64) {
        self.overlays.adjust(name, delta);
    }

    /// Overlay container (write), for decay and metadata edits
    pub fn overlays_mut(&mut self) -> &mut Overlays {
        &mut self.overlays
    }

    /// Capital container (read)
    pub fn capital(&self) -> &Capital {
        &self.capital
    }

    /// Capital container (write)
    pub fn capital_mut(&mut self) -> &mut Capital {
        &mut self.capital
    }

    /// Free-form metadata (write)
    pub fn metadata_mut(&mut self) -> &mut BTreeMap<String, serde_json::Value> {
        &mut self.metadata
    }

    /// Advance one turn; timestamp is left to the caller
    pub fn advance_turn(&mut self) {
        self.turn += 1;
    }

    /// Append a structured event to the log
    pub fn log_event(
        &mut self,
        kind: impl Into<String>,
        description: impl Into<String>,
        data: serde_json::Value,
    ) {
        self.event_log.push(WorldEvent {
            turn: self.turn,
            kind: kind.into(),
            description: description.into(),
            data,
        });
    }

    /// The ordered event log
    pub fn event_log(&self) -> &[WorldEvent] {
        &self.event_log
    }

    /// Produce a canonical key-ordered snapshot
    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            turn: self.turn,
            sim_id: self.sim_id.clone(),
            timestamp: self.timestamp,
            variables: self
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            cash: self.capital.cash,
            exposures: self.capital.exposures_ordered(),
            overlays: self.overlays.clone(),
            event_log: self.event_log.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Rebuild a world from a snapshot
    ///
    /// Symmetric with `snapshot()`: the round trip is the identity modulo
    /// float tolerance.
    pub fn from_snapshot(snap: &WorldSnapshot) -> Result<Self> {
        let mut capital = Capital::with_cash(snap.cash)?;
        for (asset, value) in &snap.exposures {
            capital.adjust_exposure(asset, *value)?;
        }
        let mut world = WorldState::new(
            snap.variables.iter().map(|(k, v)| (k.clone(), *v)),
            capital,
            snap.sim_id.clone(),
        )?;
        world.turn = snap.turn;
        world.timestamp = snap.timestamp;
        world.overlays = snap.overlays.clone();
        world.event_log = snap.event_log.clone();
        world.metadata = snap.metadata.clone();
        Ok(world)
    }

    /// Deep-independent copy: mutations to the clone never alias the source
    pub fn clone_state(&self) -> Self {
        self.clone()
    }

    /// Compute the observed change from `pre` to this world
    pub fn diff_from(&self, pre: &WorldSnapshot) -> WorldDelta {
        let post = self.snapshot();
        let mut capital_pre = pre.exposures.clone();
        capital_pre.insert("cash".to_string(), pre.cash);
        let mut capital_post = post.exposures.clone();
        capital_post.insert("cash".to_string(), post.cash);
        WorldDelta {
            variables: diff_maps(&pre.variables, &post.variables),
            overlays: diff_maps(pre.overlays.as_mapping(), post.overlays.as_mapping()),
            capital: diff_maps(&capital_pre, &capital_post),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_world() -> WorldState {
        let mut capital = Capital::with_cash(1000.0).unwrap();
        capital.adjust_exposure("equities", 250.0).unwrap();
        let mut world = WorldState::new(
            vec![("x".to_string(), 12.5), ("y".to_string(), -3.0)],
            capital,
            SimId::new("sim-test"),
        )
        .unwrap();
        world.adjust_overlay("optimism", 0.2);
        world.log_event("seed", "initial world", serde_json::json!({"note": "test"}));
        world
    }

    #[test]
    fn test_new_rejects_non_finite_variable() {
        let capital = Capital::with_cash(0.0).unwrap();
        let err = WorldState::new(
            vec![("x".to_string(), f64::NAN)],
            capital,
            SimId::new("s"),
        )
        .unwrap_err();
        assert!(matches!(err, RetrodictError::InvalidValue { .. }));
    }

    #[test]
    fn test_capital_rejects_negative() {
        let mut capital = Capital::with_cash(100.0).unwrap();
        let err = capital.adjust_cash(-150.0).unwrap_err();
        assert!(matches!(err, RetrodictError::OutOfRange { .. }));
        // rejected, not clamped
        assert_eq!(capital.cash, 100.0);

        let err = capital.adjust_exposure("bonds", -1.0).unwrap_err();
        assert!(matches!(err, RetrodictError::OutOfRange { .. }));
        assert_eq!(capital.exposure("bonds"), 0.0);
    }

    #[test]
    fn test_snapshot_roundtrip_identity() {
        let world = sample_world();
        let snap = world.snapshot();
        let rebuilt = WorldState::from_snapshot(&snap).unwrap();
        assert_eq!(rebuilt.snapshot(), snap);
        assert_eq!(rebuilt.snapshot().content_hash(), snap.content_hash());
    }

    #[test]
    fn test_clone_is_independent() {
        let world = sample_world();
        let mut clone = world.clone_state();
        clone.set_variable("x", 99.0).unwrap();
        clone.adjust_overlay("stress", 0.4);
        clone.capital_mut().adjust_cash(-500.0).unwrap();
        assert_eq!(world.get_variable("x", 0.0), 12.5);
        assert_eq!(world.overlays().get("stress"), Some(0.5));
        assert_eq!(world.capital().cash, 1000.0);
    }

    #[test]
    fn test_advance_turn_monotonic_and_timestamp_untouched() {
        let mut world = sample_world();
        let ts = world.timestamp();
        let before = world.turn();
        world.advance_turn();
        world.advance_turn();
        assert_eq!(world.turn(), before + 2);
        assert_eq!(world.timestamp(), ts);
    }

    #[test]
    fn test_diff_reports_changes_with_before_after() {
        let world = sample_world();
        let pre = world.snapshot();
        let mut post = world.clone_state();
        post.set_variable("x", 20.0).unwrap();
        post.adjust_overlay("stress", 0.25);
        post.capital_mut().adjust_cash(-100.0).unwrap();

        let delta = post.diff_from(&pre);
        assert_eq!(delta.variables.get("x"), Some(&(12.5, 20.0)));
        assert_eq!(delta.variable_change("x"), Some(7.5));
        assert_eq!(delta.overlays.get("stress"), Some(&(0.5, 0.75)));
        assert_eq!(delta.capital.get("cash"), Some(&(1000.0, 900.0)));
        assert!(delta.variables.get("y").is_none());
    }

    #[test]
    fn test_event_log_ordered() {
        let mut world = sample_world();
        world.advance_turn();
        world.log_event("fire", "second", serde_json::Value::Null);
        let log = world.event_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].kind, "seed");
        assert_eq!(log[1].turn, 1);
    }

    #[test]
    fn test_content_hash_stable_and_sensitive() {
        let world = sample_world();
        let h1 = world.snapshot().content_hash();
        let h2 = world.snapshot().content_hash();
        assert_eq!(h1, h2);

        let mut changed = world.clone_state();
        changed.set_variable("x", 13.0).unwrap();
        assert_ne!(changed.snapshot().content_hash(), h1);
    }

    proptest::proptest! {
        #[test]
        fn prop_snapshot_roundtrip(
            vars in proptest::collection::btree_map("[a-z]{1,6}", -1e6f64..1e6, 0..8),
            cash in 0.0f64..1e9,
        ) {
            let capital = Capital::with_cash(cash).unwrap();
            let world = WorldState::new(
                vars.iter().map(|(k, v)| (k.clone(), *v)),
                capital,
                SimId::new("prop"),
            ).unwrap();
            let snap = world.snapshot();
            let rebuilt = WorldState::from_snapshot(&snap).unwrap();
            proptest::prop_assert_eq!(rebuilt.snapshot(), snap);
        }
    }
}
