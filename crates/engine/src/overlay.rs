//! Continuous overlay container
//!
//! Overlays are named continuous latents in [0, 1] attached to the world
//! state. A fixed core set is predeclared on every world; dynamic overlays
//! are created on first write. Every overlay carries metadata (category,
//! optional parent, priority). Values outside [0, 1] are clamped on write,
//! never rejected.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The predeclared core overlay set
///
/// Core overlays exist on every world state from construction, so reads of
/// a core overlay can never miss.
pub const CORE_OVERLAYS: [&str; 5] = ["optimism", "caution", "volatility", "momentum", "stress"];

/// Neutral resting value for an overlay
pub const NEUTRAL: f64 = 0.5;

/// Metadata attached to each overlay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayMeta {
    /// Category: `core` for predeclared overlays, `dynamic` otherwise
    pub category: String,
    /// Optional parent overlay this one refines
    pub parent: Option<String>,
    /// Relative priority among overlays in the same category
    pub priority: i32,
}

impl OverlayMeta {
    fn core() -> Self {
        OverlayMeta {
            category: "core".to_string(),
            parent: None,
            priority: 0,
        }
    }

    fn dynamic() -> Self {
        OverlayMeta {
            category: "dynamic".to_string(),
            parent: None,
            priority: 0,
        }
    }
}

/// Typed overlay container: fixed core fields plus a dynamic side map
///
/// The interface is uniform across both sets: `get`, `set`, `adjust`,
/// `as_mapping`. Internally both live in ordered maps so snapshots are
/// canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overlays {
    values: BTreeMap<String, f64>,
    meta: BTreeMap<String, OverlayMeta>,
}

impl Default for Overlays {
    fn default() -> Self {
        Self::new()
    }
}

impl Overlays {
    /// Create the container with the core set at neutral
    pub fn new() -> Self {
        let mut values = BTreeMap::new();
        let mut meta = BTreeMap::new();
        for name in CORE_OVERLAYS {
            values.insert(name.to_string(), NEUTRAL);
            meta.insert(name.to_string(), OverlayMeta::core());
        }
        Overlays { values, meta }
    }

    /// Whether `name` belongs to the predeclared core set
    pub fn is_core(name: &str) -> bool {
        CORE_OVERLAYS.contains(&name)
    }

    /// Read an overlay value; `None` for an undeclared dynamic overlay
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// Read an overlay value, defaulting to neutral when undeclared
    pub fn value_or_neutral(&self, name: &str) -> f64 {
        self.get(name).unwrap_or(NEUTRAL)
    }

    /// Set an overlay value, clamped to [0, 1]
    ///
    /// Creates a dynamic overlay when `name` is unknown.
    pub fn set(&mut self, name: &str, value: f64) {
        let clamped = value.clamp(0.0, 1.0);
        if !self.values.contains_key(name) {
            self.meta.insert(name.to_string(), OverlayMeta::dynamic());
        }
        self.values.insert(name.to_string(), clamped);
    }

    /// Saturating add, clamped to [0, 1]
    ///
    /// Creates a dynamic overlay (starting from neutral) when unknown.
    pub fn adjust(&mut self, name: &str, delta: f64) {
        let current = self.value_or_neutral(name);
        self.set(name, current + delta);
    }

    /// Metadata for an overlay
    pub fn meta(&self, name: &str) -> Option<&OverlayMeta> {
        self.meta.get(name)
    }

    /// Replace the metadata of a dynamic overlay
    pub fn set_meta(&mut self, name: &str, meta: OverlayMeta) {
        self.meta.insert(name.to_string(), meta);
    }

    /// All overlay values, key-ordered
    pub fn as_mapping(&self) -> &BTreeMap<String, f64> {
        &self.values
    }

    /// All overlay metadata, key-ordered
    pub fn meta_mapping(&self) -> &BTreeMap<String, OverlayMeta> {
        &self.meta
    }

    /// Multiplicative shrink toward neutral by `rate` per call
    ///
    /// `rate` = 0 leaves values untouched; `rate` = 1 snaps to neutral.
    /// Results stay inside [0, 1] by construction.
    pub fn decay(&mut self, rate: f64) {
        let rate = rate.clamp(0.0, 1.0);
        for value in self.values.values_mut() {
            *value = NEUTRAL + (*value - NEUTRAL) * (1.0 - rate);
        }
    }

    /// Number of overlays (core + dynamic)
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when only the core set exists and all values are neutral
    pub fn is_empty(&self) -> bool {
        self.values.len() == CORE_OVERLAYS.len()
            && self.values.values().all(|v| (*v - NEUTRAL).abs() < f64::EPSILON)
    }
}
