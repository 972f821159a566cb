//! Causal rule definition
//!
//! A rule is a trigger predicate over the world state plus a sequence of
//! declarative effects. Applying a rule is pure given (state, rule): no
//! external I/O. Rules declare all variables they read and write, which the
//! registry uses for conflict detection and reverse inference.

use crate::world::WorldState;
use retrodict_core::{Result, RuleId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use xxhash_rust::xxh3::xxh3_64;

/// Where a rule came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    /// Hand-authored, shipped with the rule library
    Static,
    /// Produced by an upstream generator
    Generated,
}

/// Trigger predicate over the world state
///
/// Declarative so that read sets and fingerprints can be derived, and so
/// evaluation is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Fires every turn
    Always,
    /// `variable > threshold`
    VariableAbove {
        /// Variable name
        name: String,
        /// Exclusive threshold
        threshold: f64,
    },
    /// `variable < threshold`
    VariableBelow {
        /// Variable name
        name: String,
        /// Exclusive threshold
        threshold: f64,
    },
    /// `overlay > threshold`
    OverlayAbove {
        /// Overlay name
        name: String,
        /// Exclusive threshold
        threshold: f64,
    },
    /// `overlay < threshold`
    OverlayBelow {
        /// Overlay name
        name: String,
        /// Exclusive threshold
        threshold: f64,
    },
    /// Every sub-trigger holds
    All(Vec<Trigger>),
    /// At least one sub-trigger holds
    Any(Vec<Trigger>),
    /// The sub-trigger does not hold
    Not(Box<Trigger>),
}

impl Trigger {
    /// Evaluate against a world state
    pub fn holds(&self, state: &WorldState) -> bool {
        match self {
            Trigger::Always => true,
            Trigger::VariableAbove { name, threshold } => {
                state.get_variable(name, 0.0) > *threshold
            }
            Trigger::VariableBelow { name, threshold } => {
                state.get_variable(name, 0.0) < *threshold
            }
            Trigger::OverlayAbove { name, threshold } => {
                state.overlays().value_or_neutral(name) > *threshold
            }
            Trigger::OverlayBelow { name, threshold } => {
                state.overlays().value_or_neutral(name) < *threshold
            }
            Trigger::All(subs) => subs.iter().all(|t| t.holds(state)),
            Trigger::Any(subs) => subs.iter().any(|t| t.holds(state)),
            Trigger::Not(sub) => !sub.holds(state),
        }
    }

    fn collect_reads(&self, out: &mut BTreeSet<String>) {
        match self {
            Trigger::Always => {}
            Trigger::VariableAbove { name, .. } | Trigger::VariableBelow { name, .. } => {
                out.insert(format!("var:{}", name));
            }
            Trigger::OverlayAbove { name, .. } | Trigger::OverlayBelow { name, .. } => {
                out.insert(format!("overlay:{}", name));
            }
            Trigger::All(subs) | Trigger::Any(subs) => {
                for t in subs {
                    t.collect_reads(out);
                }
            }
            Trigger::Not(sub) => sub.collect_reads(out),
        }
    }
}

/// Declarative effect on the world state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    /// Add `delta` to a variable
    AdjustVariable {
        /// Variable name
        name: String,
        /// Signed change
        delta: f64,
    },
    /// Overwrite a variable
    SetVariable {
        /// Variable name
        name: String,
        /// New value
        value: f64,
    },
    /// Saturating overlay adjustment, clamped to [0, 1]
    AdjustOverlay {
        /// Overlay name
        name: String,
        /// Signed change
        delta: f64,
    },
    /// Adjust a named capital exposure; negative results are rejected
    AdjustCapital {
        /// Asset name
        asset: String,
        /// Signed change
        delta: f64,
    },
    /// Adjust the cash bucket; negative results are rejected
    AdjustCash {
        /// Signed change
        delta: f64,
    },
}

impl Effect {
    /// Apply to a world state
    pub fn apply(&self, state: &mut WorldState) -> Result<()> {
        match self {
            Effect::AdjustVariable { name, delta } => state.adjust_variable(name, *delta),
            Effect::SetVariable { name, value } => state.set_variable(name, *value),
            Effect::AdjustOverlay { name, delta } => {
                state.adjust_overlay(name, *delta);
                Ok(())
            }
            Effect::AdjustCapital { asset, delta } => {
                state.capital_mut().adjust_exposure(asset, *delta)
            }
            Effect::AdjustCash { delta } => state.capital_mut().adjust_cash(*delta),
        }
    }

    /// The write target, in the registry's conflict domain
    ///
    /// Capital effects are additive and commutative within a turn, so they
    /// are excluded from write-write conflict detection.
    pub fn write_target(&self) -> Option<String> {
        match self {
            Effect::AdjustVariable { name, .. } | Effect::SetVariable { name, .. } => {
                Some(format!("var:{}", name))
            }
            Effect::AdjustOverlay { name, .. } => Some(format!("overlay:{}", name)),
            Effect::AdjustCapital { .. } | Effect::AdjustCash { .. } => None,
        }
    }

    /// Signed direction of the effect on its target, for reverse inference
    pub fn direction(&self) -> Option<(String, f64)> {
        match self {
            Effect::AdjustVariable { name, delta } => Some((format!("var:{}", name), *delta)),
            Effect::AdjustOverlay { name, delta } => Some((format!("overlay:{}", name), *delta)),
            Effect::SetVariable { .. } | Effect::AdjustCapital { .. } | Effect::AdjustCash { .. } => {
                None
            }
        }
    }
}

/// A registered causal rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique id within a registry
    pub id: RuleId,
    /// Trigger predicate
    pub trigger: Trigger,
    /// Effects applied when the trigger holds
    pub effects: Vec<Effect>,
    /// Free-form tags
    pub symbolic_tags: BTreeSet<String>,
    /// Provenance
    pub source: RuleSource,
    /// Application priority; higher runs earlier, ties break by id
    pub priority: i64,
}

impl Rule {
    /// Convenience constructor for a static rule with default priority
    pub fn new(id: impl Into<RuleId>, trigger: Trigger, effects: Vec<Effect>) -> Self {
        Rule {
            id: id.into(),
            trigger,
            effects,
            symbolic_tags: BTreeSet::new(),
            source: RuleSource::Static,
            priority: 0,
        }
    }

    /// Builder-style tag attachment
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.symbolic_tags.insert(tag.into());
        self
    }

    /// Builder-style priority
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Everything the rule reads: trigger reads plus read-modify-write targets
    pub fn reads(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.trigger.collect_reads(&mut out);
        for effect in &self.effects {
            if let Effect::AdjustVariable { name, .. } = effect {
                out.insert(format!("var:{}", name));
            }
            if let Effect::AdjustOverlay { name, .. } = effect {
                out.insert(format!("overlay:{}", name));
            }
        }
        out
    }

    /// Everything the rule writes, in the conflict domain
    pub fn writes(&self) -> BTreeSet<String> {
        self.effects
            .iter()
            .filter_map(|e| e.write_target())
            .collect()
    }

    /// Variable names (without the `var:` prefix) this rule touches
    pub fn touched_variables(&self) -> BTreeSet<String> {
        self.reads()
            .iter()
            .chain(self.writes().iter())
            .filter_map(|t| t.strip_prefix("var:").map(str::to_string))
            .collect()
    }

    /// Content hash of the rule definition
    ///
    /// Stable across processes for identical definitions.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        format!("{:016x}", xxh3_64(&canonical))
    }
}
