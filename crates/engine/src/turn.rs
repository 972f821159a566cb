//! Turn runner
//!
//! Advances a world state one step: rule application, overlay decay, turn
//! increment, delta computation. A turn is atomic: if any rule raises, the
//! world rolls back to its pre-turn snapshot and the error is recorded in
//! the returned record rather than propagated. No suspension may observe a
//! world with a turn partially applied.

use crate::registry::{AppliedRule, FrozenRules};
use crate::world::{WorldDelta, WorldState};
use retrodict_core::{DecayPhase, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Turn runner configuration
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Multiplicative overlay shrink toward neutral per turn
    pub decay_rate: f64,
    /// Whether decay runs before or after rule effects
    pub decay_phase: DecayPhase,
}

impl Default for TurnConfig {
    fn default() -> Self {
        TurnConfig {
            decay_rate: 0.02,
            decay_phase: DecayPhase::AfterRules,
        }
    }
}

/// Structured audit record for one turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Turn counter after the advance
    pub turn: u64,
    /// Rules that fired, in application order
    pub fired: Vec<AppliedRule>,
    /// Observed pre-to-post change
    pub deltas: WorldDelta,
    /// Content hash of the pre-turn snapshot
    pub pre_hash: String,
    /// Content hash of the post-turn snapshot
    pub post_hash: String,
    /// Error that aborted the turn, when it rolled back
    pub error: Option<String>,
}

impl TurnRecord {
    /// Whether the turn was aborted and rolled back
    pub fn aborted(&self) -> bool {
        self.error.is_some()
    }
}

/// Advances world states one atomic turn at a time
#[derive(Debug, Clone)]
pub struct TurnRunner {
    rules: Arc<FrozenRules>,
    config: TurnConfig,
}

impl TurnRunner {
    /// Create a runner over a frozen rule set
    pub fn new(rules: Arc<FrozenRules>, config: TurnConfig) -> Self {
        TurnRunner { rules, config }
    }

    /// The frozen rule set this runner applies
    pub fn rules(&self) -> &Arc<FrozenRules> {
        &self.rules
    }

    /// Advance one turn
    ///
    /// On a rule failure the world is restored to its pre-turn snapshot and
    /// the record carries the diagnostic; the caller decides whether the
    /// abort rate fails the batch.
    pub fn run_turn(&self, state: &mut WorldState) -> Result<TurnRecord> {
        let pre = state.snapshot();
        let pre_hash = pre.content_hash();

        if self.config.decay_phase == DecayPhase::BeforeRules {
            state.overlays_mut().decay(self.config.decay_rate);
        }

        let fired = match self.rules.apply_all(state) {
            Ok(fired) => fired,
            Err(e) => {
                debug!(target: "retrodict::turn", turn = pre.turn, error = %e, "turn aborted, rolling back");
                *state = WorldState::from_snapshot(&pre)?;
                return Ok(TurnRecord {
                    turn: pre.turn,
                    fired: Vec::new(),
                    deltas: WorldDelta::default(),
                    post_hash: pre_hash.clone(),
                    pre_hash,
                    error: Some(e.to_string()),
                });
            }
        };

        if self.config.decay_phase == DecayPhase::AfterRules {
            state.overlays_mut().decay(self.config.decay_rate);
        }

        state.advance_turn();

        let deltas = state.diff_from(&pre);
        let post_hash = state.snapshot().content_hash();

        Ok(TurnRecord {
            turn: state.turn(),
            fired,
            deltas,
            pre_hash,
            post_hash,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RuleRegistry;
    use crate::rule::{Effect, Rule, Trigger};
    use crate::world::Capital;
    use retrodict_core::SimId;

    fn world(x: f64) -> WorldState {
        WorldState::new(
            vec![("x".to_string(), x), ("y".to_string(), 0.0)],
            Capital::with_cash(100.0).unwrap(),
            SimId::new("turn-test"),
        )
        .unwrap()
    }

    fn runner_with(rules: Vec<Rule>, config: TurnConfig) -> TurnRunner {
        let mut registry = RuleRegistry::new();
        for r in rules {
            registry.register(r).unwrap();
        }
        TurnRunner::new(registry.freeze().unwrap(), config)
    }

    fn bump_rule() -> Rule {
        Rule::new(
            "R1",
            Trigger::VariableAbove {
                name: "x".to_string(),
                threshold: 10.0,
            },
            vec![Effect::AdjustVariable {
                name: "y".to_string(),
                delta: 1.0,
            }],
        )
    }

    #[test]
    fn test_turn_advances_and_records_deltas() {
        let runner = runner_with(vec![bump_rule()], TurnConfig::default());
        let mut state = world(12.0);
        let record = runner.run_turn(&mut state).unwrap();

        assert!(!record.aborted());
        assert_eq!(record.turn, 1);
        assert_eq!(state.turn(), 1);
        assert_eq!(record.fired.len(), 1);
        assert_eq!(record.deltas.variable_change("y"), Some(1.0));
        assert_ne!(record.pre_hash, record.post_hash);
    }

    #[test]
    fn test_non_firing_turn_still_advances() {
        let runner = runner_with(vec![bump_rule()], TurnConfig::default());
        let mut state = world(3.0);
        let record = runner.run_turn(&mut state).unwrap();
        assert!(record.fired.is_empty());
        assert_eq!(state.turn(), 1);
    }

    #[test]
    fn test_aborted_turn_rolls_back() {
        let failing = Rule::new(
            "drain",
            Trigger::Always,
            vec![
                Effect::AdjustVariable {
                    name: "y".to_string(),
                    delta: 5.0,
                },
                Effect::AdjustCash { delta: -1e9 },
            ],
        );
        let runner = runner_with(vec![failing], TurnConfig::default());
        let mut state = world(12.0);
        let before = state.snapshot();

        let record = runner.run_turn(&mut state).unwrap();
        assert!(record.aborted());
        assert!(record.error.as_ref().unwrap().contains("drain"));
        // full rollback: the partial y write is gone and the turn did not advance
        assert_eq!(state.snapshot(), before);
        assert_eq!(record.pre_hash, record.post_hash);
    }

    #[test]
    fn test_decay_after_rules_by_default() {
        let boost = Rule::new(
            "boost",
            Trigger::Always,
            vec![Effect::AdjustOverlay {
                name: "optimism".to_string(),
                delta: 0.5,
            }],
        );
        let runner = runner_with(
            vec![boost],
            TurnConfig {
                decay_rate: 0.1,
                decay_phase: DecayPhase::AfterRules,
            },
        );
        let mut state = world(0.0);
        runner.run_turn(&mut state).unwrap();
        // 0.5 + 0.5 = 1.0 clamped, then decayed toward neutral: 0.5 + 0.5 * 0.9
        let v = state.overlays().get("optimism").unwrap();
        assert!((v - 0.95).abs() < 1e-12);
    }

    #[test]
    fn test_decay_before_rules_when_configured() {
        let runner = runner_with(
            Vec::new(),
            TurnConfig {
                decay_rate: 0.5,
                decay_phase: DecayPhase::BeforeRules,
            },
        );
        let mut state = world(0.0);
        state.adjust_overlay("stress", 0.4); // 0.9
        runner.run_turn(&mut state).unwrap();
        let v = state.overlays().get("stress").unwrap();
        assert!((v - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_turn_is_deterministic() {
        let runner = runner_with(vec![bump_rule()], TurnConfig::default());
        let mut a = world(12.0);
        let mut b = world(12.0);
        // pin timestamps so the two worlds hash identically
        a.set_timestamp(1000.0);
        b.set_timestamp(1000.0);
        let ra = runner.run_turn(&mut a).unwrap();
        let rb = runner.run_turn(&mut b).unwrap();
        assert_eq!(ra, rb);
    }
}
