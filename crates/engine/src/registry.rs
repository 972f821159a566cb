//! Rule registry with a two-phase lifecycle
//!
//! Registration is a single-writer discipline during startup; `freeze()`
//! validates the rule set and produces an immutable, shareable `FrozenRules`
//! that readers use concurrently for the whole run. A generation counter
//! guards against late mutation: a frozen set remembers the generation it
//! was built from, and the registry refuses writes once frozen.
//!
//! ## Conflict detection
//!
//! Two rules writing the same variable or overlay in one turn is a
//! configuration error raised here, not at runtime. Rules may form cycles
//! through shared variables (writer of `x` reads `y`, writer of `y` reads
//! `x`) as long as no write-write conflict exists.

use crate::rule::Rule;
use crate::world::{WorldDelta, WorldState};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use retrodict_core::{RetrodictError, Result, RuleId};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Audit record for one rule within one turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedRule {
    /// The rule that fired
    pub rule_id: RuleId,
    /// Rule fingerprint at application time
    pub fingerprint: String,
    /// Targets the rule wrote, in application order
    pub wrote: Vec<String>,
}

/// Mutable registry, valid only during startup
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: Vec<Rule>,
    by_id: FxHashMap<RuleId, usize>,
    generation: u64,
    frozen: bool,
}

impl RuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule; ids must be unique
    pub fn register(&mut self, rule: Rule) -> Result<()> {
        if self.frozen {
            return Err(RetrodictError::RegistryFrozen {
                message: format!("cannot register {} after freeze", rule.id),
            });
        }
        if self.by_id.contains_key(&rule.id) {
            return Err(RetrodictError::configuration(format!(
                "duplicate rule id: {}",
                rule.id
            )));
        }
        self.by_id.insert(rule.id.clone(), self.rules.len());
        self.rules.push(rule);
        self.generation += 1;
        Ok(())
    }

    /// Remove a rule by id
    pub fn unregister(&mut self, id: &RuleId) -> Result<()> {
        if self.frozen {
            return Err(RetrodictError::RegistryFrozen {
                message: format!("cannot unregister {} after freeze", id),
            });
        }
        let idx = self.by_id.remove(id).ok_or_else(|| {
            RetrodictError::configuration(format!("unknown rule id: {}", id))
        })?;
        self.rules.remove(idx);
        self.by_id.clear();
        for (i, rule) in self.rules.iter().enumerate() {
            self.by_id.insert(rule.id.clone(), i);
        }
        self.generation += 1;
        Ok(())
    }

    /// Number of registered rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Current generation; bumped on every mutation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Validate and freeze the rule set for a run
    ///
    /// Detects write-write conflicts across the whole set and rejects them
    /// with `ConflictingEffects`. After a successful freeze the registry
    /// refuses further mutation.
    pub fn freeze(&mut self) -> Result<Arc<FrozenRules>> {
        let mut writer_of: BTreeMap<String, &RuleId> = BTreeMap::new();
        for rule in &self.rules {
            for target in rule.writes() {
                if let Some(first) = writer_of.get(&target) {
                    return Err(RetrodictError::ConflictingEffects {
                        target,
                        first: first.to_string(),
                        second: rule.id.to_string(),
                    });
                }
                writer_of.insert(target, &rule.id);
            }
        }

        // Deterministic application order: priority descending, id ascending.
        let mut ordered = self.rules.clone();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        self.frozen = true;
        Ok(Arc::new(FrozenRules {
            rules: ordered,
            generation: self.generation,
        }))
    }
}

/// Immutable rule set shared by all workers for a run
#[derive(Debug)]
pub struct FrozenRules {
    rules: Vec<Rule>,
    generation: u64,
}

impl FrozenRules {
    /// Rules in application order
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Generation of the registry this set was frozen from
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Look up a rule by id
    pub fn get(&self, id: &RuleId) -> Option<&Rule> {
        self.rules.iter().find(|r| &r.id == id)
    }

    /// Variables each rule touches, for curriculum weighting
    pub fn variables_by_rule(&self) -> BTreeMap<RuleId, Vec<String>> {
        self.rules
            .iter()
            .map(|r| {
                (
                    r.id.clone(),
                    r.touched_variables().into_iter().collect::<Vec<_>>(),
                )
            })
            .collect()
    }

    /// Apply every rule whose trigger holds, in deterministic order
    ///
    /// Triggers are evaluated against the state as it evolves through the
    /// turn. On the first effect error the partial turn is surfaced to the
    /// caller, which rolls the world back to its pre-turn snapshot.
    pub fn apply_all(&self, state: &mut WorldState) -> Result<Vec<AppliedRule>> {
        let mut applied = Vec::new();
        for rule in &self.rules {
            if !rule.trigger.holds(state) {
                continue;
            }
            let mut wrote: SmallVec<[String; 4]> = SmallVec::new();
            for effect in &rule.effects {
                effect.apply(state).map_err(|e| {
                    RetrodictError::rule_execution(rule.id.as_str(), e.to_string())
                })?;
                if let Some(target) = effect.write_target() {
                    wrote.push(target);
                }
            }
            applied.push(AppliedRule {
                rule_id: rule.id.clone(),
                fingerprint: rule.fingerprint(),
                wrote: wrote.into_vec(),
            });
        }
        Ok(applied)
    }

    /// Infer plausible rules that could have produced an observed delta
    ///
    /// A rule is a candidate when every directional effect it declares
    /// moved its target in the declared direction. Used by the audit trail
    /// and the curriculum; heuristic, never authoritative.
    pub fn reverse_apply(&self, delta: &WorldDelta) -> Vec<RuleId> {
        let mut candidates = Vec::new();
        for rule in &self.rules {
            let mut directional = 0;
            let mut matched = 0;
            for effect in &rule.effects {
                let Some((target, direction)) = effect.direction() else {
                    continue;
                };
                directional += 1;
                let observed = if let Some(name) = target.strip_prefix("var:") {
                    delta.variables.get(name).map(|(pre, post)| post - pre)
                } else if let Some(name) = target.strip_prefix("overlay:") {
                    delta.overlays.get(name).map(|(pre, post)| post - pre)
                } else {
                    None
                };
                match observed {
                    Some(change) if change * direction > 0.0 => matched += 1,
                    _ => {}
                }
            }
            if directional > 0 && matched == directional {
                candidates.push(rule.id.clone());
            }
        }
        candidates
    }
}

/// Process-wide registry for startup registration
///
/// Mutable during startup, frozen before the coordinator starts. Library
/// embedders that want isolation should construct their own `RuleRegistry`
/// instead.
static GLOBAL_REGISTRY: Lazy<RwLock<RuleRegistry>> =
    Lazy::new(|| RwLock::new(RuleRegistry::new()));

/// Access the process-wide registry
pub fn global_registry() -> &'static RwLock<RuleRegistry> {
    &GLOBAL_REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Effect, Trigger};
    use crate::world::Capital;
    use retrodict_core::SimId;

    fn world() -> WorldState {
        WorldState::new(
            vec![("x".to_string(), 12.0), ("y".to_string(), 0.0)],
            Capital::with_cash(100.0).unwrap(),
            SimId::new("registry-test"),
        )
        .unwrap()
    }

    fn rule(id: &str, trigger: Trigger, effects: Vec<Effect>) -> Rule {
        Rule::new(id, trigger, effects)
    }

    fn bump_y(id: &str) -> Rule {
        rule(
            id,
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
    fn test_duplicate_id_rejected() {
        let mut registry = RuleRegistry::new();
        registry.register(bump_y("R1")).unwrap();
        let err = registry.register(bump_y("R1")).unwrap_err();
        assert!(err.to_string().contains("duplicate rule id"));
    }

    #[test]
    fn test_write_write_conflict_rejected_at_freeze() {
        let mut registry = RuleRegistry::new();
        registry.register(bump_y("R1")).unwrap();
        registry.register(bump_y("R2")).unwrap();
        let err = registry.freeze().unwrap_err();
        assert!(matches!(err, RetrodictError::ConflictingEffects { .. }));
    }

    #[test]
    fn test_cycle_without_conflict_allowed() {
        // writer of y reads x, writer of x reads y: a cycle, but no
        // write-write conflict, so it must freeze.
        let mut registry = RuleRegistry::new();
        registry.register(bump_y("R1")).unwrap();
        registry
            .register(rule(
                "R2",
                Trigger::VariableAbove {
                    name: "y".to_string(),
                    threshold: 0.0,
                },
                vec![Effect::AdjustVariable {
                    name: "x".to_string(),
                    delta: -1.0,
                }],
            ))
            .unwrap();
        assert!(registry.freeze().is_ok());
    }

    #[test]
    fn test_mutation_after_freeze_rejected() {
        let mut registry = RuleRegistry::new();
        registry.register(bump_y("R1")).unwrap();
        let frozen = registry.freeze().unwrap();
        assert_eq!(frozen.generation(), registry.generation());

        let err = registry.register(bump_y("R3")).unwrap_err();
        assert!(matches!(err, RetrodictError::RegistryFrozen { .. }));
        let err = registry.unregister(&RuleId::new("R1")).unwrap_err();
        assert!(matches!(err, RetrodictError::RegistryFrozen { .. }));
    }

    #[test]
    fn test_application_order_priority_then_id() {
        let mut registry = RuleRegistry::new();
        registry
            .register(
                rule(
                    "B",
                    Trigger::Always,
                    vec![Effect::AdjustOverlay {
                        name: "momentum".to_string(),
                        delta: 0.1,
                    }],
                )
                .with_priority(1),
            )
            .unwrap();
        registry
            .register(rule(
                "A",
                Trigger::Always,
                vec![Effect::AdjustOverlay {
                    name: "caution".to_string(),
                    delta: 0.1,
                }],
            ))
            .unwrap();
        registry
            .register(
                rule(
                    "C",
                    Trigger::Always,
                    vec![Effect::AdjustOverlay {
                        name: "stress".to_string(),
                        delta: 0.1,
                    }],
                )
                .with_priority(1),
            )
            .unwrap();

        let frozen = registry.freeze().unwrap();
        let order: Vec<&str> = frozen.rules().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(order, vec!["B", "C", "A"]);
    }

    #[test]
    fn test_apply_all_returns_audit_records() {
        let mut registry = RuleRegistry::new();
        registry.register(bump_y("R1")).unwrap();
        let frozen = registry.freeze().unwrap();

        let mut state = world();
        let applied = frozen.apply_all(&mut state).unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].rule_id.as_str(), "R1");
        assert_eq!(applied[0].wrote, vec!["var:y".to_string()]);
        assert_eq!(state.get_variable("y", 0.0), 1.0);
    }

    #[test]
    fn test_apply_all_surfaces_rule_error() {
        let mut registry = RuleRegistry::new();
        registry
            .register(rule(
                "drain",
                Trigger::Always,
                vec![Effect::AdjustCash { delta: -1e9 }],
            ))
            .unwrap();
        let frozen = registry.freeze().unwrap();
        let mut state = world();
        let err = frozen.apply_all(&mut state).unwrap_err();
        assert!(matches!(err, RetrodictError::RuleExecution { .. }));
    }

    #[test]
    fn test_global_registry_is_shared() {
        // The process-wide registry accepts startup registration from any
        // call site; use a unique id to stay independent of other tests.
        let id = RuleId::new("global-smoke");
        {
            let mut registry = global_registry().write();
            if registry.by_id.contains_key(&id) {
                registry.unregister(&id).unwrap();
            }
            let before = registry.generation();
            registry
                .register(rule(
                    "global-smoke",
                    Trigger::Always,
                    vec![Effect::AdjustOverlay {
                        name: "momentum".to_string(),
                        delta: 0.1,
                    }],
                ))
                .unwrap();
            assert!(registry.generation() > before);
        }
        assert!(global_registry().read().len() >= 1);
        global_registry().write().unregister(&id).unwrap();
    }

    #[test]
    fn test_reverse_apply_matches_direction() {
        let mut registry = RuleRegistry::new();
        registry.register(bump_y("R1")).unwrap();
        let frozen = registry.freeze().unwrap();

        let pre = world().snapshot();
        let mut post = world();
        post.adjust_variable("y", 2.0).unwrap();
        let delta = post.diff_from(&pre);
        assert_eq!(frozen.reverse_apply(&delta), vec![RuleId::new("R1")]);

        let mut reverse = world();
        reverse.adjust_variable("y", -2.0).unwrap();
        let delta = reverse.diff_from(&pre);
        assert!(frozen.reverse_apply(&delta).is_empty());
    }
}
