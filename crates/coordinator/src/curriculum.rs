//! Retrodiction curriculum
//!
//! Reweights planned batches by current uncertainty: batches whose
//! variables feed rules with wide confidence intervals get higher
//! priority, as do batches in under-sampled regions of the time axis.
//! The curriculum only changes `priority`; it never drops or reorders
//! batches, so planning stays deterministic.

use crate::batch::TrainingBatch;
use retrodict_engine::FrozenRules;
use retrodict_trust::TrustTracker;
use std::collections::BTreeMap;
use tracing::debug;

/// Curriculum weighting parameters
#[derive(Debug, Clone)]
pub struct CurriculumConfig {
    /// Base priority every batch starts from
    pub base_priority: f64,
    /// Weight of the rule-uncertainty term
    pub uncertainty_weight: f64,
    /// Weight of the under-sampling term
    pub coverage_weight: f64,
}

impl Default for CurriculumConfig {
    fn default() -> Self {
        CurriculumConfig {
            base_priority: 1.0,
            uncertainty_weight: 2.0,
            coverage_weight: 0.5,
        }
    }
}

/// Adaptive batch weighting over a frozen rule set
pub struct Curriculum {
    config: CurriculumConfig,
    /// variable -> rules that touch it, derived at construction
    rules_by_variable: BTreeMap<String, Vec<String>>,
}

impl Curriculum {
    /// Build a curriculum for a frozen rule set
    pub fn new(rules: &FrozenRules, config: CurriculumConfig) -> Self {
        let mut rules_by_variable: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (rule_id, variables) in rules.variables_by_rule() {
            for variable in variables {
                rules_by_variable
                    .entry(variable)
                    .or_default()
                    .push(rule_id.to_string());
            }
        }
        Curriculum {
            config,
            rules_by_variable,
        }
    }

    /// Reweight batches in place and return them
    ///
    /// Deterministic: identical trust state and batches produce
    /// bit-identical priorities. Order and membership are untouched.
    pub fn weigh(
        &self,
        mut batches: Vec<TrainingBatch>,
        trust: &TrustTracker,
    ) -> Vec<TrainingBatch> {
        if batches.is_empty() {
            return batches;
        }

        // Under-sampling term: later planning indices sit in regions a
        // first pass reaches last, so they score higher, scaled to [0, 1].
        let max_index = batches
            .iter()
            .map(|b| b.planning_index)
            .max()
            .unwrap_or(0)
            .max(1) as f64;

        for batch in &mut batches {
            let mut width_sum = 0.0;
            let mut width_count = 0u32;
            for variable in &batch.variable_set {
                if let Some(rule_ids) = self.rules_by_variable.get(variable) {
                    for rule_id in rule_ids {
                        let id = retrodict_core::RuleId::new(rule_id.clone());
                        let (lo, hi) = trust.ci(&id, 0.95);
                        width_sum += hi - lo;
                        width_count += 1;
                    }
                }
            }
            let uncertainty = if width_count == 0 {
                // no rule touches this batch's variables: maximally unknown
                1.0
            } else {
                width_sum / width_count as f64
            };
            let coverage = batch.planning_index as f64 / max_index;

            batch.priority = self.config.base_priority
                + self.config.uncertainty_weight * uncertainty
                + self.config.coverage_weight * coverage;
        }

        debug!(
            target: "retrodict::curriculum",
            batches = batches.len(),
            "batches reweighted"
        );
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrodict_core::{BatchId, RuleId};
    use retrodict_engine::{Effect, Rule, RuleRegistry, Trigger};

    fn rules() -> std::sync::Arc<FrozenRules> {
        let mut registry = RuleRegistry::new();
        registry
            .register(Rule::new(
                "R1",
                Trigger::VariableAbove {
                    name: "x".to_string(),
                    threshold: 0.0,
                },
                vec![Effect::AdjustVariable {
                    name: "y".to_string(),
                    delta: 1.0,
                }],
            ))
            .unwrap();
        registry.freeze().unwrap()
    }

    fn batch(index: usize, variables: Vec<&str>) -> TrainingBatch {
        TrainingBatch {
            id: BatchId::from_string(format!("b{}", index)),
            variable_set: variables.into_iter().map(String::from).collect(),
            window_start: index as i64 * 100,
            window_end: (index as i64 + 1) * 100,
            expected_row_count: 10,
            priority: 1.0,
            planning_index: index,
        }
    }

    #[test]
    fn test_uncertain_rules_raise_priority() {
        let rules = rules();
        let trust = TrustTracker::with_shards(4);
        // R1 well sampled: narrow interval
        trust.batch_update(&[(RuleId::new("R1"), 400, 100)], 1);

        let curriculum = Curriculum::new(&rules, CurriculumConfig::default());
        let known = curriculum.weigh(vec![batch(0, vec!["x", "y"])], &trust);

        let fresh_trust = TrustTracker::with_shards(4);
        let unknown = curriculum.weigh(vec![batch(0, vec!["x", "y"])], &fresh_trust);

        assert!(unknown[0].priority > known[0].priority);
    }

    #[test]
    fn test_membership_and_order_preserved() {
        let rules = rules();
        let trust = TrustTracker::with_shards(4);
        let curriculum = Curriculum::new(&rules, CurriculumConfig::default());

        let batches = vec![batch(0, vec!["x"]), batch(1, vec!["x"]), batch(2, vec!["x"])];
        let ids: Vec<_> = batches.iter().map(|b| b.id.clone()).collect();
        let weighed = curriculum.weigh(batches, &trust);
        let weighed_ids: Vec<_> = weighed.iter().map(|b| b.id.clone()).collect();
        assert_eq!(ids, weighed_ids);
    }

    #[test]
    fn test_deterministic_output() {
        let rules = rules();
        let trust = TrustTracker::with_shards(4);
        trust.batch_update(&[(RuleId::new("R1"), 7, 3)], 1);
        let curriculum = Curriculum::new(&rules, CurriculumConfig::default());

        let a = curriculum.weigh(vec![batch(0, vec!["x"]), batch(1, vec!["y"])], &trust);
        let b = curriculum.weigh(vec![batch(0, vec!["x"]), batch(1, vec!["y"])], &trust);
        let pa: Vec<f64> = a.iter().map(|x| x.priority).collect();
        let pb: Vec<f64> = b.iter().map(|x| x.priority).collect();
        assert_eq!(pa, pb);
    }

    #[test]
    fn test_undersampled_tail_preferred() {
        let rules = rules();
        let trust = TrustTracker::with_shards(4);
        trust.batch_update(&[(RuleId::new("R1"), 50, 50)], 1);
        let curriculum = Curriculum::new(&rules, CurriculumConfig::default());

        let weighed = curriculum.weigh(
            vec![batch(0, vec!["x"]), batch(5, vec!["x"])],
            &trust,
        );
        assert!(weighed[1].priority > weighed[0].priority);
    }
}
