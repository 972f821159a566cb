//! Per-rule Beta posterior
//!
//! Each rule carries a Beta(α, β) posterior over how often its predicted
//! effect matches the observed delta. α and β are floored at 1.0 at all
//! times (uniform-prior floor), including after decay.

use serde::{Deserialize, Serialize};

/// z quantiles for the supported confidence levels
///
/// The interval math only needs a handful of levels; anything else falls
/// back to 95%.
fn z_for_level(level: f64) -> f64 {
    if (level - 0.90).abs() < 1e-9 {
        1.644_853_6
    } else if (level - 0.99).abs() < 1e-9 {
        2.575_829_3
    } else {
        1.959_964_0
    }
}

/// Sample threshold above which the normal approximation is used
const NORMAL_APPROX_MIN_WEIGHT: f64 = 30.0;

/// Beta(α, β) posterior for a single rule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrustState {
    /// Prior successes + 1; always >= 1
    pub alpha: f64,
    /// Prior failures + 1; always >= 1
    pub beta: f64,
    /// Turn of the most recent update, for lazy decay
    pub last_update_turn: u64,
    /// Raw observation count (not affected by decay)
    pub sample_count: u64,
}

impl Default for TrustState {
    fn default() -> Self {
        TrustState {
            alpha: 1.0,
            beta: 1.0,
            last_update_turn: 0,
            sample_count: 0,
        }
    }
}

impl TrustState {
    /// Posterior mean α / (α + β)
    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// Posterior variance αβ / ((α+β)² (α+β+1))
    pub fn variance(&self) -> f64 {
        let s = self.alpha + self.beta;
        (self.alpha * self.beta) / (s * s * (s + 1.0))
    }

    /// Record a batch of outcomes
    ///
    /// Associative and commutative: batched accumulation equals sequential
    /// accumulation in any order.
    pub fn record(&mut self, successes: u64, failures: u64, turn: u64) {
        self.alpha += successes as f64;
        self.beta += failures as f64;
        self.sample_count += successes + failures;
        self.last_update_turn = self.last_update_turn.max(turn);
    }

    /// Confidence interval at `level`
    ///
    /// Normal approximation once α+β >= 30; a Wilson-style interval on the
    /// evidence counts otherwise. Both are clamped to [0, 1].
    pub fn ci(&self, level: f64) -> (f64, f64) {
        let z = z_for_level(level);
        let weight = self.alpha + self.beta;
        if weight >= NORMAL_APPROX_MIN_WEIGHT {
            let half = z * self.variance().sqrt();
            let mean = self.mean();
            ((mean - half).max(0.0), (mean + half).min(1.0))
        } else {
            // Wilson interval over the evidence beyond the uniform prior.
            let n = (self.alpha - 1.0) + (self.beta - 1.0);
            if n <= 0.0 {
                return (0.0, 1.0);
            }
            let p = (self.alpha - 1.0) / n;
            let z2 = z * z;
            let denom = 1.0 + z2 / n;
            let centre = p + z2 / (2.0 * n);
            let spread = z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt();
            (
                ((centre - spread) / denom).max(0.0),
                ((centre + spread) / denom).min(1.0),
            )
        }
    }

    /// Width of the confidence interval, for uncertainty ranking
    pub fn ci_width(&self, level: f64) -> f64 {
        let (lo, hi) = self.ci(level);
        hi - lo
    }

    /// Apply temporal forgetting toward the uniform prior
    ///
    /// Scales the evidence beyond the prior by 2^(−elapsed / half_life),
    /// flooring α and β at 1.0. `sample_count` is untouched.
    pub fn decay(&mut self, half_life_turns: u64, current_turn: u64) {
        if half_life_turns == 0 || current_turn <= self.last_update_turn {
            return;
        }
        let elapsed = (current_turn - self.last_update_turn) as f64;
        let factor = (-(elapsed / half_life_turns as f64) * std::f64::consts::LN_2).exp();
        self.alpha = 1.0 + (self.alpha - 1.0) * factor;
        self.beta = 1.0 + (self.beta - 1.0) * factor;
        self.last_update_turn = current_turn;
    }
}
