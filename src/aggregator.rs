//! Weighted aggregation of factor scores into one raw score

use crate::config::ScoreConfig;
use crate::factor::{FactorId, FactorScore, FactorSnapshot};
use crate::profile::WeightProfile;
use serde::{Deserialize, Serialize};

/// One factor's share of the raw score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorContribution {
    pub factor: FactorId,
    /// Clamped factor value
    pub value: f64,
    pub weight: f64,
    /// Weighted contribution on the public scale, after the per-factor cap
    pub contribution: f64,
    /// Whether the per-factor cap cut this contribution
    pub capped: bool,
}

/// Raw score plus its per-factor breakdown
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateScore {
    pub raw_score: f64,
    /// Non-zero contributions, largest magnitude first
    pub contributions: Vec<FactorContribution>,
}

/// Weighted sum with a per-factor contribution ceiling
#[derive(Debug, Clone)]
pub struct Aggregator {
    output_scale: f64,
    contribution_cap: f64,
    max_score: f64,
}

impl Aggregator {
    pub fn new(config: &ScoreConfig) -> Self {
        Self {
            output_scale: config.output_scale,
            contribution_cap: config.contribution_cap,
            max_score: config.max_score,
        }
    }

    /// Raw score on the public scale. Missing factors contribute 0.
    pub fn aggregate(&self, scores: &[FactorScore], weights: &WeightProfile) -> f64 {
        self.aggregate_snapshot(&FactorSnapshot::from_scores(scores), weights)
            .raw_score
    }

    /// Aggregate a snapshot, keeping the per-factor breakdown
    pub fn aggregate_snapshot(&self, snapshot: &FactorSnapshot, weights: &WeightProfile) -> AggregateScore {
        let mut raw_score = 0.0;
        let mut contributions = Vec::new();

        // Profile order is fixed (sorted by id), so the float sum does not
        // depend on the order the scores arrived in
        for (&factor, &weight) in weights.weights() {
            let value = snapshot.value(factor);
            if weight == 0.0 || value == 0.0 {
                continue;
            }
            let uncapped = value * weight * self.output_scale;
            let contribution = uncapped.clamp(-self.contribution_cap, self.contribution_cap);
            raw_score += contribution;
            contributions.push(FactorContribution {
                factor,
                value,
                weight,
                contribution,
                capped: contribution != uncapped,
            });
        }

        contributions.sort_by(|a, b| {
            b.contribution
                .abs()
                .total_cmp(&a.contribution.abs())
                .then(a.factor.cmp(&b.factor))
        });

        AggregateScore {
            raw_score: self.clamp_score(raw_score),
            contributions,
        }
    }

    /// Clamp onto the public score range
    pub fn clamp_score(&self, score: f64) -> f64 {
        if score.is_finite() {
            score.clamp(-self.max_score, self.max_score)
        } else {
            0.0
        }
    }
}
