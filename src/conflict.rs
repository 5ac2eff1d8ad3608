//! Conflict resolution - override and dampening rules plus the adaptive threshold
//!
//! Rules are evaluated in a fixed priority order and the first one that
//! fires decides the adjusted score:
//!
//! 1. Extreme single-factor override
//! 2. Strong-signal-count override
//! 3. Consensus dampening (neutral-heavy, near tie, or majority against the aggregate)
//!
//! The direction threshold rises as bullish and bearish counts converge.

use crate::config::ConflictConfig;
use crate::factor::{Direction, FactorCounts, FactorId, FactorSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Inputs every rule sees
#[derive(Debug, Clone, Copy)]
pub struct ConflictInput<'a> {
    pub raw_score: f64,
    pub counts: FactorCounts,
    pub snapshot: &'a FactorSnapshot,
}

impl ConflictInput<'_> {
    /// Direction implied by the raw score's sign
    fn raw_direction(&self) -> Direction {
        Direction::from_score(self.raw_score, 0.0)
    }
}

/// Score chosen by a rule that fired
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub adjusted_score: f64,
    pub note: String,
}

/// One prioritized conflict rule
pub trait ConflictRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Some` when the rule fires; evaluation stops at the first that does
    fn apply(&self, input: &ConflictInput<'_>) -> Option<RuleOutcome>;
}

/// A single unambiguous extreme reading outranks a noisy aggregate
#[derive(Debug, Clone)]
pub struct ExtremeFactorOverride {
    pub factors: Vec<FactorId>,
    pub threshold: f64,
    pub fraction: f64,
    pub boost: f64,
}

impl ConflictRule for ExtremeFactorOverride {
    fn name(&self) -> &'static str {
        "extreme_factor_override"
    }

    fn apply(&self, input: &ConflictInput<'_>) -> Option<RuleOutcome> {
        let raw_dir = input.raw_direction();
        if !raw_dir.is_directional() {
            return None;
        }

        let (factor, value) = self
            .factors
            .iter()
            .map(|id| (*id, input.snapshot.value(*id)))
            .filter(|(_, v)| v.abs() >= self.threshold)
            .filter(|(_, v)| Direction::from_score(*v, 0.0).opposes(raw_dir))
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))?;

        let sign = value.signum();
        let adjusted_score = sign * (input.raw_score.abs() * self.fraction + self.boost);
        Some(RuleOutcome {
            adjusted_score,
            note: format!(
                "Override: extreme {} ({:+.1}) against aggregate {:+.1}",
                factor, value, input.raw_score
            ),
        })
    }
}

/// Several independent strong factors agreeing against the aggregate
#[derive(Debug, Clone)]
pub struct StrongSignalOverride {
    pub factors: Vec<FactorId>,
    pub threshold: f64,
    pub min_count: usize,
    pub fraction: f64,
    pub boost: f64,
}

impl ConflictRule for StrongSignalOverride {
    fn name(&self) -> &'static str {
        "strong_signal_override"
    }

    fn apply(&self, input: &ConflictInput<'_>) -> Option<RuleOutcome> {
        let raw_dir = input.raw_direction();
        if !raw_dir.is_directional() {
            return None;
        }

        let against: Vec<FactorId> = self
            .factors
            .iter()
            .copied()
            .filter(|id| {
                let v = input.snapshot.value(*id);
                v.abs() >= self.threshold && Direction::from_score(v, 0.0).opposes(raw_dir)
            })
            .collect();

        if against.len() < self.min_count {
            return None;
        }

        let sign = -input.raw_score.signum();
        let names: Vec<&str> = against.iter().map(FactorId::as_str).collect();
        Some(RuleOutcome {
            adjusted_score: sign * (input.raw_score.abs() * self.fraction + self.boost),
            note: format!(
                "Conflict: {} strong factors ({}) against aggregate {:+.1}",
                against.len(),
                names.join(", "),
                input.raw_score
            ),
        })
    }
}

/// Pull an unconvincing aggregate toward neutral
#[derive(Debug, Clone)]
pub struct ConsensusDampening {
    pub neutral_ratio_threshold: f64,
    pub near_tie_margin: usize,
    pub near_tie_min_factors: usize,
    pub majority_ratio: f64,
    pub damping: f64,
}

impl ConsensusDampening {
    fn trigger(&self, input: &ConflictInput<'_>) -> Option<String> {
        let counts = input.counts;
        if counts.total() > 0 && counts.neutral_ratio() > self.neutral_ratio_threshold {
            return Some(format!(
                "{} of {} factors neutral",
                counts.neutral,
                counts.total()
            ));
        }
        if counts.bullish.abs_diff(counts.bearish) <= self.near_tie_margin
            && counts.total() >= self.near_tie_min_factors
        {
            return Some(format!(
                "near tie {} bullish vs {} bearish",
                counts.bullish, counts.bearish
            ));
        }
        let majority = counts.majority(self.majority_ratio);
        if majority.opposes(input.raw_direction()) {
            return Some(format!(
                "{} majority ({} bullish vs {} bearish) against aggregate",
                majority, counts.bullish, counts.bearish
            ));
        }
        None
    }
}

impl ConflictRule for ConsensusDampening {
    fn name(&self) -> &'static str {
        "consensus_dampening"
    }

    fn apply(&self, input: &ConflictInput<'_>) -> Option<RuleOutcome> {
        let raw_dir = input.raw_direction();
        if !raw_dir.is_directional() {
            return None;
        }
        // A clear majority on the aggregate's side is a real signal
        if input.counts.majority(self.majority_ratio) == raw_dir {
            return None;
        }
        let reason = self.trigger(input)?;
        Some(RuleOutcome {
            adjusted_score: input.raw_score * self.damping,
            note: format!("Dampened x{:.2}: {}", self.damping, reason),
        })
    }
}

/// How strongly bullish and bearish counts converge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictLevel {
    #[default]
    None,
    Moderate,
    Strong,
}

impl fmt::Display for ConflictLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictLevel::None => "none",
            ConflictLevel::Moderate => "moderate",
            ConflictLevel::Strong => "strong",
        };
        f.write_str(s)
    }
}

/// Direction threshold that rises with factor conflict
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveThreshold {
    pub base: f64,
    pub moderate_bonus: f64,
    pub strong_bonus: f64,
    pub min_side: usize,
}

impl AdaptiveThreshold {
    pub fn from_config(config: &ConflictConfig) -> Self {
        Self {
            base: config.base_threshold,
            moderate_bonus: config.moderate_bonus,
            strong_bonus: config.strong_bonus,
            min_side: config.min_conflict_side,
        }
    }

    pub fn level(&self, counts: FactorCounts) -> ConflictLevel {
        if counts.bullish < self.min_side || counts.bearish < self.min_side {
            return ConflictLevel::None;
        }
        match counts.bullish.abs_diff(counts.bearish) {
            0 => ConflictLevel::Strong,
            1 => ConflictLevel::Moderate,
            _ => ConflictLevel::None,
        }
    }

    pub fn threshold(&self, counts: FactorCounts) -> f64 {
        match self.level(counts) {
            ConflictLevel::None => self.base,
            ConflictLevel::Moderate => self.base + self.moderate_bonus,
            ConflictLevel::Strong => self.base + self.strong_bonus,
        }
    }
}

/// Result of conflict resolution
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolution {
    pub adjusted_score: f64,
    pub direction: Direction,
    pub threshold: f64,
    pub conflict_level: ConflictLevel,
    /// Rule that fired, if any
    pub rule: Option<&'static str>,
    pub note: Option<String>,
}

/// Ordered rule list plus adaptive threshold
pub struct ConflictResolver {
    rules: Vec<Box<dyn ConflictRule>>,
    threshold: AdaptiveThreshold,
}

impl ConflictResolver {
    /// Default rule order: extreme override, strong-signal override, dampening
    pub fn new(config: &ConflictConfig) -> Self {
        let rules: Vec<Box<dyn ConflictRule>> = vec![
            Box::new(ExtremeFactorOverride {
                factors: config.extreme_factors.clone(),
                threshold: config.extreme_threshold,
                fraction: config.extreme_fraction,
                boost: config.extreme_boost,
            }),
            Box::new(StrongSignalOverride {
                factors: config.strong_factors.clone(),
                threshold: config.strong_threshold,
                min_count: config.strong_min_count,
                fraction: config.strong_fraction,
                boost: config.strong_boost,
            }),
            Box::new(ConsensusDampening {
                neutral_ratio_threshold: config.neutral_ratio_threshold,
                near_tie_margin: config.near_tie_margin,
                near_tie_min_factors: config.near_tie_min_factors,
                majority_ratio: config.majority_ratio,
                damping: config.damping,
            }),
        ];
        Self::with_rules(rules, AdaptiveThreshold::from_config(config))
    }

    /// Custom rule list, evaluated in the given order
    pub fn with_rules(rules: Vec<Box<dyn ConflictRule>>, threshold: AdaptiveThreshold) -> Self {
        Self { rules, threshold }
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn resolve(
        &self,
        raw_score: f64,
        counts: FactorCounts,
        snapshot: &FactorSnapshot,
    ) -> ConflictResolution {
        let input = ConflictInput {
            raw_score,
            counts,
            snapshot,
        };

        let fired = self
            .rules
            .iter()
            .find_map(|rule| rule.apply(&input).map(|outcome| (rule.name(), outcome)));

        let (adjusted_score, rule, mut notes) = match fired {
            Some((name, outcome)) => {
                debug!(
                    "Rule {} fired: {:+.2} -> {:+.2}",
                    name, raw_score, outcome.adjusted_score
                );
                (outcome.adjusted_score, Some(name), vec![outcome.note])
            }
            None => (raw_score, None, Vec::new()),
        };

        let conflict_level = self.threshold.level(counts);
        let threshold = self.threshold.threshold(counts);
        if conflict_level != ConflictLevel::None {
            notes.push(format!(
                "{} factor conflict, threshold raised to ±{:.2}",
                conflict_level, threshold
            ));
        }

        ConflictResolution {
            adjusted_score,
            direction: Direction::from_score(adjusted_score, threshold),
            threshold,
            conflict_level,
            rule,
            note: if notes.is_empty() {
                None
            } else {
                Some(notes.join("; "))
            },
        }
    }
}
