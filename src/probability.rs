//! Confidence estimate for a decision
//!
//! Piecewise-linear in |score| with diminishing slopes, plus small consensus
//! and coverage bonuses, minus a penalty for fighting the trend. Always kept
//! inside a conservative band.

use crate::config::{ProbabilityConfig, ProbabilitySegment};
use crate::factor::{Direction, FactorCounts};

#[derive(Debug, Clone)]
pub struct ProbabilityEstimator {
    config: ProbabilityConfig,
}

impl ProbabilityEstimator {
    pub fn new(config: &ProbabilityConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Probability percent for a decision.
    ///
    /// `coverage` is the fraction of active factors that reported data and
    /// `trend_value` the trend factor's value on the factor scale.
    pub fn estimate(
        &self,
        score: f64,
        direction: Direction,
        counts: FactorCounts,
        coverage: f64,
        trend_value: f64,
    ) -> f64 {
        let cfg = &self.config;
        if !score.is_finite() {
            return cfg.min;
        }
        let magnitude = score.abs();

        if !direction.is_directional() {
            let rise = 1.0 - (-magnitude / cfg.neutral_saturation).exp();
            return (cfg.min + (cfg.neutral_max - cfg.min) * rise).clamp(cfg.min, cfg.neutral_max);
        }

        let strength = (magnitude / cfg.bonus_full_strength).min(1.0);
        let consensus = counts.imbalance() * cfg.consensus_bonus * strength;
        let coverage = if coverage.is_finite() {
            coverage.clamp(0.0, 1.0) * cfg.coverage_bonus * strength
        } else {
            0.0
        };

        let trend = if trend_value.is_finite() { trend_value } else { 0.0 };
        let penalty = if trend.abs() >= cfg.trend_opposition
            && Direction::from_score(trend, 0.0).opposes(direction)
        {
            cfg.trend_penalty
        } else {
            0.0
        };

        let probability = cfg.min + segment_gain(&cfg.segments, magnitude) + consensus + coverage - penalty;
        probability.clamp(cfg.min, cfg.max)
    }
}

/// Probability points gained walking |score| through the segments
fn segment_gain(segments: &[ProbabilitySegment], magnitude: f64) -> f64 {
    let mut gain = 0.0;
    let mut start = 0.0;
    for segment in segments {
        if magnitude <= start {
            break;
        }
        let covered = magnitude.min(segment.up_to) - start;
        gain += covered * segment.slope;
        start = segment.up_to;
    }
    gain
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn estimator() -> ProbabilityEstimator {
        ProbabilityEstimator::new(&ProbabilityConfig::default())
    }

    #[test]
    fn test_zero_score_is_minimum() {
        let e = estimator();
        for direction in [Direction::Long, Direction::Short, Direction::Neutral] {
            let p = e.estimate(0.0, direction, FactorCounts::new(10, 0, 0), 1.0, -8.0);
            assert_eq!(p, 50.0, "{}", direction);
        }
    }

    #[test]
    fn test_segments() {
        let cfg = ProbabilityConfig::default();
        assert!((segment_gain(&cfg.segments, 10.0) - 4.0).abs() < 1e-9);
        assert!((segment_gain(&cfg.segments, 25.0) - 10.0).abs() < 1e-9);
        assert!((segment_gain(&cfg.segments, 35.0) - 13.0).abs() < 1e-9);
        assert!((segment_gain(&cfg.segments, 100.0) - 24.0).abs() < 1e-9);
        // Past the last segment nothing more is gained
        assert!((segment_gain(&cfg.segments, 150.0) - 24.0).abs() < 1e-9);
    }

    #[test]
    fn test_directional_estimate() {
        let e = estimator();
        // 50 + 10 (segments) + 3 * 0.5 imbalance + 2 * 0.8 coverage
        let p = e.estimate(25.0, Direction::Long, FactorCounts::new(12, 4, 8), 0.8, 2.0);
        assert!((p - 63.1).abs() < 1e-9, "p was {}", p);
    }

    #[test]
    fn test_trend_penalty() {
        let e = estimator();
        let counts = FactorCounts::new(12, 4, 8);
        let with_trend = e.estimate(40.0, Direction::Short, counts, 0.8, -5.0);
        let against_trend = e.estimate(40.0, Direction::Short, counts, 0.8, 5.0);
        assert!((with_trend - against_trend - 4.0).abs() < 1e-9);
        // Weak trend readings do not count as opposition
        let weak = e.estimate(40.0, Direction::Short, counts, 0.8, 2.0);
        assert_eq!(weak, with_trend);
    }

    #[test]
    fn test_max_is_capped() {
        let e = estimator();
        let p = e.estimate(100.0, Direction::Long, FactorCounts::new(30, 0, 0), 1.0, 10.0);
        assert_eq!(p, 78.0);
    }

    #[test]
    fn test_neutral_saturates_below_cap() {
        let e = estimator();
        let small = e.estimate(3.0, Direction::Neutral, FactorCounts::default(), 1.0, 0.0);
        let large = e.estimate(60.0, Direction::Neutral, FactorCounts::default(), 1.0, 0.0);
        assert!(small > 50.0 && small < large);
        assert!(large <= 58.0);
    }

    #[test]
    fn test_bounds_hold_for_random_inputs() {
        let e = estimator();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..2000 {
            let score = rng.gen_range(-150.0..150.0);
            let direction = match rng.gen_range(0..3) {
                0 => Direction::Long,
                1 => Direction::Short,
                _ => Direction::Neutral,
            };
            let counts = FactorCounts::new(rng.gen_range(0..20), rng.gen_range(0..20), rng.gen_range(0..20));
            let coverage = rng.gen_range(-0.5..1.5);
            let trend = rng.gen_range(-10.0..10.0);
            let p = e.estimate(score, direction, counts, coverage, trend);
            assert!((50.0..=78.0).contains(&p), "p {} for score {}", p, score);
        }
        assert_eq!(e.estimate(f64::NAN, Direction::Long, FactorCounts::default(), 1.0, 0.0), 50.0);
    }

    #[test]
    fn test_monotonic_in_score() {
        let e = estimator();
        let counts = FactorCounts::new(10, 5, 5);
        let mut last = 0.0;
        for step in 0..=100 {
            let p = e.estimate(step as f64, Direction::Long, counts, 0.7, 0.0);
            assert!(p >= last, "dropped at {}", step);
            last = p;
        }
    }
}
