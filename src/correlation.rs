//! Leader/dependent correlation
//!
//! The leading instrument publishes its stabilized decision after every
//! evaluation. Dependent instruments blend a fraction of the leader's score
//! into their own while that signal is fresh. Expired signals are treated as
//! absent when read; nothing sweeps them.

use crate::config::{normalize_instrument, CorrelationConfig};
use crate::factor::Direction;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Leader decision shared with dependents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationSignal {
    pub leader: String,
    pub direction: Direction,
    /// Leader's stabilized score
    pub raw_score: f64,
    /// Leader's trend factor value
    pub trend_component: f64,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CorrelationSignal {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Why a dependent was left unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationSkip {
    /// The instrument is the leader itself
    Leader,
    /// No coefficient configured
    Independent,
    NoSignal,
    Expired,
    /// Leader magnitude below the activation threshold
    LeaderSideways,
    LowCoverage,
}

/// Result of adjusting one dependent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationOutcome {
    pub score: f64,
    pub direction: Direction,
    /// Blend pulled a directional call away from its direction
    pub conflict: bool,
    /// Blend clamped at neutral to avoid opposing a strong leader
    pub clamped: bool,
    pub leader_score: Option<f64>,
    pub coefficient: Option<f64>,
    pub skipped: Option<CorrelationSkip>,
}

impl CorrelationOutcome {
    fn unchanged(score: f64, direction: Direction, reason: CorrelationSkip) -> Self {
        Self {
            score,
            direction,
            conflict: false,
            clamped: false,
            leader_score: None,
            coefficient: None,
            skipped: Some(reason),
        }
    }

    pub fn applied(&self) -> bool {
        self.skipped.is_none()
    }
}

/// Dependent-side inputs to a blend
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DependentInput {
    pub score: f64,
    pub direction: Direction,
    /// Coefficient on the leader's score, `None` for independent instruments
    pub coefficient: Option<f64>,
    /// Fraction of the instrument's active factors that reported data
    pub coverage: f64,
    /// Direction threshold to recompute with
    pub threshold: f64,
}

pub struct CorrelationBridge {
    leader: String,
    ttl: Duration,
    activation_threshold: f64,
    strong_leader_threshold: f64,
    min_coverage: f64,
    max_score: f64,
    signal: RwLock<Option<CorrelationSignal>>,
}

impl CorrelationBridge {
    pub fn new(config: &CorrelationConfig, max_score: f64) -> Self {
        Self {
            leader: normalize_instrument(&config.leader),
            ttl: Duration::seconds(config.ttl_secs),
            activation_threshold: config.activation_threshold,
            strong_leader_threshold: config.strong_leader_threshold,
            min_coverage: config.min_coverage,
            max_score,
            signal: RwLock::new(None),
        }
    }

    pub fn leader(&self) -> &str {
        &self.leader
    }

    pub fn is_leader(&self, instrument: &str) -> bool {
        normalize_instrument(instrument) == self.leader
    }

    /// Replace the leader signal with a fresh one
    pub async fn publish(
        &self,
        direction: Direction,
        score: f64,
        trend_component: f64,
        now: DateTime<Utc>,
    ) -> CorrelationSignal {
        let signal = CorrelationSignal {
            leader: self.leader.clone(),
            direction,
            raw_score: score,
            trend_component,
            generated_at: now,
            expires_at: now + self.ttl,
        };
        debug!(
            "{} published {} ({:+.2}), expires {}",
            self.leader, direction, score, signal.expires_at
        );
        *self.signal.write().await = Some(signal.clone());
        signal
    }

    /// Current leader signal, `None` when absent or expired
    pub async fn signal(&self, now: DateTime<Utc>) -> Option<CorrelationSignal> {
        self.signal
            .read()
            .await
            .as_ref()
            .filter(|s| !s.is_expired(now))
            .cloned()
    }

    pub async fn clear(&self) {
        *self.signal.write().await = None;
    }

    /// Read the current signal and blend it into a dependent
    pub async fn adjust(
        &self,
        instrument: &str,
        input: DependentInput,
        now: DateTime<Utc>,
    ) -> CorrelationOutcome {
        if self.is_leader(instrument) {
            return CorrelationOutcome::unchanged(input.score, input.direction, CorrelationSkip::Leader);
        }
        let signal = self.signal.read().await.clone();
        let outcome = self.blend(signal.as_ref(), input, now);
        if outcome.conflict {
            info!(
                "{}: leader {} moved direction {} -> {} ({:+.2} -> {:+.2})",
                instrument, self.leader, input.direction, outcome.direction, input.score, outcome.score
            );
        } else if outcome.applied() {
            debug!(
                "{}: blended leader score {:+.2} -> {:+.2}",
                instrument, input.score, outcome.score
            );
        }
        outcome
    }

    /// Blend a leader signal into a dependent's score
    pub fn blend(
        &self,
        signal: Option<&CorrelationSignal>,
        input: DependentInput,
        now: DateTime<Utc>,
    ) -> CorrelationOutcome {
        let unchanged = |reason| CorrelationOutcome::unchanged(input.score, input.direction, reason);

        let Some(coefficient) = input.coefficient else {
            return unchanged(CorrelationSkip::Independent);
        };
        let Some(signal) = signal else {
            return unchanged(CorrelationSkip::NoSignal);
        };
        if signal.is_expired(now) {
            return unchanged(CorrelationSkip::Expired);
        }
        if signal.raw_score.abs() < self.activation_threshold {
            return unchanged(CorrelationSkip::LeaderSideways);
        }
        if input.coverage < self.min_coverage {
            return unchanged(CorrelationSkip::LowCoverage);
        }

        let leader_score = signal.raw_score;
        let mut score = (input.score + leader_score * coefficient).clamp(-self.max_score, self.max_score);

        let mut clamped = false;
        if leader_score.abs() >= self.strong_leader_threshold && score * leader_score < 0.0 {
            score = 0.0;
            clamped = true;
        }

        // A blend that pushes further along a directional call keeps it, held or not
        let direction = if input.direction.is_directional()
            && (score - input.score) * input.direction.sign() >= 0.0
        {
            input.direction
        } else {
            Direction::from_score(score, input.threshold)
        };
        CorrelationOutcome {
            score,
            direction,
            conflict: input.direction.is_directional() && direction != input.direction,
            clamped,
            leader_score: Some(leader_score),
            coefficient: Some(coefficient),
            skipped: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bridge() -> CorrelationBridge {
        CorrelationBridge::new(&CorrelationConfig::default(), 100.0)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn dependent(score: f64, coefficient: f64) -> DependentInput {
        DependentInput {
            score,
            direction: Direction::from_score(score, 10.0),
            coefficient: Some(coefficient),
            coverage: 0.9,
            threshold: 10.0,
        }
    }

    fn leader_signal(score: f64, at: DateTime<Utc>) -> CorrelationSignal {
        CorrelationSignal {
            leader: "BTC".to_string(),
            direction: Direction::from_score(score, 10.0),
            raw_score: score,
            trend_component: 0.0,
            generated_at: at,
            expires_at: at + Duration::seconds(600),
        }
    }

    #[test]
    fn test_no_signal_is_noop() {
        let input = dependent(-15.0, 0.35);
        let outcome = bridge().blend(None, input, t0());
        assert_eq!(outcome.score, -15.0);
        assert_eq!(outcome.direction, Direction::Short);
        assert!(!outcome.conflict);
        assert_eq!(outcome.skipped, Some(CorrelationSkip::NoSignal));
    }

    #[test]
    fn test_strong_leader_blocks_opposite_dependent() {
        let signal = leader_signal(60.0, t0());
        for own in [-15.0, -40.0, -100.0] {
            for coefficient in [0.25, 0.35] {
                let outcome = bridge().blend(Some(&signal), dependent(own, coefficient), t0());
                assert!(outcome.score >= 0.0, "own {} coef {}", own, coefficient);
                assert_ne!(outcome.direction, Direction::Short);
            }
        }
        let outcome = bridge().blend(Some(&signal), dependent(-40.0, 0.35), t0());
        assert!(outcome.clamped);
        assert_eq!(outcome.score, 0.0);
        assert!(outcome.conflict);
    }

    #[test]
    fn test_expired_signal_ignored() {
        let signal = leader_signal(60.0, t0() - Duration::minutes(20));
        let outcome = bridge().blend(Some(&signal), dependent(-15.0, 0.35), t0());
        assert_eq!(outcome.score, -15.0);
        assert_eq!(outcome.skipped, Some(CorrelationSkip::Expired));
    }

    #[test]
    fn test_coefficients_scale_leader_score() {
        let signal = leader_signal(20.0, t0());
        let eth = bridge().blend(Some(&signal), dependent(5.0, 0.35), t0());
        let ton = bridge().blend(Some(&signal), dependent(5.0, 0.25), t0());
        assert!((eth.score - 12.0).abs() < 1e-9);
        assert_eq!(eth.direction, Direction::Long);
        assert!((ton.score - 10.0).abs() < 1e-9);
        // 10 is not above the threshold
        assert_eq!(ton.direction, Direction::Neutral);
        assert!(!eth.conflict);
    }

    #[test]
    fn test_agreeing_leader_keeps_held_direction() {
        // Held long at a smoothed 5.0, below the threshold
        let input = DependentInput {
            direction: Direction::Long,
            ..dependent(5.0, 0.35)
        };
        let outcome = bridge().blend(Some(&leader_signal(12.0, t0())), input, t0());
        assert!((outcome.score - 9.2).abs() < 1e-9);
        assert_eq!(outcome.direction, Direction::Long);
        assert!(!outcome.conflict);
        assert!(outcome.applied());
    }

    #[test]
    fn test_opposing_leader_can_drop_held_direction() {
        let input = DependentInput {
            direction: Direction::Long,
            ..dependent(5.0, 0.35)
        };
        let outcome = bridge().blend(Some(&leader_signal(-12.0, t0())), input, t0());
        assert!((outcome.score - 0.8).abs() < 1e-9);
        assert_eq!(outcome.direction, Direction::Neutral);
        assert!(outcome.conflict);
    }

    #[test]
    fn test_sideways_leader_ignored() {
        let signal = leader_signal(8.0, t0());
        let outcome = bridge().blend(Some(&signal), dependent(-30.0, 0.35), t0());
        assert_eq!(outcome.skipped, Some(CorrelationSkip::LeaderSideways));
        assert_eq!(outcome.score, -30.0);
    }

    #[test]
    fn test_low_coverage_skipped() {
        let signal = leader_signal(60.0, t0());
        let input = DependentInput {
            coverage: 0.3,
            ..dependent(-30.0, 0.35)
        };
        let outcome = bridge().blend(Some(&signal), input, t0());
        assert_eq!(outcome.skipped, Some(CorrelationSkip::LowCoverage));
    }

    #[test]
    fn test_independent_instrument_skipped() {
        let signal = leader_signal(60.0, t0());
        let input = DependentInput {
            coefficient: None,
            ..dependent(-30.0, 0.35)
        };
        let outcome = bridge().blend(Some(&signal), input, t0());
        assert_eq!(outcome.skipped, Some(CorrelationSkip::Independent));
    }

    #[test]
    fn test_publish_and_expire() {
        tokio_test::block_on(async {
            let bridge = bridge();
            assert!(bridge.signal(t0()).await.is_none());

            let published = bridge.publish(Direction::Long, 45.0, 6.0, t0()).await;
            assert_eq!(published.expires_at, t0() + Duration::seconds(600));
            assert_eq!(bridge.signal(t0() + Duration::minutes(5)).await, Some(published));
            assert!(bridge.signal(t0() + Duration::minutes(11)).await.is_none());
        });
    }

    #[test]
    fn test_leader_is_never_adjusted() {
        tokio_test::block_on(async {
            let bridge = bridge();
            bridge.publish(Direction::Long, 80.0, 6.0, t0()).await;
            let outcome = bridge.adjust("btc", dependent(-40.0, 0.35), t0()).await;
            assert_eq!(outcome.skipped, Some(CorrelationSkip::Leader));
            assert_eq!(outcome.score, -40.0);
        });
    }
}
