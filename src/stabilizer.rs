//! Temporal stabilization - exponential smoothing plus hysteresis
//!
//! Each instrument carries its last smoothed score and direction. A new
//! direction is only accepted when the cooldown since the last accepted
//! evaluation has run out, the score jumped by more than the bypass delta,
//! or the same candidate kept showing up for enough consecutive evaluations.
//! Held evaluations do not restart the cooldown.

use crate::config::StabilizerConfig;
use crate::factor::Direction;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Per-instrument stabilizer memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentState {
    pub last_smoothed_score: f64,
    pub last_direction: Direction,
    /// Last evaluation whose direction was accepted; the cooldown runs from here
    pub last_update: DateTime<Utc>,
    /// Last evaluation of any kind, held ones included
    pub last_evaluated: DateTime<Utc>,
    /// When `last_direction` was accepted
    pub direction_since: DateTime<Utc>,
    /// Candidate direction waiting for acceptance
    pub pending_direction: Option<Direction>,
    /// Consecutive evaluations that produced `pending_direction`
    pub confirmations: u32,
}

/// What allowed a direction change through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeTrigger {
    Cooldown,
    Bypass,
    Confirmed,
}

/// How the stabilizer treated one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    /// No prior state, the value was taken as is
    Initial,
    /// Candidate matched the current direction
    Steady,
    Changed { trigger: ChangeTrigger },
    /// Candidate differed but was not accepted yet
    Held { candidate: Direction, confirmations: u32 },
}

/// Stabilized score and direction for one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StabilizedSignal {
    pub score: f64,
    pub direction: Direction,
    pub transition: Transition,
}

impl StabilizedSignal {
    /// Whether the reported direction moved away from the previous one
    pub fn changed(&self) -> bool {
        matches!(self.transition, Transition::Changed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Stabilizer {
    alpha: f64,
    cooldown: Duration,
    bypass_delta: f64,
    confirmations_required: u32,
    max_score: f64,
}

impl Stabilizer {
    pub fn new(config: &StabilizerConfig, max_score: f64) -> Self {
        Self {
            alpha: config.alpha,
            cooldown: Duration::seconds(config.cooldown_secs),
            bypass_delta: config.bypass_delta,
            confirmations_required: config.confirmations_required,
            max_score,
        }
    }

    /// Exponential smoothing against the previous smoothed score
    pub fn smooth(&self, previous: Option<&InstrumentState>, score: f64) -> f64 {
        let smoothed = match previous {
            Some(state) => self.alpha * score + (1.0 - self.alpha) * state.last_smoothed_score,
            None => score,
        };
        smoothed.clamp(-self.max_score, self.max_score)
    }

    /// Run one evaluation through smoothing and hysteresis.
    ///
    /// `threshold` is the adaptive direction threshold; the candidate
    /// direction uses the wider of it and the instrument's dead zone.
    /// Returns the signal and the state to store.
    pub fn stabilize(
        &self,
        instrument: &str,
        previous: Option<&InstrumentState>,
        score: f64,
        threshold: f64,
        dead_zone: f64,
        now: DateTime<Utc>,
    ) -> (StabilizedSignal, InstrumentState) {
        let smoothed = self.smooth(previous, score);
        let candidate = Direction::from_score(smoothed, threshold.max(dead_zone));

        let Some(prev) = previous else {
            debug!("{}: first evaluation, direction {}", instrument, candidate);
            return (
                StabilizedSignal {
                    score: smoothed,
                    direction: candidate,
                    transition: Transition::Initial,
                },
                InstrumentState {
                    last_smoothed_score: smoothed,
                    last_direction: candidate,
                    last_update: now,
                    last_evaluated: now,
                    direction_since: now,
                    pending_direction: None,
                    confirmations: 0,
                },
            );
        };

        if candidate == prev.last_direction {
            return (
                StabilizedSignal {
                    score: smoothed,
                    direction: candidate,
                    transition: Transition::Steady,
                },
                InstrumentState {
                    last_smoothed_score: smoothed,
                    last_update: now,
                    last_evaluated: now,
                    pending_direction: None,
                    confirmations: 0,
                    ..prev.clone()
                },
            );
        }

        let confirmations = if prev.pending_direction == Some(candidate) {
            prev.confirmations.saturating_add(1)
        } else {
            1
        };

        match self.change_trigger(prev, score, confirmations, now) {
            Some(trigger) => {
                info!(
                    "{}: direction {} -> {} ({:?}, score {:+.2})",
                    instrument, prev.last_direction, candidate, trigger, smoothed
                );
                (
                    StabilizedSignal {
                        score: smoothed,
                        direction: candidate,
                        transition: Transition::Changed { trigger },
                    },
                    InstrumentState {
                        last_smoothed_score: smoothed,
                        last_direction: candidate,
                        last_update: now,
                        last_evaluated: now,
                        direction_since: now,
                        pending_direction: None,
                        confirmations: 0,
                    },
                )
            }
            None => {
                debug!(
                    "{}: holding {} against candidate {} ({}/{} confirmations)",
                    instrument,
                    prev.last_direction,
                    candidate,
                    confirmations,
                    self.confirmations_required
                );
                (
                    StabilizedSignal {
                        score: smoothed,
                        direction: prev.last_direction,
                        transition: Transition::Held {
                            candidate,
                            confirmations,
                        },
                    },
                    InstrumentState {
                        last_smoothed_score: smoothed,
                        last_direction: prev.last_direction,
                        last_update: prev.last_update,
                        last_evaluated: now,
                        direction_since: prev.direction_since,
                        pending_direction: Some(candidate),
                        confirmations,
                    },
                )
            }
        }
    }

    fn change_trigger(
        &self,
        prev: &InstrumentState,
        score: f64,
        confirmations: u32,
        now: DateTime<Utc>,
    ) -> Option<ChangeTrigger> {
        if now - prev.last_update >= self.cooldown {
            Some(ChangeTrigger::Cooldown)
        } else if (score - prev.last_smoothed_score).abs() > self.bypass_delta {
            Some(ChangeTrigger::Bypass)
        } else if self.confirmations_required > 0 && confirmations >= self.confirmations_required {
            Some(ChangeTrigger::Confirmed)
        } else {
            None
        }
    }
}
