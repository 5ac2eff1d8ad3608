//! Signal engine - sequences aggregation, conflict resolution, stabilization,
//! correlation and probability into one result per request
//!
//! Evaluations of one instrument are serialized on that instrument's state
//! slot; different instruments run in parallel. Nothing here returns an
//! error once the engine is built: bad factor inputs become neutral values.

use crate::aggregator::{Aggregator, FactorContribution};
use crate::config::{normalize_instrument, EngineConfig};
use crate::conflict::{ConflictLevel, ConflictResolver};
use crate::correlation::{CorrelationBridge, CorrelationOutcome, CorrelationSignal, DependentInput};
use crate::error::ConfigError;
use crate::factor::{
    run_analyzers, AnalysisContext, Analyzer, Direction, FactorId, FactorScore, FactorSnapshot,
};
use crate::observability::{decision_event, metrics, EngineMetrics};
use crate::probability::ProbabilityEstimator;
use crate::profile::WeightProfileResolver;
use crate::stabilizer::{InstrumentState, Stabilizer, Transition};
use crate::state::StateStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

/// Factor values for one instrument at one point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub instrument: String,
    #[serde(default)]
    pub scores: Vec<FactorScore>,
    #[serde(default = "Utc::now")]
    pub as_of: DateTime<Utc>,
}

impl EvaluationRequest {
    pub fn new(instrument: impl Into<String>, scores: Vec<FactorScore>, as_of: DateTime<Utc>) -> Self {
        Self {
            instrument: instrument.into(),
            scores,
            as_of,
        }
    }
}

/// Decision for one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub evaluation_id: Uuid,
    pub instrument: String,
    pub as_of: DateTime<Utc>,
    /// Final score after stabilization and correlation
    pub total_score: f64,
    pub direction: Direction,
    /// Percent, always inside the configured probability band
    pub probability: f64,
    pub bullish_count: usize,
    pub bearish_count: usize,
    pub neutral_count: usize,
    pub conflict_note: Option<String>,

    /// Weighted aggregate before conflict resolution
    pub raw_score: f64,
    /// Score after conflict resolution, before smoothing
    pub adjusted_score: f64,
    /// Direction conflict resolution alone would give
    pub raw_direction: Direction,
    pub threshold: f64,
    pub conflict_level: ConflictLevel,
    pub rule: Option<String>,
    pub transition: Transition,
    pub changed: bool,
    /// `None` for the leader itself
    pub correlation: Option<CorrelationOutcome>,
    /// Fraction of the profile's active factors that reported data
    pub coverage: f64,
    pub profile: String,
    pub contributions: Vec<FactorContribution>,
}

pub struct SignalEngine {
    config: EngineConfig,
    profiles: WeightProfileResolver,
    aggregator: Aggregator,
    conflicts: ConflictResolver,
    stabilizer: Stabilizer,
    correlation: CorrelationBridge,
    probability: ProbabilityEstimator,
    states: StateStore<InstrumentState>,
    metrics: EngineMetrics,
}

impl SignalEngine {
    /// Validate the configuration and build every component
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        let config = config.normalized();
        config.validate()?;
        let profiles = WeightProfileResolver::from_config(&config)?;
        Ok(Self {
            aggregator: Aggregator::new(&config.score),
            conflicts: ConflictResolver::new(&config.conflict),
            stabilizer: Stabilizer::new(&config.stabilizer, config.score.max_score),
            correlation: CorrelationBridge::new(&config.correlation, config.score.max_score),
            probability: ProbabilityEstimator::new(&config.probability),
            states: StateStore::new(),
            metrics: EngineMetrics::new(),
            profiles,
            config,
        })
    }

    /// Replace the default conflict rules
    pub fn with_conflict_resolver(mut self, conflicts: ConflictResolver) -> Self {
        self.conflicts = conflicts;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn profiles(&self) -> &WeightProfileResolver {
        &self.profiles
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Evaluate one instrument
    pub async fn evaluate(&self, request: EvaluationRequest) -> AggregationResult {
        let instrument = normalize_instrument(&request.instrument);
        let evaluation_id = Uuid::new_v4();
        let span = info_span!("evaluate", instrument = %instrument, %evaluation_id);
        self.evaluate_inner(instrument, evaluation_id, request.scores, request.as_of)
            .instrument(span)
            .await
    }

    /// Run analyzers against pre-fetched inputs, then evaluate their scores
    pub async fn evaluate_with_analyzers(
        &self,
        analyzers: &[Box<dyn Analyzer>],
        ctx: &AnalysisContext,
    ) -> AggregationResult {
        let run = run_analyzers(analyzers, ctx);
        if !run.failures.is_empty() {
            self.metrics
                .increment(metrics::ANALYZER_FAILURES, run.failures.len() as u64)
                .await;
        }
        self.evaluate(EvaluationRequest::new(ctx.instrument.clone(), run.scores, ctx.as_of))
            .await
    }

    /// Evaluate several instruments. Leader requests run first so dependents
    /// see a fresh signal; each dependent instrument then runs in its own
    /// task. Requests for one instrument are applied in `as_of` order.
    ///
    /// Results keep the order of `requests`; an entry is `None` when its
    /// evaluation task failed.
    pub async fn evaluate_batch(
        self: &Arc<Self>,
        requests: Vec<EvaluationRequest>,
    ) -> Vec<Option<AggregationResult>> {
        let mut results: Vec<Option<AggregationResult>> = vec![None; requests.len()];
        let mut leaders = Vec::new();
        let mut groups: BTreeMap<String, Vec<(usize, EvaluationRequest)>> = BTreeMap::new();
        for (index, request) in requests.into_iter().enumerate() {
            let instrument = normalize_instrument(&request.instrument);
            if self.correlation.is_leader(&instrument) {
                leaders.push((index, request));
            } else {
                groups.entry(instrument).or_default().push((index, request));
            }
        }

        leaders.sort_by_key(|(_, request)| request.as_of);
        for (index, request) in leaders {
            results[index] = Some(self.evaluate(request).await);
        }

        let handles: Vec<_> = groups
            .into_iter()
            .map(|(instrument, mut group)| {
                group.sort_by_key(|(_, request)| request.as_of);
                let engine = Arc::clone(self);
                let handle = tokio::spawn(async move {
                    let mut evaluated = Vec::with_capacity(group.len());
                    for (index, request) in group {
                        evaluated.push((index, engine.evaluate(request).await));
                    }
                    evaluated
                });
                (instrument, handle)
            })
            .collect();

        for (instrument, handle) in handles {
            match handle.await {
                Ok(evaluated) => {
                    for (index, result) in evaluated {
                        results[index] = Some(result);
                    }
                }
                Err(e) => error!("Batch evaluation of {} failed: {}", instrument, e),
            }
        }
        results
    }

    /// Stabilizer state of an instrument, if it was evaluated
    pub async fn instrument_state(&self, instrument: &str) -> Option<InstrumentState> {
        self.states.get(&normalize_instrument(instrument)).await
    }

    /// Fresh leader signal, if any
    pub async fn leader_signal(&self, now: DateTime<Utc>) -> Option<CorrelationSignal> {
        self.correlation.signal(now).await
    }

    /// Forget an instrument's history; resetting the leader also drops its signal
    pub async fn reset_instrument(&self, instrument: &str) -> bool {
        let instrument = normalize_instrument(instrument);
        let had_state = self.states.reset(&instrument).await;
        if self.correlation.is_leader(&instrument) {
            self.correlation.clear().await;
        }
        debug!("Reset {} (had state: {})", instrument, had_state);
        had_state
    }

    /// Instruments with stored state
    pub async fn instruments(&self) -> Vec<String> {
        self.states.keys().await
    }

    async fn evaluate_inner(
        &self,
        instrument: String,
        evaluation_id: Uuid,
        scores: Vec<FactorScore>,
        as_of: DateTime<Utc>,
    ) -> AggregationResult {
        let started = Instant::now();
        let profile = self.profiles.resolve(&instrument);
        if EngineConfig::instrument(&self.config, &instrument).is_none() {
            debug!("{} not configured, using profile '{}'", instrument, profile.name());
        }

        let snapshot = FactorSnapshot::from_scores(&scores);
        let aggregate = self.aggregator.aggregate_snapshot(&snapshot, &profile);
        let counts = snapshot.counts(profile.active_factors(), self.config.score.neutral_band);
        let coverage = coverage(&snapshot, profile.active_factors());
        let trend_value = snapshot.value(self.config.probability.trend_factor);

        let resolution = self.conflicts.resolve(aggregate.raw_score, counts, &snapshot);
        let dead_zone = self.config.dead_zone(&instrument);

        // Single writer for this instrument until the result is built
        let mut slot = self.states.lock(&instrument).await;
        if let Some(previous) = slot.as_ref() {
            if as_of < previous.last_evaluated {
                warn!(
                    "{} evaluated at {} before previous evaluation {}",
                    instrument, as_of, previous.last_evaluated
                );
            }
        }
        let (stabilized, next_state) = self.stabilizer.stabilize(
            &instrument,
            slot.as_ref(),
            resolution.adjusted_score,
            resolution.threshold,
            dead_zone,
            as_of,
        );
        *slot = Some(next_state);

        let (score, direction, correlation) = if self.correlation.is_leader(&instrument) {
            self.correlation
                .publish(stabilized.direction, stabilized.score, trend_value, as_of)
                .await;
            self.metrics.increment(metrics::LEADER_PUBLISHED, 1).await;
            (stabilized.score, stabilized.direction, None)
        } else {
            let input = DependentInput {
                score: stabilized.score,
                direction: stabilized.direction,
                coefficient: self.config.correlation_coefficient(&instrument),
                coverage,
                threshold: resolution.threshold.max(dead_zone),
            };
            let outcome = self.correlation.adjust(&instrument, input, as_of).await;
            (outcome.score, outcome.direction, Some(outcome))
        };
        drop(slot);

        let total_score = self.aggregator.clamp_score(score);
        let probability = self
            .probability
            .estimate(total_score, direction, counts, coverage, trend_value);

        let mut conflict_note = resolution.note.clone();
        if let Some(outcome) = correlation.as_ref().filter(|o| o.conflict) {
            let note = format!(
                "Leader {} ({:+.1}) moved direction {} -> {}",
                self.correlation.leader(),
                outcome.leader_score.unwrap_or(0.0),
                stabilized.direction,
                outcome.direction
            );
            conflict_note = Some(match conflict_note {
                Some(existing) => format!("{}; {}", existing, note),
                None => note,
            });
        }

        self.record_metrics(
            &instrument,
            resolution.rule,
            &stabilized.transition,
            correlation.as_ref(),
            coverage,
            started,
        )
        .await;
        decision_event(
            &instrument,
            direction,
            total_score,
            probability,
            stabilized.changed(),
            resolution.rule,
        );

        AggregationResult {
            evaluation_id,
            instrument,
            as_of,
            total_score,
            direction,
            probability,
            bullish_count: counts.bullish,
            bearish_count: counts.bearish,
            neutral_count: counts.neutral,
            conflict_note,
            raw_score: aggregate.raw_score,
            adjusted_score: resolution.adjusted_score,
            raw_direction: resolution.direction,
            threshold: resolution.threshold,
            conflict_level: resolution.conflict_level,
            rule: resolution.rule.map(str::to_string),
            transition: stabilized.transition,
            changed: stabilized.changed(),
            correlation,
            coverage,
            profile: profile.name().to_string(),
            contributions: aggregate.contributions,
        }
    }

    async fn record_metrics(
        &self,
        instrument: &str,
        rule: Option<&'static str>,
        transition: &Transition,
        correlation: Option<&CorrelationOutcome>,
        coverage: f64,
        started: Instant,
    ) {
        let m = &self.metrics;
        m.increment(metrics::EVALUATIONS, 1).await;
        m.histogram(metrics::EVALUATION_DURATION_US, started.elapsed().as_micros() as f64)
            .await;
        m.gauge(
            &format!("{}_{}", metrics::FACTOR_COVERAGE, instrument.to_lowercase()),
            coverage,
        )
        .await;

        if let Some(counter) = rule.and_then(metrics::rule_counter) {
            m.increment(counter, 1).await;
        }
        match transition {
            Transition::Changed { .. } => m.increment(metrics::DIRECTION_CHANGES, 1).await,
            Transition::Held { .. } => m.increment(metrics::HYSTERESIS_HOLDS, 1).await,
            Transition::Initial | Transition::Steady => {}
        }
        if let Some(outcome) = correlation.filter(|o| o.applied()) {
            m.increment(metrics::CORRELATION_APPLIED, 1).await;
            if outcome.conflict {
                m.increment(metrics::CORRELATION_CONFLICTS, 1).await;
            }
            if outcome.clamped {
                m.increment(metrics::CORRELATION_CLAMPED, 1).await;
            }
        }
    }
}

/// Fraction of `active` factors with a non-zero value
fn coverage<I>(snapshot: &FactorSnapshot, active: I) -> f64
where
    I: IntoIterator<Item = FactorId>,
{
    let (total, reported) = active.into_iter().fold((0usize, 0usize), |(total, reported), id| {
        (total + 1, reported + usize::from(snapshot.has_data(id)))
    });
    if total == 0 {
        0.0
    } else {
        reported as f64 / total as f64
    }
}
