//! Factor model - the uniform value every analyzer produces
//!
//! A factor is one independently computed scoring dimension. Every factor
//! lands on the same [-10, +10] scale where 0 means "no data / neutral",
//! so the aggregator can weigh them without knowing what they measure.

use crate::error::{AnalyzerError, AnalyzerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

/// Lower bound of the factor scale
pub const FACTOR_MIN: f64 = -10.0;
/// Upper bound of the factor scale
pub const FACTOR_MAX: f64 = 10.0;

/// Clamp a raw factor value onto [-10, +10]. Non-finite values become 0.
pub fn clamp_factor(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(FACTOR_MIN, FACTOR_MAX)
    } else {
        0.0
    }
}

/// Horizon/source tier a factor belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorTier {
    /// Slow structural factors (trend, flows, positioning)
    LongHorizon,
    /// Fast technical oscillators
    ShortHorizon,
    /// External data feeds that some instruments lack
    AuxiliarySource,
    /// Expensive deep-analysis enhancers
    DeepAnalysis,
}

/// Fixed identifier of a scoring dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorId {
    // Long horizon
    Trend,
    Momentum,
    Whales,
    Derivatives,
    Sentiment,
    // Short horizon
    Rsi,
    Macd,
    StochRsi,
    Bollinger,
    Mfi,
    Cci,
    Adx,
    Vwap,
    PriceMomentum,
    TradesFlow,
    // Auxiliary sources
    FearGreed,
    FundingRate,
    OpenInterest,
    LongShortRatio,
    ExchangeFlows,
    OrderBook,
    SocialSentiment,
    Options,
    Macro,
    // Deep analysis
    Liquidations,
    OrderFlow,
    VolumeProfile,
    SmartMoney,
    Wyckoff,
    Volatility,
    MultiExchange,
    OnChain,
}

impl FactorId {
    /// Every factor, grouped by tier
    pub const ALL: [FactorId; 32] = [
        FactorId::Trend,
        FactorId::Momentum,
        FactorId::Whales,
        FactorId::Derivatives,
        FactorId::Sentiment,
        FactorId::Rsi,
        FactorId::Macd,
        FactorId::StochRsi,
        FactorId::Bollinger,
        FactorId::Mfi,
        FactorId::Cci,
        FactorId::Adx,
        FactorId::Vwap,
        FactorId::PriceMomentum,
        FactorId::TradesFlow,
        FactorId::FearGreed,
        FactorId::FundingRate,
        FactorId::OpenInterest,
        FactorId::LongShortRatio,
        FactorId::ExchangeFlows,
        FactorId::OrderBook,
        FactorId::SocialSentiment,
        FactorId::Options,
        FactorId::Macro,
        FactorId::Liquidations,
        FactorId::OrderFlow,
        FactorId::VolumeProfile,
        FactorId::SmartMoney,
        FactorId::Wyckoff,
        FactorId::Volatility,
        FactorId::MultiExchange,
        FactorId::OnChain,
    ];

    pub fn tier(&self) -> FactorTier {
        use FactorId::*;
        match self {
            Trend | Momentum | Whales | Derivatives | Sentiment => FactorTier::LongHorizon,
            Rsi | Macd | StochRsi | Bollinger | Mfi | Cci | Adx | Vwap | PriceMomentum
            | TradesFlow => FactorTier::ShortHorizon,
            FearGreed | FundingRate | OpenInterest | LongShortRatio | ExchangeFlows
            | OrderBook | SocialSentiment | Options | Macro => FactorTier::AuxiliarySource,
            Liquidations | OrderFlow | VolumeProfile | SmartMoney | Wyckoff | Volatility
            | MultiExchange | OnChain => FactorTier::DeepAnalysis,
        }
    }

    pub fn as_str(&self) -> &'static str {
        use FactorId::*;
        match self {
            Trend => "trend",
            Momentum => "momentum",
            Whales => "whales",
            Derivatives => "derivatives",
            Sentiment => "sentiment",
            Rsi => "rsi",
            Macd => "macd",
            StochRsi => "stoch_rsi",
            Bollinger => "bollinger",
            Mfi => "mfi",
            Cci => "cci",
            Adx => "adx",
            Vwap => "vwap",
            PriceMomentum => "price_momentum",
            TradesFlow => "trades_flow",
            FearGreed => "fear_greed",
            FundingRate => "funding_rate",
            OpenInterest => "open_interest",
            LongShortRatio => "long_short_ratio",
            ExchangeFlows => "exchange_flows",
            OrderBook => "order_book",
            SocialSentiment => "social_sentiment",
            Options => "options",
            Macro => "macro",
            Liquidations => "liquidations",
            OrderFlow => "order_flow",
            VolumeProfile => "volume_profile",
            SmartMoney => "smart_money",
            Wyckoff => "wyckoff",
            Volatility => "volatility",
            MultiExchange => "multi_exchange",
            OnChain => "on_chain",
        }
    }
}

impl fmt::Display for FactorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One factor's value for one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorScore {
    pub id: FactorId,
    pub value: f64,
}

impl FactorScore {
    /// Create a score, clamped onto the factor scale
    pub fn new(id: FactorId, value: f64) -> Self {
        Self {
            id,
            value: clamp_factor(value),
        }
    }

    /// Neutral placeholder for a factor whose source had no data or failed
    pub fn missing(id: FactorId) -> Self {
        Self { id, value: 0.0 }
    }

    pub fn has_data(&self) -> bool {
        self.value != 0.0
    }
}

/// Trading direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
    #[default]
    Neutral,
}

impl Direction {
    /// Classify a score against a symmetric threshold (strict inequality)
    pub fn from_score(score: f64, threshold: f64) -> Self {
        if score > threshold {
            Direction::Long
        } else if score < -threshold {
            Direction::Short
        } else {
            Direction::Neutral
        }
    }

    pub fn is_directional(&self) -> bool {
        !matches!(self, Direction::Neutral)
    }

    /// +1 for long, -1 for short, 0 for neutral
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Neutral => 0.0,
        }
    }

    /// True when both directions are directional and point opposite ways
    pub fn opposes(&self, other: Direction) -> bool {
        self.is_directional() && other.is_directional() && *self != other
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::Long => "long",
            Direction::Short => "short",
            Direction::Neutral => "neutral",
        };
        f.write_str(s)
    }
}

/// Bullish/bearish/neutral tally over a profile's active factors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorCounts {
    pub bullish: usize,
    pub bearish: usize,
    pub neutral: usize,
}

impl FactorCounts {
    pub fn new(bullish: usize, bearish: usize, neutral: usize) -> Self {
        Self {
            bullish,
            bearish,
            neutral,
        }
    }

    pub fn total(&self) -> usize {
        self.bullish + self.bearish + self.neutral
    }

    pub fn directional(&self) -> usize {
        self.bullish + self.bearish
    }

    /// Share of neutral factors, 0 when nothing was counted
    pub fn neutral_ratio(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.neutral as f64 / total as f64,
        }
    }

    /// Bullish/bearish imbalance in [0, 1]
    pub fn imbalance(&self) -> f64 {
        match self.directional() {
            0 => 0.0,
            directional => self.bullish.abs_diff(self.bearish) as f64 / directional as f64,
        }
    }

    /// Direction holding at least `ratio` times the other side, if any
    pub fn majority(&self, ratio: f64) -> Direction {
        let bull = self.bullish as f64;
        let bear = self.bearish as f64;
        if self.bullish > 0 && bull >= bear * ratio && self.bullish > self.bearish {
            Direction::Long
        } else if self.bearish > 0 && bear >= bull * ratio && self.bearish > self.bullish {
            Direction::Short
        } else {
            Direction::Neutral
        }
    }
}

/// The factor values of one evaluation, keyed by id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactorSnapshot {
    values: HashMap<FactorId, f64>,
}

impl FactorSnapshot {
    /// Build a snapshot. Values are clamped; a repeated id keeps the last value.
    pub fn from_scores(scores: &[FactorScore]) -> Self {
        let mut values = HashMap::with_capacity(scores.len());
        for score in scores {
            if values.insert(score.id, clamp_factor(score.value)).is_some() {
                debug!("Duplicate factor {} in snapshot, keeping last value", score.id);
            }
        }
        Self { values }
    }

    /// Value for a factor, 0 when absent
    pub fn value(&self, id: FactorId) -> f64 {
        self.values.get(&id).copied().unwrap_or(0.0)
    }

    /// Whether the factor reported a non-zero value
    pub fn has_data(&self, id: FactorId) -> bool {
        self.value(id) != 0.0
    }

    pub fn iter(&self) -> impl Iterator<Item = (FactorId, f64)> + '_ {
        self.values.iter().map(|(id, v)| (*id, *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Tally the given factors; values inside ±`neutral_band` count as neutral
    pub fn counts<I>(&self, factors: I, neutral_band: f64) -> FactorCounts
    where
        I: IntoIterator<Item = FactorId>,
    {
        let mut counts = FactorCounts::default();
        for id in factors {
            let v = self.value(id);
            if v > neutral_band {
                counts.bullish += 1;
            } else if v < -neutral_band {
                counts.bearish += 1;
            } else {
                counts.neutral += 1;
            }
        }
        counts
    }
}

/// Pre-fetched inputs an analyzer reads from
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub instrument: String,
    pub as_of: DateTime<Utc>,
    pub inputs: HashMap<String, f64>,
}

impl AnalysisContext {
    pub fn new(instrument: impl Into<String>, as_of: DateTime<Utc>) -> Self {
        Self {
            instrument: instrument.into(),
            as_of,
            inputs: HashMap::new(),
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: f64) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    /// Read a finite input value
    pub fn input(&self, key: &str) -> AnalyzerResult<f64> {
        match self.inputs.get(key) {
            Some(v) if v.is_finite() => Ok(*v),
            Some(v) => Err(AnalyzerError::InvalidInput {
                input: key.to_string(),
                reason: format!("non-finite value {}", v),
            }),
            None => Err(AnalyzerError::MissingInput(key.to_string())),
        }
    }
}

/// Capability every factor analyzer implements
pub trait Analyzer: Send + Sync {
    /// Factor this analyzer produces
    fn factor(&self) -> FactorId;

    /// Compute the factor value on the [-10, +10] scale
    fn compute(&self, ctx: &AnalysisContext) -> AnalyzerResult<f64>;
}

/// Maps one named input linearly from `[low, high]` onto [-10, +10].
///
/// `low` may exceed `high` to invert the mapping (e.g. fear & greed, where
/// extreme fear is bullish).
#[derive(Debug, Clone)]
pub struct RangeAnalyzer {
    factor: FactorId,
    input: String,
    low: f64,
    high: f64,
}

impl RangeAnalyzer {
    pub fn new(factor: FactorId, input: impl Into<String>, low: f64, high: f64) -> Self {
        Self {
            factor,
            input: input.into(),
            low,
            high,
        }
    }
}

impl Analyzer for RangeAnalyzer {
    fn factor(&self) -> FactorId {
        self.factor
    }

    fn compute(&self, ctx: &AnalysisContext) -> AnalyzerResult<f64> {
        let value = ctx.input(&self.input)?;
        if self.high == self.low {
            return Err(AnalyzerError::Failed(format!(
                "degenerate range for {}",
                self.input
            )));
        }
        let unit = (value - self.low) / (self.high - self.low);
        Ok(clamp_factor(unit * (FACTOR_MAX - FACTOR_MIN) + FACTOR_MIN))
    }
}

/// Outcome of running a set of analyzers
#[derive(Debug, Clone, Default)]
pub struct AnalyzerRun {
    pub scores: Vec<FactorScore>,
    pub failures: Vec<(FactorId, String)>,
}

/// Run every analyzer in isolation.
///
/// An analyzer that errors or panics yields a 0-valued score for its factor;
/// the rest of the run continues.
pub fn run_analyzers(analyzers: &[Box<dyn Analyzer>], ctx: &AnalysisContext) -> AnalyzerRun {
    let mut run = AnalyzerRun::default();
    for analyzer in analyzers {
        let factor = analyzer.factor();
        let outcome = catch_unwind(AssertUnwindSafe(|| analyzer.compute(ctx)));
        match outcome {
            Ok(Ok(value)) => run.scores.push(FactorScore::new(factor, value)),
            Ok(Err(e)) => {
                warn!("{}: analyzer {} failed: {}", ctx.instrument, factor, e);
                run.failures.push((factor, e.to_string()));
                run.scores.push(FactorScore::missing(factor));
            }
            Err(_) => {
                warn!("{}: analyzer {} panicked", ctx.instrument, factor);
                run.failures.push((factor, "panicked".to_string()));
                run.scores.push(FactorScore::missing(factor));
            }
        }
    }
    run
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingAnalyzer;

    impl Analyzer for FailingAnalyzer {
        fn factor(&self) -> FactorId {
            FactorId::Whales
        }

        fn compute(&self, _ctx: &AnalysisContext) -> AnalyzerResult<f64> {
            Err(AnalyzerError::Failed("upstream timeout".to_string()))
        }
    }

    struct PanickingAnalyzer;

    impl Analyzer for PanickingAnalyzer {
        fn factor(&self) -> FactorId {
            FactorId::OnChain
        }

        fn compute(&self, _ctx: &AnalysisContext) -> AnalyzerResult<f64> {
            panic!("index out of bounds");
        }
    }

    #[test]
    fn test_clamp_factor() {
        assert_eq!(clamp_factor(15.0), 10.0);
        assert_eq!(clamp_factor(-42.0), -10.0);
        assert_eq!(clamp_factor(3.5), 3.5);
        assert_eq!(clamp_factor(f64::NAN), 0.0);
        assert_eq!(clamp_factor(f64::INFINITY), 0.0);
    }

    #[test]
    fn test_all_factors_unique() {
        let mut seen = std::collections::HashSet::new();
        for id in FactorId::ALL {
            assert!(seen.insert(id), "duplicate factor {}", id);
        }
        assert_eq!(seen.len(), 32);
    }

    #[test]
    fn test_tiers() {
        let mut per_tier = std::collections::HashMap::new();
        for id in FactorId::ALL {
            *per_tier.entry(id.tier()).or_insert(0) += 1;
        }
        assert_eq!(per_tier[&FactorTier::LongHorizon], 5);
        assert_eq!(per_tier[&FactorTier::ShortHorizon], 10);
        assert_eq!(per_tier[&FactorTier::AuxiliarySource], 9);
        assert_eq!(per_tier[&FactorTier::DeepAnalysis], 8);
        assert_eq!(FactorId::Options.tier(), FactorTier::AuxiliarySource);
        assert_eq!(FactorId::OnChain.tier(), FactorTier::DeepAnalysis);
    }

    #[test]
    fn test_factor_serde_names() {
        let json = serde_json::to_string(&FactorId::FearGreed).unwrap();
        assert_eq!(json, "\"fear_greed\"");
        for id in FactorId::ALL {
            let json = serde_json::to_string(&id).unwrap();
            assert_eq!(json, format!("\"{}\"", id.as_str()));
        }
    }

    #[test]
    fn test_counts_and_majority() {
        let snapshot = FactorSnapshot::from_scores(&[
            FactorScore::new(FactorId::Trend, 4.0),
            FactorScore::new(FactorId::Rsi, -6.0),
            FactorScore::new(FactorId::Macd, 0.2),
            FactorScore::new(FactorId::Whales, 1.0),
        ]);
        let counts = snapshot.counts(
            [
                FactorId::Trend,
                FactorId::Rsi,
                FactorId::Macd,
                FactorId::Whales,
                FactorId::Options,
            ],
            0.5,
        );
        assert_eq!(counts, FactorCounts::new(2, 1, 2));
        assert_eq!(counts.majority(2.0), Direction::Long);
        assert_eq!(FactorCounts::new(3, 2, 0).majority(2.0), Direction::Neutral);
        assert_eq!(FactorCounts::new(2, 8, 0).majority(2.0), Direction::Short);
        assert_eq!(FactorCounts::default().majority(2.0), Direction::Neutral);
    }

    #[test]
    fn test_direction_from_score() {
        assert_eq!(Direction::from_score(10.5, 10.0), Direction::Long);
        assert_eq!(Direction::from_score(10.0, 10.0), Direction::Neutral);
        assert_eq!(Direction::from_score(-10.5, 10.0), Direction::Short);
        assert!(Direction::Long.opposes(Direction::Short));
        assert!(!Direction::Long.opposes(Direction::Neutral));
        assert_eq!(Direction::Short.sign(), -1.0);
        assert_eq!(Direction::Neutral.sign(), 0.0);
    }

    #[test]
    fn test_range_analyzer_inverted() {
        let ctx = AnalysisContext::new("BTC", Utc::now()).with_input("fear_greed", 10.0);
        // Extreme fear is bullish: map 100 -> -10, 0 -> +10
        let analyzer = RangeAnalyzer::new(FactorId::FearGreed, "fear_greed", 100.0, 0.0);
        let value = analyzer.compute(&ctx).unwrap();
        assert!((value - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_run_analyzers_isolates_failures() {
        let ctx = AnalysisContext::new("ETH", Utc::now()).with_input("rsi", 50.0);
        let analyzers: Vec<Box<dyn Analyzer>> = vec![
            Box::new(RangeAnalyzer::new(FactorId::Rsi, "rsi", 100.0, 0.0)),
            Box::new(FailingAnalyzer),
            Box::new(PanickingAnalyzer),
            Box::new(RangeAnalyzer::new(FactorId::FearGreed, "missing", 100.0, 0.0)),
        ];
        let run = run_analyzers(&analyzers, &ctx);
        assert_eq!(run.scores.len(), 4);
        assert_eq!(run.failures.len(), 3);
        assert_eq!(run.scores[0], FactorScore::new(FactorId::Rsi, 0.0));
        assert_eq!(run.scores[1], FactorScore::missing(FactorId::Whales));
        assert_eq!(run.scores[2], FactorScore::missing(FactorId::OnChain));
    }
}
