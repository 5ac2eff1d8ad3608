//! Engine Configuration
//!
//! Every tuned constant of the engine lives here as a named, overridable
//! value. Defaults carry the tuned values; a YAML/TOML/JSON file and
//! `SIGNAL_ENGINE__*` environment variables may override any of them.

use crate::error::ConfigError;
use crate::factor::FactorId;
use crate::profile::WeightProfileResolver;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Environment variable prefix for overrides (`SIGNAL_ENGINE__STABILIZER__ALPHA=0.5`)
pub const ENV_PREFIX: &str = "SIGNAL_ENGINE";

/// Name of the built-in profile covering every factor
pub const FULL_PROFILE: &str = "full";
/// Name of the built-in profile for instruments without options/on-chain/liquidation feeds
pub const REDUCED_PROFILE: &str = "reduced";

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub score: ScoreConfig,
    pub conflict: ConflictConfig,
    pub stabilizer: StabilizerConfig,
    pub correlation: CorrelationConfig,
    pub probability: ProbabilityConfig,
    /// Profile used for instruments without an explicit entry
    pub default_profile: String,
    pub profiles: BTreeMap<String, ProfileConfig>,
    pub instruments: BTreeMap<String, InstrumentConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            FULL_PROFILE.to_string(),
            ProfileConfig {
                weights: standard_weights(),
                ..ProfileConfig::default()
            },
        );
        profiles.insert(
            REDUCED_PROFILE.to_string(),
            ProfileConfig {
                derive_from: Some(FULL_PROFILE.to_string()),
                exclude: vec![FactorId::Options, FactorId::OnChain, FactorId::Liquidations],
                ..ProfileConfig::default()
            },
        );

        let mut instruments = BTreeMap::new();
        instruments.insert(
            "BTC".to_string(),
            InstrumentConfig {
                profile: FULL_PROFILE.to_string(),
                dead_zone: Some(10.0),
                correlation: None,
            },
        );
        instruments.insert(
            "ETH".to_string(),
            InstrumentConfig {
                profile: FULL_PROFILE.to_string(),
                dead_zone: Some(10.0),
                correlation: Some(0.35),
            },
        );
        instruments.insert(
            "TON".to_string(),
            InstrumentConfig {
                profile: REDUCED_PROFILE.to_string(),
                dead_zone: Some(15.0),
                correlation: Some(0.25),
            },
        );

        Self {
            score: ScoreConfig::default(),
            conflict: ConflictConfig::default(),
            stabilizer: StabilizerConfig::default(),
            correlation: CorrelationConfig::default(),
            probability: ProbabilityConfig::default(),
            default_profile: FULL_PROFILE.to_string(),
            profiles,
            instruments,
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!("Loading engine config from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let loaded: EngineConfig = builder.build()?.try_deserialize()?;
        let loaded = loaded.normalized();
        loaded.validate()?;
        Ok(loaded)
    }

    /// Parse and validate an inline YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let parsed: EngineConfig = serde_yaml::from_str(yaml)?;
        let parsed = parsed.normalized();
        parsed.validate()?;
        Ok(parsed)
    }

    /// Upper-case instrument ids (config keys arrive lower-cased)
    pub fn normalized(mut self) -> Self {
        self.instruments = std::mem::take(&mut self.instruments)
            .into_iter()
            .map(|(id, cfg)| (normalize_instrument(&id), cfg))
            .collect();
        self.correlation.leader = normalize_instrument(&self.correlation.leader);
        self
    }

    /// Check every tunable and build the weight profiles once
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.score.validate()?;
        self.conflict.validate()?;
        self.stabilizer.validate()?;
        self.correlation.validate()?;
        self.probability.validate()?;

        for (id, instrument) in &self.instruments {
            if let Some(dz) = instrument.dead_zone {
                if !dz.is_finite() || dz < 0.0 {
                    return Err(ConfigError::invalid(
                        "instruments.dead_zone",
                        format!("{} has dead zone {}", id, dz),
                    ));
                }
            }
            if let Some(coef) = instrument.correlation {
                if !(0.0..=1.0).contains(&coef) {
                    return Err(ConfigError::invalid(
                        "instruments.correlation",
                        format!("{} has coefficient {}", id, coef),
                    ));
                }
            }
        }

        let leader = normalize_instrument(&self.correlation.leader);
        if !self.instruments.contains_key(&leader) {
            return Err(ConfigError::UnknownLeader(leader));
        }

        WeightProfileResolver::from_config(self).map(|_| ())
    }

    /// Settings for one instrument, if configured
    pub fn instrument(&self, instrument: &str) -> Option<&InstrumentConfig> {
        self.instruments.get(&normalize_instrument(instrument))
    }

    /// Dead zone for an instrument, falling back to the stabilizer default
    pub fn dead_zone(&self, instrument: &str) -> f64 {
        self.instrument(instrument)
            .and_then(|i| i.dead_zone)
            .unwrap_or(self.stabilizer.default_dead_zone)
    }

    /// Correlation coefficient to the leader, `None` for independent instruments
    pub fn correlation_coefficient(&self, instrument: &str) -> Option<f64> {
        self.instrument(instrument).and_then(|i| i.correlation)
    }
}

/// Canonical form of an instrument id
pub fn normalize_instrument(instrument: &str) -> String {
    instrument.trim().to_uppercase()
}

/// Score scale and clamping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreConfig {
    /// Multiplier from the weighted factor scale (±10) to the public scale
    pub output_scale: f64,
    /// Public score bound (±)
    pub max_score: f64,
    /// Ceiling on any single factor's weighted contribution (±, public scale)
    pub contribution_cap: f64,
    /// Factor values within ±band count as neutral
    pub neutral_band: f64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            output_scale: 10.0,
            max_score: 100.0,
            contribution_cap: 15.0,
            neutral_band: 0.5,
        }
    }
}

impl ScoreConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        positive("score.output_scale", self.output_scale)?;
        positive("score.max_score", self.max_score)?;
        positive("score.contribution_cap", self.contribution_cap)?;
        if !(0.0..10.0).contains(&self.neutral_band) {
            return Err(ConfigError::invalid(
                "score.neutral_band",
                format!("{} outside [0, 10)", self.neutral_band),
            ));
        }
        Ok(())
    }
}

/// Conflict resolution rules and adaptive threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Factors whose single extreme reading may override the aggregate
    pub extreme_factors: Vec<FactorId>,
    /// |value| at or above which an extreme factor fires
    pub extreme_threshold: f64,
    pub extreme_fraction: f64,
    pub extreme_boost: f64,
    /// Factors counted towards the strong-signal override
    pub strong_factors: Vec<FactorId>,
    pub strong_threshold: f64,
    pub strong_min_count: usize,
    pub strong_fraction: f64,
    pub strong_boost: f64,
    /// Dampen when neutral/total exceeds this ratio
    pub neutral_ratio_threshold: f64,
    /// Near tie: |bullish - bearish| at or below this margin...
    pub near_tie_margin: usize,
    /// ...with at least this many counted factors
    pub near_tie_min_factors: usize,
    /// Multiplier applied when dampening
    pub damping: f64,
    /// Ratio that makes one side a clear majority
    pub majority_ratio: f64,
    /// Direction threshold with no conflict (public scale)
    pub base_threshold: f64,
    pub moderate_bonus: f64,
    pub strong_bonus: f64,
    /// Both sides need this many factors before counts count as conflicting
    pub min_conflict_side: usize,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            extreme_factors: vec![FactorId::Rsi, FactorId::Liquidations],
            extreme_threshold: 9.0,
            extreme_fraction: 0.3,
            extreme_boost: 10.0,
            strong_factors: vec![
                FactorId::Rsi,
                FactorId::FearGreed,
                FactorId::TradesFlow,
                FactorId::Macd,
                FactorId::FundingRate,
            ],
            strong_threshold: 7.0,
            strong_min_count: 2,
            strong_fraction: 0.2,
            strong_boost: 5.0,
            neutral_ratio_threshold: 0.6,
            near_tie_margin: 2,
            near_tie_min_factors: 10,
            damping: 0.3,
            majority_ratio: 2.0,
            base_threshold: 10.0,
            moderate_bonus: 2.5,
            strong_bonus: 5.0,
            min_conflict_side: 2,
        }
    }
}

impl ConflictConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        factor_threshold("conflict.extreme_threshold", self.extreme_threshold)?;
        factor_threshold("conflict.strong_threshold", self.strong_threshold)?;
        unit_interval("conflict.damping", self.damping)?;
        unit_interval("conflict.neutral_ratio_threshold", self.neutral_ratio_threshold)?;
        unit_interval("conflict.extreme_fraction", self.extreme_fraction)?;
        unit_interval("conflict.strong_fraction", self.strong_fraction)?;
        non_negative("conflict.extreme_boost", self.extreme_boost)?;
        non_negative("conflict.strong_boost", self.strong_boost)?;
        non_negative("conflict.base_threshold", self.base_threshold)?;
        non_negative("conflict.moderate_bonus", self.moderate_bonus)?;
        non_negative("conflict.strong_bonus", self.strong_bonus)?;
        if self.majority_ratio < 1.0 {
            return Err(ConfigError::invalid(
                "conflict.majority_ratio",
                format!("{} is below 1.0", self.majority_ratio),
            ));
        }
        if self.strong_min_count == 0 {
            return Err(ConfigError::invalid("conflict.strong_min_count", "must be at least 1"));
        }
        Ok(())
    }
}

/// Smoothing and hysteresis
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizerConfig {
    /// Weight of the new score in the exponential smoothing
    pub alpha: f64,
    /// Minimum time between accepted direction changes
    pub cooldown_secs: i64,
    /// Score jump that bypasses the cooldown (public scale)
    pub bypass_delta: f64,
    /// Consecutive identical candidates that also bypass the cooldown (0 disables)
    pub confirmations_required: u32,
    /// Dead zone for instruments without their own
    pub default_dead_zone: f64,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            alpha: 0.4,
            cooldown_secs: 3600,
            bypass_delta: 30.0,
            confirmations_required: 3,
            default_dead_zone: 10.0,
        }
    }
}

impl StabilizerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(ConfigError::invalid(
                "stabilizer.alpha",
                format!("{} outside (0, 1]", self.alpha),
            ));
        }
        if self.cooldown_secs < 0 {
            return Err(ConfigError::invalid("stabilizer.cooldown_secs", "must not be negative"));
        }
        positive("stabilizer.bypass_delta", self.bypass_delta)?;
        non_negative("stabilizer.default_dead_zone", self.default_dead_zone)
    }
}

/// Leader/dependent correlation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Designated leading instrument
    pub leader: String,
    /// Lifetime of a published leader signal
    pub ttl_secs: i64,
    /// Leader |score| below this is "sideways" and ignored
    pub activation_threshold: f64,
    /// Leader |score| at or above this blocks opposite dependents
    pub strong_leader_threshold: f64,
    /// Dependents with coverage below this are not adjusted
    pub min_coverage: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            leader: "BTC".to_string(),
            ttl_secs: 600,
            activation_threshold: 10.0,
            strong_leader_threshold: 30.0,
            min_coverage: 0.5,
        }
    }
}

impl CorrelationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.leader.trim().is_empty() {
            return Err(ConfigError::invalid("correlation.leader", "must not be empty"));
        }
        if self.ttl_secs <= 0 {
            return Err(ConfigError::invalid("correlation.ttl_secs", "must be positive"));
        }
        non_negative("correlation.activation_threshold", self.activation_threshold)?;
        non_negative("correlation.strong_leader_threshold", self.strong_leader_threshold)?;
        unit_interval("correlation.min_coverage", self.min_coverage)
    }
}

/// One linear segment of the score -> probability curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbabilitySegment {
    /// Segment ends at this |score|
    pub up_to: f64,
    /// Probability points gained per score point inside the segment
    pub slope: f64,
}

/// Probability estimation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbabilityConfig {
    pub min: f64,
    pub max: f64,
    /// Ceiling for neutral calls
    pub neutral_max: f64,
    /// |score| scale at which the neutral curve saturates
    pub neutral_saturation: f64,
    pub segments: Vec<ProbabilitySegment>,
    /// Bonus at full bullish/bearish imbalance
    pub consensus_bonus: f64,
    /// Bonus at full data-source coverage
    pub coverage_bonus: f64,
    /// |score| at which bonuses reach full size
    pub bonus_full_strength: f64,
    /// Factor treated as the dominant trend
    pub trend_factor: FactorId,
    /// Penalty when a directional call contradicts the trend factor
    pub trend_penalty: f64,
    /// |trend| at or above which the contradiction counts
    pub trend_opposition: f64,
}

impl Default for ProbabilityConfig {
    fn default() -> Self {
        Self {
            min: 50.0,
            max: 78.0,
            neutral_max: 58.0,
            neutral_saturation: 6.0,
            segments: vec![
                ProbabilitySegment { up_to: 10.0, slope: 0.4 },
                ProbabilitySegment { up_to: 25.0, slope: 0.4 },
                ProbabilitySegment { up_to: 45.0, slope: 0.3 },
                ProbabilitySegment { up_to: 70.0, slope: 0.2 },
                ProbabilitySegment { up_to: 100.0, slope: 0.1 },
            ],
            consensus_bonus: 3.0,
            coverage_bonus: 2.0,
            bonus_full_strength: 25.0,
            trend_factor: FactorId::Trend,
            trend_penalty: 4.0,
            trend_opposition: 3.0,
        }
    }
}

impl ProbabilityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.min > 0.0 && self.min < self.neutral_max && self.neutral_max <= self.max && self.max < 100.0) {
            return Err(ConfigError::invalid(
                "probability",
                format!(
                    "bounds must satisfy 0 < min < neutral_max <= max < 100 (got {}, {}, {})",
                    self.min, self.neutral_max, self.max
                ),
            ));
        }
        if self.segments.is_empty() {
            return Err(ConfigError::invalid("probability.segments", "at least one segment required"));
        }
        let mut previous = 0.0;
        for segment in &self.segments {
            if !(segment.up_to > previous) || segment.slope < 0.0 || !segment.slope.is_finite() {
                return Err(ConfigError::invalid(
                    "probability.segments",
                    "segments must be ascending with non-negative slopes",
                ));
            }
            previous = segment.up_to;
        }
        positive("probability.neutral_saturation", self.neutral_saturation)?;
        positive("probability.bonus_full_strength", self.bonus_full_strength)?;
        non_negative("probability.consensus_bonus", self.consensus_bonus)?;
        non_negative("probability.coverage_bonus", self.coverage_bonus)?;
        non_negative("probability.trend_penalty", self.trend_penalty)?;
        non_negative("probability.trend_opposition", self.trend_opposition)
    }
}

/// A named weight table: explicit weights, or another profile minus some factors
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub weights: BTreeMap<FactorId, f64>,
    /// Derive from this profile, redistributing excluded weight proportionally
    pub derive_from: Option<String>,
    pub exclude: Vec<FactorId>,
}

/// Per-instrument settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub profile: String,
    /// Band around zero forced to neutral
    pub dead_zone: Option<f64>,
    /// Coefficient applied to the leader's score; `None` means independent
    pub correlation: Option<f64>,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            profile: FULL_PROFILE.to_string(),
            dead_zone: None,
            correlation: None,
        }
    }
}

/// Tuned weights of the full profile, by tier:
/// long horizon 0.40, short horizon 0.30, auxiliary 0.18, deep analysis 0.12
pub fn standard_weights() -> BTreeMap<FactorId, f64> {
    use FactorId::*;
    [
        (Trend, 0.10),
        (Momentum, 0.08),
        (Whales, 0.08),
        (Derivatives, 0.08),
        (Sentiment, 0.06),
        (Rsi, 0.04),
        (Macd, 0.04),
        (StochRsi, 0.03),
        (Bollinger, 0.03),
        (Mfi, 0.02),
        (Cci, 0.02),
        (Adx, 0.02),
        (Vwap, 0.03),
        (PriceMomentum, 0.03),
        (TradesFlow, 0.04),
        (FearGreed, 0.03),
        (FundingRate, 0.02),
        (OpenInterest, 0.02),
        (LongShortRatio, 0.02),
        (ExchangeFlows, 0.02),
        (OrderBook, 0.02),
        (SocialSentiment, 0.02),
        (Options, 0.02),
        (Macro, 0.01),
        (Liquidations, 0.02),
        (OrderFlow, 0.02),
        (VolumeProfile, 0.02),
        (SmartMoney, 0.02),
        (Wyckoff, 0.01),
        (Volatility, 0.01),
        (MultiExchange, 0.01),
        (OnChain, 0.01),
    ]
    .into_iter()
    .collect()
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("{} must be positive", value)))
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("{} must not be negative", value)))
    }
}

fn unit_interval(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("{} outside [0, 1]", value)))
    }
}

fn factor_threshold(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value <= 10.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("{} outside (0, 10]", value)))
    }
}
