//! Signal Engine Library
//!
//! Turns many independently computed factor scores into one stable,
//! explainable trading direction with a bounded confidence:
//! 1. Resolves the instrument's weight profile
//! 2. Aggregates factor scores into a raw score
//! 3. Resolves factor conflicts and picks an adaptive threshold
//! 4. Smooths the score and applies hysteresis per instrument
//! 5. Blends in the leading instrument's decision for dependents
//! 6. Estimates a probability for the final call

pub mod aggregator;
pub mod config;
pub mod conflict;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod factor;
pub mod observability;
pub mod probability;
pub mod profile;
pub mod stabilizer;
pub mod state;


// Re-export main types for convenience
pub use aggregator::{AggregateScore, Aggregator, FactorContribution};
pub use config::{
    ConflictConfig, CorrelationConfig, EngineConfig, InstrumentConfig, ProbabilityConfig,
    ProfileConfig, ScoreConfig, StabilizerConfig,
};
pub use conflict::{ConflictLevel, ConflictResolution, ConflictResolver, ConflictRule};
pub use correlation::{CorrelationBridge, CorrelationOutcome, CorrelationSignal, CorrelationSkip};
pub use engine::{AggregationResult, EvaluationRequest, SignalEngine};
pub use error::{AnalyzerError, AnalyzerResult, ConfigError};
pub use factor::{
    AnalysisContext, Analyzer, Direction, FactorCounts, FactorId, FactorScore, FactorSnapshot,
    FactorTier, RangeAnalyzer,
};
pub use observability::{EngineMetrics, MetricsSnapshot};
pub use probability::ProbabilityEstimator;
pub use profile::{WeightProfile, WeightProfileResolver};
pub use stabilizer::{InstrumentState, StabilizedSignal, Stabilizer, Transition};
