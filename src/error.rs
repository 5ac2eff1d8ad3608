//! Error types for the signal engine

use crate::factor::FactorId;

/// Errors raised while loading or validating engine configuration.
///
/// These are fatal at startup. Nothing on the evaluation path returns them.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Weight profile '{profile}' sums to {sum:.6}, expected 1.0")]
    ProfileSum { profile: String, sum: f64 },

    #[error("Weight profile '{profile}' has invalid weight {weight} for {factor}")]
    InvalidWeight {
        profile: String,
        factor: FactorId,
        weight: f64,
    },

    #[error("Weight profile '{profile}' is empty")]
    EmptyProfile { profile: String },

    #[error("Weight profile '{0}' is not defined")]
    UnknownProfile(String),

    #[error("Weight profile '{0}' derives from itself")]
    CyclicProfile(String),

    #[error("Instrument '{instrument}' references unknown profile '{profile}'")]
    UnknownInstrumentProfile { instrument: String, profile: String },

    #[error("Leading instrument '{0}' is not configured")]
    UnknownLeader(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors an analyzer may report for a single factor.
///
/// The engine never propagates these: a failed analyzer contributes a neutral 0.
#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Invalid input {input}: {reason}")]
    InvalidInput { input: String, reason: String },

    #[error("Analyzer failed: {0}")]
    Failed(String),
}

/// Result type for analyzer computations
pub type AnalyzerResult<T> = std::result::Result<T, AnalyzerError>;
