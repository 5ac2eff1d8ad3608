//! Weight profiles - which factors count and how much, per instrument
//!
//! Profiles are built and validated once when the engine is configured.
//! An instrument lacking a data source gets a profile where that factor's
//! weight is zero and its share was spread over the remaining factors, so
//! nothing is redistributed at evaluation time.

use crate::config::{normalize_instrument, EngineConfig, ProfileConfig};
use crate::error::ConfigError;
use crate::factor::FactorId;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Allowed deviation of a profile's weight sum from 1.0
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Factor -> weight table. Weights are non-negative and sum to 1.0.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightProfile {
    name: String,
    weights: BTreeMap<FactorId, f64>,
}

impl WeightProfile {
    /// Build and validate a profile
    pub fn new(name: impl Into<String>, weights: BTreeMap<FactorId, f64>) -> Result<Self, ConfigError> {
        let profile = Self {
            name: name.into(),
            weights,
        };
        profile.validate()?;
        Ok(profile)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Weight of a factor, 0 when the profile does not use it
    pub fn weight(&self, id: FactorId) -> f64 {
        self.weights.get(&id).copied().unwrap_or(0.0)
    }

    pub fn weights(&self) -> &BTreeMap<FactorId, f64> {
        &self.weights
    }

    /// Factors with a non-zero weight
    pub fn active_factors(&self) -> impl Iterator<Item = FactorId> + '_ {
        self.weights
            .iter()
            .filter(|(_, w)| **w > 0.0)
            .map(|(id, _)| *id)
    }

    pub fn active_count(&self) -> usize {
        self.active_factors().count()
    }

    pub fn sum(&self) -> f64 {
        self.weights.values().sum()
    }

    /// Copy of this profile without `excluded`, their weight spread
    /// proportionally over the remaining factors
    pub fn without(&self, name: impl Into<String>, excluded: &[FactorId]) -> Result<Self, ConfigError> {
        let name = name.into();
        let kept: BTreeMap<FactorId, f64> = self
            .weights
            .iter()
            .filter(|(id, _)| !excluded.contains(id))
            .map(|(id, w)| (*id, *w))
            .collect();

        let kept_sum: f64 = kept.values().sum();
        if kept_sum <= 0.0 {
            return Err(ConfigError::EmptyProfile { profile: name });
        }

        let mut weights: BTreeMap<FactorId, f64> =
            kept.into_iter().map(|(id, w)| (id, w / kept_sum)).collect();
        for id in excluded {
            weights.insert(*id, 0.0);
        }
        debug!(
            "Derived profile '{}' from '{}' excluding {:?}",
            name, self.name, excluded
        );
        WeightProfile::new(name, weights)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (factor, weight) in &self.weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(ConfigError::InvalidWeight {
                    profile: self.name.clone(),
                    factor: *factor,
                    weight: *weight,
                });
            }
        }
        if self.active_count() == 0 {
            return Err(ConfigError::EmptyProfile {
                profile: self.name.clone(),
            });
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::ProfileSum {
                profile: self.name.clone(),
                sum,
            });
        }
        Ok(())
    }
}

/// Static instrument -> profile lookup
#[derive(Debug, Clone)]
pub struct WeightProfileResolver {
    profiles: HashMap<String, Arc<WeightProfile>>,
    instruments: HashMap<String, String>,
    default: Arc<WeightProfile>,
}

impl WeightProfileResolver {
    /// Build every configured profile and check instrument references
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        let mut profiles: HashMap<String, Arc<WeightProfile>> = HashMap::new();
        for name in config.profiles.keys() {
            let mut stack = Vec::new();
            build_profile(name, &config.profiles, &mut profiles, &mut stack)?;
        }

        let default = profiles
            .get(&config.default_profile)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownProfile(config.default_profile.clone()))?;

        let mut instruments = HashMap::new();
        for (id, instrument) in &config.instruments {
            if !profiles.contains_key(&instrument.profile) {
                return Err(ConfigError::UnknownInstrumentProfile {
                    instrument: id.clone(),
                    profile: instrument.profile.clone(),
                });
            }
            instruments.insert(normalize_instrument(id), instrument.profile.clone());
        }

        Ok(Self {
            profiles,
            instruments,
            default,
        })
    }

    /// Profile for an instrument; unknown instruments get the default profile
    pub fn resolve(&self, instrument: &str) -> Arc<WeightProfile> {
        self.instruments
            .get(&normalize_instrument(instrument))
            .and_then(|name| self.profiles.get(name))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default))
    }

    /// Profile by name
    pub fn profile(&self, name: &str) -> Option<Arc<WeightProfile>> {
        self.profiles.get(name).cloned()
    }

    pub fn profile_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn build_profile(
    name: &str,
    configs: &BTreeMap<String, ProfileConfig>,
    built: &mut HashMap<String, Arc<WeightProfile>>,
    stack: &mut Vec<String>,
) -> Result<Arc<WeightProfile>, ConfigError> {
    if let Some(profile) = built.get(name) {
        return Ok(Arc::clone(profile));
    }
    if stack.iter().any(|n| n == name) {
        return Err(ConfigError::CyclicProfile(name.to_string()));
    }
    let cfg = configs
        .get(name)
        .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))?;

    stack.push(name.to_string());
    let profile = match &cfg.derive_from {
        Some(base) => {
            let base = build_profile(base, configs, built, stack)?;
            base.without(name, &cfg.exclude)?
        }
        None => {
            let mut weights = cfg.weights.clone();
            for id in &cfg.exclude {
                weights.insert(*id, 0.0);
            }
            WeightProfile::new(name, weights)?
        }
    };
    stack.pop();

    let profile = Arc::new(profile);
    built.insert(name.to_string(), Arc::clone(&profile));
    Ok(profile)
}
