//! Engine tuning knobs, stored as a human-readable TOML document.
//!
//! Every field has a default, so an empty file (or no file at all) is a valid
//! configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub optimizer: OptimizerConfig,
    pub thresholds: ThresholdConfig,
    pub compute: ComputeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Upper bound on boundary refinement steps.
    pub max_iterations: usize,
    /// Convergence is declared once the boundary moves by at most
    /// `tolerance × (max − min)` of the intensity range.
    pub tolerance: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Absolute difference above which a replaced threshold is reported as drift.
    pub drift_tolerance: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            drift_tolerance: 1e-6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Number of cells handled by one parallel work unit.
    pub chunk_size: usize,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self { chunk_size: 4096 }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.optimizer.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "optimizer.max_iterations must be at least 1".into(),
            ));
        }
        if !(self.optimizer.tolerance.is_finite() && self.optimizer.tolerance >= 0.0) {
            return Err(ConfigError::Invalid(
                "optimizer.tolerance must be a finite, non-negative number".into(),
            ));
        }
        if !(self.thresholds.drift_tolerance.is_finite() && self.thresholds.drift_tolerance >= 0.0)
        {
            return Err(ConfigError::Invalid(
                "thresholds.drift_tolerance must be a finite, non-negative number".into(),
            ));
        }
        if self.compute.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "compute.chunk_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
