//! Decomposition configuration

use decomposition_core::Decomposition;
use decomposition_spi::{DecompositionError, Result, HOUR};
use serde::{Deserialize, Serialize};

/// Decomposition configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompositionConfig {
    /// Length of the buckets values arrive in, in seconds (default: 3600).
    pub bucket_length: i64,
    /// Rate at which statistics age, per day (default: 0.01).
    pub decay_rate: f64,
    /// Number of buckets in each seasonal component (default: 36).
    pub seasonal_component_size: usize,
    /// Adapt the decay rate to the bias of the prediction errors (default: false).
    pub decay_rate_control: bool,
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            bucket_length: HOUR,
            decay_rate: 0.01,
            seasonal_component_size: 36,
            decay_rate_control: false,
        }
    }
}

impl DecompositionConfig {
    pub fn new(bucket_length: i64, decay_rate: f64) -> Self {
        Self {
            bucket_length,
            decay_rate,
            ..Self::default()
        }
    }

    /// Set the seasonal component size.
    pub fn seasonal_component_size(mut self, size: usize) -> Self {
        self.seasonal_component_size = size;
        self
    }

    /// Enable or disable decay rate control.
    pub fn decay_rate_control(mut self, enabled: bool) -> Self {
        self.decay_rate_control = enabled;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_length <= 0 {
            return Err(invalid("bucket_length", "must be positive"));
        }
        if !self.decay_rate.is_finite() || self.decay_rate < 0.0 {
            return Err(invalid("decay_rate", "must be finite and non-negative"));
        }
        if self.seasonal_component_size == 0 {
            return Err(invalid("seasonal_component_size", "must be at least one"));
        }
        Ok(())
    }
}

fn invalid(name: &str, reason: &str) -> DecompositionError {
    DecompositionError::InvalidParameter {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

/// Construction of a decomposition from its configuration.
pub trait FromConfig: Sized {
    fn from_config(config: &DecompositionConfig) -> Result<Self>;
}

impl FromConfig for Decomposition {
    fn from_config(config: &DecompositionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Decomposition::new(
            config.decay_rate,
            config.bucket_length,
            config.seasonal_component_size,
            config.decay_rate_control,
        ))
    }
}
