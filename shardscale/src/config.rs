use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::ScalerError;

/// Gradient scaler configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ScalerConfig {
    /// Initial scale factor.
    #[serde(default = "default_init_scale")]
    pub init_scale: f64,

    /// Factor by which the scale is multiplied after `growth_interval`
    /// consecutive iterations without overflow.
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,

    /// Factor by which the scale is multiplied after an iteration
    /// with overflow.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Number of consecutive iterations without overflow before the
    /// scale grows.
    #[serde(default = "default_growth_interval")]
    pub growth_interval: i64,

    /// Enable gradient scaling.
    ///
    /// A disabled scaler passes outputs through unmodified and forwards
    /// optimizer steps.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Allow scaling without CUDA.
    ///
    /// When this is `false` and CUDA is not available, an enabled scaler
    /// is disabled at construction.
    #[serde(default = "default_cpu_fallback")]
    pub cpu_fallback: bool,
}

impl ScalerConfig {
    /// Check that the growth and backoff settings are in range.
    pub fn validate(&self) -> Result<(), ScalerError> {
        if !(self.init_scale > 0.0 && self.init_scale.is_finite()) {
            return Err(ScalerError::InvalidInitScale(self.init_scale));
        }

        if self.growth_factor <= 1.0 {
            return Err(ScalerError::InvalidGrowthFactor(self.growth_factor));
        }

        if self.backoff_factor >= 1.0 {
            return Err(ScalerError::InvalidBackoffFactor(self.backoff_factor));
        }

        if self.growth_interval <= 0 {
            return Err(ScalerError::InvalidGrowthInterval(self.growth_interval));
        }

        Ok(())
    }
}

impl Default for ScalerConfig {
    fn default() -> Self {
        ScalerConfig {
            init_scale: default_init_scale(),
            growth_factor: default_growth_factor(),
            backoff_factor: default_backoff_factor(),
            growth_interval: default_growth_interval(),
            enabled: default_enabled(),
            cpu_fallback: default_cpu_fallback(),
        }
    }
}

fn default_init_scale() -> f64 {
    2f64.powi(16)
}

fn default_growth_factor() -> f64 {
    2.0
}

fn default_backoff_factor() -> f64 {
    0.5
}

fn default_growth_interval() -> i64 {
    2000
}

fn default_enabled() -> bool {
    true
}

fn default_cpu_fallback() -> bool {
    false
}

pub trait TomlRead
where
    Self: Sized,
{
    fn from_toml_read(read: impl Read) -> Result<Self, ScalerError>;
}

impl TomlRead for ScalerConfig {
    fn from_toml_read(mut read: impl Read) -> Result<Self, ScalerError> {
        let mut data = String::new();
        read.read_to_string(&mut data)?;
        let config: ScalerConfig = toml::from_str(&data)?;
        Ok(config)
    }
}
