//! Loss scaler configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_init_scale() -> f64 {
    65536.0
}

fn default_growth_factor() -> f64 {
    2.0
}

fn default_backoff_factor() -> f64 {
    0.5
}

fn default_growth_interval() -> u64 {
    2000
}

fn default_enabled() -> bool {
    true
}

/// Constructor-time scaler configuration, immutable once a scaler is built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalerConfig {
    /// Starting loss scale (2^16 by default)
    #[serde(default = "default_init_scale")]
    pub init_scale: f64,

    /// Multiply the scale by this after `growth_interval` clean steps
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,

    /// Multiply the scale by this on overflow
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Consecutive clean steps required before the scale grows
    #[serde(default = "default_growth_interval")]
    pub growth_interval: u64,

    /// When false every operation is a pass-through
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            init_scale: default_init_scale(),
            growth_factor: default_growth_factor(),
            backoff_factor: default_backoff_factor(),
            growth_interval: default_growth_interval(),
            enabled: default_enabled(),
        }
    }
}

impl ScalerConfig {
    /// FP16 preset: scale=65536, grow=2x, backoff=0.5x, interval=2000.
    pub fn fp16() -> Self {
        Self::default()
    }

    /// Scaling turned off.
    ///
    /// BF16 has the same exponent range as F32, so it does not need a scaler;
    /// keeping one in disabled mode lets the training loop stay identical.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_init_scale(mut self, scale: f64) -> Self {
        self.init_scale = scale;
        self
    }

    pub fn with_growth_factor(mut self, factor: f64) -> Self {
        self.growth_factor = factor;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_growth_interval(mut self, interval: u64) -> Self {
        self.growth_interval = interval;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Validate configuration constraints
    pub fn validate(&self) -> Result<()> {
        validate_scale("init_scale", self.init_scale)?;
        validate_growth_factor(self.growth_factor)?;
        validate_backoff_factor(self.backoff_factor)?;
        validate_growth_interval(self.growth_interval)?;
        Ok(())
    }

    /// Load and validate a configuration from a YAML file.
    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = read_config(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| Error::InvalidArgument {
            arg: "config",
            reason: format!("failed to parse YAML: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration from a JSON file.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = read_config(path.as_ref())?;
        let config: Self = serde_json::from_str(&content).map_err(|e| Error::InvalidArgument {
            arg: "config",
            reason: format!("failed to parse JSON: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }
}

fn read_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::InvalidArgument {
        arg: "config",
        reason: format!("failed to read {}: {e}", path.display()),
    })
}

pub(crate) fn validate_scale(arg: &'static str, scale: f64) -> Result<()> {
    if !(scale > 0.0) || !scale.is_finite() {
        return Err(Error::InvalidArgument {
            arg,
            reason: format!("must be positive and finite, got {scale}"),
        });
    }
    if !scale.recip().is_finite() {
        return Err(Error::InvalidArgument {
            arg,
            reason: format!("too small to unscale by, 1/{scale} overflows f64"),
        });
    }
    Ok(())
}

pub(crate) fn validate_growth_factor(factor: f64) -> Result<()> {
    if !(factor > 1.0) || !factor.is_finite() {
        return Err(Error::InvalidArgument {
            arg: "growth_factor",
            reason: format!("must be > 1.0, got {factor}"),
        });
    }
    Ok(())
}

pub(crate) fn validate_backoff_factor(factor: f64) -> Result<()> {
    if !(factor > 0.0 && factor < 1.0) {
        return Err(Error::InvalidArgument {
            arg: "backoff_factor",
            reason: format!("must be in (0, 1), got {factor}"),
        });
    }
    Ok(())
}

pub(crate) fn validate_growth_interval(interval: u64) -> Result<()> {
    if interval == 0 {
        return Err(Error::InvalidArgument {
            arg: "growth_interval",
            reason: "must be > 0".to_string(),
        });
    }
    Ok(())
}
