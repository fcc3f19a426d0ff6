//! Persisted scaler snapshot for checkpoint/resume.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// The persistent part of a scaler.
///
/// Per-step bookkeeping (pending overflow flag, skipped flag, which groups
/// were unscaled) is never saved: a checkpoint is always taken between steps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    pub growth_interval: u64,
    pub growth_tracker: u64,
}

impl ScalerState {
    /// Reject records that would break the scaler invariants.
    ///
    /// Nothing is clamped: a bad record is an error.
    pub fn validate(&self) -> Result<()> {
        if !(self.scale > 0.0) || !self.scale.is_finite() {
            return Err(Error::InvalidState {
                reason: format!("scale must be positive and finite, got {}", self.scale),
            });
        }
        if !self.scale.recip().is_finite() {
            return Err(Error::InvalidState {
                reason: format!("scale {} has no finite reciprocal", self.scale),
            });
        }
        if self.growth_interval == 0 {
            return Err(Error::InvalidState {
                reason: "growth_interval must be > 0".to_string(),
            });
        }
        if !(self.growth_factor > 1.0) || !self.growth_factor.is_finite() {
            return Err(Error::InvalidState {
                reason: format!("growth_factor must be > 1.0, got {}", self.growth_factor),
            });
        }
        if !(self.backoff_factor > 0.0 && self.backoff_factor < 1.0) {
            return Err(Error::InvalidState {
                reason: format!(
                    "backoff_factor must be in (0, 1), got {}",
                    self.backoff_factor
                ),
            });
        }
        Ok(())
    }
}
