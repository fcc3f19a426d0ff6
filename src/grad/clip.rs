//! Gradient clipping utilities
//!
//! Clip gradients by global norm to prevent exploding gradients. With loss
//! scaling, clip only after the group has been unscaled, otherwise
//! `max_norm` is compared against scaled magnitudes.

use super::Gradients;
use crate::error::{Error, Result};

/// Global L2 norm across every entry of `grads`.
pub fn global_norm<G: Gradients + ?Sized>(grads: &G) -> f64 {
    grads.sum_of_squares().sqrt()
}

/// Clip gradients in-place by global L2 norm.
///
/// Scales every entry so the global norm does not exceed `max_norm`.
/// Returns the original global norm (before clipping). A non-finite norm is
/// returned as-is and the gradients are left untouched; such a step is
/// skipped by the scaler anyway.
pub fn clip_grad_norm<G: Gradients + ?Sized>(grads: &mut G, max_norm: f64) -> Result<f64> {
    if !(max_norm > 0.0) {
        return Err(Error::InvalidArgument {
            arg: "max_norm",
            reason: format!("must be positive, got {max_norm}"),
        });
    }

    let total_norm = global_norm(grads);
    if total_norm.is_finite() && total_norm > max_norm {
        let coef = max_norm / (total_norm + 1e-6);
        grads.mul_scalar_inplace(coef);
    }

    Ok(total_norm)
}
