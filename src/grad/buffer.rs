//! In-place scalar multiplication and finiteness scan over gradient buffers

use half::{bf16, f16};
use std::collections::{BTreeMap, HashMap};

/// A scalar gradient entry.
///
/// Reduced-precision types are widened to `f64`, multiplied, and rounded
/// back, so a product that no longer fits the narrow type becomes infinite
/// and is reported by the scan.
pub trait GradElement: Copy {
    /// Multiply by `factor`, rounding to `Self`.
    fn mul_scalar(self, factor: f64) -> Self;

    /// Whether the value is neither infinite nor NaN.
    fn finite(self) -> bool;

    /// Widen to `f64`.
    fn to_f64(self) -> f64;
}

impl GradElement for f32 {
    fn mul_scalar(self, factor: f64) -> Self {
        (self as f64 * factor) as f32
    }

    fn finite(self) -> bool {
        self.is_finite()
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl GradElement for f64 {
    fn mul_scalar(self, factor: f64) -> Self {
        self * factor
    }

    fn finite(self) -> bool {
        self.is_finite()
    }

    fn to_f64(self) -> f64 {
        self
    }
}

impl GradElement for f16 {
    fn mul_scalar(self, factor: f64) -> Self {
        f16::from_f64(f16::to_f64(self) * factor)
    }

    fn finite(self) -> bool {
        self.is_finite()
    }

    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }
}

impl GradElement for bf16 {
    fn mul_scalar(self, factor: f64) -> Self {
        bf16::from_f64(bf16::to_f64(self) * factor)
    }

    fn finite(self) -> bool {
        self.is_finite()
    }

    fn to_f64(self) -> f64 {
        bf16::to_f64(self)
    }
}

/// A collection of gradient values for one parameter group.
pub trait Gradients {
    /// Total number of scalar entries.
    fn numel(&self) -> usize;

    /// Multiply every entry by `factor` in place.
    ///
    /// Returns `true` if any entry is non-finite after the multiplication.
    /// Every entry is visited even after the first non-finite one.
    fn mul_scalar_inplace(&mut self, factor: f64) -> bool;

    /// Sum of squared entries, accumulated in `f64`.
    fn sum_of_squares(&self) -> f64;

    /// Whether any entry is `+inf`, `-inf`, or NaN.
    fn has_non_finite(&self) -> bool;
}

impl<E: GradElement> Gradients for [E] {
    fn numel(&self) -> usize {
        self.len()
    }

    fn mul_scalar_inplace(&mut self, factor: f64) -> bool {
        let mut found_inf = false;
        for g in self.iter_mut() {
            *g = g.mul_scalar(factor);
            found_inf |= !g.finite();
        }
        found_inf
    }

    fn sum_of_squares(&self) -> f64 {
        self.iter()
            .map(|g| {
                let v = g.to_f64();
                v * v
            })
            .sum()
    }

    fn has_non_finite(&self) -> bool {
        self.iter().any(|g| !g.finite())
    }
}

impl<E: GradElement> Gradients for Vec<E> {
    fn numel(&self) -> usize {
        self.as_slice().numel()
    }

    fn mul_scalar_inplace(&mut self, factor: f64) -> bool {
        self.as_mut_slice().mul_scalar_inplace(factor)
    }

    fn sum_of_squares(&self) -> f64 {
        self.as_slice().sum_of_squares()
    }

    fn has_non_finite(&self) -> bool {
        self.as_slice().has_non_finite()
    }
}

/// `None` is a parameter that received no gradient.
impl<G: Gradients> Gradients for Option<G> {
    fn numel(&self) -> usize {
        self.as_ref().map_or(0, Gradients::numel)
    }

    fn mul_scalar_inplace(&mut self, factor: f64) -> bool {
        self.as_mut().is_some_and(|g| g.mul_scalar_inplace(factor))
    }

    fn sum_of_squares(&self) -> f64 {
        self.as_ref().map_or(0.0, Gradients::sum_of_squares)
    }

    fn has_non_finite(&self) -> bool {
        self.as_ref().is_some_and(Gradients::has_non_finite)
    }
}

impl<K, G: Gradients, S> Gradients for HashMap<K, G, S> {
    fn numel(&self) -> usize {
        self.values().map(Gradients::numel).sum()
    }

    fn mul_scalar_inplace(&mut self, factor: f64) -> bool {
        self.values_mut()
            .fold(false, |found, g| g.mul_scalar_inplace(factor) | found)
    }

    fn sum_of_squares(&self) -> f64 {
        self.values().map(Gradients::sum_of_squares).sum()
    }

    fn has_non_finite(&self) -> bool {
        self.values().any(Gradients::has_non_finite)
    }
}

impl<K, G: Gradients> Gradients for BTreeMap<K, G> {
    fn numel(&self) -> usize {
        self.values().map(Gradients::numel).sum()
    }

    fn mul_scalar_inplace(&mut self, factor: f64) -> bool {
        self.values_mut()
            .fold(false, |found, g| g.mul_scalar_inplace(factor) | found)
    }

    fn sum_of_squares(&self) -> f64 {
        self.values().map(Gradients::sum_of_squares).sum()
    }

    fn has_non_finite(&self) -> bool {
        self.values().any(Gradients::has_non_finite)
    }
}
