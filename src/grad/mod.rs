//! Gradient collections as seen by the loss scaler
//!
//! The scaler never computes gradients. It only needs to multiply whatever
//! the differentiation engine produced by a scalar and learn whether any
//! entry ended up non-finite. [`Gradients`] captures exactly that contract.

mod buffer;
mod clip;

pub use buffer::{GradElement, Gradients};
pub use clip::{clip_grad_norm, global_norm};

use std::fmt;

/// Identifier of a disjoint parameter group, usually one optimizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(pub usize);

impl From<usize> for GroupId {
    fn from(id: usize) -> Self {
        Self(id)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group {}", self.0)
    }
}
