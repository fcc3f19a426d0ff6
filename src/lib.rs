//! # ampscale
//!
//! **Dynamic loss scaling for reduced-precision gradient computation.**
//!
//! FP16 gradients underflow to zero long before FP32 ones do. ampscale sits
//! between a differentiation engine and the optimizers: it multiplies the
//! loss by a scale factor before backward, divides the gradients back down,
//! skips parameter updates whose gradients overflowed, and tunes the scale
//! factor from the overflow history.
//!
//! ```text
//!   loss ──► scale_loss ──► [backward] ──► grads ──► unscale ──► step(update) ──► update()
//!                                                       │            │
//!                                                  found_inf ─► skip if set
//! ```
//!
//! ## Design
//!
//! - **Engine agnostic**: gradients are anything implementing [`Gradients`]
//!   (slices, `Vec`s and maps of `f32`/`f64`/`f16`/`bf16`)
//! - **Parameter groups**: every optimizer owns a [`GroupId`]; all groups of
//!   one step share a single overflow flag
//! - **Scoped steps**: [`ScalerStep`] guarantees the per-step state is reset
//!   on every exit path
//! - **Threads**: [`SharedGradScaler`] for groups processed on worker threads
//!
//! ## Example
//!
//! ```
//! use ampscale::{GradScaler, GroupId, ScalerConfig};
//!
//! let mut scaler = GradScaler::new(ScalerConfig::default().with_init_scale(1024.0))?;
//! let mut params = vec![1.0f32, -2.0];
//!
//! let scaled = scaler.scale_loss(0.25);
//! assert_eq!(scaled, 256.0);
//!
//! // Gradients produced by backward on the scaled loss
//! let mut grads = vec![512.0f32, -1024.0];
//! scaler.step(GroupId(0), &mut grads, |g| {
//!     for (p, g) in params.iter_mut().zip(g.iter()) {
//!         *p -= 0.5 * g;
//!     }
//! })?;
//! scaler.update();
//!
//! assert_eq!(params, vec![0.75, -1.5]);
//! # Ok::<(), ampscale::Error>(())
//! ```

pub mod checkpoint;
pub mod error;
pub mod grad;
pub mod scaler;

pub use error::{Error, Result};
pub use grad::{GradElement, Gradients, GroupId, clip_grad_norm, global_norm};
pub use scaler::{
    GradScaler, ScalerConfig, ScalerState, ScalerStats, ScalerStep, SharedGradScaler,
    StepOutcome,
};
