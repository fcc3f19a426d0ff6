//! Dynamic loss scaling
//!
//! Keeps reduced-precision gradient computation healthy: the loss is scaled
//! up before differentiation so small gradients stay representable, the
//! gradients are divided back down before the parameter update, and the
//! scale adapts to observed overflow.

mod config;
mod grad_scaler;
mod scope;
mod shared;
mod state;

pub use config::ScalerConfig;
pub use grad_scaler::{GradScaler, ScalerStats, StepOutcome};
pub use scope::ScalerStep;
pub use shared::SharedGradScaler;
pub use state::ScalerState;
