//! Scoped training steps.
//!
//! A [`ScalerStep`] borrows the scaler for one logical step. `finish()`
//! runs `update()`; dropping the guard any other way (early return, `?`,
//! panic) discards the pending step so the next one starts clean, and the
//! scale is left untouched.

use super::grad_scaler::{GradScaler, StepOutcome};
use crate::error::Result;
use crate::grad::{Gradients, GroupId};

/// One logical training step in progress.
#[must_use = "dropping a ScalerStep without finish() discards the step"]
pub struct ScalerStep<'a> {
    scaler: &'a mut GradScaler,
    finished: bool,
}

impl GradScaler {
    /// Open a scoped step.
    pub fn begin_step(&mut self) -> ScalerStep<'_> {
        ScalerStep {
            scaler: self,
            finished: false,
        }
    }

    /// Run `f` as one logical step.
    ///
    /// `update()` runs when `f` returns `Ok`; on `Err` the pending step is
    /// discarded and the error is passed through.
    pub fn run_step<T, E, F>(&mut self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut ScalerStep<'_>) -> std::result::Result<T, E>,
    {
        let mut step = self.begin_step();
        let out = f(&mut step)?;
        step.finish();
        Ok(out)
    }
}

impl ScalerStep<'_> {
    pub fn scale_loss(&self, loss: f64) -> f64 {
        self.scaler.scale_loss(loss)
    }

    pub fn scale_values<G: Gradients + ?Sized>(&self, values: &mut G) {
        self.scaler.scale_values(values)
    }

    pub fn inv_scale(&self) -> f64 {
        self.scaler.inv_scale()
    }

    pub fn found_inf(&self) -> bool {
        self.scaler.found_inf()
    }

    pub fn unscale<G: Gradients + ?Sized>(
        &mut self,
        group: GroupId,
        grads: &mut G,
    ) -> Result<bool> {
        self.scaler.unscale(group, grads)
    }

    pub fn step<G, T, F>(
        &mut self,
        group: GroupId,
        grads: &mut G,
        update: F,
    ) -> Result<StepOutcome<T>>
    where
        G: Gradients + ?Sized,
        F: FnOnce(&mut G) -> T,
    {
        self.scaler.step(group, grads, update)
    }

    /// The scaler this step borrows.
    pub fn scaler(&self) -> &GradScaler {
        self.scaler
    }

    /// Close the step with the dynamic scale update.
    pub fn finish(mut self) {
        self.scaler.update();
        self.finished = true;
    }

    /// Close the step with an explicit scale.
    pub fn finish_with_scale(mut self, new_scale: f64) -> Result<()> {
        self.scaler.update_with_scale(new_scale)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for ScalerStep<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!("scaler step dropped before finish, discarding");
            self.scaler.discard_step();
        }
    }
}
