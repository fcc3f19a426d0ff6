//! Loss scaler shared by worker threads that own disjoint parameter groups.
//!
//! Workers call `unscale`/`step` through `&self`. The finiteness scan runs
//! outside the lock; only the group bookkeeping and the overflow OR happen
//! under it. `update` takes `&mut self`, so it cannot run while any worker
//! still borrows the scaler.
//!
//! Unscale every group, join (or barrier), then step: a group that steps
//! before another group has been unscaled only sees the overflow recorded
//! so far.

use super::config::ScalerConfig;
use super::grad_scaler::{GradScaler, GroupStage, StepOutcome};
use super::state::ScalerState;
use crate::error::{Error, Result};
use crate::grad::{Gradients, GroupId};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Thread-safe wrapper around [`GradScaler`]
#[derive(Debug)]
pub struct SharedGradScaler {
    inner: Mutex<GradScaler>,
}

impl SharedGradScaler {
    pub fn new(config: ScalerConfig) -> Result<Self> {
        Ok(Self::from_scaler(GradScaler::new(config)?))
    }

    pub fn from_scaler(scaler: GradScaler) -> Self {
        Self {
            inner: Mutex::new(scaler),
        }
    }

    pub fn into_inner(self) -> GradScaler {
        self.inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // The scaler holds plain data and no method panics midway, so a
    // poisoned lock still guards a consistent value.
    fn lock(&self) -> MutexGuard<'_, GradScaler> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_mut(&mut self) -> &mut GradScaler {
        self.inner.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn scale(&self) -> f64 {
        self.lock().scale()
    }

    pub fn scale_loss(&self, loss: f64) -> f64 {
        self.lock().scale_loss(loss)
    }

    pub fn found_inf(&self) -> bool {
        self.lock().found_inf()
    }

    pub fn step_skipped(&self) -> bool {
        self.lock().step_skipped()
    }

    /// Unscale the gradients of `group`; see [`GradScaler::unscale`].
    pub fn unscale<G: Gradients + ?Sized>(
        &self,
        group: GroupId,
        grads: &mut G,
    ) -> Result<bool> {
        let Some(inv_scale) = self.lock().claim_unscale(group)? else {
            return Ok(false);
        };
        let found_inf = grads.mul_scalar_inplace(inv_scale);
        self.lock().record_overflow(group, found_inf);
        Ok(found_inf)
    }

    /// Step `group`; see [`GradScaler::step`].
    ///
    /// The update callback runs without holding the lock.
    pub fn step<G, T, F>(
        &self,
        group: GroupId,
        grads: &mut G,
        update: F,
    ) -> Result<StepOutcome<T>>
    where
        G: Gradients + ?Sized,
        F: FnOnce(&mut G) -> T,
    {
        let (enabled, stage) = {
            let scaler = self.lock();
            (scaler.is_enabled(), scaler.group_stage(group))
        };
        if !enabled {
            return Ok(StepOutcome::Applied(update(grads)));
        }

        match stage {
            Some(GroupStage::Stepped) => return Err(Error::AlreadyStepped { group }),
            Some(GroupStage::Unscaled) => {}
            None => {
                self.unscale(group, grads)?;
            }
        }

        let apply = {
            let mut scaler = self.lock();
            // Another thread may have stepped this group in between
            if scaler.group_stage(group) == Some(GroupStage::Stepped) {
                return Err(Error::AlreadyStepped { group });
            }
            scaler.commit_step(group)
        };

        if apply {
            Ok(StepOutcome::Applied(update(grads)))
        } else {
            Ok(StepOutcome::Skipped)
        }
    }

    /// End the logical step. Requires exclusive access, i.e. every worker is done.
    pub fn update(&mut self) {
        self.get_mut().update();
    }

    pub fn update_with_scale(&mut self, new_scale: f64) -> Result<()> {
        self.get_mut().update_with_scale(new_scale)
    }

    pub fn state(&self) -> Option<ScalerState> {
        self.lock().state()
    }

    pub fn load_state(&mut self, state: &ScalerState) -> Result<()> {
        self.get_mut().load_state(state)
    }
}
