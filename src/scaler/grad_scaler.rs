//! Dynamic loss scaling for FP16 mixed precision training
//!
//! FP16 has a narrower exponent range than FP32/BF16, so gradients can underflow.
//! GradScaler multiplies the loss by a large scale factor before backward, then
//! divides gradients by that factor. If NaN/Inf is detected, the step is skipped
//! and the scale is reduced.
//!
//! Per logical training step:
//!
//! 1. `scale_loss()` before differentiation
//! 2. `unscale()` each parameter group (optional, `step()` does it implicitly)
//! 3. `step()` once per group; the update callback only runs if no group
//!    unscaled so far this step overflowed
//! 4. `update()` exactly once, after every `step()`
//!
//! The overflow flag is shared by all groups of the step, so unscale every
//! group before stepping any of them when more than one optimizer is involved.

use super::config::{
    ScalerConfig, validate_backoff_factor, validate_growth_factor, validate_growth_interval,
    validate_scale,
};
use super::state::ScalerState;
use crate::error::{Error, Result};
use crate::grad::{Gradients, GroupId};
use std::collections::HashMap;

/// Result of a [`GradScaler::step`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome<T> {
    /// The update callback ran and returned this value
    Applied(T),
    /// Overflow detected this step; the callback was not invoked
    Skipped,
}

impl<T> StepOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, StepOutcome::Skipped)
    }

    /// The callback's return value, if it ran.
    pub fn applied(self) -> Option<T> {
        match self {
            StepOutcome::Applied(v) => Some(v),
            StepOutcome::Skipped => None,
        }
    }
}

/// Counters over the lifetime of one scaler. Not persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScalerStats {
    /// Completed `update()` calls
    pub steps: u64,
    /// Steps in which at least one `step()` call was skipped
    pub skipped_steps: u64,
    /// Times the scale was multiplied by the growth factor
    pub growth_events: u64,
    /// Times the scale was multiplied by the backoff factor
    pub backoff_events: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupStage {
    Unscaled,
    Stepped,
}

/// Bookkeeping for the step in progress, cleared by `update()`.
#[derive(Debug, Default)]
struct PendingStep {
    found_inf: bool,
    step_skipped: bool,
    groups: HashMap<GroupId, GroupStage>,
}

impl PendingStep {
    fn clear(&mut self) {
        self.found_inf = false;
        self.step_skipped = false;
        self.groups.clear();
    }
}

/// Dynamic loss scaler for FP16 training
///
/// Maintains a scale factor that grows when training is stable and shrinks
/// when overflow is detected. One instance per training run; pass it by
/// reference to the loop driving the steps.
#[derive(Debug)]
pub struct GradScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: u64,
    growth_tracker: u64,
    pending: PendingStep,
    stats: ScalerStats,
}

impl GradScaler {
    /// Create a scaler from a validated configuration.
    pub fn new(config: ScalerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            enabled: config.enabled,
            scale: config.init_scale,
            growth_factor: config.growth_factor,
            backoff_factor: config.backoff_factor,
            growth_interval: config.growth_interval,
            growth_tracker: 0,
            pending: PendingStep::default(),
            stats: ScalerStats::default(),
        })
    }

    /// Create with sensible defaults: scale=65536, grow=2x, backoff=0.5x, interval=2000
    pub fn default_fp16() -> Self {
        let config = ScalerConfig::fp16();
        Self {
            enabled: true,
            scale: config.init_scale,
            growth_factor: config.growth_factor,
            backoff_factor: config.backoff_factor,
            growth_interval: config.growth_interval,
            growth_tracker: 0,
            pending: PendingStep::default(),
            stats: ScalerStats::default(),
        }
    }

    /// A pass-through scaler.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default_fp16()
        }
    }

    /// Build from `config`, then restore `state` if the checkpoint had one.
    ///
    /// A run that never saved scaler state starts from a fresh scaler.
    pub fn resume(config: ScalerConfig, state: Option<&ScalerState>) -> Result<Self> {
        let mut scaler = Self::new(config)?;
        if let Some(state) = state {
            scaler.load_state(state)?;
        }
        Ok(scaler)
    }

    /// Get the current loss scale factor.
    ///
    /// Returns 1.0 when disabled.
    pub fn scale(&self) -> f64 {
        if self.enabled { self.scale } else { 1.0 }
    }

    /// Reciprocal of the current scale.
    ///
    /// Use it to unscale gradients that are consumed inside the step rather
    /// than by an optimizer, e.g. a gradient penalty term.
    pub fn inv_scale(&self) -> f64 {
        1.0 / self.scale()
    }

    pub fn growth_factor(&self) -> f64 {
        self.growth_factor
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    pub fn growth_interval(&self) -> u64 {
        self.growth_interval
    }

    /// Consecutive clean steps since the last growth or backoff.
    pub fn growth_tracker(&self) -> u64 {
        self.growth_tracker
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether any group unscaled so far this step contained NaN/Inf.
    pub fn found_inf(&self) -> bool {
        self.pending.found_inf
    }

    /// Whether a `step()` call was skipped this step.
    pub fn step_skipped(&self) -> bool {
        self.pending.step_skipped
    }

    pub fn stats(&self) -> ScalerStats {
        self.stats
    }

    pub fn set_growth_factor(&mut self, factor: f64) -> Result<()> {
        validate_growth_factor(factor)?;
        self.growth_factor = factor;
        Ok(())
    }

    pub fn set_backoff_factor(&mut self, factor: f64) -> Result<()> {
        validate_backoff_factor(factor)?;
        self.backoff_factor = factor;
        Ok(())
    }

    pub fn set_growth_interval(&mut self, interval: u64) -> Result<()> {
        validate_growth_interval(interval)?;
        self.growth_interval = interval;
        Ok(())
    }

    /// Scale a loss value before backward pass.
    pub fn scale_loss(&self, loss: f64) -> f64 {
        if self.enabled { loss * self.scale } else { loss }
    }

    /// Scale a tensor-like loss in place.
    pub fn scale_values<G: Gradients + ?Sized>(&self, values: &mut G) {
        if self.enabled {
            values.mul_scalar_inplace(self.scale);
        }
    }

    /// Unscale the gradients of `group` in place and check for NaN/Inf.
    ///
    /// Returns whether this group overflowed. The result is also OR-ed into
    /// the step's overflow flag, which is what `step()` and `update()` use.
    /// Unscaling the same group twice before `update()` is an error.
    pub fn unscale<G: Gradients + ?Sized>(
        &mut self,
        group: GroupId,
        grads: &mut G,
    ) -> Result<bool> {
        let Some(inv_scale) = self.claim_unscale(group)? else {
            return Ok(false);
        };
        let found_inf = grads.mul_scalar_inplace(inv_scale);
        self.record_overflow(group, found_inf);
        Ok(found_inf)
    }

    /// Apply `update` to the gradients of `group` unless the step overflowed.
    ///
    /// Unscales the group first if that has not happened yet. Returns
    /// [`StepOutcome::Skipped`] without invoking `update` when the step's
    /// overflow flag is set. Each group steps at most once per step.
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
        if !self.enabled {
            return Ok(StepOutcome::Applied(update(grads)));
        }

        match self.group_stage(group) {
            Some(GroupStage::Stepped) => return Err(Error::AlreadyStepped { group }),
            Some(GroupStage::Unscaled) => {}
            None => {
                self.unscale(group, grads)?;
            }
        }

        if self.commit_step(group) {
            Ok(StepOutcome::Applied(update(grads)))
        } else {
            Ok(StepOutcome::Skipped)
        }
    }

    /// Adjust the scale for the next step. Call once per step, after all `step()` calls.
    ///
    /// Overflow: scale *= backoff_factor, tracker reset.
    /// Otherwise: tracker += 1, and after `growth_interval` clean steps
    /// scale *= growth_factor, tracker reset.
    pub fn update(&mut self) {
        if !self.enabled {
            return;
        }

        if self.pending.found_inf {
            self.apply_factor(self.backoff_factor);
            self.growth_tracker = 0;
            self.stats.backoff_events += 1;
            tracing::debug!(scale = self.scale, "overflow detected, loss scale backed off");
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.growth_interval {
                self.apply_factor(self.growth_factor);
                self.growth_tracker = 0;
                self.stats.growth_events += 1;
                tracing::debug!(scale = self.scale, "loss scale grown");
            }
        }

        self.finish_step();
    }

    /// End the step with an explicit scale instead of the dynamic rule.
    ///
    /// The growth tracker is left as is.
    pub fn update_with_scale(&mut self, new_scale: f64) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        validate_scale("new_scale", new_scale)?;
        self.scale = new_scale;
        self.finish_step();
        Ok(())
    }

    /// Forget the pending step without touching the scale or the tracker.
    pub fn discard_step(&mut self) {
        self.pending.clear();
    }

    /// Snapshot the persistent state. `None` when disabled.
    pub fn state(&self) -> Option<ScalerState> {
        self.enabled.then_some(ScalerState {
            scale: self.scale,
            growth_factor: self.growth_factor,
            backoff_factor: self.backoff_factor,
            growth_interval: self.growth_interval,
            growth_tracker: self.growth_tracker,
        })
    }

    /// Restore a snapshot taken by [`GradScaler::state`].
    ///
    /// No-op when disabled. Invalid records are rejected, never clamped.
    pub fn load_state(&mut self, state: &ScalerState) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        state.validate()?;

        self.scale = state.scale;
        self.growth_factor = state.growth_factor;
        self.backoff_factor = state.backoff_factor;
        self.growth_interval = state.growth_interval;
        self.growth_tracker = state.growth_tracker;
        self.pending.clear();

        tracing::info!(
            scale = state.scale,
            growth_tracker = state.growth_tracker,
            "restored loss scaler state"
        );
        Ok(())
    }

    pub(crate) fn group_stage(&self, group: GroupId) -> Option<GroupStage> {
        self.pending.groups.get(&group).copied()
    }

    /// Mark `group` as unscaled and hand out the factor to multiply by.
    ///
    /// `None` when disabled: there is nothing to unscale.
    pub(crate) fn claim_unscale(&mut self, group: GroupId) -> Result<Option<f64>> {
        if !self.enabled {
            return Ok(None);
        }
        match self.group_stage(group) {
            Some(GroupStage::Unscaled) => Err(Error::AlreadyUnscaled { group }),
            Some(GroupStage::Stepped) => Err(Error::AlreadyStepped { group }),
            None => {
                self.pending.groups.insert(group, GroupStage::Unscaled);
                Ok(Some(1.0 / self.scale))
            }
        }
    }

    pub(crate) fn record_overflow(&mut self, group: GroupId, found_inf: bool) {
        if found_inf {
            tracing::debug!(%group, scale = self.scale, "non-finite gradients after unscale");
        }
        self.pending.found_inf |= found_inf;
    }

    /// Mark `group` as stepped. Returns whether its update may run.
    pub(crate) fn commit_step(&mut self, group: GroupId) -> bool {
        self.pending.groups.insert(group, GroupStage::Stepped);
        if self.pending.found_inf {
            self.pending.step_skipped = true;
            tracing::debug!(%group, "skipping parameter update after overflow");
            false
        } else {
            true
        }
    }

    fn apply_factor(&mut self, factor: f64) {
        let next = self.scale * factor;
        // The scale must stay invertible or every unscale overflows
        if next > 0.0 && next.is_finite() && next.recip().is_finite() {
            self.scale = next;
        } else {
            tracing::warn!(
                scale = self.scale,
                factor,
                "loss scale adjustment leaves the representable range, keeping current scale"
            );
        }
    }

    fn finish_step(&mut self) {
        if self.pending.step_skipped {
            self.stats.skipped_steps += 1;
        }
        self.stats.steps += 1;
        self.pending.clear();
    }
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::default_fp16()
    }
}
