use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::sync::Arc;

use tch::{Device, Kind, Tensor};

use super::{Optimizer, StepScaling, ZeroGrad};
use crate::config::ScalerConfig;
use crate::distributed::{ProcessGroup, Work};
use crate::error::ScalerError;
use crate::replicator::{copy_to_device, PerDevice};
use crate::scale::{check_numeric, OutputScaler, Scalable};
use crate::state::{
    OptState, OptimizerId, OptimizerState, ScaleState, ScalerSnapshot, ScalerState,
};
use crate::unscale::unscale_grads;

/// Explicit scale for `ShardedGradScaler::update`.
#[derive(Debug)]
pub enum NewScale {
    Value(f64),

    /// One-element floating point tensor. The tensor must not require
    /// gradients and must be on the same kind of device as the scale.
    Tensor(Tensor),
}

/// An optimizer that is registered with a scaler.
///
/// Registration assigns the optimizer an identity, under which the
/// scaler tracks the optimizer's progress within an iteration.
pub struct ScaledOptimizer<O> {
    id: OptimizerId,
    scaling: StepScaling,
    optimizer: O,
}

impl<O> ScaledOptimizer<O>
where
    O: Optimizer,
{
    pub fn id(&self) -> OptimizerId {
        self.id
    }

    /// Get a reference to the wrapped optimizer.
    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    /// Get a mutable reference to the wrapped optimizer.
    pub fn optimizer_mut(&mut self) -> &mut O {
        &mut self.optimizer
    }

    pub fn into_inner(self) -> O {
        self.optimizer
    }
}

/// Gradient scaler for sharded optimizers.
///
/// In mixed-precision training, gradients underflow more quickly in FP16
/// as they become smaller, stopping backpropagation. Gradient scaling
/// counters this by scaling up the loss, to increase the magnitude of
/// gradients. The gradients are then unscaled in FP32. Since loss
/// scaling can also lead to overflow of gradients, the gradients are
/// checked for infinites before performing an optimizer step. If one or
/// more infinite gradients are found, the optimizer step is skipped and
/// the scale is reduced for the next step.
///
/// With sharded optimizers, ranks see different gradients. The overflow
/// flags are therefore summed over all ranks before deciding whether to
/// step, so that all ranks skip the same steps and keep identical
/// scales. Every rank must check the same devices, since each device
/// flag is one reduction.
pub struct ShardedGradScaler {
    enabled: bool,
    cpu_fallback: bool,
    init_scale: f64,
    init_growth_tracker: i64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: i64,

    scale: ScaleState,
    per_optimizer_states: BTreeMap<OptimizerId, OptimizerState>,
    next_optimizer_id: usize,
    display_warning: bool,

    group: Arc<dyn ProcessGroup>,
}

impl ShardedGradScaler {
    /// Construct a gradient scaler.
    ///
    /// Flags are reduced over the ranks of `group`. When the scaler is
    /// enabled, the configuration is validated.
    pub fn new(config: ScalerConfig, group: Arc<dyn ProcessGroup>) -> Result<Self, ScalerError> {
        let enabled = if config.enabled && !config.cpu_fallback && !tch::Cuda::is_available() {
            log::warn!("Gradient scaling was requested, but CUDA is not available, disabling");
            false
        } else {
            config.enabled
        };

        if enabled {
            config.validate()?;
        }

        Ok(ShardedGradScaler {
            enabled,
            cpu_fallback: config.cpu_fallback,
            init_scale: config.init_scale,
            init_growth_tracker: 0,
            growth_factor: config.growth_factor,
            backoff_factor: config.backoff_factor,
            growth_interval: config.growth_interval,

            scale: ScaleState::Uninitialized,
            per_optimizer_states: BTreeMap::new(),
            next_optimizer_id: 0,
            display_warning: true,

            group,
        })
    }

    /// Construct a gradient scaler with the default configuration.
    pub fn new_with_defaults(
        enabled: bool,
        group: Arc<dyn ProcessGroup>,
    ) -> Result<Self, ScalerError> {
        ShardedGradScaler::new(
            ScalerConfig {
                enabled,
                ..ScalerConfig::default()
            },
            group,
        )
    }

    /// Register an optimizer with the scaler.
    pub fn register<O>(&mut self, optimizer: O) -> ScaledOptimizer<O>
    where
        O: Optimizer,
    {
        let id = OptimizerId(self.next_optimizer_id);
        self.next_optimizer_id += 1;

        ScaledOptimizer {
            id,
            scaling: optimizer.step_scaling(),
            optimizer,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Multiply a tensor by the scale.
    ///
    /// On the first call, the scale is created on the device of `t`.
    /// When the scaler is disabled, `t` is returned unmodified.
    pub fn scale(&mut self, t: &Tensor) -> Result<Tensor, ScalerError> {
        if !self.enabled {
            return Ok(t.shallow_clone());
        }

        check_numeric(t)?;

        let scale = self
            .scale
            .get_or_materialize(t.device(), self.init_scale, self.init_growth_tracker)?;

        Ok(t.f_mul(&scale.f_to_device(t.device())?)?)
    }

    /// Multiply every tensor in the outputs by the scale.
    ///
    /// The scale is transferred at most once to each device on which
    /// outputs are stored.
    pub fn scale_outputs<T>(&mut self, outputs: T) -> Result<T, ScalerError>
    where
        T: Scalable,
    {
        if !self.enabled {
            return Ok(outputs);
        }

        let mut scaler =
            OutputScaler::new(&mut self.scale, self.init_scale, self.init_growth_tracker);
        outputs.scale_with(&mut scaler)
    }

    /// Unscale the gradients of the optimizer's parameters.
    ///
    /// This can be used to inspect or clip the gradients between the
    /// backward pass and `step`. Gradients can only be unscaled once per
    /// iteration. The overflow flags are reduced over all ranks before
    /// this method returns.
    pub fn unscale<O>(&mut self, optimizer: &ScaledOptimizer<O>) -> Result<(), ScalerError>
    where
        O: Optimizer,
    {
        if !self.enabled {
            return Ok(());
        }

        self.unscale_by_id(optimizer.id, &optimizer.optimizer)
    }

    fn unscale_by_id<O>(&mut self, id: OptimizerId, optimizer: &O) -> Result<(), ScalerError>
    where
        O: Optimizer + ?Sized,
    {
        self.warn_unsharded_once(optimizer.is_sharded());

        let (scale, _) = self.scale.buffers("unscale")?;

        match self.per_optimizer_states.entry(id).or_default().stage {
            OptState::Ready => (),
            OptState::Unscaled => return Err(ScalerError::AlreadyUnscaled),
            OptState::Stepped => return Err(ScalerError::UnscaleAfterStep),
        }

        // Compute the reciprocal in double precision, single precision
        // division can be imprecise.
        let inv_scale = scale
            .f_to_kind(Kind::Double)?
            .f_reciprocal()?
            .f_to_kind(Kind::Float)?;
        let found_inf = Tensor::f_zeros(&[1], (Kind::Float, scale.device()))?;

        let found_inf_per_device =
            unscale_grads(&optimizer.param_groups(), &inv_scale, &found_inf, false)?;

        let state = self.per_optimizer_states.entry(id).or_default();
        state.found_inf_per_device = found_inf_per_device;
        state.stage = OptState::Unscaled;

        self.sync_found_inf(id)
    }

    /// Warn when the first unscaled optimizer is not sharded.
    ///
    /// Returns whether the warning was emitted.
    fn warn_unsharded_once(&mut self, sharded: bool) -> bool {
        let warn = self.display_warning && !sharded;
        if warn {
            log::warn!("The gradient scaler is used with an optimizer that is not sharded");
        }
        self.display_warning = false;
        warn
    }

    /// Check the optimizer's gradients for non-finite values.
    ///
    /// The gradients are not unscaled and the flags are not reduced over
    /// ranks. Half-precision gradients are permitted.
    fn check_inf_per_device<O>(
        &mut self,
        id: OptimizerId,
        optimizer: &O,
    ) -> Result<&PerDevice<Tensor>, ScalerError>
    where
        O: Optimizer + ?Sized,
    {
        let (scale, _) = self.scale.buffers("check_inf_per_device")?;

        let dummy_inv_scale = Tensor::f_full(&[1], 1.0, (Kind::Float, scale.device()))?;
        let found_inf = Tensor::f_zeros(&[1], (Kind::Float, scale.device()))?;

        let found_inf_per_device =
            unscale_grads(&optimizer.param_groups(), &dummy_inv_scale, &found_inf, true)?;

        let state = self.per_optimizer_states.entry(id).or_default();
        state.found_inf_per_device = found_inf_per_device;

        Ok(&state.found_inf_per_device)
    }

    /// Sum the overflow flags of an optimizer over all ranks.
    ///
    /// Flags on devices that the process group cannot reduce are first
    /// moved to the group's collective device, the moved flag replaces
    /// the original. Only the last reduction is waited on, since
    /// reductions complete in order.
    pub fn sync_found_inf(&mut self, id: OptimizerId) -> Result<(), ScalerError> {
        let group = self.group.clone();

        let state = match self.per_optimizer_states.get_mut(&id) {
            Some(state) => state,
            None => return Ok(()),
        };

        // Reductions that were issued are completed, even when a later
        // flag cannot be reduced.
        let mut last_work = None;
        let mut issued = Ok(());
        for (device, found_inf) in state.found_inf_per_device.iter_mut() {
            match issue_reduction(&*group, *device, found_inf) {
                Ok(work) => last_work = Some(work),
                Err(err) => {
                    issued = Err(err);
                    break;
                }
            }
        }

        if let Some(work) = last_work {
            work.wait()?;
        }

        issued
    }

    /// Perform an optimizer step, unless gradients overflowed.
    ///
    /// If the gradients were not unscaled explicitly, they are unscaled
    /// first. The step is skipped when any rank found a non-finite
    /// gradient, in which case `None` is returned. Optimizers that are
    /// scale aware perform the step themselves.
    ///
    /// A disabled scaler always performs the step.
    pub fn step<O, F>(
        &mut self,
        optimizer: &mut ScaledOptimizer<O>,
        config_fun: F,
    ) -> Result<Option<O::Output>, ScalerError>
    where
        O: Optimizer,
        F: Fn(&str) -> O::Config,
    {
        if !self.enabled {
            return optimizer.optimizer.step(config_fun).map(Some);
        }

        self.scale.buffers("step")?;

        let id = optimizer.id;
        if self.per_optimizer_states.entry(id).or_default().stage == OptState::Stepped {
            return Err(ScalerError::AlreadyStepped);
        }

        if optimizer.scaling == StepScaling::ScaleAware {
            let retval = optimizer
                .optimizer
                .step_with_scaler(ScalerHandle { scaler: self, id }, config_fun)?;
            self.per_optimizer_states.entry(id).or_default().stage = OptState::Stepped;
            return Ok(retval);
        }

        if self.per_optimizer_states.entry(id).or_default().stage == OptState::Ready {
            self.unscale_by_id(id, &optimizer.optimizer)?;
        }

        let state = self.per_optimizer_states.entry(id).or_default();
        if state.found_inf_per_device.is_empty() {
            return Err(ScalerError::NoInfChecksForOptimizer);
        }

        let retval = if sum_found_inf(&state.found_inf_per_device)? == 0. {
            Some(optimizer.optimizer.step(config_fun)?)
        } else {
            log::debug!("Skipping optimizer step, gradients contain non-finite values");
            None
        };

        self.per_optimizer_states.entry(id).or_default().stage = OptState::Stepped;

        Ok(retval)
    }

    /// Update the scale for the next iteration.
    ///
    /// Without an explicit scale, the scale is reduced by the backoff
    /// factor when any optimizer found non-finite gradients. Otherwise,
    /// it grows by the growth factor after `growth_interval` consecutive
    /// iterations without overflow. The per-optimizer states are reset
    /// for the next iteration.
    pub fn update(&mut self, new_scale: Option<NewScale>) -> Result<(), ScalerError> {
        if !self.enabled {
            return Ok(());
        }

        let (scale, growth_tracker) = self.scale.buffers_mut("update")?;

        match new_scale {
            Some(NewScale::Value(value)) => {
                let _ = scale.f_fill_(value)?;
            }
            Some(NewScale::Tensor(value)) => {
                check_new_scale(&value, scale.device())?;
                let _ = scale.f_copy_(&value)?;
            }
            None => {
                let found_infs = self
                    .per_optimizer_states
                    .values()
                    .flat_map(|state| state.found_inf_per_device.values())
                    .collect::<Vec<_>>();

                if found_infs.is_empty() {
                    return Err(ScalerError::NoInfChecksRecorded);
                }

                let mut found_inf_combined = Tensor::f_zeros(&[1], (Kind::Float, scale.device()))?;
                for found_inf in found_infs {
                    let _ = found_inf_combined.f_add_(&found_inf.f_to_device(scale.device())?)?;
                }

                if let Device::Cuda(_) = scale.device() {
                    let _ = scale.f_internal_amp_update_scale_(
                        growth_tracker,
                        &found_inf_combined,
                        self.growth_factor,
                        self.backoff_factor,
                        self.growth_interval,
                    )?;
                } else {
                    update_scale_fallback(
                        scale,
                        growth_tracker,
                        &found_inf_combined,
                        self.growth_factor,
                        self.backoff_factor,
                        self.growth_interval,
                    )?;
                }
            }
        }

        self.per_optimizer_states = BTreeMap::new();

        Ok(())
    }

    /// Scale the loss, compute gradients, step and update the scale.
    ///
    /// The gradients of the optimizer's parameters are zeroed before
    /// the backward pass.
    pub fn backward_step<O, F>(
        &mut self,
        optimizer: &mut ScaledOptimizer<O>,
        loss: &Tensor,
        config_fun: F,
    ) -> Result<Option<O::Output>, ScalerError>
    where
        O: Optimizer,
        F: Fn(&str) -> O::Config,
    {
        optimizer.optimizer.param_groups().as_slice().zero_grad();
        self.scale(loss)?.f_backward()?;
        let retval = tch::no_grad(|| self.step(optimizer, config_fun))?;
        self.update(None)?;
        Ok(retval)
    }

    /// Get the current scale.
    ///
    /// Before the first call to `scale`, this is the initial scale. A
    /// disabled scaler has a scale of `1`.
    pub fn get_scale(&self) -> Result<f64, ScalerError> {
        if !self.enabled {
            return Ok(1.0);
        }

        match &self.scale {
            ScaleState::Uninitialized => Ok(self.init_scale),
            ScaleState::Materialized { scale, .. } => Ok(f64::try_from(scale)?),
        }
    }

    /// Get the scale tensor, if it was created.
    pub fn scale_tensor(&self) -> Option<&Tensor> {
        match &self.scale {
            ScaleState::Uninitialized => None,
            ScaleState::Materialized { scale, .. } => Some(scale),
        }
    }

    /// Get the number of consecutive iterations without overflow.
    pub fn growth_tracker(&self) -> Result<i64, ScalerError> {
        if !self.enabled {
            return Ok(0);
        }

        match &self.scale {
            ScaleState::Uninitialized => Ok(self.init_growth_tracker),
            ScaleState::Materialized { growth_tracker, .. } => Ok(i64::try_from(growth_tracker)?),
        }
    }

    pub fn growth_factor(&self) -> f64 {
        self.growth_factor
    }

    pub fn set_growth_factor(&mut self, growth_factor: f64) {
        self.growth_factor = growth_factor;
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    pub fn set_backoff_factor(&mut self, backoff_factor: f64) {
        self.backoff_factor = backoff_factor;
    }

    pub fn growth_interval(&self) -> i64 {
        self.growth_interval
    }

    pub fn set_growth_interval(&mut self, growth_interval: i64) {
        self.growth_interval = growth_interval;
    }

    /// Get the scaler state for checkpointing.
    ///
    /// A disabled scaler has no state.
    pub fn state_dict(&self) -> Result<Option<ScalerState>, ScalerError> {
        if !self.enabled {
            return Ok(None);
        }

        Ok(Some(ScalerState {
            scale: self.get_scale()?,
            growth_factor: self.growth_factor,
            backoff_factor: self.backoff_factor,
            growth_interval: self.growth_interval,
            growth_tracker: self.growth_tracker()?,
        }))
    }

    /// Restore the scaler state from a checkpoint.
    ///
    /// Existing scale buffers are updated in place. Loading into a
    /// disabled scaler is a no-op.
    pub fn load_state_dict(&mut self, state: Option<ScalerState>) -> Result<(), ScalerError> {
        if !self.enabled {
            return Ok(());
        }

        let state = state.ok_or(ScalerError::EmptyStateDict)?;

        self.init_scale = state.scale;
        self.growth_factor = state.growth_factor;
        self.backoff_factor = state.backoff_factor;
        self.growth_interval = state.growth_interval;
        self.init_growth_tracker = state.growth_tracker;

        if let ScaleState::Materialized {
            scale,
            growth_tracker,
        } = &mut self.scale
        {
            let _ = scale.f_fill_(state.scale)?;
            let _ = growth_tracker.f_fill_(state.growth_tracker)?;
        }

        Ok(())
    }

    /// Take a snapshot of the complete scaler.
    ///
    /// Snapshots can only be taken between iterations, after `update`.
    pub fn snapshot(&self) -> Result<ScalerSnapshot, ScalerError> {
        if self.enabled && !self.per_optimizer_states.is_empty() {
            return Err(ScalerError::MidIterationSnapshot);
        }

        let init_scale = if self.enabled {
            self.get_scale()?
        } else {
            self.init_scale
        };

        Ok(ScalerSnapshot {
            config: ScalerConfig {
                init_scale,
                growth_factor: self.growth_factor,
                backoff_factor: self.backoff_factor,
                growth_interval: self.growth_interval,
                enabled: self.enabled,
                cpu_fallback: self.cpu_fallback,
            },
            growth_tracker: self.growth_tracker()?,
            display_warning: self.display_warning,
        })
    }

    /// Restore a scaler from a snapshot.
    ///
    /// The scale buffers are created on the next call to `scale`.
    /// Optimizers must be registered again.
    pub fn from_snapshot(
        snapshot: ScalerSnapshot,
        group: Arc<dyn ProcessGroup>,
    ) -> Result<Self, ScalerError> {
        let mut scaler = ShardedGradScaler::new(snapshot.config, group)?;
        scaler.init_growth_tracker = snapshot.growth_tracker;
        scaler.display_warning = snapshot.display_warning;
        Ok(scaler)
    }
}

/// Access to the scaler from within a scale-aware optimizer step.
pub struct ScalerHandle<'a> {
    scaler: &'a mut ShardedGradScaler,
    id: OptimizerId,
}

impl<'a> ScalerHandle<'a> {
    /// Unscale the optimizer's gradients and reduce the overflow flags.
    ///
    /// Does nothing when the gradients were already unscaled in this
    /// iteration.
    pub fn unscale<O>(&mut self, optimizer: &O) -> Result<(), ScalerError>
    where
        O: Optimizer + ?Sized,
    {
        let unscaled = self
            .scaler
            .per_optimizer_states
            .get(&self.id)
            .map(|state| state.stage == OptState::Unscaled)
            .unwrap_or(false);
        if unscaled {
            return Ok(());
        }

        self.scaler.unscale_by_id(self.id, optimizer)
    }

    /// Check the gradients for non-finite values without unscaling.
    ///
    /// The flags are local to this rank, `sync_found_inf` reduces them.
    pub fn check_inf_per_device<O>(
        &mut self,
        optimizer: &O,
    ) -> Result<&PerDevice<Tensor>, ScalerError>
    where
        O: Optimizer + ?Sized,
    {
        self.scaler.check_inf_per_device(self.id, optimizer)
    }

    /// Sum the recorded overflow flags over all ranks.
    pub fn sync_found_inf(&mut self) -> Result<(), ScalerError> {
        self.scaler.sync_found_inf(self.id)
    }

    /// Get the overflow flags that were recorded for the optimizer.
    pub fn found_inf_per_device(&self) -> Option<&PerDevice<Tensor>> {
        self.scaler
            .per_optimizer_states
            .get(&self.id)
            .map(|state| &state.found_inf_per_device)
    }

    /// Check whether any recorded flag signals an overflow.
    pub fn found_inf(&self) -> Result<bool, ScalerError> {
        match self.found_inf_per_device() {
            Some(found_inf_per_device) => Ok(sum_found_inf(found_inf_per_device)? != 0.),
            None => Ok(false),
        }
    }

    pub fn get_scale(&self) -> Result<f64, ScalerError> {
        self.scaler.get_scale()
    }

    /// Get the reciprocal of the scale.
    pub fn inv_scale(&self) -> Result<f64, ScalerError> {
        Ok(1.0 / self.scaler.get_scale()?)
    }
}

/// Stage a flag on the collective device if needed and issue its reduction.
///
/// A staged copy replaces the flag.
fn issue_reduction<'a>(
    group: &'a dyn ProcessGroup,
    device: Device,
    found_inf: &mut Tensor,
) -> Result<Box<dyn Work + 'a>, ScalerError> {
    if !group.supports_device(device) {
        *found_inf = copy_to_device(found_inf, group.collective_device())?;
    }

    group.all_reduce_sum(found_inf)
}

fn sum_found_inf(found_inf_per_device: &PerDevice<Tensor>) -> Result<f64, ScalerError> {
    Ok(found_inf_per_device
        .values()
        .map(f64::try_from)
        .sum::<Result<f64, _>>()?)
}

/// Check that an explicit scale can replace the current scale.
fn check_new_scale(new_scale: &Tensor, scale_device: Device) -> Result<(), ScalerError> {
    let invalid = |reason: &str| ScalerError::InvalidNewScale {
        expected: "a one-element floating point tensor".to_string(),
        reason: reason.to_string(),
    };

    if new_scale.numel() != 1 {
        return Err(invalid("tensor has more than one element"));
    }

    if !matches!(
        new_scale.kind(),
        Kind::Half | Kind::BFloat16 | Kind::Float | Kind::Double
    ) {
        return Err(invalid("tensor is not a floating point tensor"));
    }

    if new_scale.requires_grad() {
        return Err(invalid("tensor requires gradients"));
    }

    let same_device_type = matches!(
        (new_scale.device(), scale_device),
        (Device::Cpu, Device::Cpu) | (Device::Cuda(_), Device::Cuda(_))
    );
    if !same_device_type {
        return Err(invalid("tensor is on a different type of device than the scale"));
    }

    Ok(())
}

/// Update the scale on devices without a fused kernel.
fn update_scale_fallback(
    scale: &mut Tensor,
    growth_tracker: &mut Tensor,
    found_inf: &Tensor,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: i64,
) -> Result<(), ScalerError> {
    if f64::try_from(found_inf)? != 0. {
        let _ = scale.f_mul_scalar_(backoff_factor)?;
        let _ = growth_tracker.f_fill_(0i64)?;
        log::debug!(
            "Non-finite gradients, reducing scale to {}",
            f64::try_from(&*scale)?
        );
        return Ok(());
    }

    let successful = i64::try_from(&*growth_tracker)? + 1;
    if successful == growth_interval {
        let new_scale = f64::try_from(&*scale)? * growth_factor;
        if new_scale.is_finite() {
            let _ = scale.f_fill_(new_scale)?;
            log::debug!("Increasing scale to {}", new_scale);
        }
        let _ = growth_tracker.f_fill_(0i64)?;
    } else {
        let _ = growth_tracker.f_fill_(successful)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;
    use std::sync::Arc;

    use approx::assert_abs_diff_eq;
    use tch::{Device, Kind, Tensor};

    use super::{update_scale_fallback, NewScale, ShardedGradScaler};
    use crate::config::ScalerConfig;
    use crate::distributed::SingleProcess;
    use crate::error::ScalerError;

    fn fallback_config() -> ScalerConfig {
        ScalerConfig {
            cpu_fallback: true,
            ..ScalerConfig::default()
        }
    }

    fn scaler(config: ScalerConfig) -> ShardedGradScaler {
        ShardedGradScaler::new(config, Arc::new(SingleProcess)).unwrap()
    }

    #[test]
    fn scaler_is_disabled_without_cuda() {
        if tch::Cuda::is_available() {
            return;
        }

        let scaler = scaler(ScalerConfig::default());
        assert!(!scaler.is_enabled());
        assert!(scaler.state_dict().unwrap().is_none());

        assert!(ShardedGradScaler::new(fallback_config(), Arc::new(SingleProcess))
            .unwrap()
            .is_enabled());
    }

    #[test]
    fn unsharded_optimizer_warning_is_shown_once() {
        let mut scaler = scaler(fallback_config());
        assert!(scaler.warn_unsharded_once(false));
        assert!(!scaler.warn_unsharded_once(false));
        assert!(!scaler.snapshot().unwrap().display_warning);

        // Only the first unscaled optimizer is checked.
        let mut scaler = ShardedGradScaler::new(fallback_config(), Arc::new(SingleProcess))
            .unwrap();
        assert!(!scaler.warn_unsharded_once(true));
        assert!(!scaler.warn_unsharded_once(false));
    }

    #[test]
    fn scale_is_lazy() {
        let mut scaler = scaler(ScalerConfig {
            init_scale: 16.,
            ..fallback_config()
        });

        assert!(scaler.scale_tensor().is_none());
        assert_eq!(scaler.get_scale().unwrap(), 16.);

        let scaled = scaler.scale(&Tensor::from_slice(&[0.5f32])).unwrap();
        assert_eq!(f64::try_from(&scaled).unwrap(), 8.);
        assert_eq!(scaler.scale_tensor().unwrap().device(), Device::Cpu);
    }

    #[test]
    fn disabled_scaler_is_identity() {
        let mut scaler = scaler(ScalerConfig {
            enabled: false,
            ..fallback_config()
        });

        let t = Tensor::from_slice(&[3f32]);
        let scaled = scaler.scale(&t).unwrap();
        assert_eq!(scaled.data_ptr(), t.data_ptr());
        assert_eq!(scaler.get_scale().unwrap(), 1.);
        assert!(scaler.state_dict().unwrap().is_none());
        scaler.update(None).unwrap();
    }

    #[test]
    fn invalid_configuration_is_rejected_when_enabled() {
        let config = ScalerConfig {
            growth_factor: 0.5,
            ..fallback_config()
        };

        assert!(matches!(
            ShardedGradScaler::new(config.clone(), Arc::new(SingleProcess)),
            Err(ScalerError::InvalidGrowthFactor(_))
        ));
        assert!(ShardedGradScaler::new(
            ScalerConfig {
                enabled: false,
                ..config
            },
            Arc::new(SingleProcess)
        )
        .is_ok());
    }

    #[test]
    fn update_requires_scale() {
        let mut scaler = scaler(fallback_config());
        assert!(matches!(
            scaler.update(None),
            Err(ScalerError::ScaleNotInitialized("update"))
        ));
    }

    #[test]
    fn explicit_scale_replaces_scale() {
        let mut scaler = scaler(fallback_config());
        scaler.scale(&Tensor::from_slice(&[1f32])).unwrap();

        scaler.update(Some(NewScale::Value(128.))).unwrap();
        assert_eq!(scaler.get_scale().unwrap(), 128.);

        scaler
            .update(Some(NewScale::Tensor(Tensor::from_slice(&[32f32]))))
            .unwrap();
        assert_eq!(scaler.get_scale().unwrap(), 32.);

        assert!(matches!(
            scaler.update(Some(NewScale::Tensor(Tensor::from_slice(&[1f32, 2.])))),
            Err(ScalerError::InvalidNewScale { .. })
        ));
        assert!(matches!(
            scaler.update(Some(NewScale::Tensor(Tensor::from_slice(&[4i64])))),
            Err(ScalerError::InvalidNewScale { .. })
        ));
        assert_eq!(scaler.get_scale().unwrap(), 32.);
    }

    #[test]
    fn fallback_update_backs_off_on_overflow() {
        let mut scale = Tensor::full(&[1], 1024., (Kind::Float, Device::Cpu));
        let mut growth_tracker = Tensor::full(&[1], 2i64, (Kind::Int, Device::Cpu));
        let found_inf = Tensor::full(&[1], 3., (Kind::Float, Device::Cpu));

        update_scale_fallback(&mut scale, &mut growth_tracker, &found_inf, 2., 0.5, 3).unwrap();

        assert_eq!(f64::try_from(&scale).unwrap(), 512.);
        assert_eq!(i64::try_from(&growth_tracker).unwrap(), 0);
    }

    #[test]
    fn fallback_update_grows_after_interval() {
        let mut scale = Tensor::full(&[1], 1024., (Kind::Float, Device::Cpu));
        let mut growth_tracker = Tensor::full(&[1], 0i64, (Kind::Int, Device::Cpu));
        let found_inf = Tensor::zeros(&[1], (Kind::Float, Device::Cpu));

        for expected_tracker in &[1, 2] {
            update_scale_fallback(&mut scale, &mut growth_tracker, &found_inf, 2., 0.5, 3)
                .unwrap();
            assert_eq!(i64::try_from(&growth_tracker).unwrap(), *expected_tracker);
            assert_eq!(f64::try_from(&scale).unwrap(), 1024.);
        }

        update_scale_fallback(&mut scale, &mut growth_tracker, &found_inf, 2., 0.5, 3).unwrap();
        assert_eq!(i64::try_from(&growth_tracker).unwrap(), 0);
        assert_abs_diff_eq!(f64::try_from(&scale).unwrap(), 2048.);
    }

    #[test]
    fn state_dict_is_loaded_in_place() {
        let mut scaler = scaler(fallback_config());
        scaler.scale(&Tensor::from_slice(&[1f32])).unwrap();
        let scale_ptr = scaler.scale_tensor().unwrap().data_ptr();

        let mut state = scaler.state_dict().unwrap().unwrap();
        state.scale = 4.;
        state.growth_tracker = 7;
        state.growth_interval = 10;
        scaler.load_state_dict(Some(state)).unwrap();

        assert_eq!(scaler.scale_tensor().unwrap().data_ptr(), scale_ptr);
        assert_eq!(scaler.get_scale().unwrap(), 4.);
        assert_eq!(scaler.growth_tracker().unwrap(), 7);
        assert_eq!(scaler.growth_interval(), 10);

        assert!(matches!(
            scaler.load_state_dict(None),
            Err(ScalerError::EmptyStateDict)
        ));
    }

    #[test]
    fn snapshots_restore_scale() {
        let mut scaler = scaler(fallback_config());
        scaler.scale(&Tensor::from_slice(&[1f32])).unwrap();
        scaler.update(Some(NewScale::Value(256.))).unwrap();
        scaler.set_backoff_factor(0.25);

        let snapshot = scaler.snapshot().unwrap();
        let restored = ShardedGradScaler::from_snapshot(snapshot, Arc::new(SingleProcess)).unwrap();

        assert!(restored.scale_tensor().is_none());
        assert_eq!(restored.get_scale().unwrap(), 256.);
        assert_eq!(restored.backoff_factor(), 0.25);
    }
}
