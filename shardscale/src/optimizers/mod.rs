use shardscale_tch_ext::ParamGroup;

use crate::error::ScalerError;

mod adamw;
pub use adamw::{partition_parameters, AdamWConfig, ShardedAdamW};

mod grad;
pub use grad::ZeroGrad;

mod grad_scale;
pub use grad_scale::{NewScale, ScaledOptimizer, ScalerHandle, ShardedGradScaler};

/// How an optimizer step interacts with gradient scaling.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepScaling {
    /// The optimizer is unaware of scaling. The scaler unscales the
    /// gradients and skips the step when gradients overflowed.
    Agnostic,

    /// The optimizer handles unscaling and overflow itself. The scaler
    /// hands control to `Optimizer::step_with_scaler`.
    ScaleAware,
}

pub trait Optimizer {
    type Config;

    /// The result of a step.
    type Output;

    /// Perform an update step.
    ///
    /// The provided configuration function is given the full name of
    /// the variable and should return the optimizer configuration. This
    /// makes it possible to use different hyper parameters for
    /// different parts of a model.
    fn step<F>(&mut self, config_fun: F) -> Result<Self::Output, ScalerError>
    where
        F: Fn(&str) -> Self::Config;

    /// The parameters whose gradients are unscaled and checked for
    /// overflow.
    ///
    /// Sharded optimizers must return the parameters of all shards, so
    /// that every rank reduces the same overflow flags.
    fn param_groups(&self) -> Vec<ParamGroup>;

    /// Whether the optimizer performs its own unscaling.
    ///
    /// This is queried once, when the optimizer is registered with a
    /// scaler.
    fn step_scaling(&self) -> StepScaling {
        StepScaling::Agnostic
    }

    /// Perform an update step with access to the scaler.
    ///
    /// Only called for optimizers that report `StepScaling::ScaleAware`.
    /// The optimizer is responsible for unscaling its gradients through
    /// the handle and for deciding whether the step is taken.
    fn step_with_scaler<F>(
        &mut self,
        _scaler: ScalerHandle,
        _config_fun: F,
    ) -> Result<Option<Self::Output>, ScalerError>
    where
        F: Fn(&str) -> Self::Config,
    {
        Err(ScalerError::ScaleAwareStepUnsupported)
    }

    /// Whether each rank only updates its own shard of the parameters.
    fn is_sharded(&self) -> bool {
        false
    }
}
