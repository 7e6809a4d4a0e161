//! Per-iteration optimizer state and persisted scaler state.

use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

use crate::config::ScalerConfig;
use crate::error::ScalerError;
use crate::replicator::PerDevice;

/// Scale and growth tracker buffers.
///
/// The buffers are created on the device of the first tensor that is
/// scaled. Once created, they stay on that device.
#[derive(Debug)]
pub enum ScaleState {
    Uninitialized,
    Materialized { scale: Tensor, growth_tracker: Tensor },
}

impl ScaleState {
    /// Get the scale, creating the buffers on `device` if necessary.
    pub fn get_or_materialize(
        &mut self,
        device: Device,
        init_scale: f64,
        init_growth_tracker: i64,
    ) -> Result<&Tensor, ScalerError> {
        if let ScaleState::Uninitialized = self {
            *self = ScaleState::Materialized {
                scale: Tensor::f_full(&[1], init_scale, (Kind::Float, device))?,
                growth_tracker: Tensor::f_full(&[1], init_growth_tracker, (Kind::Int, device))?,
            };
        }

        self.buffers("scale")
            .map(|(scale, _growth_tracker)| scale)
    }

    /// Get the scale and growth tracker.
    ///
    /// Fails if the buffers were not created yet. `operation` is the
    /// operation that requires the buffers.
    pub fn buffers(&self, operation: &'static str) -> Result<(&Tensor, &Tensor), ScalerError> {
        match self {
            ScaleState::Uninitialized => Err(ScalerError::ScaleNotInitialized(operation)),
            ScaleState::Materialized {
                scale,
                growth_tracker,
            } => Ok((scale, growth_tracker)),
        }
    }

    /// Get mutable references to the scale and growth tracker.
    pub fn buffers_mut(
        &mut self,
        operation: &'static str,
    ) -> Result<(&mut Tensor, &mut Tensor), ScalerError> {
        match self {
            ScaleState::Uninitialized => Err(ScalerError::ScaleNotInitialized(operation)),
            ScaleState::Materialized {
                scale,
                growth_tracker,
            } => Ok((scale, growth_tracker)),
        }
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self, ScaleState::Materialized { .. })
    }
}

/// Stage of an optimizer within an iteration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OptState {
    /// Gradients have not been unscaled yet.
    Ready,

    /// Gradients were unscaled explicitly.
    Unscaled,

    /// The optimizer step was attempted.
    Stepped,
}

impl Default for OptState {
    fn default() -> Self {
        OptState::Ready
    }
}

/// Opaque handle of an optimizer registered with a scaler.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct OptimizerId(pub(crate) usize);

/// State of an optimizer within the current iteration.
#[derive(Debug, Default)]
pub struct OptimizerState {
    pub stage: OptState,

    /// One-element flags, non-zero when a non-finite gradient was found
    /// on the device.
    pub found_inf_per_device: PerDevice<Tensor>,
}

/// Persisted scaler state.
///
/// This is a device-independent representation of the scale and the
/// growth/backoff settings that can be stored in a checkpoint.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ScalerState {
    /// The current scale.
    pub scale: f64,

    /// The current growth factor.
    pub growth_factor: f64,

    /// The current backoff factor.
    pub backoff_factor: f64,

    /// The current growth interval.
    pub growth_interval: i64,

    /// The number of recent consecutive iterations without overflow.
    #[serde(rename = "_growth_tracker", alias = "growth_tracker")]
    pub growth_tracker: i64,
}

/// Snapshot of a complete scaler.
///
/// A snapshot can only be taken between iterations. The scale and growth
/// tracker are stored as plain values, restoring a snapshot creates the
/// device buffers lazily on the next call to `scale`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ScalerSnapshot {
    /// Scaler configuration, `init_scale` holds the current scale.
    pub config: ScalerConfig,

    /// The number of recent consecutive iterations without overflow.
    pub growth_tracker: i64,

    /// Whether the non-sharded optimizer warning is still pending.
    pub display_warning: bool,
}
