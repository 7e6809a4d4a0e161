use std::io;

use tch::{Kind, TchError};
use thiserror::Error;

/// Gradient scaler errors.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ScalerError {
    #[error("step() has already been called since the last update()")]
    AlreadyStepped,

    #[error("unscale() has already been called on this optimizer since the last update()")]
    AlreadyUnscaled,

    #[error("collective operation failed: {0}")]
    Collective(String),

    #[error("the source state dict is empty, possibly because it was saved from a disabled scaler")]
    EmptyStateDict,

    #[error("attempting to unscale FP16 gradients of parameter `{0}`")]
    HalfPrecisionGradient(String),

    #[error("the backoff factor must be < 1.0, was: {0}")]
    InvalidBackoffFactor(f64),

    #[error("the growth factor must be > 1.0, was: {0}")]
    InvalidGrowthFactor(f64),

    #[error("the growth interval must be positive, was: {0}")]
    InvalidGrowthInterval(i64),

    #[error("the initial scale must be a positive finite value, was: {0}")]
    InvalidInitScale(f64),

    #[error("invalid new scale, expected {expected}: {reason}")]
    InvalidNewScale { expected: String, reason: String },

    #[error(transparent)]
    IoError(#[from] io::Error),

    #[error("a scaler may only be snapshotted at the beginning of an iteration, or at the end after update()")]
    MidIterationSnapshot,

    #[error("no inf checks were recorded for this optimizer")]
    NoInfChecksForOptimizer,

    #[error("no inf checks were recorded prior to update()")]
    NoInfChecksRecorded,

    #[error("outputs must be numeric tensors, got a tensor of kind {0:?}")]
    NonNumericOutput(Kind),

    #[error("attempted {0} but the scale is not initialized, this may indicate that scale() was not used earlier in the iteration")]
    ScaleNotInitialized(&'static str),

    #[error("the optimizer does not support scale-aware stepping")]
    ScaleAwareStepUnsupported,

    #[error(transparent)]
    Tch(#[from] TchError),

    #[error(transparent)]
    TomlDeserializationError(#[from] toml::de::Error),

    #[error("unscale() is being called after step()")]
    UnscaleAfterStep,
}
