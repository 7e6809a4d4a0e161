//! Gradient scaling for sharded mixed-precision training.
//!
//! [`ShardedGradScaler`] scales losses to avoid gradient underflow in
//! half precision, unscales gradients before optimizer steps and skips
//! steps with non-finite gradients. Since every rank of a sharded
//! optimizer only inspects its own gradients, overflow flags are
//! reduced over a [`ProcessGroup`](distributed::ProcessGroup) so that
//! all ranks agree on skipping steps and on the scale.

pub mod config;

pub mod distributed;

pub mod error;

pub mod optimizers;
pub use optimizers::{NewScale, ScaledOptimizer, ScalerHandle, ShardedGradScaler};

pub mod replicator;

pub mod scale;

pub mod state;

pub mod unscale;
