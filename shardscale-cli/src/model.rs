//! Toy regression model and data for simulated training runs.

use std::borrow::Borrow;

use tch::nn::{self, Linear, Module, Path};
use tch::{Device, Kind, Tensor};

use crate::config::Simulation;

/// Regression model with one hidden layer.
#[derive(Debug)]
pub struct RegressionModel {
    hidden: Linear,
    output: Linear,
}

impl RegressionModel {
    pub fn new<'a>(vs: impl Borrow<Path<'a>>, features: i64, hidden_size: i64) -> Self {
        let vs = vs.borrow();

        RegressionModel {
            hidden: nn::linear(vs / "hidden", features, hidden_size, Default::default()),
            output: nn::linear(vs / "output", hidden_size, 1, Default::default()),
        }
    }

    /// Compute the mean squared error loss of a batch.
    pub fn loss(&self, batch: &Batch) -> Tensor {
        self.forward(&batch.inputs)
            .mse_loss(&batch.targets, tch::Reduction::Mean)
    }
}

impl Module for RegressionModel {
    fn forward(&self, input: &Tensor) -> Tensor {
        self.output.forward(&self.hidden.forward(input).relu())
    }
}

/// Batch of inputs with regression targets.
#[derive(Debug)]
pub struct Batch {
    pub inputs: Tensor,
    pub targets: Tensor,
}

/// Generate the batches of every rank.
///
/// Targets are a noisy linear function of the inputs. Returns the
/// batches of each iteration, indexed by rank.
pub fn generate_batches(simulation: &Simulation, device: Device) -> Vec<Vec<Batch>> {
    let true_weights = Tensor::randn(&[simulation.features, 1], (Kind::Float, device));

    (0..simulation.world_size)
        .map(|_| {
            (0..simulation.iterations)
                .map(|_| {
                    let inputs = Tensor::randn(
                        &[simulation.batch_size, simulation.features],
                        (Kind::Float, device),
                    );
                    let noise =
                        Tensor::randn(&[simulation.batch_size, 1], (Kind::Float, device)) * 0.1;
                    let targets = inputs.matmul(&true_weights) + noise;
                    Batch { inputs, targets }
                })
                .collect()
        })
        .collect()
}
