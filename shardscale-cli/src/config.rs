use std::fs::File;
use std::io::Read;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use shardscale::config::{ScalerConfig, TomlRead};
use shardscale::error::ScalerError;

/// Simulation configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    /// Gradient scaler configuration, shared by all ranks.
    #[serde(default)]
    pub scaler: ScalerConfig,

    /// Simulated training run.
    pub simulation: Simulation,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Simulation {
    /// Number of ranks, each rank runs on its own thread.
    #[serde(default = "default_world_size")]
    pub world_size: usize,

    #[serde(default = "default_iterations")]
    pub iterations: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Number of input features of the regression model.
    #[serde(default = "default_features")]
    pub features: i64,

    /// Size of the hidden layer of the regression model.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: i64,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Seed for model initialization and data generation.
    #[serde(default = "default_seed")]
    pub seed: i64,

    /// Iterations in which a rank produces non-finite gradients.
    #[serde(default)]
    pub overflows: Vec<Overflow>,
}

/// Injected overflow.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Overflow {
    pub iteration: usize,
    pub rank: usize,
}

impl Simulation {
    /// Check whether `rank` should overflow in `iteration`.
    pub fn overflows(&self, iteration: usize, rank: usize) -> bool {
        self.overflows
            .iter()
            .any(|overflow| overflow.iteration == iteration && overflow.rank == rank)
    }
}

fn default_world_size() -> usize {
    2
}

fn default_iterations() -> usize {
    20
}

fn default_batch_size() -> i64 {
    32
}

fn default_features() -> i64 {
    8
}

fn default_hidden_size() -> i64 {
    16
}

fn default_learning_rate() -> f64 {
    1e-2
}

fn default_seed() -> i64 {
    42
}

impl TomlRead for SimulationConfig {
    fn from_toml_read(mut read: impl Read) -> Result<Self, ScalerError> {
        let mut data = String::new();
        read.read_to_string(&mut data)?;
        let config: SimulationConfig = toml::from_str(&data)?;
        Ok(config)
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        self.scaler
            .validate()
            .context("Invalid gradient scaler configuration")?;

        let simulation = &self.simulation;
        if simulation.world_size == 0 {
            bail!("The world size must be at least 1");
        }

        for overflow in &simulation.overflows {
            if overflow.rank >= simulation.world_size {
                bail!(
                    "Cannot inject overflow on rank {}, the world size is {}",
                    overflow.rank,
                    simulation.world_size
                );
            }
        }

        Ok(())
    }
}

pub fn load_config(config_path: &str) -> Result<SimulationConfig> {
    let config_file = File::open(config_path)
        .context(format!("Cannot open configuration file '{}'", &config_path))?;
    let config = SimulationConfig::from_toml_read(config_file)
        .context(format!("Cannot parse configuration file: {}", config_path))?;
    config.validate().context(format!(
        "Invalid configuration in configuration file: {}",
        config_path
    ))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use shardscale::config::{ScalerConfig, TomlRead};

    use super::{Overflow, SimulationConfig};

    #[test]
    fn simulation_config_is_read() {
        let config = SimulationConfig::from_toml_read(
            r#"
[scaler]
init_scale = 1024.0
growth_interval = 3

[simulation]
world_size = 3
iterations = 5
overflows = [ { iteration = 2, rank = 1 } ]
"#
            .as_bytes(),
        )
        .unwrap();

        assert_eq!(
            config.scaler,
            ScalerConfig {
                init_scale: 1024.,
                growth_interval: 3,
                ..ScalerConfig::default()
            }
        );
        assert_eq!(config.simulation.world_size, 3);
        assert_eq!(config.simulation.batch_size, 32);
        assert_eq!(
            config.simulation.overflows,
            vec![Overflow {
                iteration: 2,
                rank: 1
            }]
        );
        assert!(config.simulation.overflows(2, 1));
        assert!(!config.simulation.overflows(2, 0));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overflow_on_unknown_rank_is_rejected() {
        let config = SimulationConfig::from_toml_read(
            r#"
[simulation]
world_size = 2
overflows = [ { iteration = 0, rank = 2 } ]
"#
            .as_bytes(),
        )
        .unwrap();

        assert!(config.validate().is_err());
    }
}
