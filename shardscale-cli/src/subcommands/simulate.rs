use std::convert::TryFrom;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Arg, ArgMatches, Command};
use shardscale::distributed::{LocalProcessGroup, ProcessGroup};
use shardscale::optimizers::{AdamWConfig, ShardedAdamW};
use shardscale::state::ScalerState;
use shardscale::ShardedGradScaler;
use stdinout::Output;
use tch::nn::VarStore;
use tch::Device;

use super::state::read_state;
use crate::config::{load_config, SimulationConfig};
use crate::model::{generate_batches, Batch, RegressionModel};
use crate::progress::IterationProgress;
use crate::traits::ShardScaleApp;

const CONFIG: &str = "CONFIG";
const GPU: &str = "GPU";
const RESUME: &str = "RESUME";
const STATE: &str = "STATE";

pub struct SimulateApp {
    config: String,
    device: Device,
    resume: Option<String>,
    state: Option<String>,
}

/// Outcome of the simulation on one rank.
struct RankReport {
    rank: usize,
    skipped: usize,
    state: Option<ScalerState>,
}

impl SimulateApp {
    #[allow(clippy::too_many_arguments)]
    fn run_rank(
        &self,
        group: LocalProcessGroup,
        config: &SimulationConfig,
        template: &VarStore,
        batches: Vec<Batch>,
        resume: Option<Option<ScalerState>>,
        mut progress: Option<IterationProgress>,
    ) -> Result<RankReport> {
        let rank = group.rank();
        let group: Arc<dyn ProcessGroup> = Arc::new(group);
        let simulation = &config.simulation;

        // Every rank starts from the same parameters.
        let mut vs = VarStore::new(self.device);
        let model = RegressionModel::new(vs.root(), simulation.features, simulation.hidden_size);
        vs.copy(template)
            .context(format!("Cannot copy model parameters to rank {}", rank))?;

        let mut scaler = ShardedGradScaler::new(config.scaler.clone(), group.clone())?;
        if let Some(state) = resume {
            scaler
                .load_state_dict(state)
                .context("Cannot load gradient scaler state")?;
        }

        let mut optimizer = scaler.register(ShardedAdamW::new(&vs, group.clone()));
        let adamw_config = AdamWConfig {
            lr: simulation.learning_rate,
            ..AdamWConfig::default()
        };

        let mut skipped = 0;
        for (iteration, batch) in batches.iter().enumerate() {
            let mut loss = model.loss(batch);
            if simulation.overflows(iteration, rank) {
                log::debug!("Injecting overflow on rank {} in iteration {}", rank, iteration);
                loss = loss * f64::INFINITY;
            }
            let loss_value = f64::try_from(&loss)?;

            let stepped = scaler
                .backward_step(&mut optimizer, &loss, |_| adamw_config)
                .context(format!("Training step failed on rank {}", rank))?
                .is_some();
            if !stepped {
                skipped += 1;
            }

            if let Some(progress) = progress.as_mut() {
                let scale = scaler.get_scale()?;
                progress.suspend(|| {
                    log::info!(
                        "iteration {}: loss: {:.4}, scale: {}, step: {}",
                        iteration,
                        loss_value,
                        scale,
                        if stepped { "taken" } else { "skipped" }
                    )
                });
                progress.count_iteration(scale);
            }
        }

        Ok(RankReport {
            rank,
            skipped,
            state: scaler.state_dict()?,
        })
    }

    fn write_state(&self, state: &Option<ScalerState>) -> Result<()> {
        let state_path = match &self.state {
            Some(state_path) => state_path,
            None => return Ok(()),
        };

        let output = Output::from(Some(state_path));
        let writer = output
            .write()
            .context(format!("Cannot open {} for writing", state_path))?;
        serde_json::to_writer_pretty(writer, state)
            .context(format!("Cannot write scaler state to {}", state_path))?;

        Ok(())
    }
}

impl ShardScaleApp for SimulateApp {
    fn app() -> Command {
        Command::new("simulate")
            .arg_required_else_help(true)
            .about("Simulate sharded mixed-precision training")
            .arg(
                Arg::new(CONFIG)
                    .help("Simulation configuration file")
                    .index(1)
                    .required(true),
            )
            .arg(
                Arg::new(GPU)
                    .long("gpu")
                    .num_args(1)
                    .help("Use the GPU with the given identifier"),
            )
            .arg(
                Arg::new(RESUME)
                    .long("resume")
                    .value_name("FILE")
                    .help("Load the gradient scaler state from FILE"),
            )
            .arg(
                Arg::new(STATE)
                    .long("state")
                    .value_name("FILE")
                    .help("Write the final gradient scaler state to FILE"),
            )
    }

    fn parse(matches: &ArgMatches) -> Result<Self> {
        let config = matches.get_one::<String>(CONFIG).unwrap().into();
        let device = match matches.get_one::<String>(GPU) {
            Some(gpu) => Device::Cuda(
                gpu.parse()
                    .context(format!("Cannot parse GPU number ({})", gpu))?,
            ),
            None => Device::Cpu,
        };
        let resume = matches.get_one::<String>(RESUME).map(ToOwned::to_owned);
        let state = matches.get_one::<String>(STATE).map(ToOwned::to_owned);

        Ok(SimulateApp {
            config,
            device,
            resume,
            state,
        })
    }

    fn run(&self) -> Result<()> {
        let mut config = load_config(&self.config)?;
        if self.device == Device::Cpu && config.scaler.enabled && !config.scaler.cpu_fallback {
            log::info!("Simulating on CPU, enabling the CPU fallback of the gradient scaler");
            config.scaler.cpu_fallback = true;
        }
        let simulation = &config.simulation;

        let resume = match &self.resume {
            Some(resume) => {
                let f = File::open(resume)
                    .context(format!("Cannot open scaler state: {}", resume))?;
                Some(read_state(BufReader::new(f))?)
            }
            None => None,
        };

        tch::manual_seed(simulation.seed);
        let template = VarStore::new(self.device);
        RegressionModel::new(template.root(), simulation.features, simulation.hidden_size);
        let batches = generate_batches(simulation, self.device);

        let mut progress = Some(IterationProgress::new(simulation.iterations)?);

        log::info!(
            "Simulating {} iterations on {} ranks",
            simulation.iterations,
            simulation.world_size
        );

        let reports = thread::scope(|s| {
            let handles = LocalProcessGroup::new_group(simulation.world_size)
                .into_iter()
                .zip(batches)
                .map(|(group, batches)| {
                    let progress = if group.rank() == 0 {
                        progress.take()
                    } else {
                        None
                    };
                    let resume = resume.clone();
                    let config = &config;
                    let template = &template;

                    s.spawn(move || {
                        self.run_rank(group, config, template, batches, resume, progress)
                    })
                })
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .map_err(|_| anyhow!("A simulated rank panicked"))
                        .and_then(|report| report)
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let (first, rest) = reports
            .split_first()
            .ok_or_else(|| anyhow!("The simulation did not run any ranks"))?;
        for report in rest {
            if report.state != first.state || report.skipped != first.skipped {
                bail!(
                    "Rank {} and rank {} disagree on the gradient scaler state",
                    first.rank,
                    report.rank
                );
            }
        }

        log::info!(
            "Skipped {} of {} steps",
            first.skipped,
            simulation.iterations
        );

        self.write_state(&first.state)
    }
}
