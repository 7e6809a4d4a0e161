// copyright 2018 the google ai language team authors and the huggingface inc. team.
// copyright (c) 2018, nvidia corporation.  all rights reserved.
// copyright (c) 2019 the sticker developers.
//
// licensed under the apache license, version 2.0 (the "license");
// you may not use this file except in compliance with the license.
// you may obtain a copy of the license at
//
//     http://www.apache.org/licenses/license-2.0
//
// unless required by applicable law or agreed to in writing, software
// distributed under the license is distributed on an "as is" basis,
// without warranties or conditions of any kind, either express or implied.
// see the license for the specific language governing permissions and
// limitations under the license.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use shardscale_tch_ext::{ParamGroup, ParamGroupsExt};
use tch::nn::VarStore;
use tch::Tensor;

use super::Optimizer;
use crate::distributed::ProcessGroup;
use crate::error::ScalerError;

/// Internal Adam state.
struct AdamWState {
    step: usize,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

/// Adam optimizer configuration.
#[derive(Clone, Copy, Debug)]
pub struct AdamWConfig {
    pub betas: (f64, f64),
    pub correct_bias: bool,
    pub eps: f64,
    pub lr: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        AdamWConfig {
            betas: (0.9, 0.999),
            correct_bias: false,
            eps: 1e-6,
            lr: 1e-3,
            weight_decay: 0.,
        }
    }
}

/// Partition parameters over `world_size` ranks.
///
/// Each parameter is assigned to the rank that holds the fewest
/// elements so far, visiting parameters in group order. Returns the
/// names of the parameters owned by each rank.
pub fn partition_parameters(param_groups: &[ParamGroup], world_size: usize) -> Vec<HashSet<String>> {
    assert!(world_size > 0, "Cannot partition parameters over zero ranks");

    let mut partitions = vec![HashSet::new(); world_size];
    let mut sizes = vec![0i64; world_size];

    for (name, param) in param_groups.iter().flat_map(|group| group.params.iter()) {
        let rank = sizes
            .iter()
            .enumerate()
            .min_by_key(|(_, &size)| size)
            .map(|(rank, _)| rank)
            .unwrap_or(0);

        sizes[rank] += param.numel() as i64;
        partitions[rank].insert(name.clone());
    }

    partitions
}

/// Adam algorithm with weight decay fix, sharded over ranks.
///
/// Every rank holds the complete model, but only updates the parameters
/// of its own partition and only keeps the optimizer state for those
/// parameters. After each step, every parameter is broadcast from the
/// rank that owns it, so that all replicas hold the same values.
///
/// The gradients of all parameters are checked for overflow, including
/// those of parameters that other ranks own. This way, every rank
/// contributes to the same reductions, also when it does not own any
/// parameter.
pub struct ShardedAdamW<'a> {
    group: Arc<dyn ProcessGroup>,
    owners: HashMap<String, usize>,
    state: HashMap<String, AdamWState>,
    vs: &'a VarStore,
}

impl<'a> ShardedAdamW<'a> {
    /// Construct the optimizer shard of the rank of `group`.
    ///
    /// The trainable variables of `vs` are partitioned over the ranks of
    /// the process group. Variables that are added to `vs` later are not
    /// updated.
    pub fn new(vs: &'a VarStore, group: Arc<dyn ProcessGroup>) -> Self {
        let owners: HashMap<_, _> = partition_parameters(&vs.param_groups(), group.world_size())
            .into_iter()
            .enumerate()
            .flat_map(|(rank, names)| names.into_iter().map(move |name| (name, rank)))
            .collect();

        let rank = group.rank();
        let n_owned = owners.values().filter(|&&owner| owner == rank).count();
        if n_owned == 0 {
            log::warn!("Rank {} does not own any trainable parameters", rank);
        } else {
            log::debug!(
                "Rank {} owns {} of {} trainable parameters",
                rank,
                n_owned,
                owners.len()
            );
        }

        ShardedAdamW {
            group,
            owners,
            state: HashMap::new(),
            vs,
        }
    }

    /// Check whether this shard updates the parameter with the given name.
    pub fn owns(&self, name: &str) -> bool {
        self.owners.get(name) == Some(&self.group.rank())
    }

    /// Copy every parameter from its owner to the other ranks.
    fn broadcast_params(&self, param_groups: &[ParamGroup]) -> Result<(), ScalerError> {
        let mut last_work = None;
        let mut issued = Ok(());
        for (name, param) in param_groups.iter().flat_map(|group| group.params.iter()) {
            let owner = match self.owners.get(name) {
                Some(&owner) => owner,
                None => continue,
            };

            match self.group.broadcast(param, owner) {
                Ok(work) => last_work = Some(work),
                Err(err) => {
                    issued = Err(err);
                    break;
                }
            }
        }

        // Collectives complete in issue order.
        if let Some(work) = last_work {
            work.wait()?;
        }

        issued
    }
}

impl<'a> Optimizer for ShardedAdamW<'a> {
    type Config = AdamWConfig;

    type Output = ();

    fn step<F>(&mut self, config_fun: F) -> Result<(), ScalerError>
    where
        F: Fn(&str) -> Self::Config,
    {
        let param_groups = self.param_groups();

        tch::no_grad(|| {
            for (name, param) in param_groups.iter().flat_map(|group| group.params.iter()) {
                if !self.owns(name) {
                    continue;
                }

                let grad = param.grad();
                if !grad.defined() {
                    continue;
                }

                let config = config_fun(name);

                let state = self.state.entry(name.clone()).or_insert(AdamWState {
                    step: 0,
                    exp_avg: Tensor::zeros_like(param),
                    exp_avg_sq: Tensor::zeros_like(param),
                });

                state.step += 1;

                // Decay the first and second moment running average coefficient
                // In-place operations to update the averages at the same time
                state.exp_avg *= config.betas.0;
                state.exp_avg += (1. - config.betas.0) * &grad;
                state.exp_avg_sq *= config.betas.1;
                state.exp_avg_sq += (1. - config.betas.1) * &grad * &grad;
                let mut denom = state.exp_avg_sq.sqrt();
                denom += config.eps;

                let mut step_size = config.lr;
                if config.correct_bias {
                    let bias_correction1 = 1.0 - config.betas.0.powf(state.step as f64);
                    let bias_correction2 = 1.0 - config.betas.1.powf(state.step as f64);
                    step_size *= bias_correction2.sqrt() / bias_correction1;
                }

                let mut param = param.shallow_clone();
                param += -step_size * (&state.exp_avg / denom);

                if config.weight_decay > 0. {
                    param += -config.lr * config.weight_decay * &param;
                }
            }

            self.broadcast_params(&param_groups)
        })
    }

    fn param_groups(&self) -> Vec<ParamGroup> {
        self.vs.param_groups()
    }

    fn is_sharded(&self) -> bool {
        true
    }
}
