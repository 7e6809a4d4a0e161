use std::collections::HashMap;

use itertools::Itertools;
use tch::nn::VarStore;
use tch::Tensor;

/// A group of trainable parameters.
///
/// Parameters in the same group share optimizer hyper-parameters. The
/// parameters are stored together with their full names in the variable
/// store.
#[derive(Debug)]
pub struct ParamGroup {
    /// The group index of the parameters.
    pub group: usize,

    /// Named parameters in this group.
    pub params: Vec<(String, Tensor)>,
}

impl ParamGroup {
    /// Get the parameters that have a gradient.
    pub fn params_with_grad(&self) -> impl Iterator<Item = (&str, Tensor)> {
        self.params.iter().filter_map(|(name, param)| {
            let grad = param.grad();
            if grad.defined() {
                Some((name.as_str(), grad))
            } else {
                None
            }
        })
    }

    /// Check whether the group has any parameters.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Trait for enumerating parameter groups.
pub trait ParamGroupsExt {
    /// Get the trainable parameters, grouped by their group index.
    ///
    /// Groups are returned in increasing group order. Within a group,
    /// parameters are in the order in which they were created.
    fn param_groups(&self) -> Vec<ParamGroup>;
}

impl ParamGroupsExt for VarStore {
    fn param_groups(&self) -> Vec<ParamGroup> {
        let variables = self.variables_.lock().unwrap();

        // Mapping from tensors to names.
        let tensor_names: HashMap<_, _> = variables
            .named_variables
            .iter()
            .map(|(name, tensor)| (tensor.data_ptr(), name.clone()))
            .collect();

        variables
            .trainable_variables
            .iter()
            .map(|var| {
                let name = tensor_names
                    .get(&var.tensor.data_ptr())
                    .cloned()
                    .unwrap_or_default();
                (var.group, (name, var.tensor.shallow_clone()))
            })
            .sorted_by_key(|(group, _)| *group)
            .group_by(|(group, _)| *group)
            .into_iter()
            .map(|(group, params)| ParamGroup {
                group,
                params: params.map(|(_, param)| param).collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use tch::nn::VarStore;
    use tch::{Device, Kind, Tensor};

    use super::ParamGroupsExt;

    fn group_names(vs: &VarStore) -> Vec<(usize, Vec<String>)> {
        vs.param_groups()
            .into_iter()
            .map(|group| {
                (
                    group.group,
                    group.params.into_iter().map(|(name, _)| name).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn parameters_are_grouped_by_index() {
        let vs = VarStore::new(Device::Cpu);
        let root = vs.root();
        let linear = &root / "linear";
        linear.set_group(1).zeros("bias", &[3]);
        linear.zeros("weight", &[3, 2]);
        root.zeros("scale", &[1]);

        assert_eq!(
            group_names(&vs),
            vec![
                (
                    0,
                    vec!["linear.weight".to_string(), "scale".to_string()]
                ),
                (1, vec!["linear.bias".to_string()])
            ]
        );
    }

    #[test]
    fn only_parameters_with_gradients_are_returned() {
        let vs = VarStore::new(Device::Cpu);
        let root = vs.root();
        let used = root.ones("used", &[2]);
        root.ones("unused", &[2]);

        let loss = (&used * Tensor::from_slice(&[2f32, 3.])).sum(Kind::Float);
        loss.backward();

        let groups = vs.param_groups();
        let with_grad = groups[0]
            .params_with_grad()
            .map(|(name, grad)| (name.to_string(), Vec::<f32>::try_from(&grad).unwrap()))
            .collect::<Vec<_>>();

        assert_eq!(with_grad, vec![("used".to_string(), vec![2., 3.])]);
    }
}
