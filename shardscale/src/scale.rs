//! Scaling of model outputs.

use std::collections::BTreeMap;

use tch::{Kind, Tensor};

use crate::error::ScalerError;
use crate::replicator::DeviceReplicator;
use crate::state::ScaleState;

/// Outputs that can be multiplied by the loss scale.
///
/// This trait is implemented for tensors and for containers of scalable
/// values. Scaling a container scales every tensor in it and preserves
/// the structure of the container.
pub trait Scalable: Sized {
    fn scale_with(self, scaler: &mut OutputScaler) -> Result<Self, ScalerError>;
}

impl Scalable for Tensor {
    fn scale_with(self, scaler: &mut OutputScaler) -> Result<Self, ScalerError> {
        scaler.scale_tensor(&self)
    }
}

impl<T> Scalable for Vec<T>
where
    T: Scalable,
{
    fn scale_with(self, scaler: &mut OutputScaler) -> Result<Self, ScalerError> {
        self.into_iter().map(|v| v.scale_with(scaler)).collect()
    }
}

impl<T> Scalable for Option<T>
where
    T: Scalable,
{
    fn scale_with(self, scaler: &mut OutputScaler) -> Result<Self, ScalerError> {
        self.map(|v| v.scale_with(scaler)).transpose()
    }
}

impl<K, T> Scalable for BTreeMap<K, T>
where
    K: Ord,
    T: Scalable,
{
    fn scale_with(self, scaler: &mut OutputScaler) -> Result<Self, ScalerError> {
        self.into_iter()
            .map(|(k, v)| Ok((k, v.scale_with(scaler)?)))
            .collect()
    }
}

impl<A, B> Scalable for (A, B)
where
    A: Scalable,
    B: Scalable,
{
    fn scale_with(self, scaler: &mut OutputScaler) -> Result<Self, ScalerError> {
        Ok((self.0.scale_with(scaler)?, self.1.scale_with(scaler)?))
    }
}

impl<A, B, C> Scalable for (A, B, C)
where
    A: Scalable,
    B: Scalable,
    C: Scalable,
{
    fn scale_with(self, scaler: &mut OutputScaler) -> Result<Self, ScalerError> {
        Ok((
            self.0.scale_with(scaler)?,
            self.1.scale_with(scaler)?,
            self.2.scale_with(scaler)?,
        ))
    }
}

/// Multiplies tensors by the scale.
///
/// The scale buffers are created on the device of the first tensor that
/// is scaled. Tensors on other devices are multiplied by a copy of the
/// scale, which is transferred once per device.
pub struct OutputScaler<'a> {
    state: &'a mut ScaleState,
    init_scale: f64,
    init_growth_tracker: i64,
    replicator: Option<DeviceReplicator>,
}

impl<'a> OutputScaler<'a> {
    pub(crate) fn new(state: &'a mut ScaleState, init_scale: f64, init_growth_tracker: i64) -> Self {
        OutputScaler {
            state,
            init_scale,
            init_growth_tracker,
            replicator: None,
        }
    }

    /// Multiply a single tensor by the scale.
    pub fn scale_tensor(&mut self, tensor: &Tensor) -> Result<Tensor, ScalerError> {
        check_numeric(tensor)?;

        let replicator = match &mut self.replicator {
            Some(replicator) => replicator,
            None => {
                let scale = self.state.get_or_materialize(
                    tensor.device(),
                    self.init_scale,
                    self.init_growth_tracker,
                )?;
                self.replicator.insert(DeviceReplicator::new(scale))
            }
        };

        Ok(tensor.f_mul(replicator.get(tensor.device())?)?)
    }
}

/// Check that a tensor holds numbers that can be scaled.
pub(crate) fn check_numeric(tensor: &Tensor) -> Result<(), ScalerError> {
    match tensor.kind() {
        Kind::Bool => Err(ScalerError::NonNumericOutput(tensor.kind())),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::convert::TryFrom;

    use maplit::btreemap;
    use tch::{Device, Kind, Tensor};

    use super::{OutputScaler, Scalable};
    use crate::error::ScalerError;
    use crate::state::ScaleState;

    fn values(t: &Tensor) -> Vec<f32> {
        Vec::<f32>::try_from(t).unwrap()
    }

    #[test]
    fn nested_outputs_keep_their_structure() {
        let mut state = ScaleState::Uninitialized;
        let mut scaler = OutputScaler::new(&mut state, 4.0, 0);

        let outputs: (Tensor, Vec<Tensor>, Option<Tensor>) = (
            Tensor::from_slice(&[1f32, 2.]),
            vec![Tensor::from_slice(&[3f32]), Tensor::from_slice(&[0.5f32])],
            None,
        );

        let (first, rest, missing) = outputs.scale_with(&mut scaler).unwrap();

        assert_eq!(values(&first), vec![4., 8.]);
        assert_eq!(rest.len(), 2);
        assert_eq!(values(&rest[0]), vec![12.]);
        assert_eq!(values(&rest[1]), vec![2.]);
        assert!(missing.is_none());
    }

    #[test]
    fn maps_are_scaled_per_value() {
        let mut state = ScaleState::Uninitialized;
        let mut scaler = OutputScaler::new(&mut state, 2.0, 0);

        let outputs: BTreeMap<&str, Tensor> = btreemap! {
            "loss" => Tensor::from_slice(&[1.5f32]),
            "aux" => Tensor::from_slice(&[-1f32]),
        };

        let scaled = outputs.scale_with(&mut scaler).unwrap();

        assert_eq!(scaled.keys().copied().collect::<Vec<_>>(), vec!["aux", "loss"]);
        assert_eq!(values(&scaled["loss"]), vec![3.]);
        assert_eq!(values(&scaled["aux"]), vec![-2.]);
    }

    #[test]
    fn scale_is_materialized_on_first_output() {
        let mut state = ScaleState::Uninitialized;

        {
            let mut scaler = OutputScaler::new(&mut state, 8.0, 0);
            let empty: Vec<Tensor> = Vec::new();
            empty.scale_with(&mut scaler).unwrap();
        }
        assert!(!state.is_materialized());

        {
            let mut scaler = OutputScaler::new(&mut state, 8.0, 0);
            scaler
                .scale_tensor(&Tensor::from_slice(&[1f32]))
                .unwrap();
        }
        let (scale, _) = state.buffers("scale").unwrap();
        assert_eq!(scale.device(), Device::Cpu);
        assert_eq!(f64::try_from(scale).unwrap(), 8.0);
    }

    #[test]
    fn boolean_outputs_are_rejected() {
        let mut state = ScaleState::Uninitialized;
        let mut scaler = OutputScaler::new(&mut state, 8.0, 0);

        let mask = Tensor::ones(&[2], (Kind::Bool, Device::Cpu));
        assert!(matches!(
            mask.scale_with(&mut scaler),
            Err(ScalerError::NonNumericOutput(Kind::Bool))
        ));
    }
}
