//! Per-device copies of scalar tensors.

use std::slice;

use tch::{Device, Tensor};

use crate::error::ScalerError;

/// Insertion-ordered mapping from devices to values.
///
/// Every shard must issue its collectives in the same order, so unlike
/// a `HashMap`, iteration follows the order in which devices were
/// first seen.
#[derive(Debug)]
pub struct PerDevice<T> {
    inner: Vec<(Device, T)>,
}

impl<T> PerDevice<T> {
    pub fn new() -> Self {
        PerDevice { inner: Vec::new() }
    }

    /// Get the value for `device`, inserting the result of `f` when absent.
    pub fn get_or_try_insert_with<F, E>(&mut self, device: Device, f: F) -> Result<&T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let idx = match self.inner.iter().position(|(d, _)| *d == device) {
            Some(idx) => idx,
            None => {
                self.inner.push((device, f()?));
                self.inner.len() - 1
            }
        };

        Ok(&self.inner[idx].1)
    }

    /// Get a mutable reference to the value for `device`, inserting the
    /// default value when absent.
    pub fn get_mut_or_default(&mut self, device: Device) -> &mut T
    where
        T: Default,
    {
        let idx = match self.inner.iter().position(|(d, _)| *d == device) {
            Some(idx) => idx,
            None => {
                self.inner.push((device, T::default()));
                self.inner.len() - 1
            }
        };

        &mut self.inner[idx].1
    }

    pub fn get(&self, device: Device) -> Option<&T> {
        self.inner
            .iter()
            .find(|(d, _)| *d == device)
            .map(|(_, value)| value)
    }

    /// Insert a value, replacing the value of `device` if present.
    pub fn insert(&mut self, device: Device, value: T) {
        match self.inner.iter_mut().find(|(d, _)| *d == device) {
            Some((_, old)) => *old = value,
            None => self.inner.push((device, value)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Device, &T)> {
        self.inner.iter().map(|(device, value)| (*device, value))
    }

    pub fn iter_mut(&mut self) -> slice::IterMut<(Device, T)> {
        self.inner.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.inner.iter().map(|(_, value)| value)
    }
}

impl<T> Default for PerDevice<T> {
    fn default() -> Self {
        PerDevice::new()
    }
}

/// Lazily serves copies of a tensor to requested devices.
///
/// Copies are cached per device, so a scalar that is used on many
/// devices is only transferred once to each of them.
pub struct DeviceReplicator {
    master: Tensor,
    per_device: PerDevice<Tensor>,
}

impl DeviceReplicator {
    /// Construct a replicator for the `master` tensor.
    pub fn new(master: &Tensor) -> Self {
        DeviceReplicator {
            master: master.shallow_clone(),
            per_device: PerDevice::new(),
        }
    }

    /// Get the copy of the master tensor on `device`.
    ///
    /// The copy is made on first request. Copies are never shared with
    /// the master, including on the master's device.
    pub fn get(&mut self, device: Device) -> Result<&Tensor, ScalerError> {
        let master = &self.master;
        self.per_device
            .get_or_try_insert_with(device, || copy_to_device(master, device))
    }

    /// Get the copies that were requested so far.
    pub fn into_per_device(self) -> PerDevice<Tensor> {
        self.per_device
    }
}

/// Copy a tensor to a device.
///
/// The result never shares storage with `tensor`.
pub(crate) fn copy_to_device(tensor: &Tensor, device: Device) -> Result<Tensor, ScalerError> {
    let mut copy = Tensor::f_zeros(tensor.size().as_slice(), (tensor.kind(), device))?;
    copy.f_copy_(tensor)?;
    Ok(copy)
}
