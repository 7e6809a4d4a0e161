//! Collective communication between shards.
//!
//! The scaler needs an asynchronous sum all-reduce of one-element
//! buffers, sharded optimizers a broadcast of the parameters that a rank
//! owns. Process groups issue collectives in order on a single channel,
//! so waiting on the last issued collective also completes every earlier
//! collective.
//!
//! Every issued collective must be completed, by waiting on its handle or
//! on the handle of a later collective of the same group. Dropping a
//! handle does not complete the collective.

use std::collections::{HashMap, VecDeque};
use std::convert::TryFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tch::{Device, Tensor};

use crate::error::ScalerError;
use crate::replicator::copy_to_device;

/// Handle of an issued collective.
pub trait Work {
    /// Block until the collective and all collectives issued before it
    /// on the same process group are completed.
    fn wait(self: Box<Self>) -> Result<(), ScalerError>;
}

/// A group of processes that reduce values together.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this process within the group.
    fn rank(&self) -> usize;

    /// Number of processes in the group.
    fn world_size(&self) -> usize;

    /// Check whether collectives can operate on buffers on `device`.
    fn supports_device(&self, device: Device) -> bool;

    /// The device to which unsupported buffers are moved before a
    /// collective.
    fn collective_device(&self) -> Device;

    /// Issue an asynchronous in-place sum reduction of `buffer`.
    ///
    /// The buffer only holds the reduced value after the returned handle
    /// (or the handle of a later collective) was waited on.
    fn all_reduce_sum<'a>(&'a self, buffer: &Tensor) -> Result<Box<dyn Work + 'a>, ScalerError>;

    /// Issue an asynchronous in-place broadcast of `buffer` from rank `src`.
    ///
    /// On the other ranks, `buffer` holds the value of rank `src` after
    /// the returned handle (or a later handle) was waited on. Buffers that
    /// require gradients must be waited on with gradient tracking disabled.
    fn broadcast<'a>(&'a self, buffer: &Tensor, src: usize)
        -> Result<Box<dyn Work + 'a>, ScalerError>;
}

fn check_source(src: usize, world_size: usize) -> Result<(), ScalerError> {
    if src >= world_size {
        return Err(ScalerError::Collective(format!(
            "broadcast source {} is not a rank of a group with {} ranks",
            src, world_size
        )));
    }

    Ok(())
}

/// Work that is already completed.
struct CompletedWork;

impl Work for CompletedWork {
    fn wait(self: Box<Self>) -> Result<(), ScalerError> {
        Ok(())
    }
}

/// Process group of a single process.
///
/// Reductions are no-ops, since the process holds the only value.
#[derive(Debug)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn supports_device(&self, _device: Device) -> bool {
        true
    }

    fn collective_device(&self) -> Device {
        Device::Cpu
    }

    fn all_reduce_sum<'a>(&'a self, _buffer: &Tensor) -> Result<Box<dyn Work + 'a>, ScalerError> {
        Ok(Box::new(CompletedWork))
    }

    fn broadcast<'a>(
        &'a self,
        _buffer: &Tensor,
        src: usize,
    ) -> Result<Box<dyn Work + 'a>, ScalerError> {
        check_source(src, 1)?;
        Ok(Box::new(CompletedWork))
    }
}

/// Contributions of the ranks to one collective.
#[derive(Debug, Default)]
struct Collective {
    sum: f64,
    source: Option<Tensor>,
    arrived: usize,
    consumed: usize,
}

type Collectives = HashMap<u64, Collective>;

struct Shared {
    world_size: usize,
    collectives: Mutex<Collectives>,
    arrived: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<Collectives>, ScalerError> {
        self.collectives
            .lock()
            .map_err(|_| ScalerError::Collective("a peer panicked during a collective".into()))
    }

    fn contribute(&self, seq: u64, value: f64, source: Option<Tensor>) -> Result<(), ScalerError> {
        let mut collectives = self.lock()?;
        let collective = collectives.entry(seq).or_default();
        collective.sum += value;
        if source.is_some() {
            collective.source = source;
        }
        collective.arrived += 1;

        if collective.arrived == self.world_size {
            self.arrived.notify_all();
        }

        Ok(())
    }

    /// Wait until every rank contributed to collective `seq`.
    ///
    /// Returns the sum of the contributed values and the broadcast
    /// source, if any.
    fn await_result(&self, seq: u64) -> Result<(f64, Option<Tensor>), ScalerError> {
        let mut collectives = self.lock()?;

        while collectives
            .get(&seq)
            .map(|collective| collective.arrived < self.world_size)
            .unwrap_or(true)
        {
            collectives = self.arrived.wait(collectives).map_err(|_| {
                ScalerError::Collective("a peer panicked during a collective".into())
            })?;
        }

        let collective = collectives
            .get_mut(&seq)
            .ok_or_else(|| ScalerError::Collective(format!("unknown collective: {}", seq)))?;
        collective.consumed += 1;
        let result = (
            collective.sum,
            collective.source.as_ref().map(Tensor::shallow_clone),
        );

        if collective.consumed == self.world_size {
            collectives.remove(&seq);
        }

        Ok(result)
    }
}

enum PendingOp {
    Sum,
    Broadcast { src: usize },
}

struct PendingCollective {
    seq: u64,
    buffer: Tensor,
    op: PendingOp,
}

/// In-process group whose ranks run on separate threads.
///
/// Each rank owns one `LocalProcessGroup` value. Ranks must issue the
/// same sequence of collectives, as with any process group. Contributions
/// are read from the buffers when a collective is issued, results are
/// written back when the collective is waited on.
pub struct LocalProcessGroup {
    rank: usize,
    shared: Arc<Shared>,
    next_seq: AtomicU64,
    pending: Mutex<VecDeque<PendingCollective>>,
    supported_devices: Vec<Device>,
    collective_device: Device,
}

impl LocalProcessGroup {
    /// Create the ranks of a group with `world_size` processes.
    ///
    /// The returned groups are ordered by rank. By default, the group
    /// only supports CPU buffers.
    pub fn new_group(world_size: usize) -> Vec<LocalProcessGroup> {
        assert!(world_size > 0, "A process group needs at least one rank");

        let shared = Arc::new(Shared {
            world_size,
            collectives: Mutex::new(HashMap::new()),
            arrived: Condvar::new(),
        });

        (0..world_size)
            .map(|rank| LocalProcessGroup {
                rank,
                shared: shared.clone(),
                next_seq: AtomicU64::new(0),
                pending: Mutex::new(VecDeque::new()),
                supported_devices: vec![Device::Cpu],
                collective_device: Device::Cpu,
            })
            .collect()
    }

    /// Set the devices on which the group can reduce buffers directly.
    pub fn with_supported_devices(mut self, devices: impl Into<Vec<Device>>) -> Self {
        self.supported_devices = devices.into();
        self
    }

    /// Set the device that unsupported buffers are moved to.
    pub fn with_collective_device(mut self, device: Device) -> Self {
        self.collective_device = device;
        self
    }

    fn pending(&self) -> Result<MutexGuard<VecDeque<PendingCollective>>, ScalerError> {
        self.pending
            .lock()
            .map_err(|_| ScalerError::Collective("pending collectives are poisoned".into()))
    }

    fn issue<'a>(
        &'a self,
        buffer: &Tensor,
        value: f64,
        source: Option<Tensor>,
        op: PendingOp,
    ) -> Result<Box<dyn Work + 'a>, ScalerError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        self.shared.contribute(seq, value, source)?;

        self.pending()?.push_back(PendingCollective {
            seq,
            buffer: buffer.shallow_clone(),
            op,
        });

        Ok(Box::new(LocalWork { group: self, seq }))
    }

    fn complete_through(&self, seq: u64) -> Result<(), ScalerError> {
        let mut pending = self.pending()?;

        while pending.front().map(|p| p.seq <= seq).unwrap_or(false) {
            if let Some(mut collective) = pending.pop_front() {
                let (sum, source) = self.shared.await_result(collective.seq)?;
                match (collective.op, source) {
                    (PendingOp::Sum, _) => {
                        let _ = collective.buffer.f_fill_(sum)?;
                    }
                    (PendingOp::Broadcast { src }, Some(source)) if src != self.rank => {
                        collective.buffer.f_copy_(&source)?;
                    }
                    (PendingOp::Broadcast { .. }, _) => (),
                }
            }
        }

        Ok(())
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn supports_device(&self, device: Device) -> bool {
        self.supported_devices.contains(&device)
    }

    fn collective_device(&self) -> Device {
        self.collective_device
    }

    fn all_reduce_sum<'a>(&'a self, buffer: &Tensor) -> Result<Box<dyn Work + 'a>, ScalerError> {
        if buffer.numel() != 1 {
            return Err(ScalerError::Collective(format!(
                "only one-element buffers can be reduced, buffer has {} elements",
                buffer.numel()
            )));
        }

        let value = f64::try_from(buffer)?;
        self.issue(buffer, value, None, PendingOp::Sum)
    }

    fn broadcast<'a>(
        &'a self,
        buffer: &Tensor,
        src: usize,
    ) -> Result<Box<dyn Work + 'a>, ScalerError> {
        check_source(src, self.world_size())?;

        let source = if src == self.rank {
            Some(copy_to_device(&buffer.f_detach()?, Device::Cpu)?)
        } else {
            None
        };

        self.issue(buffer, 0., source, PendingOp::Broadcast { src })
    }
}

struct LocalWork<'a> {
    group: &'a LocalProcessGroup,
    seq: u64,
}

impl<'a> Work for LocalWork<'a> {
    fn wait(self: Box<Self>) -> Result<(), ScalerError> {
        self.group.complete_through(self.seq)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;
    use std::thread;

    use tch::{Device, Kind, Tensor};

    use super::{LocalProcessGroup, ProcessGroup, SingleProcess};

    #[test]
    fn single_process_reduction_is_identity() {
        let buffer = Tensor::full(&[1], 3.0, (Kind::Float, Device::Cpu));
        SingleProcess.all_reduce_sum(&buffer).unwrap().wait().unwrap();
        assert_eq!(f64::try_from(&buffer).unwrap(), 3.0);
    }

    #[test]
    fn reductions_sum_over_ranks() {
        let handles = LocalProcessGroup::new_group(3)
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let buffer =
                        Tensor::full(&[1], group.rank() as f64, (Kind::Float, Device::Cpu));
                    group.all_reduce_sum(&buffer).unwrap().wait().unwrap();
                    f64::try_from(&buffer).unwrap()
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 3.0);
        }
    }

    #[test]
    fn waiting_on_last_reduction_completes_earlier_ones() {
        let handles = LocalProcessGroup::new_group(2)
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let first = Tensor::full(&[1], 1.0, (Kind::Float, Device::Cpu));
                    let second = Tensor::full(&[1], 10.0, (Kind::Float, Device::Cpu));

                    let first_work = group.all_reduce_sum(&first).unwrap();
                    drop(first_work);
                    let second_work = group.all_reduce_sum(&second).unwrap();
                    second_work.wait().unwrap();

                    let sums = (
                        f64::try_from(&first).unwrap(),
                        f64::try_from(&second).unwrap(),
                    );
                    (group, sums)
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            let (group, sums) = handle.join().unwrap();
            assert_eq!(sums, (2.0, 20.0));

            // Completed collectives are released on every rank.
            assert!(group.pending.lock().unwrap().is_empty());
            assert!(group.shared.collectives.lock().unwrap().is_empty());
        }
    }

    #[test]
    fn broadcasts_copy_the_source_buffer() {
        let handles = LocalProcessGroup::new_group(3)
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let rank = group.rank() as f64;
                    let flag = Tensor::full(&[1], 1.0, (Kind::Float, Device::Cpu));
                    let param = Tensor::full(&[2], rank, (Kind::Float, Device::Cpu));

                    let _sum_work = group.all_reduce_sum(&flag).unwrap();
                    group.broadcast(&param, 2).unwrap().wait().unwrap();

                    (
                        f64::try_from(&flag).unwrap(),
                        Vec::<f32>::try_from(&param).unwrap(),
                    )
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), (3.0, vec![2., 2.]));
        }
    }

    #[test]
    fn broadcast_source_must_be_a_rank() {
        let group = LocalProcessGroup::new_group(1).pop().unwrap();
        let buffer = Tensor::zeros(&[2], (Kind::Float, Device::Cpu));
        assert!(group.broadcast(&buffer, 1).is_err());
        assert!(SingleProcess.broadcast(&buffer, 1).is_err());
        assert!(SingleProcess.broadcast(&buffer, 0).is_ok());
    }

    #[test]
    fn multi_element_buffers_are_rejected() {
        let group = LocalProcessGroup::new_group(1).pop().unwrap();
        let buffer = Tensor::zeros(&[2], (Kind::Float, Device::Cpu));
        assert!(group.all_reduce_sum(&buffer).is_err());
    }
}
