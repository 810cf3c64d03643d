//! Collective operations shared by the thread-group and message-passing
//! backends.
//!
//! Every call blocks, and every participant must make the same calls in the
//! same order or the round deadlocks. There is no timeout: a hung peer hangs
//! the round.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{PdcrError, Result};
use crate::partition::{partition, Partition};
use crate::reduce::{ReduceOp, Reducible};

/// Rank that owns the global buffers and roots every collective.
pub const COORDINATOR: usize = 0;

/// Values that can cross a rank boundary.
pub trait Wire: Serialize + DeserializeOwned + Clone + Send + 'static {}

impl<T> Wire for T where T: Serialize + DeserializeOwned + Clone + Send + 'static {}

pub trait Collective {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn is_coordinator(&self) -> bool {
        self.rank() == COORDINATOR
    }

    /// Returns once every participant has arrived.
    fn barrier(&mut self) -> Result<()>;

    /// The coordinator supplies `Some(value)`; everyone returns that value.
    fn broadcast<V: Wire>(&mut self, value: Option<V>) -> Result<V>;

    /// The coordinator supplies the global buffer; every rank returns its
    /// span of it.
    fn scatter<V: Wire>(&mut self, global: Option<&[V]>, partition: &Partition) -> Result<Vec<V>>;

    /// Every rank contributes its span; the coordinator returns the assembled
    /// buffer, everyone else `None`.
    fn gather<V: Wire>(&mut self, local: &[V], partition: &Partition) -> Result<Option<Vec<V>>>;

    /// Gather followed by a broadcast of the assembled buffer.
    fn all_gather<V: Wire>(&mut self, local: &[V], partition: &Partition) -> Result<Vec<V>>;

    /// Combines one scalar per rank; every rank returns the combined value.
    fn all_reduce<S: Reducible + Wire>(&mut self, local: S, op: ReduceOp) -> Result<S>;
}

pub(crate) fn check_group(partition: &Partition, size: usize) -> Result<()> {
    if partition.workers() == size {
        Ok(())
    } else {
        Err(PdcrError::mismatch(format!(
            "partition has {} workers but the group has {size}",
            partition.workers()
        )))
    }
}

pub(crate) fn check_local(partition: &Partition, rank: usize, len: usize) -> Result<()> {
    let span = partition.span(rank)?;
    if span.len == len {
        Ok(())
    } else {
        Err(PdcrError::mismatch(format!(
            "rank {rank} holds {len} elements but its span has {}",
            span.len
        )))
    }
}

/// The coordinator partitions `extent` once for the whole group and
/// broadcasts it. Receivers only accept the canonical rule for the group's
/// size.
pub fn agree_partition<C: Collective>(comm: &mut C, extent: Option<usize>) -> Result<Partition> {
    let proposed = if comm.is_coordinator() {
        let extent = extent
            .ok_or_else(|| PdcrError::invalid_domain("the coordinator must supply the extent"))?;
        Some(partition(extent, comm.size())?)
    } else {
        None
    };

    let agreed = comm.broadcast(proposed)?;
    check_group(&agreed, comm.size())?;
    if !agreed.is_canonical() {
        return Err(PdcrError::mismatch("received a partition that breaks the balanced rule"));
    }
    Ok(agreed)
}
