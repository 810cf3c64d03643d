//! Shared-memory mode.
//!
//! Scatter and gather are zero-copy: every worker gets a view of its span of
//! the coordinator's buffers, and the views never overlap because the spans
//! never do. No locks are taken during compute. A panicking kernel fails
//! the round with `PeerLost` for its rank, as in the other backends.

mod group;

pub use group::{Member, ThreadGroup};

use std::panic::{self, AssertUnwindSafe};

use log::{info, warn};
use rayon::prelude::*;

use crate::error::{ChannelError, Result};
use crate::partition::Partition;
use crate::reduce::{self, ReduceOp, Reducible};
use crate::runner::{run_worker, run_worker_in_place, ComputeError, WorkerContext};

/// Read-only views of each rank's span.
pub fn split_spans<'a, T>(data: &'a [T], partition: &Partition) -> Result<Vec<&'a [T]>> {
    partition.check_extent(data.len())?;
    Ok(partition.spans().iter().map(|span| &data[span.range()]).collect())
}

/// Disjoint mutable views of each rank's span.
pub fn split_spans_mut<'a, T>(
    data: &'a mut [T],
    partition: &Partition,
) -> Result<Vec<&'a mut [T]>> {
    partition.check_extent(data.len())?;

    let mut rest = data;
    let mut views = Vec::with_capacity(partition.workers());
    for span in partition.spans() {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(span.len);
        views.push(head);
        rest = tail;
    }
    Ok(views)
}

/// Runs one rank's share, turning a panic into `PeerLost`.
fn guarded<R>(rank: usize, work: impl FnOnce() -> Result<R>) -> Result<R> {
    panic::catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|_| {
        warn!("worker {rank} panicked");
        Err(ChannelError::PeerLost {
            rank,
            reason: "worker panicked".into(),
        }
        .into())
    })
}

/// One shared-memory round: a fixed partition and a pool with one thread
/// per rank. Dropping the round tears the pool down.
pub struct SharedRound {
    partition: Partition,
    pool: rayon::ThreadPool,
}

impl SharedRound {
    pub fn new(partition: Partition) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(partition.workers())
            .thread_name(|i| format!("pdcr-worker-{i}"))
            .build()
            .map_err(ChannelError::from)?;
        Ok(Self { partition, pool })
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Runs `kernel` on every span, writing straight into `output`.
    pub fn scatter_compute<I, O, F>(&self, input: &[I], output: &mut [O], kernel: F) -> Result<()>
    where
        I: Sync,
        O: Send,
        F: Fn(&WorkerContext, &[I], &mut [O]) -> Result<(), ComputeError> + Sync,
    {
        let inputs = split_spans(input, &self.partition)?;
        let outputs = split_spans_mut(output, &self.partition)?;
        info!(
            "shared round over {} elements on {} workers",
            self.partition.extent(),
            self.partition.workers()
        );

        let partition = &self.partition;
        self.pool.install(|| {
            inputs
                .into_par_iter()
                .zip(outputs.into_par_iter())
                .enumerate()
                .try_for_each(|(rank, (input, output))| {
                    guarded(rank, || {
                        let ctx = WorkerContext::new(partition, rank)?;
                        run_worker(&kernel, &ctx, input, output)
                    })
                })
        })
    }

    /// Named in-place variant: `data` is both the input and the output.
    pub fn compute_in_place<T, F>(&self, data: &mut [T], kernel: F) -> Result<()>
    where
        T: Send,
        F: Fn(&WorkerContext, &mut [T]) -> Result<(), ComputeError> + Sync,
    {
        let views = split_spans_mut(data, &self.partition)?;

        let partition = &self.partition;
        self.pool.install(|| {
            views
                .into_par_iter()
                .enumerate()
                .try_for_each(|(rank, view)| {
                    guarded(rank, || {
                        let ctx = WorkerContext::new(partition, rank)?;
                        run_worker_in_place(&kernel, &ctx, view)
                    })
                })
        })
    }

    /// Every worker reduces its span to one scalar; the scalars are folded
    /// in rank order.
    pub fn map_reduce<I, S, F>(&self, input: &[I], op: ReduceOp, local: F) -> Result<S>
    where
        I: Sync,
        S: Reducible,
        F: Fn(&WorkerContext, &[I]) -> Result<S, ComputeError> + Sync,
    {
        let inputs = split_spans(input, &self.partition)?;

        let partition = &self.partition;
        let locals: Vec<S> = self.pool.install(|| {
            inputs
                .into_par_iter()
                .enumerate()
                .map(|(rank, input)| {
                    guarded(rank, || {
                        let ctx = WorkerContext::new(partition, rank)?;
                        local(&ctx, input).map_err(|err| ctx.failure(err).into())
                    })
                })
                .collect::<Result<Vec<S>>>()
        })?;

        reduce::fold(locals, op)
    }
}
