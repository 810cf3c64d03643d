//! Runs a caller-supplied kernel over exactly one worker's span.
//!
//! A kernel only sees its own input and output slices plus whatever scalars
//! it captured. That is what makes running every span at once race-free.

use log::debug;
use thiserror::Error;

use crate::error::{PdcrError, Result, WorkerFailure};
use crate::partition::{Partition, Span};

/// A failure raised inside a kernel, at an index local to the worker's slice.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("at local index {local_index}: {message}")]
pub struct ComputeError {
    pub local_index: usize,
    pub message: String,
}

impl ComputeError {
    pub fn at(local_index: usize, message: impl Into<String>) -> Self {
        Self {
            local_index,
            message: message.into(),
        }
    }
}

/// What a worker knows about itself during a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerContext {
    rank: usize,
    workers: usize,
    span: Span,
}

impl WorkerContext {
    pub fn new(partition: &Partition, rank: usize) -> Result<Self> {
        Ok(Self {
            rank,
            workers: partition.workers(),
            span: partition.span(rank)?,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn span(&self) -> Span {
        self.span
    }

    pub fn global_index(&self, local_index: usize) -> usize {
        self.span.offset + local_index
    }

    pub(crate) fn failure(&self, err: ComputeError) -> WorkerFailure {
        WorkerFailure {
            rank: self.rank,
            index: self.global_index(err.local_index),
            message: err.message,
        }
    }

    fn check_len(&self, what: &str, len: usize) -> Result<()> {
        if len == self.span.len {
            Ok(())
        } else {
            Err(PdcrError::mismatch(format!(
                "worker {} got {len} {what} elements for a span of {}",
                self.rank, self.span.len
            )))
        }
    }
}

/// Runs `kernel` over one worker's input and output slices.
///
/// Empty spans still call the kernel with empty slices.
pub fn run_worker<I, O, F>(
    kernel: &F,
    ctx: &WorkerContext,
    input: &[I],
    output: &mut [O],
) -> Result<()>
where
    F: Fn(&WorkerContext, &[I], &mut [O]) -> Result<(), ComputeError>,
{
    ctx.check_len("input", input.len())?;
    ctx.check_len("output", output.len())?;

    debug!("worker {} computing span {:?}", ctx.rank, ctx.span);
    kernel(ctx, input, output).map_err(|err| ctx.failure(err).into())
}

/// In-place variant: the slice is both input and output of the stage.
pub fn run_worker_in_place<T, F>(kernel: &F, ctx: &WorkerContext, data: &mut [T]) -> Result<()>
where
    F: Fn(&WorkerContext, &mut [T]) -> Result<(), ComputeError>,
{
    ctx.check_len("in-place", data.len())?;

    debug!("worker {} updating span {:?} in place", ctx.rank, ctx.span);
    kernel(ctx, data).map_err(|err| ctx.failure(err).into())
}

/// Allocates the output for one span and runs the kernel into it.
pub fn compute_chunk<I, O, F>(kernel: &F, ctx: &WorkerContext, input: &[I]) -> Result<Vec<O>>
where
    O: Default + Clone,
    F: Fn(&WorkerContext, &[I], &mut [O]) -> Result<(), ComputeError>,
{
    let mut output = vec![O::default(); input.len()];
    run_worker(kernel, ctx, input, &mut output)?;
    Ok(output)
}

/// Lifts a per-element function into a kernel.
pub fn elementwise<I, O, F>(
    f: F,
) -> impl Fn(&WorkerContext, &[I], &mut [O]) -> Result<(), ComputeError> + Sync
where
    F: Fn(&I) -> Result<O, String> + Sync,
{
    move |_ctx: &WorkerContext, input: &[I], output: &mut [O]| {
        for (i, (src, dst)) in input.iter().zip(output.iter_mut()).enumerate() {
            *dst = f(src).map_err(|message| ComputeError::at(i, message))?;
        }
        Ok(())
    }
}
