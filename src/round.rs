//! One partition → scatter → compute → gather round over any backend.

use log::info;

use crate::collective::{agree_partition, Collective, Wire};
use crate::error::Result;
use crate::partition::Partition;
use crate::runner::{compute_chunk, ComputeError, WorkerContext};

/// Runs `kernel` over the coordinator's `input` on every rank of `comm`.
///
/// Only the coordinator passes `Some(input)` and only the coordinator gets
/// `Some(output)` back. The partition is agreed once and then threaded
/// through scatter, compute and gather unchanged.
pub fn scatter_compute_gather<C, I, O, F>(
    comm: &mut C,
    input: Option<&[I]>,
    kernel: F,
) -> Result<Option<Vec<O>>>
where
    C: Collective,
    I: Wire,
    O: Wire + Default,
    F: Fn(&WorkerContext, &[I], &mut [O]) -> Result<(), ComputeError>,
{
    let partition = agree_partition(comm, input.map(<[I]>::len))?;
    if comm.is_coordinator() {
        info!(
            "round over {} elements on {} workers, counts {:?}",
            partition.extent(),
            partition.workers(),
            partition.counts()
        );
    }
    compute_on(comm, &partition, input, &kernel)
}

/// The same round on a partition every rank already holds.
pub fn compute_on<C, I, O, F>(
    comm: &mut C,
    partition: &Partition,
    input: Option<&[I]>,
    kernel: &F,
) -> Result<Option<Vec<O>>>
where
    C: Collective,
    I: Wire,
    O: Wire + Default,
    F: Fn(&WorkerContext, &[I], &mut [O]) -> Result<(), ComputeError>,
{
    let local = comm.scatter(input, partition)?;
    let ctx = WorkerContext::new(partition, comm.rank())?;
    let output = compute_chunk(kernel, &ctx, &local)?;
    comm.gather(&output, partition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::run_local;
    use crate::error::PdcrError;
    use crate::runner::elementwise;
    use crate::shared::ThreadGroup;

    fn fail_at_seven(
        ctx: &WorkerContext,
        input: &[i32],
        output: &mut [i32],
    ) -> Result<(), ComputeError> {
        for (i, (src, dst)) in input.iter().zip(output.iter_mut()).enumerate() {
            if ctx.global_index(i) == 7 {
                return Err(ComputeError::at(i, "poisoned element"));
            }
            *dst = *src;
        }
        Ok(())
    }

    #[test]
    fn increment_over_thread_group() {
        let input: Vec<i64> = (1..=12).collect();
        let results = ThreadGroup::new(4)
            .unwrap()
            .run(|m| {
                let global = m.is_coordinator().then_some(input.as_slice());
                scatter_compute_gather(m, global, elementwise(|x: &i64| Ok(x + 1)))
            })
            .unwrap();
        assert_eq!(results[0], Some((2..=13).collect::<Vec<i64>>()));
    }

    #[test]
    fn increment_over_local_ranks() {
        let input: Vec<i64> = (1..=12).collect();
        let results = run_local(4, |c| {
            let global = c.is_coordinator().then_some(input.as_slice());
            scatter_compute_gather(c, global, elementwise(|x: &i64| Ok(x + 1)))
        })
        .unwrap();
        assert_eq!(results[0], Some((2..=13).collect::<Vec<i64>>()));
        assert!(results[1..].iter().all(Option::is_none));
    }

    #[test]
    fn identity_round_trip_with_more_workers_than_elements() {
        let input = vec![3.5f32, -1.0, 8.25];
        let results = run_local(5, |c| {
            let global = c.is_coordinator().then_some(input.as_slice());
            scatter_compute_gather(c, global, elementwise(|x: &f32| Ok(*x)))
        })
        .unwrap();
        assert_eq!(results[0].as_deref(), Some(input.as_slice()));
    }

    #[test]
    fn empty_domain_round() {
        let input: Vec<u8> = Vec::new();
        let results = run_local(3, |c| {
            let global = c.is_coordinator().then_some(input.as_slice());
            scatter_compute_gather(c, global, elementwise(|x: &u8| Ok(*x)))
        })
        .unwrap();
        assert_eq!(results[0], Some(Vec::new()));
    }

    #[test]
    fn worker_failure_names_rank_and_global_index_on_every_backend() {
        let input: Vec<i32> = (0..10).collect();

        let threads = ThreadGroup::new(4)
            .unwrap()
            .run(|m| {
                let global = m.is_coordinator().then_some(input.as_slice());
                scatter_compute_gather(m, global, fail_at_seven)
            })
            .unwrap_err();

        let local = run_local(4, |c| {
            let global = c.is_coordinator().then_some(input.as_slice());
            scatter_compute_gather(c, global, fail_at_seven)
        })
        .unwrap_err();

        for err in [threads, local] {
            let failure = err.worker_failure().unwrap();
            assert_eq!((failure.rank, failure.index), (2, 7));
            assert!(matches!(err, PdcrError::WorkerCompute(_)));
        }
    }
}
