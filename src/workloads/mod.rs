//! Demonstration workloads driven through the engine.
//!
//! A [`Job`] is plain data, so a coordinator can broadcast it to worker
//! processes that only learn what to run once the round starts.

pub mod contrast;
pub mod primes;
pub mod volume;
pub mod wave;

use log::info;
use serde::{Deserialize, Serialize};

use crate::collective::Collective;
use crate::error::{PdcrError, Result};
use crate::round::scatter_compute_gather;
use crate::runner::elementwise;

pub use contrast::GrayFrame;
pub use primes::PrimeReport;
pub use volume::Volume;
pub use wave::{WaveParams, WaveReport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Job {
    /// Adds one to every element of the coordinator's buffer.
    Increment,
    Primes { from: u64, to: u64 },
    Contrast { low: u8, high: u8 },
    Wave(WaveParams),
    /// Renders `frames` rotating views of the coordinator's volume.
    Render { frames: usize },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::Increment => "increment",
            Job::Primes { .. } => "primes",
            Job::Contrast { .. } => "contrast",
            Job::Wave(_) => "wave",
            Job::Render { .. } => "render",
        }
    }
}

/// Data only the coordinator holds.
#[derive(Debug, Clone, PartialEq)]
pub enum JobInput {
    Buffer(Vec<i64>),
    Frame(GrayFrame),
    Volume(Volume),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutput {
    Buffer(Vec<i64>),
    Primes(PrimeReport),
    Frame(GrayFrame),
    Wave(WaveReport),
    Frames(Vec<GrayFrame>),
}

fn increment(x: &i64) -> std::result::Result<i64, String> {
    x.checked_add(1).ok_or_else(|| format!("{x} + 1 overflows"))
}

/// Runs `job` on this rank. `input` is only read on the coordinator, which
/// is also the only rank that gets `Some(output)`.
pub fn execute<C: Collective>(
    comm: &mut C,
    job: &Job,
    input: Option<&JobInput>,
) -> Result<Option<JobOutput>> {
    let coordinator = comm.is_coordinator();
    match job {
        Job::Increment => {
            let buffer = match input {
                Some(JobInput::Buffer(buffer)) => Some(buffer.as_slice()),
                Some(_) => return Err(PdcrError::invalid_domain("increment needs a buffer")),
                None => None,
            };
            Ok(scatter_compute_gather(comm, buffer, elementwise(increment))?.map(JobOutput::Buffer))
        }
        Job::Primes { from, to } => {
            let report = primes::count(comm, *from, *to)?;
            Ok(coordinator.then_some(JobOutput::Primes(report)))
        }
        Job::Contrast { low, high } => {
            let frame = match input {
                Some(JobInput::Frame(frame)) => Some(frame),
                Some(_) => return Err(PdcrError::invalid_domain("contrast needs a frame")),
                None => None,
            };
            Ok(contrast::stretch(comm, frame, *low, *high)?.map(JobOutput::Frame))
        }
        Job::Wave(params) => {
            let report = wave::simulate(comm, params)?;
            Ok(coordinator.then_some(JobOutput::Wave(report)))
        }
        Job::Render { frames } => {
            let source = match input {
                Some(JobInput::Volume(source)) => Some(source),
                Some(_) => return Err(PdcrError::invalid_domain("render needs a volume")),
                None => None,
            };
            Ok(volume::render(comm, source, *frames)?.map(JobOutput::Frames))
        }
    }
}

/// Coordinator side of a remote round: announces `job` to every worker and
/// runs it.
pub fn coordinate<C: Collective>(
    comm: &mut C,
    job: &Job,
    input: Option<&JobInput>,
) -> Result<Option<JobOutput>> {
    info!("coordinating {} on {} ranks", job.name(), comm.size());
    let job = comm.broadcast(Some(job.clone()))?;
    execute(comm, &job, input)
}

/// Worker side of a remote round: waits for the job, then runs it.
pub fn serve<C: Collective>(comm: &mut C) -> Result<Job> {
    let job: Job = comm.broadcast(None)?;
    info!("rank {} running {}", comm.rank(), job.name());
    execute(comm, &job, None)?;
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::run_local;
    use crate::shared::ThreadGroup;

    #[test]
    fn coordinated_increment_over_local_ranks() {
        let input = JobInput::Buffer((1..=12).collect());
        let results = run_local(4, |c| {
            if c.is_coordinator() {
                coordinate(c, &Job::Increment, Some(&input))
            } else {
                serve(c).map(|_| None)
            }
        })
        .unwrap();
        assert_eq!(results[0], Some(JobOutput::Buffer((2..=13).collect())));
    }

    #[test]
    fn workers_learn_the_job_by_broadcast() {
        let job = Job::Primes { from: 1, to: 100 };
        let results = run_local(3, |c| {
            if c.is_coordinator() {
                coordinate(c, &job, None).map(|output| (None, output))
            } else {
                serve(c).map(|job| (Some(job), None))
            }
        })
        .unwrap();
        assert!(matches!(&results[0].1, Some(JobOutput::Primes(report)) if report.count == 25));
        assert!(results[1..].iter().all(|(seen, _)| seen.as_ref() == Some(&job)));
    }

    #[test]
    fn overflow_in_increment_names_the_element() {
        let mut buffer = vec![0i64; 10];
        buffer[7] = i64::MAX;
        let input = JobInput::Buffer(buffer);
        let err = ThreadGroup::new(4)
            .unwrap()
            .run(|m| {
                let input = m.is_coordinator().then_some(&input);
                execute(m, &Job::Increment, input)
            })
            .unwrap_err();
        let failure = err.worker_failure().unwrap();
        assert_eq!((failure.rank, failure.index), (2, 7));
    }

    #[test]
    fn render_job_over_local_ranks() {
        let input = JobInput::Volume(Volume::phantom(8).unwrap());
        let job = Job::Render { frames: 5 };
        let results = run_local(3, |c| {
            if c.is_coordinator() {
                coordinate(c, &job, Some(&input))
            } else {
                serve(c).map(|_| None)
            }
        })
        .unwrap();
        match &results[0] {
            Some(JobOutput::Frames(frames)) => assert_eq!(frames.len(), 5),
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn wrong_input_kind_is_rejected() {
        let input = JobInput::Buffer(vec![1, 2, 3]);
        let err = ThreadGroup::new(1)
            .unwrap()
            .run(|m| execute(m, &Job::Contrast { low: 0, high: 255 }, Some(&input)))
            .unwrap_err();
        assert!(matches!(err, PdcrError::InvalidDomain(_)));
    }
}
