//! Error taxonomy shared by every backend.
//!
//! Any error raised by any participant aborts the whole round. There is no
//! partial-result or retry path.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::comm::Tag;

/// A compute failure tagged with the worker that raised it and the global
/// index it was processing. Serializable so it can cross rank boundaries.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("worker {rank} failed at global index {index}: {message}")]
pub struct WorkerFailure {
    pub rank: usize,
    pub index: usize,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec failure: {0}")]
    Codec(#[from] bincode::Error),

    #[error("peer {peer} disconnected")]
    Disconnected { peer: usize },

    #[error("expected a {expected:?} frame from rank {peer}, got {got:?}")]
    UnexpectedTag { peer: usize, expected: Tag, got: Tag },

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: u64, max: u64 },

    #[error("round aborted by rank {by}: {reason}")]
    Aborted { by: usize, reason: String },

    #[error("worker {rank} was lost: {reason}")]
    PeerLost { rank: usize, reason: String },

    #[error("thread pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

#[derive(Error, Debug)]
pub enum PdcrError {
    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("partition mismatch: {0}")]
    PartitionMismatch(String),

    #[error(transparent)]
    WorkerCompute(#[from] WorkerFailure),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("reduction overflow: {0}")]
    Overflow(String),
}

pub type Result<T, E = PdcrError> = std::result::Result<T, E>;

impl PdcrError {
    pub fn invalid_domain(message: impl Into<String>) -> Self {
        Self::InvalidDomain(message.into())
    }

    pub fn mismatch(message: impl Into<String>) -> Self {
        Self::PartitionMismatch(message.into())
    }

    pub fn overflow(message: impl Into<String>) -> Self {
        Self::Overflow(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Channel(ChannelError::Protocol(message.into()))
    }

    /// The worker failure behind this error, if it is one.
    pub fn worker_failure(&self) -> Option<&WorkerFailure> {
        match self {
            Self::WorkerCompute(failure) => Some(failure),
            _ => None,
        }
    }

    /// True for the secondary error a participant sees when a peer aborted
    /// the round, as opposed to the failure that started the abort.
    pub fn is_abort_echo(&self) -> bool {
        matches!(self, Self::Channel(ChannelError::Aborted { .. }))
    }
}

impl From<std::io::Error> for PdcrError {
    fn from(err: std::io::Error) -> Self {
        Self::Channel(ChannelError::Io(err))
    }
}

impl From<bincode::Error> for PdcrError {
    fn from(err: bincode::Error) -> Self {
        Self::Channel(ChannelError::Codec(err))
    }
}

/// Folds per-participant outcomes into the round result: every value in rank
/// order, or the first root cause (skipping abort echoes when a real cause
/// exists).
pub(crate) fn first_cause<R>(outcomes: Vec<Result<R>>) -> Result<Vec<R>> {
    if outcomes.iter().all(|outcome| outcome.is_ok()) {
        return outcomes.into_iter().collect();
    }

    let mut echo = None;
    for outcome in outcomes {
        match outcome {
            Err(err) if err.is_abort_echo() => {
                echo.get_or_insert(err);
            }
            Err(err) => return Err(err),
            Ok(_) => {}
        }
    }
    Err(echo.unwrap_or_else(|| PdcrError::protocol("round failed without a recorded cause")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_failure_display_names_rank_and_index() {
        let err = PdcrError::from(WorkerFailure {
            rank: 2,
            index: 7,
            message: "bad pixel".into(),
        });
        assert_eq!(err.to_string(), "worker 2 failed at global index 7: bad pixel");
        assert_eq!(err.worker_failure().map(|f| f.index), Some(7));
    }

    #[test]
    fn first_cause_prefers_root_cause_over_echo() {
        let outcomes: Vec<Result<u32>> = vec![
            Ok(1),
            Err(ChannelError::Aborted {
                by: 2,
                reason: "peer failed".into(),
            }
            .into()),
            Err(PdcrError::mismatch("rank 2 returned 3 elements")),
        ];
        let err = first_cause(outcomes).unwrap_err();
        assert!(matches!(err, PdcrError::PartitionMismatch(_)));
    }

    #[test]
    fn first_cause_keeps_rank_order_on_success() {
        let outcomes: Vec<Result<usize>> = vec![Ok(0), Ok(1), Ok(2)];
        assert_eq!(first_cause(outcomes).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn first_cause_falls_back_to_echo() {
        let outcomes: Vec<Result<()>> = vec![Err(ChannelError::Aborted {
            by: 0,
            reason: "coordinator failed".into(),
        }
        .into())];
        assert!(first_cause(outcomes).unwrap_err().is_abort_echo());
    }
}
