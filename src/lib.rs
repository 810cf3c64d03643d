//! Partition, distribute, compute, recombine.
//!
//! A one-dimensional index domain of `N` elements is split into `P`
//! contiguous, balanced spans ([`partition`]). The coordinator (rank 0) owns
//! the global buffers; each worker computes its span with a caller-supplied
//! kernel ([`runner`]) and the results are reassembled in rank order
//! ([`collect`]), optionally combined with a reduction ([`reduce`]).
//!
//! Two backends implement the same [`Collective`] operations:
//!
//! - [`shared`]: threads in one address space. [`SharedRound`] hands out
//!   disjoint slices of the coordinator's buffers on a rayon pool;
//!   [`ThreadGroup`] runs multi-phase rounds with barriers.
//! - [`comm`]: message passing. [`Communicator`] runs over in-process
//!   channels ([`run_local`]) or TCP ([`TcpTransport`]).
//!
//! ```
//! use domain_decomposition::{elementwise, partition, SharedRound};
//!
//! let input: Vec<i64> = (1..=12).collect();
//! let mut output = vec![0; input.len()];
//! let round = SharedRound::new(partition(input.len(), 4)?)?;
//! round.scatter_compute(&input, &mut output, elementwise(|x: &i64| Ok(x + 1)))?;
//! assert_eq!(output, (2..=13).collect::<Vec<_>>());
//! # Ok::<(), domain_decomposition::PdcrError>(())
//! ```

pub mod collect;
pub mod collective;
pub mod comm;
pub mod config;
pub mod error;
pub mod partition;
pub mod reduce;
pub mod round;
pub mod runner;
pub mod shared;
pub mod workloads;

pub use collect::collect;
pub use collective::{agree_partition, Collective, Wire, COORDINATOR};
pub use comm::{run_local, Communicator, LocalTransport, TcpTransport, Transport};
pub use config::{EngineConfig, Mode, TcpConfig};
pub use error::{ChannelError, PdcrError, Result, WorkerFailure};
pub use partition::{partition, Partition, Span};
pub use reduce::{ReduceOp, Reducible};
pub use round::scatter_compute_gather;
pub use runner::{
    compute_chunk, elementwise, run_worker, run_worker_in_place, ComputeError, WorkerContext,
};
pub use shared::{Member, SharedRound, ThreadGroup};
