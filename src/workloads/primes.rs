//! Prime counting over an integer range split across workers.

use std::time::Instant;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::collective::{agree_partition, Collective};
use crate::error::{PdcrError, Result};
use crate::reduce::ReduceOp;

/// Trial division by odd numbers up to the square root.
pub fn is_prime(n: u64) -> bool {
    match n {
        0 | 1 => false,
        2 => true,
        _ if n % 2 == 0 => false,
        _ => {
            let mut d = 3;
            while d <= n / d {
                if n % d == 0 {
                    return false;
                }
                d += 2;
            }
            true
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimeReport {
    pub from: u64,
    pub to: u64,
    pub count: u64,
    /// Compute time summed over all workers.
    pub busy_seconds: f64,
    pub workers: usize,
}

/// Counts the primes in `[from, to]`. Every rank returns the same report.
pub fn count<C: Collective>(comm: &mut C, from: u64, to: u64) -> Result<PrimeReport> {
    if from > to {
        return Err(PdcrError::invalid_domain(format!("empty range [{from}, {to}]")));
    }
    let extent = usize::try_from(to - from)
        .ok()
        .and_then(|len| len.checked_add(1))
        .ok_or_else(|| PdcrError::invalid_domain(format!("range [{from}, {to}] is too large")))?;

    let proposed = comm.is_coordinator().then_some(extent);
    let partition = agree_partition(comm, proposed)?;
    let span = partition.span(comm.rank())?;

    let started = Instant::now();
    let first = from + span.offset as u64;
    let local = match span.len as u64 {
        0 => 0,
        len => (first..=first + (len - 1)).filter(|&n| is_prime(n)).count() as u64,
    };
    let busy = started.elapsed().as_secs_f64();
    debug!("rank {} found {local} primes in {span:?} in {busy:.3}s", comm.rank());

    let count = comm.all_reduce(local, ReduceOp::Sum)?;
    let busy_seconds = comm.all_reduce(busy, ReduceOp::Sum)?;
    Ok(PrimeReport {
        from,
        to,
        count,
        busy_seconds,
        workers: comm.size(),
    })
}
