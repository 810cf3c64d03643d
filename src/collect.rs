//! Recombines per-worker outputs into the coordinator's global buffer.

use crate::error::{PdcrError, Result};
use crate::partition::Partition;

/// Places each rank's output at its span, whatever order the parts arrive in.
///
/// Every rank must contribute exactly once, with exactly its span's length.
pub fn collect<T>(
    partials: impl IntoIterator<Item = (usize, Vec<T>)>,
    partition: &Partition,
) -> Result<Vec<T>> {
    let mut slots: Vec<Option<Vec<T>>> = (0..partition.workers()).map(|_| None).collect();

    for (rank, part) in partials {
        let span = partition.span(rank).map_err(|_| {
            PdcrError::mismatch(format!(
                "output from rank {rank} but the partition has {} workers",
                partition.workers()
            ))
        })?;
        if part.len() != span.len {
            return Err(PdcrError::mismatch(format!(
                "rank {rank} returned {} elements for a span of {}",
                part.len(),
                span.len
            )));
        }
        if slots[rank].replace(part).is_some() {
            return Err(PdcrError::mismatch(format!("rank {rank} contributed twice")));
        }
    }

    let mut global = Vec::with_capacity(partition.extent());
    for (rank, slot) in slots.into_iter().enumerate() {
        let part =
            slot.ok_or_else(|| PdcrError::mismatch(format!("rank {rank} never contributed")))?;
        global.extend(part);
    }
    Ok(global)
}
