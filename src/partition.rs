//! Balanced, contiguous partitioning of a linear index domain.
//!
//! `partition(n, p)` hands every rank `n / p` units and front-loads the
//! remainder: ranks `0..n % p` get one extra unit. Callers index by rank and
//! rely on that tie-break, so it is the only rule this crate ever uses.

use std::ops::Range;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{PdcrError, Result};

/// One rank's contiguous share of the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub offset: usize,
    pub len: usize,
}

impl Span {
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, index: usize) -> bool {
        self.range().contains(&index)
    }
}

/// The assignment of spans to ranks for one round.
///
/// Computed once by the coordinator and never modified; scatter, compute and
/// gather must all see the same value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    extent: usize,
    spans: Vec<Span>,
}

/// Splits `extent` units across `workers` ranks.
pub fn partition(extent: usize, workers: usize) -> Result<Partition> {
    if workers == 0 {
        return Err(PdcrError::invalid_domain("worker count must be at least 1"));
    }

    let base = extent / workers;
    let remainder = extent % workers;

    let mut offset = 0;
    let spans = (0..workers)
        .map(|rank| {
            let len = if rank < remainder { base + 1 } else { base };
            let span = Span::new(offset, len);
            offset += len;
            span
        })
        .collect();

    debug!(
        "partitioned {extent} units over {workers} workers (base {base}, remainder {remainder})"
    );
    Ok(Partition { extent, spans })
}

impl Partition {
    pub fn new(extent: usize, workers: usize) -> Result<Self> {
        partition(extent, workers)
    }

    pub fn extent(&self) -> usize {
        self.extent
    }

    pub fn workers(&self) -> usize {
        self.spans.len()
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn span(&self, rank: usize) -> Result<Span> {
        self.spans.get(rank).copied().ok_or_else(|| {
            PdcrError::invalid_domain(format!(
                "rank {rank} is outside a group of {} workers",
                self.spans.len()
            ))
        })
    }

    /// `(rank, span)` pairs in rank order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Span)> + '_ {
        self.spans.iter().copied().enumerate()
    }

    /// Per-rank element counts (MPI `sendcounts`).
    pub fn counts(&self) -> Vec<usize> {
        self.spans.iter().map(|span| span.len).collect()
    }

    /// Per-rank starting offsets (MPI `displs`).
    pub fn displacements(&self) -> Vec<usize> {
        self.spans.iter().map(|span| span.offset).collect()
    }

    /// Rank owning a global index.
    pub fn owner_of(&self, index: usize) -> Option<usize> {
        if index >= self.extent {
            return None;
        }
        // Spans are sorted and contiguous, so the owner is the last span
        // starting at or before `index` that is non-empty.
        let candidate = self.spans.partition_point(|span| span.offset <= index);
        self.spans[..candidate]
            .iter()
            .rposition(|span| span.contains(index))
    }

    /// Element partition of a row-major buffer whose units are `unit`
    /// elements wide (rows of an image, frames of an animation).
    pub fn scaled(&self, unit: usize) -> Partition {
        Partition {
            extent: self.extent * unit,
            spans: self
                .spans
                .iter()
                .map(|span| Span::new(span.offset * unit, span.len * unit))
                .collect(),
        }
    }

    pub fn check_extent(&self, len: usize) -> Result<()> {
        if len == self.extent {
            Ok(())
        } else {
            Err(PdcrError::mismatch(format!(
                "buffer holds {len} elements but the partition covers {}",
                self.extent
            )))
        }
    }

    /// True when this value is exactly what `partition(extent, workers)`
    /// produces.
    pub fn is_canonical(&self) -> bool {
        !self.spans.is_empty()
            && partition(self.extent, self.spans.len())
                .map(|canonical| canonical == *self)
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pairs(p: &Partition) -> Vec<(usize, usize)> {
        p.spans().iter().map(|s| (s.offset, s.len)).collect()
    }

    #[test]
    fn ten_over_three_front_loads_remainder() {
        let p = partition(10, 3).unwrap();
        assert_eq!(pairs(&p), vec![(0, 4), (4, 3), (7, 3)]);
    }

    #[test]
    fn seven_over_seven_is_unit_spans() {
        let p = partition(7, 7).unwrap();
        let expected: Vec<_> = (0..7).map(|i| (i, 1)).collect();
        assert_eq!(pairs(&p), expected);
    }

    #[test]
    fn ten_over_four() {
        let p = partition(10, 4).unwrap();
        assert_eq!(pairs(&p), vec![(0, 3), (3, 3), (6, 2), (8, 2)]);
    }

    #[test]
    fn zero_workers_is_invalid() {
        assert!(matches!(partition(10, 0), Err(PdcrError::InvalidDomain(_))));
    }

    #[test]
    fn empty_extent_gives_empty_spans_at_zero() {
        let p = partition(0, 5).unwrap();
        assert_eq!(p.workers(), 5);
        assert!(p.spans().iter().all(|s| s.offset == 0 && s.is_empty()));
    }

    #[test]
    fn single_worker_takes_everything() {
        let p = partition(42, 1).unwrap();
        assert_eq!(pairs(&p), vec![(0, 42)]);
    }

    #[test]
    fn more_workers_than_units() {
        let p = partition(2, 4).unwrap();
        assert_eq!(pairs(&p), vec![(0, 1), (1, 1), (2, 0), (2, 0)]);
        assert_eq!(p.owner_of(1), Some(1));
        assert_eq!(p.owner_of(2), None);
    }

    #[test]
    fn counts_and_displacements_match_spans() {
        let p = partition(12, 5).unwrap();
        assert_eq!(p.counts(), vec![3, 3, 2, 2, 2]);
        assert_eq!(p.displacements(), vec![0, 3, 6, 8, 10]);
    }

    #[test]
    fn scaled_partition_covers_rows() {
        let rows = partition(5, 2).unwrap();
        let elements = rows.scaled(4);
        assert_eq!(elements.extent(), 20);
        assert_eq!(pairs(&elements), vec![(0, 12), (12, 8)]);
        assert_eq!(elements.owner_of(11), Some(0));
        assert_eq!(elements.owner_of(12), Some(1));
        assert!(!elements.is_canonical());
    }

    #[test]
    fn span_out_of_range_is_rejected() {
        let p = partition(4, 2).unwrap();
        assert!(p.span(2).is_err());
    }

    #[test]
    fn tampered_partition_is_not_canonical() {
        let mut p = partition(10, 3).unwrap();
        p.spans[2] = Span::new(7, 3);
        assert!(p.is_canonical());
        p.spans[0] = Span::new(0, 3);
        p.spans[1] = Span::new(3, 4);
        assert!(!p.is_canonical());
    }

    #[test]
    fn check_extent_reports_mismatch() {
        let p = partition(6, 2).unwrap();
        assert!(p.check_extent(6).is_ok());
        assert!(matches!(p.check_extent(5), Err(PdcrError::PartitionMismatch(_))));
    }

    proptest! {
        #[test]
        fn partition_invariants(n in 0usize..10_000, p in 1usize..64) {
            let part = partition(n, p).unwrap();

            prop_assert_eq!(part.workers(), p);
            prop_assert_eq!(part.spans().iter().map(|s| s.len).sum::<usize>(), n);
            prop_assert_eq!(part.spans()[0].offset, 0);
            for w in part.spans().windows(2) {
                prop_assert_eq!(w[1].offset, w[0].end());
            }

            let max = part.spans().iter().map(|s| s.len).max().unwrap();
            let min = part.spans().iter().map(|s| s.len).min().unwrap();
            prop_assert!(max - min <= 1);
        }

        #[test]
        fn remainder_goes_to_low_ranks(n in 0usize..10_000, p in 1usize..64) {
            let part = partition(n, p).unwrap();
            let base = n / p;
            for (rank, span) in part.iter() {
                let expected = if rank < n % p { base + 1 } else { base };
                prop_assert_eq!(span.len, expected);
            }
        }

        #[test]
        fn partition_is_idempotent(n in 0usize..10_000, p in 1usize..64) {
            prop_assert_eq!(partition(n, p).unwrap(), partition(n, p).unwrap());
        }

        #[test]
        fn owner_of_agrees_with_spans(n in 1usize..2_000, p in 1usize..32, pick in 0usize..2_000) {
            let part = partition(n, p).unwrap();
            let index = pick % n;
            let owner = part.owner_of(index).unwrap();
            prop_assert!(part.span(owner).unwrap().contains(index));
        }
    }
}
