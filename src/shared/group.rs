//! Multi-phase shared-memory rounds.
//!
//! A `ThreadGroup` runs one scoped OS thread per rank. Members meet at
//! barriers between phases (a wave timestep needs every band of the previous
//! two frames) and exchange values through per-rank slots. When a member
//! fails, the barrier is broken so no peer waits forever.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use log::{debug, info, warn};

use crate::collect::collect;
use crate::collective::{check_group, check_local, Collective, Wire, COORDINATOR};
use crate::error::{first_cause, ChannelError, PdcrError, Result};
use crate::partition::Partition;
use crate::reduce::{self, ReduceOp, Reducible};

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    aborted_by: Option<usize>,
}

/// A reusable barrier that a failing member can break.
struct PhaseBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl PhaseBarrier {
    fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait(&self) -> Result<()> {
        let mut state = self.lock();
        if let Some(by) = state.aborted_by {
            return Err(aborted(by));
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.released.notify_all();
            return Ok(());
        }

        while state.generation == generation && state.aborted_by.is_none() {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        match state.aborted_by {
            Some(by) if state.generation == generation => Err(aborted(by)),
            _ => Ok(()),
        }
    }

    fn abort(&self, rank: usize) {
        let mut state = self.lock();
        if state.aborted_by.is_none() {
            state.aborted_by = Some(rank);
        }
        self.released.notify_all();
    }
}

fn aborted(by: usize) -> PdcrError {
    ChannelError::Aborted {
        by,
        reason: "a peer in the thread group failed".into(),
    }
    .into()
}

type Slot = Option<Box<dyn Any + Send>>;

struct GroupSync {
    barrier: PhaseBarrier,
    slots: Mutex<Vec<Slot>>,
}

impl GroupSync {
    fn new(size: usize) -> Self {
        Self {
            barrier: PhaseBarrier::new(size),
            slots: Mutex::new((0..size).map(|_| None).collect()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn put<V: Send + 'static>(&self, rank: usize, value: V) {
        self.slots()[rank] = Some(Box::new(value));
    }

    fn read<V: Clone + 'static>(slots: &[Slot], rank: usize) -> Result<V> {
        slots[rank]
            .as_ref()
            .and_then(|slot| slot.downcast_ref::<V>())
            .cloned()
            .ok_or_else(|| {
                PdcrError::protocol(format!("rank {rank} did not contribute a matching value"))
            })
    }
}

/// A fixed-size group of worker threads.
#[derive(Debug, Clone, Copy)]
pub struct ThreadGroup {
    size: usize,
}

impl ThreadGroup {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(PdcrError::invalid_domain("a thread group needs at least one member"));
        }
        Ok(Self { size })
    }

    /// Runs `body` once per rank on its own thread and waits for all of them.
    ///
    /// Returns every member's result in rank order, or the error that made
    /// the round abort.
    pub fn run<R, F>(&self, body: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(&mut Member<'_>) -> Result<R> + Sync,
    {
        let sync = GroupSync::new(self.size);
        info!("thread group of {} members starting", self.size);

        let outcomes: Vec<Result<R>> = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.size);
            for rank in 0..self.size {
                let sync = &sync;
                let body = &body;
                let spawned = thread::Builder::new()
                    .name(format!("pdcr-member-{rank}"))
                    .spawn_scoped(scope, move || run_member(rank, self.size, sync, body));
                match spawned {
                    Ok(handle) => handles.push(Ok(handle)),
                    Err(err) => {
                        sync.barrier.abort(rank);
                        handles.push(Err(PdcrError::from(err)));
                    }
                }
            }

            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| match handle {
                    Ok(handle) => handle.join().unwrap_or_else(|_| {
                        Err(ChannelError::PeerLost {
                            rank,
                            reason: "thread panicked".into(),
                        }
                        .into())
                    }),
                    Err(err) => Err(err),
                })
                .collect()
        });

        first_cause(outcomes)
    }
}

fn run_member<R, F>(rank: usize, size: usize, sync: &GroupSync, body: &F) -> Result<R>
where
    F: Fn(&mut Member<'_>) -> Result<R>,
{
    let mut member = Member { rank, size, sync };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&mut member))).unwrap_or_else(|_| {
        Err(ChannelError::PeerLost {
            rank,
            reason: "member panicked".into(),
        }
        .into())
    });

    if let Err(err) = &outcome {
        if !err.is_abort_echo() {
            warn!("member {rank} failed, aborting the group: {err}");
        }
        sync.barrier.abort(rank);
    }
    debug!("member {rank} finished");
    outcome
}

/// One rank's handle on its group during `ThreadGroup::run`.
pub struct Member<'g> {
    rank: usize,
    size: usize,
    sync: &'g GroupSync,
}

impl Collective for Member<'_> {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&mut self) -> Result<()> {
        self.sync.barrier.wait()
    }

    fn broadcast<V: Wire>(&mut self, value: Option<V>) -> Result<V> {
        if self.is_coordinator() {
            let value = value.ok_or_else(|| {
                PdcrError::protocol("the coordinator must supply the broadcast value")
            })?;
            self.sync.put(self.rank, value);
        }
        self.barrier()?;
        let value = GroupSync::read::<V>(&self.sync.slots(), COORDINATOR);
        self.barrier()?;
        value
    }

    fn scatter<V: Wire>(&mut self, global: Option<&[V]>, partition: &Partition) -> Result<Vec<V>> {
        check_group(partition, self.size)?;
        if self.is_coordinator() {
            let global = global.ok_or_else(|| {
                PdcrError::protocol("the coordinator must supply the global buffer")
            })?;
            partition.check_extent(global.len())?;
            self.sync.put(self.rank, global.to_vec());
        }
        self.barrier()?;

        let span = partition.span(self.rank)?;
        let local = {
            let slots = self.sync.slots();
            slots[COORDINATOR]
                .as_ref()
                .and_then(|slot| slot.downcast_ref::<Vec<V>>())
                .map(|global| global[span.range()].to_vec())
                .ok_or_else(|| {
                    PdcrError::protocol("the coordinator did not publish a matching buffer")
                })
        };
        self.barrier()?;
        local
    }

    fn gather<V: Wire>(&mut self, local: &[V], partition: &Partition) -> Result<Option<Vec<V>>> {
        check_group(partition, self.size)?;
        check_local(partition, self.rank, local.len())?;
        self.sync.put(self.rank, local.to_vec());
        self.barrier()?;

        let global = if self.is_coordinator() {
            let slots = self.sync.slots();
            let parts = (0..self.size)
                .map(|rank| GroupSync::read::<Vec<V>>(&slots, rank).map(|part| (rank, part)))
                .collect::<Result<Vec<_>>>()?;
            Some(collect(parts, partition)?)
        } else {
            None
        };
        self.barrier()?;
        Ok(global)
    }

    fn all_gather<V: Wire>(&mut self, local: &[V], partition: &Partition) -> Result<Vec<V>> {
        check_group(partition, self.size)?;
        check_local(partition, self.rank, local.len())?;
        self.sync.put(self.rank, local.to_vec());
        self.barrier()?;

        let global = {
            let slots = self.sync.slots();
            (0..self.size)
                .map(|rank| GroupSync::read::<Vec<V>>(&slots, rank).map(|part| (rank, part)))
                .collect::<Result<Vec<_>>>()
                .and_then(|parts| collect(parts, partition))
        };
        self.barrier()?;
        global
    }

    fn all_reduce<S: Reducible + Wire>(&mut self, local: S, op: ReduceOp) -> Result<S> {
        self.sync.put(self.rank, local);
        self.barrier()?;

        let combined = {
            let slots = self.sync.slots();
            (0..self.size)
                .map(|rank| GroupSync::read::<S>(&slots, rank))
                .collect::<Result<Vec<S>>>()
                .and_then(|values| reduce::fold(values, op))
        };
        self.barrier()?;
        combined
    }
}
