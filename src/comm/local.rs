//! In-process transport: each rank is a thread, each coordinator-worker pair
//! a pair of crossbeam channels.

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, info};

use super::{Communicator, Frame, Transport};
use crate::collective::COORDINATOR;
use crate::error::{first_cause, ChannelError, PdcrError, Result};

struct Link {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
}

pub struct LocalTransport {
    rank: usize,
    size: usize,
    links: Vec<Option<Link>>,
}

impl LocalTransport {
    fn link(&self, peer: usize) -> Result<&Link, ChannelError> {
        self.links
            .get(peer)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                ChannelError::Protocol(format!("rank {} has no link to rank {peer}", self.rank))
            })
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&mut self, to: usize, frame: Frame) -> Result<(), ChannelError> {
        debug!("rank {} -> {to}: {:?}", self.rank, frame.tag);
        self.link(to)?
            .tx
            .send(frame)
            .map_err(|_| ChannelError::Disconnected { peer: to })
    }

    fn recv(&mut self, from: usize) -> Result<Frame, ChannelError> {
        self.link(from)?
            .rx
            .recv()
            .map_err(|_| ChannelError::Disconnected { peer: from })
    }
}

/// Builds the transports for a star of `size` in-process ranks, rank order.
pub fn local_group(size: usize) -> Result<Vec<LocalTransport>> {
    if size == 0 {
        return Err(PdcrError::invalid_domain("a group needs at least one rank"));
    }

    let mut transports: Vec<LocalTransport> = (0..size)
        .map(|rank| LocalTransport {
            rank,
            size,
            links: (0..size).map(|_| None).collect(),
        })
        .collect();

    for worker in 1..size {
        let (to_worker, from_coordinator) = unbounded();
        let (to_coordinator, from_worker) = unbounded();
        transports[COORDINATOR].links[worker] = Some(Link {
            tx: to_worker,
            rx: from_worker,
        });
        transports[worker].links[COORDINATOR] = Some(Link {
            tx: to_coordinator,
            rx: from_coordinator,
        });
    }
    Ok(transports)
}

/// Runs `body` on `size` in-process ranks, each on its own thread, and
/// returns every rank's result in rank order or the round's root cause.
pub fn run_local<R, F>(size: usize, body: F) -> Result<Vec<R>>
where
    R: Send,
    F: Fn(&mut Communicator<LocalTransport>) -> Result<R> + Sync,
{
    let transports = local_group(size)?;
    info!("local message-passing round on {size} ranks");

    let outcomes: Vec<Result<R>> = thread::scope(|scope| {
        let body = &body;
        let handles: Vec<_> = transports
            .into_iter()
            .map(|transport| {
                let rank = transport.rank;
                thread::Builder::new()
                    .name(format!("pdcr-rank-{rank}"))
                    .spawn_scoped(scope, move || run_rank(Communicator::new(transport), body))
                    .map_err(PdcrError::from)
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle?.join().unwrap_or_else(|_| {
                    Err(ChannelError::PeerLost {
                        rank,
                        reason: "thread panicked".into(),
                    }
                    .into())
                })
            })
            .collect()
    });

    first_cause(outcomes)
}

fn run_rank<R, F>(mut comm: Communicator<LocalTransport>, body: &F) -> Result<R>
where
    F: Fn(&mut Communicator<LocalTransport>) -> Result<R>,
{
    let rank = comm.transport.rank;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| comm.run(|c| body(c))));
    match outcome {
        Ok(result) => result,
        Err(_) => {
            let err = PdcrError::from(ChannelError::PeerLost {
                rank,
                reason: "rank panicked".into(),
            });
            if !comm.aborted {
                comm.abort(&err);
            }
            Err(err)
        }
    }
}
