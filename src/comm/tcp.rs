//! TCP transport: the coordinator listens, workers connect, and every frame
//! travels over the coordinator-worker stream.
//!
//! Ranks are handed out in the order workers connect. The handshake is a
//! `Hello { rank, size }` from the coordinator echoed back by the worker.

use std::io::{BufReader, BufWriter};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use super::{read_frame, write_frame, Frame, Hello, Tag, Transport};
use crate::collective::COORDINATOR;
use crate::config::TcpConfig;
use crate::error::{ChannelError, PdcrError, Result};

struct Link {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Link {
    fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        })
    }
}

pub struct TcpTransport {
    rank: usize,
    size: usize,
    links: Vec<Option<Link>>,
    max_frame: u64,
}

impl TcpTransport {
    /// Binds `config.address` and waits for `size - 1` workers.
    pub fn listen(config: &TcpConfig, size: usize) -> Result<Self> {
        let listener = TcpListener::bind(&config.address)?;
        info!("coordinator listening on {} for {} workers", config.address, size.saturating_sub(1));
        Self::accept_on(&listener, size, config.max_frame_bytes)
    }

    /// Accepts `size - 1` workers on an already bound listener.
    pub fn accept_on(listener: &TcpListener, size: usize, max_frame: u64) -> Result<Self> {
        if size == 0 {
            return Err(PdcrError::invalid_domain("a group needs at least one rank"));
        }

        let mut links: Vec<Option<Link>> = (0..size).map(|_| None).collect();
        for rank in 1..size {
            let (stream, peer_addr) = listener.accept()?;
            let mut link = Link::new(stream)?;

            let hello = Hello { rank, size };
            write_frame(&mut link.writer, &Frame::encode(Tag::Hello, COORDINATOR, &hello)?)?;
            let reply = read_frame(&mut link.reader, rank, max_frame)?;
            if reply.tag != Tag::Hello || reply.decode::<Hello>()? != hello {
                return Err(PdcrError::protocol(format!(
                    "worker at {peer_addr} did not confirm rank {rank}"
                )));
            }

            info!("worker at {peer_addr} joined as rank {rank}");
            links[rank] = Some(link);
        }

        Ok(Self {
            rank: COORDINATOR,
            size,
            links,
            max_frame,
        })
    }

    /// Connects to the coordinator at `config.address`, retrying a bounded
    /// number of times, and learns this worker's rank.
    pub fn connect(config: &TcpConfig) -> Result<Self> {
        let delay = Duration::from_millis(config.retry_delay_ms);
        let stream = connect_with_retries(&config.address, config.connect_retries, delay)?;
        let mut link = Link::new(stream)?;

        let frame = read_frame(&mut link.reader, COORDINATOR, config.max_frame_bytes)?;
        if frame.tag != Tag::Hello {
            return Err(ChannelError::UnexpectedTag {
                peer: COORDINATOR,
                expected: Tag::Hello,
                got: frame.tag,
            }
            .into());
        }
        let hello: Hello = frame.decode()?;
        if hello.rank == COORDINATOR || hello.rank >= hello.size {
            return Err(PdcrError::protocol(format!(
                "coordinator assigned rank {} in a group of {}",
                hello.rank, hello.size
            )));
        }
        write_frame(&mut link.writer, &Frame::encode(Tag::Hello, hello.rank, &hello)?)?;
        info!("joined {} as rank {} of {}", config.address, hello.rank, hello.size);

        let mut links: Vec<Option<Link>> = (0..hello.size).map(|_| None).collect();
        links[COORDINATOR] = Some(link);
        Ok(Self {
            rank: hello.rank,
            size: hello.size,
            links,
            max_frame: config.max_frame_bytes,
        })
    }

    fn link(&mut self, peer: usize) -> Result<&mut Link, ChannelError> {
        let rank = self.rank;
        self.links
            .get_mut(peer)
            .and_then(Option::as_mut)
            .ok_or_else(|| {
                ChannelError::Protocol(format!("rank {rank} has no link to rank {peer}"))
            })
    }
}

fn connect_with_retries<A: ToSocketAddrs + std::fmt::Display>(
    address: A,
    retries: u32,
    delay: Duration,
) -> Result<TcpStream> {
    let mut attempt = 0;
    loop {
        match TcpStream::connect(&address) {
            Ok(stream) => return Ok(stream),
            Err(err) if attempt < retries => {
                attempt += 1;
                warn!("connect to {address} failed ({err}), retry {attempt}/{retries}");
                thread::sleep(delay);
            }
            Err(err) => return Err(err.into()),
        }
    }
}

impl Transport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&mut self, to: usize, frame: Frame) -> Result<(), ChannelError> {
        debug!("rank {} -> {to}: {:?} ({} bytes)", self.rank, frame.tag, frame.payload.len());
        let link = self.link(to)?;
        write_frame(&mut link.writer, &frame).map_err(|err| match err {
            ChannelError::Io(_) => ChannelError::Disconnected { peer: to },
            other => other,
        })
    }

    fn recv(&mut self, from: usize) -> Result<Frame, ChannelError> {
        let max = self.max_frame;
        let link = self.link(from)?;
        read_frame(&mut link.reader, from, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::Collective;
    use crate::comm::Communicator;
    use crate::error::first_cause;
    use crate::partition::partition;
    use crate::reduce::ReduceOp;
    use crate::round::scatter_compute_gather;
    use crate::runner::{elementwise, ComputeError, WorkerContext};

    fn loopback() -> (TcpListener, TcpConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = TcpConfig {
            address: listener.local_addr().unwrap().to_string(),
            ..TcpConfig::default()
        };
        (listener, config)
    }

    /// Coordinator on the calling thread, workers on scoped threads. Returns
    /// every participant's outcome, the coordinator's first.
    fn tcp_outcomes<R, F>(size: usize, body: F) -> Vec<Result<(usize, R)>>
    where
        R: Send,
        F: Fn(&mut Communicator<TcpTransport>) -> Result<R> + Sync,
    {
        let (listener, config) = loopback();
        thread::scope(|scope| {
            let workers: Vec<_> = (1..size)
                .map(|_| {
                    let (config, body) = (&config, &body);
                    scope.spawn(move || -> Result<(usize, R)> {
                        let mut comm = Communicator::new(TcpTransport::connect(config)?);
                        let rank = comm.rank();
                        comm.run(|c| body(c)).map(|value| (rank, value))
                    })
                })
                .collect();

            let coordinator = TcpTransport::accept_on(&listener, size, config.max_frame_bytes)
                .and_then(|transport| {
                    let mut comm = Communicator::new(transport);
                    comm.run(|c| body(c)).map(|value| (COORDINATOR, value))
                });
            let mut outcomes = vec![coordinator];
            outcomes.extend(workers.into_iter().map(|handle| handle.join().unwrap()));
            outcomes
        })
    }

    /// Every rank's value in rank order, or the round's root cause.
    fn run_tcp<R, F>(size: usize, body: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(&mut Communicator<TcpTransport>) -> Result<R> + Sync,
    {
        let mut ranked = first_cause(tcp_outcomes(size, body))?;
        ranked.sort_by_key(|(rank, _)| *rank);
        Ok(ranked.into_iter().map(|(_, value)| value).collect())
    }

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
    fn handshake_assigns_distinct_ranks() {
        let ranks = run_tcp(4, |c| Ok((c.rank(), c.size()))).unwrap();
        assert_eq!(ranks, vec![(0, 4), (1, 4), (2, 4), (3, 4)]);
    }

    #[test]
    fn all_reduce_over_loopback() {
        let locals = [5i32, 2, 9, 2];
        let seen = run_tcp(4, |c| c.all_reduce(locals[c.rank()], ReduceOp::Min)).unwrap();
        assert_eq!(seen, vec![2; 4]);
    }

    #[test]
    fn scatter_gather_over_loopback() {
        let global: Vec<f64> = (0..29).map(|i| i as f64 / 4.0).collect();
        let p = partition(global.len(), 3).unwrap();
        let results = run_tcp(3, |c| {
            let input = c.is_coordinator().then_some(global.as_slice());
            let local = c.scatter(input, &p)?;
            c.gather(&local, &p)
        })
        .unwrap();
        assert_eq!(results[0].as_deref(), Some(global.as_slice()));
    }

    #[test]
    fn identity_round_over_loopback() {
        let input: Vec<i32> = (0..41).map(|i| i * 3 - 20).collect();
        let results = run_tcp(4, |c| {
            let global = c.is_coordinator().then_some(input.as_slice());
            scatter_compute_gather(c, global, elementwise(|x: &i32| Ok(*x)))
        })
        .unwrap();
        assert_eq!(results[0].as_deref(), Some(input.as_slice()));
        assert!(results[1..].iter().all(Option::is_none));
    }

    #[test]
    fn worker_failure_reaches_every_rank_over_loopback() {
        let input: Vec<i32> = (0..10).collect();
        let outcomes = tcp_outcomes(4, |c| {
            let global = c.is_coordinator().then_some(input.as_slice());
            scatter_compute_gather(c, global, fail_at_seven)
        });

        assert_eq!(outcomes.len(), 4);
        for outcome in outcomes {
            let err = outcome.unwrap_err();
            assert!(matches!(err, PdcrError::WorkerCompute(_)), "{err}");
            let failure = err.worker_failure().unwrap();
            assert_eq!((failure.rank, failure.index), (2, 7));
        }
    }

    #[test]
    fn oversized_frames_are_refused() {
        let (listener, mut config) = loopback();
        config.max_frame_bytes = 64;
        let err = thread::scope(|scope| {
            let worker = scope.spawn(|| -> Result<()> {
                let mut comm = Communicator::new(TcpTransport::connect(&config)?);
                comm.run(|c| c.broadcast::<Vec<u64>>(None).map(drop))
            });
            let coordinator = TcpTransport::accept_on(&listener, 2, 1 << 20).and_then(|transport| {
                let mut comm = Communicator::new(transport);
                comm.broadcast(Some(vec![7u64; 64])).map(drop)
            });
            assert!(coordinator.is_ok());
            worker.join().unwrap()
        })
        .unwrap_err();
        assert!(matches!(err, PdcrError::Channel(ChannelError::FrameTooLarge { max: 64, .. })));
    }

    #[test]
    fn connect_gives_up_after_retries() {
        let (listener, mut config) = loopback();
        drop(listener);
        config.connect_retries = 1;
        config.retry_delay_ms = 1;
        assert!(TcpTransport::connect(&config).is_err());
    }
}
