//! Message-passing mode.
//!
//! Ranks share nothing; data moves only through the collectives on
//! [`Communicator`], which routes everything through the coordinator (a star
//! around rank 0). A participant that fails sends an abort notice so every
//! other participant leaves the round with the same error.

mod frame;
pub mod local;
pub mod tcp;

pub use frame::{read_frame, write_frame, AbortNotice, Frame, Hello, SpanChunk, Tag};
pub use local::{local_group, run_local, LocalTransport};
pub use tcp::TcpTransport;

use log::{debug, warn};
use serde::Serialize;

use crate::collect::collect;
use crate::collective::{check_group, check_local, Collective, Wire, COORDINATOR};
use crate::error::{ChannelError, PdcrError, Result};
use crate::partition::Partition;
use crate::reduce::{self, ReduceOp, Reducible};

/// Point-to-point frame delivery between ranks. Frames between one pair of
/// ranks arrive in the order they were sent.
pub trait Transport: Send {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn send(&mut self, to: usize, frame: Frame) -> Result<(), ChannelError>;

    fn recv(&mut self, from: usize) -> Result<Frame, ChannelError>;
}

pub struct Communicator<T: Transport> {
    transport: T,
    aborted: bool,
}

impl<T: Transport> Communicator<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            aborted: false,
        }
    }

    /// Runs one participant's part of a round. A local failure is announced
    /// to the other participants before it is returned.
    pub fn run<R>(&mut self, body: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let outcome = body(self);
        if let Err(err) = &outcome {
            if !self.aborted {
                self.abort(err);
            }
        }
        outcome
    }

    /// Best-effort abort notice: a worker tells the coordinator, the
    /// coordinator tells every worker.
    pub fn abort(&mut self, err: &PdcrError) {
        let rank = self.rank();
        warn!("rank {rank} aborting the round: {err}");
        self.aborted = true;

        let notice = AbortNotice::from_error(rank, err);
        let frame = match Frame::encode(Tag::Abort, rank, &notice) {
            Ok(frame) => frame,
            Err(encode_err) => {
                warn!("could not encode abort notice: {encode_err}");
                return;
            }
        };

        let targets: Vec<usize> = if self.is_coordinator() {
            (0..self.size()).filter(|&peer| peer != COORDINATOR).collect()
        } else {
            vec![COORDINATOR]
        };
        for peer in targets {
            if let Err(send_err) = self.transport.send(peer, frame.clone()) {
                debug!("abort notice to rank {peer} not delivered: {send_err}");
            }
        }
    }

    fn send_value<V: Serialize>(&mut self, to: usize, tag: Tag, value: &V) -> Result<()> {
        let frame = Frame::encode(tag, self.rank(), value)?;
        self.transport.send(to, frame)?;
        Ok(())
    }

    fn send_to_workers<V: Serialize>(&mut self, tag: Tag, value: &V) -> Result<()> {
        let frame = Frame::encode(tag, self.rank(), value)?;
        for peer in (0..self.size()).filter(|&peer| peer != COORDINATOR) {
            self.transport.send(peer, frame.clone())?;
        }
        Ok(())
    }

    /// Receives the next frame from `from`, turning an abort notice into the
    /// error it carries.
    fn recv_tagged(&mut self, from: usize, tag: Tag) -> Result<Frame> {
        let frame = self.transport.recv(from)?;
        if frame.tag == Tag::Abort {
            self.aborted = true;
            let notice: AbortNotice = frame.decode()?;
            debug!("rank {} received abort from rank {}", self.rank(), notice.origin);
            if self.is_coordinator() {
                // Forward so the remaining workers stop as well.
                let err = notice.clone().into_error();
                self.forward_abort(&notice, from);
                return Err(err);
            }
            return Err(notice.into_error());
        }
        if frame.tag != tag {
            return Err(ChannelError::UnexpectedTag {
                peer: from,
                expected: tag,
                got: frame.tag,
            }
            .into());
        }
        Ok(frame)
    }

    fn forward_abort(&mut self, notice: &AbortNotice, origin: usize) {
        let Ok(frame) = Frame::encode(Tag::Abort, self.rank(), notice) else {
            return;
        };
        for peer in (0..self.size()).filter(|&peer| peer != COORDINATOR && peer != origin) {
            if let Err(err) = self.transport.send(peer, frame.clone()) {
                debug!("forwarded abort to rank {peer} not delivered: {err}");
            }
        }
    }
}

impl<T: Transport> Collective for Communicator<T> {
    fn rank(&self) -> usize {
        self.transport.rank()
    }

    fn size(&self) -> usize {
        self.transport.size()
    }

    fn barrier(&mut self) -> Result<()> {
        if self.is_coordinator() {
            for peer in 1..self.size() {
                self.recv_tagged(peer, Tag::Barrier)?;
            }
            self.send_to_workers(Tag::Barrier, &())
        } else {
            self.send_value(COORDINATOR, Tag::Barrier, &())?;
            self.recv_tagged(COORDINATOR, Tag::Barrier)?;
            Ok(())
        }
    }

    fn broadcast<V: Wire>(&mut self, value: Option<V>) -> Result<V> {
        if self.is_coordinator() {
            let value = value.ok_or_else(|| {
                PdcrError::protocol("the coordinator must supply the broadcast value")
            })?;
            self.send_to_workers(Tag::Broadcast, &value)?;
            Ok(value)
        } else {
            Ok(self.recv_tagged(COORDINATOR, Tag::Broadcast)?.decode()?)
        }
    }

    fn scatter<V: Wire>(&mut self, global: Option<&[V]>, partition: &Partition) -> Result<Vec<V>> {
        check_group(partition, self.size())?;

        if self.is_coordinator() {
            let global = global.ok_or_else(|| {
                PdcrError::protocol("the coordinator must supply the global buffer")
            })?;
            partition.check_extent(global.len())?;
            for (peer, span) in partition.iter().filter(|&(peer, _)| peer != COORDINATOR) {
                let chunk = SpanChunk {
                    span,
                    data: global[span.range()].to_vec(),
                };
                self.send_value(peer, Tag::Scatter, &chunk)?;
            }
            return Ok(global[partition.span(COORDINATOR)?.range()].to_vec());
        }

        let chunk: SpanChunk<V> = self.recv_tagged(COORDINATOR, Tag::Scatter)?.decode()?;
        let expected = partition.span(self.rank())?;
        if chunk.span != expected || chunk.data.len() != expected.len {
            return Err(PdcrError::mismatch(format!(
                "rank {} received span {:?} with {} elements but its partition assigns {:?}",
                self.rank(),
                chunk.span,
                chunk.data.len(),
                expected
            )));
        }
        Ok(chunk.data)
    }

    fn gather<V: Wire>(&mut self, local: &[V], partition: &Partition) -> Result<Option<Vec<V>>> {
        check_group(partition, self.size())?;
        check_local(partition, self.rank(), local.len())?;

        if !self.is_coordinator() {
            let chunk = SpanChunk {
                span: partition.span(self.rank())?,
                data: local.to_vec(),
            };
            self.send_value(COORDINATOR, Tag::Gather, &chunk)?;
            // The acknowledgement tells this worker the round completed.
            self.recv_tagged(COORDINATOR, Tag::Gather)?;
            return Ok(None);
        }

        let mut parts = Vec::with_capacity(self.size());
        parts.push((COORDINATOR, local.to_vec()));
        for peer in 1..self.size() {
            let chunk: SpanChunk<V> = self.recv_tagged(peer, Tag::Gather)?.decode()?;
            let expected = partition.span(peer)?;
            if chunk.span != expected {
                return Err(PdcrError::mismatch(format!(
                    "rank {peer} returned span {:?} but the round partition assigns {:?}",
                    chunk.span, expected
                )));
            }
            parts.push((peer, chunk.data));
        }

        let global = collect(parts, partition)?;
        self.send_to_workers(Tag::Gather, &())?;
        Ok(Some(global))
    }

    fn all_gather<V: Wire>(&mut self, local: &[V], partition: &Partition) -> Result<Vec<V>> {
        let gathered = self.gather(local, partition)?;
        self.broadcast(gathered)
    }

    fn all_reduce<S: Reducible + Wire>(&mut self, local: S, op: ReduceOp) -> Result<S> {
        if !self.is_coordinator() {
            self.send_value(COORDINATOR, Tag::Reduce, &local)?;
            return Ok(self.recv_tagged(COORDINATOR, Tag::Reduce)?.decode()?);
        }

        let mut values = Vec::with_capacity(self.size());
        values.push(local);
        for peer in 1..self.size() {
            values.push(self.recv_tagged(peer, Tag::Reduce)?.decode()?);
        }
        let combined = reduce::fold(values, op)?;
        self.send_to_workers(Tag::Reduce, &combined)?;
        Ok(combined)
    }
}
