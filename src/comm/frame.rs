//! Frames exchanged between ranks.
//!
//! On byte streams a frame is a little-endian `u64` length followed by the
//! bincode encoding of the frame. Payloads are bincode too.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, PdcrError, WorkerFailure};
use crate::partition::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    Hello,
    Broadcast,
    Scatter,
    Gather,
    Reduce,
    Barrier,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub tag: Tag,
    pub from: usize,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn encode<V: Serialize>(tag: Tag, from: usize, value: &V) -> Result<Self, ChannelError> {
        Ok(Self {
            tag,
            from,
            payload: bincode::serialize(value)?,
        })
    }

    pub fn decode<V: DeserializeOwned>(&self) -> Result<V, ChannelError> {
        Ok(bincode::deserialize(&self.payload)?)
    }
}

/// Rank assignment sent by the coordinator during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub rank: usize,
    pub size: usize,
}

/// One rank's slice, tagged with the span it belongs to so the receiver can
/// check it against its own copy of the partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanChunk<V> {
    pub span: Span,
    pub data: Vec<V>,
}

/// Sent when a participant fails, so every other participant stops too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortNotice {
    pub origin: usize,
    pub failure: Option<WorkerFailure>,
    pub reason: String,
}

impl AbortNotice {
    pub fn from_error(origin: usize, err: &PdcrError) -> Self {
        Self {
            origin,
            failure: err.worker_failure().cloned(),
            reason: err.to_string(),
        }
    }

    /// The error a receiver reports: the worker failure that started the
    /// abort if there was one, an abort otherwise.
    pub fn into_error(self) -> PdcrError {
        match self.failure {
            Some(failure) => PdcrError::WorkerCompute(failure),
            None => ChannelError::Aborted {
                by: self.origin,
                reason: self.reason,
            }
            .into(),
        }
    }
}

pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), ChannelError> {
    let bytes = bincode::serialize(frame)?;
    writer.write_all(&(bytes.len() as u64).to_le_bytes())?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame, refusing anything longer than `max_len` bytes. A clean
/// end of stream is reported as `Disconnected { peer }`.
pub fn read_frame<R: Read>(
    reader: &mut R,
    peer: usize,
    max_len: u64,
) -> Result<Frame, ChannelError> {
    let mut len_bytes = [0u8; 8];
    reader.read_exact(&mut len_bytes).map_err(|err| eof_as_disconnect(err, peer))?;

    let len = u64::from_le_bytes(len_bytes);
    if len > max_len {
        return Err(ChannelError::FrameTooLarge { len, max: max_len });
    }

    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes).map_err(|err| eof_as_disconnect(err, peer))?;
    Ok(bincode::deserialize(&bytes)?)
}

fn eof_as_disconnect(err: io::Error, peer: usize) -> ChannelError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => {
            ChannelError::Disconnected { peer }
        }
        _ => ChannelError::Io(err),
    }
}
