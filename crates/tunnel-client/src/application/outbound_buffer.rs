//! Bytes read from the serial port that have not reached the server yet.
//!
//! # Delivery rules
//!
//! The buffer is drained front to back in chunks no larger than the link's
//! bound.  If the *transport* fails part-way, every byte from the failed chunk
//! onwards stays in the buffer, in order, for the next connection.  If
//! *encryption* fails, the whole buffer is discarded: retrying the same bytes
//! with the same key would fail again.
//!
//! A chunk is never exactly [`KEEP_ALIVE_PAYLOAD`], because the server drops
//! that plaintext.  Four zero bytes that would form a chunk on their own go
//! out as three bytes and then one.

use tracing::{debug, warn};
use tunnel_core::protocol::KEEP_ALIVE_PAYLOAD;

use super::link::{ChunkError, ChunkSink};

/// How a drain attempt ended.
#[derive(Debug)]
pub enum DrainFailure {
    /// The link broke.  `retained` bytes are still buffered.
    Transport { retained: usize, error: ChunkError },
    /// Encryption failed.  `discarded` bytes were dropped.
    Encrypt { discarded: usize, error: ChunkError },
}

/// Result of [`OutboundBuffer::drain_into`].
#[derive(Debug, Default)]
pub struct DrainReport {
    pub chunks_sent: usize,
    pub bytes_sent: usize,
    pub failure: Option<DrainFailure>,
}

/// FIFO byte buffer with an upper bound on how much it will hold.
#[derive(Debug)]
pub struct OutboundBuffer {
    bytes: Vec<u8>,
    limit: usize,
}

impl OutboundBuffer {
    /// Creates an empty buffer that reports no room once it holds `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// How many more bytes may be appended before the limit is reached.
    pub fn room(&self) -> usize {
        self.limit.saturating_sub(self.bytes.len())
    }

    /// Appends bytes at the back.  The limit is advisory: callers size their
    /// reads with [`OutboundBuffer::room`].
    pub fn extend(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Sends the buffered bytes through `sink` in chunks of at most
    /// `max_chunk` bytes, stopping at the first failure.
    pub async fn drain_into<S>(&mut self, sink: &mut S, max_chunk: usize) -> DrainReport
    where
        S: ChunkSink + ?Sized,
    {
        let mut report = DrainReport::default();
        if max_chunk == 0 {
            if !self.bytes.is_empty() {
                warn!("link accepts no plaintext; {} bytes stay buffered", self.bytes.len());
            }
            return report;
        }

        let mut offset = 0;
        while offset < self.bytes.len() {
            let end = offset + chunk_len(&self.bytes[offset..], max_chunk);
            match sink.send_chunk(&self.bytes[offset..end]).await {
                Ok(()) => {
                    debug!("sent {}-byte chunk", end - offset);
                    report.chunks_sent += 1;
                    report.bytes_sent += end - offset;
                    offset = end;
                }
                Err(error @ ChunkError::Transport(_)) => {
                    self.bytes.drain(..offset);
                    report.failure = Some(DrainFailure::Transport {
                        retained: self.bytes.len(),
                        error,
                    });
                    return report;
                }
                Err(error @ ChunkError::Encrypt(_)) => {
                    let discarded = self.bytes.len() - offset;
                    self.bytes.clear();
                    report.failure = Some(DrainFailure::Encrypt { discarded, error });
                    return report;
                }
            }
        }

        self.bytes.clear();
        report
    }
}

/// Length of the next chunk taken from the front of `rest`.
fn chunk_len(rest: &[u8], max_chunk: usize) -> usize {
    let len = max_chunk.min(rest.len());
    if rest[..len] == KEEP_ALIVE_PAYLOAD {
        len - 1
    } else {
        len
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
