//! Length-prefixed framing over any async byte stream.
//!
//! Wire format:
//! ```text
//! [length:4][payload:length]
//! ```
//! `length` is a big-endian `u32` counting payload bytes only.  A zero-length
//! frame is legal and carries an empty payload.
//!
//! # Why frames? (for beginners)
//!
//! TCP delivers a stream of bytes, not messages.  One `write` of 256 bytes on
//! the sender may arrive as two reads of 100 and 156 bytes on the receiver.
//! The 4-byte length prefix tells the receiver exactly how many bytes belong to
//! the current message, so it can keep reading until the message is complete.

use std::io::ErrorKind;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Size of the length prefix in bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest payload accepted in either direction (16 MiB).
///
/// Ciphertexts are a few hundred bytes, so anything close to this limit is a
/// corrupt or hostile length prefix.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Once the first header byte has arrived, the rest of the frame must arrive
/// within this window.
pub const BODY_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest [`send_frame`] waits for the peer to accept a whole frame.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur while encoding, decoding, sending or receiving frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The byte slice is shorter than the frame it starts.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The declared payload length exceeds [`MAX_FRAME_LEN`].
    #[error("frame of {declared} bytes exceeds the {max} byte limit")]
    FrameTooLarge { declared: usize, max: usize },

    /// A frame did not finish arriving, or the peer stopped accepting one we
    /// were sending.
    #[error("timed out after {0:?} with a frame in flight")]
    Timeout(Duration),

    /// The underlying stream failed.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of one [`receive_frame`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A complete frame arrived.
    Message(Vec<u8>),
    /// Nothing arrived within the wait window.  The connection is still usable.
    Empty,
    /// The peer closed the connection, possibly in the middle of a frame.
    Closed,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes `payload` into a single buffer holding the length prefix and payload.
///
/// # Errors
///
/// Returns [`FrameError::FrameTooLarge`] if the payload exceeds [`MAX_FRAME_LEN`].
///
/// # Examples
///
/// ```rust
/// use tunnel_core::protocol::{decode_frame, encode_frame};
///
/// let bytes = encode_frame(b"abc").unwrap();
/// assert_eq!(bytes, [0, 0, 0, 3, b'a', b'b', b'c']);
/// let (payload, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(payload, b"abc");
/// assert_eq!(consumed, 7);
/// ```
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    check_length(payload.len())?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the payload and the total number of bytes consumed (header +
/// payload), so the caller can advance their read cursor.
///
/// # Errors
///
/// - [`FrameError::InsufficientData`] if the header or payload is incomplete.
/// - [`FrameError::FrameTooLarge`] if the declared length exceeds the limit.
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let declared = declared_length([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    let total = HEADER_SIZE + declared;
    if bytes.len() < total {
        return Err(FrameError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }

    Ok((&bytes[HEADER_SIZE..total], total))
}

/// Writes one frame (header and payload) to `writer` and flushes it, giving
/// up after [`SEND_TIMEOUT`].
///
/// The whole frame is written or an error is returned; a partially written
/// frame leaves the stream unusable and the caller should drop it.
///
/// # Errors
///
/// Returns [`FrameError::FrameTooLarge`] for oversized payloads,
/// [`FrameError::Timeout`] if the peer stops accepting bytes and
/// [`FrameError::Io`] if the stream fails.
pub async fn send_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    send_frame_within(writer, payload, SEND_TIMEOUT).await
}

/// [`send_frame`] with an explicit limit on how long the write may block.
pub async fn send_frame_within<W>(
    writer: &mut W,
    payload: &[u8],
    limit: Duration,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_frame(payload)?;
    let write = async {
        writer.write_all(&buf).await?;
        writer.flush().await
    };
    match timeout(limit, write).await {
        Ok(result) => result?,
        Err(_) => return Err(FrameError::Timeout(limit)),
    }
    debug!("sent frame with {} payload bytes", payload.len());
    Ok(())
}

/// Receives one frame from `reader`.
///
/// Waits at most `wait` for the first byte of a frame.  If nothing arrives the
/// result is [`Received::Empty`] and no bytes have been consumed.  Once a frame
/// has started, the remainder must arrive within [`BODY_READ_TIMEOUT`].
///
/// # Errors
///
/// - [`FrameError::FrameTooLarge`] if the header declares more than
///   [`MAX_FRAME_LEN`] bytes.
/// - [`FrameError::Timeout`] if a started frame stalls.
/// - [`FrameError::Io`] for any other stream failure.
pub async fn receive_frame<R>(reader: &mut R, wait: Duration) -> Result<Received, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];

    // `read` is cancel-safe, so timing out here never loses a byte.
    match timeout(wait, reader.read(&mut header[..1])).await {
        Err(_) => return Ok(Received::Empty),
        Ok(Ok(0)) => return Ok(Received::Closed),
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(FrameError::Io(e)),
    }

    match timeout(BODY_READ_TIMEOUT, read_remainder(reader, header)).await {
        Ok(result) => result,
        Err(_) => Err(FrameError::Timeout(BODY_READ_TIMEOUT)),
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

async fn read_remainder<R>(
    reader: &mut R,
    mut header: [u8; HEADER_SIZE],
) -> Result<Received, FrameError>
where
    R: AsyncRead + Unpin,
{
    if !read_exact_or_eof(reader, &mut header[1..]).await? {
        warn!("connection closed in the middle of a frame header");
        return Ok(Received::Closed);
    }

    let declared = declared_length(header)?;
    let mut payload = vec![0u8; declared];
    if !read_exact_or_eof(reader, &mut payload).await? {
        warn!("connection closed after {declared}-byte frame header, before the payload");
        return Ok(Received::Closed);
    }

    debug!("received frame with {declared} payload bytes");
    Ok(Received::Message(payload))
}

/// Fills `buf` completely.  Returns `false` if the stream ended first.
async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool, FrameError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(FrameError::Io(e)),
    }
}

fn declared_length(header: [u8; HEADER_SIZE]) -> Result<usize, FrameError> {
    let declared = u32::from_be_bytes(header) as usize;
    check_length(declared)?;
    Ok(declared)
}

fn check_length(len: usize) -> Result<(), FrameError> {
    if len > MAX_FRAME_LEN {
        return Err(FrameError::FrameTooLarge {
            declared: len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
