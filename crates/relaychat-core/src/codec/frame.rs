//! Length-prefixed frame codec (spec §4.A).
//!
//! Every frame on the wire — client protocol (§6) or peer RPC (§4.E) —
//! is a 12-byte big-endian header `(msg_type: u64, payload_len: u32)`
//! followed by exactly `payload_len` bytes of payload. The codec never
//! interprets the payload; that's [`crate::codec::value`]'s job.
//!
//! The same two functions serve both the client-facing TCP listener and
//! the peer RPC listener — they differ only in which `msg_type` values are
//! meaningful on that port, not in how bytes are framed.

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Defensive upper bound on a single frame's payload. A frame claiming to
/// be larger than this is rejected before we allocate a buffer for it —
/// the length prefix is attacker/peer-controlled data, read before we know
/// anything else about the frame.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

const HEADER_LEN: usize = 12;

/// A decoded frame: a message-type code and its raw (still object-codec
/// encoded) payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u64,
    pub payload: Vec<u8>,
}

/// Errors that can occur while reading or writing a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("end of stream")]
    EndOfStream,

    #[error("frame payload too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge { size: u32 },
}

/// Reads one frame from `reader`.
///
/// A short read on the header is treated as an orderly shutdown and
/// reported as [`FrameError::EndOfStream`] — not a genuine I/O error —
/// matching spec §4.A ("a short read on either header or payload indicates
/// an orderly shutdown").
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::EndOfStream);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let msg_type = u64::from_be_bytes(header[0..8].try_into().unwrap());
    let payload_len = u32::from_be_bytes(header[8..12].try_into().unwrap());

    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge { size: payload_len });
    }

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        match reader.read_exact(&mut payload).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::EndOfStream);
            }
            Err(e) => return Err(FrameError::Io(e)),
        }
    }

    Ok(Frame { msg_type, payload })
}

/// Writes one frame to `writer` and flushes it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg_type: u64,
    payload: &[u8],
) -> Result<(), FrameError> {
    let mut header = [0u8; HEADER_LEN];
    header[0..8].copy_from_slice(&msg_type.to_be_bytes());
    header[8..12].copy_from_slice(&(payload.len() as u32).to_be_bytes());

    writer.write_all(&header).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}
