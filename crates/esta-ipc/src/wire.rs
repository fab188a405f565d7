//! Binary wire format: a fixed 48-byte little-endian header followed by the
//! payload.
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 16 | message id |
//! | 16 | 4 | source pid |
//! | 20 | 4 | target pid |
//! | 24 | 8 | sequence number |
//! | 32 | 8 | timestamp (ms) |
//! | 40 | 1 | priority (`0` Low … `3` Critical) |
//! | 41 | 1 | flags |
//! | 42 | 4 | payload size |
//! | 46 | 2 | reserved, written as zero |
//! | 48 | N | payload (≤ 1 MiB) |
//!
//! The first payload byte is the service message type code.

use esta_types::{
    EstaError, MAX_PAYLOAD_BYTES, Message, MessageFlags, MessageId, Priority, ProcessId,
};
use thiserror::Error;

pub const HEADER_LEN: usize = 48;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("frame truncated: need {needed} bytes, have {got}")]
    Truncated { needed: usize, got: usize },

    #[error("payload of {size} bytes exceeds {MAX_PAYLOAD_BYTES}")]
    PayloadTooLarge { size: usize },

    #[error("invalid priority byte {0}")]
    InvalidPriority(u8),

    #[error("unknown flag bits {0:#04x}")]
    UnknownFlags(u8),

    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
}

impl From<WireError> for EstaError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::PayloadTooLarge { size } => EstaError::PayloadTooLarge { size },
            other => EstaError::Wire(other.to_string()),
        }
    }
}

/// Encode one message into a new buffer.
pub fn encode(msg: &Message) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::with_capacity(HEADER_LEN + msg.payload.len());
    encode_into(msg, &mut buf)?;
    Ok(buf)
}

/// Append one encoded frame to `buf`.
pub fn encode_into(msg: &Message, buf: &mut Vec<u8>) -> Result<(), WireError> {
    let size = msg.payload.len();
    if size > MAX_PAYLOAD_BYTES {
        return Err(WireError::PayloadTooLarge { size });
    }
    buf.extend_from_slice(&msg.id.to_bytes());
    buf.extend_from_slice(&msg.source.0.to_le_bytes());
    buf.extend_from_slice(&msg.target.0.to_le_bytes());
    buf.extend_from_slice(&msg.sequence.to_le_bytes());
    buf.extend_from_slice(&msg.timestamp.to_le_bytes());
    buf.push(msg.priority as u8);
    buf.push(msg.flags.bits());
    // Bounded by MAX_PAYLOAD_BYTES above.
    buf.extend_from_slice(&(size as u32).to_le_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(&msg.payload);
    Ok(())
}

/// Total length of the frame at the start of `bytes`, or `None` when the
/// header is not complete yet.
pub fn frame_len(bytes: &[u8]) -> Result<Option<usize>, WireError> {
    if bytes.len() < HEADER_LEN {
        return Ok(None);
    }
    let size = read_u32(bytes, 42) as usize;
    if size > MAX_PAYLOAD_BYTES {
        return Err(WireError::PayloadTooLarge { size });
    }
    Ok(Some(HEADER_LEN + size))
}

/// Decode exactly one frame.
pub fn decode(bytes: &[u8]) -> Result<Message, WireError> {
    let (msg, used) = decode_prefix(bytes)?;
    if used != bytes.len() {
        return Err(WireError::TrailingBytes(bytes.len() - used));
    }
    Ok(msg)
}

/// Decode the frame at the start of `bytes`, returning it and its length.
pub fn decode_prefix(bytes: &[u8]) -> Result<(Message, usize), WireError> {
    let total = frame_len(bytes)?.ok_or(WireError::Truncated {
        needed: HEADER_LEN,
        got: bytes.len(),
    })?;
    if bytes.len() < total {
        return Err(WireError::Truncated {
            needed: total,
            got: bytes.len(),
        });
    }

    let mut id = [0u8; 16];
    id.copy_from_slice(&bytes[0..16]);
    let priority = Priority::from_wire(bytes[40]).ok_or(WireError::InvalidPriority(bytes[40]))?;
    let flags = MessageFlags::from_bits(bytes[41]).ok_or(WireError::UnknownFlags(bytes[41]))?;

    let msg = Message {
        id: MessageId::from_bytes(id),
        source: ProcessId(read_u32(bytes, 16)),
        target: ProcessId(read_u32(bytes, 20)),
        sequence: read_u64(bytes, 24),
        timestamp: read_u64(bytes, 32),
        priority,
        flags,
        payload: bytes[HEADER_LEN..total].to_vec(),
    };
    Ok((msg, total))
}

/// Decode a buffer of back-to-back frames.
pub fn decode_all(mut bytes: &[u8]) -> Result<Vec<Message>, WireError> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        let (msg, used) = decode_prefix(bytes)?;
        out.push(msg);
        bytes = &bytes[used..];
    }
    Ok(out)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}
