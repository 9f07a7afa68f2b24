//! Length-prefixed frame codec.
//!
//! Wire format: a 4-byte big-endian payload length followed by that many
//! bytes of UTF-8 JSON. The same layout is produced by
//! `tokio_util::codec::LengthDelimitedCodec` with its default settings, which
//! is what the async server and service transports use.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Default maximum payload size (16 MiB).
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Frame encoding/decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    #[error("incomplete frame: need {needed} more bytes")]
    Incomplete { needed: usize },

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a message as a single frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            max: MAX_FRAME_BYTES,
        });
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode the first frame in `buf`.
///
/// Returns the message and the number of bytes consumed, so callers can
/// decode several frames from one buffer.
pub fn decode_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<(T, usize), FrameError> {
    if buf.len() < LENGTH_PREFIX_BYTES {
        return Err(FrameError::Incomplete {
            needed: LENGTH_PREFIX_BYTES - buf.len(),
        });
    }

    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    prefix.copy_from_slice(&buf[..LENGTH_PREFIX_BYTES]);
    let len = u32::from_be_bytes(prefix) as usize;

    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            size: len,
            max: MAX_FRAME_BYTES,
        });
    }

    let end = LENGTH_PREFIX_BYTES + len;
    if buf.len() < end {
        return Err(FrameError::Incomplete {
            needed: end - buf.len(),
        });
    }

    let message = decode_payload(&buf[LENGTH_PREFIX_BYTES..end])?;
    Ok((message, end))
}

/// Decode a frame payload (without its length prefix).
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FrameError> {
    Ok(serde_json::from_slice(payload)?)
}
