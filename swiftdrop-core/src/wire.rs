//! Host frames: a little-endian `u32` byte count, then the bincode body.
//! Used for everything crossing the C ABI (provider calls, events, peer lists, snapshots).

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Size of the byte-count header.
pub const HEADER_LEN: usize = 4;
/// Largest body accepted in either direction.
pub const MAX_BODY_LEN: usize = 1 << 24;

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("cannot serialize frame body: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame body of {0} bytes exceeds limit")]
    TooLarge(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    /// The buffer ends before the frame does; retry with more bytes.
    #[error("incomplete frame")]
    NeedMore,
    #[error("frame body of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("cannot deserialize frame body: {0}")]
    Decode(#[from] bincode::Error),
}

pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let body = bincode::serialize(value)?;
    if body.len() > MAX_BODY_LEN {
        return Err(FrameEncodeError::TooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend(body);
    Ok(frame)
}

/// Body length announced by the header at the front of `bytes`, if the header is complete.
pub fn body_len(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    let header: [u8; HEADER_LEN] = bytes
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or(FrameDecodeError::NeedMore)?;
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_BODY_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    Ok(len)
}

/// Decode the frame at the front of `bytes`; also returns how many bytes it occupied.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    let end = HEADER_LEN + body_len(bytes)?;
    let body = bytes.get(HEADER_LEN..end).ok_or(FrameDecodeError::NeedMore)?;
    Ok((bincode::deserialize(body)?, end))
}
