//! Framing: 4-byte little-endian length prefix, then a bincode body.

use crate::protocol::Message;

const LEN_SIZE: usize = 4;
/// Largest body accepted in either direction.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode one message as a complete frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let body = bincode::serialize(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
}

/// Read the body length from a frame header. Fails if the announced length is over the limit.
pub fn frame_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    Ok(len)
}

/// Decode a frame body (the bytes after the length prefix).
pub fn decode_body(body: &[u8]) -> Result<Message, FrameDecodeError> {
    Ok(bincode::deserialize(body)?)
}

/// Decode one frame from the front of `bytes`, returning the message and bytes consumed.
/// `NeedMore` means the buffer holds only part of a frame.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let Some(header) = bytes.get(..LEN_SIZE) else {
        return Err(FrameDecodeError::NeedMore);
    };
    let len = frame_len([header[0], header[1], header[2], header[3]])?;
    let Some(body) = bytes.get(LEN_SIZE..LEN_SIZE + len) else {
        return Err(FrameDecodeError::NeedMore);
    };
    Ok((decode_body(body)?, LEN_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
