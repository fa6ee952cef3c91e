//! Length-prefixed framing of [`DropMessage`]s on a byte stream.
//!
//! Each frame is a 4-byte big-endian payload length followed by the
//! bincode-encoded message. Frames larger than [`MAX_FRAME_LEN`] are
//! rejected on both ends so a misbehaving peer cannot make us allocate
//! arbitrary amounts of memory.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::DropMessage;

/// Upper bound on one encoded message.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

const HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Codec(#[from] bincode::Error),
    #[error("frame too large: {0} bytes (max {MAX_FRAME_LEN})")]
    TooLarge(usize),
}

/// Encodes `message` into a complete frame (header + payload).
pub fn encode_frame(message: &DropMessage) -> Result<Vec<u8>, FrameError> {
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes the payload part of a frame.
pub fn decode_payload(payload: &[u8]) -> Result<DropMessage, FrameError> {
    Ok(bincode::deserialize(payload)?)
}

/// Writes one frame and flushes the writer.
pub async fn write_frame<W>(
    writer: &mut W,
    message: &DropMessage,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub async fn read_frame<R>(
    reader: &mut R,
) -> Result<Option<DropMessage>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode_payload(&payload).map(Some)
}
