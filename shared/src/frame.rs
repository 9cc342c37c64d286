//! Length-prefixed bincode framing for both streams.
//!
//! A frame is a big-endian `u32` byte count followed by that many bytes of a
//! bincode-encoded packet.

use bincode::{deserialize, serialize};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame body accepted in either direction.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the stream on a frame boundary.
    #[error("stream closed by peer")]
    Closed,
    #[error("frame of {0} bytes exceeds the maximum frame length")]
    TooLarge(usize),
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Codec(#[from] bincode::Error),
}

impl FrameError {
    /// True when the stream ended cleanly rather than failing.
    pub fn is_closed(&self) -> bool {
        matches!(self, FrameError::Closed)
    }
}

/// Reads one frame and decodes it as `T`.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(e) => return Err(e.into()),
    };

    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer).await?;
    Ok(deserialize(&buffer)?)
}

/// Encodes `packet` and writes it as one frame, flushing the writer.
pub async fn write_frame<W, T>(writer: &mut W, packet: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = serialize(packet)?;
    if data.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(data.len()));
    }

    writer.write_u32(data.len() as u32).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}
