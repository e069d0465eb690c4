//! Length-prefixed JSON framing
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes of
//! UTF-8 JSON encoding one [`Envelope`].

use crate::envelope::Envelope;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame unless configured otherwise (64 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Errors produced while reading or writing frames
#[derive(Error, Debug)]
pub enum FrameError {
    /// Underlying pipe failed
    #[error("frame I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Frame body was not a valid envelope
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Declared length exceeds the configured limit
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    /// Stream ended in the middle of a frame
    #[error("channel closed mid-frame")]
    Truncated,
}

/// Read one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Envelope>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(FrameError::Truncated)
            };
        }
        filled += n;
    }

    let size = u32::from_be_bytes(header) as usize;
    if size > max_frame_bytes {
        // skip the body so the next read starts on a frame boundary
        let skipped = tokio::io::copy(&mut (&mut *reader).take(size as u64), &mut tokio::io::sink()).await?;
        if skipped < size as u64 {
            return Err(FrameError::Truncated);
        }
        return Err(FrameError::TooLarge {
            size,
            limit: max_frame_bytes,
        });
    }

    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(e)
        }
    })?;

    Ok(Some(serde_json::from_slice(&body)?))
}

/// Serialize `envelope` into a complete frame, refusing bodies larger than
/// `max_frame_bytes`.
pub fn encode_frame(envelope: &Envelope, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(envelope)?;
    let limit = max_frame_bytes.min(u32::MAX as usize);
    if body.len() > limit {
        return Err(FrameError::TooLarge {
            size: body.len(),
            limit,
        });
    }

    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write an already encoded frame and flush it.
pub async fn write_encoded<W>(writer: &mut W, frame: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(envelope, u32::MAX as usize)?;
    write_encoded(writer, &frame).await
}
