//! Length-prefixed framing
//!
//! Every frame is a 4-byte big-endian length followed by that many payload
//! bytes. The codec knows nothing about what the payload means.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::DEFAULT_MAX_FRAME_LEN;

const LEN_PREFIX_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum CodecError {
    /// Stream ended on a frame boundary.
    #[error("stream closed")]
    Closed,
    #[error("stream ended mid-frame: needed {needed} bytes, got {received}")]
    Incomplete { needed: usize, received: usize },
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("frame too large to encode: {0} bytes")]
    Oversized(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Clean end of stream, as opposed to a truncated or failed read.
    pub fn is_closed(&self) -> bool {
        matches!(self, CodecError::Closed)
    }
}

/// Reads one frame, rejecting anything above [`DEFAULT_MAX_FRAME_LEN`].
pub async fn read_message<R>(reader: &mut R) -> Result<Bytes, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    read_message_with_limit(reader, DEFAULT_MAX_FRAME_LEN).await
}

/// Reads one frame whose declared length must not exceed `max_len`.
pub async fn read_message_with_limit<R>(reader: &mut R, max_len: usize) -> Result<Bytes, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LEN_PREFIX_SIZE];
    let mut filled = 0;
    while filled < LEN_PREFIX_SIZE {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                CodecError::Closed
            } else {
                CodecError::Incomplete {
                    needed: LEN_PREFIX_SIZE,
                    received: filled,
                }
            });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_len {
        return Err(CodecError::FrameTooLarge { len, max: max_len });
    }

    let mut payload = BytesMut::zeroed(len);
    let mut received = 0;
    while received < len {
        let n = reader.read(&mut payload[received..]).await?;
        if n == 0 {
            return Err(CodecError::Incomplete {
                needed: len,
                received,
            });
        }
        received += n;
    }

    Ok(payload.freeze())
}

/// Writes one frame and flushes the writer.
pub async fn write_message<W>(writer: &mut W, payload: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(payload.len()).map_err(|_| CodecError::Oversized(payload.len()))?;

    let mut frame = BytesMut::with_capacity(LEN_PREFIX_SIZE + payload.len());
    frame.put_u32(len);
    frame.put_slice(payload);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
