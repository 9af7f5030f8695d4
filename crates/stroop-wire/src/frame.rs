//! Length-prefixed framing over a duplex byte stream
//!
//! Frame = 4-byte big-endian length L + L payload bytes, 0 < L <= 1 MiB

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use stroop_core::FrameError;

/// Length prefix size
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum payload size
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Interpret a length prefix, rejecting L <= 0 and L > `max`
pub fn parse_length(prefix: [u8; LENGTH_PREFIX_SIZE], max: usize) -> Result<usize, FrameError> {
    let length = i32::from_be_bytes(prefix);
    if length <= 0 {
        return Err(FrameError::InvalidLength(length as i64));
    }
    let length = length as usize;
    if length > max {
        return Err(FrameError::TooLarge {
            max,
            actual: length,
        });
    }
    Ok(length)
}

/// Encode one frame into a contiguous buffer
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::InvalidLength(0));
    }
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge {
            max: MAX_MESSAGE_SIZE,
            actual: payload.len(),
        });
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Reads frames from an async byte stream
pub struct FrameReader<R> {
    reader: R,
    max_message_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_size(reader, MAX_MESSAGE_SIZE)
    }

    pub fn with_max_size(reader: R, max_message_size: usize) -> Self {
        FrameReader {
            reader,
            max_message_size,
        }
    }

    /// Read the next frame payload
    ///
    /// Returns `Ok(None)` when the peer closed cleanly between frames and
    /// `FrameError::ConnectionClosed` when it closed mid-frame. A bad
    /// length prefix is reported before any payload byte is consumed.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        let mut filled = 0usize;
        while filled < LENGTH_PREFIX_SIZE {
            let n = self.reader.read(&mut prefix[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(FrameError::ConnectionClosed);
            }
            filled += n;
        }

        let length = parse_length(prefix, self.max_message_size)?;

        let mut body = BytesMut::zeroed(length);
        let mut read_body = 0usize;
        while read_body < length {
            let n = self.reader.read(&mut body[read_body..]).await?;
            if n == 0 {
                return Err(FrameError::ConnectionClosed);
            }
            read_body += n;
        }

        Ok(Some(body.freeze()))
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writes frames to an async byte stream
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        FrameWriter { writer }
    }

    /// Write one frame and flush it
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<usize, FrameError> {
        let frame = encode_frame(payload)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(frame.len())
    }

    /// Half-close the underlying stream
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.writer.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
