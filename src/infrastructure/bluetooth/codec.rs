//! Frame codec (4-byte little-endian length + UTF-8 JSON).

use crate::domain::error::BridgeError;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_HEADER_LEN: usize = 4;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const READ_CHUNK_LEN: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("stream ended inside a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
    #[error("invalid frame payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame payload is not a JSON object")]
    NotAnObject,
}

impl From<FrameError> for BridgeError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(_) => BridgeError::LinkClosed,
            other => BridgeError::Protocol(other.to_string()),
        }
    }
}

/// Encode one message as a complete frame
pub fn encode_frame<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(message)?;
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::FrameTooLarge {
        max_frame_bytes: u32::MAX as usize,
        got_bytes: payload.len(),
    })?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn decode_payload(payload: &[u8]) -> Result<Value, FrameError> {
    let value: Value = serde_json::from_slice(payload)?;
    if !value.is_object() {
        return Err(FrameError::NotAnObject);
    }
    Ok(value)
}

/// Incremental decoder. Bytes may be pushed in chunks of any size; a frame
/// is yielded once all of it has arrived.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_bytes,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet consumed by a complete frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete frame, or `None` until more bytes arrive.
    ///
    /// Errors leave the stream desynchronised; the caller must drop the link.
    pub fn next_frame(&mut self) -> Result<Option<Value>, FrameError> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_le_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if len > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: len,
            });
        }

        let frame_len = FRAME_HEADER_LEN + len;
        if self.buffer.len() < frame_len {
            return Ok(None);
        }

        let value = decode_payload(&self.buffer[FRAME_HEADER_LEN..frame_len]);
        self.buffer.drain(..frame_len);
        value.map(Some)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(max_frame_bytes),
            chunk: vec![0u8; READ_CHUNK_LEN],
        }
    }

    /// Read the next message. `Ok(None)` on end of stream between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Value>, FrameError> {
        loop {
            if let Some(value) = self.decoder.next_frame()? {
                return Ok(Some(value));
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                let buffered = self.decoder.buffered();
                if buffered == 0 {
                    return Ok(None);
                }
                return Err(FrameError::Truncated { buffered });
            }
            self.decoder.push(&self.chunk[..n]);
        }
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a frame produced by [`encode_frame`]. Several frames may be
    /// concatenated into one buffer.
    pub async fn write_encoded(&mut self, frame: &[u8]) -> Result<(), FrameError> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
