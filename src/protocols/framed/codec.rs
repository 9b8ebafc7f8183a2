//! Length-prefixed frame codec.
//!
//! Every frame is an 8 digit, zero padded, decimal byte count followed by
//! exactly that many payload bytes:
//!
//! ```text
//! 00000023{"type":"PING",...}
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Width of the ASCII length prefix.
pub const LENGTH_PREFIX_LEN: usize = 8;

/// Largest payload an 8 digit prefix can describe.
pub const MAX_PAYLOAD_LEN: usize = 99_999_999;

const READ_CHUNK: usize = 8192;

/// Errors produced while reading or writing frames.
#[derive(Error, Debug)]
pub enum FrameError {
    /// The stream ended before a full prefix or payload arrived.
    #[error("short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },

    /// The prefix was not an unsigned decimal number.
    #[error("malformed length prefix {0:?}")]
    MalformedLength(String),

    /// The payload was not a valid message.
    #[error("failed to decode payload: {0}")]
    Decode(serde_json::Error),

    /// The message could not be serialized.
    #[error("failed to encode payload: {0}")]
    Encode(serde_json::Error),

    /// The payload does not fit in the length prefix.
    #[error("payload of {0} bytes exceeds the frame limit")]
    Oversized(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialize `message` into a complete frame.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, FrameError> {
    let payload = serde_json::to_vec(message).map_err(FrameError::Encode)?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::Oversized(payload.len()));
    }

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.put_slice(format!("{:08}", payload.len()).as_bytes());
    frame.put_slice(&payload);
    Ok(frame.freeze())
}

/// Parse the 8 byte length prefix.
pub fn parse_length(prefix: &[u8]) -> Result<usize, FrameError> {
    let malformed = || FrameError::MalformedLength(String::from_utf8_lossy(prefix).into_owned());

    if prefix.len() != LENGTH_PREFIX_LEN || !prefix.iter().all(u8::is_ascii_digit) {
        return Err(malformed());
    }
    std::str::from_utf8(prefix)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(malformed)
}

/// Read one raw frame payload from `reader`.
///
/// Partial reads are tolerated: both the prefix and the payload are
/// accumulated until complete or the stream closes.
pub async fn read_frame<R>(reader: &mut R) -> Result<Bytes, FrameError>
where
    R: AsyncRead + Unpin,
{
    let prefix = read_exactly(reader, LENGTH_PREFIX_LEN).await?;
    let length = parse_length(&prefix)?;
    let payload = read_exactly(reader, length).await?;
    Ok(payload)
}

/// Parse a payload read by [`read_frame`].
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FrameError> {
    serde_json::from_slice(payload).map_err(FrameError::Decode)
}

/// Read and parse one frame.
pub async fn decode<T, R>(reader: &mut R) -> Result<T, FrameError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let payload = read_frame(reader).await?;
    decode_payload(&payload)
}

/// Encode `message` and write the frame to `writer` without flushing.
pub async fn write_message<T, W>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Buffered frame reader for the server side of a session.
///
/// Bytes of a rejected prefix stay buffered, so after a malformed length the
/// reader can skip ahead to the next plausible frame start with
/// [`FrameReader::resync`].
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Read one raw frame payload.
    ///
    /// On `MalformedLength` nothing is consumed.
    pub async fn read_frame(&mut self) -> Result<Bytes, FrameError> {
        self.fill(LENGTH_PREFIX_LEN).await?;
        let length = parse_length(&self.buffer[..LENGTH_PREFIX_LEN])?;
        self.fill(LENGTH_PREFIX_LEN + length).await?;

        self.buffer.advance(LENGTH_PREFIX_LEN);
        Ok(self.buffer.split_to(length).freeze())
    }

    /// Drop the byte at the current position, then everything up to the next
    /// eight ASCII digits followed by `{`.
    ///
    /// Returns the number of bytes discarded. Fails with `ShortRead` if the
    /// stream ends first.
    pub async fn resync(&mut self) -> Result<usize, FrameError> {
        let mut discarded = 0;
        if !self.buffer.is_empty() {
            self.buffer.advance(1);
            discarded += 1;
        }

        loop {
            if let Some(start) = find_frame_start(&self.buffer) {
                self.buffer.advance(start);
                return Ok(discarded + start);
            }

            // A frame start may straddle the next read.
            let stale = self.buffer.len().saturating_sub(LENGTH_PREFIX_LEN);
            self.buffer.advance(stale);
            discarded += stale;

            let n = self.inner.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(FrameError::ShortRead {
                    expected: LENGTH_PREFIX_LEN + 1,
                    received: self.buffer.len(),
                });
            }
        }
    }

    async fn fill(&mut self, want: usize) -> Result<(), FrameError> {
        if self.buffer.len() < want {
            self.buffer
                .reserve((want - self.buffer.len()).min(READ_CHUNK * 8));
        }

        while self.buffer.len() < want {
            let n = self.inner.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(FrameError::ShortRead {
                    expected: want,
                    received: self.buffer.len(),
                });
            }
        }
        Ok(())
    }
}

/// Offset of the first `dddddddd{` sequence in `data`.
fn find_frame_start(data: &[u8]) -> Option<usize> {
    data.windows(LENGTH_PREFIX_LEN + 1).position(|window| {
        window[..LENGTH_PREFIX_LEN].iter().all(u8::is_ascii_digit)
            && window[LENGTH_PREFIX_LEN] == b'{'
    })
}

async fn read_exactly<R>(reader: &mut R, length: usize) -> Result<Bytes, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(length.min(READ_CHUNK * 8));

    while buffer.len() < length {
        let remaining = length - buffer.len();
        let mut chunk = (&mut buffer).limit(remaining.min(READ_CHUNK));
        let n = reader.read_buf(&mut chunk).await?;
        if n == 0 {
            return Err(FrameError::ShortRead {
                expected: length,
                received: buffer.len(),
            });
        }
    }

    Ok(buffer.freeze())
}
