//! Length-prefixed framing for the peer signaling transport.
//!
//! Every message is a 2-byte little-endian length followed by that many bytes
//! of UTF-8 JSON. A declared length above [`MAX_PAYLOAD_LEN`] is a protocol
//! violation and the connection must be dropped.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD_LEN: usize = 4096;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Reading the length prefix failed
    #[error("Failed to read frame length: {0}")]
    LengthRead(std::io::Error),

    /// Declared or supplied payload is larger than the protocol allows
    #[error("Frame length {0} exceeds maximum of {MAX_PAYLOAD_LEN}")]
    TooLarge(usize),

    /// Reading the payload failed (usually a truncated frame)
    #[error("Failed to read frame body: {0}")]
    BodyRead(std::io::Error),

    /// Writing a frame failed
    #[error("Failed to write frame: {0}")]
    Write(std::io::Error),
}

impl CodecError {
    /// Numeric code reported in logs when a connection is dropped.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            CodecError::LengthRead(_) => 101,
            CodecError::TooLarge(_) => 102,
            CodecError::BodyRead(_) => 103,
            CodecError::Write(_) => 104,
        }
    }

    /// Bounded label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            CodecError::LengthRead(_) => "length_read",
            CodecError::TooLarge(_) => "too_large",
            CodecError::BodyRead(_) => "body_read",
            CodecError::Write(_) => "write",
        }
    }
}

/// Encode a payload into a single frame.
///
/// # Errors
///
/// Returns [`CodecError::TooLarge`] if the payload exceeds [`MAX_PAYLOAD_LEN`].
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, CodecError> {
    let len = u16::try_from(payload.len())
        .ok()
        .filter(|len| usize::from(*len) <= MAX_PAYLOAD_LEN)
        .ok_or(CodecError::TooLarge(payload.len()))?;

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    buf.put_u16_le(len);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame; the
/// buffer is left untouched in that case.
///
/// # Errors
///
/// Returns [`CodecError::TooLarge`] if the declared length exceeds
/// [`MAX_PAYLOAD_LEN`].
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
    let Some(mut prefix) = buf.get(..LENGTH_PREFIX_LEN) else {
        return Ok(None);
    };
    let declared = usize::from(prefix.get_u16_le());
    if declared > MAX_PAYLOAD_LEN {
        return Err(CodecError::TooLarge(declared));
    }
    if buf.len() < LENGTH_PREFIX_LEN + declared {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_LEN);
    Ok(Some(buf.split_to(declared).freeze()))
}

/// Read one frame from an async reader.
///
/// Returns `Ok(None)` if the peer closed the stream before a new frame began.
///
/// # Errors
///
/// Returns an error if the length cannot be read, is too large, or the body
/// is truncated.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let declared = match reader.read_u16_le().await {
        Ok(len) => usize::from(len),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CodecError::LengthRead(e)),
    };
    if declared > MAX_PAYLOAD_LEN {
        return Err(CodecError::TooLarge(declared));
    }

    let mut body = vec![0u8; declared];
    reader
        .read_exact(&mut body)
        .await
        .map_err(CodecError::BodyRead)?;
    Ok(Some(Bytes::from(body)))
}

/// Write one frame to an async writer.
///
/// # Errors
///
/// Returns an error if the payload is too large or the write fails.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await.map_err(CodecError::Write)?;
    writer.flush().await.map_err(CodecError::Write)
}
