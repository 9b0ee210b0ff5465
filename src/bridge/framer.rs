//! `Content-Length` framing for language server streams.
//!
//! A frame is a header block terminated by `\r\n\r\n` followed by exactly
//! `Content-Length` bytes of body. The decoder buffers partial reads and
//! yields one body per complete frame.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Bodies larger than this are rejected instead of buffered.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Header blocks larger than this are rejected.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("missing Content-Length header")]
    MissingLength,

    #[error("invalid Content-Length header: {0}")]
    InvalidLength(String),

    #[error("message of {0} bytes exceeds limit")]
    TooLarge(usize),

    #[error("header block exceeds limit")]
    HeaderTooLarge,

    #[error("message body is not UTF-8")]
    NotUtf8,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default)]
pub struct LspCodec {
    /// Body length of the frame whose header has been consumed.
    pending: Option<usize>,
    /// Bytes already searched for the header terminator.
    scanned: usize,
}

impl LspCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn parse_content_length(headers: &[u8]) -> Result<usize, FrameError> {
    let text = std::str::from_utf8(headers)
        .map_err(|_| FrameError::InvalidLength("non-ASCII header".to_string()))?;
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            return value
                .parse()
                .map_err(|_| FrameError::InvalidLength(value.to_string()));
        }
    }
    Err(FrameError::MissingLength)
}

impl Decoder for LspCodec {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, FrameError> {
        let length = match self.pending {
            Some(length) => length,
            None => {
                let from = self.scanned.saturating_sub(HEADER_END.len() - 1);
                let found = src[from..]
                    .windows(HEADER_END.len())
                    .position(|w| w == HEADER_END)
                    .map(|pos| from + pos);
                let Some(end) = found else {
                    if src.len() > MAX_HEADER_BYTES {
                        return Err(FrameError::HeaderTooLarge);
                    }
                    self.scanned = src.len();
                    return Ok(None);
                };
                self.scanned = 0;
                if end > MAX_HEADER_BYTES {
                    return Err(FrameError::HeaderTooLarge);
                }
                let length = parse_content_length(&src[..end])?;
                if length > MAX_MESSAGE_BYTES {
                    return Err(FrameError::TooLarge(length));
                }
                src.advance(end + HEADER_END.len());
                self.pending = Some(length);
                length
            }
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        self.pending = None;
        let body = src.split_to(length);
        String::from_utf8(body.to_vec())
            .map(Some)
            .map_err(|_| FrameError::NotUtf8)
    }
}

impl Encoder<String> for LspCodec {
    type Error = FrameError;

    fn encode(&mut self, body: String, dst: &mut BytesMut) -> Result<(), FrameError> {
        if body.len() > MAX_MESSAGE_BYTES {
            return Err(FrameError::TooLarge(body.len()));
        }
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(body.as_bytes());
        Ok(())
    }
}
