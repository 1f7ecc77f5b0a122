use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error as ThisError;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::command::{self, is_delimiter};

/// Longest request token accepted by default. A `u64` needs at most 20 digits, the rest is slack
/// for a sign and leading zeros.
pub const MAX_REQUEST_LEN: usize = 64;

/// A request token longer than the configured limit. Its bytes are discarded up to the next
/// delimiter and the stream carries on with the following request.
#[derive(Debug, ThisError, PartialEq, Eq, Clone)]
#[error("protocol error; request of {len} bytes exceeds limit of {max} bytes")]
pub struct RequestTooLong {
    pub len: usize,
    pub max: usize,
}

/// Splits the inbound byte stream into request payloads.
///
/// Requests carry no length prefix: each one is a single token terminated by whitespace (or NUL).
/// The codec hands out the raw token and leaves its interpretation to [`command::decode`].
pub struct RequestCodec {
    max_request_len: usize,
    // Length of an oversized token being skipped, if any.
    discarding: Option<usize>,
}

impl RequestCodec {
    pub fn new(max_request_len: usize) -> RequestCodec {
        RequestCodec {
            max_request_len,
            discarding: None,
        }
    }

    fn skip_delimiters(src: &mut BytesMut) {
        let leading = src.iter().take_while(|&&b| is_delimiter(b)).count();
        src.advance(leading);
    }

    fn too_long(&self, len: usize) -> RequestTooLong {
        RequestTooLong {
            len,
            max: self.max_request_len,
        }
    }
}

impl Default for RequestCodec {
    fn default() -> Self {
        Self::new(MAX_REQUEST_LEN)
    }
}

impl Decoder for RequestCodec {
    type Item = Result<Bytes, RequestTooLong>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(skipped) = self.discarding {
            return match src.iter().position(|&b| is_delimiter(b)) {
                Some(end) => {
                    src.advance(end + 1);
                    self.discarding = None;
                    Ok(Some(Err(self.too_long(skipped + end))))
                }
                None => {
                    self.discarding = Some(skipped + src.len());
                    src.clear();
                    Ok(None)
                }
            };
        }

        Self::skip_delimiters(src);

        match src.iter().position(|&b| is_delimiter(b)) {
            Some(end) if end > self.max_request_len => {
                src.advance(end + 1);
                Ok(Some(Err(self.too_long(end))))
            }
            Some(end) => {
                let token = src.split_to(end).freeze();
                // Consume the delimiter that terminated the token.
                src.advance(1);
                Ok(Some(Ok(token)))
            }
            None if src.len() > self.max_request_len => {
                self.discarding = Some(src.len());
                src.clear();
                Ok(None)
            }
            // Not enough data is available to parse an entire request.
            None => {
                src.reserve(self.max_request_len - src.len() + 1);
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(request) = self.decode(src)? {
            return Ok(Some(request));
        }

        // A request is only served once terminated; the peer is gone before it could be answered.
        let pending = self.discarding.take().unwrap_or(0) + src.len();
        if pending > 0 {
            debug!("Dropping unterminated request of {} bytes", pending);
            src.clear();
        }

        Ok(None)
    }
}

impl Encoder<u64> for RequestCodec {
    type Error = io::Error;

    fn encode(&mut self, size: u64, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put(command::encode(size));
        Ok(())
    }
}
