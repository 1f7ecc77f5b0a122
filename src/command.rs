use bytes::Bytes;
use std::str;
use thiserror::Error as ThisError;

/// The request payload could not be interpreted as a segment size.
#[derive(Debug, ThisError, PartialEq, Eq, Clone)]
#[error("protocol error; malformed command {payload:?}, expected a non-negative decimal integer")]
pub struct MalformedCommand {
    pub payload: String,
}

/// Bytes that separate request tokens on the wire. NUL is included because some clients send
/// C-style strings.
pub fn is_delimiter(byte: u8) -> bool {
    byte.is_ascii_whitespace() || byte == 0
}

/// Extracts the requested segment size from a request payload.
///
/// The payload is split on whitespace (and NUL) and the first token must be a decimal integer that
/// fits in a `u64`. Anything after the first token is ignored.
pub fn decode(payload: &[u8]) -> Result<u64, MalformedCommand> {
    let malformed = || MalformedCommand {
        payload: String::from_utf8_lossy(payload).into_owned(),
    };

    let text = str::from_utf8(payload).map_err(|_| malformed())?;
    let token = text
        .split(|c: char| c.is_ascii_whitespace() || c == '\0')
        .find(|token| !token.is_empty())
        .ok_or_else(malformed)?;

    token.parse::<u64>().map_err(|_| malformed())
}

/// Serializes a segment request the way clients put it on the wire.
pub fn encode(size: u64) -> Bytes {
    Bytes::from(format!("{}\n", size))
}
