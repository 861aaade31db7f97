//! Newline-delimited JSON line codec.
//!
//! Each message is a single JSON object terminated by `\n`. JSON string
//! escaping guarantees the encoded body never contains a raw newline.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Maximum accepted length of one encoded line, newline included (16 MiB).
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Encodes a message as one JSON line, including the trailing newline.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');

    if line.len() > MAX_LINE_LENGTH {
        return Err(ProtocolError::LineTooLong {
            size: line.len(),
            max: MAX_LINE_LENGTH,
        });
    }

    Ok(line)
}

/// Decodes one JSON line; surrounding whitespace and the newline are ignored.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    if line.len() > MAX_LINE_LENGTH {
        return Err(ProtocolError::LineTooLong {
            size: line.len(),
            max: MAX_LINE_LENGTH,
        });
    }

    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::Deserialization("empty line".to_string()));
    }

    Ok(serde_json::from_str(trimmed)?)
}
