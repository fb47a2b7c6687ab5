//! Delimiter-terminated JSON framing.

use crate::error::ProtocolError;
use bytes::{Bytes, BytesMut};
use serde_json::Value;

/// Encodes values into delimiter-terminated frames.
#[derive(Debug, Clone)]
pub struct Encoder {
    delimiter: Bytes,
}

impl Encoder {
    pub fn new(delimiter: &str) -> Self {
        Self {
            delimiter: Bytes::copy_from_slice(delimiter.as_bytes()),
        }
    }

    /// Encodes any JSON-serializable value into a frame.
    pub fn encode<T: serde::Serialize>(&self, value: &T) -> Result<Bytes, ProtocolError> {
        let payload = serde_json::to_vec(value)?;
        let mut buf = BytesMut::with_capacity(payload.len() + self.delimiter.len());
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&self.delimiter);
        Ok(buf.freeze())
    }
}

/// Splits a byte stream into frames.
///
/// Bytes are buffered until a delimiter arrives. A segment that is not valid
/// JSON is consumed and reported on its own; the next call carries on with
/// the following segment.
pub struct Decoder {
    buffer: BytesMut,
    delimiter: Vec<u8>,
    /// Bytes of `buffer` already searched without finding a delimiter.
    scanned: usize,
    max_frame_bytes: usize,
}

impl Decoder {
    pub fn new(delimiter: &str) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            delimiter: delimiter.as_bytes().to_vec(),
            scanned: 0,
            max_frame_bytes: crate::MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Splits off the next complete segment, without its delimiter.
    pub fn next_segment(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        let dlen = self.delimiter.len();
        if dlen == 0 {
            return Err(ProtocolError::InvalidConfig("empty delimiter"));
        }
        let start = self.scanned.saturating_sub(dlen.saturating_sub(1));

        let found = self.buffer[start..]
            .windows(dlen)
            .position(|window| window == self.delimiter.as_slice());

        match found {
            Some(offset) => {
                let end = start + offset;
                let segment = self.buffer.split_to(end).freeze();
                let _ = self.buffer.split_to(dlen);
                self.scanned = 0;
                Ok(Some(segment))
            }
            None => {
                self.scanned = self.buffer.len();
                if self.buffer.len() > self.max_frame_bytes {
                    let size = self.buffer.len();
                    self.clear();
                    return Err(ProtocolError::FrameTooLarge {
                        size,
                        max: self.max_frame_bytes,
                    });
                }
                Ok(None)
            }
        }
    }

    /// Attempts to decode the next frame from the buffer.
    ///
    /// Returns `Ok(None)` when more data is needed. Blank segments are
    /// skipped.
    pub fn decode(&mut self) -> Result<Option<Value>, ProtocolError> {
        loop {
            let segment = match self.next_segment()? {
                Some(segment) => segment,
                None => return Ok(None),
            };
            let text = std::str::from_utf8(&segment).map_err(|_| ProtocolError::InvalidUtf8)?;
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(text)?));
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(crate::DEFAULT_DELIMITER)
    }
}
