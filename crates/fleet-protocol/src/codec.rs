//! Tokio codec for newline-delimited JSON wire lines

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Maximum bytes a single wire line may occupy.
///
/// Registration payloads carry a full SSH public key, so the limit is
/// generous; anything larger is a misbehaving or malicious peer.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Codec framing one JSON object per `\n`-terminated line
#[derive(Debug)]
pub struct WireCodec {
    /// Offset into the buffer already scanned for a newline
    next_index: usize,
    /// Maximum accepted line length
    max_line: usize,
}

impl WireCodec {
    /// Create a codec with the default line limit
    pub fn new() -> Self {
        Self {
            next_index: 0,
            max_line: MAX_LINE_BYTES,
        }
    }

    /// Create a codec with a custom line limit
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            next_index: 0,
            max_line,
        }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WireCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let newline = src[self.next_index..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|pos| self.next_index + pos);

        match newline {
            Some(pos) => {
                self.next_index = 0;

                let mut line = src.split_to(pos + 1);
                line.truncate(pos);
                // Tolerate CRLF peers
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }

                let line =
                    String::from_utf8(line.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)?;
                Ok(Some(line))
            }
            None => {
                if src.len() > self.max_line {
                    return Err(ProtocolError::LineTooLong {
                        size: src.len(),
                        max: self.max_line,
                    });
                }
                // Resume the newline scan where this call left off
                self.next_index = src.len();
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for WireCodec {
    type Error = ProtocolError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if line.len() > self.max_line {
            return Err(ProtocolError::LineTooLong {
                size: line.len(),
                max: self.max_line,
            });
        }

        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
