//! Line framing for the relay wire format.
//!
//! One message per line, terminated by `\n`. An inbound `\r\n` is accepted
//! and the `\r` stripped. There is no length prefix, so the decoder bounds
//! line length itself and rejects a stream that ends mid-line.

use crate::error::{ReadFailure, WriteFailure};
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Newline-delimited UTF-8 codec.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    /// Bytes of the current partial line already scanned for `\n`.
    next_index: usize,
}

impl LineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ReadFailure;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, ReadFailure> {
        let start = self.next_index.min(buf.len());
        let Some(offset) = buf[start..].iter().position(|&b| b == b'\n') else {
            // A trailing `\r` may be the first half of a `\r\n` terminator.
            let limit = self.max_length + usize::from(buf.last() == Some(&b'\r'));
            if buf.len() > limit {
                return Err(ReadFailure::LineTooLong(self.max_length));
            }
            self.next_index = buf.len();
            return Ok(None);
        };

        let newline = start + offset;
        self.next_index = 0;

        let frame = buf.split_to(newline + 1);
        let mut line = &frame[..newline];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        if line.len() > self.max_length {
            return Err(ReadFailure::LineTooLong(self.max_length));
        }

        std::str::from_utf8(line)
            .map(|s| Some(s.to_owned()))
            .map_err(|_| ReadFailure::InvalidUtf8)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, ReadFailure> {
        match self.decode(buf)? {
            Some(line) => Ok(Some(line)),
            None if buf.is_empty() => Ok(None),
            None => Err(ReadFailure::PartialLine(buf.len())),
        }
    }
}

impl Encoder<Bytes> for LineCodec {
    type Error = WriteFailure;

    fn encode(&mut self, line: Bytes, dst: &mut BytesMut) -> Result<(), WriteFailure> {
        dst.reserve(line.len() + 1);
        dst.put_slice(&line);
        dst.put_u8(b'\n');
        Ok(())
    }
}
