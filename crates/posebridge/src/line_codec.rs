//! Line framing for worker output.
//!
//! Unlike `tokio_util::codec::LinesCodec` this yields raw bytes: a line that
//! is not valid UTF-8 must be reported and skipped by the consumer, not end
//! the stream. Works over any AsyncRead (pipes, sockets, in-memory buffers).

use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Longest line handed out in one piece. Longer runs without a newline are
/// split so a runaway writer cannot grow the buffer without bound.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Splits a byte stream on `\n`, trimming a trailing `\r`.
///
/// The final line is delivered at end of stream even without a terminator.
#[derive(Debug, Clone)]
pub struct LineCodec {
    /// Offset already scanned for a newline, so partial reads are not rescanned.
    next_index: usize,
    max_length: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length: max_length.max(1),
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

fn without_terminator(mut line: BytesMut) -> Bytes {
    if line.last() == Some(&b'\n') {
        line.truncate(line.len() - 1);
    }
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    line.freeze()
}

impl Decoder for LineCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let scan_end = src.len().min(self.max_length.saturating_add(1));
        let newline = src[self.next_index.min(scan_end)..scan_end]
            .iter()
            .position(|b| *b == b'\n')
            .map(|offset| self.next_index + offset);

        match newline {
            Some(pos) => {
                self.next_index = 0;
                let line = src.split_to(pos + 1);
                Ok(Some(without_terminator(line)))
            }
            None if src.len() > self.max_length => {
                self.next_index = 0;
                let chunk = src.split_to(self.max_length);
                tracing::trace!(max_length = self.max_length, "Splitting overlong line");
                Ok(Some(chunk.freeze()))
            }
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        let line = without_terminator(rest);
        if line.is_empty() {
            // A lone `\r` left at EOF carries no content.
            return Ok(None);
        }
        Ok(Some(line))
    }
}
