//! Byte-stream framing for line-oriented header-block protocols.
//!
//! The framer accumulates received chunks and offers two pull
//! operations: [`next_line`](LineFramer::next_line) for single lines and
//! [`next_block`](LineFramer::next_block) for `Key: Value` header blocks
//! terminated by an empty line. Engines pick whichever matches their
//! current parsing mode. Incomplete trailing data stays buffered across
//! calls, so feeding a frame one byte at a time yields the same output
//! as feeding it whole.

use crate::config::Encoding;
use crate::error::{Error, Result};
use crate::headers::Headers;

/// Stateful framer turning received bytes into decoded lines and header
/// blocks.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    pos: usize,
    encoding: Encoding,
    partial_block: Headers,
}

impl LineFramer {
    /// Framer decoding with the given text codec.
    pub fn new(encoding: Encoding) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            encoding,
            partial_block: Headers::new(),
        }
    }

    /// Append a received chunk.
    pub fn feed(&mut self, data: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Next complete line with the terminator trimmed, or `None` when
    /// the buffer holds no full line yet.
    ///
    /// Lines end with LF; a trailing CR is stripped, so both CRLF and
    /// lone LF are accepted. An empty line comes back as `Some("")`.
    /// Decoding failures are connection-fatal.
    pub fn next_line(&mut self) -> Result<Option<String>> {
        let Some(nl) = self.buf[self.pos..].iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let mut line = &self.buf[self.pos..self.pos + nl];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        let decoded = self.encoding.decode(line)?;
        self.pos += nl + 1;
        Ok(Some(decoded))
    }

    /// Next complete header block as ordered pairs, or `None` until the
    /// terminating empty line has arrived.
    ///
    /// Each non-empty line is split at the first `:`, with one leading
    /// space trimmed from the value. A line without a colon yields a
    /// [`Error::Protocol`] carrying the offending text; the line is
    /// consumed and the partial block is kept, so the caller decides
    /// whether to abort or keep pulling.
    pub fn next_block(&mut self) -> Result<Option<Headers>> {
        while let Some(line) = self.next_line()? {
            if line.is_empty() {
                return Ok(Some(std::mem::take(&mut self.partial_block)));
            }
            let (name, value) = split_header_line(&line)?;
            self.partial_block.push(name, value);
        }
        Ok(None)
    }

}

/// Split a `Key: Value` line, trimming one leading space of the value.
pub(crate) fn split_header_line(line: &str) -> Result<(&str, &str)> {
    let Some((name, value)) = line.split_once(':') else {
        return Err(Error::protocol(format!(
            "expected a key/value pair, got {line:?}"
        )));
    };
    Ok((name, value.strip_prefix(' ').unwrap_or(value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framer() -> LineFramer {
        LineFramer::new(Encoding::Utf8)
    }

    #[test]
    fn crlf_and_lf_both_terminate() {
        let mut f = framer();
        f.feed(b"first\r\nsecond\nthird");
        assert_eq!(f.next_line().unwrap(), Some("first".into()));
        assert_eq!(f.next_line().unwrap(), Some("second".into()));
        assert_eq!(f.next_line().unwrap(), None);
        f.feed(b"\r\n");
        assert_eq!(f.next_line().unwrap(), Some("third".into()));
    }

    #[test]
    fn empty_line_is_explicit() {
        let mut f = framer();
        f.feed(b"\r\n");
        assert_eq!(f.next_line().unwrap(), Some(String::new()));
    }

    #[test]
    fn byte_at_a_time_matches_whole_frame() {
        let frame = b"Event: Hangup\r\nUniqueid: 12.3\r\n\r\n";
        let mut whole = framer();
        whole.feed(frame);
        let mut split = framer();
        for b in frame {
            split.feed(&[*b]);
        }
        let a = whole.next_block().unwrap().unwrap();
        let b = split.next_block().unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.get("Event"), Some("Hangup"));
    }

    #[test]
    fn block_trims_one_leading_space_only() {
        let mut f = framer();
        f.feed(b"Key:  two spaces\r\nBare:value\r\n\r\n");
        let block = f.next_block().unwrap().unwrap();
        assert_eq!(block.get("Key"), Some(" two spaces"));
        assert_eq!(block.get("Bare"), Some("value"));
    }

    #[test]
    fn malformed_line_keeps_partial_block() {
        let mut f = framer();
        f.feed(b"Good: yes\r\nno colon here\r\nAlso: fine\r\n\r\n");
        let err = f.next_block().unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
        // The bad line is consumed; pulling again finishes the block.
        let block = f.next_block().unwrap().unwrap();
        assert_eq!(block.get("Good"), Some("yes"));
        assert_eq!(block.get("Also"), Some("fine"));
    }

    #[test]
    fn incomplete_block_returns_none() {
        let mut f = framer();
        f.feed(b"Event: Hangup\r\n");
        assert_eq!(f.next_block().unwrap(), None);
        f.feed(b"\r\n");
        let block = f.next_block().unwrap().unwrap();
        assert_eq!(block.len(), 1);
    }

    #[test]
    fn invalid_utf8_is_fatal() {
        let mut f = framer();
        f.feed(&[0xff, 0xfe, b'\n']);
        assert!(f.next_line().is_err());
    }

    #[test]
    fn latin1_decodes_high_bytes() {
        let mut f = LineFramer::new(Encoding::Latin1);
        f.feed(&[0x63, 0x61, 0x66, 0xe9, b'\n']);
        assert_eq!(f.next_line().unwrap(), Some("caf\u{e9}".into()));
    }

    #[test]
    fn mixed_line_and_block_pulls() {
        let mut f = framer();
        f.feed(b"Asterisk Call Manager/2.10.3\r\nEvent: Hangup\r\n\r\n");
        assert_eq!(
            f.next_line().unwrap(),
            Some("Asterisk Call Manager/2.10.3".into())
        );
        let block = f.next_block().unwrap().unwrap();
        assert_eq!(block.get("Event"), Some("Hangup"));
    }
}
