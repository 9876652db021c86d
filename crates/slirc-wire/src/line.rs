//! Line buffering and decoding.
//!
//! [`LineBuffer`] is the sans-IO core: it accepts raw byte chunks at
//! arbitrary boundaries and yields complete, terminator-stripped lines in
//! arrival order. A terminator split across two chunks (`...\r` / `\n...`)
//! is handled by holding a trailing `\r` until the next byte arrives, so no
//! line is ever dropped, duplicated, or emitted early.
//!
//! [`LineCodec`] adapts the same framing to the tokio codec framework for
//! the engine's transports. Decoding failures and oversized lines surface
//! as recoverable [`DecodedLine`] items rather than stream errors, so one
//! bad line never desynchronizes the connection.

use bytes::{Buf, BytesMut};
use encoding::Encoding;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{DecodeError, ProtocolError, Result};
use crate::message::{validate_outbound, MAX_LINE_LEN};

/// How undecodable bytes are handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DecodePolicy {
    /// Fail the line with a [`DecodeError`]; later lines are unaffected.
    #[default]
    Strict,
    /// Try the primary encoding, fall back to Latin-1 (total, never fails).
    Lenient,
    /// Substitute U+FFFD for undecodable sequences.
    Replace,
}

fn decode_bytes(
    encoding: &'static Encoding,
    policy: DecodePolicy,
    bytes: &[u8],
) -> Result<String, DecodeError> {
    match policy {
        DecodePolicy::Strict => encoding
            .decode_without_bom_handling_and_without_replacement(bytes)
            .map(|cow| cow.into_owned())
            .ok_or_else(|| DecodeError {
                raw: bytes.to_vec(),
                encoding: encoding.name(),
            }),
        DecodePolicy::Lenient => Ok(encoding
            .decode_without_bom_handling_and_without_replacement(bytes)
            .map(|cow| cow.into_owned())
            // Latin-1 maps every byte, so the fallback is total.
            .unwrap_or_else(|| bytes.iter().map(|&b| b as char).collect())),
        DecodePolicy::Replace => Ok(encoding.decode_without_bom_handling(bytes).0.into_owned()),
    }
}

fn lookup_encoding(label: &str) -> Result<&'static Encoding> {
    Encoding::for_label(label.as_bytes())
        .ok_or_else(|| ProtocolError::UnknownEncoding(label.to_owned()))
}

/// Restartable byte-to-line buffer.
///
/// # Example
///
/// ```
/// use slirc_wire::line::{DecodePolicy, LineBuffer};
///
/// let mut buf = LineBuffer::new(DecodePolicy::Strict);
/// buf.feed(b"PING :one\r\nPI");
/// assert_eq!(buf.next_line().unwrap().unwrap(), "PING :one");
/// assert!(buf.next_line().is_none());
/// buf.feed(b"NG :two\r\n");
/// assert_eq!(buf.next_line().unwrap().unwrap(), "PING :two");
/// ```
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    encoding: &'static Encoding,
    policy: DecodePolicy,
    /// Index of the next unexamined byte.
    scan: usize,
}

impl LineBuffer {
    /// UTF-8 buffer with the given policy.
    pub fn new(policy: DecodePolicy) -> Self {
        Self {
            buf: BytesMut::new(),
            encoding: encoding::UTF_8,
            policy,
            scan: 0,
        }
    }

    /// Buffer with an explicit primary encoding label (e.g. `"iso-8859-1"`).
    pub fn with_encoding(label: &str, policy: DecodePolicy) -> Result<Self> {
        Ok(Self {
            buf: BytesMut::new(),
            encoding: lookup_encoding(label)?,
            policy,
            scan: 0,
        })
    }

    /// Append a chunk of raw bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as lines.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete line, if one has been terminated.
    pub fn next_line(&mut self) -> Option<Result<String, DecodeError>> {
        let rel = self.buf[self.scan..]
            .iter()
            .position(|&b| b == b'\r' || b == b'\n');
        let pos = match rel {
            Some(rel) => self.scan + rel,
            None => {
                self.scan = self.buf.len();
                return None;
            }
        };
        if self.buf[pos] == b'\r' && pos + 1 == self.buf.len() {
            // Might be the first half of a split \r\n; wait for more bytes.
            self.scan = pos;
            return None;
        }
        let line = self.buf.split_to(pos);
        // Consume the terminator: \r\n, lone \n, or lone \r.
        let skip = if self.buf[0] == b'\r' && self.buf.get(1) == Some(&b'\n') {
            2
        } else {
            1
        };
        self.buf.advance(skip);
        self.scan = 0;
        Some(decode_bytes(self.encoding, self.policy, &line))
    }
}

impl Iterator for LineBuffer {
    type Item = Result<String, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_line()
    }
}

/// One decoder item: a line, or a recoverable per-line failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodedLine {
    /// A complete decoded line, terminator stripped.
    Line(String),
    /// The line's bytes were rejected by the strict decode policy.
    Invalid(DecodeError),
    /// The line exceeded the maximum length and was dropped whole.
    TooLong {
        /// Received length including terminator.
        actual: usize,
        /// Configured limit.
        limit: usize,
    },
}

/// Tokio codec for newline-terminated IRC lines.
///
/// Lines are limited to 512 bytes (the IRC standard) unless overridden.
pub struct LineCodec {
    encoding: &'static Encoding,
    policy: DecodePolicy,
    /// Index of next byte to check for newline.
    next_index: usize,
    max_len: usize,
}

impl LineCodec {
    /// Create a codec with the given encoding label and policy.
    pub fn new(label: &str, policy: DecodePolicy) -> Result<Self> {
        Ok(Self {
            encoding: lookup_encoding(label)?,
            policy,
            next_index: 0,
            max_len: MAX_LINE_LEN,
        })
    }

    /// Override the maximum line length.
    #[must_use]
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// The configured maximum line length.
    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

impl Decoder for LineCodec {
    type Item = DecodedLine;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DecodedLine>> {
        let Some(offset) = src[self.next_index..].iter().position(|&b| b == b'\n') else {
            self.next_index = src.len();
            // A peer that never terminates a line gets a hard cap; this is
            // the only unrecoverable framing failure.
            if src.len() > self.max_len * 64 {
                return Err(ProtocolError::MessageTooLong {
                    actual: src.len(),
                    limit: self.max_len * 64,
                });
            }
            return Ok(None);
        };

        let line = src.split_to(self.next_index + offset + 1);
        self.next_index = 0;

        if line.len() > self.max_len {
            return Ok(Some(DecodedLine::TooLong {
                actual: line.len(),
                limit: self.max_len,
            }));
        }

        let mut body: &[u8] = &line;
        while let [rest @ .., b'\r' | b'\n'] = body {
            body = rest;
        }
        Ok(Some(match decode_bytes(self.encoding, self.policy, body) {
            Ok(text) => DecodedLine::Line(text),
            Err(err) => DecodedLine::Invalid(err),
        }))
    }
}

impl Encoder<String> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: String, dst: &mut BytesMut) -> Result<()> {
        validate_outbound(&msg, self.max_len)?;
        let (bytes, _, _) = self.encoding.encode(&msg);
        dst.extend_from_slice(&bytes);
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(buf: &mut LineBuffer) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = buf.next_line() {
            out.push(line.unwrap());
        }
        out
    }

    #[test]
    fn lines_across_chunk_boundaries() {
        let mut buf = LineBuffer::new(DecodePolicy::Strict);
        buf.feed(b"NOTICE * :he");
        assert!(buf.next_line().is_none());
        buf.feed(b"llo\r\nPING :x\r\n");
        assert_eq!(drain(&mut buf), vec!["NOTICE * :hello", "PING :x"]);
    }

    #[test]
    fn split_crlf_terminator() {
        let mut buf = LineBuffer::new(DecodePolicy::Strict);
        buf.feed(b"first\r");
        assert!(buf.next_line().is_none());
        buf.feed(b"\nsecond\n");
        assert_eq!(drain(&mut buf), vec!["first", "second"]);
    }

    #[test]
    fn byte_at_a_time() {
        let mut buf = LineBuffer::new(DecodePolicy::Strict);
        let mut out = Vec::new();
        for &b in b"a\r\nbb\ncc\rdd\r\n" {
            buf.feed(&[b]);
            while let Some(line) = buf.next_line() {
                out.push(line.unwrap());
            }
        }
        assert_eq!(out, vec!["a", "bb", "cc", "dd"]);
    }

    #[test]
    fn strict_failure_is_per_line() {
        let mut buf = LineBuffer::new(DecodePolicy::Strict);
        buf.feed(b"ok one\r\n\xff\xfe bad\r\nok two\r\n");
        assert_eq!(buf.next_line().unwrap().unwrap(), "ok one");
        let err = buf.next_line().unwrap().unwrap_err();
        assert_eq!(err.encoding, "UTF-8");
        assert_eq!(err.raw, b"\xff\xfe bad".to_vec());
        assert_eq!(buf.next_line().unwrap().unwrap(), "ok two");
    }

    #[test]
    fn lenient_falls_back_to_latin1() {
        let mut buf = LineBuffer::new(DecodePolicy::Lenient);
        buf.feed(b"caf\xe9\r\n");
        assert_eq!(buf.next_line().unwrap().unwrap(), "café");
    }

    #[test]
    fn replace_substitutes() {
        let mut buf = LineBuffer::new(DecodePolicy::Replace);
        buf.feed(b"a\xffb\r\n");
        assert_eq!(buf.next_line().unwrap().unwrap(), "a\u{fffd}b");
    }

    #[test]
    fn codec_decodes_and_recovers() {
        let mut codec = LineCodec::new("utf-8", DecodePolicy::Strict).unwrap();
        let mut src = BytesMut::from(&b"PING :a\r\n\xff\r\nPING :b\r\n"[..]);
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(DecodedLine::Line("PING :a".into()))
        );
        assert!(matches!(
            codec.decode(&mut src).unwrap(),
            Some(DecodedLine::Invalid(_))
        ));
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(DecodedLine::Line("PING :b".into()))
        );
        assert_eq!(codec.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn codec_drops_oversized_line_and_resyncs() {
        let mut codec = LineCodec::new("utf-8", DecodePolicy::Strict).unwrap();
        let long = format!("PRIVMSG #c :{}\r\n", "x".repeat(600));
        let mut src = BytesMut::from(format!("{long}PING :ok\r\n").as_bytes());
        assert!(matches!(
            codec.decode(&mut src).unwrap(),
            Some(DecodedLine::TooLong { .. })
        ));
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(DecodedLine::Line("PING :ok".into()))
        );
    }

    #[test]
    fn codec_encode_appends_terminator() {
        let mut codec = LineCodec::new("utf-8", DecodePolicy::Strict).unwrap();
        let mut dst = BytesMut::new();
        codec.encode("PRIVMSG #c :hi".to_owned(), &mut dst).unwrap();
        assert_eq!(&dst[..], b"PRIVMSG #c :hi\r\n");
    }

    #[test]
    fn codec_encode_rejects_embedded_newline() {
        let mut codec = LineCodec::new("utf-8", DecodePolicy::Strict).unwrap();
        let mut dst = BytesMut::new();
        assert!(codec
            .encode("QUIT :a\r\nPRIVMSG".to_owned(), &mut dst)
            .is_err());
        assert!(dst.is_empty());
    }
}
