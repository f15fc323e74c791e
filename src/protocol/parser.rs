//! Incremental RESP Request Parser
//!
//! The parser is handed whatever bytes a connection has buffered so far and
//! answers one of three ways:
//!
//! - `Ok(Some((value, consumed)))` - a complete request; the caller drops
//!   `consumed` bytes from the front of its buffer
//! - `Ok(None)` - the request is not complete yet, read more
//! - `Err(ParseError)` - the bytes can never form a valid request
//!
//! Two request encodings are accepted: RESP arrays of bulk strings, which is
//! what client libraries send, and inline commands (`GET foo\r\n`), which is
//! what a person typing into telnet or netcat sends.

use crate::protocol::types::{prefix, RespValue};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur during request parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// A request started with a type byte that cannot begin a command
    #[error("expected '*' or an inline command, got {0:#04x}")]
    UnexpectedPrefix(u8),

    /// An array element was not a bulk string
    #[error("expected '$', got {0:#04x}")]
    ExpectedBulkString(u8),

    /// A length header was not a decimal integer
    #[error("invalid length: {0}")]
    InvalidInteger(String),

    /// An inline command was not valid UTF-8
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("invalid bulk length: {0}")]
    InvalidBulkLength(i64),

    #[error("invalid multibulk length: {0}")]
    InvalidArrayLength(i64),

    /// Framing violation (missing CRLF, empty inline command, ...)
    #[error("{0}")]
    ProtocolError(String),

    /// A single argument exceeds the configured limit
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

impl ParseError {
    /// Returns true when the stream cannot be resynchronised and the
    /// connection has to be closed once the error reply is written.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ParseError::MessageTooLarge { .. } | ParseError::InvalidArrayLength(_)
        )
    }
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Default limit for a single bulk argument (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Upper bound on the number of arguments in one request
pub const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// Parser for client requests.
///
/// The parser is stateless between calls, so a connection can keep one
/// around and hand it the full buffer again after every read.
///
/// # Example
///
/// ```
/// use pipekv::protocol::{RespParser, RespValue};
///
/// let parser = RespParser::new();
/// let buf = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n";
/// let (value, consumed) = parser.parse(buf).unwrap().unwrap();
/// assert_eq!(consumed, buf.len());
/// assert!(matches!(value, RespValue::Array(ref args) if args.len() == 2));
///
/// // Half a request is not an error, just not ready yet
/// assert!(parser.parse(&buf[..10]).unwrap().is_none());
/// ```
#[derive(Debug, Clone)]
pub struct RespParser {
    max_bulk_len: usize,
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RespParser {
    pub fn new() -> Self {
        Self {
            max_bulk_len: MAX_BULK_SIZE,
        }
    }

    /// Creates a parser that rejects bulk arguments longer than `max_bulk_len`.
    pub fn with_max_bulk_len(max_bulk_len: usize) -> Self {
        Self { max_bulk_len }
    }

    /// Attempts to parse one request from the front of `buf`.
    pub fn parse(&self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };

        match first {
            prefix::ARRAY => self.parse_array(buf),
            prefix::SIMPLE_STRING | prefix::ERROR | prefix::INTEGER | prefix::BULK_STRING => {
                Err(ParseError::UnexpectedPrefix(first))
            }
            _ => self.parse_inline(buf),
        }
    }

    /// Parses `*<count>\r\n` followed by `count` bulk strings.
    fn parse_array(&self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let Some((header, mut pos)) = read_line(buf, 1)? else {
            return Ok(None);
        };

        let count = parse_length(header)?;
        if count == -1 {
            return Ok(Some((RespValue::Null, pos)));
        }
        if !(0..=MAX_ARRAY_LEN).contains(&count) {
            return Err(ParseError::InvalidArrayLength(count));
        }

        let mut args = Vec::with_capacity((count as usize).min(16));
        for _ in 0..count {
            match self.parse_bulk(buf, pos)? {
                Some((arg, next)) => {
                    args.push(arg);
                    pos = next;
                }
                None => return Ok(None),
            }
        }

        Ok(Some((RespValue::Array(args), pos)))
    }

    /// Parses `$<len>\r\n<data>\r\n` starting at `start`.
    fn parse_bulk(&self, buf: &[u8], start: usize) -> ParseResult<Option<(RespValue, usize)>> {
        let Some(&first) = buf.get(start) else {
            return Ok(None);
        };
        if first != prefix::BULK_STRING {
            return Err(ParseError::ExpectedBulkString(first));
        }

        let Some((header, data_start)) = read_line(buf, start + 1)? else {
            return Ok(None);
        };

        let len = parse_length(header)?;
        if len == -1 {
            return Ok(Some((RespValue::Null, data_start)));
        }
        if len < 0 {
            return Err(ParseError::InvalidBulkLength(len));
        }

        let len = len as usize;
        if len > self.max_bulk_len {
            return Err(ParseError::MessageTooLarge {
                size: len,
                max: self.max_bulk_len,
            });
        }

        let data_end = data_start + len;
        if buf.len() < data_end + 2 {
            return Ok(None);
        }
        if &buf[data_end..data_end + 2] != b"\r\n" {
            return Err(ParseError::ProtocolError(
                "bulk string missing trailing CRLF".to_string(),
            ));
        }

        let data = Bytes::copy_from_slice(&buf[data_start..data_end]);
        Ok(Some((RespValue::BulkString(data), data_end + 2)))
    }

    /// Parses a whitespace separated command terminated by `\n` or `\r\n`.
    fn parse_inline(&self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };

        let line = buf[..newline].strip_suffix(b"\r").unwrap_or(&buf[..newline]);
        let line = std::str::from_utf8(line).map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;

        let args: Vec<RespValue> = line
            .split_whitespace()
            .map(|part| RespValue::BulkString(Bytes::copy_from_slice(part.as_bytes())))
            .collect();
        if args.is_empty() {
            return Err(ParseError::ProtocolError("empty inline command".to_string()));
        }

        Ok(Some((RespValue::Array(args), newline + 1)))
    }
}

/// Reads a CRLF terminated line beginning at `start`.
///
/// Returns the line without its terminator and the offset just past it.
fn read_line(buf: &[u8], start: usize) -> ParseResult<Option<(&[u8], usize)>> {
    let rest = buf.get(start..).unwrap_or_default();
    match rest.windows(2).position(|w| w == b"\r\n") {
        Some(end) => Ok(Some((&rest[..end], start + end + 2))),
        None => {
            // A length header is at most a sign and 20 digits
            if rest.len() > 32 {
                Err(ParseError::ProtocolError("length header too long".to_string()))
            } else {
                Ok(None)
            }
        }
    }
}

fn parse_length(line: &[u8]) -> ParseResult<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ParseError::InvalidInteger(String::from_utf8_lossy(line).into_owned()))
}

/// Parses a single request with a default parser.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> RespValue {
        RespValue::BulkString(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn test_parse_set_command() {
        let input = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        let (value, consumed) = parse_message(input).unwrap().unwrap();
        assert_eq!(value, RespValue::Array(vec![bulk("SET"), bulk("foo"), bulk("bar")]));
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_incomplete_at_every_split() {
        let input = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n";
        for split in 0..input.len() {
            assert!(
                parse_message(&input[..split]).unwrap().is_none(),
                "split at {} should be incomplete",
                split
            );
        }
    }

    #[test]
    fn test_consumes_only_first_request() {
        let input = b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n*2\r\n$3\r\nGET\r\n$1\r\nb\r\n";
        let (value, consumed) = parse_message(input).unwrap().unwrap();
        assert_eq!(value, RespValue::Array(vec![bulk("GET"), bulk("a")]));
        assert_eq!(consumed, 20);

        let (value, _) = parse_message(&input[consumed..]).unwrap().unwrap();
        assert_eq!(value, RespValue::Array(vec![bulk("GET"), bulk("b")]));
    }

    #[test]
    fn test_binary_safe_argument() {
        let input = b"*2\r\n$3\r\nGET\r\n$5\r\nhe\r\no\r\n";
        let (value, _) = parse_message(input).unwrap().unwrap();
        assert_eq!(
            value,
            RespValue::Array(vec![bulk("GET"), RespValue::BulkString(Bytes::from(&b"he\r\no"[..]))])
        );
    }

    #[test]
    fn test_parse_inline_command() {
        let (value, consumed) = parse_message(b"SET foo  bar\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Array(vec![bulk("SET"), bulk("foo"), bulk("bar")]));
        assert_eq!(consumed, 14);

        // Bare LF from netcat
        let (value, consumed) = parse_message(b"FOO\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Array(vec![bulk("FOO")]));
        assert_eq!(consumed, 4);

        assert!(parse_message(b"GET fo").unwrap().is_none());
    }

    #[test]
    fn test_empty_inline_command_is_error() {
        let result = parse_message(b"   \r\n");
        assert!(matches!(result, Err(ParseError::ProtocolError(_))));
    }

    #[test]
    fn test_non_array_request_is_rejected() {
        assert_eq!(
            parse_message(b"$3\r\nGET\r\n"),
            Err(ParseError::UnexpectedPrefix(b'$'))
        );
        assert_eq!(
            parse_message(b"*1\r\n:1\r\n"),
            Err(ParseError::ExpectedBulkString(b':'))
        );
    }

    #[test]
    fn test_invalid_lengths() {
        assert!(matches!(
            parse_message(b"*x\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
        assert_eq!(
            parse_message(b"*1\r\n$-5\r\n"),
            Err(ParseError::InvalidBulkLength(-5))
        );
        let err = parse_message(b"*-2\r\n").unwrap_err();
        assert_eq!(err, ParseError::InvalidArrayLength(-2));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_trailing_crlf() {
        let result = parse_message(b"*1\r\n$3\r\nGETxx");
        assert!(matches!(result, Err(ParseError::ProtocolError(_))));
    }

    #[test]
    fn test_bulk_limit() {
        let parser = RespParser::with_max_bulk_len(4);
        let err = parser.parse(b"*1\r\n$5\r\n").unwrap_err();
        assert_eq!(err, ParseError::MessageTooLarge { size: 5, max: 4 });
        assert!(err.is_fatal());
        assert!(parser.parse(b"*1\r\n$4\r\nabcd\r\n").unwrap().is_some());
    }

    #[test]
    fn test_runaway_header() {
        let mut input = b"*".to_vec();
        input.extend(std::iter::repeat(b'9').take(40));
        assert!(matches!(
            parse_message(&input),
            Err(ParseError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_null_and_empty_arrays() {
        assert_eq!(parse_message(b"*-1\r\n").unwrap(), Some((RespValue::Null, 5)));
        assert_eq!(
            parse_message(b"*0\r\n").unwrap(),
            Some((RespValue::Array(vec![]), 4))
        );
    }
}
