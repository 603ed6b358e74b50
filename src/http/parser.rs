//! HTTP/1.1 response head parsing
//!
//! [`ResponseHeadParser`] is fed raw bytes and yields the status line and
//! header section once the blank line has been seen. Whatever follows the
//! head stays buffered for the body reader ([`ResponseHeadParser::take_remaining`]).

use super::{Error, Headers, ResponseHead, Result, Status, Version, MAX_HEADERS, MAX_HEAD_SIZE};
use bytes::{Buf, BytesMut};

/// Find the next CRLF in a buffer
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Parse HTTP response status line
///
/// Format: `VERSION SP STATUS [SP REASON]`, e.g. `HTTP/1.1 200 OK`
pub fn parse_status_line(line: &str) -> Result<(Version, Status, String)> {
    let mut parts = line.splitn(3, ' ');
    let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
        return Err(Error::Parse(format!("Invalid status line: {:?}", line)));
    };

    let version = Version::from_str(version)?;
    let status = Status::from_bytes(code.as_bytes())?;
    let reason = match parts.next() {
        Some(reason) if !reason.is_empty() => reason.to_string(),
        _ => status.reason_phrase().to_string(),
    };

    Ok((version, status, reason))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    StatusLine,
    Headers,
    Complete,
}

/// Incremental parser for one response head
pub struct ResponseHeadParser {
    state: ParserState,
    buffer: BytesMut,
    /// Bytes of the current head consumed so far
    head_len: usize,
    status_line: Option<(Version, Status, String)>,
    headers: Headers,
}

impl ResponseHeadParser {
    pub fn new() -> Self {
        ResponseHeadParser {
            state: ParserState::StatusLine,
            buffer: BytesMut::with_capacity(4096),
            head_len: 0,
            status_line: None,
            headers: Headers::new(),
        }
    }

    /// Feed data to the parser
    ///
    /// Returns `Ok(Some(head))` once the head is complete, `Ok(None)` if more
    /// data is needed.
    pub fn parse(&mut self, data: &[u8]) -> Result<Option<ResponseHead>> {
        self.buffer.extend_from_slice(data);
        self.advance()
    }

    fn advance(&mut self) -> Result<Option<ResponseHead>> {
        loop {
            if self.state == ParserState::Complete {
                return Ok(None);
            }

            let Some(crlf_pos) = find_crlf(&self.buffer) else {
                if self.head_len + self.buffer.len() > MAX_HEAD_SIZE {
                    return Err(Error::Parse(format!(
                        "response head exceeds {} bytes",
                        MAX_HEAD_SIZE
                    )));
                }
                return Ok(None);
            };

            self.head_len += crlf_pos + 2;
            if self.head_len > MAX_HEAD_SIZE {
                return Err(Error::Parse(format!("response head exceeds {} bytes", MAX_HEAD_SIZE)));
            }
            let line = String::from_utf8_lossy(&self.buffer[..crlf_pos]).into_owned();
            self.buffer.advance(crlf_pos + 2);

            match self.state {
                ParserState::StatusLine => {
                    self.status_line = Some(parse_status_line(&line)?);
                    self.state = ParserState::Headers;
                }
                ParserState::Headers if line.is_empty() => {
                    self.state = ParserState::Complete;
                    let Some((version, status, reason)) = self.status_line.take() else {
                        return Err(Error::Incomplete);
                    };
                    let headers = std::mem::take(&mut self.headers);
                    return Ok(Some(ResponseHead::new(version, status, headers).with_reason(reason)));
                }
                ParserState::Headers => {
                    if line.starts_with(' ') || line.starts_with('\t') {
                        return Err(Error::InvalidHeader("obsolete line folding".to_string()));
                    }
                    if self.headers.len() >= MAX_HEADERS {
                        return Err(Error::Parse(format!("more than {} header lines", MAX_HEADERS)));
                    }
                    let (name, value) = Headers::parse_header_line(&line)?;
                    self.headers.insert(name, value);
                }
                ParserState::Complete => return Ok(None),
            }
        }
    }

    /// Bytes received after the head, the start of the body
    pub fn take_remaining(&mut self) -> BytesMut {
        self.buffer.split()
    }

    /// Reset the parser for the next head, keeping buffered bytes
    ///
    /// An interim (1xx) response is followed directly by the next head.
    pub fn reset(&mut self) {
        self.state = ParserState::StatusLine;
        self.head_len = 0;
        self.status_line = None;
        self.headers.clear();
    }

    /// Parse any complete head already sitting in the buffer
    pub fn parse_buffered(&mut self) -> Result<Option<ResponseHead>> {
        self.advance()
    }
}

impl Default for ResponseHeadParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_line() {
        let (version, status, reason) = parse_status_line("HTTP/1.1 200 OK").unwrap();
        assert_eq!(version, Version::Http11);
        assert_eq!(status.code(), 200);
        assert_eq!(reason, "OK");

        let (version, status, reason) = parse_status_line("HTTP/1.0 404").unwrap();
        assert_eq!(version, Version::Http10);
        assert_eq!(status.code(), 404);
        assert_eq!(reason, "Not Found");

        let (_, _, reason) = parse_status_line("HTTP/1.1 500 Something Broke").unwrap();
        assert_eq!(reason, "Something Broke");

        assert!(parse_status_line("HTTP/1.1").is_err());
        assert!(parse_status_line("HTTP/1.1 abc OK").is_err());
    }

    #[test]
    fn test_head_in_pieces_keeps_body_bytes() {
        let mut parser = ResponseHeadParser::new();
        assert!(parser.parse(b"HTTP/1.1 200 OK\r\nContent-Le").unwrap().is_none());
        assert!(parser.parse(b"ngth: 5\r\nX-A: 1\r").unwrap().is_none());

        let head = parser.parse(b"\n\r\nhel").unwrap().unwrap();
        assert_eq!(head.status().code(), 200);
        assert_eq!(head.headers().get("x-a"), Some("1"));
        assert_eq!(head.content_length().unwrap(), Some(5));
        assert_eq!(&parser.take_remaining()[..], b"hel");
    }

    #[test]
    fn test_interim_response_then_final() {
        let mut parser = ResponseHeadParser::new();
        let wire = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n";

        let interim = parser.parse(wire).unwrap().unwrap();
        assert!(interim.status().is_informational());

        parser.reset();
        let head = parser.parse_buffered().unwrap().unwrap();
        assert_eq!(head.status(), Status::NO_CONTENT);
        assert!(parser.take_remaining().is_empty());
    }

    #[test]
    fn test_rejects_malformed_headers() {
        let mut parser = ResponseHeadParser::new();
        assert!(parser.parse(b"HTTP/1.1 200 OK\r\nNoColon\r\n\r\n").is_err());

        let mut parser = ResponseHeadParser::new();
        assert!(parser.parse(b"HTTP/1.1 200 OK\r\nA: 1\r\n folded\r\n\r\n").is_err());
    }

    #[test]
    fn test_head_size_limit() {
        let mut parser = ResponseHeadParser::new();
        parser.parse(b"HTTP/1.1 200 OK\r\n").unwrap();
        let huge = vec![b'a'; MAX_HEAD_SIZE + 1];
        assert!(parser.parse(&huge).is_err());
    }
}
