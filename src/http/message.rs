//! HTTP message types
//!
//! Requests go out as an [`HttpRequest`] (head plus an optional in-memory
//! body); responses come back as a [`ResponseHead`] whose body is streamed
//! separately by the transport.

use super::{Error, Headers, Result, CRLF};
use bytes::Bytes;
use std::fmt;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP version a response was received with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
    Http2,
}

impl Version {
    /// Parse the version of an HTTP/1.x status line
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            _ => Err(Error::InvalidVersion(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
            Version::Http2 => "HTTP/2",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    pub fn new(code: u16) -> Result<Self> {
        if (100..600).contains(&code) {
            Ok(Status { code })
        } else {
            Err(Error::InvalidStatus(format!("Invalid status code: {}", code)))
        }
    }

    /// Parse a three-digit status code as it appears on the wire
    pub fn from_bytes(digits: &[u8]) -> Result<Self> {
        if digits.len() != 3 || !digits.iter().all(u8::is_ascii_digit) {
            return Err(Error::InvalidStatus(String::from_utf8_lossy(digits).into_owned()));
        }
        let code = digits.iter().fold(0u16, |acc, d| acc * 10 + (d - b'0') as u16);
        Status::new(code)
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// Canonical reason phrase for this status code
    pub fn reason_phrase(&self) -> &'static str {
        match self.code {
            100 => "Continue",
            101 => "Switching Protocols",
            103 => "Early Hints",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            409 => "Conflict",
            413 => "Content Too Large",
            429 => "Too Many Requests",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "Unknown",
        }
    }

    /// 1xx: an interim response, the final one is still to come
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub const OK: Status = Status { code: 200 };
    pub const NO_CONTENT: Status = Status { code: 204 };
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason_phrase())
    }
}

/// Outgoing request
///
/// `uri` is the request target in origin form (`/path?query`); scheme and
/// authority come from the destination the request is sent to.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    uri: String,
    headers: Headers,
    body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        HttpRequest {
            method,
            uri: uri.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn builder() -> HttpRequestBuilder {
        HttpRequestBuilder::default()
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn set_uri(&mut self, uri: impl Into<String>) {
        self.uri = uri.into();
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// Serialize the HTTP/1.1 request line and header section
    pub fn head_to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);

        buf.extend_from_slice(self.method.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.uri.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(Version::Http11.as_str().as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());

        for (name, value) in self.headers.iter() {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(CRLF.as_bytes());
        }

        buf.extend_from_slice(CRLF.as_bytes());
        buf
    }
}

/// Builder for HTTP requests
#[derive(Debug, Default)]
pub struct HttpRequestBuilder {
    method: Option<Method>,
    uri: Option<String>,
    headers: Headers,
    body: Bytes,
}

impl HttpRequestBuilder {
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Defaults to `GET /`
    pub fn build(self) -> HttpRequest {
        HttpRequest {
            method: self.method.unwrap_or(Method::Get),
            uri: self.uri.unwrap_or_else(|| "/".to_string()),
            headers: self.headers,
            body: self.body,
        }
    }
}

/// Status line and header section of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    version: Version,
    status: Status,
    reason: String,
    headers: Headers,
}

impl ResponseHead {
    pub fn new(version: Version, status: Status, headers: Headers) -> Self {
        ResponseHead {
            version,
            status,
            reason: status.reason_phrase().to_string(),
            headers,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Reason phrase from the status line; the canonical one for HTTP/2
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Declared body length, if any and well-formed
    pub fn content_length(&self) -> Result<Option<u64>> {
        let values = self.headers.get_all("content-length");
        let Some(first) = values.first() else {
            return Ok(None);
        };
        // repeated identical values are allowed (RFC 9110 Section 8.6)
        let parsed = first
            .trim()
            .parse::<u64>()
            .map_err(|_| Error::Parse(format!("Invalid Content-Length: {}", first)))?;
        if values.iter().any(|v| v.trim() != first.trim()) {
            return Err(Error::Parse("conflicting Content-Length values".to_string()));
        }
        Ok(Some(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_from_str() {
        assert_eq!(Version::from_str("HTTP/1.0").unwrap(), Version::Http10);
        assert_eq!(Version::from_str("HTTP/1.1").unwrap(), Version::Http11);
        assert!(Version::from_str("HTTP/2.0").is_err());
        assert_eq!(Version::Http2.to_string(), "HTTP/2");
    }

    #[test]
    fn test_status() {
        let status = Status::from_bytes(b"204").unwrap();
        assert_eq!(status, Status::NO_CONTENT);
        assert_eq!(status.reason_phrase(), "No Content");
        assert!(Status::from_bytes(b"20").is_err());
        assert!(Status::from_bytes(b"2x0").is_err());
        assert!(Status::from_bytes(b"099").is_err());
        assert!(Status::new(103).unwrap().is_informational());
    }

    #[test]
    fn test_request_head_to_wire() {
        let req = HttpRequest::builder()
            .method(Method::Post)
            .uri("/upload?x=1")
            .header("Host", "example.com")
            .body(&b"ignored here"[..])
            .build();

        let wire = String::from_utf8(req.head_to_wire()).unwrap();
        assert_eq!(wire, "POST /upload?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(req.body().as_ref(), b"ignored here");
    }

    #[test]
    fn test_content_length() {
        let mut headers = Headers::new();
        headers.insert("Content-Length", "42");
        headers.insert("content-length", "42");
        let head = ResponseHead::new(Version::Http11, Status::OK, headers.clone());
        assert_eq!(head.content_length().unwrap(), Some(42));

        headers.insert("Content-Length", "43");
        let head = ResponseHead::new(Version::Http11, Status::OK, headers);
        assert!(head.content_length().is_err());

        let head = ResponseHead::new(Version::Http2, Status::OK, Headers::new());
        assert_eq!(head.content_length().unwrap(), None);
        assert_eq!(head.reason(), "OK");
    }
}
