//! HTTP/2 exchange strategy
//!
//! Maps requests onto streams of a shared [`H2Connection`]: the request head
//! becomes pseudo-headers plus lowercased regular fields, the body becomes
//! DATA frames, and response events come back through the stream's channel.

use super::{BodyWrite, Canceller, Destination, Error, Exchange, Protocol, ResponseStream, Result};
use crate::http::h2::{self, H2Connection, RecvStream, ReleaseHook, SendStream, StreamEvent};
use crate::http::headers::CONNECTION_SPECIFIC;
use crate::http::hpack::HeaderField;
use crate::http::{Headers, HttpRequest, Method, ResponseHead, Version};
use bytes::Bytes;
use std::time::{Duration, Instant};

/// Fields encoded as never-indexed so they stay out of compression tables
const NEVER_INDEXED: &[&str] = &["authorization", "proxy-authorization"];

/// Convert regular header fields, dropping what HTTP/2 forbids
fn regular_fields(headers: &Headers, fields: &mut Vec<HeaderField>) {
    for (name, value) in headers.iter() {
        let name = name.to_ascii_lowercase();
        if CONNECTION_SPECIFIC.contains(&name.as_str()) {
            continue;
        }
        // TE is only allowed to carry "trailers" (RFC 9113 Section 8.2.2)
        if name == "te" && !value.trim().eq_ignore_ascii_case("trailers") {
            continue;
        }
        let field = if NEVER_INDEXED.contains(&name.as_str()) {
            HeaderField::sensitive(name, value.to_string())
        } else {
            HeaderField::new(name, value.to_string())
        };
        fields.push(field);
    }
}

/// The request header block: pseudo-headers first, then regular fields
pub(crate) fn request_fields(destination: &Destination, request: &HttpRequest) -> Result<Vec<HeaderField>> {
    request
        .headers()
        .validate()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;

    let authority = match request.headers().get("host") {
        Some(host) => host.to_string(),
        None => destination.authority(),
    };
    let mut fields = Vec::with_capacity(request.headers().len() + 4);
    fields.push(HeaderField::new(":method", request.method().as_str()));
    if request.method() == Method::Connect {
        fields.push(HeaderField::new(":authority", authority));
    } else {
        let path = match request.uri() {
            "" => "/".to_string(),
            uri => uri.to_string(),
        };
        fields.push(HeaderField::new(":scheme", destination.scheme().as_str()));
        fields.push(HeaderField::new(":authority", authority));
        fields.push(HeaderField::new(":path", path));
    }
    regular_fields(request.headers(), &mut fields);
    Ok(fields)
}

fn trailer_fields(trailers: &Headers) -> Result<Vec<HeaderField>> {
    trailers
        .validate()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
    let mut fields = Vec::with_capacity(trailers.len());
    regular_fields(trailers, &mut fields);
    Ok(fields)
}

/// An HTTP/2 connection shared by concurrent exchanges
pub(crate) struct Http2Connection {
    conn: H2Connection,
}

impl Http2Connection {
    pub(crate) fn new(conn: H2Connection) -> Self {
        Http2Connection { conn }
    }
}

impl Protocol for Http2Connection {
    fn version(&self) -> Version {
        Version::Http2
    }

    fn send(
        &self,
        destination: &Destination,
        request: HttpRequest,
        streaming: bool,
    ) -> Result<Exchange> {
        let fields = request_fields(destination, &request)?;
        let body = request.body().clone();
        let end_stream = !streaming && body.is_empty();

        let (mut send, recv) = self
            .conn
            .open_stream(fields, end_stream)
            .map_err(Error::from_h2)?;
        log::debug!(
            "HTTP/2 {} {} on stream {} (streaming={})",
            request.method(),
            request.uri(),
            send.id(),
            streaming
        );

        let body: Option<Box<dyn BodyWrite>> = if streaming {
            Some(Box::new(H2BodyWriter { send }))
        } else {
            if !body.is_empty() {
                send.send_data(body, true).map_err(Error::from_h2)?;
            }
            None
        };
        Ok(Exchange {
            body,
            response: Box::new(H2Response {
                recv,
                ended: false,
                trailers: None,
            }),
        })
    }

    fn try_acquire(&self) -> bool {
        self.conn.has_capacity()
    }

    fn load(&self) -> usize {
        self.conn.active_streams()
    }

    fn is_open(&self) -> bool {
        self.conn.is_accepting()
    }

    fn idle_since(&self) -> Option<Instant> {
        self.conn.idle_since()
    }

    fn set_release_hook(&self, hook: ReleaseHook) {
        self.conn.set_release_hook(hook);
    }

    fn close(&self) {
        self.conn.close();
    }
}

struct H2BodyWriter {
    send: SendStream,
}

impl BodyWrite for H2BodyWriter {
    fn write(&mut self, data: Bytes) -> Result<()> {
        if self.send.is_finished() {
            return Err(Error::InvalidRequest("request body already finished".to_string()));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.send.send_data(data, false).map_err(Error::from_h2)
    }

    fn finish(&mut self, trailers: Option<Headers>) -> Result<()> {
        if self.send.is_finished() {
            return Err(Error::InvalidRequest("request body already finished".to_string()));
        }
        match trailers {
            Some(trailers) => {
                let fields = trailer_fields(&trailers)?;
                self.send.send_trailers(fields).map_err(Error::from_h2)
            }
            None => self.send.send_data(Bytes::new(), true).map_err(Error::from_h2),
        }
    }

    fn abort(&mut self) {
        self.send.cancel();
    }
}

struct H2Response {
    recv: RecvStream,
    ended: bool,
    trailers: Option<Headers>,
}

fn unexpected(what: &str) -> Error {
    Error::H2(h2::Error::Protocol(format!("unexpected {} on response stream", what)))
}

impl ResponseStream for H2Response {
    fn head(&mut self, timeout: Option<Duration>) -> Result<ResponseHead> {
        match self.recv.recv(timeout).map_err(Error::from_h2)? {
            StreamEvent::Headers { head, end_stream } => {
                self.ended = end_stream;
                Ok(head)
            }
            StreamEvent::Data { .. } => Err(unexpected("DATA before headers")),
            StreamEvent::Trailers(_) => Err(unexpected("trailers before headers")),
        }
    }

    fn next_chunk(&mut self, timeout: Option<Duration>) -> Result<Option<Bytes>> {
        while !self.ended {
            match self.recv.recv(timeout).map_err(Error::from_h2)? {
                StreamEvent::Data { data, end_stream } => {
                    self.ended = end_stream;
                    if data.is_empty() {
                        continue;
                    }
                    // credit goes back as the caller takes the data
                    self.recv.release_capacity(data.len());
                    return Ok(Some(data));
                }
                StreamEvent::Trailers(trailers) => {
                    self.ended = true;
                    self.trailers = Some(trailers);
                }
                StreamEvent::Headers { .. } => return Err(unexpected("second header block")),
            }
        }
        Ok(None)
    }

    fn take_trailers(&mut self) -> Option<Headers> {
        self.trailers.take()
    }

    fn cancel(&mut self) {
        self.ended = true;
        self.recv.cancel();
    }

    fn canceller(&self) -> Canceller {
        let canceller = self.recv.canceller();
        Canceller::new(move || canceller.cancel())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names_and_values(fields: &[HeaderField]) -> Vec<(String, String)> {
        fields
            .iter()
            .map(|f| {
                (
                    f.name_str().unwrap().to_string(),
                    f.value_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn test_pseudo_headers_come_first() {
        let destination = Destination::parse("https://example.com:8443").unwrap();
        let request = HttpRequest::builder()
            .method(Method::Post)
            .uri("/submit?x=1")
            .header("Content-Type", "text/plain")
            .build();
        let fields = names_and_values(&request_fields(&destination, &request).unwrap());
        let expected: Vec<(String, String)> = [
            (":method", "POST"),
            (":scheme", "https"),
            (":authority", "example.com:8443"),
            (":path", "/submit?x=1"),
            ("content-type", "text/plain"),
        ]
        .iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect();
        assert_eq!(fields, expected);
    }

    #[test]
    fn test_connection_specific_headers_are_stripped() {
        let destination = Destination::parse("http://example.com").unwrap();
        let request = HttpRequest::builder()
            .header("Host", "override.example")
            .header("Connection", "keep-alive")
            .header("Keep-Alive", "timeout=5")
            .header("Transfer-Encoding", "chunked")
            .header("Upgrade", "h2c")
            .header("TE", "gzip")
            .header("X-Trace", "1")
            .build();
        let fields = names_and_values(&request_fields(&destination, &request).unwrap());
        assert!(fields.contains(&(":authority".to_string(), "override.example".to_string())));
        let regular: Vec<_> = fields
            .iter()
            .filter(|(n, _)| !n.starts_with(':'))
            .map(|(n, _)| n.as_str())
            .collect();
        assert_eq!(regular, vec!["x-trace"]);
    }

    #[test]
    fn test_te_trailers_survives() {
        let destination = Destination::parse("http://example.com").unwrap();
        let request = HttpRequest::builder().header("TE", "trailers").build();
        let fields = request_fields(&destination, &request).unwrap();
        assert!(fields.iter().any(|f| f.name.as_ref() == b"te"));
    }

    #[test]
    fn test_credentials_are_never_indexed() {
        let destination = Destination::parse("http://example.com").unwrap();
        let request = HttpRequest::builder()
            .header("Authorization", "Bearer secret")
            .header("Accept", "*/*")
            .build();
        let fields = request_fields(&destination, &request).unwrap();
        let auth = fields.iter().find(|f| f.name.as_ref() == b"authorization").unwrap();
        assert!(auth.sensitive);
        let accept = fields.iter().find(|f| f.name.as_ref() == b"accept").unwrap();
        assert!(!accept.sensitive);
    }

    #[test]
    fn test_connect_has_no_scheme_or_path() {
        let destination = Destination::parse("http://proxy.example:3128").unwrap();
        let request = HttpRequest::builder()
            .method(Method::Connect)
            .uri("example.com:443")
            .header("Host", "example.com:443")
            .build();
        let fields = names_and_values(&request_fields(&destination, &request).unwrap());
        let pseudo: Vec<_> = fields.iter().filter(|(n, _)| n.starts_with(':')).collect();
        assert_eq!(pseudo.len(), 2);
        assert_eq!(pseudo[1].1, "example.com:443");
    }

    #[test]
    fn test_invalid_header_value_rejected() {
        let destination = Destination::parse("http://example.com").unwrap();
        let request = HttpRequest::builder().header("X-Bad", "a\r\nb").build();
        assert!(matches!(
            request_fields(&destination, &request),
            Err(Error::InvalidRequest(_))
        ));
    }
}
