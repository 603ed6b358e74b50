//! HTTP/1.1 exchange strategy
//!
//! One exchange at a time per connection. The session is split into a read
//! and a write half so a streaming request body and the response can move
//! independently; both halves go back into the connection slot when the
//! exchange ends cleanly, and the connection is shut down otherwise.

use super::proxy::ProxyConfig;
use super::{BodyWrite, Canceller, Destination, Error, Exchange, Protocol, ResponseStream, Result};
use crate::http::chunked::{encode_chunk, encode_last_chunk, ChunkedDecoder, Decoded};
use crate::http::h2::ReleaseHook;
use crate::http::session::{BoxedSession, PollEvents, SessionOps};
use crate::http::{Headers, HttpRequest, Method, ResponseHead, ResponseHeadParser, Version};
use bytes::{Bytes, BytesMut};
use std::mem;
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 16 * 1024;

/// Where the two session halves currently are
enum Slot {
    Idle {
        reader: BoxedSession,
        writer: BoxedSession,
    },
    /// Reserved by the pool for the next request
    Claimed {
        reader: BoxedSession,
        writer: BoxedSession,
    },
    /// An exchange holds the halves; they come back one at a time
    Busy {
        reader: Option<BoxedSession>,
        writer: Option<BoxedSession>,
    },
    Broken,
}

enum Half {
    Reader(BoxedSession),
    Writer(BoxedSession),
}

struct Inner {
    slot: Slot,
    /// Bumped per exchange so a stale canceller cannot hit the next one
    exchange: u64,
    idle_since: Option<Instant>,
    release_hook: Option<ReleaseHook>,
}

struct Shared {
    inner: Mutex<Inner>,
    socket: TcpStream,
}

impl Shared {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return one half after its side of the exchange completed cleanly
    fn give_back(&self, half: Half) {
        let hook = {
            let mut inner = self.inner();
            let (reader, writer) = match mem::replace(&mut inner.slot, Slot::Broken) {
                Slot::Busy { reader, writer } => match half {
                    Half::Reader(r) => (Some(r), writer),
                    Half::Writer(w) => (reader, Some(w)),
                },
                other => {
                    inner.slot = other;
                    return;
                }
            };
            match (reader, writer) {
                (Some(reader), Some(writer)) => {
                    log::trace!("HTTP/1.1 connection idle again");
                    inner.slot = Slot::Idle { reader, writer };
                    inner.idle_since = Some(Instant::now());
                    inner.release_hook.clone()
                }
                (reader, writer) => {
                    inner.slot = Slot::Busy { reader, writer };
                    None
                }
            }
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    fn break_connection(&self) {
        let hook = {
            let mut inner = self.inner();
            if matches!(inner.slot, Slot::Broken) {
                return;
            }
            inner.slot = Slot::Broken;
            inner.idle_since = None;
            inner.release_hook.clone()
        };
        log::debug!("closing HTTP/1.1 connection");
        let _ = self.socket.shutdown(Shutdown::Both);
        if let Some(hook) = hook {
            hook();
        }
    }

    fn cancel_exchange(&self, exchange: u64) {
        let current = self.inner().exchange;
        if current == exchange {
            self.break_connection();
        }
    }
}

/// How the request body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestFraming {
    Length(u64),
    Chunked,
}

/// Complete the request head: Host, the body framing headers, and for a
/// forwarding proxy the absolute-form target and proxy credentials
fn prepare_request(
    destination: &Destination,
    request: &mut HttpRequest,
    streaming: bool,
    proxy: Option<&ProxyConfig>,
) -> Result<RequestFraming> {
    request
        .headers()
        .validate()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
    let uri = request.uri();
    if uri.is_empty() || uri.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(Error::InvalidRequest(format!("invalid request target {:?}", uri)));
    }

    if let Some(proxy) = proxy {
        if request.uri().starts_with('/') {
            let absolute = format!("{}{}", destination, request.uri());
            request.set_uri(absolute);
        }
        if let Some(authorization) = proxy.authorization() {
            if !request.headers().contains("proxy-authorization") {
                request.headers_mut().insert("Proxy-Authorization", authorization);
            }
        }
    }

    let declared = match request.headers().get("content-length") {
        Some(value) => Some(value.trim().parse::<u64>().map_err(|_| {
            Error::InvalidRequest(format!("invalid Content-Length {:?}", value))
        })?),
        None => None,
    };
    let method = request.method();
    let body_len = request.body().len() as u64;
    let headers = request.headers_mut();
    if !headers.contains("host") {
        headers.insert("Host", destination.authority());
    }
    headers.remove("transfer-encoding");

    if streaming {
        if let Some(length) = declared {
            return Ok(RequestFraming::Length(length));
        }
        headers.set("Transfer-Encoding", "chunked");
        return Ok(RequestFraming::Chunked);
    }

    headers.remove("content-length");
    if body_len > 0 || matches!(method, Method::Post | Method::Put | Method::Patch) {
        headers.set("Content-Length", body_len.to_string());
    }
    Ok(RequestFraming::Length(body_len))
}

/// Write everything, reporting whether any byte made it out before a
/// failure
fn write_tracked(
    writer: &mut BoxedSession,
    mut buf: &[u8],
) -> std::result::Result<(), (bool, crate::http::Error)> {
    let mut sent_any = false;
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => return Err((sent_any, crate::http::Error::ConnectionClosed)),
            Ok(n) => {
                sent_any = true;
                buf = &buf[n..];
            }
            Err(e) => return Err((sent_any, e)),
        }
    }
    writer.flush().map_err(|e| (true, e))
}

/// An HTTP/1.1 connection
pub(crate) struct Http1Connection {
    shared: Arc<Shared>,
    io_timeout: Option<Duration>,
    /// Set when the peer is a proxy forwarding our requests
    forward_proxy: Option<ProxyConfig>,
}

impl Http1Connection {
    pub(crate) fn new(session: BoxedSession, io_timeout: Option<Duration>) -> Result<Self> {
        let socket = session.try_clone_socket()?;
        let (reader, writer) = session.try_split()?;
        Ok(Http1Connection {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    slot: Slot::Idle { reader, writer },
                    exchange: 0,
                    idle_since: Some(Instant::now()),
                    release_hook: None,
                }),
                socket,
            }),
            io_timeout,
            forward_proxy: None,
        })
    }

    pub(crate) fn forwarding(mut self, proxy: Option<ProxyConfig>) -> Self {
        self.forward_proxy = proxy;
        self
    }

    /// Take both halves for a new exchange
    fn begin(&self) -> Result<(BoxedSession, BoxedSession, u64)> {
        let mut inner = self.shared.inner();
        match mem::replace(&mut inner.slot, Slot::Busy { reader: None, writer: None }) {
            Slot::Idle { mut reader, writer } | Slot::Claimed { mut reader, writer } => {
                if reader.is_stale() {
                    inner.slot = Slot::Broken;
                    drop(inner);
                    let _ = self.shared.socket.shutdown(Shutdown::Both);
                    return Err(Error::Http(crate::http::Error::ConnectionClosed).unsent());
                }
                inner.exchange += 1;
                inner.idle_since = None;
                Ok((reader, writer, inner.exchange))
            }
            Slot::Broken => {
                inner.slot = Slot::Broken;
                Err(Error::Http(crate::http::Error::ConnectionClosed).unsent())
            }
            busy => {
                inner.slot = busy;
                Err(Error::Busy)
            }
        }
    }

    /// Undo a claim for a request that never started
    fn unclaim(&self) {
        let mut inner = self.shared.inner();
        if let Slot::Claimed { .. } = inner.slot {
            if let Slot::Claimed { reader, writer } = mem::replace(&mut inner.slot, Slot::Broken) {
                inner.slot = Slot::Idle { reader, writer };
            }
        }
    }
}

impl Protocol for Http1Connection {
    fn version(&self) -> Version {
        Version::Http11
    }

    fn send(
        &self,
        destination: &Destination,
        mut request: HttpRequest,
        streaming: bool,
    ) -> Result<Exchange> {
        let framing = match prepare_request(destination, &mut request, streaming, self.forward_proxy.as_ref()) {
            Ok(framing) => framing,
            Err(e) => {
                self.unclaim();
                return Err(e);
            }
        };
        let (reader, mut writer, exchange) = self.begin()?;

        let mut wire = request.head_to_wire();
        if !streaming {
            wire.extend_from_slice(request.body());
        }
        log::debug!(
            "HTTP/1.1 {} {} ({} bytes, streaming={})",
            request.method(),
            request.uri(),
            wire.len(),
            streaming
        );
        if let Err((sent_any, e)) = write_tracked(&mut writer, &wire) {
            self.shared.break_connection();
            let error = Error::Http(e);
            return Err(if sent_any { error } else { error.unsent() });
        }

        let body: Option<Box<dyn BodyWrite>> = if streaming {
            Some(Box::new(H1BodyWriter {
                shared: Arc::clone(&self.shared),
                writer: Some(writer),
                framing,
                sent: 0,
                buf: BytesMut::new(),
            }))
        } else {
            self.shared.give_back(Half::Writer(writer));
            None
        };

        let response = H1Response {
            shared: Arc::clone(&self.shared),
            exchange,
            reader: Some(reader),
            parser: ResponseHeadParser::new(),
            buf: BytesMut::new(),
            head_request: request.method() == Method::Head,
            close_requested: request.headers().has_token("connection", "close"),
            io_timeout: self.io_timeout,
            body: BodyState::AwaitingHead,
            keep_alive: false,
            trailers: None,
        };
        Ok(Exchange {
            body,
            response: Box::new(response),
        })
    }

    fn try_acquire(&self) -> bool {
        let mut inner = self.shared.inner();
        let stale = match &mut inner.slot {
            Slot::Idle { reader, .. } => reader.is_stale(),
            _ => return false,
        };
        if stale {
            inner.slot = Slot::Broken;
            drop(inner);
            log::debug!("dropping stale HTTP/1.1 connection");
            let _ = self.shared.socket.shutdown(Shutdown::Both);
            return false;
        }
        if let Slot::Idle { reader, writer } = mem::replace(&mut inner.slot, Slot::Broken) {
            inner.slot = Slot::Claimed { reader, writer };
        }
        true
    }

    fn load(&self) -> usize {
        match self.shared.inner().slot {
            Slot::Idle { .. } | Slot::Broken => 0,
            Slot::Claimed { .. } | Slot::Busy { .. } => 1,
        }
    }

    fn is_open(&self) -> bool {
        !matches!(self.shared.inner().slot, Slot::Broken)
    }

    fn idle_since(&self) -> Option<Instant> {
        self.shared.inner().idle_since
    }

    fn set_release_hook(&self, hook: ReleaseHook) {
        self.shared.inner().release_hook = Some(hook);
    }

    fn close(&self) {
        self.shared.break_connection();
    }
}

/// Streaming request body
struct H1BodyWriter {
    shared: Arc<Shared>,
    writer: Option<BoxedSession>,
    framing: RequestFraming,
    sent: u64,
    buf: BytesMut,
}

impl H1BodyWriter {
    fn fail(&mut self, error: Error) -> Error {
        self.writer = None;
        self.shared.break_connection();
        error
    }
}

impl BodyWrite for H1BodyWriter {
    fn write(&mut self, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(Error::InvalidRequest("request body already finished".to_string()));
        };
        let result = match self.framing {
            RequestFraming::Length(length) => {
                if self.sent + data.len() as u64 > length {
                    return Err(self.fail(Error::InvalidRequest(format!(
                        "request body exceeds declared Content-Length {}",
                        length
                    ))));
                }
                writer.write_all(&data)
            }
            RequestFraming::Chunked => {
                self.buf.clear();
                encode_chunk(&data, &mut self.buf);
                writer.write_all(&self.buf)
            }
        };
        match result {
            Ok(()) => {
                self.sent += data.len() as u64;
                Ok(())
            }
            Err(e) => Err(self.fail(Error::Http(e))),
        }
    }

    fn finish(&mut self, trailers: Option<Headers>) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Err(Error::InvalidRequest("request body already finished".to_string()));
        };
        let result = match self.framing {
            RequestFraming::Length(length) if self.sent != length => {
                Err(Error::InvalidRequest(format!(
                    "request body is {} bytes, Content-Length declared {}",
                    self.sent, length
                )))
            }
            RequestFraming::Length(_) if trailers.is_some() => Err(Error::InvalidRequest(
                "trailers need a chunked request body".to_string(),
            )),
            RequestFraming::Length(_) => writer.flush().map_err(Error::Http),
            RequestFraming::Chunked => match trailers.as_ref().map(Headers::validate).transpose() {
                Err(e) => Err(Error::InvalidRequest(e.to_string())),
                Ok(_) => {
                    self.buf.clear();
                    encode_last_chunk(trailers.as_ref(), &mut self.buf);
                    writer
                        .write_all(&self.buf)
                        .and_then(|()| writer.flush())
                        .map_err(Error::Http)
                }
            },
        };
        match result {
            Ok(()) => {
                self.shared.give_back(Half::Writer(writer));
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn abort(&mut self) {
        if self.writer.take().is_some() {
            self.shared.break_connection();
        }
    }
}

impl Drop for H1BodyWriter {
    fn drop(&mut self) {
        self.abort();
    }
}

enum BodyState {
    AwaitingHead,
    Empty,
    Length(u64),
    Chunked(ChunkedDecoder),
    UntilClose,
    Done,
}

struct H1Response {
    shared: Arc<Shared>,
    exchange: u64,
    reader: Option<BoxedSession>,
    parser: ResponseHeadParser,
    buf: BytesMut,
    head_request: bool,
    close_requested: bool,
    io_timeout: Option<Duration>,
    body: BodyState,
    keep_alive: bool,
    trailers: Option<Headers>,
}

impl H1Response {
    /// Read more bytes into the buffer; 0 means the peer closed
    fn fill(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let reader = self
            .reader
            .as_mut()
            .ok_or(Error::Http(crate::http::Error::ConnectionClosed))?;
        let deadline = timeout.or(self.io_timeout).map(|t| Instant::now() + t);
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let wait = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(Error::Timeout);
                    }
                    Some(left)
                }
                None => None,
            };
            if !reader.poll(PollEvents::Read, wait)? {
                continue;
            }
            match reader.read(&mut chunk) {
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                // split TLS halves time out while the writer holds the session
                Err(crate::http::Error::Timeout) => continue,
                Err(e) => return Err(Error::Http(e)),
            }
        }
    }

    fn start_body(&mut self, head: &ResponseHead) -> Result<()> {
        let headers = head.headers();
        self.keep_alive = !self.close_requested
            && match head.version() {
                Version::Http10 => headers.has_token("connection", "keep-alive"),
                _ => !headers.has_token("connection", "close"),
            };

        let code = head.status().code();
        self.body = if self.head_request || code == 204 || code == 304 {
            BodyState::Empty
        } else if headers.has_token("transfer-encoding", "chunked") {
            BodyState::Chunked(ChunkedDecoder::new())
        } else if headers.contains("transfer-encoding") {
            self.keep_alive = false;
            BodyState::UntilClose
        } else {
            match head.content_length()? {
                Some(0) => BodyState::Empty,
                Some(length) => BodyState::Length(length),
                None => {
                    self.keep_alive = false;
                    BodyState::UntilClose
                }
            }
        };
        Ok(())
    }

    /// The body ended; hand the read half back if the connection can be
    /// reused
    fn complete(&mut self) {
        self.body = BodyState::Done;
        if let Some(reader) = self.reader.take() {
            if self.keep_alive && self.buf.is_empty() {
                self.shared.give_back(Half::Reader(reader));
            } else {
                drop(reader);
                self.shared.break_connection();
            }
        }
    }
}

impl ResponseStream for H1Response {
    fn head(&mut self, timeout: Option<Duration>) -> Result<ResponseHead> {
        loop {
            let parsed = if self.buf.is_empty() {
                self.parser.parse_buffered()?
            } else {
                let data = self.buf.split();
                self.parser.parse(&data)?
            };
            if let Some(head) = parsed {
                let status = head.status();
                if status.code() == 101 {
                    return Err(Error::Http(crate::http::Error::Protocol(
                        "unexpected 101 Switching Protocols".to_string(),
                    )));
                }
                if status.is_informational() {
                    log::trace!("skipping interim response {}", status);
                    self.parser.reset();
                    continue;
                }
                self.buf = self.parser.take_remaining();
                self.start_body(&head)?;
                log::debug!("HTTP/1.1 response {}", status);
                return Ok(head);
            }
            if self.fill(timeout)? == 0 {
                return Err(Error::Http(crate::http::Error::ConnectionClosed));
            }
        }
    }

    fn next_chunk(&mut self, timeout: Option<Duration>) -> Result<Option<Bytes>> {
        loop {
            match &mut self.body {
                BodyState::AwaitingHead => {
                    return Err(Error::Http(crate::http::Error::Protocol(
                        "body read before the response head".to_string(),
                    )))
                }
                BodyState::Done => return Ok(None),
                BodyState::Empty => {
                    self.complete();
                    return Ok(None);
                }
                BodyState::Length(0) => {
                    self.complete();
                    return Ok(None);
                }
                BodyState::Length(remaining) => {
                    if !self.buf.is_empty() {
                        let take = (*remaining).min(self.buf.len() as u64) as usize;
                        *remaining -= take as u64;
                        return Ok(Some(self.buf.split_to(take).freeze()));
                    }
                    if self.fill(timeout)? == 0 {
                        return Err(Error::Http(crate::http::Error::Incomplete));
                    }
                }
                BodyState::Chunked(decoder) => match decoder.decode(&mut self.buf)? {
                    Decoded::Data(data) => return Ok(Some(data)),
                    Decoded::NeedMore => {
                        if self.fill(timeout)? == 0 {
                            return Err(Error::Http(crate::http::Error::Incomplete));
                        }
                    }
                    Decoded::Done(trailers) => {
                        if !trailers.is_empty() {
                            self.trailers = Some(trailers);
                        }
                        self.complete();
                        return Ok(None);
                    }
                },
                BodyState::UntilClose => {
                    if !self.buf.is_empty() {
                        return Ok(Some(self.buf.split().freeze()));
                    }
                    if self.fill(timeout)? == 0 {
                        self.complete();
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn take_trailers(&mut self) -> Option<Headers> {
        self.trailers.take()
    }

    fn cancel(&mut self) {
        self.body = BodyState::Done;
        if self.reader.take().is_some() {
            self.shared.break_connection();
        }
    }

    fn canceller(&self) -> Canceller {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let exchange = self.exchange;
        Canceller::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.cancel_exchange(exchange);
            }
        })
    }
}

impl Drop for H1Response {
    fn drop(&mut self) {
        match self.body {
            BodyState::Empty | BodyState::Length(0) => self.complete(),
            _ => self.cancel(),
        }
    }
}
