//! Blocking client transport
//!
//! The façade over both protocol versions:
//!
//! 1. [`open`] connects to a [`Destination`], runs TLS with ALPN when the
//!    scheme asks for it, and picks HTTP/1.1 or HTTP/2 once for the
//!    connection according to the [`HttpVersionPolicy`]
//! 2. [`Connection::send`] starts an exchange and returns a
//!    [`ResponseHandle`]; [`Connection::send_streaming`] also hands out a
//!    [`BodySender`] for a request body produced while the response arrives
//! 3. [`Transport`] adds a [`ConnectionPool`] on top: HTTP/2 connections are
//!    shared between concurrent requests, HTTP/1.1 connections are leased
//!
//! With a [`ProxyConfig`], connections go through an HTTP proxy: a CONNECT
//! tunnel for `https` and HTTP/2 prior knowledge, request forwarding for
//! plain HTTP/1.1.
//!
//! Every wait for response headers or a body chunk is bounded by the
//! configured request timeout; expiry cancels the exchange.
//!
//! # Examples
//!
//! ```no_run
//! use httptransport::http::transport::{self, Destination, TransportConfig};
//! use httptransport::http::{HttpRequest, Method};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TransportConfig::builder().build()?;
//! let destination = Destination::parse("https://example.com")?;
//! let connection = transport::open(&destination, &config)?;
//!
//! let request = HttpRequest::builder().method(Method::Post).uri("/upload").build();
//! let (mut body, mut response) = connection.send_streaming(request)?;
//! body.send(&b"part one"[..])?;
//! body.send(&b"part two"[..])?;
//! body.finish()?;
//!
//! println!("{}", response.headers()?.status());
//! for chunk in response.body_chunks() {
//!     println!("{} bytes", chunk?.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
mod h1;
mod h2;
pub mod pool;
pub mod proxy;

pub use config::{HttpVersionPolicy, TransportConfig, TransportConfigBuilder};
pub use error::{Error, Outcome, Result};
pub use pool::{ConnectionPool, Route};
pub use proxy::ProxyConfig;

use crate::http::h2::{H2Connection, ReleaseHook};
use crate::http::session::{BoxedSession, FdSessionOps, SessionOps};
use crate::http::tls::{TlsConfig, TlsError, TlsSessionOps};
use crate::http::{Headers, HttpRequest, ResponseHead, Version};
use crate::http::{DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};
use bytes::Bytes;
use h1::Http1Connection;
use h2::Http2Connection;
use socket2::{Domain, Socket, Type};
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The wire protocol of one connection, chosen when it is established
pub(crate) trait Protocol: Send + Sync {
    fn version(&self) -> Version;

    /// Start an exchange; with `streaming` the request body follows through
    /// the returned writer instead of coming from the request
    fn send(&self, destination: &Destination, request: HttpRequest, streaming: bool)
        -> Result<Exchange>;

    /// Whether a request can start right now; HTTP/1.1 also reserves the
    /// connection for the caller
    fn try_acquire(&self) -> bool;

    /// Exchanges in flight
    fn load(&self) -> usize;

    /// Still able to carry new requests
    fn is_open(&self) -> bool;

    fn idle_since(&self) -> Option<Instant>;

    /// Called whenever an exchange ends or the connection dies
    fn set_release_hook(&self, hook: ReleaseHook);

    fn close(&self);
}

/// Response side of one exchange
pub(crate) trait ResponseStream: Send {
    /// The final response head; interim responses are skipped
    fn head(&mut self, timeout: Option<Duration>) -> Result<ResponseHead>;

    /// Next piece of the body, `None` at its end
    fn next_chunk(&mut self, timeout: Option<Duration>) -> Result<Option<Bytes>>;

    fn take_trailers(&mut self) -> Option<Headers>;

    fn cancel(&mut self);

    fn canceller(&self) -> Canceller;
}

/// Request body side of a streaming exchange
pub(crate) trait BodyWrite: Send {
    fn write(&mut self, data: Bytes) -> Result<()>;

    fn finish(&mut self, trailers: Option<Headers>) -> Result<()>;

    fn abort(&mut self);
}

/// A started exchange
pub(crate) struct Exchange {
    pub(crate) body: Option<Box<dyn BodyWrite>>,
    pub(crate) response: Box<dyn ResponseStream>,
}

/// URI scheme of a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => DEFAULT_HTTP_PORT,
            Scheme::Https => DEFAULT_HTTPS_PORT,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where requests go: scheme, host and port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Destination {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        if host.is_empty() || host.bytes().any(|b| b.is_ascii_whitespace() || b"/?#@[]".contains(&b)) {
            return Err(Error::InvalidDestination(format!("invalid host {:?}", host)));
        }
        if port == 0 {
            return Err(Error::InvalidDestination("port 0".to_string()));
        }
        Ok(Destination {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    /// Parse `scheme://host[:port]`, with IPv6 hosts in brackets
    ///
    /// A single trailing slash is accepted; any other path is not.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || Error::InvalidDestination(input.to_string());
        let (scheme, rest) = input.split_once("://").ok_or_else(invalid)?;
        let scheme = if scheme.eq_ignore_ascii_case("http") {
            Scheme::Http
        } else if scheme.eq_ignore_ascii_case("https") {
            Scheme::Https
        } else {
            return Err(Error::InvalidDestination(format!("unsupported scheme {:?}", scheme)));
        };
        let rest = rest.strip_suffix('/').unwrap_or(rest);

        let (host, port) = match rest.strip_prefix('[') {
            Some(bracketed) => {
                let (host, after) = bracketed.split_once(']').ok_or_else(invalid)?;
                let port = match after {
                    "" => None,
                    after => Some(after.strip_prefix(':').ok_or_else(invalid)?),
                };
                if !host.contains(':') {
                    return Err(invalid());
                }
                (host, port)
            }
            None => match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            },
        };
        if host.is_empty() || (host.contains(':') && !rest.starts_with('[')) {
            return Err(invalid());
        }
        let port = match port {
            Some(port) => port.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(invalid)?,
            None => scheme.default_port(),
        };

        if host.bytes().any(|b| b.is_ascii_whitespace() || b"/?#@".contains(&b)) {
            return Err(invalid());
        }
        Ok(Destination {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host[:port]` as sent in `Host` and `:authority`; the port is left
    /// out when it is the scheme's default
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

/// Cancels one exchange from any thread
#[derive(Clone)]
pub struct Canceller {
    cancel: Arc<dyn Fn() + Send + Sync>,
}

impl Canceller {
    pub(crate) fn new(cancel: impl Fn() + Send + Sync + 'static) -> Self {
        Canceller {
            cancel: Arc::new(cancel),
        }
    }

    /// Abort the exchange; the blocked reader gets `Cancelled` or a closed
    /// connection error
    pub fn cancel(&self) {
        (self.cancel)()
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canceller").finish_non_exhaustive()
    }
}

fn connect_addr(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_nodelay(true)?;
    socket.set_keepalive(true)?;
    socket.connect_timeout(&addr.into(), timeout)?;
    Ok(socket.into())
}

/// Resolve and connect, trying each address in turn
fn connect_socket(destination: &Destination, config: &TransportConfig) -> Result<TcpStream> {
    let connect_error = |source| Error::Connect {
        destination: destination.to_string(),
        source,
    };
    let addrs = (destination.host(), destination.port())
        .to_socket_addrs()
        .map_err(connect_error)?;

    let mut last_error = None;
    for addr in addrs {
        match connect_addr(addr, config.connect_timeout()) {
            Ok(stream) => {
                log::debug!("connected to {} at {}", destination, addr);
                return Ok(stream);
            }
            Err(e) => {
                log::debug!("connect to {} at {} failed: {}", destination, addr, e);
                last_error = Some(e);
            }
        }
    }
    Err(connect_error(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
    })))
}

fn tls_handshake(
    tcp: TcpStream,
    destination: &Destination,
    config: &TransportConfig,
) -> Result<TlsSessionOps> {
    let system_default;
    let tls = match config.tls() {
        Some(tls) => tls,
        None => {
            system_default = TlsConfig::client()?.build()?;
            &system_default
        }
    };
    let handshake_timeout = Some(config.io_timeout().unwrap_or(config.connect_timeout()));
    tcp.set_read_timeout(handshake_timeout).map_err(TlsError::Io)?;
    tcp.set_write_timeout(handshake_timeout).map_err(TlsError::Io)?;

    let alpn = config.version_policy().alpn_protocols();
    let session = tls.connect(tcp, destination.host(), alpn)?;
    log::debug!(
        "TLS {} with {}, ALPN {:?}",
        session.version(),
        destination,
        session.alpn_protocol().map(String::from_utf8_lossy)
    );
    session.get_ref().set_read_timeout(None).map_err(TlsError::Io)?;
    session
        .get_ref()
        .set_write_timeout(config.io_timeout())
        .map_err(TlsError::Io)?;
    Ok(session)
}

/// Connect and run the protocol handshake
pub(crate) fn establish(destination: &Destination, config: &TransportConfig) -> Result<Arc<dyn Protocol>> {
    let prior_knowledge = config.version_policy() == HttpVersionPolicy::Http2PriorKnowledge;
    let proxy = config.proxy_for(destination);
    let (tcp, forward_proxy) = match proxy {
        None => (connect_socket(destination, config)?, None),
        Some(proxy) => {
            let mut tcp = connect_socket(proxy.address(), config)?;
            if destination.scheme() == Scheme::Https || prior_knowledge {
                let timeout = config.io_timeout().unwrap_or(config.connect_timeout());
                proxy::open_tunnel(&mut tcp, destination, proxy, timeout)?;
                (tcp, None)
            } else {
                log::debug!("forwarding requests for {} through {}", destination, proxy.address());
                (tcp, Some(proxy.clone()))
            }
        }
    };

    let (session, version): (BoxedSession, Version) = match destination.scheme() {
        Scheme::Http => {
            tcp.set_write_timeout(config.io_timeout())
                .map_err(|e| Error::Http(e.into()).unsent())?;
            let version = if prior_knowledge {
                Version::Http2
            } else {
                Version::Http11
            };
            (Box::new(FdSessionOps::new(tcp)), version)
        }
        Scheme::Https => {
            let session = tls_handshake(tcp, destination, config)?;
            let version = match session.alpn_protocol() {
                Some(b"h2") => Version::Http2,
                Some(_) => Version::Http11,
                None if prior_knowledge => Version::Http2,
                None => Version::Http11,
            };
            (Box::new(session), version)
        }
    };

    log::debug!("using {} for {}", version, destination);
    let protocol: Arc<dyn Protocol> = match version {
        Version::Http2 => {
            let conn = H2Connection::handshake(session, config.h2_config())
                .map_err(|e| Error::H2(e).unsent())?;
            Arc::new(Http2Connection::new(conn))
        }
        _ => Arc::new(
            Http1Connection::new(session, config.io_timeout())
                .map_err(Error::unsent)?
                .forwarding(forward_proxy),
        ),
    };
    Ok(protocol)
}

/// Start an exchange on `connection` and wrap its halves
fn start(
    connection: Arc<dyn Protocol>,
    destination: &Destination,
    request: HttpRequest,
    streaming: bool,
    timeout: Option<Duration>,
) -> Result<(Option<BodySender>, ResponseHandle)> {
    let exchange = connection.send(destination, request, streaming)?;
    let body = exchange.body.map(|inner| BodySender {
        inner,
        _connection: Arc::clone(&connection),
    });
    let response = ResponseHandle {
        stream: exchange.response,
        head: None,
        trailers: None,
        done: false,
        timeout,
        version: connection.version(),
        _connection: connection,
    };
    Ok((body, response))
}

fn into_streaming(
    (body, response): (Option<BodySender>, ResponseHandle),
) -> Result<(BodySender, ResponseHandle)> {
    let body = body.ok_or_else(|| Error::InvalidRequest("no request body writer".to_string()))?;
    Ok((body, response))
}

/// Open a connection to `destination`
pub fn open(destination: &Destination, config: &TransportConfig) -> Result<Connection> {
    Ok(Connection {
        destination: destination.clone(),
        protocol: establish(destination, config)?,
        request_timeout: config.request_timeout(),
    })
}

/// Cancel an exchange through a shared reference
pub fn cancel(response: &ResponseHandle) {
    response.canceller().cancel();
}

/// One established connection
///
/// HTTP/2 connections carry concurrent exchanges; an HTTP/1.1 connection
/// refuses a new exchange with [`Error::Busy`] until the previous response
/// has been read to the end.
pub struct Connection {
    destination: Destination,
    protocol: Arc<dyn Protocol>,
    request_timeout: Option<Duration>,
}

impl Connection {
    /// Send a request with its in-memory body
    pub fn send(&self, request: HttpRequest) -> Result<ResponseHandle> {
        let (_, response) = start(
            Arc::clone(&self.protocol),
            &self.destination,
            request,
            false,
            self.request_timeout,
        )?;
        Ok(response)
    }

    /// Send a request head now and its body through the returned sender
    ///
    /// The body in `request` itself is ignored.
    pub fn send_streaming(&self, request: HttpRequest) -> Result<(BodySender, ResponseHandle)> {
        into_streaming(start(
            Arc::clone(&self.protocol),
            &self.destination,
            request,
            true,
            self.request_timeout,
        )?)
    }

    pub fn version(&self) -> Version {
        self.protocol.version()
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn is_open(&self) -> bool {
        self.protocol.is_open()
    }

    /// Exchanges in flight
    pub fn active_exchanges(&self) -> usize {
        self.protocol.load()
    }

    /// Close the connection; HTTP/2 sends GOAWAY(NO_ERROR) first
    pub fn close(&self) {
        self.protocol.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("destination", &self.destination)
            .field("version", &self.version())
            .finish()
    }
}

/// The response side of one exchange
pub struct ResponseHandle {
    stream: Box<dyn ResponseStream>,
    head: Option<ResponseHead>,
    trailers: Option<Headers>,
    done: bool,
    timeout: Option<Duration>,
    version: Version,
    _connection: Arc<dyn Protocol>,
}

impl ResponseHandle {
    /// Protocol version of the connection carrying the exchange
    pub fn version(&self) -> Version {
        self.version
    }

    /// Block until the final response head is in
    pub fn headers(&mut self) -> Result<&ResponseHead> {
        if self.head.is_none() {
            if self.done {
                return Err(Error::Cancelled);
            }
            match self.stream.head(self.timeout) {
                Ok(head) => self.head = Some(head),
                Err(e) => return Err(self.fail(e)),
            }
        }
        match &self.head {
            Some(head) => Ok(head),
            None => Err(Error::Cancelled),
        }
    }

    /// The body as an iterator of chunks, reading the head first if needed
    ///
    /// The iterator ends after the last chunk or the first error.
    pub fn body_chunks(&mut self) -> BodyChunks<'_> {
        BodyChunks { response: self }
    }

    /// Collect the rest of the body
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        for chunk in self.body_chunks() {
            body.extend_from_slice(&chunk?);
        }
        Ok(body)
    }

    /// Trailer section, available once the body has been read to the end
    pub fn trailers(&self) -> Option<&Headers> {
        self.trailers.as_ref()
    }

    /// Abort the exchange and drop whatever is still buffered
    pub fn cancel(&mut self) {
        self.done = true;
        self.stream.cancel();
    }

    /// A handle to cancel this exchange from another thread
    pub fn canceller(&self) -> Canceller {
        self.stream.canceller()
    }

    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        self.headers()?;
        match self.stream.next_chunk(self.timeout) {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.done = true;
                self.trailers = self.stream.take_trailers();
                Ok(None)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, error: Error) -> Error {
        self.done = true;
        if matches!(error, Error::Timeout) {
            log::debug!("request timed out after {:?}, cancelling", self.timeout);
            self.stream.cancel();
        }
        error
    }
}

impl fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("version", &self.version)
            .field("head", &self.head)
            .field("done", &self.done)
            .finish()
    }
}

/// Body chunks of a response, see [`ResponseHandle::body_chunks`]
pub struct BodyChunks<'a> {
    response: &'a mut ResponseHandle,
}

impl Iterator for BodyChunks<'_> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        self.response.next_chunk().transpose()
    }
}

/// Writes the body of a streaming request
///
/// Dropping the sender without finishing aborts the exchange.
pub struct BodySender {
    inner: Box<dyn BodyWrite>,
    _connection: Arc<dyn Protocol>,
}

impl BodySender {
    /// Send one piece of the body, blocking while flow control allows no
    /// more
    pub fn send(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.inner.write(data.into())
    }

    /// End the body
    pub fn finish(mut self) -> Result<()> {
        self.inner.finish(None)
    }

    /// End the body with a trailer section
    ///
    /// HTTP/1.1 needs chunked framing for this, so the request must not
    /// declare a Content-Length.
    pub fn finish_with_trailers(mut self, trailers: Headers) -> Result<()> {
        self.inner.finish(Some(trailers))
    }

    /// Give up on the request
    pub fn abort(mut self) {
        self.inner.abort();
    }
}

impl fmt::Debug for BodySender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodySender").finish_non_exhaustive()
    }
}

/// A pooling client transport
#[derive(Debug)]
pub struct Transport {
    config: Arc<TransportConfig>,
    pool: ConnectionPool,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let config = Arc::new(config);
        Transport {
            pool: ConnectionPool::new(Arc::clone(&config)),
            config,
        }
    }

    /// Send a request over a pooled connection to `destination`
    pub fn send(&self, destination: &Destination, request: HttpRequest) -> Result<ResponseHandle> {
        let connection = self.pool.acquire(destination)?;
        let (_, response) = start(
            connection,
            destination,
            request,
            false,
            self.config.request_timeout(),
        )?;
        Ok(response)
    }

    /// Streaming variant of [`Transport::send`]
    pub fn send_streaming(
        &self,
        destination: &Destination,
        request: HttpRequest,
    ) -> Result<(BodySender, ResponseHandle)> {
        let connection = self.pool.acquire(destination)?;
        into_streaming(start(
            connection,
            destination,
            request,
            true,
            self.config.request_timeout(),
        )?)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}
