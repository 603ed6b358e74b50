//! HTTP proxies
//!
//! `https` destinations and HTTP/2 prior-knowledge connections are reached
//! through a CONNECT tunnel opened here; plain HTTP/1.1 requests are
//! forwarded by the proxy and only need the absolute-form target and the
//! proxy credentials, which the HTTP/1.1 strategy adds per request.

use super::{Destination, Error, Result, Scheme};
use crate::http::{HttpRequest, Method, ResponseHeadParser};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Port used when the proxy URI does not name one
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// One HTTP proxy and the hosts that bypass it
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ProxyConfig {
    address: Destination,
    credentials: Option<(String, String)>,
    non_proxy_hosts: Vec<String>,
}

impl ProxyConfig {
    /// A proxy at `http://host[:port]`
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidConfig(format!("proxy {:?}: {}", uri, reason));
        let (scheme, rest) = uri.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        if !scheme.eq_ignore_ascii_case("http") {
            return Err(invalid("only http proxies are supported"));
        }
        let destination = Destination::parse(uri).map_err(|_| invalid("invalid address"))?;

        let authority = rest.strip_suffix('/').unwrap_or(rest);
        let explicit_port = match authority.rsplit_once(']') {
            Some((_, after)) => after.starts_with(':'),
            None => authority.contains(':'),
        };
        let address = if explicit_port {
            destination
        } else {
            Destination::new(Scheme::Http, destination.host(), DEFAULT_PROXY_PORT)?
        };
        Ok(ProxyConfig::new(address))
    }

    pub fn new(address: Destination) -> Self {
        ProxyConfig {
            address,
            credentials: None,
            non_proxy_hosts: Vec::new(),
        }
    }

    /// Basic credentials sent in `Proxy-Authorization`
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Hosts reached directly: exact names, or `*.suffix` for a whole domain
    pub fn non_proxy_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.non_proxy_hosts = hosts
            .into_iter()
            .map(|host| host.as_ref().trim().to_ascii_lowercase())
            .filter(|host| !host.is_empty())
            .collect();
        self
    }

    pub fn address(&self) -> &Destination {
        &self.address
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Whether connections to `host` skip the proxy
    pub fn bypasses(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.non_proxy_hosts.iter().any(|pattern| match pattern.strip_prefix('*') {
            Some(suffix) if suffix.starts_with('.') => host.ends_with(suffix),
            _ => host == *pattern,
        })
    }

    /// `Proxy-Authorization` value, if credentials are set
    pub(crate) fn authorization(&self) -> Option<String> {
        self.credentials.as_ref().map(|(user, password)| {
            let token = openssl::base64::encode_block(format!("{}:{}", user, password).as_bytes());
            format!("Basic {}", token)
        })
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("address", &self.address)
            .field("username", &self.credentials.as_ref().map(|(user, _)| user))
            .field("non_proxy_hosts", &self.non_proxy_hosts)
            .finish()
    }
}

/// `host:port` as the CONNECT target; the port is always present
fn tunnel_target(destination: &Destination) -> String {
    if destination.host().contains(':') {
        format!("[{}]:{}", destination.host(), destination.port())
    } else {
        format!("{}:{}", destination.host(), destination.port())
    }
}

/// Ask the proxy on `tcp` for a tunnel to `destination`
///
/// On success the stream carries raw bytes to the destination. `timeout`
/// bounds each read and write of the exchange.
pub(crate) fn open_tunnel(
    tcp: &mut TcpStream,
    destination: &Destination,
    proxy: &ProxyConfig,
    timeout: Duration,
) -> Result<()> {
    let connect_error = |source: io::Error| Error::Connect {
        destination: proxy.address().to_string(),
        source,
    };
    let target = tunnel_target(destination);
    let mut request = HttpRequest::new(Method::Connect, target.clone());
    let headers = request.headers_mut();
    headers.insert("Host", target);
    headers.insert("Proxy-Connection", "Keep-Alive");
    if let Some(authorization) = proxy.authorization() {
        headers.insert("Proxy-Authorization", authorization);
    }

    tcp.set_read_timeout(Some(timeout)).map_err(connect_error)?;
    tcp.set_write_timeout(Some(timeout)).map_err(connect_error)?;
    log::debug!("CONNECT {} via proxy {}", request.uri(), proxy.address());
    tcp.write_all(&request.head_to_wire()).map_err(connect_error)?;

    let mut parser = ResponseHeadParser::new();
    let mut buf = [0u8; 1024];
    let head = loop {
        let n = tcp.read(&mut buf).map_err(connect_error)?;
        if n == 0 {
            return Err(connect_error(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed the connection during CONNECT",
            )));
        }
        if let Some(head) = parser.parse(&buf[..n]).map_err(|e| Error::Http(e).unsent())? {
            break head;
        }
    };

    let status = head.status().code();
    if !(200..300).contains(&status) {
        log::debug!("proxy {} refused CONNECT to {}: {}", proxy.address(), destination, status);
        return Err(Error::ProxyConnect {
            destination: destination.to_string(),
            status,
        });
    }
    if !parser.take_remaining().is_empty() {
        return Err(Error::Http(crate::http::Error::Parse(
            "proxy sent data before the tunnel was used".to_string(),
        ))
        .unsent());
    }
    tcp.set_read_timeout(None).map_err(connect_error)?;
    log::debug!("tunnel to {} open", destination);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_parse_defaults_port() {
        let proxy = ProxyConfig::parse("http://Proxy.Example.com").unwrap();
        assert_eq!(proxy.address().host(), "proxy.example.com");
        assert_eq!(proxy.address().port(), DEFAULT_PROXY_PORT);

        let proxy = ProxyConfig::parse("http://10.0.0.1:3128/").unwrap();
        assert_eq!(proxy.address().port(), 3128);
        let proxy = ProxyConfig::parse("http://[::1]").unwrap();
        assert_eq!(proxy.address().port(), DEFAULT_PROXY_PORT);
        let proxy = ProxyConfig::parse("http://[::1]:80").unwrap();
        assert_eq!(proxy.address().port(), 80);

        for bad in ["https://proxy:443", "socks5://proxy:1080", "proxy:8080", "http://"] {
            assert!(matches!(ProxyConfig::parse(bad), Err(Error::InvalidConfig(_))), "{}", bad);
        }
    }

    #[test]
    fn test_non_proxy_hosts() {
        let proxy = ProxyConfig::parse("http://proxy:3128")
            .unwrap()
            .non_proxy_hosts(["localhost", "*.Internal.example.com", ""]);
        assert!(proxy.bypasses("localhost"));
        assert!(proxy.bypasses("LOCALHOST"));
        assert!(proxy.bypasses("api.internal.example.com"));
        assert!(proxy.bypasses("a.b.internal.example.com"));
        assert!(!proxy.bypasses("internal.example.com"));
        assert!(!proxy.bypasses("localhost.evil.com"));
        assert!(!proxy.bypasses("example.com"));
    }

    #[test]
    fn test_authorization_and_debug() {
        let proxy = ProxyConfig::parse("http://proxy:3128").unwrap();
        assert_eq!(proxy.authorization(), None);

        let proxy = proxy.credentials("user", "pass");
        assert_eq!(proxy.authorization().as_deref(), Some("Basic dXNlcjpwYXNz"));
        let debug = format!("{:?}", proxy);
        assert!(debug.contains("user"));
        assert!(!debug.contains("pass\""));
    }

    #[test]
    fn test_tunnel_target_always_has_port() {
        let https = Destination::parse("https://example.com").unwrap();
        assert_eq!(tunnel_target(&https), "example.com:443");
        let v6 = Destination::parse("http://[::1]:8443").unwrap();
        assert_eq!(tunnel_target(&v6), "[::1]:8443");
    }

    /// A proxy that answers one CONNECT with `reply` and returns the
    /// request it saw
    fn fake_proxy(reply: &'static str) -> (TcpStream, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 256];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut chunk).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
            }
            stream.write_all(reply.as_bytes()).unwrap();
            String::from_utf8(request).unwrap()
        });
        (TcpStream::connect(addr).unwrap(), handle)
    }

    #[test]
    fn test_tunnel_request_and_success() {
        let (mut tcp, proxy_side) = fake_proxy("HTTP/1.1 200 Connection Established\r\n\r\n");
        let proxy = ProxyConfig::parse("http://proxy:3128").unwrap().credentials("user", "pass");
        let destination = Destination::parse("https://example.com").unwrap();

        open_tunnel(&mut tcp, &destination, &proxy, Duration::from_secs(5)).unwrap();
        let request = proxy_side.join().unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"), "{}", request);
        assert!(request.contains("Host: example.com:443\r\n"));
        assert!(request.contains("Proxy-Connection: Keep-Alive\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[test]
    fn test_tunnel_refused_is_retry_safe() {
        let (mut tcp, proxy_side) = fake_proxy("HTTP/1.1 407 Proxy Authentication Required\r\n\r\n");
        let proxy = ProxyConfig::parse("http://proxy:3128").unwrap();
        let destination = Destination::parse("https://example.com").unwrap();

        let error = open_tunnel(&mut tcp, &destination, &proxy, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(error, Error::ProxyConnect { status: 407, .. }), "{}", error);
        assert_eq!(error.outcome(), super::super::Outcome::RetrySafe);
        assert!(!proxy_side.join().unwrap().contains("Proxy-Authorization"));
    }

    #[test]
    fn test_tunnel_proxy_hangs_up() {
        let (mut tcp, proxy_side) = fake_proxy("");
        let proxy = ProxyConfig::parse("http://proxy:3128").unwrap();
        let destination = Destination::parse("https://example.com").unwrap();

        let error = open_tunnel(&mut tcp, &destination, &proxy, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(error, Error::Connect { .. }), "{}", error);
        assert!(proxy_side.join().unwrap().starts_with("CONNECT "));
    }
}
