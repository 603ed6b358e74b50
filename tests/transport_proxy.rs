//! Transport tests through an HTTP proxy
//!
//! The proxy is an in-process TcpListener. For CONNECT it answers the
//! tunnel request and then plays the origin itself on the same socket, which
//! is all the client can observe of a real tunnel.

use httptransport::http::session::SessionOps;
use httptransport::http::tls::{TlsConfig, TlsSessionOps};
use httptransport::http::transport::{
    self, Destination, Error, HttpVersionPolicy, Outcome, ProxyConfig, Transport, TransportConfig,
};
use httptransport::http::{HttpRequest, Version};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Read one request head, byte by byte so nothing past it is consumed
fn read_head<R: Read>(stream: &mut R) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => return None,
        }
    }
    Some(String::from_utf8(head).unwrap())
}

fn respond<W: Write>(stream: &mut W, body: &str) {
    let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
    stream.write_all(response.as_bytes()).unwrap();
    stream.flush().unwrap();
}

/// `Read`/`Write` over the origin's side of a TLS session
struct Tls(TlsSessionOps);

impl Read for Tls {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf).map_err(std::io::Error::other)
    }
}

impl Write for Tls {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf).map_err(std::io::Error::other)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush().map_err(std::io::Error::other)
    }
}

fn proxy_listener() -> (TcpListener, ProxyConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let proxy = ProxyConfig::parse(&format!("http://{}", addr)).unwrap();
    (listener, proxy)
}

fn config(proxy: ProxyConfig) -> TransportConfig {
    TransportConfig::builder()
        .proxy(proxy)
        .tls(TlsConfig::client().unwrap().verify_peer(false).build().unwrap())
        .version_policy(HttpVersionPolicy::Http1Only)
        .request_timeout(Some(Duration::from_secs(5)))
        .build()
        .unwrap()
}

fn get(path: &str) -> HttpRequest {
    HttpRequest::builder().uri(path).build()
}

#[test]
fn test_https_goes_through_connect_tunnel() {
    let (listener, proxy) = proxy_listener();
    let proxy = proxy.credentials("alice", "secret");
    let server: JoinHandle<String> = thread::spawn(move || {
        let (mut tcp, _) = listener.accept().unwrap();
        let connect = read_head(&mut tcp).unwrap();
        tcp.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").unwrap();

        // from here on the bytes belong to the origin
        let tls = TlsConfig::server().unwrap().alpn(&["http/1.1"]).unwrap().build().unwrap();
        let mut origin = Tls(tls.accept(tcp).unwrap());
        let request = read_head(&mut origin).unwrap();
        assert!(request.starts_with("GET /inside HTTP/1.1\r\n"), "{}", request);
        assert!(request.contains("Host: origin.test:8443\r\n"));
        assert!(!request.to_ascii_lowercase().contains("proxy-authorization"));
        respond(&mut origin, "tunnelled");
        while read_head(&mut origin).is_some() {}
        connect
    });

    let destination = Destination::parse("https://origin.test:8443").unwrap();
    let connection = transport::open(&destination, &config(proxy)).unwrap();
    assert_eq!(connection.version(), Version::Http11);
    let mut response = connection.send(get("/inside")).unwrap();
    assert_eq!(response.read_to_end().unwrap(), b"tunnelled");
    connection.close();

    let connect = server.join().unwrap();
    assert!(connect.starts_with("CONNECT origin.test:8443 HTTP/1.1\r\n"), "{}", connect);
    assert!(connect.contains("Host: origin.test:8443\r\n"));
    assert!(connect.contains("Proxy-Authorization: Basic YWxpY2U6c2VjcmV0\r\n"));
}

#[test]
fn test_refused_tunnel_is_retry_safe() {
    let (listener, proxy) = proxy_listener();
    let server = thread::spawn(move || {
        let (mut tcp, _) = listener.accept().unwrap();
        read_head(&mut tcp).unwrap();
        tcp.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
    });

    let destination = Destination::parse("https://origin.test").unwrap();
    let transport = Transport::new(config(proxy));
    let error = transport.send(&destination, get("/")).unwrap_err();
    assert!(matches!(error, Error::ProxyConnect { status: 407, .. }), "{}", error);
    assert_eq!(error.outcome(), Outcome::RetrySafe);
    assert_eq!(transport.pool().connections(&destination), 0);

    server.join().unwrap();
}

#[test]
fn test_plain_http_is_forwarded_in_absolute_form() {
    let (listener, proxy) = proxy_listener();
    let proxy = proxy.credentials("bob", "pw");
    let server = thread::spawn(move || {
        let (mut tcp, _) = listener.accept().unwrap();
        let mut seen = Vec::new();
        for body in ["first", "second"] {
            let request = read_head(&mut tcp).unwrap();
            respond(&mut tcp, body);
            seen.push(request);
        }
        while read_head(&mut tcp).is_some() {}
        seen
    });

    let destination = Destination::parse("http://origin.test:8000").unwrap();
    let transport = Transport::new(config(proxy));
    for (path, body) in [("/a?x=1", "first"), ("/b", "second")] {
        let mut response = transport.send(&destination, get(path)).unwrap();
        assert_eq!(response.read_to_end().unwrap(), body.as_bytes());
    }
    assert_eq!(transport.pool().connections(&destination), 1);
    transport.pool().close();

    let seen = server.join().unwrap();
    assert!(seen[0].starts_with("GET http://origin.test:8000/a?x=1 HTTP/1.1\r\n"), "{}", seen[0]);
    assert!(seen[1].starts_with("GET http://origin.test:8000/b HTTP/1.1\r\n"), "{}", seen[1]);
    for request in &seen {
        assert!(request.contains("Host: origin.test:8000\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic Ym9iOnB3\r\n"));
    }
}

#[test]
fn test_non_proxy_host_connects_directly() {
    // nothing listens at the proxy address once this listener is gone
    let (listener, proxy) = proxy_listener();
    drop(listener);
    let proxy = proxy.non_proxy_hosts(["127.0.0.1"]);

    let origin = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = origin.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut tcp, _): (TcpStream, _) = origin.accept().unwrap();
        let request = read_head(&mut tcp).unwrap();
        respond(&mut tcp, "direct");
        request
    });

    let destination = Destination::parse(&format!("http://{}", addr)).unwrap();
    let connection = transport::open(&destination, &config(proxy)).unwrap();
    let mut response = connection.send(get("/here")).unwrap();
    assert_eq!(response.read_to_end().unwrap(), b"direct");
    connection.close();

    let request = server.join().unwrap();
    assert!(request.starts_with("GET /here HTTP/1.1\r\n"), "{}", request);
}
