//! Transport tests over TLS
//!
//! The server side is a `TlsConfig::server()` session on the built-in
//! certificate. ALPN decides between a minimal HTTP/2 peer and a one-shot
//! HTTP/1.1 responder.

use bytes::{Bytes, BytesMut};
use httptransport::http::h2::{
    DataFrame, FrameCodec, HeaderBlockAssembler, ParsedFrame, Settings, SettingsFrame,
    CONNECTION_PREFACE,
};
use httptransport::http::hpack::{Decoder, Encoder, HeaderField};
use httptransport::http::session::SessionOps;
use httptransport::http::tls::builtin_cert::BUILTIN_CERT;
use httptransport::http::tls::{TlsConfig, TlsSessionOps, TlsVersion};
use httptransport::http::transport::{
    self, Destination, Error, HttpVersionPolicy, Outcome, Transport, TransportConfig,
};
use httptransport::http::{HttpRequest, Version};
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// `Read`/`Write` over a server-side TLS session
struct Tls(TlsSessionOps);

impl Read for Tls {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).map_err(io::Error::other)
    }
}

impl Write for Tls {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush().map_err(io::Error::other)
    }
}

fn server_tls(alpn: &[&str]) -> TlsConfig {
    let builder = TlsConfig::server().unwrap();
    let builder = if alpn.is_empty() {
        builder
    } else {
        builder.alpn(alpn).unwrap()
    };
    builder.build().unwrap()
}

fn insecure_client(policy: HttpVersionPolicy) -> TransportConfig {
    TransportConfig::builder()
        .tls(TlsConfig::client().unwrap().verify_peer(false).build().unwrap())
        .version_policy(policy)
        .build()
        .unwrap()
}

/// Accept one TLS connection and hand it to `serve`
fn spawn_server<F>(alpn: &[&str], serve: F) -> (Destination, JoinHandle<Option<Vec<u8>>>)
where
    F: FnOnce(Tls) + Send + 'static,
{
    spawn_server_with(server_tls(alpn), serve)
}

fn spawn_server_with<F>(tls: TlsConfig, serve: F) -> (Destination, JoinHandle<Option<Vec<u8>>>)
where
    F: FnOnce(Tls) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (tcp, _) = listener.accept().unwrap();
        let session = match tls.accept(tcp) {
            Ok(session) => session,
            Err(_) => return None,
        };
        let negotiated = session.alpn_protocol().map(|p| p.to_vec());
        serve(Tls(session));
        negotiated
    });
    let destination = Destination::parse(&format!("https://{}", addr)).unwrap();
    (destination, handle)
}

/// Answer a single HTTP/1.1 request with `body`
fn serve_http1(body: &'static str) -> impl FnOnce(Tls) + Send + 'static {
    move |mut tls| {
        let mut request = Vec::new();
        let mut chunk = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            match tls.read(&mut chunk) {
                Ok(n) if n > 0 => request.extend_from_slice(&chunk[..n]),
                _ => return,
            }
        }
        assert!(request.starts_with(b"GET /secure HTTP/1.1\r\n"));
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        tls.write_all(response.as_bytes()).unwrap();
        tls.flush().unwrap();
        // wait for the client to hang up
        while matches!(tls.read(&mut chunk), Ok(n) if n > 0) {}
    }
}

/// Answer `count` HTTP/1.1 requests on one connection
fn serve_http1_keepalive(count: usize) -> impl FnOnce(Tls) + Send + 'static {
    move |mut tls| {
        let mut chunk = [0u8; 1024];
        for i in 0..count {
            let mut request = Vec::new();
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match tls.read(&mut chunk) {
                    Ok(n) if n > 0 => request.extend_from_slice(&chunk[..n]),
                    _ => return,
                }
            }
            let body = format!("reply {}", i);
            let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body);
            tls.write_all(response.as_bytes()).unwrap();
            tls.flush().unwrap();
        }
        while matches!(tls.read(&mut chunk), Ok(n) if n > 0) {}
    }
}

fn tls13_client() -> TransportConfig {
    let tls = TlsConfig::client()
        .unwrap()
        .verify_peer(false)
        .version(TlsVersion::Tls13)
        .unwrap()
        .build()
        .unwrap();
    TransportConfig::builder()
        .tls(tls)
        .version_policy(HttpVersionPolicy::Http1Only)
        .build()
        .unwrap()
}

/// Answer a single HTTP/2 request with `body`
fn serve_h2(body: &'static [u8]) -> impl FnOnce(Tls) + Send + 'static {
    move |mut tls| {
        let mut preface = [0u8; 24];
        tls.read_exact(&mut preface).unwrap();
        assert_eq!(&preface[..], CONNECTION_PREFACE);

        let mut out = BytesMut::new();
        FrameCodec::encode_settings_frame(&SettingsFrame::new(Settings::new()), &mut out);
        FrameCodec::encode_settings_frame(&SettingsFrame::ack(), &mut out);
        tls.write_all(&out).unwrap();

        let mut codec = FrameCodec::new();
        let mut assembler = HeaderBlockAssembler::new(1 << 20);
        let mut decoder = Decoder::new();
        let (stream_id, fields) = loop {
            let frame = codec.read_frame(&mut tls).unwrap().parse().unwrap();
            if let ParsedFrame::Headers(headers) = frame {
                let block = assembler.headers(headers).unwrap().unwrap();
                break (block.stream_id, decoder.decode(&block.block).unwrap());
            }
        };
        assert!(fields.contains(&HeaderField::new(":scheme", "https")));
        assert!(fields.contains(&HeaderField::new(":path", "/secure")));

        let mut block = BytesMut::new();
        Encoder::new().encode(&[HeaderField::new(":status", "200")], &mut block);
        let mut out = BytesMut::new();
        FrameCodec::encode_header_block(stream_id, &block, false, 16_384, &mut out);
        let data = DataFrame::new(stream_id, Bytes::from_static(body), true);
        FrameCodec::encode_data_frame(&data, &mut out);
        tls.write_all(&out).unwrap();

        // drain until GOAWAY and close
        while codec.read_frame(&mut tls).is_ok() {}
    }
}

fn get_secure() -> HttpRequest {
    HttpRequest::builder().uri("/secure").build()
}

#[test]
fn test_alpn_selects_http2() {
    let (destination, server) = spawn_server(&["h2", "http/1.1"], serve_h2(b"over h2"));

    let connection = transport::open(&destination, &insecure_client(HttpVersionPolicy::Negotiate)).unwrap();
    assert_eq!(connection.version(), Version::Http2);

    let mut response = connection.send(get_secure()).unwrap();
    assert_eq!(response.headers().unwrap().status().code(), 200);
    assert_eq!(response.read_to_end().unwrap(), b"over h2");

    connection.close();
    assert_eq!(server.join().unwrap(), Some(b"h2".to_vec()));
}

#[test]
fn test_alpn_falls_back_to_http1() {
    let (destination, server) = spawn_server(&["http/1.1"], serve_http1("over http/1.1"));

    let connection = transport::open(&destination, &insecure_client(HttpVersionPolicy::Negotiate)).unwrap();
    assert_eq!(connection.version(), Version::Http11);

    let mut response = connection.send(get_secure()).unwrap();
    assert_eq!(response.version(), Version::Http11);
    assert_eq!(response.read_to_end().unwrap(), b"over http/1.1");

    connection.close();
    assert_eq!(server.join().unwrap(), Some(b"http/1.1".to_vec()));
}

#[test]
fn test_http1_policy_never_offers_h2() {
    let (destination, server) = spawn_server(&["h2", "http/1.1"], serve_http1("no h2 here"));

    let connection = transport::open(&destination, &insecure_client(HttpVersionPolicy::Http1Only)).unwrap();
    assert_eq!(connection.version(), Version::Http11);
    let mut response = connection.send(get_secure()).unwrap();
    assert_eq!(response.read_to_end().unwrap(), b"no h2 here");

    connection.close();
    assert_eq!(server.join().unwrap(), Some(b"http/1.1".to_vec()));
}

#[test]
fn test_no_alpn_means_http1() {
    let (destination, server) = spawn_server(&[], serve_http1("plain tls"));

    let connection = transport::open(&destination, &insecure_client(HttpVersionPolicy::Negotiate)).unwrap();
    assert_eq!(connection.version(), Version::Http11);
    let mut response = connection.send(get_secure()).unwrap();
    assert_eq!(response.read_to_end().unwrap(), b"plain tls");

    connection.close();
    assert_eq!(server.join().unwrap(), None);
}

#[test]
fn test_pooled_transport_over_tls() {
    let (destination, server) = spawn_server(&["h2"], serve_h2(b"pooled"));

    let transport = Transport::new(insecure_client(HttpVersionPolicy::Negotiate));
    let mut response = transport.send(&destination, get_secure()).unwrap();
    assert_eq!(response.version(), Version::Http2);
    assert_eq!(response.read_to_end().unwrap(), b"pooled");
    drop(response);
    assert_eq!(transport.pool().connections(&destination), 1);

    transport.pool().close();
    assert_eq!(server.join().unwrap(), Some(b"h2".to_vec()));
}

#[test]
fn test_trusted_certificate_verifies() {
    let (destination, server) = spawn_server(&["http/1.1"], serve_http1("verified"));

    let tls = TlsConfig::client()
        .unwrap()
        .root_certificate_pem(BUILTIN_CERT.as_bytes())
        .unwrap()
        .servername("example.com")
        .build()
        .unwrap();
    let config = TransportConfig::builder().tls(tls).build().unwrap();

    let connection = transport::open(&destination, &config).unwrap();
    let mut response = connection.send(get_secure()).unwrap();
    assert_eq!(response.read_to_end().unwrap(), b"verified");

    connection.close();
    server.join().unwrap();
}

#[test]
fn test_untrusted_certificate_is_retry_safe() {
    let (destination, server) = spawn_server(&["http/1.1"], serve_http1("unreachable"));

    let config = TransportConfig::builder()
        .tls(TlsConfig::client().unwrap().build().unwrap())
        .build()
        .unwrap();
    let error = transport::open(&destination, &config).unwrap_err();
    assert!(matches!(error, Error::Tls(_)), "unexpected error: {}", error);
    assert_eq!(error.outcome(), Outcome::RetrySafe);

    assert_eq!(server.join().unwrap(), None);
}

#[test]
fn test_tls13_keepalive_survives_session_tickets() {
    let server_config = TlsConfig::server()
        .unwrap()
        .version(TlsVersion::Tls13)
        .unwrap()
        .build()
        .unwrap();
    let (destination, server) = spawn_server_with(server_config, serve_http1_keepalive(2));

    let connection = transport::open(&destination, &tls13_client()).unwrap();
    // post-handshake NewSessionTicket records are now sitting unread
    thread::sleep(Duration::from_millis(100));

    let mut response = connection.send(get_secure()).unwrap();
    assert_eq!(response.read_to_end().unwrap(), b"reply 0");
    drop(response);
    thread::sleep(Duration::from_millis(50));

    let mut response = connection.send(get_secure()).unwrap();
    assert_eq!(response.read_to_end().unwrap(), b"reply 1");
    drop(response);

    connection.close();
    server.join().unwrap();
}

#[test]
fn test_tls13_pooled_connection_is_reused() {
    let server_config = TlsConfig::server()
        .unwrap()
        .version(TlsVersion::Tls13)
        .unwrap()
        .build()
        .unwrap();
    let (destination, server) = spawn_server_with(server_config, serve_http1_keepalive(2));

    let transport = Transport::new(tls13_client());
    let mut response = transport.send(&destination, get_secure()).unwrap();
    assert_eq!(response.read_to_end().unwrap(), b"reply 0");
    drop(response);
    thread::sleep(Duration::from_millis(100));

    // the idle connection must not be taken for a closed one
    let mut response = transport.send(&destination, get_secure()).unwrap();
    assert_eq!(response.read_to_end().unwrap(), b"reply 1");
    drop(response);
    assert_eq!(transport.pool().connections(&destination), 1);

    transport.pool().close();
    server.join().unwrap();
}
