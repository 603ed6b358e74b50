//! TLS session operations
//!
//! [`TlsSessionOps`] implements [`SessionOps`] over an OpenSSL stream. When
//! split, both halves share the stream behind a mutex; the read half only
//! takes the lock once the socket is readable, and the socket carries a
//! short receive timeout so a partial record never pins the lock.

use super::config::{encode_alpn, TlsConfig, TlsError};
use crate::http::session::{poll_fd, BoxedSession, PollEvents, SessionOps};
use crate::http::{Error, Result as HttpResult};
use openssl::ssl::{ErrorCode, Ssl, SslStream};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Receive timeout of a split session's socket
const SPLIT_READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Staleness of an idle TLS session
///
/// A readable socket is not enough: TLS 1.3 servers send session tickets
/// after the handshake. A non-blocking read lets OpenSSL consume such
/// records; only EOF, an error or application data make the session stale.
fn idle_stream_is_stale(stream: &mut SslStream<TcpStream>) -> bool {
    if stream.ssl().pending() > 0 {
        return true;
    }
    match poll_fd(stream.get_ref().as_raw_fd(), PollEvents::Read, Some(Duration::ZERO)) {
        Ok(false) => return false,
        Ok(true) => {}
        Err(_) => return true,
    }
    if stream.get_ref().set_nonblocking(true).is_err() {
        return true;
    }
    let mut byte = [0u8; 1];
    let stale = match stream.ssl_read(&mut byte) {
        Err(e) if e.code() == ErrorCode::WANT_READ => false,
        _ => true,
    };
    if stale {
        log::debug!("idle TLS session is closed or has unexpected data");
    }
    stream.get_ref().set_nonblocking(false).is_err() || stale
}

/// TLS session operations
pub struct TlsSessionOps {
    stream: SslStream<TcpStream>,
    alpn: Option<Vec<u8>>,
    version: &'static str,
    failed: bool,
}

impl TlsSessionOps {
    pub(crate) fn connect(
        tcp_stream: TcpStream,
        config: &TlsConfig,
        host: &str,
        alpn: &[&str],
    ) -> Result<Self, TlsError> {
        let mut ssl = Ssl::new(&config.ctx)?;
        let name = config.servername.as_deref().unwrap_or(host);

        // SNI only carries DNS names
        match name.parse::<std::net::IpAddr>() {
            Ok(ip) if config.verify_peer => ssl.param_mut().set_ip(ip)?,
            Ok(_) => {}
            Err(_) => {
                ssl.set_hostname(name)?;
                if config.verify_peer {
                    ssl.param_mut().set_host(name)?;
                }
            }
        }
        if !alpn.is_empty() {
            ssl.set_alpn_protos(&encode_alpn(alpn)?)?;
        }

        let stream = ssl
            .connect(tcp_stream)
            .map_err(|e| TlsError::HandshakeFailed(format!("Connection failed: {}", e)))?;
        Ok(Self::established(stream))
    }

    pub(crate) fn accept(tcp_stream: TcpStream, config: &TlsConfig) -> Result<Self, TlsError> {
        let ssl = Ssl::new(&config.ctx)?;
        let stream = ssl
            .accept(tcp_stream)
            .map_err(|e| TlsError::HandshakeFailed(format!("Accept failed: {}", e)))?;
        Ok(Self::established(stream))
    }

    fn established(stream: SslStream<TcpStream>) -> Self {
        let alpn = stream.ssl().selected_alpn_protocol().map(|p| p.to_vec());
        let version = stream.ssl().version_str();
        log::debug!(
            "TLS session established: {} alpn={}",
            version,
            alpn.as_deref().map(String::from_utf8_lossy).unwrap_or_default()
        );
        TlsSessionOps {
            stream,
            alpn,
            version,
            failed: false,
        }
    }

    /// Negotiated protocol version, e.g. "TLSv1.3"
    pub fn version(&self) -> &'static str {
        self.version
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }

    fn io_failed(&mut self, e: io::Error) -> Error {
        self.failed = true;
        Error::Io(e)
    }
}

impl SessionOps for TlsSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> HttpResult<bool> {
        if events != PollEvents::Write && self.stream.ssl().pending() > 0 {
            return Ok(true);
        }
        poll_fd(self.stream.get_ref().as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        self.stream.read(buf).map_err(|e| self.io_failed(e))
    }

    fn write(&mut self, buf: &[u8]) -> HttpResult<usize> {
        self.stream.write(buf).map_err(|e| self.io_failed(e))
    }

    fn flush(&mut self) -> HttpResult<()> {
        self.stream.flush().map_err(|e| self.io_failed(e))
    }

    fn close(&mut self) -> HttpResult<()> {
        if !self.failed {
            let _ = self.stream.shutdown();
        }
        match self.stream.get_mut().shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other.map_err(Error::from),
        }
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    fn is_stale(&mut self) -> bool {
        self.failed || idle_stream_is_stale(&mut self.stream)
    }

    fn try_clone_socket(&self) -> HttpResult<TcpStream> {
        self.stream.get_ref().try_clone().map_err(Error::from)
    }

    fn try_split(self: Box<Self>) -> HttpResult<(BoxedSession, BoxedSession)> {
        let this = *self;
        this.stream.get_ref().set_read_timeout(Some(SPLIT_READ_TIMEOUT))?;
        let fd = this.stream.get_ref().as_raw_fd();
        let shared = Arc::new(Mutex::new(this.stream));

        let reader: BoxedSession = Box::new(TlsHalf {
            stream: Arc::clone(&shared),
            fd,
            alpn: this.alpn.clone(),
        });
        let writer: BoxedSession = Box::new(TlsHalf {
            stream: shared,
            fd,
            alpn: this.alpn,
        });
        Ok((reader, writer))
    }
}

/// One side of a split TLS session
struct TlsHalf {
    stream: Arc<Mutex<SslStream<TcpStream>>>,
    fd: RawFd,
    alpn: Option<Vec<u8>>,
}

impl TlsHalf {
    fn lock(&self) -> HttpResult<MutexGuard<'_, SslStream<TcpStream>>> {
        self.stream
            .lock()
            .map_err(|_| Error::Protocol("TLS session lock poisoned".to_string()))
    }
}

impl SessionOps for TlsHalf {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> HttpResult<bool> {
        if events != PollEvents::Write {
            // a busy writer means we simply fall back to the descriptor
            if let Ok(stream) = self.stream.try_lock() {
                if stream.ssl().pending() > 0 {
                    return Ok(true);
                }
            }
        }
        poll_fd(self.fd, events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        match self.lock()?.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Err(Error::Timeout)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> HttpResult<usize> {
        loop {
            match self.lock()?.write(buf) {
                Ok(n) => return Ok(n),
                // a TLS write can need to read; the short receive timeout
                // surfaces as WouldBlock and the write is retried
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn flush(&mut self) -> HttpResult<()> {
        self.lock()?.flush().map_err(Error::from)
    }

    fn close(&mut self) -> HttpResult<()> {
        let mut stream = self.lock()?;
        let _ = stream.shutdown();
        match stream.get_mut().shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other.map_err(Error::from),
        }
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    fn is_stale(&mut self) -> bool {
        match self.lock() {
            Ok(mut stream) => idle_stream_is_stale(&mut stream),
            Err(_) => true,
        }
    }

    fn try_clone_socket(&self) -> HttpResult<TcpStream> {
        self.lock()?.get_ref().try_clone().map_err(Error::from)
    }

    fn try_split(self: Box<Self>) -> HttpResult<(BoxedSession, BoxedSession)> {
        Err(Error::Protocol("TLS session is already split".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{TlsConfig, TlsVersion};
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn client_config() -> TlsConfig {
        TlsConfig::client().unwrap().verify_peer(false).build().unwrap()
    }

    #[test]
    fn test_tls_client_server_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server_config = TlsConfig::server()
            .unwrap()
            .version(TlsVersion::Tls13)
            .unwrap()
            .build()
            .unwrap();

        let server_handle = thread::spawn(move || {
            let (tcp_stream, _) = listener.accept().unwrap();
            let mut tls_session = server_config.accept(tcp_stream).unwrap();

            let mut buf = vec![0u8; 5];
            let mut filled = 0;
            while filled < 5 {
                filled += tls_session.read(&mut buf[filled..]).unwrap();
            }
            assert_eq!(&buf, b"Hello");

            tls_session.write_all(b"World").unwrap();
            tls_session.close().unwrap();
        });

        let tcp_stream = TcpStream::connect(addr).unwrap();
        let mut tls_session = client_config().connect(tcp_stream, "localhost", &[]).unwrap();
        assert_eq!(tls_session.version(), "TLSv1.3");
        assert_eq!(tls_session.alpn_protocol(), None);

        tls_session.write_all(b"Hello").unwrap();

        let mut buf = vec![0u8; 5];
        let mut filled = 0;
        while filled < 5 {
            filled += tls_session.read(&mut buf[filled..]).unwrap();
        }
        assert_eq!(&buf, b"World");

        server_handle.join().unwrap();
    }

    #[test]
    fn test_alpn_negotiation() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_config = TlsConfig::server().unwrap().alpn(&["h2", "http/1.1"]).unwrap().build().unwrap();

        let server_handle = thread::spawn(move || {
            let (tcp_stream, _) = listener.accept().unwrap();
            let session = server_config.accept(tcp_stream).unwrap();
            session.alpn_protocol().map(|p| p.to_vec())
        });

        let tcp_stream = TcpStream::connect(addr).unwrap();
        let session = client_config()
            .connect(tcp_stream, "localhost", &["http/1.1", "h2"])
            .unwrap();

        // server preference wins
        assert_eq!(session.alpn_protocol(), Some(&b"h2"[..]));
        assert_eq!(server_handle.join().unwrap(), Some(b"h2".to_vec()));
    }

    #[test]
    fn test_split_session_reads_while_writing() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_config = TlsConfig::server().unwrap().build().unwrap();

        let server_handle = thread::spawn(move || {
            let (tcp_stream, _) = listener.accept().unwrap();
            let mut session = server_config.accept(tcp_stream).unwrap();
            session.write_all(b"greeting").unwrap();
            let mut buf = [0u8; 5];
            let mut filled = 0;
            while filled < 5 {
                filled += session.read(&mut buf[filled..]).unwrap();
            }
            buf
        });

        let tcp_stream = TcpStream::connect(addr).unwrap();
        let session: BoxedSession = Box::new(client_config().connect(tcp_stream, "localhost", &[]).unwrap());
        let (mut reader, mut writer) = session.try_split().unwrap();

        let read_side = thread::spawn(move || {
            let mut buf = [0u8; 8];
            let mut filled = 0;
            while filled < 8 {
                assert!(reader.poll(PollEvents::Read, Some(Duration::from_secs(5))).unwrap());
                match reader.read(&mut buf[filled..]) {
                    Ok(n) => filled += n,
                    Err(Error::Timeout) => continue,
                    Err(e) => panic!("read failed: {}", e),
                }
            }
            buf
        });

        writer.write_all(b"hello").unwrap();
        assert_eq!(&read_side.join().unwrap(), b"greeting");
        assert_eq!(&server_handle.join().unwrap(), b"hello");
    }
}
