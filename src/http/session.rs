//! Session operations abstraction
//!
//! Everything above this module talks to a [`SessionOps`] object and never
//! knows whether bytes travel over plain TCP or TLS. A session can also be
//! split into a read half and a write half ([`SessionOps::try_split`]) so
//! that an HTTP/2 reader thread and request writers can use one connection
//! at the same time.

use super::{Error, Result};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// A session behind a trait object, as the transport layer holds it
pub type BoxedSession = Box<dyn SessionOps>;

/// Session operations trait
pub trait SessionOps: Send {
    /// Wait until the session is ready for `events`
    ///
    /// Returns false when the timeout expired first.
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()>;

    /// Write the whole buffer
    fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => buf = &buf[n..],
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.flush()
    }

    /// Protocol selected by ALPN during the handshake, if any
    fn alpn_protocol(&self) -> Option<&[u8]> {
        None
    }

    /// An idle session is stale once the peer closed it or sent bytes
    /// nobody asked for
    fn is_stale(&mut self) -> bool {
        self.poll(PollEvents::Read, Some(Duration::ZERO)).unwrap_or(true)
    }

    /// A handle on the socket, used to shut the connection down from
    /// another thread
    fn try_clone_socket(&self) -> Result<TcpStream>;

    /// Split into a read half and a write half usable from two threads
    fn try_split(self: Box<Self>) -> Result<(BoxedSession, BoxedSession)>;
}

impl SessionOps for BoxedSession {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        (**self).poll(events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        (**self).write(buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        (**self).alpn_protocol()
    }

    fn is_stale(&mut self) -> bool {
        (**self).is_stale()
    }

    fn try_clone_socket(&self) -> Result<TcpStream> {
        (**self).try_clone_socket()
    }

    fn try_split(self: Box<Self>) -> Result<(BoxedSession, BoxedSession)> {
        SessionOps::try_split(*self)
    }
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// `poll(2)` on a single descriptor
pub(crate) fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLOUT,
        },
        revents: 0,
    };

    // -1 = infinite
    let timeout_ms = timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1);

    loop {
        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };
        if result >= 0 {
            return Ok(result > 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(Error::Io(err));
        }
    }
}

/// HTTP session wrapping a transport with an I/O timeout
pub struct HttpSession<S: SessionOps> {
    session: S,
    timeout: Option<Duration>,
}

impl<S: SessionOps> HttpSession<S> {
    pub fn new(session: S) -> Self {
        HttpSession {
            session,
            timeout: Some(Duration::from_secs(10)),
        }
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Read data, failing with [`Error::Timeout`] when nothing arrives in time
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.session.poll(PollEvents::Read, self.timeout)? {
            return Err(Error::Timeout);
        }
        self.session.read(buf)
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if !self.session.poll(PollEvents::Write, self.timeout)? {
            return Err(Error::Timeout);
        }
        self.session.write_all(buf)
    }

    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    pub fn get_ref(&self) -> &S {
        &self.session
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn into_inner(self) -> S {
        self.session
    }
}

/// Plain file descriptor session operations
pub struct FdSessionOps {
    stream: TcpStream,
}

impl FdSessionOps {
    pub fn new(stream: TcpStream) -> Self {
        FdSessionOps { stream }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl SessionOps for FdSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        poll_fd(self.stream.as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).map_err(Error::from)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(Error::from)
    }

    fn close(&mut self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            // already gone
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other.map_err(Error::from),
        }
    }

    fn try_clone_socket(&self) -> Result<TcpStream> {
        self.stream.try_clone().map_err(Error::from)
    }

    fn try_split(self: Box<Self>) -> Result<(BoxedSession, BoxedSession)> {
        let writer: BoxedSession = Box::new(FdSessionOps::new(self.stream.try_clone()?));
        let reader: BoxedSession = self;
        Ok((reader, writer))
    }
}

/// Helper to create an HTTP session from a TCP stream
pub fn from_tcp_stream(stream: TcpStream) -> HttpSession<FdSessionOps> {
    HttpSession::new(FdSessionOps::new(stream))
}
