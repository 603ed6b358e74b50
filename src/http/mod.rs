//! HTTP building blocks
//!
//! The layers, bottom up:
//!
//! - [`session`]: the `SessionOps` abstraction over plain TCP and [`tls`]
//! - [`hpack`]: RFC 7541 header compression
//! - [`h2`]: HTTP/2 frames, streams and the multiplexed connection
//! - [`message`], [`headers`], [`parser`], [`chunked`]: HTTP/1.1 message
//!   model and wire format
//! - [`transport`]: the blocking client façade choosing HTTP/1.1 or HTTP/2
//!   per connection, with pooling
//!
//! # Examples
//!
//! ```no_run
//! use httptransport::http::transport::{Destination, Transport, TransportConfig};
//! use httptransport::http::{HttpRequest, Method};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Transport::new(TransportConfig::builder().build()?);
//! let destination = Destination::parse("http://127.0.0.1:8080")?;
//!
//! let request = HttpRequest::builder().method(Method::Get).uri("/").build();
//! let mut response = transport.send(&destination, request)?;
//! assert_eq!(response.headers()?.status().code(), 200);
//! let body = response.read_to_end()?;
//! # Ok(())
//! # }
//! ```

pub mod chunked;
pub mod h2;
pub mod headers;
pub mod hpack;
pub mod message;
pub mod parser;
pub mod session;
pub mod tls;
pub mod transport;

pub use headers::Headers;
pub use message::{HttpRequest, Method, ResponseHead, Status, Version};
pub use parser::ResponseHeadParser;
pub use session::{BoxedSession, HttpSession, SessionOps};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP/1.1 and session errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Incomplete message")]
    Incomplete,

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Maximum number of header lines in an HTTP/1.1 response head
pub const MAX_HEADERS: usize = 128;

/// Maximum size of an HTTP/1.1 response head
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default HTTPS port
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
