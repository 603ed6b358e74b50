//! TLS support for HTTP connections
//!
//! The TLS layer plugs into the session operations abstraction:
//!
//! 1. `TlsConfig` holds an OpenSSL context (versions, trust, certificates)
//! 2. `TlsSessionOps` implements the `SessionOps` trait for encrypted I/O
//! 3. HTTP/1.1 and HTTP/2 code runs unchanged on top of it
//!
//! Application protocols are offered per connection through ALPN; the
//! transport reads the outcome from [`SessionOps::alpn_protocol`].
//!
//! [`SessionOps::alpn_protocol`]: crate::http::session::SessionOps::alpn_protocol
//!
//! # Examples
//!
//! ```no_run
//! use httptransport::http::tls::{TlsConfig, TlsVersion};
//! use httptransport::http::session::SessionOps;
//! use std::net::TcpStream;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tls_config = TlsConfig::client()?
//!     .version_range(TlsVersion::Tls12, TlsVersion::Tls13)?
//!     .build()?;
//!
//! let tcp_stream = TcpStream::connect("example.com:443")?;
//! let session = tls_config.connect(tcp_stream, "example.com", &["h2", "http/1.1"])?;
//! println!("negotiated {:?}", session.alpn_protocol());
//! # Ok(())
//! # }
//! ```

pub mod builtin_cert;
pub mod config;
pub mod session;

pub use config::{ClientConfigBuilder, ServerConfigBuilder, TlsConfig, TlsError, TlsVersion};
pub use session::TlsSessionOps;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
