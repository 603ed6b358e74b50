//! HTTP/2 protocol implementation (RFC 9113)
//!
//! Bottom up:
//!
//! - [`frames`] and [`codec`]: the frame model, its wire format and the
//!   assembly of HEADERS/CONTINUATION runs into header blocks
//! - [`settings`] and [`flow_control`]: SETTINGS values and the send and
//!   receive windows
//! - [`stream`]: the per-stream state machine and stream id allocation
//! - [`connection`]: the client connection, its reader thread and the
//!   [`SendStream`]/[`RecvStream`] halves handed to callers
//!
//! Header compression lives next door in [`crate::http::hpack`].
//!
//! # Examples
//!
//! ```no_run
//! use httptransport::http::h2::{ConnectionConfig, H2Connection, StreamEvent};
//! use httptransport::http::hpack::HeaderField;
//! use httptransport::http::session::FdSessionOps;
//! use std::net::TcpStream;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tcp = TcpStream::connect("127.0.0.1:8080")?;
//! let conn = H2Connection::handshake(Box::new(FdSessionOps::new(tcp)), ConnectionConfig::default())?;
//!
//! let request = vec![
//!     HeaderField::new(":method", "GET"),
//!     HeaderField::new(":scheme", "http"),
//!     HeaderField::new(":authority", "127.0.0.1:8080"),
//!     HeaderField::new(":path", "/"),
//! ];
//! let (_send, mut recv) = conn.open_stream(request, true)?;
//! if let StreamEvent::Headers { head, .. } = recv.recv(None)? {
//!     println!("status {}", head.status());
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod settings;
pub mod stream;

pub use codec::{FrameCodec, HeaderBlockAssembler};
pub use connection::{
    Canceller, ConnectionConfig, H2Connection, RecvStream, ReleaseHook, SendStream, StreamEvent,
};
pub use error::{Error, ErrorCode, Result};
pub use frames::{DataFrame, Frame, FrameFlags, FrameType, HeadersFrame, ParsedFrame, SettingsFrame};
pub use settings::{Settings, SettingsBuilder};
pub use stream::{H2Stream, StreamId, StreamState};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 9113 Section 3.4:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;
