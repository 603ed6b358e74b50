//! HTTP/2 error types
//!
//! This module defines error types for HTTP/2 operations, mapping to
//! the error codes defined in RFC 9113 Section 7.
//!
//! Every [`Error`] has a scope: connection errors tear down the whole
//! connection (a GOAWAY carrying [`Error::code`] is sent when possible),
//! stream errors only concern one request and are answered with RST_STREAM.

use crate::http::hpack::HpackError;
use std::fmt;

/// HTTP/2 errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the underlying session
    #[error("session error: {0}")]
    Http(#[from] crate::http::Error),

    /// Header block could not be decoded (COMPRESSION_ERROR)
    #[error("compression error: {0}")]
    Compression(#[from] HpackError),

    /// Protocol error detected (PROTOCOL_ERROR)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connection flow-control window violated (FLOW_CONTROL_ERROR)
    #[error("flow control error: {0}")]
    FlowControl(String),

    /// The peer did not acknowledge our SETTINGS in time (SETTINGS_TIMEOUT)
    #[error("settings timeout")]
    SettingsTimeout,

    /// Frame size incorrect (FRAME_SIZE_ERROR)
    #[error("frame size error: {0}")]
    FrameSize(String),

    /// Peer exceeded a processing limit (ENHANCE_YOUR_CALM)
    #[error("enhance your calm: {0}")]
    EnhanceYourCalm(String),

    /// A stream-scoped violation detected locally; RST_STREAM is sent
    #[error("stream {stream_id} error: {code}: {reason}")]
    Stream {
        stream_id: u32,
        code: ErrorCode,
        reason: String,
    },

    /// The peer reset the stream
    #[error("stream {stream_id} reset by peer: {code}")]
    Reset { stream_id: u32, code: ErrorCode },

    /// The peer sent GOAWAY and will not process this stream
    #[error("connection going away (last stream {last_stream_id}): {code}")]
    GoAway { last_stream_id: u32, code: ErrorCode },

    /// The connection failed while the stream was in flight
    #[error("connection failed: {code}: {reason}")]
    ConnectionFailed { code: ErrorCode, reason: String },

    /// The stream was cancelled locally
    #[error("stream {0} cancelled")]
    Cancelled(u32),

    /// Timeout waiting for the peer
    #[error("timeout")]
    Timeout,

    /// No concurrency slot became free in time
    #[error("too many concurrent streams")]
    TooManyStreams,

    /// The connection is shutting down or has used up its stream ids
    #[error("connection is not accepting new streams")]
    NotAccepting,

    /// Connection closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Malformed request or response header section
    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

impl Error {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Error::Protocol(reason.into())
    }

    pub fn stream(stream_id: u32, code: ErrorCode, reason: impl Into<String>) -> Self {
        Error::Stream {
            stream_id,
            code,
            reason: reason.into(),
        }
    }

    /// The RFC 9113 error code carried by RST_STREAM or GOAWAY for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Io(_) | Error::Http(_) | Error::ConnectionClosed => ErrorCode::InternalError,
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::Protocol(_) | Error::InvalidHeader(_) => ErrorCode::ProtocolError,
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::SettingsTimeout => ErrorCode::SettingsTimeout,
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::EnhanceYourCalm(_) => ErrorCode::EnhanceYourCalm,
            Error::Stream { code, .. }
            | Error::Reset { code, .. }
            | Error::GoAway { code, .. }
            | Error::ConnectionFailed { code, .. } => *code,
            Error::Cancelled(_) | Error::Timeout => ErrorCode::Cancel,
            Error::TooManyStreams | Error::NotAccepting => ErrorCode::RefusedStream,
        }
    }

    /// Whether this error terminates the whole connection
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Compression(HpackError::HeaderListTooLarge(_)) => false,
            Error::Io(_)
            | Error::Http(_)
            | Error::Compression(_)
            | Error::Protocol(_)
            | Error::FlowControl(_)
            | Error::SettingsTimeout
            | Error::FrameSize(_)
            | Error::EnhanceYourCalm(_)
            | Error::ConnectionFailed { .. }
            | Error::ConnectionClosed => true,
            _ => false,
        }
    }

    /// Whether the peer is known not to have processed the request
    pub fn is_refused(&self) -> bool {
        match self {
            Error::Reset { code, .. } => *code == ErrorCode::RefusedStream,
            Error::GoAway { .. } | Error::TooManyStreams | Error::NotAccepting => true,
            _ => false,
        }
    }

    /// A clonable copy of this error to fail every stream of a dead connection
    pub fn to_connection_failure(&self) -> Error {
        match self {
            Error::ConnectionFailed { code, reason } => Error::ConnectionFailed {
                code: *code,
                reason: reason.clone(),
            },
            Error::ConnectionClosed => Error::ConnectionClosed,
            other => Error::ConnectionFailed {
                code: other.code(),
                reason: other.to_string(),
            },
        }
    }
}

/// HTTP/2 error codes as defined in RFC 9113 Section 7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown
    NoError = 0x0,
    /// Protocol error detected
    ProtocolError = 0x1,
    /// Implementation fault
    InternalError = 0x2,
    /// Flow-control limits exceeded
    FlowControlError = 0x3,
    /// Settings not acknowledged
    SettingsTimeout = 0x4,
    /// Frame received for closed stream
    StreamClosed = 0x5,
    /// Frame size incorrect
    FrameSizeError = 0x6,
    /// Stream not processed
    RefusedStream = 0x7,
    /// Stream cancelled
    Cancel = 0x8,
    /// Compression state not updated
    CompressionError = 0x9,
    /// TCP connection error for CONNECT method
    ConnectError = 0xa,
    /// Processing capacity exceeded
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS parameters not acceptable
    InadequateSecurity = 0xc,
    /// Use HTTP/1.1 for the request
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0x0 => Some(ErrorCode::NoError),
            0x1 => Some(ErrorCode::ProtocolError),
            0x2 => Some(ErrorCode::InternalError),
            0x3 => Some(ErrorCode::FlowControlError),
            0x4 => Some(ErrorCode::SettingsTimeout),
            0x5 => Some(ErrorCode::StreamClosed),
            0x6 => Some(ErrorCode::FrameSizeError),
            0x7 => Some(ErrorCode::RefusedStream),
            0x8 => Some(ErrorCode::Cancel),
            0x9 => Some(ErrorCode::CompressionError),
            0xa => Some(ErrorCode::ConnectError),
            0xb => Some(ErrorCode::EnhanceYourCalm),
            0xc => Some(ErrorCode::InadequateSecurity),
            0xd => Some(ErrorCode::Http11Required),
            _ => None,
        }
    }

    /// Unknown codes must be treated as INTERNAL_ERROR (RFC 9113 Section 7)
    pub fn from_wire(code: u32) -> Self {
        Self::from_u32(code).unwrap_or(ErrorCode::InternalError)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(ErrorCode::NoError.as_u32(), 0x0);
        assert_eq!(ErrorCode::Http11Required.as_u32(), 0xd);

        assert_eq!(ErrorCode::from_u32(0x1), Some(ErrorCode::ProtocolError));
        assert_eq!(ErrorCode::from_u32(0xff), None);
        assert_eq!(ErrorCode::from_wire(0xff), ErrorCode::InternalError);
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::FlowControlError.to_string(), "FLOW_CONTROL_ERROR (0x3)");
    }

    #[test]
    fn test_hpack_errors_escalate() {
        let err = Error::from(HpackError::InvalidIndex(70));
        assert_eq!(err.code(), ErrorCode::CompressionError);
        assert!(err.is_connection_error());

        let err = Error::from(HpackError::HeaderListTooLarge(100));
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_stream_errors_are_local() {
        let err = Error::Reset {
            stream_id: 3,
            code: ErrorCode::Cancel,
        };
        assert!(!err.is_connection_error());
        assert!(!err.is_refused());
        assert_eq!(err.to_string(), "stream 3 reset by peer: CANCEL (0x8)");

        let refused = Error::Reset {
            stream_id: 5,
            code: ErrorCode::RefusedStream,
        };
        assert!(refused.is_refused());
    }

    #[test]
    fn test_connection_failure_copy() {
        let err = Error::protocol("unexpected CONTINUATION");
        let copy = err.to_connection_failure();
        assert_eq!(copy.code(), ErrorCode::ProtocolError);
        assert!(copy.is_connection_error());
        assert!(copy.to_string().contains("unexpected CONTINUATION"));
    }
}
