//! Transport errors
//!
//! Every lower layer error converts into [`Error`], and each error tells the
//! caller whether the request may be retried ([`Error::outcome`]).

use crate::http::h2;
use crate::http::tls::TlsError;
use std::time::Duration;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to connect to {destination}: {source}")]
    Connect {
        destination: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("HTTP/1.1 error: {0}")]
    Http(#[from] crate::http::Error),

    #[error("HTTP/2 error: {0}")]
    H2(#[from] h2::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Request cancelled")]
    Cancelled,

    #[error("No connection available within {0:?}")]
    PoolExhausted(Duration),

    #[error("Connection is busy with another exchange")]
    Busy,

    #[error("Proxy refused the tunnel to {destination}: status {status}")]
    ProxyConnect { destination: String, status: u16 },

    #[error("Request not sent: {source}")]
    Unsent {
        #[source]
        source: Box<Error>,
    },
}

/// Whether the server may have seen a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The request was not processed; sending it again is safe
    RetrySafe,
    /// The request may have been processed
    UnknownOutcome,
}

impl Error {
    pub fn outcome(&self) -> Outcome {
        match self {
            Error::Connect { .. }
            | Error::Tls(_)
            | Error::InvalidConfig(_)
            | Error::InvalidDestination(_)
            | Error::InvalidRequest(_)
            | Error::PoolExhausted(_)
            | Error::Busy
            | Error::ProxyConnect { .. }
            | Error::Unsent { .. } => Outcome::RetrySafe,
            Error::H2(e) if e.is_refused() => Outcome::RetrySafe,
            _ => Outcome::UnknownOutcome,
        }
    }

    /// Mark an error that happened before any request byte left
    pub(crate) fn unsent(self) -> Error {
        match self {
            Error::Unsent { .. } => self,
            other => Error::Unsent {
                source: Box::new(other),
            },
        }
    }

    /// Translate stream-level HTTP/2 outcomes into their façade names
    pub(crate) fn from_h2(error: h2::Error) -> Error {
        match error {
            h2::Error::Timeout => Error::Timeout,
            h2::Error::Cancelled(_) => Error::Cancelled,
            other => Error::H2(other),
        }
    }
}
