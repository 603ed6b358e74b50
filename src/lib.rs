//! httptransport - blocking HTTP/1.1 and HTTP/2 transport
//!
//! This crate provides a protocol-agnostic blocking HTTP client transport
//! with a standalone HPACK codec, an HTTP/2 framing layer and connection
//! manager, and an HTTP/1.1 fallback path.

pub mod http;
