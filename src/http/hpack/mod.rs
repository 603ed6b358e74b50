//! HPACK header compression (RFC 7541)
//!
//! A standalone, stateful header codec. An [`Encoder`] and a [`Decoder`]
//! each own a [`DynamicTable`]; as long as both sides process the same
//! sequence of header blocks, the two tables stay identical in content and
//! order.
//!
//! # Examples
//!
//! ```
//! use httptransport::http::hpack::{Decoder, Encoder, HeaderField};
//!
//! let fields = vec![
//!     HeaderField::new(":status", "200"),
//!     HeaderField::new("content-type", "application/json"),
//! ];
//!
//! let mut encoder = Encoder::new();
//! let mut decoder = Decoder::new();
//!
//! let mut block = bytes::BytesMut::new();
//! encoder.encode(&fields, &mut block);
//! assert_eq!(decoder.decode(&block).unwrap(), fields);
//! ```

pub mod decoder;
pub mod encoder;
pub mod huffman;
pub mod table;

pub use decoder::Decoder;
pub use encoder::Encoder;
pub use table::{DynamicTable, ENTRY_OVERHEAD, STATIC_TABLE};

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Default dynamic table budget, and the initial SETTINGS_HEADER_TABLE_SIZE
pub const DEFAULT_TABLE_SIZE: usize = 4096;

/// Result type for HPACK operations
pub type Result<T> = std::result::Result<T, HpackError>;

/// HPACK decoding errors
///
/// Every variant except [`HpackError::HeaderListTooLarge`] leaves the
/// dynamic table in an unknown state and is fatal for the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HpackError {
    #[error("index {0} is not in the header table")]
    InvalidIndex(usize),

    #[error("integer truncated")]
    IntegerTruncated,

    #[error("integer overflow")]
    IntegerOverflow,

    #[error("string literal truncated")]
    StringTruncated,

    #[error("invalid huffman code")]
    InvalidHuffmanCode,

    #[error("huffman padding is longer than 7 bits or not EOS-prefixed")]
    InvalidHuffmanPadding,

    #[error("huffman-encoded EOS symbol")]
    HuffmanEos,

    #[error("dynamic table size update after the first header field")]
    LateSizeUpdate,

    #[error("dynamic table size update {requested} exceeds the allowed maximum {max}")]
    SizeUpdateTooLarge { requested: usize, max: usize },

    #[error("header list size exceeds {0} bytes")]
    HeaderListTooLarge(usize),
}

/// A header name/value pair
///
/// Names and values are raw byte sequences. `sensitive` marks a field that
/// must be encoded as never-indexed, and is set on decoded fields that
/// arrived in never-indexed form. Equality ignores the marker.
#[derive(Clone, Eq)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
    pub sensitive: bool,
}

impl HeaderField {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        HeaderField {
            name: name.into(),
            value: value.into(),
            sensitive: false,
        }
    }

    /// Create a field that is never added to any compression table
    pub fn sensitive(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        HeaderField {
            name: name.into(),
            value: value.into(),
            sensitive: true,
        }
    }

    /// Size counted against table budgets and SETTINGS_MAX_HEADER_LIST_SIZE
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }

    pub fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }

    pub fn name_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.name).ok()
    }

    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

impl PartialEq for HeaderField {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value
    }
}

impl fmt::Debug for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = String::from_utf8_lossy(&self.name);
        if self.sensitive {
            write!(f, "{}: <sensitive>", name)
        } else {
            write!(f, "{}: {}", name, String::from_utf8_lossy(&self.value))
        }
    }
}

impl<N: Into<Bytes>, V: Into<Bytes>> From<(N, V)> for HeaderField {
    fn from((name, value): (N, V)) -> Self {
        HeaderField::new(name, value)
    }
}

/// Encode `value` with an N-bit prefix (RFC 7541 Section 5.1)
///
/// `flags` carries the representation bits above the prefix.
pub fn encode_integer(dst: &mut BytesMut, value: usize, prefix_bits: u8, flags: u8) {
    debug_assert!((1..=8).contains(&prefix_bits));
    let max_prefix = (1usize << prefix_bits) - 1;

    if value < max_prefix {
        dst.put_u8(flags | value as u8);
        return;
    }

    dst.put_u8(flags | max_prefix as u8);
    let mut rest = value - max_prefix;
    while rest >= 0x80 {
        dst.put_u8((rest as u8 & 0x7f) | 0x80);
        rest >>= 7;
    }
    dst.put_u8(rest as u8);
}

/// Decode an N-bit prefix integer starting at `buf[*pos]`, advancing `pos`
pub fn decode_integer(buf: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<usize> {
    let max_prefix = (1usize << prefix_bits) - 1;
    let first = *buf.get(*pos).ok_or(HpackError::IntegerTruncated)? as usize & max_prefix;
    *pos += 1;

    if first < max_prefix {
        return Ok(first);
    }

    let mut value = max_prefix;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos).ok_or(HpackError::IntegerTruncated)?;
        *pos += 1;

        // Anything past 4 continuation bytes cannot fit the 32-bit values HPACK carries
        if shift > 28 {
            return Err(HpackError::IntegerOverflow);
        }
        value = ((byte & 0x7f) as usize)
            .checked_shl(shift)
            .and_then(|inc| value.checked_add(inc))
            .filter(|v| *v <= u32::MAX as usize)
            .ok_or(HpackError::IntegerOverflow)?;
        shift += 7;

        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

/// Encode a string literal, Huffman-coded only when that is strictly shorter
pub fn encode_string(dst: &mut BytesMut, value: &[u8]) {
    let huffman_len = huffman::encoded_len(value);
    if huffman_len < value.len() {
        encode_integer(dst, huffman_len, 7, 0x80);
        huffman::encode(value, dst);
    } else {
        encode_integer(dst, value.len(), 7, 0x00);
        dst.extend_from_slice(value);
    }
}

/// Decode a string literal starting at `buf[*pos]`, advancing `pos`
pub fn decode_string(buf: &[u8], pos: &mut usize) -> Result<Bytes> {
    let huffman_coded = *buf.get(*pos).ok_or(HpackError::StringTruncated)? & 0x80 != 0;
    let len = decode_integer(buf, pos, 7)?;
    let end = pos.checked_add(len).ok_or(HpackError::StringTruncated)?;
    let raw = buf.get(*pos..end).ok_or(HpackError::StringTruncated)?;
    *pos = end;

    if huffman_coded {
        huffman::decode(raw).map(Bytes::from)
    } else {
        Ok(Bytes::copy_from_slice(raw))
    }
}
