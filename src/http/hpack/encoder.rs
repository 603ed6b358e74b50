//! HPACK encoder

use super::table::{find_static, DynamicTable, TableMatch, STATIC_TABLE};
use super::{encode_integer, encode_string, HeaderField, DEFAULT_TABLE_SIZE};
use bytes::BytesMut;

/// Names whose values are never added to a compression table
const NEVER_INDEXED: &[&[u8]] = &[
    b"authorization",
    b"cookie",
    b"proxy-authorization",
    b"set-cookie",
];

/// Names whose values change on nearly every message
const NOT_INDEXED: &[&[u8]] = &[
    b"age",
    b"content-length",
    b"date",
    b"etag",
    b"if-modified-since",
    b"if-none-match",
    b"last-modified",
];

/// How a single literal field ends up on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Representation {
    LiteralWithIndexing,
    LiteralWithoutIndexing,
    LiteralNeverIndexed,
}

/// Stateful HPACK encoder
#[derive(Debug)]
pub struct Encoder {
    table: DynamicTable,
    /// Smallest and latest table sizes requested since the last block
    pending_size_update: Option<(usize, usize)>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Encoder {
            table: DynamicTable::new(DEFAULT_TABLE_SIZE),
            pending_size_update: None,
        }
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE, capped at
    /// [`DEFAULT_TABLE_SIZE`]
    ///
    /// The change is announced at the start of the next encoded block. If
    /// several changes happen between two blocks, the smallest one is
    /// announced first so the peer evicts the same entries we did.
    pub fn set_max_table_size(&mut self, size: usize) {
        let size = size.min(DEFAULT_TABLE_SIZE);
        self.pending_size_update = match self.pending_size_update {
            Some((min, _)) => Some((min.min(size), size)),
            None if size != self.table.max_size() => Some((size, size)),
            None => None,
        };
    }

    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    /// Encode a header list into `dst` as one header block
    pub fn encode<'a, I>(&mut self, fields: I, dst: &mut BytesMut)
    where
        I: IntoIterator<Item = &'a HeaderField>,
    {
        if let Some((min, last)) = self.pending_size_update.take() {
            if min < last {
                self.table.set_max_size(min);
                encode_integer(dst, min, 5, 0x20);
            }
            self.table.set_max_size(last);
            encode_integer(dst, last, 5, 0x20);
        }

        for field in fields {
            self.encode_field(field, dst);
        }
    }

    fn encode_field(&mut self, field: &HeaderField, dst: &mut BytesMut) {
        let static_match = find_static(&field.name, &field.value);
        if let TableMatch::Full(index) = static_match {
            encode_integer(dst, index, 7, 0x80);
            return;
        }

        let dynamic_match = self.table.find(&field.name, &field.value);
        if let TableMatch::Full(index) = dynamic_match {
            encode_integer(dst, STATIC_TABLE.len() + index, 7, 0x80);
            return;
        }

        let name_index = match (static_match, dynamic_match) {
            (TableMatch::Name(index), _) => index,
            (_, TableMatch::Name(index)) => STATIC_TABLE.len() + index,
            _ => 0,
        };

        let representation = self.choose_literal(field);
        let (prefix_bits, flags) = match representation {
            Representation::LiteralWithIndexing => (6, 0x40),
            Representation::LiteralNeverIndexed => (4, 0x10),
            _ => (4, 0x00),
        };

        encode_integer(dst, name_index, prefix_bits, flags);
        if name_index == 0 {
            encode_string(dst, &field.name);
        }
        encode_string(dst, &field.value);

        if representation == Representation::LiteralWithIndexing {
            self.table.insert(field.name.clone(), field.value.clone());
        }
    }

    fn choose_literal(&self, field: &HeaderField) -> Representation {
        let name: &[u8] = &field.name;
        if field.sensitive || NEVER_INDEXED.contains(&name) {
            Representation::LiteralNeverIndexed
        } else if NOT_INDEXED.contains(&name) || field.size() > self.table.max_size() / 2 {
            Representation::LiteralWithoutIndexing
        } else {
            Representation::LiteralWithIndexing
        }
    }
}
