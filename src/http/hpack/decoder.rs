//! HPACK decoder

use super::table::{lookup, DynamicTable};
use super::{decode_integer, decode_string, HeaderField, HpackError, Result, DEFAULT_TABLE_SIZE};

/// Stateful HPACK decoder
#[derive(Debug)]
pub struct Decoder {
    table: DynamicTable,
    /// Largest size a table size update may request (our SETTINGS_HEADER_TABLE_SIZE)
    max_allowed_table_size: usize,
    max_header_list_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            table: DynamicTable::new(DEFAULT_TABLE_SIZE),
            max_allowed_table_size: DEFAULT_TABLE_SIZE,
            max_header_list_size: usize::MAX,
        }
    }

    /// Set the limit that table size updates are checked against
    pub fn set_max_allowed_table_size(&mut self, size: usize) {
        self.max_allowed_table_size = size;
        if self.table.max_size() > size {
            self.table.set_max_size(size);
        }
    }

    pub fn set_max_header_list_size(&mut self, size: usize) {
        self.max_header_list_size = size;
    }

    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    /// Decode one complete header block
    ///
    /// A header list over the configured limit is reported as
    /// [`HpackError::HeaderListTooLarge`] only after the whole block has been
    /// processed, so the table still matches the peer's encoder.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>> {
        let mut fields = Vec::new();
        let mut pos = 0;
        let mut list_size = 0usize;
        let mut seen_field = false;

        while pos < block.len() {
            let first = block[pos];

            let field = if first & 0x80 != 0 {
                let index = decode_integer(block, &mut pos, 7)?;
                lookup(&self.table, index).ok_or(HpackError::InvalidIndex(index))?
            } else if first & 0x40 != 0 {
                let field = self.decode_literal(block, &mut pos, 6)?;
                self.table.insert(field.name.clone(), field.value.clone());
                field
            } else if first & 0x20 != 0 {
                if seen_field {
                    return Err(HpackError::LateSizeUpdate);
                }
                let size = decode_integer(block, &mut pos, 5)?;
                if size > self.max_allowed_table_size {
                    return Err(HpackError::SizeUpdateTooLarge {
                        requested: size,
                        max: self.max_allowed_table_size,
                    });
                }
                self.table.set_max_size(size);
                continue;
            } else {
                let never_indexed = first & 0x10 != 0;
                let mut field = self.decode_literal(block, &mut pos, 4)?;
                field.sensitive = never_indexed;
                field
            };

            seen_field = true;
            list_size = list_size.saturating_add(field.size());
            if list_size <= self.max_header_list_size {
                fields.push(field);
            }
        }

        if list_size > self.max_header_list_size {
            return Err(HpackError::HeaderListTooLarge(self.max_header_list_size));
        }
        Ok(fields)
    }

    fn decode_literal(&self, block: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<HeaderField> {
        let name_index = decode_integer(block, pos, prefix_bits)?;
        let name = if name_index == 0 {
            decode_string(block, pos)?
        } else {
            lookup(&self.table, name_index)
                .ok_or(HpackError::InvalidIndex(name_index))?
                .name
        };
        let value = decode_string(block, pos)?;
        Ok(HeaderField::new(name, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexed_static() {
        let mut decoder = Decoder::new();
        let fields = decoder.decode(&[0x82, 0x86, 0x84]).unwrap();
        assert_eq!(
            fields,
            vec![
                HeaderField::new(":method", "GET"),
                HeaderField::new(":scheme", "http"),
                HeaderField::new(":path", "/"),
            ]
        );
    }

    #[test]
    fn test_index_zero_rejected() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.decode(&[0x80]), Err(HpackError::InvalidIndex(0)));
    }

    #[test]
    fn test_dynamic_index_out_of_range() {
        let mut decoder = Decoder::new();
        // 62 is the first dynamic slot, but the table is empty
        assert_eq!(decoder.decode(&[0xbe]), Err(HpackError::InvalidIndex(62)));
    }

    #[test]
    fn test_never_indexed_marks_sensitive() {
        let mut decoder = Decoder::new();
        // RFC 7541 C.2.3
        let block = [
            0x10, 0x08, 0x70, 0x61, 0x73, 0x73, 0x77, 0x6f, 0x72, 0x64, 0x06, 0x73, 0x65, 0x63,
            0x72, 0x65, 0x74,
        ];
        let fields = decoder.decode(&block).unwrap();
        assert_eq!(fields, vec![HeaderField::new("password", "secret")]);
        assert!(fields[0].sensitive);
        assert!(decoder.table().is_empty());
    }

    #[test]
    fn test_size_update_must_come_first() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.decode(&[0x82, 0x20]), Err(HpackError::LateSizeUpdate));

        let mut decoder = Decoder::new();
        assert!(decoder.decode(&[0x20, 0x3f, 0xe1, 0x0f, 0x82]).is_ok());
        assert_eq!(decoder.table().max_size(), 2048);
    }

    #[test]
    fn test_size_update_above_limit() {
        let mut decoder = Decoder::new();
        decoder.set_max_allowed_table_size(1024);
        assert_eq!(
            decoder.decode(&[0x3f, 0xe1, 0x0f]),
            Err(HpackError::SizeUpdateTooLarge {
                requested: 2048,
                max: 1024
            })
        );
    }

    #[test]
    fn test_header_list_limit_keeps_table_in_sync() {
        let mut decoder = Decoder::new();
        decoder.set_max_header_list_size(40);
        // literal with indexing: custom-key: custom-header (RFC 7541 C.2.1)
        let mut block = vec![0x40, 0x0a];
        block.extend_from_slice(b"custom-key");
        block.push(0x0d);
        block.extend_from_slice(b"custom-header");

        assert_eq!(decoder.decode(&block), Err(HpackError::HeaderListTooLarge(40)));
        assert_eq!(decoder.table().len(), 1);
        assert_eq!(decoder.table().size(), 55);
    }
}
