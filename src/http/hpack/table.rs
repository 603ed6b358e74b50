//! Static and dynamic header tables (RFC 7541 Section 2.3)

use super::HeaderField;
use bytes::Bytes;
use std::collections::VecDeque;

/// Per-entry overhead added to name and value lengths
pub const ENTRY_OVERHEAD: usize = 32;

/// The 61-entry static table; index 1 is the first entry
pub static STATIC_TABLE: [(&[u8], &[u8]); 61] = [
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

/// Result of looking a field up in the combined index space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableMatch {
    /// Name and value both match the entry at this index
    Full(usize),
    /// Only the name matches the entry at this index
    Name(usize),
    None,
}

/// Find `name`/`value` in the static table
pub fn find_static(name: &[u8], value: &[u8]) -> TableMatch {
    let mut found = TableMatch::None;
    for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
        if *n != name {
            continue;
        }
        if *v == value {
            return TableMatch::Full(i + 1);
        }
        if found == TableMatch::None {
            found = TableMatch::Name(i + 1);
        }
    }
    found
}

/// FIFO header table bounded by a byte budget
///
/// The newest entry has dynamic index 1 (combined index 62). Entries are
/// only evicted when an insertion or a budget change needs the room.
#[derive(Debug, Clone)]
pub struct DynamicTable {
    entries: VecDeque<HeaderField>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub fn new(max_size: usize) -> Self {
        DynamicTable {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    /// Current size in bytes, counting [`ENTRY_OVERHEAD`] per entry
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Change the budget, evicting oldest entries until it holds
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict_to(max_size);
    }

    /// Add an entry at the front
    ///
    /// An entry larger than the whole budget empties the table and is not
    /// stored.
    pub fn insert(&mut self, name: Bytes, value: Bytes) {
        let entry_size = name.len() + value.len() + ENTRY_OVERHEAD;
        if entry_size > self.max_size {
            self.entries.clear();
            self.size = 0;
            return;
        }

        self.evict_to(self.max_size - entry_size);
        self.size += entry_size;
        self.entries.push_front(HeaderField::new(name, value));
    }

    /// Entry by dynamic index, 1 being the most recent insertion
    pub fn get(&self, index: usize) -> Option<&HeaderField> {
        index.checked_sub(1).and_then(|i| self.entries.get(i))
    }

    /// Look up an entry by name and value, returning dynamic indices
    pub fn find(&self, name: &[u8], value: &[u8]) -> TableMatch {
        let mut found = TableMatch::None;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.name != name {
                continue;
            }
            if entry.value == value {
                return TableMatch::Full(i + 1);
            }
            if found == TableMatch::None {
                found = TableMatch::Name(i + 1);
            }
        }
        found
    }

    /// Iterate from newest to oldest
    pub fn iter(&self) -> impl Iterator<Item = &HeaderField> {
        self.entries.iter()
    }

    fn evict_to(&mut self, budget: usize) {
        while self.size > budget {
            match self.entries.pop_back() {
                Some(evicted) => self.size -= evicted.size(),
                None => break,
            }
        }
    }
}

/// Resolve a combined (static then dynamic) index
pub fn lookup(dynamic: &DynamicTable, index: usize) -> Option<HeaderField> {
    match index {
        0 => None,
        i if i <= STATIC_TABLE.len() => {
            let (name, value) = STATIC_TABLE[i - 1];
            Some(HeaderField::new(Bytes::from_static(name), Bytes::from_static(value)))
        }
        i => dynamic.get(i - STATIC_TABLE.len()).cloned(),
    }
}
