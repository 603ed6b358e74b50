//! HTTP headers handling
//!
//! An ordered multi-map with case-insensitive lookups. Both protocol
//! versions share it: HTTP/1.1 writes names as given, HTTP/2 lowercases them
//! on the way into HPACK.

use super::{Error, Result};
use std::fmt;

/// Headers that only make sense on a single HTTP/1.1 hop
///
/// They must not appear in an HTTP/2 message (RFC 9113 Section 8.2.2).
pub const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// HTTP headers collection
///
/// Headers are stored in insertion order; duplicates are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    headers: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers {
            headers: Vec::new(),
        }
    }

    /// Append a header, keeping any existing values of the same name
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Replace every value of `name` with a single one
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.headers.push((name, value.into()));
    }

    /// Get the first value for a header (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Get all values for a header (case-insensitive)
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Whether any comma-separated element of `name` equals `token`
    ///
    /// Used for list headers such as `Connection: keep-alive, close`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .iter()
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Remove all instances of a header, returning how many were removed
    pub fn remove(&mut self, name: &str) -> usize {
        let initial_len = self.headers.len();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        initial_len - self.headers.len()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn clear(&mut self) {
        self.headers.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Check every name is a token and no value can break the framing
    pub fn validate(&self) -> Result<()> {
        for (name, value) in &self.headers {
            validate_name(name)?;
            if value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
                return Err(Error::InvalidHeader(format!(
                    "value of {} contains CR, LF or NUL",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Parse a header line into name and value
    pub fn parse_header_line(line: &str) -> Result<(String, String)> {
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::InvalidHeader(format!("No colon in header: {}", line)));
        };
        // whitespace before the colon is forbidden (RFC 9112 Section 5.1)
        if name.ends_with(|c: char| c == ' ' || c == '\t') {
            return Err(Error::InvalidHeader(format!("Whitespace before colon: {}", line)));
        }
        validate_name(name)?;
        Ok((name.to_string(), value.trim().to_string()))
    }
}

/// RFC 9110 token characters
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidHeader("Empty header name".to_string()));
    }
    if !name.bytes().all(is_tchar) {
        return Err(Error::InvalidHeader(format!("Invalid header name: {:?}", name)));
    }
    Ok(())
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.headers {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Headers {
            headers: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/html");

        assert_eq!(headers.get("content-type"), Some("text/html"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/html"));
        assert_eq!(headers.get("Missing"), None);
    }

    #[test]
    fn test_duplicates_keep_order() {
        let mut headers = Headers::new();
        headers.insert("Set-Cookie", "a=1");
        headers.insert("X-Other", "x");
        headers.insert("set-cookie", "b=2");

        assert_eq!(headers.get_all("Set-Cookie"), vec!["a=1", "b=2"]);
        assert_eq!(headers.get("Set-Cookie"), Some("a=1"));

        let names: Vec<_> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Set-Cookie", "X-Other", "set-cookie"]);
    }

    #[test]
    fn test_set_replaces_all_values() {
        let mut headers = Headers::new();
        headers.insert("Accept", "a");
        headers.insert("accept", "b");
        headers.set("Accept", "c");
        assert_eq!(headers.get_all("accept"), vec!["c"]);
    }

    #[test]
    fn test_remove() {
        let mut headers = Headers::new();
        headers.insert("X-Remove", "value1");
        headers.insert("X-Keep", "value2");
        headers.insert("X-Remove", "value3");

        assert_eq!(headers.remove("x-remove"), 2);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("X-Keep"), Some("value2"));
    }

    #[test]
    fn test_has_token() {
        let mut headers = Headers::new();
        headers.insert("Connection", "keep-alive, Close");
        assert!(headers.has_token("connection", "close"));
        assert!(!headers.has_token("connection", "upgrade"));
    }

    #[test]
    fn test_parse_header_line() {
        let (name, value) = Headers::parse_header_line("Content-Type: text/html").unwrap();
        assert_eq!(name, "Content-Type");
        assert_eq!(value, "text/html");

        let (name, value) = Headers::parse_header_line("X-Custom:  value  ").unwrap();
        assert_eq!(name, "X-Custom");
        assert_eq!(value, "value");

        let (_, value) = Headers::parse_header_line("X-Empty:").unwrap();
        assert_eq!(value, "");

        assert!(Headers::parse_header_line("Invalid").is_err());
        assert!(Headers::parse_header_line(": value").is_err());
        assert!(Headers::parse_header_line("Bad Name: value").is_err());
        assert!(Headers::parse_header_line("X-Space : value").is_err());
    }

    #[test]
    fn test_validate_rejects_injection() {
        let mut headers = Headers::new();
        headers.insert("X-Ok", "fine");
        assert!(headers.validate().is_ok());

        headers.insert("X-Evil", "a\r\nInjected: yes");
        assert!(matches!(headers.validate(), Err(Error::InvalidHeader(_))));
    }
}
