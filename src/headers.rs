//! Ordered, duplicate-tolerant header container.

use std::borrow::Cow;

use percent_encoding::percent_decode;

use crate::constants::HEADER_CONTENT_LENGTH;
use crate::error::{EslError, EslResult};

#[derive(Debug, Default, Clone)]
struct HeaderEntry {
    key: Vec<u8>,
    value: Vec<u8>,
}

/// Ordered list of `key: value` pairs.
///
/// Keys are not unique: [`add`](Self::add) always appends and lookups return
/// the first match in insertion order. [`reset`](Self::reset) truncates the
/// logical length but keeps every entry's byte buffers, so refilling the store
/// with similar headers does not allocate.
#[derive(Debug, Default, Clone)]
pub struct HeaderStore {
    entries: Vec<HeaderEntry>,
    len: usize,
    content_length: Option<usize>,
    buf: Vec<u8>,
}

impl HeaderStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header. Existing entries with the same key are kept.
    pub fn add(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        if self.len == self
            .entries
            .len()
        {
            self.entries
                .push(HeaderEntry::default());
        }
        let entry = &mut self.entries[self.len];
        entry
            .key
            .clear();
        entry
            .key
            .extend_from_slice(key.as_ref());
        entry
            .value
            .clear();
        entry
            .value
            .extend_from_slice(value.as_ref());
        self.len += 1;
    }

    /// Raw value of the first entry named `key`.
    pub fn get_bytes(&self, key: impl AsRef<[u8]>) -> Option<&[u8]> {
        let key = key.as_ref();
        self.live()
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.value.as_slice())
    }

    /// Value of the first entry named `key`, if it is valid UTF-8.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_bytes(key)
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    /// Percent-decoded value of the first entry named `key`.
    ///
    /// Event payload values are URL-encoded by the switch; the raw accessors
    /// return them untouched. Invalid UTF-8 after decoding is replaced lossily.
    pub fn get_decoded(&self, key: &str) -> Option<Cow<'_, str>> {
        self.get_bytes(key)
            .map(|value| percent_decode(value).decode_utf8_lossy())
    }

    /// Parse the first entry named `key` as a decimal integer.
    ///
    /// An absent header yields `Ok(0)`: most headers are optional.
    pub fn get_int(&self, key: &str) -> EslResult<i64> {
        let Some(value) = self.get_bytes(key) else {
            return Ok(0);
        };
        std::str::from_utf8(value)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| EslError::InvalidHeader {
                header: format!("{}: {}", key, String::from_utf8_lossy(value)),
            })
    }

    /// Declared body length, cached until [`reset`](Self::reset).
    ///
    /// Uses the last `Content-Length` entry present at the time of the first
    /// call. A value that does not parse as a non-negative integer is cached
    /// as zero and reported once as an error.
    pub fn content_length(&mut self) -> EslResult<usize> {
        if let Some(length) = self.content_length {
            return Ok(length);
        }
        let value = self
            .live()
            .iter()
            .rev()
            .find(|entry| entry.key == HEADER_CONTENT_LENGTH.as_bytes())
            .map(|entry| entry.value.as_slice());
        let parsed = match value {
            None => Ok(0),
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(|| EslError::InvalidHeader {
                    header: format!(
                        "{}: {}",
                        HEADER_CONTENT_LENGTH,
                        String::from_utf8_lossy(raw)
                    ),
                }),
        };
        self.content_length = Some(*parsed
            .as_ref()
            .unwrap_or(&0));
        parsed
    }

    /// Serialize as `key: value\n` per entry followed by a blank line,
    /// appending to `dst`.
    pub fn append_bytes(&self, dst: &mut Vec<u8>) {
        for entry in self.live() {
            dst.extend_from_slice(&entry.key);
            dst.extend_from_slice(b": ");
            dst.extend_from_slice(&entry.value);
            dst.push(b'\n');
        }
        dst.push(b'\n');
    }

    /// Serialize into the store's own reusable buffer.
    pub fn header_bytes(&mut self) -> &[u8] {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        self.append_bytes(&mut buf);
        self.buf = buf;
        &self.buf
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.live()
            .iter()
            .map(|entry| (entry.key.as_slice(), entry.value.as_slice()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` when no header has been added since the last reset.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drop all entries (keeping their storage) and forget the cached length.
    pub fn reset(&mut self) {
        self.len = 0;
        self.content_length = None;
    }

    fn live(&self) -> &[HeaderEntry] {
        &self.entries[..self.len]
    }
}

impl PartialEq for HeaderStore {
    fn eq(&self, other: &Self) -> bool {
        self.iter()
            .eq(other.iter())
    }
}

impl Eq for HeaderStore {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_bytes_preserves_order() {
        let mut headers = HeaderStore::new();
        headers.add("call-command", "execute");
        headers.add("execute-app-name", "playback");
        headers.add("execute-app-arg", "foo.wav");

        assert_eq!(
            headers.header_bytes(),
            b"call-command: execute\nexecute-app-name: playback\nexecute-app-arg: foo.wav\n\n"
        );
    }

    #[test]
    fn test_empty_store_serializes_blank_line() {
        let mut headers = HeaderStore::new();
        assert_eq!(headers.header_bytes(), b"\n");
    }

    #[test]
    fn test_get_returns_first_match() {
        let mut headers = HeaderStore::new();
        headers.add("Variable", "first");
        headers.add("Variable", "second");

        assert_eq!(headers.get("Variable"), Some("first"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_absent_header_is_not_an_error() {
        let headers = HeaderStore::new();
        assert_eq!(
            headers
                .get_int("Event-Sequence")
                .unwrap(),
            0
        );
        assert_eq!(headers.get("Event-Sequence"), None);
        assert_eq!(headers.get_bytes("Event-Sequence"), None);
    }

    #[test]
    fn test_get_int() {
        let mut headers = HeaderStore::new();
        headers.add("Log-Level", "7");
        headers.add("Bogus", "seven");

        assert_eq!(
            headers
                .get_int("Log-Level")
                .unwrap(),
            7
        );
        let err = headers
            .get_int("Bogus")
            .unwrap_err();
        assert!(matches!(err, EslError::InvalidHeader { ref header } if header == "Bogus: seven"));
    }

    #[test]
    fn test_get_decoded() {
        let mut headers = HeaderStore::new();
        headers.add("Up-Time", "0%20years%2C%200%20days");
        headers.add("FreeSWITCH-IPv6", "%3A%3A1");

        assert_eq!(headers.get("FreeSWITCH-IPv6"), Some("%3A%3A1"));
        assert_eq!(
            headers
                .get_decoded("FreeSWITCH-IPv6")
                .as_deref(),
            Some("::1")
        );
        assert_eq!(
            headers
                .get_decoded("Up-Time")
                .as_deref(),
            Some("0 years, 0 days")
        );
    }

    #[test]
    fn test_content_length_uses_last_entry_and_caches() {
        let mut headers = HeaderStore::new();
        headers.add("Content-Length", "10");
        headers.add("Content-Length", "42");
        assert_eq!(
            headers
                .content_length()
                .unwrap(),
            42
        );

        // cached until reset
        headers.add("Content-Length", "99");
        assert_eq!(
            headers
                .content_length()
                .unwrap(),
            42
        );

        headers.reset();
        headers.add("Content-Length", "5");
        assert_eq!(
            headers
                .content_length()
                .unwrap(),
            5
        );
    }

    #[test]
    fn test_content_length_absent_is_zero() {
        let mut headers = HeaderStore::new();
        headers.add("Content-Type", "command/reply");
        assert_eq!(
            headers
                .content_length()
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_content_length_invalid_cached_as_zero() {
        let mut headers = HeaderStore::new();
        headers.add("Content-Length", "abc");
        assert!(headers
            .content_length()
            .is_err());
        assert_eq!(
            headers
                .content_length()
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let mut headers = HeaderStore::new();
        for i in 0..16 {
            headers.add(format!("X-Header-{i}"), "a fairly long header value");
        }
        let capacity = headers
            .entries
            .capacity();
        headers.reset();

        assert!(headers.is_empty());
        assert_eq!(headers.get("X-Header-0"), None);
        assert_eq!(
            headers
                .entries
                .capacity(),
            capacity
        );

        headers.add("X-Header-0", "short");
        assert_eq!(headers.get("X-Header-0"), Some("short"));
        assert!(
            headers.entries[0]
                .value
                .capacity()
                >= "a fairly long header value".len()
        );
    }

    #[test]
    fn test_iter_and_eq() {
        let mut a = HeaderStore::new();
        a.add("Event-Name", "CUSTOM");
        a.add("Call-ID", "abc");

        let mut b = HeaderStore::new();
        b.add("Stale", "entry");
        b.reset();
        b.add("Event-Name", "CUSTOM");
        b.add("Call-ID", "abc");

        assert_eq!(a, b);
        let keys: Vec<&[u8]> = a
            .iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![&b"Event-Name"[..], &b"Call-ID"[..]]);
    }
}
