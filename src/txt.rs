//! DNS-SD TXT record encoding.
//!
//! On the wire, a TXT record is a sequence of length-prefixed entries: one length byte followed by
//! that many bytes of `key` or `key=value`. An entry without `=` is a boolean flag.

use std::fmt;

use crate::hex::Hex;

/// Maximum length of a single `key[=value]` entry.
pub const MAX_ENTRY_LEN: usize = 255;

/// Ordered list of `key[=value]` entries making up a DNS-SD TXT record.
///
/// Entries keep the order they were inserted or decoded in. Duplicate keys are kept as well, but
/// [`TxtRecord::get`] only ever returns the first one, as RFC 6763 requires.
///
/// Keys must be non-empty and must not contain `=`. Entries with such keys could not be decoded
/// back, so [`TxtRecord::insert`] and [`TxtRecord::add_flag`] skip them with a warning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxtRecord {
    entries: Vec<TxtEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TxtEntry {
    key: String,
    value: Option<Vec<u8>>,
}

impl TxtRecord {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends a `key=value` entry.
    pub fn insert(&mut self, key: impl Into<String>, value: impl AsRef<[u8]>) {
        self.push(key.into(), Some(value.as_ref().to_vec()));
    }

    /// Appends a TXT entry with no value.
    pub fn add_flag(&mut self, key: impl Into<String>) {
        self.push(key.into(), None);
    }

    fn push(&mut self, key: String, value: Option<Vec<u8>>) {
        if key.is_empty() || key.contains('=') {
            log::warn!("invalid TXT key '{}', skipping entry", key);
            return;
        }
        self.entries.push(TxtEntry { key, value });
    }

    /// Builds a record from textual `key=value` (or bare `key`) attributes, as reported by
    /// discovery providers.
    pub fn from_attributes<I, S>(attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut this = Self::new();
        for attr in attributes {
            if let Some(entry) = TxtEntry::parse(attr.as_ref().as_bytes()) {
                this.entries.push(entry);
            }
        }
        this
    }

    /// Decodes the length-prefixed wire format.
    ///
    /// Decoding never reads past the end of `buf`: an entry whose declared length exceeds the
    /// remaining bytes is treated as empty and ends decoding. Empty entries are skipped.
    pub fn decode(buf: &[u8]) -> Self {
        let mut this = Self::new();
        let mut rest = buf;
        while let Some((&len, tail)) = rest.split_first() {
            let len = usize::from(len);
            if len > tail.len() {
                log::debug!(
                    "TXT entry claims {} bytes but only {} remain, stopping",
                    len,
                    tail.len()
                );
                break;
            }
            let (entry, tail) = tail.split_at(len);
            rest = tail;

            if let Some(entry) = TxtEntry::parse(entry) {
                this.entries.push(entry);
            }
        }
        log::trace!("decoded TXT {}: {}", Hex(buf), this);
        this
    }

    /// Encodes the record in the length-prefixed wire format.
    ///
    /// Entries longer than [`MAX_ENTRY_LEN`] bytes are truncated.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for entry in &self.entries {
            let mut bytes = entry.to_bytes();
            if bytes.len() > MAX_ENTRY_LEN {
                log::warn!(
                    "TXT entry '{}' is {} bytes long, truncating to {}",
                    entry.key,
                    bytes.len(),
                    MAX_ENTRY_LEN
                );
                bytes.truncate(MAX_ENTRY_LEN);
            }
            buf.push(bytes.len() as u8);
            buf.extend_from_slice(&bytes);
        }
        buf
    }

    /// Returns the textual `key=value` attributes, lossily converting non-UTF-8 values.
    pub fn to_attributes(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| String::from_utf8_lossy(&entry.to_bytes()).into_owned())
            .collect()
    }

    /// Returns an iterator over all key-value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, TxtRecordValue<'_>)> {
        self.entries.iter().map(|entry| match &entry.value {
            Some(v) => (entry.key.as_str(), TxtRecordValue::Value(v)),
            None => (entry.key.as_str(), TxtRecordValue::NoValue),
        })
    }

    /// Looks up the first entry whose key matches `key`, ignoring ASCII case.
    pub fn get(&self, key: &str) -> Option<TxtRecordValue<'_>> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TxtEntry {
    fn parse(entry: &[u8]) -> Option<Self> {
        if entry.is_empty() {
            return None;
        }
        let mut split = entry.splitn(2, |&b| b == b'=');
        let key = split.next().unwrap_or_default();
        let key = match String::from_utf8(key.to_vec()) {
            Ok(key) => key,
            Err(e) => {
                log::debug!("non-UTF-8 TXT key: {}", e);
                String::from_utf8_lossy(key).into_owned()
            }
        };
        Some(Self {
            key,
            value: split.next().map(<[u8]>::to_vec),
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.key.as_bytes().to_vec();
        if let Some(value) = &self.value {
            bytes.push(b'=');
            bytes.extend_from_slice(value);
        }
        bytes
    }
}

impl<K: Into<String>, V: AsRef<[u8]>> FromIterator<(K, V)> for TxtRecord {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut this = Self::new();
        for (k, v) in iter {
            this.insert(k, v);
        }
        this
    }
}

impl fmt::Display for TxtRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }

            f.write_str(&entry.key)?;
            if let Some(v) = &entry.value {
                f.write_str("=")?;
                fmt::Display::fmt(&v.escape_ascii(), f)?;
            }
        }
        Ok(())
    }
}

#[derive(PartialEq, Eq)]
pub enum TxtRecordValue<'a> {
    NoValue,
    Value(&'a [u8]),
}

impl<'a> fmt::Debug for TxtRecordValue<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoValue => f.write_str("-"),
            Self::Value(v) => match std::str::from_utf8(v) {
                Ok(s) => fmt::Debug::fmt(s, f),
                Err(_) => fmt::Display::fmt(&v.escape_ascii(), f),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use expect_test::expect;

    use super::*;

    #[test]
    fn wire_format() {
        let mut txt = TxtRecord::new();
        txt.insert("MaxUsers", "20");
        txt.add_flag("public");
        assert_eq!(txt.encode(), b"\x0bMaxUsers=20\x06public");
    }

    #[test]
    fn roundtrip() {
        let mut txt = TxtRecord::new();
        txt.insert("txtvers", "1");
        txt.add_flag("flag");
        txt.insert("empty", "");
        txt.insert("bin", [0x00, 0xff, b'=']);
        txt.insert("txtvers", "2");
        txt.insert("long", vec![b'x'; MAX_ENTRY_LEN - "long=".len()]);

        let decoded = TxtRecord::decode(&txt.encode());
        assert_eq!(decoded, txt);
        assert_eq!(decoded.get("TXTVERS"), Some(TxtRecordValue::Value(b"1")));
        assert_eq!(decoded.get("flag"), Some(TxtRecordValue::NoValue));
        assert_eq!(decoded.get("missing"), None);
    }

    #[test]
    fn truncated_input() {
        // Second entry claims 9 bytes, only 3 are present.
        let txt = TxtRecord::decode(b"\x03a=b\x09c=d");
        assert_eq!(txt.len(), 1);
        assert_eq!(txt.get("a"), Some(TxtRecordValue::Value(b"b")));

        // Zero-length entries are skipped.
        let txt = TxtRecord::decode(b"\x00\x01k\x00");
        assert_eq!(txt.to_attributes(), ["k"]);

        assert!(TxtRecord::decode(b"").is_empty());
        assert!(TxtRecord::decode(b"\xff").is_empty());
    }

    #[test]
    fn long_entries_are_truncated() {
        let mut txt = TxtRecord::new();
        txt.insert("k", vec![b'v'; 300]);
        let encoded = txt.encode();
        assert_eq!(encoded.len(), 1 + MAX_ENTRY_LEN);
        assert_eq!(encoded[0], 255);
    }

    #[test]
    fn invalid_keys_are_skipped() {
        let mut txt = TxtRecord::new();
        txt.add_flag("");
        txt.insert("", "v");
        txt.insert("a=b", "c");
        txt.insert("ok", "1");
        assert_eq!(txt.to_attributes(), ["ok=1"]);
        assert_eq!(TxtRecord::decode(&txt.encode()), txt);
    }

    #[test]
    fn attributes() {
        let txt = TxtRecord::from_attributes(["MaxUsers=20", "flag", "", "eq=a=b"]);
        assert_eq!(txt.len(), 3);
        assert_eq!(txt.get("eq"), Some(TxtRecordValue::Value(b"a=b")));
        assert_eq!(txt.to_attributes(), ["MaxUsers=20", "flag", "eq=a=b"]);
        assert_eq!(txt.encode(), b"\x0bMaxUsers=20\x04flag\x06eq=a=b");
    }

    #[test]
    fn display() {
        let txt: TxtRecord = [("path", &b"/"[..]), ("bin", &b"\x01"[..])]
            .into_iter()
            .collect();
        expect![[r#"path=/ bin=\x01"#]].assert_eq(&txt.to_string());
        expect![[r#"Some("/")"#]].assert_eq(&format!("{:?}", txt.get("path")));
    }
}
