//! Session metadata multimap
//!
//! Peers attach arbitrary string-keyed metadata to their session, carried
//! as a URL query string in the `X-Metadata` upgrade header. The key
//! `silenceMode` suppresses outbound discovery introductions.

use url::form_urlencoded;

use crate::error::{ProtoError, ProtoResult};

/// Metadata key recognised by the peermap: suppresses NEW_PEER broadcast.
pub const SILENCE_MODE: &str = "silenceMode";

/// An ordered string-keyed multimap, URL-query encoded on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata(Vec<(String, String)>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the URL-query form. Truncated or non-hex percent escapes are
    /// rejected rather than decoded lossily.
    pub fn parse(query: &str) -> ProtoResult<Self> {
        let bytes = query.as_bytes();
        let mut i = 0;
        while let Some(pos) = bytes[i..].iter().position(|&b| b == b'%') {
            let at = i + pos;
            if bytes.len() < at + 3
                || !bytes[at + 1].is_ascii_hexdigit()
                || !bytes[at + 2].is_ascii_hexdigit()
            {
                return Err(ProtoError::InvalidMetadata(format!(
                    "bad percent escape at byte {}",
                    at
                )));
            }
            i = at + 1;
        }
        let pairs = form_urlencoded::parse(bytes)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Ok(Self(pairs))
    }

    pub fn encode(&self) -> String {
        let mut ser = form_urlencoded::Serializer::new(String::new());
        for (k, v) in &self.0 {
            ser.append_pair(k, v);
        }
        ser.finish()
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn silence_mode(&self) -> bool {
        self.has(SILENCE_MODE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut meta = Metadata::new();
        meta.add("silenceMode", "1");
        meta.add("label", "office lan");
        let encoded = meta.encode();
        let parsed = Metadata::parse(&encoded).unwrap();
        assert!(parsed.silence_mode());
        assert_eq!(parsed.get("label"), Some("office lan"));
    }

    #[test]
    fn test_multimap_keeps_duplicates() {
        let parsed = Metadata::parse("tag=a&tag=b").unwrap();
        assert_eq!(parsed.get("tag"), Some("a"));
        assert_eq!(parsed.encode(), "tag=a&tag=b");
    }

    #[test]
    fn test_empty() {
        let parsed = Metadata::parse("").unwrap();
        assert!(parsed.is_empty());
        assert!(!parsed.silence_mode());
    }

    #[test]
    fn test_bad_escape_rejected() {
        assert!(Metadata::parse("a=%zz").is_err());
        assert!(Metadata::parse("a=%2").is_err());
        assert!(Metadata::parse("a=%20b").is_ok());
    }
}
