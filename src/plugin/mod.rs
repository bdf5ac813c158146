//! Log processor plugins.
//!
//! A plugin turns the bytes of one raw log object into records. The engine
//! only sees the [`LogProcessor`] trait; concrete grammars live in the
//! submodules and are looked up by `class_path` through the registry.

pub mod access;
pub mod registry;
pub mod stats;

use crate::source::window::RawLogObject;
use async_compression::tokio::bufread::GzipDecoder;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::IpAddr;
use thiserror::Error;
use tokio::io::AsyncReadExt;

pub use registry::PluginRegistry;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("no parsable records ({malformed} malformed lines)")]
    NoRecords { malformed: usize },

    #[error("object is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("bad compressed data: {0}")]
    Compression(std::io::Error),
}

/// One fact extracted from a raw object.
///
/// The hourly window is not part of the record: every record inherits the
/// timestamp of the object it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    pub account: String,
    pub container: Option<String>,
    /// Requesting client, for records that are traffic.
    pub client_ip: Option<IpAddr>,
    /// Load balancer the request passed through, if any.
    pub lb_ip: Option<IpAddr>,
    pub measures: BTreeMap<String, u64>,
}

impl ParsedRecord {
    pub fn new(account: impl Into<String>, container: Option<String>) -> Self {
        Self {
            account: account.into(),
            container,
            client_ip: None,
            lb_ip: None,
            measures: BTreeMap::new(),
        }
    }

    /// Add to a measure. Sums saturate at `u64::MAX`.
    pub fn with_measure(mut self, key: impl Into<String>, value: u64) -> Self {
        let total = self.measures.entry(key.into()).or_insert(0);
        *total = total.saturating_add(value);
        self
    }
}

/// Capability shared by every plugin: parse one object's bytes.
///
/// Implementations must be pure with respect to their input so that the same
/// object always yields the same records.
pub trait LogProcessor: Send + Sync {
    fn parse(&self, object: &RawLogObject, data: &[u8]) -> Result<Vec<ParsedRecord>, ParseError>;
}

/// Decompress an object's bytes if it is gzipped, by name or by magic bytes.
pub async fn decode_object(name: &str, data: Bytes) -> Result<Bytes, ParseError> {
    if !name.ends_with(".gz") && !data.starts_with(&GZIP_MAGIC) {
        return Ok(data);
    }

    let mut decoder = GzipDecoder::new(&data[..]);
    // Log shippers append gzip members rather than rewriting the file
    decoder.multiple_members(true);

    let mut out = Vec::with_capacity(data.len() * 4);
    decoder
        .read_to_end(&mut out)
        .await
        .map_err(ParseError::Compression)?;
    Ok(Bytes::from(out))
}

/// Split a text object into numbered, non-empty lines.
pub(crate) fn lines(data: &[u8]) -> Result<impl Iterator<Item = (usize, &str)>, ParseError> {
    let text = std::str::from_utf8(data)?;
    Ok(text
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim_end_matches('\r')))
        .filter(|(_, line)| !line.trim().is_empty()))
}

/// Decode `%XX` escapes. Invalid escapes are kept verbatim.
pub(crate) fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Encode everything but unreserved characters and `/` as `%XX`.
pub(crate) fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.' | b'-' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_compression::tokio::write::GzipEncoder;
    use tokio::io::AsyncWriteExt;

    async fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzipEncoder::new(Vec::new());
        encoder.write_all(data).await.unwrap();
        encoder.shutdown().await.unwrap();
        encoder.into_inner()
    }

    #[tokio::test]
    async fn test_plain_objects_pass_through() {
        let data = Bytes::from_static(b"hello\n");
        let decoded = decode_object("2024031512.log", data.clone()).await.unwrap();
        assert_eq!(decoded, data);
    }

    #[tokio::test]
    async fn test_gzip_detected_by_magic() {
        let compressed = gzip(b"line one\nline two\n").await;
        let decoded = decode_object("2024031512.log", Bytes::from(compressed))
            .await
            .unwrap();
        assert_eq!(&decoded[..], b"line one\nline two\n");
    }

    #[tokio::test]
    async fn test_concatenated_gzip_members() {
        let mut compressed = gzip(b"first\n").await;
        compressed.extend(gzip(b"second\n").await);
        let decoded = decode_object("x.gz", Bytes::from(compressed)).await.unwrap();
        assert_eq!(&decoded[..], b"first\nsecond\n");
    }

    #[tokio::test]
    async fn test_corrupt_gzip_is_a_parse_error() {
        let err = decode_object("x.gz", Bytes::from_static(b"\x1f\x8bnot really gzip"))
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::Compression(_)));
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("/v1/AUTH_test/my%20container"), "/v1/AUTH_test/my container");
        assert_eq!(unquote("100%"), "100%");
        assert_eq!(unquote("%zz"), "%zz");
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("my container"), "my%20container");
        assert_eq!(quote("a/b_c.d-e~"), "a/b_c.d-e~");
        assert_eq!(quote("caf\u{e9},x"), "caf%C3%A9%2Cx");
        assert_eq!(unquote(&quote("caf\u{e9} au lait")), "caf\u{e9} au lait");
    }

    #[test]
    fn test_lines_skip_blanks() {
        let found: Vec<_> = lines(b"a\r\n\n  \nb").unwrap().collect();
        assert_eq!(found, vec![(1, "a"), (4, "b")]);
    }

    #[test]
    fn test_repeated_measure_saturates() {
        let record = ParsedRecord::new("AUTH_a", None)
            .with_measure("bytes_in", u64::MAX)
            .with_measure("bytes_in", 1);
        assert_eq!(record.measures["bytes_in"], u64::MAX);
    }
}
