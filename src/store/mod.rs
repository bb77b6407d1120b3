//! Flag store port: where flag documents are read from and written to.
//!
//! Stores deal in raw bytes in the configured [`FlagFormat`]. Parsing and validation happen in
//! the services.
use std::collections::BTreeMap;

use crate::{config::FlagFormat, Error, Result};

mod file;
mod http;
mod memory;

pub use file::FileStore;
pub use http::HttpReader;
pub use memory::MemoryStore;

/// Read side of a flag store.
pub trait FlagReader {
    /// Read the whole flag set document.
    fn read_all(&self) -> Result<Vec<u8>>;

    /// Read a document containing only the flag `key`.
    ///
    /// Returns [`Error::RecordNotFound`] if the store has no such flag.
    fn read_by_key(&self, key: &str) -> Result<Vec<u8>>;
}

/// Write side of a flag store.
pub trait FlagWriter {
    /// Insert or replace flag `key`. `bytes` is a document holding the flag under its key.
    fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

/// A [`FlagWriter`] that discards all writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWriter;

impl FlagWriter for NoopWriter {
    fn write(&self, key: &str, _bytes: &[u8]) -> Result<()> {
        log::debug!(target: "flagserve", key; "discarding flag write");
        Ok(())
    }
}

type Document = BTreeMap<String, serde_json::Value>;

fn decode_document(bytes: &[u8], format: FlagFormat) -> Result<Document> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Document::new());
    }
    format.decode(bytes)
}

/// Cut the entry for `key` out of a whole flag set document.
pub(crate) fn extract_flag(bytes: &[u8], format: FlagFormat, key: &str) -> Result<Vec<u8>> {
    let mut document = decode_document(bytes, format)?;
    let value = document.remove(key).ok_or_else(|| Error::RecordNotFound {
        key: key.to_owned(),
    })?;
    format.encode(&Document::from([(key.to_owned(), value)]))
}

/// Merge the entries of `update` into the `existing` flag set document, replacing entries with
/// the same key.
pub(crate) fn merge_flag(existing: &[u8], update: &[u8], format: FlagFormat) -> Result<Vec<u8>> {
    let mut document = decode_document(existing, format)?;
    document.extend(decode_document(update, format)?);
    format.encode(&document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flag::parse_flags;

    const FLAGS: &[u8] = br#"{
        "a": {"disabled": false, "variants": {"default": 1}},
        "b": {"disabled": true, "variants": {"default": 2}}
    }"#;

    #[test]
    fn extracts_single_flag() {
        let bytes = extract_flag(FLAGS, FlagFormat::Json, "b").unwrap();
        let flags = parse_flags(&bytes, FlagFormat::Json).unwrap();
        assert_eq!(flags.len(), 1);
        assert!(flags["b"].is_disabled());
    }

    #[test]
    fn extract_missing_flag_is_not_found() {
        let err = extract_flag(FLAGS, FlagFormat::Json, "c").unwrap_err();
        assert!(matches!(err, Error::RecordNotFound { key } if key == "c"));
    }

    #[test]
    fn merge_replaces_and_adds() {
        let update = br#"{"b": {"disabled": false, "variants": {"default": 3}}, "c": {"variants": {"default": 4}}}"#;
        let merged = merge_flag(FLAGS, update, FlagFormat::Json).unwrap();
        let flags = parse_flags(&merged, FlagFormat::Json).unwrap();
        assert_eq!(flags.len(), 3);
        assert!(!flags["b"].is_disabled());
        assert_eq!(flags["b"].variants["default"], serde_json::json!(3));
    }

    #[test]
    fn merge_into_empty_document() {
        let merged = merge_flag(b"", b"c:\n  variants:\n    default: true\n", FlagFormat::Yaml).unwrap();
        let flags = parse_flags(&merged, FlagFormat::Yaml).unwrap();
        assert!(flags.contains_key("c"));
    }
}
