use std::sync::{PoisonError, RwLock};

use crate::{config::FlagFormat, Result};

use super::{extract_flag, merge_flag, FlagReader, FlagWriter};

/// In-process flag document. Readable and writable.
#[derive(Debug, Default)]
pub struct MemoryStore {
    format: FlagFormat,
    document: RwLock<Vec<u8>>,
}

impl MemoryStore {
    pub fn new(format: FlagFormat) -> MemoryStore {
        MemoryStore::with_document(format, Vec::new())
    }

    pub fn with_document(format: FlagFormat, document: impl Into<Vec<u8>>) -> MemoryStore {
        MemoryStore {
            format,
            document: RwLock::new(document.into()),
        }
    }

    /// Replace the whole document, as an out-of-band edit would.
    pub fn set_document(&self, document: impl Into<Vec<u8>>) {
        *self
            .document
            .write()
            .unwrap_or_else(PoisonError::into_inner) = document.into();
    }
}

impl FlagReader for MemoryStore {
    fn read_all(&self) -> Result<Vec<u8>> {
        Ok(self
            .document
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn read_by_key(&self, key: &str) -> Result<Vec<u8>> {
        extract_flag(&self.read_all()?, self.format, key)
    }
}

impl FlagWriter for MemoryStore {
    fn write(&self, _key: &str, bytes: &[u8]) -> Result<()> {
        let mut document = self
            .document
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *document = merge_flag(&document, bytes, self.format)?;
        Ok(())
    }
}
