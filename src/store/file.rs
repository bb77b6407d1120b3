use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use crate::{config::FlagFormat, Result};

use super::{extract_flag, merge_flag, FlagReader, FlagWriter};

/// Flag document stored in a local file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    format: FlagFormat,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>, format: FlagFormat) -> FileStore {
        FileStore {
            path: path.as_ref().to_owned(),
            format,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl FlagReader for FileStore {
    fn read_all(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.path)?)
    }

    fn read_by_key(&self, key: &str) -> Result<Vec<u8>> {
        extract_flag(&self.read_all()?, self.format, key)
    }
}

impl FlagWriter for FileStore {
    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let existing = match fs::read(&self.path) {
            Ok(existing) => existing,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let merged = merge_flag(&existing, bytes, self.format)?;

        // Readers never observe a partially written file.
        let temp_path = self.temp_path();
        fs::write(&temp_path, merged)?;
        fs::rename(&temp_path, &self.path)?;

        log::debug!(target: "flagserve", key; "wrote flag to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{flag::parse_flags, Error};

    #[test]
    fn reads_writes_and_extracts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("flags.yaml"), FlagFormat::Yaml);

        assert!(matches!(store.read_all(), Err(Error::Io(_))));

        store
            .write("a", b"a:\n  disabled: false\n  variants:\n    default: on\n")
            .unwrap();
        store
            .write("b", b"b:\n  variants:\n    default: off\n")
            .unwrap();

        let flags = parse_flags(&store.read_all().unwrap(), FlagFormat::Yaml).unwrap();
        assert_eq!(flags.len(), 2);

        let flags = parse_flags(&store.read_by_key("a").unwrap(), FlagFormat::Yaml).unwrap();
        assert_eq!(flags.keys().collect::<Vec<_>>(), ["a"]);

        assert!(store.read_by_key("c").unwrap_err().is_not_found());
        assert!(!store.temp_path().exists());
    }
}
