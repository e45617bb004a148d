//! File-backed key-value store
//!
//! Each key lives in its own file under the data directory, so a corrupted
//! entry never affects the others.

use super::KeyValueStore;
use crate::types::{ClientError, ClientResult};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::debug;

const ENTRY_EXTENSION: &str = "json";

pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `base_dir` (created lazily on first write)
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.{}", encode_key(key), ENTRY_EXTENSION))
    }
}

/// Percent-encode every byte outside `[A-Za-z0-9_-]` so distinct keys never
/// share a file and no key can leave the base directory
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> ClientResult<Option<String>> {
        match fs::read_to_string(self.entry_path(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ClientError::Store(format!("Failed to read {}: {}", key, e))),
        }
    }

    fn set(&self, key: &str, value: &str) -> ClientResult<()> {
        fs::create_dir_all(&self.base_dir)
            .map_err(|e| ClientError::Store(format!("Failed to create {:?}: {}", self.base_dir, e)))?;

        // Write to a sibling file first so readers never observe a torn entry
        let path = self.entry_path(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| ClientError::Store(format!("Failed to write {}: {}", key, e)))?;

        debug!(key, path = ?path, "Stored entry");
        Ok(())
    }

    fn remove(&self, key: &str) -> ClientResult<()> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ClientError::Store(format!("Failed to remove {}: {}", key, e))),
        }
    }
}
