//! Filesystem storage for checkpoints and cache entries.
//!
//! Every value lives in its own pretty-printed JSON file. Keys are arbitrary
//! strings (job keys are usually URLs), so file names are derived by hashing.
//!
//! ## Storage Layout
//!
//! ```text
//! <data_dir>/
//!   checkpoints/
//!     k_a1b2c3d4e5f6.json   # one checkpoint per job key
//!   cache/
//!     k_0f1e2d3c4b5a.json   # one cache entry per query signature
//! ```

use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{Error, Result};

/// Directory of JSON documents addressed by string keys.
#[derive(Debug, Clone)]
pub struct JsonDir {
    root: PathBuf,
}

impl JsonDir {
    /// Create storage rooted at `root`. The directory is created lazily on
    /// first write.
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File name used for `key`: `k_<sha256_12>.json`.
    #[must_use]
    pub fn file_name(key: &str) -> String {
        let digest = Sha256::digest(key.as_bytes());
        let hex = digest.iter().take(6).fold(String::new(), |mut acc, b| {
            // write! to String is infallible
            let _ = write!(acc, "{b:02x}");
            acc
        });
        format!("k_{hex}.json")
    }

    /// Full path of the document stored under `key`.
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(Self::file_name(key))
    }

    /// Write `value` under `key`.
    ///
    /// Uses atomic write (temp file + rename) so a crash mid-write never
    /// leaves a truncated document behind.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized or written.
    pub fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.root)
            .map_err(|e| Error::Storage(format!("Failed to create storage directory: {e}")))?;

        let path = self.path_for(key);
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| Error::Storage(format!("Failed to serialize '{key}': {e}")))?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .map_err(|e| Error::Storage(format!("Failed to write temp file: {e}")))?;

        // Handle Windows: remove target before rename
        #[cfg(target_os = "windows")]
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| Error::Storage(format!("Failed to remove existing file: {e}")))?;
        }

        fs::rename(&tmp_path, &path)
            .map_err(|e| Error::Storage(format!("Failed to commit '{key}': {e}")))?;

        debug!("stored {} at {}", key, path.display());
        Ok(())
    }

    /// Read the document stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .map_err(|e| Error::Storage(format!("Failed to read '{key}': {e}")))?;
        let value = serde_json::from_str(&json)
            .map_err(|e| Error::Storage(format!("Failed to parse '{key}': {e}")))?;
        Ok(Some(value))
    }

    /// Delete the document stored under `key`. Missing documents are fine.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| Error::Storage(format!("Failed to delete '{key}': {e}")))?;
            debug!("removed {}", key);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        n: u32,
    }

    #[test]
    fn test_file_name_is_stable_and_safe() {
        let a = JsonDir::file_name("https://api.example.com/orders?x=1");
        let b = JsonDir::file_name("https://api.example.com/orders?x=1");
        assert_eq!(a, b);
        assert_eq!(a.len(), "k_".len() + 12 + ".json".len());
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.'));
        assert_ne!(a, JsonDir::file_name("https://api.example.com/orders?x=2"));
    }

    #[test]
    fn test_write_read_remove() {
        let temp = TempDir::new().unwrap();
        let dir = JsonDir::new(temp.path().join("nested"));
        let doc = Doc {
            name: "orders".into(),
            n: 3,
        };

        assert_eq!(dir.read::<Doc>("job").unwrap(), None);
        dir.write("job", &doc).unwrap();
        assert_eq!(dir.read::<Doc>("job").unwrap(), Some(doc));

        dir.remove("job").unwrap();
        assert_eq!(dir.read::<Doc>("job").unwrap(), None);
        dir.remove("job").unwrap();
    }

    #[test]
    fn test_atomic_write_creates_no_orphan_tmp() {
        let temp = TempDir::new().unwrap();
        let dir = JsonDir::new(temp.path());
        for n in 0..5 {
            dir.write("job", &Doc { name: "x".into(), n }).unwrap();
        }

        let tmp_files: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(tmp_files.is_empty(), "No .tmp files should remain");
    }

    #[test]
    fn test_corrupt_file_is_storage_error() {
        let temp = TempDir::new().unwrap();
        let dir = JsonDir::new(temp.path());
        fs::write(dir.path_for("job"), "{ not json").unwrap();
        assert!(matches!(dir.read::<Doc>("job"), Err(Error::Storage(_))));
    }
}
