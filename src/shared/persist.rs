//! Atomic JSON documents
//!
//! Both persisted stores are single documents replaced with write-then-rename,
//! so an interrupted run leaves either the old or the new file, never a torn
//! one. Loading never fails: a missing or unreadable document is an empty store.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;

use crate::error::EngineError;

/// Serialize `value` to `path` atomically
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    serde_json::to_writer(&mut tmp, value).context("Failed to serialize document")?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;

    tmp.persist(path).map_err(|e| EngineError::Persistence {
        path: path.to_path_buf(),
        message: e.error.to_string(),
    })?;
    Ok(())
}

/// Load a document, falling back to `T::default()` when it is missing or corrupt
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path, label: &str) -> T {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!("No {} at {}, starting empty", label, path.display());
            return T::default();
        }
        Err(e) => {
            tracing::warn!("Cannot read {} at {}: {}; starting empty", label, path.display(), e);
            return T::default();
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::warn!("Corrupted {} at {}: {}; starting empty", label, path.display(), e);
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip_and_replace() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("state").join("doc.json");

        let mut doc = BTreeMap::new();
        doc.insert("a".to_string(), 1u32);
        write_json_atomic(&path, &doc)?;
        doc.insert("b".to_string(), 2u32);
        write_json_atomic(&path, &doc)?;

        let loaded: BTreeMap<String, u32> = read_json_or_default(&path, "test document");
        assert_eq!(loaded, doc);
        // Only the document remains, no temporary leftovers
        assert_eq!(std::fs::read_dir(path.parent().unwrap())?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_missing_and_corrupt_documents_default() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("doc.json");

        let missing: BTreeMap<String, u32> = read_json_or_default(&path, "test document");
        assert!(missing.is_empty());

        std::fs::write(&path, "{ not json")?;
        let corrupt: BTreeMap<String, u32> = read_json_or_default(&path, "test document");
        assert!(corrupt.is_empty());
        Ok(())
    }
}
