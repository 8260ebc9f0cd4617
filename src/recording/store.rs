//! Record stores
//!
//! A store receives the same record several times over an exchange's life:
//! once when the exchange starts and again when it is finalized. Every save
//! is an upsert keyed by the record id.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::debug;

use crate::{Result, TapwireError};

use super::record::RequestRecord;
use super::RECORD_EXTENSION;

/// Destination for captured exchanges
pub trait RecordStore: Send + Sync {
    /// Insert or replace the record with the same id
    ///
    /// # Errors
    ///
    /// Returns error if the record cannot be persisted
    fn save_request(&self, record: &RequestRecord) -> Result<()>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, RequestRecord>,
    saves: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a record by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<RequestRecord> {
        self.records.get(id).map(|entry| entry.value().clone())
    }

    /// All records, oldest first
    #[must_use]
    pub fn records(&self) -> Vec<RequestRecord> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(RequestRecord::created_at_ms);
        records
    }

    /// Number of distinct records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total number of save calls, including updates
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    /// Drop all records
    pub fn clear(&self) {
        self.records.clear();
    }
}

impl RecordStore for MemoryStore {
    fn save_request(&self, record: &RequestRecord) -> Result<()> {
        self.records.insert(record.id().to_string(), record.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Directory store: one TOML file per record, rewritten on every save
#[derive(Debug, Clone)]
pub struct DirStore {
    dir: PathBuf,
}

impl DirStore {
    /// Open a store rooted at `dir`
    ///
    /// # Errors
    ///
    /// Returns error if `dir` is not an existing directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(TapwireError::ConfigError(format!(
                "Record directory does not exist: {}",
                dir.display()
            )));
        }
        Ok(Self { dir })
    }

    /// Store directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding record `id`
    #[must_use]
    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{RECORD_EXTENSION}"))
    }

    /// Load one record
    ///
    /// # Errors
    ///
    /// Returns error if the file is missing or cannot be parsed
    pub fn load(&self, id: &str) -> Result<RequestRecord> {
        read_record(&self.path_for(id))
    }

    /// Load every record in the directory, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be read or a record is malformed
    pub fn load_all(&self) -> Result<Vec<RequestRecord>> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(RECORD_EXTENSION) {
                records.push(read_record(&path)?);
            }
        }
        records.sort_by_key(RequestRecord::created_at_ms);
        Ok(records)
    }
}

impl RecordStore for DirStore {
    fn save_request(&self, record: &RequestRecord) -> Result<()> {
        let content = toml::to_string(record)
            .map_err(|e| TapwireError::Store(format!("Failed to serialize record: {e}")))?;

        // Write then rename so readers never see a partial file
        let path = self.path_for(record.id());
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;

        debug!("Saved record {} to {}", record.id(), path.display());
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<RequestRecord> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| {
        TapwireError::Store(format!("Failed to parse record {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Request;
    use std::time::Duration;
    use tempfile::TempDir;

    fn record(uri: &str) -> RequestRecord {
        let (parts, ()) = Request::get(uri).body(()).unwrap().into_parts();
        RequestRecord::new(&parts, None)
    }

    #[test]
    fn test_memory_store_upsert() {
        let store = MemoryStore::new();
        let mut rec = record("http://example.com/a");

        store.save_request(&rec).unwrap();
        rec.mark_failed("cancelled").unwrap();
        store.save_request(&rec).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.save_count(), 2);
        assert_eq!(
            store.get(rec.id()).unwrap().error_description(),
            Some("cancelled")
        );
    }

    #[test]
    fn test_memory_store_lists_records() {
        let store = MemoryStore::new();
        store.save_request(&record("http://example.com/a")).unwrap();
        store.save_request(&record("http://example.com/b")).unwrap();

        assert_eq!(store.records().len(), 2);
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_dir_store_requires_directory() {
        assert!(DirStore::open("/nonexistent/tapwire/records").is_err());
    }

    #[test]
    fn test_dir_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = DirStore::open(temp_dir.path()).unwrap();

        let mut rec = record("http://example.com/a");
        store.save_request(&rec).unwrap();
        assert!(store.path_for(rec.id()).exists());

        rec.mark_failed("connection failed: refused").unwrap();
        rec.finalize(None, Duration::from_millis(3)).unwrap();
        store.save_request(&rec).unwrap();

        let loaded = store.load(rec.id()).unwrap();
        assert_eq!(loaded, rec);

        store.save_request(&record("http://example.com/b")).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 2);
    }
}
