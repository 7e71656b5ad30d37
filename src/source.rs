use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::error::{AppError, Result};
use crate::filter::Predicate;
use crate::models::{JobId, JobRecord};

/// Read access to the job collection.
///
/// `fetch` may use the predicate to narrow what it returns but callers always
/// re-apply it, so a source is free to ignore it entirely.
pub trait RecordSource: Send + Sync {
    fn fetch(&self, predicate: &Predicate) -> Result<Vec<JobRecord>>;
    fn get(&self, id: &JobId) -> Result<Option<JobRecord>>;

    /// Re-reads a cached snapshot from its origin. Returns false when the
    /// source has nothing to re-read.
    fn refresh(&self) -> Result<bool> {
        Ok(false)
    }
}

/// A JSON export of job records, loaded once and kept in memory until
/// `reload` is called.
pub struct JsonRecordSource {
    path: Option<PathBuf>,
    records: RwLock<Arc<Vec<JobRecord>>>,
}

impl JsonRecordSource {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = load_file(&path)?;
        info!(path = %path.display(), count = records.len(), "loaded job snapshot");
        Ok(Self {
            path: Some(path),
            records: RwLock::new(Arc::new(records)),
        })
    }

    pub fn from_records(records: Vec<JobRecord>) -> Self {
        Self {
            path: None,
            records: RwLock::new(Arc::new(number(records))),
        }
    }

    /// Re-reads the file, replacing the in-memory snapshot. In-flight readers
    /// keep the snapshot they started with. A source built from records in
    /// memory keeps what it has.
    pub fn reload(&self) -> Result<usize> {
        let Some(path) = &self.path else {
            return Ok(self.snapshot()?.len());
        };
        let records = load_file(path)?;
        let count = records.len();
        let mut guard = self
            .records
            .write()
            .map_err(|_| AppError::StoreUnavailable("job snapshot lock poisoned".to_string()))?;
        *guard = Arc::new(records);
        info!(path = %path.display(), count, "reloaded job snapshot");
        Ok(count)
    }

    fn snapshot(&self) -> Result<Arc<Vec<JobRecord>>> {
        self.records
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| AppError::StoreUnavailable("job snapshot lock poisoned".to_string()))
    }
}

impl RecordSource for JsonRecordSource {
    fn fetch(&self, _predicate: &Predicate) -> Result<Vec<JobRecord>> {
        Ok(self.snapshot()?.as_ref().clone())
    }

    fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
        Ok(self.snapshot()?.iter().find(|r| &r.id == id).cloned())
    }

    fn refresh(&self) -> Result<bool> {
        if self.path.is_none() {
            return Ok(false);
        }
        self.reload()?;
        Ok(true)
    }
}

pub fn read_records(path: &Path) -> Result<Vec<JobRecord>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| AppError::StoreUnavailable(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| AppError::StoreUnavailable(format!("{}: invalid job export: {}", path.display(), e)))
}

fn load_file(path: &Path) -> Result<Vec<JobRecord>> {
    Ok(number(read_records(path)?))
}

fn number(mut records: Vec<JobRecord>) -> Vec<JobRecord> {
    for (i, record) in records.iter_mut().enumerate() {
        record.seq = i as i64;
    }
    records
}
