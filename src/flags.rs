use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::kv::KvStore;
use crate::models::{FlagKind, JobId};

/// Either shape a flag set has been stored in.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredFlags {
    Map(BTreeMap<String, Value>),
    Legacy(Vec<LegacyEntry>),
}

/// Old lists held bare ids, and the ignore list held whole job objects.
#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyEntry {
    Id(JobId),
    Job { id: JobId },
}

impl StoredFlags {
    fn into_ids(self) -> BTreeSet<JobId> {
        match self {
            // Only `true` counts; anything else is treated as absent.
            StoredFlags::Map(map) => map
                .into_iter()
                .filter(|(_, v)| v.as_bool() == Some(true))
                .map(|(k, _)| JobId::new(k))
                .collect(),
            StoredFlags::Legacy(entries) => entries
                .into_iter()
                .map(|e| match e {
                    LegacyEntry::Id(id) | LegacyEntry::Job { id } => id,
                })
                .collect(),
        }
    }
}

/// Sparse per-kind flag sets: a job id is present when the flag is set.
pub struct FlagStore {
    store: Arc<dyn KvStore>,
}

impl FlagStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn map_key(kind: FlagKind) -> String {
        format!("flags:{}", kind)
    }

    pub fn legacy_key(kind: FlagKind) -> String {
        format!("{}-jobs", kind)
    }

    pub fn has_flag(&self, kind: FlagKind, id: &JobId) -> Result<bool> {
        Ok(self.flagged(kind)?.contains(id))
    }

    pub fn set_flag(&self, kind: FlagKind, id: &JobId, present: bool) -> Result<()> {
        let mut ids = self.flagged(kind)?;
        let changed = if present {
            ids.insert(id.clone())
        } else {
            ids.remove(id)
        };
        self.persist(kind, &ids)?;
        debug!(kind = %kind, job_id = %id, present, changed, "flag written");
        Ok(())
    }

    /// Every id carrying `kind`. Migrates a legacy list on first read.
    pub fn flagged(&self, kind: FlagKind) -> Result<BTreeSet<JobId>> {
        if let Some(value) = self.store.get(&Self::map_key(kind))? {
            return parse(kind, value);
        }

        let Some(legacy) = self.store.get(&Self::legacy_key(kind))? else {
            return Ok(BTreeSet::new());
        };
        let ids = parse(kind, legacy)?;
        // The legacy key is left as-is.
        self.persist(kind, &ids)?;
        info!(kind = %kind, count = ids.len(), "migrated legacy flag list");
        Ok(ids)
    }

    fn persist(&self, kind: FlagKind, ids: &BTreeSet<JobId>) -> Result<()> {
        let map: serde_json::Map<String, Value> = ids
            .iter()
            .map(|id| (id.as_str().to_string(), Value::Bool(true)))
            .collect();
        self.store.put(&Self::map_key(kind), &Value::Object(map))
    }
}

fn parse(kind: FlagKind, value: Value) -> Result<BTreeSet<JobId>> {
    if value.is_null() {
        return Ok(BTreeSet::new());
    }
    serde_json::from_value::<StoredFlags>(value)
        .map(StoredFlags::into_ids)
        .map_err(|e| AppError::StoreUnavailable(format!("malformed {} flags: {}", kind, e)))
}
