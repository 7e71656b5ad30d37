use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::flags::FlagStore;
use crate::freshness::FreshnessChecker;
use crate::models::{FlagKind, JobId, JobSummary, PageResult, Validity};
use crate::query::{ListParams, QueryEngine};
use crate::source::RecordSource;

/// Everything the command line can ask of the engine.
///
/// Lookups by id that miss re-read the record source once, so a job written
/// to a snapshot after it was loaded is still found.
pub struct JobService {
    records: Arc<dyn RecordSource>,
    query: QueryEngine,
    flags: Arc<FlagStore>,
    freshness: FreshnessChecker,
}

impl JobService {
    pub fn new(
        records: Arc<dyn RecordSource>,
        query: QueryEngine,
        flags: Arc<FlagStore>,
        freshness: FreshnessChecker,
    ) -> Self {
        Self {
            records,
            query,
            flags,
            freshness,
        }
    }

    pub fn list(&self, params: &ListParams) -> Result<PageResult> {
        self.query.list(params)
    }

    pub fn get(&self, id: &JobId) -> Result<JobSummary> {
        match self.query.get(id) {
            Err(AppError::NotFound(_)) if self.refreshed(id) => self.query.get(id),
            other => other,
        }
    }

    pub fn set_flag(&self, kind: FlagKind, id: &JobId, present: bool) -> Result<()> {
        let known = self.query.exists(id)? || (self.refreshed(id) && self.query.exists(id)?);
        if !known {
            return Err(AppError::NotFound(id.to_string()));
        }
        self.flags.set_flag(kind, id, present)?;
        info!(kind = %kind, job_id = %id, present, "flag updated");
        Ok(())
    }

    pub async fn verify(&self, id: &JobId) -> Result<Validity> {
        match self.freshness.verify(id).await {
            Err(AppError::NotFound(_)) if self.refreshed(id) => self.freshness.verify(id).await,
            other => other,
        }
    }

    pub async fn verify_until<F>(&self, id: &JobId, cancel: F) -> Result<Validity>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancel => {
                debug!(job_id = %id, "verification cancelled");
                Err(AppError::Cancelled)
            }
            result = self.verify(id) => result,
        }
    }

    fn refreshed(&self, id: &JobId) -> bool {
        match self.records.refresh() {
            Ok(refreshed) => refreshed,
            Err(e) => {
                warn!(job_id = %id, error = %e, "record refresh failed");
                false
            }
        }
    }
}
