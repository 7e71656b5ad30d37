//! Advisory freshness checks for job postings.
//!
//! A posting is checked upstream at most once per TTL. The hot path, a known
//! result younger than the TTL, answers from the verification cache without
//! touching the record source or the network. Upstream trouble never reaches
//! the caller: the previous answer is returned and the cache is left alone so
//! the next call retries straight away.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::kv::KvStore;
use crate::models::{JobId, JobRecord, Validity, VerificationRecord};
use crate::session::{Session, SessionProvider};
use crate::source::RecordSource;

pub const DEFAULT_TTL_SECS: i64 = 60;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// What the upstream site says about a posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostingState {
    Open,
    Closed,
    /// The posting no longer exists upstream.
    Gone,
}

/// One request against the upstream site. Implementations report expired
/// credentials (401/403) as `CredentialUnavailable` and every other failure as
/// `ExternalCheckFailed`.
#[async_trait]
pub trait PostingProbe: Send + Sync {
    async fn check(&self, session: &Session, job: &JobRecord) -> Result<PostingState>;
}

/// Per-job verification records in the durable store.
pub struct VerificationCache {
    store: Arc<dyn KvStore>,
}

impl VerificationCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn key(id: &JobId) -> String {
        format!("verify:{}", id)
    }

    pub fn get(&self, id: &JobId) -> Result<Option<VerificationRecord>> {
        match self.store.get(&Self::key(id))? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                AppError::StoreUnavailable(format!("malformed verification record for {}: {}", id, e))
            }),
        }
    }

    pub fn put(&self, id: &JobId, record: &VerificationRecord) -> Result<()> {
        let value = serde_json::to_value(record)
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        self.store.put(&Self::key(id), &value)
    }

    /// Last known validity, `Unknown` when never checked.
    pub fn validity(&self, id: &JobId) -> Result<Validity> {
        Ok(self.get(id)?.map(|r| r.valid).unwrap_or_default())
    }
}

pub struct FreshnessChecker {
    cache: VerificationCache,
    sessions: Arc<SessionProvider>,
    probe: Arc<dyn PostingProbe>,
    records: Arc<dyn RecordSource>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl FreshnessChecker {
    pub fn new(
        cache: VerificationCache,
        sessions: Arc<SessionProvider>,
        probe: Arc<dyn PostingProbe>,
        records: Arc<dyn RecordSource>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            cache,
            sessions,
            probe,
            records,
            clock,
            ttl,
        }
    }

    pub async fn verify(&self, id: &JobId) -> Result<Validity> {
        let previous = match self.cache.get(id) {
            Ok(record) => record.unwrap_or_default(),
            Err(e) => {
                warn!(job_id = %id, error = %e, "verification cache read failed");
                VerificationRecord::default()
            }
        };

        // An expiry past the representable range never arrives.
        let fresh = previous
            .when
            .checked_add_signed(self.ttl)
            .is_none_or(|expires| expires > self.clock.now());
        if previous.valid.is_known() && fresh {
            debug!(job_id = %id, valid = %previous.valid, "verification cache hit");
            return Ok(previous.valid);
        }

        let job = match self.records.get(id) {
            Ok(Some(job)) => job,
            Ok(None) => return Err(AppError::NotFound(id.to_string())),
            Err(e) => {
                warn!(job_id = %id, error = %e, "job lookup failed during verification");
                return Ok(previous.valid);
            }
        };

        let state = match self.check_upstream(&job).await {
            Ok(state) => state,
            Err(e) => {
                warn!(job_id = %id, error = %e, "freshness check failed, keeping previous result");
                return Ok(previous.valid);
            }
        };

        let valid = match state {
            PostingState::Open => Validity::Valid,
            PostingState::Closed => Validity::Invalid,
            PostingState::Gone => previous.valid,
        };
        let next = VerificationRecord {
            valid,
            when: self.clock.now().max(previous.when),
        };
        if let Err(e) = self.cache.put(id, &next) {
            warn!(job_id = %id, error = %e, "failed to persist verification result");
        }
        info!(job_id = %id, state = ?state, valid = %valid, "posting verified");
        Ok(valid)
    }

    /// Runs `verify` until `cancel` resolves. A cancelled check is dropped
    /// mid-request and leaves the cache untouched.
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

    async fn check_upstream(&self, job: &JobRecord) -> Result<PostingState> {
        let session = self.sessions.current_session().await?;
        match self.probe.check(&session, job).await {
            Err(AppError::CredentialUnavailable(msg)) => {
                self.sessions.invalidate();
                Err(AppError::CredentialUnavailable(msg))
            }
            other => other,
        }
    }
}
