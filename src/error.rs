use thiserror::Error;

/// Failure taxonomy shared by every jobdeck component.
///
/// Flag and query failures reach the caller as-is. Verification swallows
/// everything except `NotFound` and `Cancelled` and reports `Unknown` instead.
#[derive(Error, Debug)]
pub enum AppError {
    /// The durable key-value store or job database could not be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The credential snapshot is missing or unusable.
    #[error("credentials unavailable: {0}")]
    CredentialUnavailable(String),

    /// Network, status or parse failure while checking a posting upstream.
    #[error("external check failed: {0}")]
    ExternalCheckFailed(String),

    /// The record query was malformed or the backing source failed.
    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("job {0} not found")]
    NotFound(String),

    /// The caller abandoned a verification before it completed.
    #[error("verification cancelled")]
    Cancelled,
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::StoreUnavailable(e.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::ExternalCheckFailed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
