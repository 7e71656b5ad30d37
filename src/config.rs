use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::freshness::DEFAULT_TTL_SECS;
use crate::kv::KvStore;
use crate::linkedin::{ProbeMode, DEFAULT_API_BASE};
use crate::session::{
    CachedCredentials, CredentialSource, FileCredentials, UrlCredentials, DEFAULT_TARGET_DOMAIN,
};

/// One year.
const MAX_TTL_SECS: i64 = 365 * 24 * 60 * 60;

/// Options shared by every subcommand. Each one can also come from the
/// environment.
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database (defaults to the user data directory)
    #[arg(long, global = true, env = "JOBDECK_DB")]
    pub db: Option<PathBuf>,

    /// Read job records from a JSON export instead of the database
    #[arg(long, global = true, env = "JOBDECK_JOBS_FILE")]
    pub jobs_file: Option<PathBuf>,

    /// Browser cookie export used to authenticate freshness checks
    #[arg(long, global = true, env = "JOBDECK_COOKIES_FILE")]
    pub cookies_file: Option<PathBuf>,

    /// URL serving the cookie export; cached in the store after first fetch
    #[arg(long, global = true, env = "JOBDECK_COOKIES_URL", conflicts_with = "cookies_file")]
    pub cookies_url: Option<String>,

    /// Only cookies whose domain contains this are sent upstream
    #[arg(long, global = true, env = "JOBDECK_TARGET_DOMAIN", default_value = DEFAULT_TARGET_DOMAIN)]
    pub target_domain: String,

    #[arg(long, global = true, env = "JOBDECK_API_BASE", default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    /// How postings are checked upstream
    #[arg(long, global = true, env = "JOBDECK_PROBE", value_enum, default_value_t = ProbeMode::Api)]
    pub probe: ProbeMode,

    /// Seconds a freshness result is trusted before re-checking
    #[arg(
        long,
        global = true,
        env = "JOBDECK_TTL_SECS",
        default_value_t = DEFAULT_TTL_SECS,
        value_parser = clap::value_parser!(i64).range(0..=MAX_TTL_SECS)
    )]
    pub ttl_secs: i64,

    #[arg(long, global = true, env = "JOBDECK_HTTP_TIMEOUT_SECS", default_value_t = 15)]
    pub http_timeout_secs: u64,

    /// Keep flags and verification results in memory for this run only
    #[arg(long, global = true)]
    pub ephemeral: bool,
}

impl Config {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs.clamp(0, MAX_TTL_SECS))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// The cookie export to authenticate with. A URL source is fronted by the
    /// store so the bucket is only hit when nothing is cached.
    pub fn credential_source(&self, store: Arc<dyn KvStore>) -> Result<Arc<dyn CredentialSource>> {
        if let Some(url) = &self.cookies_url {
            let remote = Arc::new(UrlCredentials::new(url.clone(), self.http_timeout())?);
            return Ok(Arc::new(CachedCredentials::new(store, remote)));
        }
        let path = self.cookies_file.clone().unwrap_or_else(default_cookies_path);
        Ok(Arc::new(FileCredentials::new(path)))
    }
}

fn default_cookies_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "jobdeck")
        .map(|dirs| dirs.config_dir().join("cookies.json"))
        .unwrap_or_else(|| PathBuf::from("cookies.json"))
}
