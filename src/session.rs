use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::kv::KvStore;
use crate::models::Cookie;

pub const DEFAULT_TARGET_DOMAIN: &str = "linkedin.com";
pub const TOKEN_COOKIE: &str = "JSESSIONID";
const CACHE_KEY: &str = "cookies";

/// Where the browser cookie export comes from. Refreshing the export is
/// someone else's job.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<Cookie>>;

    /// The last snapshot was rejected upstream; the next `fetch` must not
    /// serve it from any local copy.
    fn invalidate(&self) {}
}

/// Authenticated identity for the upstream site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub cookie_header: String,
    pub anti_forgery_token: String,
}

/// Renders the cookie header for `target_domain` and lifts the anti-forgery
/// token out of the session cookie, where the upstream site keeps it quoted.
pub fn build_session(cookies: &[Cookie], target_domain: &str, token_cookie: &str) -> Result<Session> {
    let cookie_header = cookies
        .iter()
        .filter(|c| c.domain.as_deref().is_some_and(|d| d.contains(target_domain)))
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ");
    if cookie_header.is_empty() {
        return Err(AppError::CredentialUnavailable(format!(
            "no cookies for {}",
            target_domain
        )));
    }

    let anti_forgery_token = cookies
        .iter()
        .find(|c| c.name == token_cookie)
        .map(|c| c.value.replace('"', ""))
        .unwrap_or_default();
    if anti_forgery_token.is_empty() {
        return Err(AppError::CredentialUnavailable(format!(
            "{} cookie missing from snapshot",
            token_cookie
        )));
    }

    Ok(Session {
        cookie_header,
        anti_forgery_token,
    })
}

/// Builds the session once and reuses it until `invalidate` is called.
pub struct SessionProvider {
    source: Arc<dyn CredentialSource>,
    target_domain: String,
    token_cookie: String,
    cached: RwLock<Option<Arc<Session>>>,
}

impl SessionProvider {
    pub fn new(source: Arc<dyn CredentialSource>, target_domain: impl Into<String>) -> Self {
        Self {
            source,
            target_domain: target_domain.into(),
            token_cookie: TOKEN_COOKIE.to_string(),
            cached: RwLock::new(None),
        }
    }

    pub async fn current_session(&self) -> Result<Arc<Session>> {
        let cached = self.cached.read().ok().and_then(|guard| guard.clone());
        if let Some(session) = cached {
            return Ok(session);
        }

        let cookies = self.source.fetch().await?;
        let session = Arc::new(build_session(&cookies, &self.target_domain, &self.token_cookie)?);
        if let Ok(mut guard) = self.cached.write() {
            *guard = Some(Arc::clone(&session));
        }
        debug!(cookies = cookies.len(), "built upstream session");
        Ok(session)
    }

    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.cached.write() {
            if guard.take().is_some() {
                info!("upstream session invalidated");
            }
        }
        self.source.invalidate();
    }
}

fn parse_snapshot(raw: &str, origin: &str) -> Result<Vec<Cookie>> {
    serde_json::from_str(raw)
        .map_err(|e| AppError::CredentialUnavailable(format!("malformed cookie snapshot from {}: {}", origin, e)))
}

/// Cookie export on local disk.
pub struct FileCredentials {
    path: PathBuf,
}

impl FileCredentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialSource for FileCredentials {
    async fn fetch(&self) -> Result<Vec<Cookie>> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            AppError::CredentialUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        parse_snapshot(&raw, &self.path.display().to_string())
    }
}

/// Cookie export published at a URL, e.g. a storage bucket object.
pub struct UrlCredentials {
    client: reqwest::Client,
    url: String,
}

impl UrlCredentials {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::CredentialUnavailable(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CredentialSource for UrlCredentials {
    async fn fetch(&self) -> Result<Vec<Cookie>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| AppError::CredentialUnavailable(format!("failed to fetch cookie snapshot: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::CredentialUnavailable(format!(
                "cookie snapshot request returned {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AppError::CredentialUnavailable(format!("failed to read cookie snapshot: {}", e)))?;
        parse_snapshot(&body, &self.url)
    }
}

/// Serves the last snapshot kept in the durable store, asking `inner` only
/// when nothing usable is stored or the stored copy was rejected.
pub struct CachedCredentials {
    store: Arc<dyn KvStore>,
    inner: Arc<dyn CredentialSource>,
    bypass: AtomicBool,
}

impl CachedCredentials {
    pub fn new(store: Arc<dyn KvStore>, inner: Arc<dyn CredentialSource>) -> Self {
        Self {
            store,
            inner,
            bypass: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl CredentialSource for CachedCredentials {
    async fn fetch(&self) -> Result<Vec<Cookie>> {
        if !self.bypass.swap(false, Ordering::SeqCst) {
            match self.store.get(CACHE_KEY) {
                Ok(None) | Ok(Some(Value::Null)) => {}
                Ok(Some(value)) => match serde_json::from_value::<Vec<Cookie>>(value) {
                    Ok(cookies) => return Ok(cookies),
                    Err(e) => warn!(error = %e, "ignoring unreadable cached cookie snapshot"),
                },
                Err(e) => warn!(error = %e, "cookie cache unavailable"),
            }
        }

        let cookies = self.inner.fetch().await?;
        match serde_json::to_value(&cookies) {
            Ok(value) => {
                if let Err(e) = self.store.put(CACHE_KEY, &value) {
                    warn!(error = %e, "failed to cache cookie snapshot");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode cookie snapshot"),
        }
        Ok(cookies)
    }

    fn invalidate(&self) {
        // Skipping the store covers a failed clear as well.
        self.bypass.store(true, Ordering::SeqCst);
        if let Err(e) = self.store.put(CACHE_KEY, &Value::Null) {
            warn!(error = %e, "failed to clear cached cookie snapshot");
        }
        self.inner.invalidate();
        debug!("cached cookie snapshot dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cookie(name: &str, value: &str, domain: &str) -> Cookie {
        Cookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: Some(domain.to_string()),
            path: Some("/".to_string()),
            secure: Some(true),
            http_only: None,
            expiry: None,
        }
    }

    fn snapshot() -> Vec<Cookie> {
        vec![
            cookie("li_at", "AQEDAT", ".www.linkedin.com"),
            cookie("JSESSIONID", "\"ajax:123456\"", ".www.linkedin.com"),
            cookie("other", "x", ".example.com"),
        ]
    }

    struct CountingSource {
        cookies: Vec<Cookie>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn fetch(&self) -> Result<Vec<Cookie>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.cookies.clone())
        }
    }

    #[test]
    fn test_build_session_filters_domain_and_strips_quotes() {
        let session = build_session(&snapshot(), "linkedin.com", "JSESSIONID").unwrap();
        assert_eq!(session.cookie_header, "li_at=AQEDAT; JSESSIONID=\"ajax:123456\"");
        assert_eq!(session.anti_forgery_token, "ajax:123456");
    }

    #[test]
    fn test_build_session_requires_token_cookie() {
        let cookies = vec![cookie("li_at", "AQEDAT", ".linkedin.com")];
        assert!(matches!(
            build_session(&cookies, "linkedin.com", "JSESSIONID"),
            Err(AppError::CredentialUnavailable(_))
        ));
    }

    #[test]
    fn test_build_session_requires_domain_cookies() {
        let cookies = vec![cookie("JSESSIONID", "\"t\"", ".example.com")];
        assert!(matches!(
            build_session(&cookies, "linkedin.com", "JSESSIONID"),
            Err(AppError::CredentialUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_provider_fetches_snapshot_once_until_invalidated() {
        let source = Arc::new(CountingSource {
            cookies: snapshot(),
            calls: AtomicUsize::new(0),
        });
        let provider = SessionProvider::new(source.clone(), DEFAULT_TARGET_DOMAIN);

        let first = provider.current_session().await.unwrap();
        let second = provider.current_session().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        provider.invalidate();
        provider.current_session().await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_file_credentials_reports_missing_and_malformed() {
        let missing = FileCredentials::new("/nonexistent/cookies.json");
        assert!(matches!(missing.fetch().await, Err(AppError::CredentialUnavailable(_))));

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "{not a list").unwrap();
        let malformed = FileCredentials::new(file.path());
        assert!(matches!(malformed.fetch().await, Err(AppError::CredentialUnavailable(_))));
    }

    #[tokio::test]
    async fn test_file_credentials_reads_browser_export() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            json!([{
                "name": "JSESSIONID",
                "value": "\"ajax:1\"",
                "domain": ".www.linkedin.com",
                "path": "/",
                "secure": true,
                "httpOnly": false,
                "sameSite": false,
                "expiry": 1767225600
            }])
            .to_string(),
        )
        .unwrap();
        let cookies = FileCredentials::new(file.path()).fetch().await.unwrap();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].http_only, Some(false));
    }

    #[tokio::test]
    async fn test_cached_credentials_prefers_store() {
        let store = Arc::new(MemoryStore::new());
        let inner = Arc::new(CountingSource {
            cookies: snapshot(),
            calls: AtomicUsize::new(0),
        });
        let cached = CachedCredentials::new(store.clone(), inner.clone());

        assert_eq!(cached.fetch().await.unwrap().len(), 3);
        assert_eq!(cached.fetch().await.unwrap().len(), 3);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert!(store.get("cookies").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cached_credentials_refetch_after_invalidate() {
        let store = Arc::new(MemoryStore::new());
        store
            .put("cookies", &serde_json::to_value(vec![cookie("li_at", "OLD", ".linkedin.com")]).unwrap())
            .unwrap();
        let inner = Arc::new(CountingSource {
            cookies: snapshot(),
            calls: AtomicUsize::new(0),
        });
        let cached = CachedCredentials::new(store.clone(), inner.clone());

        assert_eq!(cached.fetch().await.unwrap()[0].value, "OLD");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);

        cached.invalidate();
        assert_eq!(store.get("cookies").unwrap(), Some(Value::Null));
        assert_eq!(cached.fetch().await.unwrap().len(), 3);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        // the fresh snapshot is cached again
        assert_eq!(cached.fetch().await.unwrap().len(), 3);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_bypasses_store_that_cannot_be_cleared() {
        let store = Arc::new(MemoryStore::new());
        store
            .put("cookies", &serde_json::to_value(vec![cookie("li_at", "OLD", ".linkedin.com")]).unwrap())
            .unwrap();
        let inner = Arc::new(CountingSource {
            cookies: snapshot(),
            calls: AtomicUsize::new(0),
        });
        let cached = CachedCredentials::new(store.clone(), inner.clone());

        store.set_offline(true);
        cached.invalidate();
        store.set_offline(false);

        assert_eq!(cached.fetch().await.unwrap().len(), 3);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_credentials_falls_through_when_store_down() {
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let inner = Arc::new(CountingSource {
            cookies: snapshot(),
            calls: AtomicUsize::new(0),
        });
        let cached = CachedCredentials::new(store, inner.clone());
        assert_eq!(cached.fetch().await.unwrap().len(), 3);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
