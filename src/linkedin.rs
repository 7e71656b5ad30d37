use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::freshness::{PostingProbe, PostingState};
use crate::models::JobRecord;
use crate::session::Session;

pub const DEFAULT_API_BASE: &str = "https://www.linkedin.com/voyager/api";
const JOB_PAGE_BASE: &str = "https://www.linkedin.com/jobs/view";
const CLOSED_MARKER: &str = "no longer accepting applications";

/// How a posting is inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProbeMode {
    /// JSON posting record from the internal API; reads `jobState`.
    Api,
    /// Public job page; looks for the closed-posting notice.
    Page,
}

pub struct LinkedInProbe {
    client: Client,
    api_base: String,
    page_base: String,
    target_domain: String,
    mode: ProbeMode,
}

impl LinkedInProbe {
    pub fn new(
        api_base: impl Into<String>,
        target_domain: impl Into<String>,
        mode: ProbeMode,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ExternalCheckFailed(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            page_base: JOB_PAGE_BASE.to_string(),
            target_domain: target_domain.into().to_ascii_lowercase(),
            mode,
        })
    }

    #[cfg(test)]
    fn with_page_base(mut self, page_base: &str) -> Self {
        self.page_base = page_base.trim_end_matches('/').to_string();
        self
    }

    /// The session cookies ride along on every request, so the job's own
    /// link is only followed when it points at the target site.
    fn url_for(&self, job: &JobRecord) -> String {
        let posting = posting_id(job);
        match self.mode {
            ProbeMode::Api => format!("{}/jobs/jobPostings/{}", self.api_base, posting),
            ProbeMode::Page => job
                .link
                .clone()
                .filter(|link| on_domain(link, &self.target_domain))
                .unwrap_or_else(|| format!("{}/{}/", self.page_base, posting)),
        }
    }
}

/// True when `link` is an http(s) URL whose host is `domain` or a subdomain
/// of it.
fn on_domain(link: &str, domain: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(link) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    url.host_str()
        .map(str::to_ascii_lowercase)
        .is_some_and(|host| host == domain || host.ends_with(&format!(".{}", domain)))
}

#[async_trait]
impl PostingProbe for LinkedInProbe {
    async fn check(&self, session: &Session, job: &JobRecord) -> Result<PostingState> {
        let url = self.url_for(job);
        let mut request = self
            .client
            .get(&url)
            .header("cookie", &session.cookie_header)
            .header("csrf-token", &session.anti_forgery_token);
        if self.mode == ProbeMode::Api {
            request = request
                .header("accept", "application/json")
                .header("x-restli-protocol-version", "2.0.0");
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(job_id = %job.id, %status, "posting check response");

        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => return Ok(PostingState::Gone),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(AppError::CredentialUnavailable(format!(
                    "upstream rejected session with {}",
                    status
                )));
            }
            s if !s.is_success() => {
                return Err(AppError::ExternalCheckFailed(format!("{} from {}", s, url)));
            }
            _ => {}
        }

        let body = response.text().await?;
        match self.mode {
            ProbeMode::Api => classify_posting_json(&body),
            ProbeMode::Page => Ok(classify_posting_page(&body)),
        }
    }
}

/// The upstream posting id: taken from the apply link when it is a job-view
/// URL, otherwise the job id itself.
pub fn posting_id(job: &JobRecord) -> String {
    static VIEW_ID: OnceLock<Regex> = OnceLock::new();
    let re = VIEW_ID.get_or_init(|| {
        Regex::new(r"(?:/jobs/view/(?:[^/?#]*-)?|currentJobId=)(\d+)").expect("valid regex")
    });

    job.link
        .as_deref()
        .and_then(|link| re.captures(link))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| job.id.to_string())
}

pub fn classify_posting_json(body: &str) -> Result<PostingState> {
    let json: Value = serde_json::from_str(body)
        .map_err(|e| AppError::ExternalCheckFailed(format!("unparseable posting record: {}", e)))?;

    if json.pointer("/applyingInfo/closed").and_then(Value::as_bool) == Some(true) {
        return Ok(PostingState::Closed);
    }
    if let Some(state) = json.get("jobState").and_then(Value::as_str) {
        return Ok(if state.eq_ignore_ascii_case("LISTED") {
            PostingState::Open
        } else {
            PostingState::Closed
        });
    }
    if body.to_lowercase().contains(CLOSED_MARKER) {
        return Ok(PostingState::Closed);
    }
    Ok(PostingState::Open)
}

pub fn classify_posting_page(html: &str) -> PostingState {
    let document = Html::parse_document(html);

    // The closed-job figure only renders for closed postings; the error
    // banners are shared with other messages and need the marker text.
    let closed_only = ["figure.closed-job", ".closed-job__flavor--closed"];
    let banners = [".jobs-details-top-card__apply-error", ".artdeco-inline-feedback--error"];

    for selector in closed_only.iter().filter_map(|s| Selector::parse(s).ok()) {
        if document.select(&selector).next().is_some() {
            return PostingState::Closed;
        }
    }
    for selector in banners.iter().filter_map(|s| Selector::parse(s).ok()) {
        let closed = document.select(&selector).any(|element| {
            element.text().collect::<String>().to_lowercase().contains(CLOSED_MARKER)
        });
        if closed {
            return PostingState::Closed;
        }
    }

    let text = document.root_element().text().collect::<String>().to_lowercase();
    if text.contains(CLOSED_MARKER) {
        PostingState::Closed
    } else {
        PostingState::Open
    }
}
