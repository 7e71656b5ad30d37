use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque job identifier. Integer ids from older exports are carried as
/// their decimal string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Int(i64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => JobId(s),
            Raw::Int(n) => JobId(n.to_string()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub title: String,
    #[serde(default)]
    pub company: String,
    #[serde(
        default,
        alias = "location",
        deserialize_with = "one_or_many",
        rename = "locations"
    )]
    pub locations: Vec<String>,
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default, alias = "createdAt", alias = "created")]
    pub created_at: DateTime<Utc>,
    #[serde(default, alias = "updatedAt", alias = "updated")]
    pub updated_at: DateTime<Utc>,
    pub mode: String, // profile tag, e.g. "pm" or "py"
    #[serde(default)]
    pub stale: bool,
    /// Insertion ordinal, the tie-breaker when two records share `created_at`.
    #[serde(skip)]
    pub seq: i64,
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Missing(Option<()>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
        OneOrMany::Missing(_) => Vec::new(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagKind {
    Viewed,
    Applied,
    Ignored,
}

impl FlagKind {
    pub const ALL: [FlagKind; 3] = [FlagKind::Viewed, FlagKind::Applied, FlagKind::Ignored];

    pub fn as_str(&self) -> &'static str {
        match self {
            FlagKind::Viewed => "viewed",
            FlagKind::Applied => "applied",
            FlagKind::Ignored => "ignored",
        }
    }
}

impl fmt::Display for FlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the most recent freshness check. Serialized as `null`, `true`
/// or `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum Validity {
    #[default]
    Unknown,
    Valid,
    Invalid,
}

impl Validity {
    pub fn is_known(&self) -> bool {
        !matches!(self, Validity::Unknown)
    }
}

impl From<Option<bool>> for Validity {
    fn from(v: Option<bool>) -> Self {
        match v {
            None => Validity::Unknown,
            Some(true) => Validity::Valid,
            Some(false) => Validity::Invalid,
        }
    }
}

impl From<Validity> for Option<bool> {
    fn from(v: Validity) -> Self {
        match v {
            Validity::Unknown => None,
            Validity::Valid => Some(true),
            Validity::Invalid => Some(false),
        }
    }
}

impl FromStr for Validity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "true" | "valid" | "active" => Ok(Validity::Valid),
            "false" | "invalid" | "closed" => Ok(Validity::Invalid),
            "null" | "unknown" => Ok(Validity::Unknown),
            other => Err(format!("unknown validity '{}'", other)),
        }
    }
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Validity::Unknown => "unknown",
            Validity::Valid => "active",
            Validity::Invalid => "closed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub valid: Validity,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub when: DateTime<Utc>,
}

impl Default for VerificationRecord {
    fn default() -> Self {
        Self {
            valid: Validity::Unknown,
            when: DateTime::<Utc>::default(),
        }
    }
}

/// A record joined with its triage flags and last known validity.
#[derive(Debug, Clone, Copy)]
pub struct JobView<'a> {
    pub record: &'a JobRecord,
    pub viewed: bool,
    pub applied: bool,
    pub ignored: bool,
    pub validity: Validity,
}

/// Transport-facing shape of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: JobId,
    pub title: String,
    pub company: String,
    pub location: String,
    pub locations: Vec<String>,
    pub html: String,
    pub description: String,
    pub link: Option<String>,
    pub logo: Option<String>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub mode: String,
    pub stale: bool,
    pub viewed: bool,
    pub applied: bool,
    pub ignored: bool,
    pub valid: Validity,
}

impl From<JobView<'_>> for JobSummary {
    fn from(view: JobView<'_>) -> Self {
        let record = view.record;
        // The rich body falls back to the plain text; the plain text is never
        // sent alongside it.
        let html = if record.html.trim().is_empty() {
            record.description.clone()
        } else {
            record.html.clone()
        };

        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            company: record.company.clone(),
            location: record.locations.join(" / "),
            locations: record.locations.clone(),
            html,
            description: String::new(),
            link: record.link.clone(),
            logo: record.logo.clone(),
            summary: record.summary.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            mode: record.mode.clone(),
            stale: record.stale,
            viewed: view.viewed,
            applied: view.applied,
            ignored: view.ignored,
            valid: view.validity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult {
    pub items: Vec<JobSummary>,
    pub total: usize,
    pub has_more: bool,
}

/// One entry of a browser cookie export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: Option<bool>,
    #[serde(default)]
    pub http_only: Option<bool>,
    #[serde(default)]
    pub expiry: Option<f64>,
}
