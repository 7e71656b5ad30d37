use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::filter::{Field, Predicate};
use crate::flags::FlagStore;
use crate::freshness::VerificationCache;
use crate::models::{FlagKind, JobId, JobSummary, JobView, PageResult, Validity};
use crate::source::RecordSource;

pub const DEFAULT_PROFILE: &str = "pm";
pub const DEFAULT_LIMIT: usize = 20;

/// Tri-state filter over one flag: 0 = any, 1 = without the flag, 2 = only
/// with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlagFilter {
    #[default]
    Any,
    Without,
    Only,
}

impl TryFrom<u8> for FlagFilter {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0 => Ok(FlagFilter::Any),
            1 => Ok(FlagFilter::Without),
            2 => Ok(FlagFilter::Only),
            other => Err(format!("flag filter must be 0, 1 or 2, got {}", other)),
        }
    }
}

impl FromStr for FlagFilter {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let n: u8 = s.trim().parse().map_err(|_| format!("invalid flag filter '{}'", s))?;
        FlagFilter::try_from(n)
    }
}

impl FlagFilter {
    fn apply(self, kind: FlagKind, parts: &mut Vec<Predicate>) {
        match self {
            FlagFilter::Any => {}
            FlagFilter::Without => parts.push(Predicate::not(Predicate::Flag(kind))),
            FlagFilter::Only => parts.push(Predicate::Flag(kind)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LocationFilter {
    #[default]
    All,
    Remote,
    Matching(String),
}

impl FromStr for LocationFilter {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        Ok(if s.is_empty() || s.eq_ignore_ascii_case("all") {
            LocationFilter::All
        } else if s.eq_ignore_ascii_case("remote") {
            LocationFilter::Remote
        } else {
            LocationFilter::Matching(s.to_string())
        })
    }
}

#[derive(Debug, Clone)]
pub struct ListParams {
    pub profile: String,
    pub page: usize,
    pub limit: usize,
    pub search: String,
    pub viewed: FlagFilter,
    pub applied: FlagFilter,
    pub location: LocationFilter,
    pub validity: Option<Validity>,
}

impl Default for ListParams {
    fn default() -> Self {
        Self::new(DEFAULT_PROFILE)
    }
}

impl ListParams {
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            page: 0,
            limit: DEFAULT_LIMIT,
            search: String::new(),
            viewed: FlagFilter::Any,
            applied: FlagFilter::Any,
            location: LocationFilter::All,
            validity: None,
        }
    }

    /// Builds the full filter. Ignored jobs are always hidden, and stale jobs
    /// stay visible only once applied to.
    pub fn predicate(&self) -> Predicate {
        let mut parts = vec![
            Predicate::equals(Field::Mode, self.profile.clone()),
            Predicate::not(Predicate::Flag(FlagKind::Ignored)),
            Predicate::Or(vec![
                Predicate::not(Predicate::Stale),
                Predicate::Flag(FlagKind::Applied),
            ]),
        ];

        self.viewed.apply(FlagKind::Viewed, &mut parts);
        self.applied.apply(FlagKind::Applied, &mut parts);

        match &self.location {
            LocationFilter::All => {}
            LocationFilter::Remote => parts.push(Predicate::contains(Field::Location, "remote")),
            LocationFilter::Matching(text) => parts.push(Predicate::contains(Field::Location, text)),
        }

        let term = self.search.trim();
        if !term.is_empty() {
            parts.push(Predicate::Or(
                [Field::Title, Field::Company, Field::Location, Field::Description]
                    .into_iter()
                    .map(|field| Predicate::contains(field, term))
                    .collect(),
            ));
        }

        if let Some(validity) = self.validity {
            parts.push(Predicate::Validity(validity));
        }

        Predicate::And(parts)
    }
}

pub struct QueryEngine {
    records: Arc<dyn RecordSource>,
    flags: Arc<FlagStore>,
    verification: Arc<VerificationCache>,
}

impl QueryEngine {
    pub fn new(
        records: Arc<dyn RecordSource>,
        flags: Arc<FlagStore>,
        verification: Arc<VerificationCache>,
    ) -> Self {
        Self {
            records,
            flags,
            verification,
        }
    }

    /// One page of the filtered feed, newest first. Any failure fails the
    /// whole page.
    pub fn list(&self, params: &ListParams) -> Result<PageResult> {
        if params.limit == 0 {
            return Err(AppError::QueryFailed("limit must be at least 1".to_string()));
        }

        let predicate = params.predicate();
        let records = self.records.fetch(&predicate).map_err(query_failed)?;
        let viewed = self.flags.flagged(FlagKind::Viewed).map_err(query_failed)?;
        let applied = self.flags.flagged(FlagKind::Applied).map_err(query_failed)?;
        let ignored = self.flags.flagged(FlagKind::Ignored).map_err(query_failed)?;
        let join_validity = predicate.uses_validity();

        let mut hits = Vec::new();
        for record in &records {
            let validity = if join_validity {
                self.verification.validity(&record.id).map_err(query_failed)?
            } else {
                Validity::Unknown
            };
            let view = JobView {
                record,
                viewed: viewed.contains(&record.id),
                applied: applied.contains(&record.id),
                ignored: ignored.contains(&record.id),
                validity,
            };
            if predicate.matches(&view) {
                hits.push(view);
            }
        }

        hits.sort_by(|a, b| {
            b.record
                .created_at
                .cmp(&a.record.created_at)
                .then(a.record.seq.cmp(&b.record.seq))
        });

        let total = hits.len();
        let start = params.page.saturating_mul(params.limit);
        let mut items = Vec::with_capacity(params.limit.min(total));
        for mut view in hits.into_iter().skip(start).take(params.limit) {
            if !join_validity {
                view.validity = self.verification.validity(&view.record.id).map_err(query_failed)?;
            }
            items.push(JobSummary::from(view));
        }

        let has_more = params
            .page
            .saturating_add(1)
            .saturating_mul(params.limit)
            < total;

        debug!(
            profile = %params.profile,
            page = params.page,
            scanned = records.len(),
            total,
            returned = items.len(),
            "listed jobs"
        );

        Ok(PageResult {
            items,
            total,
            has_more,
        })
    }

    /// A single job regardless of visibility rules.
    pub fn get(&self, id: &JobId) -> Result<JobSummary> {
        let record = self
            .records
            .get(id)
            .map_err(query_failed)?
            .ok_or_else(|| AppError::NotFound(id.to_string()))?;

        let view = JobView {
            record: &record,
            viewed: self.flags.has_flag(FlagKind::Viewed, id)?,
            applied: self.flags.has_flag(FlagKind::Applied, id)?,
            ignored: self.flags.has_flag(FlagKind::Ignored, id)?,
            validity: self.verification.validity(id)?,
        };
        Ok(JobSummary::from(view))
    }

    /// Whether a job exists in the collection at all.
    pub fn exists(&self, id: &JobId) -> Result<bool> {
        Ok(self.records.get(id).map_err(query_failed)?.is_some())
    }
}

fn query_failed(e: AppError) -> AppError {
    match e {
        AppError::QueryFailed(_) => e,
        other => AppError::QueryFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::kv::{KvStore, MemoryStore};
    use crate::models::{JobRecord, VerificationRecord};
    use crate::source::JsonRecordSource;
    use chrono::{DateTime, Duration, Utc};
    use serde_json::json;
    use std::collections::HashSet;

    fn base() -> DateTime<Utc> {
        DateTime::from_timestamp(1_714_000_000, 0).unwrap()
    }

    fn job(id: &str, mode: &str, minutes: i64) -> JobRecord {
        let created = base() + Duration::minutes(minutes);
        serde_json::from_value(json!({
            "id": id,
            "title": format!("Role {}", id),
            "company": "Globex",
            "locations": ["Berlin, Germany"],
            "description": "A role",
            "mode": mode,
            "created_at": created,
            "updated_at": created
        }))
        .unwrap()
    }

    struct Fixture {
        kv: Arc<MemoryStore>,
        flags: Arc<FlagStore>,
        engine: QueryEngine,
    }

    fn fixture(records: Vec<JobRecord>) -> Fixture {
        let kv = Arc::new(MemoryStore::new());
        let flags = Arc::new(FlagStore::new(kv.clone()));
        let engine = QueryEngine::new(
            Arc::new(JsonRecordSource::from_records(records)),
            flags.clone(),
            Arc::new(VerificationCache::new(kv.clone())),
        );
        Fixture { kv, flags, engine }
    }

    /// 60 pm jobs: every 5th ignored, every 7th stale, stale ones divisible
    /// by 3 applied to; plus 10 py jobs.
    fn mixed() -> Fixture {
        let mut records: Vec<JobRecord> = (0..60)
            .map(|i| {
                let mut r = job(&format!("pm-{}", i), "pm", i);
                r.stale = i % 7 == 0;
                r
            })
            .collect();
        records.extend((0..10).map(|i| job(&format!("py-{}", i), "py", i)));
        let f = fixture(records);
        for i in 0..60 {
            let id = JobId::new(format!("pm-{}", i));
            if i % 5 == 0 {
                f.flags.set_flag(FlagKind::Ignored, &id, true).unwrap();
            }
            if i % 7 == 0 && i % 3 == 0 {
                f.flags.set_flag(FlagKind::Applied, &id, true).unwrap();
            }
        }
        f
    }

    fn ids(page: &PageResult) -> Vec<String> {
        page.items.iter().map(|j| j.id.to_string()).collect()
    }

    #[test]
    fn test_profile_page_respects_visibility_rule() {
        let f = mixed();
        let page = f.engine.list(&ListParams::new("pm")).unwrap();

        assert!(page.items.len() <= 20);
        for item in &page.items {
            assert_eq!(item.mode, "pm");
            assert!(!item.ignored);
            assert!(!item.stale || item.applied);
        }

        let expected = (0..60)
            .filter(|i| i % 5 != 0)
            .filter(|i| i % 7 != 0 || i % 3 == 0)
            .count();
        assert_eq!(page.total, expected);

        let big = f
            .engine
            .list(&ListParams {
                limit: 500,
                ..ListParams::new("pm")
            })
            .unwrap();
        assert_eq!(big.total, page.total);
        assert_eq!(big.items.len(), expected);
        assert!(!big.has_more);
    }

    #[test]
    fn test_stale_applied_job_stays_visible() {
        let f = mixed();
        let all = f
            .engine
            .list(&ListParams {
                limit: 100,
                ..ListParams::new("pm")
            })
            .unwrap();
        let seen: HashSet<String> = ids(&all).into_iter().collect();
        assert!(seen.contains("pm-21"));
        assert!(!seen.contains("pm-14"));
        assert!(!seen.contains("pm-10"));
    }

    #[test]
    fn test_sorted_newest_first() {
        let f = mixed();
        let page = f.engine.list(&ListParams::new("py")).unwrap();
        assert_eq!(page.items.first().unwrap().id.as_str(), "py-9");
        let times: Vec<_> = page.items.iter().map(|j| j.created_at).collect();
        assert!(times.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let f = fixture(vec![job("b", "pm", 0), job("a", "pm", 0), job("c", "pm", 0)]);
        let page = f.engine.list(&ListParams::new("pm")).unwrap();
        assert_eq!(ids(&page), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_has_more_boundary() {
        let f = fixture((0..45).map(|i| job(&i.to_string(), "pm", i)).collect());
        let page1 = f
            .engine
            .list(&ListParams {
                page: 1,
                ..ListParams::new("pm")
            })
            .unwrap();
        assert_eq!(page1.total, 45);
        assert_eq!(page1.items.len(), 20);
        assert!(page1.has_more);

        let page2 = f
            .engine
            .list(&ListParams {
                page: 2,
                ..ListParams::new("pm")
            })
            .unwrap();
        assert_eq!(page2.items.len(), 5);
        assert!(!page2.has_more);

        let beyond = f
            .engine
            .list(&ListParams {
                page: 9,
                ..ListParams::new("pm")
            })
            .unwrap();
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.total, 45);
    }

    #[test]
    fn test_pages_are_disjoint_contiguous_windows() {
        let f = mixed();
        let params = |page| ListParams {
            page,
            limit: 10,
            ..ListParams::new("pm")
        };
        let p0 = ids(&f.engine.list(&params(0)).unwrap());
        let p1 = ids(&f.engine.list(&params(1)).unwrap());
        let both = ids(
            &f.engine
                .list(&ListParams {
                    limit: 20,
                    ..ListParams::new("pm")
                })
                .unwrap(),
        );

        assert_eq!([p0.clone(), p1.clone()].concat(), both);
        let overlap: HashSet<_> = p0.iter().filter(|id| p1.contains(id)).collect();
        assert!(overlap.is_empty());
    }

    #[test]
    fn test_search_matches_any_text_field() {
        let mut title = job("t", "pm", 1);
        title.title = "ACME Product Lead".to_string();
        let mut company = job("c", "pm", 2);
        company.company = "Acme Inc".to_string();
        let mut location = job("l", "pm", 3);
        location.locations = vec!["Acmeville".to_string()];
        let mut description = job("d", "pm", 4);
        description.description = "Join the acme team".to_string();
        let other = job("o", "pm", 5);
        let f = fixture(vec![title, company, location, description, other]);

        let page = f
            .engine
            .list(&ListParams {
                search: "acme".to_string(),
                ..ListParams::new("pm")
            })
            .unwrap();
        let mut got = ids(&page);
        got.sort();
        assert_eq!(got, vec!["c", "d", "l", "t"]);
        assert_eq!(page.total, 4);
    }

    #[test]
    fn test_blank_search_is_no_filter() {
        let f = fixture(vec![job("1", "pm", 0), job("2", "pm", 1)]);
        let page = f
            .engine
            .list(&ListParams {
                search: "   ".to_string(),
                ..ListParams::new("pm")
            })
            .unwrap();
        assert_eq!(page.total, 2);
    }

    #[test]
    fn test_viewed_and_applied_tri_states() {
        let f = fixture((0..4).map(|i| job(&i.to_string(), "pm", i)).collect());
        f.flags.set_flag(FlagKind::Viewed, &JobId::new("0"), true).unwrap();
        f.flags.set_flag(FlagKind::Viewed, &JobId::new("1"), true).unwrap();
        f.flags.set_flag(FlagKind::Applied, &JobId::new("1"), true).unwrap();

        let run = |viewed: u8, applied: u8| {
            let mut got = ids(&f
                .engine
                .list(&ListParams {
                    viewed: FlagFilter::try_from(viewed).unwrap(),
                    applied: FlagFilter::try_from(applied).unwrap(),
                    ..ListParams::new("pm")
                })
                .unwrap());
            got.sort();
            got
        };

        assert_eq!(run(0, 0), vec!["0", "1", "2", "3"]);
        assert_eq!(run(1, 0), vec!["2", "3"]);
        assert_eq!(run(2, 0), vec!["0", "1"]);
        assert_eq!(run(2, 1), vec!["0"]);
        assert_eq!(run(0, 2), vec!["1"]);
    }

    #[test]
    fn test_location_filters() {
        let mut remote = job("r", "pm", 0);
        remote.locations = vec!["Munich".to_string(), "REMOTE (EU)".to_string()];
        let mut hamburg = job("h", "pm", 1);
        hamburg.locations = vec!["Hamburg, Germany".to_string()];
        let f = fixture(vec![remote, hamburg]);

        let run = |location: &str| {
            ids(&f
                .engine
                .list(&ListParams {
                    location: location.parse().unwrap(),
                    ..ListParams::new("pm")
                })
                .unwrap())
        };

        assert_eq!(run("all").len(), 2);
        assert_eq!(run("remote"), vec!["r"]);
        assert_eq!(run("hamburg"), vec!["h"]);
        assert_eq!(run("germany"), vec!["h"]);
        assert!(run("paris").is_empty());
    }

    #[test]
    fn test_validity_filter_and_annotation() {
        let f = fixture(vec![job("1", "pm", 0), job("2", "pm", 1)]);
        let cache = VerificationCache::new(f.kv.clone());
        cache
            .put(
                &JobId::new("1"),
                &VerificationRecord {
                    valid: Validity::Invalid,
                    when: base(),
                },
            )
            .unwrap();

        let closed = f
            .engine
            .list(&ListParams {
                validity: Some(Validity::Invalid),
                ..ListParams::new("pm")
            })
            .unwrap();
        assert_eq!(ids(&closed), vec!["1"]);

        let all = f.engine.list(&ListParams::new("pm")).unwrap();
        let by_id: Vec<(String, Validity)> =
            all.items.iter().map(|j| (j.id.to_string(), j.valid)).collect();
        assert_eq!(
            by_id,
            vec![
                ("2".to_string(), Validity::Unknown),
                ("1".to_string(), Validity::Invalid)
            ]
        );
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        let f = fixture(vec![job("1", "pm", 0)]);
        let err = f
            .engine
            .list(&ListParams {
                limit: 0,
                ..ListParams::new("pm")
            })
            .unwrap_err();
        assert!(matches!(err, AppError::QueryFailed(_)));
    }

    #[test]
    fn test_store_outage_fails_whole_page() {
        let f = fixture(vec![job("1", "pm", 0)]);
        f.kv.set_offline(true);
        let err = f.engine.list(&ListParams::new("pm")).unwrap_err();
        assert!(matches!(err, AppError::QueryFailed(_)));
    }

    #[test]
    fn test_get_returns_hidden_jobs_and_not_found() {
        let f = fixture(vec![job("1", "pm", 0)]);
        f.flags.set_flag(FlagKind::Ignored, &JobId::new("1"), true).unwrap();
        let summary = f.engine.get(&JobId::new("1")).unwrap();
        assert!(summary.ignored);
        assert_eq!(summary.html, "A role");
        assert!(summary.description.is_empty());

        assert!(matches!(
            f.engine.get(&JobId::new("missing")),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_sqlite_source_matches_in_memory_source() {
        let records: Vec<JobRecord> = (0..30)
            .map(|i| {
                let mut r = job(&format!("j{}", i), if i % 3 == 0 { "py" } else { "pm" }, i % 10);
                if i % 4 == 0 {
                    r.locations = vec!["Remote".to_string()];
                }
                r.stale = i % 11 == 0;
                r
            })
            .collect();

        let db = Arc::new(Database::open_in_memory().unwrap());
        db.init().unwrap();
        db.import_jobs(&records).unwrap();
        db.put("flags:viewed", &json!({"j1": true, "j2": true})).unwrap();
        let flags = Arc::new(FlagStore::new(db.clone()));
        let sqlite = QueryEngine::new(
            db.clone(),
            flags,
            Arc::new(VerificationCache::new(db.clone())),
        );

        let memory = fixture(records);
        memory.kv.put("flags:viewed", &json!({"j1": true, "j2": true})).unwrap();

        let params = ListParams {
            location: LocationFilter::Remote,
            viewed: FlagFilter::Without,
            limit: 5,
            ..ListParams::new("pm")
        };
        for page in 0..3 {
            let params = ListParams { page, ..params.clone() };
            let a = sqlite.list(&params).unwrap();
            let b = memory.engine.list(&params).unwrap();
            assert_eq!(ids(&a), ids(&b));
            assert_eq!(a.total, b.total);
            assert_eq!(a.has_more, b.has_more);
        }
    }
}
