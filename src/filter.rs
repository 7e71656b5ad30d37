//! Typed filter expressions over job records.
//!
//! A `Predicate` is always evaluated in memory against a `JobView`. Sources
//! that can narrow their result set early (SQLite) ask for `pushdown()`, which
//! compiles the column-only part of the tree into a parameterized `WHERE`
//! clause. Pushdown is allowed to match more rows than the full predicate,
//! never fewer, because every returned row is checked again.

use crate::models::{FlagKind, JobRecord, JobView, Validity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Mode,
    Title,
    Company,
    Location,
    Description,
}

impl Field {
    fn column(&self) -> &'static str {
        match self {
            Field::Mode => "mode",
            Field::Title => "title",
            Field::Company => "company",
            Field::Location => "locations",
            Field::Description => "description",
        }
    }

    fn values<'a>(&self, record: &'a JobRecord) -> Vec<&'a str> {
        match self {
            Field::Mode => vec![record.mode.as_str()],
            Field::Title => vec![record.title.as_str()],
            Field::Company => vec![record.company.as_str()],
            Field::Location => record.locations.iter().map(String::as_str).collect(),
            Field::Description => vec![record.description.as_str()],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    /// Exact match on any value of the field.
    Equals(Field, String),
    /// Case-insensitive substring match on any value of the field. The needle
    /// is stored lowercased.
    Contains(Field, String),
    Flag(FlagKind),
    Stale,
    Validity(Validity),
}

/// A parameterized SQL condition. User text only ever travels in `params`.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlWhere {
    pub clause: String,
    pub params: Vec<String>,
}

impl Predicate {
    pub fn equals(field: Field, value: impl Into<String>) -> Self {
        Predicate::Equals(field, value.into())
    }

    pub fn contains(field: Field, needle: &str) -> Self {
        Predicate::Contains(field, needle.to_lowercase())
    }

    pub fn not(inner: Predicate) -> Self {
        Predicate::Not(Box::new(inner))
    }

    pub fn matches(&self, view: &JobView<'_>) -> bool {
        match self {
            Predicate::All => true,
            Predicate::And(parts) => parts.iter().all(|p| p.matches(view)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(view)),
            Predicate::Not(inner) => !inner.matches(view),
            Predicate::Equals(field, value) => {
                field.values(view.record).into_iter().any(|v| v == value)
            }
            Predicate::Contains(field, needle) => field
                .values(view.record)
                .into_iter()
                .any(|v| v.to_lowercase().contains(needle.as_str())),
            Predicate::Flag(FlagKind::Viewed) => view.viewed,
            Predicate::Flag(FlagKind::Applied) => view.applied,
            Predicate::Flag(FlagKind::Ignored) => view.ignored,
            Predicate::Stale => view.record.stale,
            Predicate::Validity(v) => view.validity == *v,
        }
    }

    /// Whether the predicate needs per-record validity joined in.
    pub fn uses_validity(&self) -> bool {
        match self {
            Predicate::Validity(_) => true,
            Predicate::And(parts) | Predicate::Or(parts) => parts.iter().any(Self::uses_validity),
            Predicate::Not(inner) => inner.uses_validity(),
            _ => false,
        }
    }

    /// Compiles the column-only part of the predicate for the `jobs` table.
    /// Returns `None` when nothing can be pushed down.
    pub fn pushdown(&self) -> Option<SqlWhere> {
        match self {
            Predicate::All => None,
            Predicate::And(parts) => {
                let pushed: Vec<SqlWhere> = parts.iter().filter_map(Self::pushdown).collect();
                join(pushed, " AND ")
            }
            Predicate::Or(parts) => {
                let pushed: Option<Vec<SqlWhere>> = parts.iter().map(Self::pushdown).collect();
                join(pushed?, " OR ")
            }
            Predicate::Equals(Field::Location, _) => None,
            Predicate::Equals(field, value) => Some(SqlWhere {
                clause: format!("{} = ?", field.column()),
                params: vec![value.clone()],
            }),
            Predicate::Contains(field, needle) => {
                // SQLite LOWER() only folds ASCII, and locations are stored as
                // JSON text where quotes and backslashes are escaped.
                if !needle.is_ascii() {
                    return None;
                }
                if *field == Field::Location && needle.chars().any(|c| c == '"' || c == '\\' || c.is_control()) {
                    return None;
                }
                Some(SqlWhere {
                    clause: format!("LOWER({}) LIKE ? ESCAPE '\\'", field.column()),
                    params: vec![format!("%{}%", escape_like(needle))],
                })
            }
            Predicate::Stale => Some(SqlWhere {
                clause: "stale = 1".to_string(),
                params: vec![],
            }),
            Predicate::Not(_) | Predicate::Flag(_) | Predicate::Validity(_) => None,
        }
    }
}

fn join(parts: Vec<SqlWhere>, op: &str) -> Option<SqlWhere> {
    match parts.len() {
        0 => None,
        1 => parts.into_iter().next(),
        _ => {
            let clause = parts
                .iter()
                .map(|p| format!("({})", p.clause))
                .collect::<Vec<_>>()
                .join(op);
            let params = parts.into_iter().flat_map(|p| p.params).collect();
            Some(SqlWhere { clause, params })
        }
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
