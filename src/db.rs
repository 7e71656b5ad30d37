use anyhow::{anyhow, Result};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::error::AppError;
use crate::filter::Predicate;
use crate::kv::KvStore;
use crate::models::{JobId, JobRecord};
use crate::source::RecordSource;

const JOB_COLUMNS: &str = "seq, id, mode, title, company, locations, html, description,
                           link, logo, summary, stale, created_at, updated_at";

/// SQLite database holding the job collection and the key-value table.
pub struct Database {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Database {
    pub fn open(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(p) => p,
            None => Self::default_path()?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn default_path() -> Result<PathBuf> {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "jobdeck") {
            Ok(proj_dirs.data_dir().join("jobdeck.db"))
        } else {
            Ok(PathBuf::from("jobdeck.db"))
        }
    }

    fn conn(&self) -> std::result::Result<MutexGuard<'_, Connection>, AppError> {
        self.conn
            .lock()
            .map_err(|_| AppError::StoreUnavailable("database lock poisoned".to_string()))
    }

    pub fn init(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                mode TEXT NOT NULL,
                title TEXT NOT NULL,
                company TEXT NOT NULL DEFAULT '',
                locations TEXT NOT NULL DEFAULT '[]',
                html TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                link TEXT,
                logo TEXT,
                summary TEXT,
                stale INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_mode ON jobs(mode);
            CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('jobs', 'kv')",
            [],
            |row| row.get(0),
        )?;
        if tables < 2 {
            return Err(anyhow!(
                "Database not initialized. Run 'jobdeck init' first."
            ));
        }
        Ok(())
    }

    // --- Job operations ---

    /// Inserts or refreshes records by id. Existing rows keep their `seq`.
    pub fn import_jobs(&self, records: &[JobRecord]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO jobs (id, mode, title, company, locations, html, description,
                                   link, logo, summary, stale, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(id) DO UPDATE SET
                    mode = excluded.mode,
                    title = excluded.title,
                    company = excluded.company,
                    locations = excluded.locations,
                    html = excluded.html,
                    description = excluded.description,
                    link = excluded.link,
                    logo = excluded.logo,
                    summary = excluded.summary,
                    stale = excluded.stale,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at",
            )?;
            for r in records {
                stmt.execute(params![
                    r.id.as_str(),
                    r.mode,
                    r.title,
                    r.company,
                    serde_json::to_string(&r.locations)?,
                    r.html,
                    r.description,
                    r.link,
                    r.logo,
                    r.summary,
                    r.stale,
                    r.created_at,
                    r.updated_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<JobRecord> {
        let locations: String = row.get(5)?;
        let locations = serde_json::from_str(&locations)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
        let id: String = row.get(1)?;
        Ok(JobRecord {
            seq: row.get(0)?,
            id: JobId::new(id),
            mode: row.get(2)?,
            title: row.get(3)?,
            company: row.get(4)?,
            locations,
            html: row.get(6)?,
            description: row.get(7)?,
            link: row.get(8)?,
            logo: row.get(9)?,
            summary: row.get(10)?,
            stale: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }
}

impl RecordSource for Database {
    fn fetch(&self, predicate: &Predicate) -> std::result::Result<Vec<JobRecord>, AppError> {
        let mut sql = format!("SELECT {} FROM jobs", JOB_COLUMNS);
        let mut params: Vec<String> = vec![];
        if let Some(pushed) = predicate.pushdown() {
            sql.push_str(" WHERE ");
            sql.push_str(&pushed.clause);
            params = pushed.params;
        }
        sql.push_str(" ORDER BY seq");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), Self::row_to_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get(&self, id: &JobId) -> std::result::Result<Option<JobRecord>, AppError> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                [id.as_str()],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }
}

impl KvStore for Database {
    fn get(&self, key: &str) -> std::result::Result<Option<Value>, AppError> {
        let raw: Option<String> = self
            .conn()?
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        match raw {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| AppError::StoreUnavailable(format!("corrupt value for '{}': {}", key, e))),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &Value) -> std::result::Result<(), AppError> {
        self.conn()?.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
            params![key, value.to_string()],
        )?;
        Ok(())
    }
}
