mod config;
mod db;
mod error;
mod filter;
mod flags;
mod freshness;
mod kv;
mod linkedin;
mod models;
mod query;
mod service;
mod session;
mod source;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use db::Database;
use error::AppError;
use flags::FlagStore;
use freshness::{FreshnessChecker, SystemClock, VerificationCache};
use kv::{KvStore, MemoryStore};
use linkedin::LinkedInProbe;
use models::{FlagKind, JobId, JobSummary, PageResult, Validity};
use query::{FlagFilter, ListParams, LocationFilter, QueryEngine, DEFAULT_LIMIT, DEFAULT_PROFILE};
use scraper::{Html, Selector};
use service::JobService;
use session::SessionProvider;
use source::{JsonRecordSource, RecordSource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "jobdeck")]
#[command(about = "Browse, flag and verify scraped job postings")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Load a JSON export of job records into the database
    Import {
        /// Path to a JSON array of job records
        file: PathBuf,
    },

    /// List jobs for a profile, newest first
    List {
        /// Profile tag (pm, py, ...)
        #[arg(short, long, default_value = DEFAULT_PROFILE)]
        profile: String,

        /// Zero-based page number
        #[arg(long, default_value_t = 0)]
        page: usize,

        #[arg(short, long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,

        /// Case-insensitive text matched against title, company, location and description
        #[arg(short, long)]
        search: Option<String>,

        /// 0 = any, 1 = not viewed, 2 = viewed only
        #[arg(long, default_value = "0")]
        viewed: FlagFilter,

        /// 0 = any, 1 = not applied, 2 = applied only
        #[arg(long, default_value = "0")]
        applied: FlagFilter,

        /// all, remote, or any location text
        #[arg(long, default_value = "all")]
        location: LocationFilter,

        /// Only jobs whose last check was true, false or unknown
        #[arg(long)]
        valid: Option<Validity>,

        /// Print the page as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show job details
    Show {
        /// Job ID
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// Mark a job as viewed
    View { id: String },

    /// Clear the viewed mark
    Unview { id: String },

    /// Mark a job as applied
    Apply { id: String },

    /// Clear the applied mark
    Unapply { id: String },

    /// Hide a job from listings
    Ignore { id: String },

    /// Show an ignored job in listings again
    Unignore { id: String },

    /// Check whether a posting is still open upstream
    Verify {
        /// Job ID
        id: String,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn,jobdeck=info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_service(config: &Config) -> Result<JobService> {
    // An ephemeral run fed from a JSON export never touches SQLite.
    let db = if config.ephemeral && config.jobs_file.is_some() {
        None
    } else {
        let db = Database::open(config.db.clone())?;
        db.ensure_initialized()?;
        Some(Arc::new(db))
    };

    let store: Arc<dyn KvStore> = match &db {
        Some(db) if !config.ephemeral => db.clone(),
        _ => Arc::new(MemoryStore::new()),
    };

    let records: Arc<dyn RecordSource> = match (&config.jobs_file, &db) {
        (Some(path), _) => Arc::new(
            JsonRecordSource::open(path)
                .with_context(|| format!("Failed to load jobs from {}", path.display()))?,
        ),
        (None, Some(db)) => db.clone(),
        (None, None) => return Err(anyhow!("No job source configured.")),
    };

    let credentials = config
        .credential_source(store.clone())
        .context("Failed to set up credential source")?;
    let sessions = Arc::new(SessionProvider::new(credentials, config.target_domain.clone()));
    let probe = Arc::new(
        LinkedInProbe::new(
            config.api_base.clone(),
            config.target_domain.clone(),
            config.probe,
            config.http_timeout(),
        )
        .context("Failed to set up posting probe")?,
    );

    let flags = Arc::new(FlagStore::new(store.clone()));
    let query = QueryEngine::new(
        records.clone(),
        flags.clone(),
        Arc::new(VerificationCache::new(store.clone())),
    );
    let freshness = FreshnessChecker::new(
        VerificationCache::new(store),
        sessions,
        probe,
        records.clone(),
        Arc::new(SystemClock),
        config.ttl(),
    );

    Ok(JobService::new(records, query, flags, freshness))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.config;

    match cli.command {
        Commands::Init => {
            let db = Database::open(config.db.clone())?;
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Import { file } => {
            let db = Database::open(config.db.clone())?;
            db.ensure_initialized()?;
            let records = source::read_records(&file)?;
            let count = db.import_jobs(&records)?;
            println!("Imported {} jobs from {}", count, file.display());
        }

        Commands::List {
            profile,
            page,
            limit,
            search,
            viewed,
            applied,
            location,
            valid,
            json,
        } => {
            let service = build_service(&config)?;
            let params = ListParams {
                profile,
                page,
                limit,
                search: search.unwrap_or_default(),
                viewed,
                applied,
                location,
                validity: valid,
            };
            let result = service.list(&params)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_page(&params, &result);
            }
        }

        Commands::Show { id, json } => {
            let service = build_service(&config)?;
            let id = JobId::new(id);
            match service.get(&id) {
                Ok(job) if json => println!("{}", serde_json::to_string_pretty(&job)?),
                Ok(job) => print_job(&job),
                Err(AppError::NotFound(_)) => println!("Job {} not found.", id),
                Err(e) => return Err(e.into()),
            }
        }

        Commands::View { id } => set_flag(&config, FlagKind::Viewed, id, true)?,
        Commands::Unview { id } => set_flag(&config, FlagKind::Viewed, id, false)?,
        Commands::Apply { id } => set_flag(&config, FlagKind::Applied, id, true)?,
        Commands::Unapply { id } => set_flag(&config, FlagKind::Applied, id, false)?,
        Commands::Ignore { id } => set_flag(&config, FlagKind::Ignored, id, true)?,
        Commands::Unignore { id } => set_flag(&config, FlagKind::Ignored, id, false)?,

        Commands::Verify { id, timeout_secs } => {
            let service = build_service(&config)?;
            let id = JobId::new(id);
            let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
            let cancel = async {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = deadline => {}
                }
            };
            let active = service.verify_until(&id, cancel).await?;
            println!("{}", serde_json::json!({ "active": active }));
        }
    }

    Ok(())
}

fn set_flag(config: &Config, kind: FlagKind, id: String, present: bool) -> Result<()> {
    let service = build_service(config)?;
    let id = JobId::new(id);
    match service.set_flag(kind, &id, present) {
        Ok(()) if present => println!("Marked job {} as {}.", id, kind),
        Ok(()) => println!("Cleared {} on job {}.", kind, id),
        Err(AppError::NotFound(_)) => println!("Job {} not found.", id),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn print_page(params: &ListParams, page: &PageResult) {
    if page.items.is_empty() {
        println!("No jobs found.");
        return;
    }

    println!(
        "{:<12} {:<3} {:<7} {:<10} {:<30} {:<18} {:<20}",
        "ID", "VA", "VALID", "POSTED", "TITLE", "COMPANY", "LOCATION"
    );
    println!("{}", "-".repeat(104));
    for job in &page.items {
        let marks = format!(
            "{}{}",
            if job.viewed { "v" } else { "-" },
            if job.applied { "a" } else { "-" }
        );
        println!(
            "{:<12} {:<3} {:<7} {:<10} {:<30} {:<18} {:<20}",
            truncate(job.id.as_str(), 12),
            marks,
            job.valid,
            job.created_at.format("%Y-%m-%d"),
            truncate(&job.title, 28),
            truncate(&job.company, 16),
            truncate(&job.location, 20)
        );
    }

    let start = params.page * params.limit;
    println!(
        "\nShowing {}-{} of {}",
        start + 1,
        start + page.items.len(),
        page.total
    );
    if page.has_more {
        println!("More: --page {}", params.page + 1);
    }
}

fn print_job(job: &JobSummary) {
    println!("Job {}", job.id);
    println!("Title: {}", job.title);
    if !job.company.is_empty() {
        println!("Company: {}", job.company);
    }
    if !job.location.is_empty() {
        println!("Location: {}", job.location);
    }
    println!("Profile: {}", job.mode);
    if let Some(link) = &job.link {
        println!("URL: {}", link);
    }
    println!("Posted: {}", job.created_at.format("%Y-%m-%d %H:%M"));
    let mut marks = Vec::new();
    if job.viewed {
        marks.push("viewed");
    }
    if job.applied {
        marks.push("applied");
    }
    if job.ignored {
        marks.push("ignored");
    }
    if job.stale {
        marks.push("stale");
    }
    if !marks.is_empty() {
        println!("Flags: {}", marks.join(", "));
    }
    println!("Still open: {}", job.valid);
    if let Some(summary) = job.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        println!("\n--- Summary ---\n{}", textwrap::fill(summary, 80));
    }
    let text = html_to_text(&job.html);
    if !text.is_empty() {
        println!("\n--- Description ---\n{}", text);
    }
}

/// Flattens posting HTML into wrapped paragraphs.
fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut paragraphs = Vec::new();

    if let Ok(blocks) = Selector::parse("p, li, h1, h2, h3, h4") {
        for block in fragment.select(&blocks) {
            let text = collapse(&block.text().collect::<Vec<_>>().join(" "));
            if text.is_empty() {
                continue;
            }
            if block.value().name() == "li" {
                paragraphs.push(textwrap::fill(&format!("- {}", text), 80));
            } else {
                paragraphs.push(textwrap::fill(&text, 80));
            }
        }
    }

    if paragraphs.is_empty() {
        let text = collapse(&fragment.root_element().text().collect::<Vec<_>>().join(" "));
        if !text.is_empty() {
            paragraphs.push(textwrap::fill(&text, 80));
        }
    }
    paragraphs.join("\n\n")
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
