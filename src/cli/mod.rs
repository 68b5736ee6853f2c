//! Command-line interface for lifelog-sync.
//!
//! Provides commands for running a sync batch, inspecting the ledger,
//! showing the resolved configuration, and previewing keyword matches.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::adapters::{
    build_backend, missing_credential, ArchivingSource, BackendSpec, DryRunSink, FileSource,
    LimitlessClient, NotionClient, RecordSink, TranscriptArchive, TranscriptSource,
    CALLS_PER_UPSERT,
};
use crate::config::{load_config, ResolvedConfig};
use crate::core::{
    BatchWindow, ExtractionInvoker, ItemTransformer, KeywordMatcher, Ledger, Orchestrator,
    TranscriptPipeline,
};
use crate::domain::{ItemKind, RunState};

/// Look-back used when neither a window nor a previous run is available
const DEFAULT_LOOKBACK_DAYS: u32 = 7;

/// lifelog-sync - turn voice transcripts into projects, tasks and todos
#[derive(Parser, Debug)]
#[command(name = "lifelog-sync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: search for .lifelog/config.yaml)
    #[arg(long, global = true, env = "LIFELOG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch, extract and upsert one batch of transcripts
    Run(RunArgs),

    /// Show ledger statistics
    Status,

    /// Show resolved configuration (secrets redacted)
    Config,

    /// Show keyword contexts without calling any backend
    Match {
        /// Transcript JSON file or directory of JSON files
        #[arg(long)]
        transcripts_path: PathBuf,

        /// Treat every transcript as a match
        #[arg(long)]
        no_keyword_filter: bool,
    },
}

#[derive(clap::Args, Debug, Default)]
pub struct RunArgs {
    /// Process transcripts from the past N days (default: since last run)
    #[arg(long, conflicts_with = "start")]
    pub days: Option<u32>,

    /// Window start (RFC 3339 or YYYY-MM-DD)
    #[arg(long)]
    pub start: Option<String>,

    /// Window end (RFC 3339 or YYYY-MM-DD, default: now)
    #[arg(long)]
    pub end: Option<String>,

    /// Read transcripts from a JSON file or directory instead of the API
    #[arg(long)]
    pub transcripts_path: Option<PathBuf>,

    /// Backends as provider:model (replaces the configured list)
    #[arg(long, num_args = 1..)]
    pub models: Vec<String>,

    /// Send whole transcripts instead of keyword contexts
    #[arg(long)]
    pub no_keyword_filter: bool,

    /// Transcripts processed concurrently
    #[arg(long)]
    pub workers: Option<usize>,

    /// Log records instead of writing them; the ledger is left untouched
    #[arg(long)]
    pub dry_run: bool,

    /// Save every fetched transcript as JSON under this directory
    #[arg(long)]
    pub archive_dir: Option<PathBuf>,

    /// Rewrite transcripts that are already in the archive
    #[arg(long, requires = "archive_dir")]
    pub force_archive: bool,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = load_config(self.config.as_deref())?;

        match self.command {
            Commands::Run(args) => run_batch(config, args).await,
            Commands::Status => show_status(&config),
            Commands::Config => show_config(&config),
            Commands::Match {
                transcripts_path,
                no_keyword_filter,
            } => show_matches(config, &transcripts_path, no_keyword_filter).await,
        }
    }
}

/// Apply run flags on top of the resolved configuration
pub fn apply_run_overrides(mut config: ResolvedConfig, args: &RunArgs) -> Result<ResolvedConfig> {
    if !args.models.is_empty() {
        config.backends = args
            .models
            .iter()
            .map(|m| BackendSpec::parse(m).map(|spec| spec.id()))
            .collect::<Result<Vec<_>>>()?;
    }
    if args.no_keyword_filter {
        config.keywords.filter_enabled = false;
    }
    if let Some(workers) = args.workers {
        config.limits.max_workers = workers;
    }
    Ok(config)
}

/// Parse an instant given as RFC 3339 or a bare date (midnight UTC)
pub fn parse_instant(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Ok(instant.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}': expected RFC 3339 or YYYY-MM-DD", value))?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .with_context(|| format!("Invalid date '{}'", value))
}

/// Work out the batch window from flags and the previous run
pub fn resolve_window(args: &RunArgs, state: &RunState, now: DateTime<Utc>) -> Result<BatchWindow> {
    let end = match args.end {
        Some(ref end) => parse_instant(end)?,
        None => now,
    };

    if let Some(days) = args.days {
        return BatchWindow::last_days(days, end);
    }
    if let Some(ref start) = args.start {
        return BatchWindow::new(parse_instant(start)?, end);
    }

    match state.last_run_timestamp {
        Some(last) if last < end => BatchWindow::new(last, end),
        _ => BatchWindow::last_days(DEFAULT_LOOKBACK_DAYS, end),
    }
}

fn build_source(config: &ResolvedConfig, args: &RunArgs) -> Result<Arc<dyn TranscriptSource>> {
    let source = fetch_source(config, args.transcripts_path.as_deref())?;
    Ok(match args.archive_dir {
        Some(ref dir) => Arc::new(ArchivingSource::new(
            source,
            TranscriptArchive::new(dir).with_force(args.force_archive),
        )),
        None => source,
    })
}

fn fetch_source(config: &ResolvedConfig, transcripts_path: Option<&Path>) -> Result<Arc<dyn TranscriptSource>> {
    if let Some(path) = transcripts_path {
        return Ok(Arc::new(FileSource::new(path)));
    }

    let api_key = config
        .limitless
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .context("LIMITLESS_API_KEY is not set (or pass --transcripts-path)")?;

    Ok(Arc::new(
        LimitlessClient::new(api_key, config.limitless.base_url.clone())
            .with_timeout(config.limits.request_timeout())
            .with_retry_policy(config.retry.clone()),
    ))
}

/// Notion sink whose databases have been checked, or the dry-run sink
async fn build_sink(config: &ResolvedConfig, dry_run: bool) -> Result<Arc<dyn RecordSink>> {
    if dry_run {
        return Ok(Arc::new(DryRunSink::new()));
    }

    let notion = NotionClient::new(
        config.notion.api_key.clone().unwrap_or_default(),
        config.notion.databases(),
    )
    .with_timeout(config.limits.request_timeout())
    .with_retry_policy(config.retry.clone());

    notion.verify().await.context("Notion databases are not usable")?;
    Ok(Arc::new(notion))
}

/// Wire the per-transcript pipeline from configuration.
///
/// A dry run skips backends whose credentials are missing, as long as one
/// usable backend remains.
pub fn build_pipeline(
    config: &ResolvedConfig,
    sink: Arc<dyn RecordSink>,
    dry_run: bool,
) -> Result<TranscriptPipeline> {
    let mut backends = Vec::new();
    for spec in config.backend_specs()? {
        match missing_credential(&spec, &config.api_keys) {
            Some(var) if dry_run => {
                warn!(backend = %spec, missing = var, "Skipping backend without credentials")
            }
            _ => backends.push(build_backend(&spec, &config.api_keys)?),
        }
    }
    if backends.is_empty() {
        anyhow::bail!("No configured backend has credentials; set at least one provider API key");
    }

    let keywords = Arc::new(config.keywords.clone());
    let invoker = ExtractionInvoker::new(
        backends,
        Arc::clone(&keywords),
        config.limits.clone(),
        config.retry.clone(),
    );

    Ok(TranscriptPipeline::new(
        KeywordMatcher::from_settings(&keywords),
        invoker,
        ItemTransformer::new(keywords),
        sink,
        config
            .retry
            .budget(config.limits.request_timeout())
            .saturating_mul(CALLS_PER_UPSERT),
    ))
}

async fn run_batch(config: ResolvedConfig, args: RunArgs) -> Result<()> {
    let config = apply_run_overrides(config, &args)?;
    config.validate(args.dry_run)?;

    let source = build_source(&config, &args)?;
    let pipeline = build_pipeline(&config, build_sink(&config, args.dry_run).await?, args.dry_run)?;

    let mut ledger = Ledger::load(&config.ledger_path)
        .with_context(|| format!("Failed to open ledger: {}", config.ledger_path.display()))?;
    let window = resolve_window(&args, ledger.state(), Utc::now())?;

    info!(
        backends = %config.backends.join(", "),
        workers = config.limits.max_workers,
        keyword_filter = config.keywords.filter_enabled,
        "Configured batch"
    );

    let summary = Orchestrator::new(source, pipeline, config.limits.clone())
        .with_dry_run(args.dry_run)
        .run(&mut ledger, window)
        .await?;

    print!("{}", summary);
    if !summary.failures.is_empty() {
        println!("\nFailures:");
        for failure in &summary.failures {
            println!(
                "  [{}] {} {}: {}",
                failure.stage, failure.transcript_id, failure.subject, failure.error
            );
        }
    }

    Ok(())
}

fn show_status(config: &ResolvedConfig) -> Result<()> {
    let state = Ledger::read_state(&config.ledger_path)?;

    println!("Ledger: {}", config.ledger_path.display());
    match state.last_run_timestamp {
        Some(ts) => println!("Last run: {}", ts.to_rfc3339()),
        None => println!("Last run: never"),
    }
    println!(
        "Transcripts processed: {}",
        state.statistics.total_transcripts_processed
    );
    println!("Items created:");
    for kind in ItemKind::ALL {
        println!(
            "  {:<8} {}",
            kind.as_str(),
            state.statistics.items_created.get(&kind).copied().unwrap_or(0)
        );
    }

    Ok(())
}

fn show_config(config: &ResolvedConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(&config.redacted()).context("Failed to render configuration")?;
    println!("{}", yaml);
    Ok(())
}

async fn show_matches(mut config: ResolvedConfig, path: &Path, no_keyword_filter: bool) -> Result<()> {
    if no_keyword_filter {
        config.keywords.filter_enabled = false;
    }
    let matcher = KeywordMatcher::from_settings(&config.keywords);

    // The file source ignores the range
    let now = Utc::now();
    let transcripts = FileSource::new(path).fetch(now, now).await?;

    for transcript in &transcripts {
        let matches: Vec<_> = matcher.matches(transcript).collect();
        println!("{} ({} matches)", transcript.id, matches.len());
        for m in &matches {
            println!("  {}", m.full_context());
        }
    }

    Ok(())
}
