//! Batch orchestrator.
//!
//! Coordinates one batch run:
//! - Fetch the window's transcripts from the source (failure is fatal)
//! - Skip transcripts the ledger already holds, before anything is spawned
//! - Run per-transcript pipelines concurrently, bounded by `max_workers`
//! - Commit each finished transcript to the ledger from this loop only
//! - Stop on cancellation or the batch timeout, leaving in-flight work unrecorded
//!
//! The timestamp recorded with each commit is a resume point: the batch end
//! once nothing is outstanding, otherwise the earliest unfinished transcript's
//! timestamp, so a window resumed from the ledger still covers interrupted work.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::ledger::Ledger;
use super::pipeline::{TranscriptPipeline, TranscriptReport};
use super::safety::Limits;
use crate::adapters::TranscriptSource;
use crate::domain::{RunSummary, Transcript};

/// Time range a batch covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BatchWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            anyhow::bail!("Batch start {} is not before end {}", start, end);
        }
        Ok(Self { start, end })
    }

    /// The `days` days ending at `end`
    pub fn last_days(days: u32, end: DateTime<Utc>) -> Result<Self> {
        let start = Duration::try_days(i64::from(days))
            .and_then(|span| end.checked_sub_signed(span))
            .with_context(|| format!("{days} days before {end} is out of range"))?;
        Self::new(start, end)
    }

    /// Where a later batch must start so none of `outstanding` is skipped
    fn resume_point(&self, outstanding: &BTreeSet<(DateTime<Utc>, String)>) -> DateTime<Utc> {
        match outstanding.first() {
            // Sources filter on whole seconds
            Some((earliest, _)) => earliest.trunc_subsecs(0).clamp(self.start, self.end),
            None => self.end,
        }
    }
}

/// Main batch orchestrator
pub struct Orchestrator {
    source: Arc<dyn TranscriptSource>,
    pipeline: TranscriptPipeline,
    limits: Limits,
    dry_run: bool,
}

impl Orchestrator {
    pub fn new(source: Arc<dyn TranscriptSource>, pipeline: TranscriptPipeline, limits: Limits) -> Self {
        Self {
            source,
            pipeline,
            limits,
            dry_run: false,
        }
    }

    /// In dry-run mode the ledger is consulted but never written
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Run a batch, cancelling on Ctrl-C
    pub async fn run(&self, ledger: &mut Ledger, window: BatchWindow) -> Result<RunSummary> {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                // Without a signal handler the batch simply runs to completion
                warn!(error = %e, "Could not install Ctrl-C handler");
                std::future::pending::<()>().await;
            }
        };
        self.run_until(ledger, window, ctrl_c).await
    }

    /// Run a batch until it finishes or `shutdown` resolves
    #[instrument(skip(self, ledger, shutdown), fields(source = %self.source.name(), start = %window.start, end = %window.end, dry_run = self.dry_run))]
    pub async fn run_until<F>(&self, ledger: &mut Ledger, window: BatchWindow, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let mut summary = RunSummary {
            dry_run: self.dry_run,
            ..Default::default()
        };

        tokio::pin!(shutdown);
        let deadline = tokio::time::sleep(self.limits.run_timeout());
        tokio::pin!(deadline);

        let transcripts = tokio::select! {
            fetched = self.source.fetch(window.start, window.end) => {
                fetched.with_context(|| format!("Failed to fetch transcripts from {}", self.source.name()))?
            }
            _ = &mut shutdown => {
                warn!("Cancelled while fetching transcripts");
                summary.cancelled = true;
                return Ok(summary);
            }
            _ = &mut deadline => {
                anyhow::bail!("Batch timed out after {}s while fetching transcripts", self.limits.run_timeout_seconds);
            }
        };

        summary.transcripts_fetched = transcripts.len();
        let mut queue = self.pending(ledger, transcripts, &mut summary);
        let timestamps: HashMap<String, DateTime<Utc>> =
            queue.iter().map(|t| (t.id.clone(), t.timestamp)).collect();
        // Aborted and panicked transcripts never leave this set
        let mut outstanding: BTreeSet<(DateTime<Utc>, String)> =
            queue.iter().map(|t| (t.timestamp, t.id.clone())).collect();
        info!(
            fetched = summary.transcripts_fetched,
            skipped = summary.skipped_already_processed,
            pending = queue.len(),
            "Starting batch"
        );

        let workers = self.limits.max_workers.max(1);
        let mut set = JoinSet::new();
        while set.len() < workers {
            match queue.pop_front() {
                Some(transcript) => self.spawn(&mut set, transcript),
                None => break,
            }
        }

        loop {
            tokio::select! {
                joined = set.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok(report) => {
                            if let Some(ts) = timestamps.get(&report.transcript_id) {
                                outstanding.remove(&(*ts, report.transcript_id.clone()));
                            }
                            let resume_at = window.resume_point(&outstanding);
                            self.commit(ledger, &mut summary, report, resume_at)?;
                        }
                        // The transcript stays unrecorded and is retried next run
                        Err(e) => error!(error = %e, "Transcript pipeline aborted"),
                    }
                    if let Some(transcript) = queue.pop_front() {
                        self.spawn(&mut set, transcript);
                    }
                }
                _ = &mut shutdown => {
                    warn!(in_flight = set.len(), queued = queue.len(), "Cancellation requested, stopping batch");
                    summary.cancelled = true;
                    break;
                }
                _ = &mut deadline => {
                    warn!(
                        timeout_seconds = self.limits.run_timeout_seconds,
                        in_flight = set.len(),
                        "Batch timed out, stopping"
                    );
                    summary.cancelled = true;
                    break;
                }
            }
        }

        if summary.cancelled {
            set.abort_all();
            while set.join_next().await.is_some() {}
        }

        info!(
            processed = summary.transcripts_processed,
            items = summary.total_items_created(),
            failures = summary.failures.len(),
            cancelled = summary.cancelled,
            "Batch finished"
        );
        Ok(summary)
    }

    /// Drop processed and repeated transcripts, preserving source order
    fn pending(&self, ledger: &Ledger, transcripts: Vec<Transcript>, summary: &mut RunSummary) -> VecDeque<Transcript> {
        let mut seen = HashSet::new();
        transcripts
            .into_iter()
            .filter(|t| {
                if ledger.is_processed(&t.id) {
                    debug!(transcript = %t.id, "Already processed, skipping");
                    summary.skipped_already_processed += 1;
                    return false;
                }
                seen.insert(t.id.clone())
            })
            .collect()
    }

    fn spawn(&self, set: &mut JoinSet<TranscriptReport>, transcript: Transcript) {
        let pipeline = self.pipeline.clone();
        set.spawn(async move { pipeline.process(&transcript).await });
    }

    /// Fold a finished transcript into the ledger and the summary
    fn commit(
        &self,
        ledger: &mut Ledger,
        summary: &mut RunSummary,
        report: TranscriptReport,
        resume_at: DateTime<Utc>,
    ) -> Result<()> {
        if !self.dry_run {
            ledger
                .mark_transcript_complete(&report.transcript_id, &report.created, resume_at)
                .with_context(|| format!("Failed to record transcript {} in the ledger", report.transcript_id))?;
        }

        summary.transcripts_processed += 1;
        if !report.matched {
            summary.transcripts_without_matches += 1;
        } else if report.items == 0 {
            summary.transcripts_with_no_items += 1;
        }
        for (kind, _) in &report.created {
            summary.record_created(*kind);
        }
        summary.failures.extend(report.failures);
        Ok(())
    }
}
