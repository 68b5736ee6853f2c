//! Persisted run state and the per-batch summary.
//!
//! [`RunState`] is the ledger record: which transcripts have completed the
//! full pipeline and which external records each produced. [`RunSummary`]
//! is the user-facing report for one batch and is never persisted.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::item::ItemKind;

/// Current ledger format version
pub const RUN_STATE_VERSION: u32 = 1;

/// Persisted idempotence record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub version: u32,

    /// Batch end timestamp of the latest committed transcript
    pub last_run_timestamp: Option<DateTime<Utc>>,

    /// Every transcript that completed the full pipeline
    #[serde(default)]
    pub processed_transcript_ids: BTreeSet<String>,

    /// External record ids created from each transcript
    #[serde(default)]
    pub transcript_to_external_ids: BTreeMap<String, BTreeSet<String>>,

    #[serde(default)]
    pub statistics: LedgerStatistics,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            version: RUN_STATE_VERSION,
            last_run_timestamp: None,
            processed_transcript_ids: BTreeSet::new(),
            transcript_to_external_ids: BTreeMap::new(),
            statistics: LedgerStatistics::default(),
        }
    }
}

impl RunState {
    pub fn is_processed(&self, transcript_id: &str) -> bool {
        self.processed_transcript_ids.contains(transcript_id)
    }

    /// Apply a transcript completion to this value
    pub fn apply_completion(
        &mut self,
        transcript_id: &str,
        external_ids: &[(ItemKind, String)],
        timestamp: DateTime<Utc>,
    ) {
        if self.processed_transcript_ids.insert(transcript_id.to_string()) {
            self.statistics.total_transcripts_processed += 1;
        }

        let ids = self
            .transcript_to_external_ids
            .entry(transcript_id.to_string())
            .or_default();
        for (kind, id) in external_ids {
            if ids.insert(id.clone()) {
                *self.statistics.items_created.entry(*kind).or_insert(0) += 1;
            }
        }

        self.last_run_timestamp = Some(match self.last_run_timestamp {
            Some(previous) if previous > timestamp => previous,
            _ => timestamp,
        });
    }
}

/// Cumulative counters across all runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStatistics {
    pub total_transcripts_processed: u64,
    #[serde(default)]
    pub items_created: BTreeMap<ItemKind, u64>,
}

/// Pipeline stage a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Upsert,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Extract => "extract",
            Stage::Upsert => "upsert",
        })
    }
}

/// One recorded failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub stage: Stage,
    pub transcript_id: String,
    /// Backend id for extract failures, canonical id for upsert failures
    pub subject: String,
    pub error: String,
}

/// Report for one batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub transcripts_fetched: usize,
    pub skipped_already_processed: usize,
    pub transcripts_processed: usize,
    pub transcripts_without_matches: usize,
    pub transcripts_with_no_items: usize,
    pub items_created: BTreeMap<ItemKind, usize>,
    pub failures: Vec<FailureRecord>,
    pub cancelled: bool,
    pub dry_run: bool,
}

impl RunSummary {
    pub fn record_created(&mut self, kind: ItemKind) {
        *self.items_created.entry(kind).or_insert(0) += 1;
    }

    pub fn total_items_created(&self) -> usize {
        self.items_created.values().sum()
    }

    pub fn failures_in(&self, stage: Stage) -> usize {
        self.failures.iter().filter(|f| f.stage == stage).count()
    }

    pub fn failures_per_stage(&self) -> BTreeMap<Stage, usize> {
        let mut counts = BTreeMap::new();
        for failure in &self.failures {
            *counts.entry(failure.stage).or_insert(0) += 1;
        }
        counts
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run summary{}", if self.dry_run { " (dry run)" } else { "" })?;
        writeln!(f, "  Transcripts fetched:        {}", self.transcripts_fetched)?;
        writeln!(f, "  Already processed:          {}", self.skipped_already_processed)?;
        writeln!(f, "  Processed:                  {}", self.transcripts_processed)?;
        writeln!(f, "  Without keyword matches:    {}", self.transcripts_without_matches)?;
        writeln!(f, "  With no items:              {}", self.transcripts_with_no_items)?;
        writeln!(f, "  Items created:")?;
        for kind in ItemKind::ALL {
            writeln!(
                f,
                "    {:<8} {}",
                kind.as_str(),
                self.items_created.get(&kind).copied().unwrap_or(0)
            )?;
        }
        writeln!(f, "  Failures:")?;
        for stage in [Stage::Extract, Stage::Upsert] {
            writeln!(f, "    {:<8} {}", stage.to_string(), self.failures_in(stage))?;
        }
        if self.cancelled {
            writeln!(f, "  Batch cancelled; in-flight transcripts will be retried next run")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_apply_completion_is_idempotent() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 20, 12, 0, 0).unwrap();
        let mut state = RunState::default();
        let ids = vec![(ItemKind::Task, "page-1".to_string())];

        state.apply_completion("t1", &ids, ts);
        state.apply_completion("t1", &ids, ts);

        assert!(state.is_processed("t1"));
        assert_eq!(state.statistics.total_transcripts_processed, 1);
        assert_eq!(state.statistics.items_created.get(&ItemKind::Task), Some(&1));
        assert_eq!(state.transcript_to_external_ids["t1"].len(), 1);
    }

    #[test]
    fn test_last_run_timestamp_never_moves_backwards() {
        let later = Utc.with_ymd_and_hms(2025, 1, 21, 0, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2025, 1, 20, 0, 0, 0).unwrap();
        let mut state = RunState::default();

        state.apply_completion("t1", &[], later);
        state.apply_completion("t2", &[], earlier);

        assert_eq!(state.last_run_timestamp, Some(later));
    }

    #[test]
    fn test_zero_item_completion_still_recorded() {
        let mut state = RunState::default();
        state.apply_completion("quiet", &[], Utc::now());

        assert!(state.is_processed("quiet"));
        assert!(state.transcript_to_external_ids["quiet"].is_empty());
    }

    #[test]
    fn test_summary_failures_per_stage() {
        let mut summary = RunSummary::default();
        summary.failures.push(FailureRecord {
            stage: Stage::Extract,
            transcript_id: "t1".to_string(),
            subject: "openai:gpt-4o".to_string(),
            error: "malformed".to_string(),
        });
        summary.record_created(ItemKind::Todo);

        assert_eq!(summary.failures_in(Stage::Extract), 1);
        assert_eq!(summary.failures_in(Stage::Upsert), 0);
        assert_eq!(summary.total_items_created(), 1);
        assert!(summary.to_string().contains("extract  1"));
    }
}
