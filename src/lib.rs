//! lifelog-sync - voice transcripts to structured work items
//!
//! Fetches lifelog transcripts, keeps the context around trigger keywords,
//! asks one or more LLM backends to extract projects, tasks and todos,
//! merges their answers and upserts the result into Notion.
//!
//! # Architecture
//!
//! The system is built around an idempotent ledger:
//! - Each transcript runs match → extract → consolidate → transform → upsert
//! - A transcript is recorded only after its whole pipeline finished
//! - Recorded transcripts are skipped on every later run
//!
//! # Modules
//!
//! - `adapters`: External systems (Limitless, LLM backends, Notion)
//! - `core`: Pipeline logic (Matcher, Invoker, Consolidator, Ledger, Orchestrator)
//! - `domain`: Data structures (Transcript, Item, Record, RunState)
//! - `config`: YAML configuration and environment overrides
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Process everything since the last run
//! lifelog-sync run
//!
//! # Preview the last two days without writing anything
//! lifelog-sync run --days 2 --dry-run
//!
//! # Ledger statistics
//! lifelog-sync status
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{Ledger, Orchestrator, TranscriptPipeline};
pub use domain::{ConsolidatedItem, ExtractedItem, ItemKind, RunState, RunSummary, Transcript};
