//! Domain types for lifelog-sync.
//!
//! This module contains the core data structures:
//! - Transcript: fetched records and keyword contexts
//! - Item: extracted and consolidated work items
//! - Record: items in the external database's schema
//! - Run: persisted ledger record and per-batch summary

pub mod item;
pub mod record;
pub mod run;
pub mod transcript;

// Re-export commonly used types
pub use item::{
    canonical_id, normalize_title, ConsolidatedItem, ExtractedItem, ItemKind, Priority, Status,
};
pub use record::{Collection, ExternalRecord};
pub use run::{FailureRecord, LedgerStatistics, RunState, RunSummary, Stage};
pub use transcript::{ContextMatch, MatchScope, Transcript};
