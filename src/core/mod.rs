//! Core extraction pipeline.
//!
//! This module contains:
//! - Matcher: keyword context windows
//! - Invoker: concurrent multi-backend extraction (with Parse and Dates)
//! - Consolidator: cross-backend merge and canonical identity
//! - Transformer: external database schema mapping
//! - Ledger: persisted idempotence record
//! - Pipeline: per-transcript stages and retry policy
//! - Orchestrator: batch execution engine
//! - Safety: resource limits

pub mod consolidator;
pub mod dates;
pub mod invoker;
pub mod ledger;
pub mod matcher;
pub mod orchestrator;
pub mod parse;
pub mod pipeline;
pub mod safety;
pub mod transformer;

// Re-export commonly used types
pub use consolidator::consolidate;
pub use invoker::{build_prompt, Extraction, ExtractionInvoker};
pub use ledger::{Ledger, LedgerError};
pub use matcher::KeywordMatcher;
pub use orchestrator::{BatchWindow, Orchestrator};
pub use pipeline::{with_retry, RetryPolicy, TranscriptPipeline, TranscriptReport};
pub use safety::{Limits, LimitViolation};
pub use transformer::{ItemTransformer, ProjectLinks};
