//! Extracted and consolidated work items.
//!
//! An [`ExtractedItem`] is what a single backend reported for a single
//! transcript. A [`ConsolidatedItem`] is the merge of every backend's view of
//! the same logical item and carries the canonical id used as the external
//! upsert key.

use std::collections::BTreeSet;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Kind of extracted item. Declaration order is the output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Project,
    Task,
    Todo,
}

impl ItemKind {
    pub const ALL: [ItemKind; 3] = [ItemKind::Project, ItemKind::Task, ItemKind::Todo];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Project => "project",
            ItemKind::Task => "task",
            ItemKind::Todo => "todo",
        }
    }

    /// Parse a kind label, accepting plurals and common aliases
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "project" | "projects" | "initiative" => Some(ItemKind::Project),
            "task" | "tasks" | "action" | "action item" => Some(ItemKind::Task),
            "todo" | "todos" | "to-do" | "to do" | "reminder" => Some(ItemKind::Todo),
            _ => None,
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item priority. `Ord` follows severity: `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl Priority {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "medium" | "med" | "normal" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

/// Item progress. `Ord` follows progress: `NotStarted < InProgress < Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[serde(alias = "Not Started")]
    NotStarted,
    #[serde(alias = "In Progress")]
    InProgress,
    #[serde(alias = "Completed")]
    Done,
}

impl Default for Status {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl Status {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().replace(['_', '-'], " ").as_str() {
            "not started" | "todo" | "to do" | "planned" | "planning" | "new" | "upcoming" => {
                Some(Status::NotStarted)
            }
            "in progress" | "started" | "ongoing" | "underway" | "working" => {
                Some(Status::InProgress)
            }
            "done" | "completed" | "complete" | "finished" | "resolved" => Some(Status::Done),
            _ => None,
        }
    }
}

/// One item as reported by one backend for one transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedItem {
    pub kind: ItemKind,
    pub title: String,
    pub summary: String,
    pub due_date: Option<NaiveDate>,
    pub priority: Priority,
    #[serde(default)]
    pub status: Status,
    pub tags: BTreeSet<String>,
    pub source_backend: String,
    pub source_transcript_id: String,
    /// Title of the parent project (tasks only)
    pub parent_title: Option<String>,
    /// Local identity, only meaningful before consolidation
    pub provisional_id: Uuid,
}

impl ExtractedItem {
    pub fn new(
        kind: ItemKind,
        title: impl Into<String>,
        source_backend: impl Into<String>,
        source_transcript_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            title: title.into(),
            summary: String::new(),
            due_date: None,
            priority: Priority::default(),
            status: Status::default(),
            tags: BTreeSet::new(),
            source_backend: source_backend.into(),
            source_transcript_id: source_transcript_id.into(),
            parent_title: None,
            provisional_id: Uuid::new_v4(),
        }
    }

    /// Grouping key used for deduplication and consolidation
    pub fn similarity_key(&self) -> (ItemKind, String) {
        (self.kind, normalize_title(&self.title))
    }
}

/// The merged, authoritative view of one logical item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidatedItem {
    pub kind: ItemKind,
    pub title: String,
    pub summary: String,
    pub due_date: Option<NaiveDate>,
    pub priority: Priority,
    pub status: Status,
    pub tags: BTreeSet<String>,
    pub parent_title: Option<String>,
    pub source_transcript_id: String,
    pub contributing_backends: BTreeSet<String>,
    /// Deterministic upsert key, see [`canonical_id`]
    pub canonical_id: String,
}

/// Lowercase and collapse internal whitespace
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic identity of an item across backends and runs.
///
/// SHA-256 over kind, normalized title and transcript id; first 16 bytes as hex.
pub fn canonical_id(kind: ItemKind, title: &str, transcript_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_title(title).as_bytes());
    hasher.update([0u8]);
    hasher.update(transcript_id.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}
