//! Multi-backend consolidation.
//!
//! Items from every successful backend are grouped by kind and normalized
//! title, then merged field by field:
//! - title, summary, parent: longest non-empty value (ties: lexicographically smallest)
//! - priority: highest
//! - due date: earliest
//! - status: least advanced
//! - tags: union
//!
//! Output is sorted by (kind, normalized title), so the same input always
//! yields the same list.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::invoker::Extraction;
use crate::domain::{canonical_id, ConsolidatedItem, ExtractedItem, ItemKind};

/// Merge every backend's items for one transcript
pub fn consolidate(transcript_id: &str, extraction: &Extraction) -> Vec<ConsolidatedItem> {
    let mut groups: BTreeMap<(ItemKind, String), Vec<&ExtractedItem>> = BTreeMap::new();

    for items in extraction.values().filter_map(|r| r.as_ref().ok()) {
        for item in items {
            groups.entry(item.similarity_key()).or_default().push(item);
        }
    }

    let merged: Vec<ConsolidatedItem> = groups
        .into_iter()
        .filter(|((_, normalized), _)| !normalized.is_empty())
        .map(|((kind, _), group)| merge_group(kind, transcript_id, &group))
        .collect();

    debug!(transcript = %transcript_id, items = merged.len(), "Consolidated items");
    merged
}

/// Longest non-empty string; equal lengths resolve to the smallest
fn longest<'a>(values: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    values
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .min_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)))
}

fn merge_group(kind: ItemKind, transcript_id: &str, group: &[&ExtractedItem]) -> ConsolidatedItem {
    let title = longest(group.iter().map(|i| i.title.as_str()))
        .unwrap_or_default()
        .to_string();
    let summary = longest(group.iter().map(|i| i.summary.as_str()))
        .unwrap_or_default()
        .to_string();
    let parent_title =
        longest(group.iter().filter_map(|i| i.parent_title.as_deref())).map(str::to_string);

    let priority = group.iter().map(|i| i.priority).max().unwrap_or_default();
    let status = group.iter().map(|i| i.status).min().unwrap_or_default();
    let due_date = group.iter().filter_map(|i| i.due_date).min();

    let tags: BTreeSet<String> = group.iter().flat_map(|i| i.tags.iter().cloned()).collect();
    let contributing_backends: BTreeSet<String> =
        group.iter().map(|i| i.source_backend.clone()).collect();

    ConsolidatedItem {
        kind,
        canonical_id: canonical_id(kind, &title, transcript_id),
        title,
        summary,
        due_date,
        priority,
        status,
        tags,
        parent_title,
        source_transcript_id: transcript_id.to_string(),
        contributing_backends,
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::adapters::BackendError;
    use crate::domain::{Priority, Status};

    fn item(kind: ItemKind, title: &str, backend: &str) -> ExtractedItem {
        ExtractedItem::new(kind, title, backend, "t1")
    }

    #[test]
    fn test_overlapping_lists_merge() {
        let mut a = item(ItemKind::Task, "Call the plumber", "a:model");
        a.priority = Priority::Low;
        a.tags = ["home".to_string()].into();
        a.due_date = NaiveDate::from_ymd_opt(2025, 1, 30);

        let mut b = item(ItemKind::Task, "call  the PLUMBER", "b:model");
        b.priority = Priority::High;
        b.summary = "Leaky sink".to_string();
        b.tags = ["urgent".to_string()].into();
        b.due_date = NaiveDate::from_ymd_opt(2025, 1, 24);

        let extraction: Extraction = [
            ("a:model".to_string(), Ok(vec![a])),
            ("b:model".to_string(), Ok(vec![b])),
        ]
        .into();

        let merged = consolidate("t1", &extraction);
        assert_eq!(merged.len(), 1);

        let m = &merged[0];
        assert_eq!(m.priority, Priority::High);
        assert_eq!(m.summary, "Leaky sink");
        assert_eq!(m.due_date, NaiveDate::from_ymd_opt(2025, 1, 24));
        assert_eq!(m.tags.len(), 2);
        assert_eq!(m.contributing_backends.len(), 2);
        assert_eq!(m.canonical_id, canonical_id(ItemKind::Task, "call the plumber", "t1"));
    }

    #[test]
    fn test_title_tie_break_is_deterministic() {
        let a = item(ItemKind::Todo, "Buy Milk", "a:model");
        let b = item(ItemKind::Todo, "buy milk", "b:model");

        let forward: Extraction = [
            ("a:model".to_string(), Ok(vec![a.clone()])),
            ("b:model".to_string(), Ok(vec![b.clone()])),
        ]
        .into();
        let reverse: Extraction = [
            ("a:model".to_string(), Ok(vec![b])),
            ("b:model".to_string(), Ok(vec![a])),
        ]
        .into();

        let x = consolidate("t1", &forward);
        let y = consolidate("t1", &reverse);
        assert_eq!(x[0].title, "Buy Milk");
        assert_eq!(x[0].title, y[0].title);
        assert_eq!(x[0].canonical_id, y[0].canonical_id);
    }

    #[test]
    fn test_status_least_advanced_and_kinds_kept_apart() {
        let mut done = item(ItemKind::Project, "Website", "a:model");
        done.status = Status::Done;
        let mut started = item(ItemKind::Project, "website", "b:model");
        started.status = Status::InProgress;
        let task = item(ItemKind::Task, "Website", "b:model");

        let extraction: Extraction = [
            ("a:model".to_string(), Ok(vec![done])),
            ("b:model".to_string(), Ok(vec![started, task])),
        ]
        .into();

        let merged = consolidate("t1", &extraction);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].kind, ItemKind::Project);
        assert_eq!(merged[0].status, Status::InProgress);
        assert_eq!(merged[1].kind, ItemKind::Task);
    }

    #[test]
    fn test_failed_backends_ignored() {
        let extraction: Extraction = [
            ("a:model".to_string(), Err(BackendError::Timeout(std::time::Duration::from_secs(1)))),
            ("b:model".to_string(), Ok(vec![item(ItemKind::Todo, "Stretch", "b:model")])),
        ]
        .into();

        let merged = consolidate("t1", &extraction);
        assert_eq!(merged.len(), 1);
        assert_eq!(
            merged[0].contributing_backends.iter().collect::<Vec<_>>(),
            vec!["b:model"]
        );
    }

    #[test]
    fn test_all_failed_yields_nothing() {
        let extraction: Extraction =
            [("a:model".to_string(), Err(BackendError::Auth("no".to_string())))].into();
        assert!(consolidate("t1", &extraction).is_empty());
    }
}
