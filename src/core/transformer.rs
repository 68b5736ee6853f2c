//! Item transformer.
//!
//! Maps consolidated items onto the external database schema. Each kind has
//! its own collection and property names:
//!
//! | Kind    | Title     | Status                                | Extra                  |
//! |---------|-----------|---------------------------------------|------------------------|
//! | Project | `Project` | Planning / In Progress / Completed    | `Description`          |
//! | Task    | `Name`    | Not Started / In Progress / Completed | `Notes`, `Project` link |
//! | Todo    | `Task`    | `Done` checkbox                       | `Notes`                |
//!
//! Every record also carries `Canonical ID` (the upsert key) and `Source`.
//!
//! Tasks link only to projects created from the same transcript, so the
//! link never depends on which transcripts happen to run concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::debug;

use super::parse::contains_phrase;
use crate::adapters::notion::CANONICAL_ID_PROPERTY;
use crate::config::KeywordSettings;
use crate::domain::{normalize_title, Collection, ConsolidatedItem, ExternalRecord, ItemKind, Priority, Status};

/// Maximum tags written per record
pub const MAX_TAGS: usize = 10;

/// Notion rich text content limit per block
const MAX_TEXT_CHARS: usize = 2000;

/// Projects upserted for one transcript, normalized title -> external id
#[derive(Debug, Default, Clone)]
pub struct ProjectLinks {
    ids: HashMap<String, String>,
}

impl ProjectLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, title: &str, external_id: &str) {
        self.ids.insert(normalize_title(title), external_id.to_string());
    }

    pub fn get(&self, title: &str) -> Option<&str> {
        self.ids.get(&normalize_title(title)).map(String::as_str)
    }
}

pub struct ItemTransformer {
    keywords: Arc<KeywordSettings>,
}

impl ItemTransformer {
    pub fn new(keywords: Arc<KeywordSettings>) -> Self {
        Self { keywords }
    }

    /// Build the external record for one item
    pub fn transform(&self, item: &ConsolidatedItem, links: &ProjectLinks) -> ExternalRecord {
        let parent_external_id = match (item.kind, &item.parent_title) {
            (ItemKind::Task, Some(parent)) => {
                let found = links.get(parent).map(str::to_string);
                if found.is_none() {
                    debug!(task = %item.title, parent = %parent, "Parent project not created from this transcript");
                }
                found
            }
            _ => None,
        };

        let collection = Collection::for_kind(item.kind);
        let mut properties = Map::new();

        properties.insert(collection.title_property().to_string(), title_value(&item.title));

        match item.kind {
            ItemKind::Project => {
                properties.insert("Description".to_string(), rich_text(&item.summary));
                properties.insert("Status".to_string(), select(project_status(item.status)));
                properties.insert("Priority".to_string(), select(priority_label(item.priority)));
            }
            ItemKind::Task => {
                properties.insert("Notes".to_string(), rich_text(&item.summary));
                properties.insert("Status".to_string(), select(task_status(item.status)));
                properties.insert("Priority".to_string(), select(priority_label(item.priority)));
                if let Some(ref parent) = parent_external_id {
                    properties.insert("Project".to_string(), json!({ "relation": [{ "id": parent }] }));
                }
            }
            ItemKind::Todo => {
                properties.insert("Notes".to_string(), rich_text(&item.summary));
                properties.insert(
                    "Done".to_string(),
                    json!({ "checkbox": item.status == Status::Done }),
                );
            }
        }

        if let Some(due) = item.due_date {
            properties.insert(
                "Due".to_string(),
                json!({ "date": { "start": due.format("%Y-%m-%d").to_string() } }),
            );
        }

        let tags = self.tags_for(item);
        if !tags.is_empty() {
            let options: Vec<Value> = tags.iter().map(|t| json!({ "name": t })).collect();
            properties.insert("Tags".to_string(), json!({ "multi_select": options }));
        }

        properties.insert(CANONICAL_ID_PROPERTY.to_string(), rich_text(&item.canonical_id));
        properties.insert("Source".to_string(), rich_text(&item.source_transcript_id));

        ExternalRecord {
            collection,
            kind: item.kind,
            canonical_id: item.canonical_id.clone(),
            source_transcript_id: item.source_transcript_id.clone(),
            title: item.title.clone(),
            properties,
            parent_external_id,
        }
    }

    /// Category tags first, then the item's own tags, capped at [`MAX_TAGS`]
    fn tags_for(&self, item: &ConsolidatedItem) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();

        if item.kind == ItemKind::Project {
            let text = format!("{} {}", item.title, item.summary);
            for (category, words) in &self.keywords.project_category_keywords {
                if words.iter().any(|w| contains_phrase(&text, w)) {
                    tags.push(category.clone());
                }
            }
        }

        for tag in &item.tags {
            // Notion rejects commas in select options
            let tag = tag.replace(',', " ").trim().to_string();
            if !tag.is_empty() && !tags.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
                tags.push(tag);
            }
        }

        tags.truncate(MAX_TAGS);
        tags
    }
}

fn truncate_chars(text: &str) -> String {
    text.chars().take(MAX_TEXT_CHARS).collect()
}

fn title_value(text: &str) -> Value {
    json!({ "title": [{ "text": { "content": truncate_chars(text) } }] })
}

fn rich_text(text: &str) -> Value {
    if text.is_empty() {
        return json!({ "rich_text": [] });
    }
    json!({ "rich_text": [{ "text": { "content": truncate_chars(text) } }] })
}

fn select(name: &str) -> Value {
    json!({ "select": { "name": name } })
}

pub fn priority_label(priority: Priority) -> &'static str {
    match priority {
        Priority::High => "High",
        Priority::Medium => "Medium",
        Priority::Low => "Low",
    }
}

pub fn task_status(status: Status) -> &'static str {
    match status {
        Status::NotStarted => "Not Started",
        Status::InProgress => "In Progress",
        Status::Done => "Completed",
    }
}

pub fn project_status(status: Status) -> &'static str {
    match status {
        Status::NotStarted => "Planning",
        Status::InProgress => "In Progress",
        Status::Done => "Completed",
    }
}
