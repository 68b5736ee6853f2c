//! Backend response parsing.
//!
//! Responses are free-form text expected to contain JSON. Accepted shapes:
//! - `{"items": [{"kind": "task", ...}]}` or a bare array of such items
//! - `{"projects": [...], "tasks": [...], "todos": [...]}`, where
//!   `meetings` and `research` arrays become tasks and `messages` become todos
//! - `{"summary": ..., "recommendations": {"projects": [...], ...}}`
//!
//! The JSON may be wrapped in a code fence or surrounded by prose. Items are
//! parsed one at a time; an unusable item is dropped with a warning and does
//! not affect its siblings.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::dates;
use super::matcher::clean_token;
use crate::adapters::BackendError;
use crate::config::KeywordSettings;
use crate::domain::{ExtractedItem, ItemKind, Priority, Status};

/// Inputs shared by every item of one response
pub struct ParseContext<'a> {
    pub backend_id: &'a str,
    pub transcript_id: &'a str,
    /// Anchor for relative due dates
    pub reference_date: NaiveDate,
    pub keywords: &'a KeywordSettings,
}

/// Parse a raw backend response into extracted items.
///
/// Fails only when no JSON can be recovered from the response at all.
pub fn parse_response(raw: &str, ctx: &ParseContext<'_>) -> Result<Vec<ExtractedItem>, BackendError> {
    let json = locate_json(raw).ok_or_else(|| {
        BackendError::Malformed(format!(
            "no JSON found in response ({} bytes)",
            raw.len()
        ))
    })?;

    let mut items = Vec::new();
    let mut dropped = 0usize;

    for (hint, value) in candidate_items(&json) {
        match parse_item(hint, value, ctx) {
            Some(item) => items.push(item),
            None => {
                dropped += 1;
                warn!(
                    backend = %ctx.backend_id,
                    transcript = %ctx.transcript_id,
                    item = %value,
                    "Dropping unparseable item"
                );
            }
        }
    }

    debug!(
        backend = %ctx.backend_id,
        transcript = %ctx.transcript_id,
        parsed = items.len(),
        dropped,
        "Parsed backend response"
    );
    Ok(items)
}

/// Find the JSON object or array in `raw` most likely to hold items.
///
/// Prose such as "see [1]" can precede the payload, so a value made of
/// objects is preferred over the first bracket that happens to parse.
pub fn locate_json(raw: &str) -> Option<Value> {
    let text = strip_fence(raw.trim());
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }

    let mut fallback = None;
    for (i, _) in text.char_indices().filter(|(_, c)| *c == '{' || *c == '[') {
        let Some(Ok(value)) = serde_json::Deserializer::from_str(&text[i..])
            .into_iter::<Value>()
            .next()
        else {
            continue;
        };
        if holds_objects(&value) {
            return Some(value);
        }
        fallback.get_or_insert(value);
    }
    fallback
}

fn holds_objects(value: &Value) -> bool {
    match value {
        Value::Object(_) => true,
        Value::Array(items) => items.iter().any(Value::is_object),
        _ => false,
    }
}

fn strip_fence(text: &str) -> &str {
    let Some(start) = text.find("```") else {
        return text;
    };
    let after = &text[start + 3..];
    // Skip an info string such as `json`
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// Sub-category of an item. Meetings and research land in the tasks database,
/// messages in the todos database, each tagged and titled after its category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Plain,
    Meeting,
    Research,
    Message,
}

impl Flavor {
    fn tag(self) -> Option<&'static str> {
        match self {
            Flavor::Plain => None,
            Flavor::Meeting => Some("meeting"),
            Flavor::Research => Some("research"),
            Flavor::Message => Some("message"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hint {
    kind: ItemKind,
    flavor: Flavor,
}

impl Hint {
    fn plain(kind: ItemKind) -> Self {
        Self { kind, flavor: Flavor::Plain }
    }
}

fn flavor_for_label(label: &str) -> Option<Hint> {
    let hint = match label.trim().to_lowercase().as_str() {
        "meeting" | "meetings" => Hint { kind: ItemKind::Task, flavor: Flavor::Meeting },
        "research" => Hint { kind: ItemKind::Task, flavor: Flavor::Research },
        "message" | "messages" => Hint { kind: ItemKind::Todo, flavor: Flavor::Message },
        other => Hint::plain(ItemKind::from_label(other)?),
    };
    Some(hint)
}

fn kind_for_key(key: &str) -> Option<Hint> {
    let kind = match key.to_lowercase().as_str() {
        "projects" | "project" => ItemKind::Project,
        "tasks" | "task" | "action_items" | "actions" => ItemKind::Task,
        "todos" | "todo" | "to_dos" | "todo_items" | "reminders" => ItemKind::Todo,
        other => return flavor_for_label(other).filter(|h| h.flavor != Flavor::Plain),
    };
    Some(Hint::plain(kind))
}

/// Items paired with the kind implied by their enclosing array (if any)
fn candidate_items(json: &Value) -> Vec<(Option<Hint>, &Value)> {
    let mut out = Vec::new();

    match json {
        Value::Array(items) => out.extend(items.iter().map(|v| (None, v))),
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("items") {
                out.extend(items.iter().map(|v| (None, v)));
            }
            let grouped = match map.get("recommendations") {
                Some(Value::Object(nested)) => nested,
                _ => map,
            };
            collect_grouped(grouped, &mut out);
            if !std::ptr::eq(grouped, map) {
                collect_grouped(map, &mut out);
            }
            // A single item object on its own
            if out.is_empty() && (map.contains_key("kind") || map.contains_key("type")) {
                out.push((None, json));
            }
        }
        _ => {}
    }

    out
}

fn collect_grouped<'v>(map: &'v Map<String, Value>, out: &mut Vec<(Option<Hint>, &'v Value)>) {
    for (key, value) in map {
        if let (Some(hint), Value::Array(items)) = (kind_for_key(key), value) {
            out.extend(items.iter().map(|v| (Some(hint), v)));
        }
    }
}

fn str_field<'v>(obj: &'v Map<String, Value>, keys: &[&str]) -> Option<&'v str> {
    keys.iter()
        .filter_map(|k| obj.get(*k).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

fn parse_item(hint: Option<Hint>, value: &Value, ctx: &ParseContext<'_>) -> Option<ExtractedItem> {
    // Plain strings are accepted as titles when the enclosing array names the kind
    if let Value::String(title) = value {
        let title = title.trim();
        if title.is_empty() {
            return None;
        }
        let hint = hint?;
        let title = flavored_title(hint.flavor, title, None);
        let mut item = ExtractedItem::new(hint.kind, &title, ctx.backend_id, ctx.transcript_id);
        item.priority = infer_priority(None, &title, ctx.keywords);
        item.tags.extend(hint.flavor.tag().map(str::to_string));
        return Some(item);
    }

    let obj = value.as_object()?;

    let Hint { kind, flavor } = str_field(obj, &["kind", "type", "category"])
        .and_then(flavor_for_label)
        .or(hint)?;

    let title_keys: &[&str] = match (kind, flavor) {
        (ItemKind::Project, _) => &["title", "name", "project", "project_name"],
        (_, Flavor::Meeting) => &["title", "name", "meeting", "subject"],
        (_, Flavor::Research) => &["topic", "title", "name", "subject"],
        (_, Flavor::Message) => &["content", "message", "text", "title"],
        _ => &["title", "name", "task", "todo", "item"],
    };
    let title = flavored_title(flavor, str_field(obj, title_keys)?, str_field(obj, &["recipient", "to"]));

    let mut summary = str_field(obj, &["summary", "description", "notes", "details"])
        .unwrap_or_default()
        .to_string();
    append_details(&mut summary, flavor, obj);

    let mut item = ExtractedItem::new(kind, title, ctx.backend_id, ctx.transcript_id);
    item.summary = summary;

    item.due_date = str_field(obj, &["due_date", "dueDate", "due", "deadline", "date"])
        .and_then(|phrase| {
            let resolved = dates::resolve(phrase, ctx.reference_date);
            if resolved.is_none() {
                debug!(phrase, "Unresolvable due date, leaving empty");
            }
            resolved
        });

    let text = format!("{} {}", item.title, item.summary);
    item.priority = infer_priority(str_field(obj, &["priority", "importance"]), &text, ctx.keywords);
    item.status = infer_status(str_field(obj, &["status", "state"]), ctx.keywords);
    item.tags = parse_tags(obj.get("tags").or_else(|| obj.get("categories")));
    item.tags.extend(flavor.tag().map(str::to_string));

    if kind != ItemKind::Project {
        item.parent_title = str_field(obj, &["parent", "parent_title", "parent_project", "project"])
            .map(str::to_string);
    }

    Some(item)
}

/// Message titles keep the first 30 characters of the content
const MESSAGE_TITLE_CHARS: usize = 30;

fn flavored_title(flavor: Flavor, title: &str, recipient: Option<&str>) -> String {
    match flavor {
        Flavor::Plain => title.to_string(),
        Flavor::Meeting => format!("Meeting: {title}"),
        Flavor::Research => format!("Research: {title}"),
        Flavor::Message => {
            let mut content: String = title.chars().take(MESSAGE_TITLE_CHARS).collect();
            if title.chars().count() > MESSAGE_TITLE_CHARS {
                content = format!("{}...", content.trim_end());
            }
            match recipient {
                Some(to) => format!("Message to {to}: {content}"),
                None => format!("Message: {content}"),
            }
        }
    }
}

/// Render a string or list of strings as one comma separated line
fn joined_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Array(items) => {
            let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        _ => None,
    }
}

/// Category specific fields are folded into the summary
fn append_details(summary: &mut String, flavor: Flavor, obj: &Map<String, Value>) {
    let fields: &[(&str, &str)] = match flavor {
        Flavor::Plain => &[],
        Flavor::Meeting => &[("agenda", "Agenda"), ("participants", "Participants"), ("location", "Location")],
        Flavor::Research => &[("questions", "Questions"), ("sources", "Sources")],
        Flavor::Message => &[("content", "Message"), ("medium", "Medium")],
    };
    for (key, label) in fields {
        if let Some(value) = joined_field(obj, key) {
            if !summary.is_empty() {
                summary.push_str("\n\n");
            }
            summary.push_str(&format!("{label}: {value}"));
        }
    }
}

/// Whether `phrase` occurs in `text` on word boundaries (after token cleaning)
pub(crate) fn contains_phrase(text: &str, phrase: &str) -> bool {
    let clean = |s: &str| {
        s.split_whitespace()
            .map(clean_token)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
    };
    let haystack = clean(text);
    let needle = clean(phrase);
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle.as_slice())
}

/// Priority from an explicit label, then configured keywords, then Medium
pub fn infer_priority(label: Option<&str>, text: &str, keywords: &KeywordSettings) -> Priority {
    if let Some(label) = label {
        if let Some(p) = Priority::from_label(label) {
            return p;
        }
    }

    // Highest priority wins when several tables match
    for priority in [Priority::High, Priority::Medium, Priority::Low] {
        let Some(words) = keywords.priority_keywords.get(&priority) else {
            continue;
        };
        let hit = words.iter().any(|w| {
            label.map(|l| contains_phrase(l, w)).unwrap_or(false) || contains_phrase(text, w)
        });
        if hit {
            return priority;
        }
    }

    Priority::default()
}

/// Status from an explicit label, then configured keywords, then NotStarted
pub fn infer_status(label: Option<&str>, keywords: &KeywordSettings) -> Status {
    let Some(label) = label else {
        return Status::default();
    };
    if let Some(s) = Status::from_label(label) {
        return s;
    }
    // Most advanced status wins, so "started, not done" is not read as Done
    for status in [Status::InProgress, Status::Done, Status::NotStarted] {
        if let Some(words) = keywords.status_keywords.get(&status) {
            if words.iter().any(|w| contains_phrase(label, w)) {
                return status;
            }
        }
    }
    Status::default()
}

fn parse_tags(value: Option<&Value>) -> BTreeSet<String> {
    let raw: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };

    raw.into_iter()
        .map(|t| t.trim().trim_start_matches('#').to_string())
        .filter(|t| !t.is_empty())
        .collect()
}
