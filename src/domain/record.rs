//! Records in the external database's schema.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::item::ItemKind;

/// Destination collection in the external database
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Projects,
    Tasks,
    Todos,
}

impl Collection {
    pub fn for_kind(kind: ItemKind) -> Self {
        match kind {
            ItemKind::Project => Collection::Projects,
            ItemKind::Task => Collection::Tasks,
            ItemKind::Todo => Collection::Todos,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Projects => "projects",
            Collection::Tasks => "tasks",
            Collection::Todos => "todos",
        }
    }

    /// Name of the title property in this collection
    pub fn title_property(&self) -> &'static str {
        match self {
            Collection::Projects => "Project",
            Collection::Tasks => "Name",
            Collection::Todos => "Task",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A schema-conformant record ready for upsert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRecord {
    pub collection: Collection,
    pub kind: ItemKind,
    /// Upsert key
    pub canonical_id: String,
    pub source_transcript_id: String,
    pub title: String,
    /// Property values keyed by the collection's property names
    pub properties: Map<String, Value>,
    /// External id of the linked parent project (tasks only)
    pub parent_external_id: Option<String>,
}
