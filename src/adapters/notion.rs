//! Record sinks: the Notion API and a dry-run logger.
//!
//! Notion databases are user-built, so each database's schema is read once
//! and every record is fitted to it before writing:
//! - the title goes to whichever property has type `title`
//! - `select` values become `status` or `checkbox` values where the column has that type
//! - properties the database lacks, or cannot hold, are dropped
//!
//! The [`CANONICAL_ID_PROPERTY`] column is the one hard requirement, checked
//! by [`NotionClient::verify`] before a batch starts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{send_json, RecordSink};
use crate::core::pipeline::{with_retry, RetryPolicy};
use crate::domain::{Collection, ExternalRecord};

pub const DEFAULT_BASE_URL: &str = "https://api.notion.com/v1";
const NOTION_VERSION: &str = "2022-06-28";

/// Property holding the upsert key in every collection
pub const CANONICAL_ID_PROPERTY: &str = "Canonical ID";

/// Sequential API calls one upsert makes: a lookup, then a create or update
pub const CALLS_PER_UPSERT: u32 = 2;

/// Select values that mean finished when a column is a checkbox
const DONE_LABELS: [&str; 3] = ["Completed", "Done", "Complete"];

/// Property names and types of one Notion database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseSchema {
    properties: BTreeMap<String, String>,
}

impl DatabaseSchema {
    /// Read the `properties` map of a `GET /databases/{id}` response
    pub fn from_response(body: &Value) -> Self {
        let properties = body
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .filter_map(|(name, prop)| {
                        let kind = prop.get("type")?.as_str()?;
                        Some((name.clone(), kind.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { properties }
    }

    pub fn property_type(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    fn title_property(&self) -> Option<&str> {
        self.properties
            .iter()
            .find(|(_, kind)| kind.as_str() == "title")
            .map(|(name, _)| name.as_str())
    }

    /// Fail unless records can be keyed and titled in this database
    pub fn check(&self, collection: Collection) -> Result<()> {
        match self.property_type(CANONICAL_ID_PROPERTY) {
            Some("rich_text") => {}
            Some(other) => anyhow::bail!(
                "Notion {} database: property '{}' must be rich text, found {}",
                collection,
                CANONICAL_ID_PROPERTY,
                other
            ),
            None => anyhow::bail!(
                "Notion {} database has no '{}' property; add a rich text property with that name",
                collection,
                CANONICAL_ID_PROPERTY
            ),
        }
        if self.title_property().is_none() {
            anyhow::bail!("Notion {} database has no title property", collection);
        }
        Ok(())
    }

    /// Fit record properties to this schema
    pub fn conform(&self, collection: Collection, properties: &Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::new();

        for (name, value) in properties {
            let target = if name == collection.title_property() {
                self.title_property().unwrap_or(name.as_str())
            } else {
                name.as_str()
            };
            let Some(kind) = self.property_type(target) else {
                debug!(%collection, property = %name, "Database has no such property, dropping");
                continue;
            };
            match convert(value, kind) {
                Some(converted) => {
                    out.insert(target.to_string(), converted);
                }
                None => debug!(%collection, property = %name, column_type = kind, "Property type mismatch, dropping"),
            }
        }

        out
    }
}

/// Reshape a property value for a column of type `kind`
fn convert(value: &Value, kind: &str) -> Option<Value> {
    if value.get(kind).is_some() {
        return Some(value.clone());
    }
    let choice = value.get("select").or_else(|| value.get("status"));
    match (kind, choice) {
        ("status", Some(choice)) => Some(json!({ "status": choice })),
        ("select", Some(choice)) => Some(json!({ "select": choice })),
        ("checkbox", Some(choice)) => {
            let name = choice.get("name").and_then(Value::as_str).unwrap_or_default();
            Some(json!({ "checkbox": DONE_LABELS.iter().any(|d| d.eq_ignore_ascii_case(name)) }))
        }
        ("rich_text", None) => value.get("title").map(|text| json!({ "rich_text": text })),
        _ => None,
    }
}

/// Notion client that upserts pages keyed by [`CANONICAL_ID_PROPERTY`]
pub struct NotionClient {
    api_key: String,
    databases: BTreeMap<Collection, String>,
    base_url: String,
    timeout: Duration,
    retry: RetryPolicy,
    client: reqwest::Client,
    schemas: Mutex<BTreeMap<Collection, Arc<DatabaseSchema>>>,
}

impl NotionClient {
    pub fn new(api_key: String, databases: BTreeMap<Collection, String>) -> Self {
        Self {
            api_key,
            databases,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            client: reqwest::Client::new(),
            schemas: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn database_id(&self, collection: Collection) -> Result<&str> {
        self.databases
            .get(&collection)
            .map(String::as_str)
            .ok_or_else(|| anyhow::anyhow!("No Notion database configured for {}", collection))
    }

    async fn call(&self, method: reqwest::Method, url: String, body: Option<&Value>) -> Result<Value> {
        with_retry(&self.retry, "notion", || {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&self.api_key)
                .header("Notion-Version", NOTION_VERSION);
            if let Some(body) = body {
                request = request.json(body);
            }
            send_json(request, self.timeout)
        })
        .await
        .with_context(|| format!("Notion request failed: {} {}", method, url))
    }

    /// Schema of a collection's database, fetched and checked once
    async fn schema(&self, collection: Collection) -> Result<Arc<DatabaseSchema>> {
        let mut schemas = self.schemas.lock().await;
        if let Some(schema) = schemas.get(&collection) {
            return Ok(Arc::clone(schema));
        }

        let database_id = self.database_id(collection)?;
        let url = format!("{}/databases/{}", self.base_url, database_id);
        let body = self.call(reqwest::Method::GET, url, None).await?;
        let schema = DatabaseSchema::from_response(&body);
        schema.check(collection)?;
        debug!(%collection, properties = schema.properties.len(), "Loaded Notion schema");

        let schema = Arc::new(schema);
        schemas.insert(collection, Arc::clone(&schema));
        Ok(schema)
    }

    /// Load every configured database's schema, failing on the first unusable one
    pub async fn verify(&self) -> Result<()> {
        for collection in self.databases.keys() {
            self.schema(*collection).await?;
        }
        Ok(())
    }

    /// Find an existing page carrying `canonical_id`
    async fn find_page(&self, database_id: &str, canonical_id: &str) -> Result<Option<String>> {
        let url = format!("{}/databases/{}/query", self.base_url, database_id);
        let body = query_body(canonical_id);
        let response = self.call(reqwest::Method::POST, url, Some(&body)).await?;

        Ok(response
            .pointer("/results/0/id")
            .and_then(|id| id.as_str())
            .map(str::to_string))
    }
}

fn query_body(canonical_id: &str) -> Value {
    json!({
        "filter": {
            "property": CANONICAL_ID_PROPERTY,
            "rich_text": { "equals": canonical_id },
        },
        "page_size": 1,
    })
}

#[async_trait]
impl RecordSink for NotionClient {
    fn name(&self) -> &str {
        "notion"
    }

    async fn upsert(&self, record: &ExternalRecord) -> Result<String> {
        let database_id = self.database_id(record.collection)?;
        let schema = self.schema(record.collection).await?;
        let conformed = schema.conform(record.collection, &record.properties);
        if conformed.len() < record.properties.len() {
            warn!(
                collection = %record.collection,
                dropped = record.properties.len() - conformed.len(),
                "Some properties do not fit the database schema"
            );
        }
        let properties = Value::Object(conformed);

        let response = match self.find_page(database_id, &record.canonical_id).await? {
            Some(page_id) => {
                debug!(page = %page_id, canonical_id = %record.canonical_id, "Updating Notion page");
                let url = format!("{}/pages/{}", self.base_url, page_id);
                self.call(reqwest::Method::PATCH, url, Some(&json!({ "properties": properties })))
                    .await?
            }
            None => {
                debug!(canonical_id = %record.canonical_id, "Creating Notion page");
                let url = format!("{}/pages", self.base_url);
                let body = json!({
                    "parent": { "database_id": database_id },
                    "properties": properties,
                });
                self.call(reqwest::Method::POST, url, Some(&body)).await?
            }
        };

        response
            .get("id")
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Notion response is missing the page id"))
    }
}

/// Sink that logs records instead of writing them
#[derive(Default)]
pub struct DryRunSink {
    records: Mutex<Vec<ExternalRecord>>,
}

impl DryRunSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything passed to `upsert` so far, in call order
    pub async fn records(&self) -> Vec<ExternalRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl RecordSink for DryRunSink {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn upsert(&self, record: &ExternalRecord) -> Result<String> {
        info!(
            collection = %record.collection,
            title = %record.title,
            canonical_id = %record.canonical_id,
            "[dry run] would upsert"
        );
        self.records.lock().await.push(record.clone());
        Ok(format!("dry-run-{}", record.canonical_id))
    }
}
