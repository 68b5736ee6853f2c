//! Configuration for lifelog-sync.
//!
//! Configuration sources (highest priority first):
//! 1. Command-line flags (applied by the CLI on top of the resolved config)
//! 2. Environment variables (LIFELOG_HOME, LIFELOG_LEDGER, API keys, database ids)
//! 3. Config file (.lifelog/config.yaml, or `--config`)
//! 4. Defaults (~/.lifelog)
//!
//! Config file discovery:
//! - Searches current directory and parents for .lifelog/config.yaml
//! - Paths in config file are relative to the config file's directory
//!
//! The keyword block may instead live in a separate JSON file
//! (`keywords_file`), using the same field names.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::BackendSpec;
use crate::core::pipeline::RetryPolicy;
use crate::core::safety::Limits;
use crate::domain::{Collection, Priority, Status};

/// Directory searched for `config.yaml`
pub const CONFIG_DIR: &str = ".lifelog";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    /// JSON file holding keyword settings (relative to config file)
    #[serde(default)]
    pub keywords_file: Option<String>,
    #[serde(default)]
    pub keywords: Option<KeywordSettings>,
    /// Backends as `provider:model`
    #[serde(default)]
    pub backends: Option<Vec<String>>,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub limitless: LimitlessSettings,
    #[serde(default)]
    pub notion: NotionSettings,
    #[serde(default)]
    pub api_keys: ApiKeys,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to config file)
    pub home: Option<String>,
    /// Ledger file (relative to config file)
    pub ledger: Option<String>,
}

/// Keyword matching and classification settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordSettings {
    /// Trigger terms that select transcript context
    #[serde(default = "default_primary_keywords")]
    pub primary_keywords: Vec<String>,

    /// Words kept on each side of a match (default: 50)
    #[serde(default = "default_context_window")]
    pub context_window_words: usize,

    /// When false, whole transcripts are sent to the backends
    #[serde(default = "default_true")]
    pub filter_enabled: bool,

    #[serde(default = "default_priority_keywords")]
    pub priority_keywords: BTreeMap<Priority, Vec<String>>,

    #[serde(default = "default_status_keywords")]
    pub status_keywords: BTreeMap<Status, Vec<String>>,

    /// Project category tag -> keywords that imply it
    #[serde(default)]
    pub project_category_keywords: BTreeMap<String, Vec<String>>,
}

fn default_primary_keywords() -> Vec<String> {
    vec!["TB".to_string(), "TeeBee".to_string()]
}
fn default_context_window() -> usize {
    50
}
fn default_true() -> bool {
    true
}

fn strings(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

fn default_priority_keywords() -> BTreeMap<Priority, Vec<String>> {
    BTreeMap::from([
        (
            Priority::High,
            strings(&["urgent", "asap", "critical", "important", "high priority", "p0", "p1"]),
        ),
        (Priority::Medium, strings(&["moderate", "medium priority", "p2", "soon"])),
        (
            Priority::Low,
            strings(&["low priority", "whenever", "p3", "p4", "sometime"]),
        ),
    ])
}

fn default_status_keywords() -> BTreeMap<Status, Vec<String>> {
    BTreeMap::from([
        (
            Status::NotStarted,
            strings(&[
                "todo", "to-do", "to do", "planned", "not started", "upcoming", "new", "need to",
            ]),
        ),
        (
            Status::InProgress,
            strings(&["in progress", "started", "working on", "ongoing", "underway", "beginning"]),
        ),
        (
            Status::Done,
            strings(&["done", "completed", "finished", "complete", "resolved"]),
        ),
    ])
}

impl Default for KeywordSettings {
    fn default() -> Self {
        Self {
            primary_keywords: default_primary_keywords(),
            context_window_words: default_context_window(),
            filter_enabled: true,
            priority_keywords: default_priority_keywords(),
            status_keywords: default_status_keywords(),
            project_category_keywords: BTreeMap::new(),
        }
    }
}

/// Keyword file overlay; absent fields keep the configured values
#[derive(Debug, Clone, Default, Deserialize)]
struct KeywordsFile {
    primary_keywords: Option<Vec<String>>,
    context_window_words: Option<usize>,
    priority_keywords: Option<BTreeMap<Priority, Vec<String>>>,
    status_keywords: Option<BTreeMap<Status, Vec<String>>>,
    project_category_keywords: Option<BTreeMap<String, Vec<String>>>,
}

impl KeywordsFile {
    fn apply(self, settings: &mut KeywordSettings) {
        if let Some(v) = self.primary_keywords {
            settings.primary_keywords = v;
        }
        if let Some(v) = self.context_window_words {
            settings.context_window_words = v;
        }
        if let Some(v) = self.priority_keywords {
            settings.priority_keywords = v;
        }
        if let Some(v) = self.status_keywords {
            settings.status_keywords = v;
        }
        if let Some(v) = self.project_category_keywords {
            settings.project_category_keywords = v;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitlessSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotionSettings {
    pub api_key: Option<String>,
    pub projects_db_id: Option<String>,
    pub tasks_db_id: Option<String>,
    pub todos_db_id: Option<String>,
}

impl NotionSettings {
    /// Configured database id per collection
    pub fn databases(&self) -> BTreeMap<Collection, String> {
        [
            (Collection::Projects, &self.projects_db_id),
            (Collection::Tasks, &self.tasks_db_id),
            (Collection::Todos, &self.todos_db_id),
        ]
        .into_iter()
        .filter_map(|(c, id)| id.clone().filter(|id| !id.is_empty()).map(|id| (c, id)))
        .collect()
    }
}

/// LLM provider credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeys {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
    pub gemini: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// Run-state ledger file
    pub ledger_path: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub keywords: KeywordSettings,
    /// Canonical `provider:model` ids
    pub backends: Vec<String>,
    pub limits: Limits,
    pub retry: RetryPolicy,
    pub limitless: LimitlessSettings,
    pub notion: NotionSettings,
    pub api_keys: ApiKeys,
}

fn default_backends() -> Vec<String> {
    vec![
        "openai:gpt-4o-mini".to_string(),
        "anthropic:claude-3-7-sonnet-20250219".to_string(),
    ]
}

impl ResolvedConfig {
    /// Parsed backend specs
    pub fn backend_specs(&self) -> Result<Vec<BackendSpec>> {
        self.backends.iter().map(|b| BackendSpec::parse(b)).collect()
    }

    /// Reject configurations a run cannot proceed with.
    ///
    /// External credentials are only required when records will be written.
    pub fn validate(&self, dry_run: bool) -> Result<()> {
        if self.backends.is_empty() {
            anyhow::bail!("At least one backend must be configured");
        }
        let specs = self.backend_specs()?;

        if self.keywords.filter_enabled
            && self.keywords.primary_keywords.iter().all(|k| k.trim().is_empty())
        {
            anyhow::bail!("Keyword filtering is enabled but no primary keywords are configured");
        }
        if self.keywords.context_window_words == 0 {
            anyhow::bail!("context_window_words must be at least 1");
        }
        self.limits.validate()?;

        if !dry_run {
            let databases = self.notion.databases();
            for collection in [Collection::Projects, Collection::Tasks, Collection::Todos] {
                if !databases.contains_key(&collection) {
                    anyhow::bail!(
                        "Notion database id for {} is not set (NOTION_{}_DB_ID)",
                        collection,
                        collection.as_str().to_uppercase()
                    );
                }
            }
            if is_blank(&self.notion.api_key) {
                anyhow::bail!("NOTION_API_KEY is not set");
            }
            for spec in &specs {
                if let Some(var) = crate::adapters::missing_credential(spec, &self.api_keys) {
                    anyhow::bail!("{} is required for backend '{}'", var, spec);
                }
            }
        }

        Ok(())
    }

    /// Copy with every secret replaced, for display
    pub fn redacted(&self) -> Self {
        fn mask(secret: &Option<String>) -> Option<String> {
            secret.as_ref().map(|_| "********".to_string())
        }

        let mut copy = self.clone();
        copy.limitless.api_key = mask(&self.limitless.api_key);
        copy.notion.api_key = mask(&self.notion.api_key);
        copy.api_keys = ApiKeys {
            openai: mask(&self.api_keys.openai),
            anthropic: mask(&self.api_keys.anthropic),
            gemini: mask(&self.api_keys.gemini),
        };
        copy
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or("").is_empty()
}

/// Find config file by searching `start` and its parents
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn load_keywords_file(path: &Path) -> Result<KeywordsFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read keywords file: {}", path.display()))?;

    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse keywords file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from the process environment
pub fn load_config(explicit: Option<&Path>) -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    load_config_with_env(explicit, &cwd, &|key| std::env::var(key).ok())
}

/// Load configuration with an injectable environment lookup
pub fn load_config_with_env(
    explicit: Option<&Path>,
    cwd: &Path,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    let config_file = match explicit {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            Some(path.to_path_buf())
        }
        None => find_config_file(cwd),
    };

    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    let config_dir = config_file
        .as_ref()
        .and_then(|p| p.parent())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.to_path_buf());

    // Resolve home path
    let home = if let Some(env_home) = var("LIFELOG_HOME") {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = file.paths.home {
        resolve_path(&config_dir, home_path)
    } else {
        dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(CONFIG_DIR)
    };

    // Resolve ledger path
    let ledger_path = if let Some(env_ledger) = var("LIFELOG_LEDGER") {
        PathBuf::from(env_ledger)
    } else if let Some(ref ledger) = file.paths.ledger {
        resolve_path(&config_dir, ledger)
    } else {
        home.join("state.json")
    };

    let mut keywords = file.keywords.unwrap_or_default();
    if let Some(ref keywords_path) = file.keywords_file {
        let path = resolve_path(&config_dir, keywords_path);
        load_keywords_file(&path)?.apply(&mut keywords);
    }

    let backends = file
        .backends
        .filter(|b| !b.is_empty())
        .unwrap_or_else(default_backends)
        .iter()
        .map(|b| BackendSpec::parse(b).map(|spec| spec.id()))
        .collect::<Result<Vec<_>>>()?;

    let limitless = LimitlessSettings {
        api_key: var("LIMITLESS_API_KEY").or(file.limitless.api_key),
        base_url: var("LIMITLESS_API_URL").or(file.limitless.base_url),
    };

    let notion = NotionSettings {
        api_key: var("NOTION_API_KEY").or(file.notion.api_key),
        projects_db_id: var("NOTION_PROJECTS_DB_ID").or(file.notion.projects_db_id),
        tasks_db_id: var("NOTION_TASKS_DB_ID").or(file.notion.tasks_db_id),
        todos_db_id: var("NOTION_TODOS_DB_ID").or(file.notion.todos_db_id),
    };

    let api_keys = ApiKeys {
        openai: var("OPENAI_API_KEY").or(file.api_keys.openai),
        anthropic: var("ANTHROPIC_API_KEY").or(file.api_keys.anthropic),
        gemini: var("GEMINI_API_KEY").or(file.api_keys.gemini),
    };

    Ok(ResolvedConfig {
        home,
        ledger_path,
        config_file,
        keywords,
        backends,
        limits: file.limits,
        retry: file.retry,
        limitless,
        notion,
        api_keys,
    })
}
