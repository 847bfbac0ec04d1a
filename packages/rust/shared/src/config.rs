//! Application configuration for topicsync.
//!
//! User config lives at `~/.topicsync/topicsync.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TopicSyncError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "topicsync.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".topicsync";

// ---------------------------------------------------------------------------
// Config structs (matching topicsync.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Embedding service settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Title filtering for the tree builder.
    #[serde(default)]
    pub filters: FiltersConfig,

    /// Deletion-safety settings.
    #[serde(default)]
    pub safety: SafetyConfig,

    /// Optional summary pass.
    #[serde(default)]
    pub summaries: SummariesConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Path to the libSQL database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Added to the dot-depth of every outline line.
    #[serde(default)]
    pub level_offset: u8,

    /// Outline lines deeper than this level are dropped.
    #[serde(default = "default_level_cap")]
    pub level_cap: u8,

    /// Keep the staging batch after a successful promotion.
    #[serde(default)]
    pub keep_staging: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            level_offset: 0,
            level_cap: default_level_cap(),
            keep_staging: false,
        }
    }
}

fn default_database_path() -> String {
    "var/topicsync.db".into()
}
fn default_level_cap() -> u8 {
    4
}

/// `[embedding]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Run the embedding phase after promotion.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL of an OpenAI-compatible embeddings API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Embedding model name.
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Requested vector dimensions (model default when unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,

    /// Topics per embedding request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Retries per batch after the first attempt before the phase is aborted.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_embedding_model(),
            dimensions: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> usize {
    4
}
fn default_timeout_secs() -> u64 {
    60
}

/// `[filters]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiltersConfig {
    /// Case-insensitive regexes matched against normalized titles.
    /// Matching sections are administrative, not curricular.
    #[serde(default = "default_title_denylist")]
    pub title_denylist: Vec<String>,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            title_denylist: default_title_denylist(),
        }
    }
}

fn default_title_denylist() -> Vec<String> {
    vec![
        r"^(subject |course |specification )?overview$".into(),
        r"^(introduction|overview) to (the|this) (specification|course|qualification)$".into(),
        r"^assessment( overview| objectives| structure| information)?$".into(),
        r"^skills for learning\b".into(),
        r"^(scheme|schemes) of assessment$".into(),
    ]
}

/// `[safety]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Downstream tables holding a topic foreign key.
    #[serde(default = "default_reference_tables")]
    pub reference_tables: Vec<ReferenceTable>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            reference_tables: default_reference_tables(),
        }
    }
}

/// `[[safety.reference_tables]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceTable {
    pub table: String,
    pub column: String,
}

impl ReferenceTable {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

fn default_reference_tables() -> Vec<ReferenceTable> {
    vec![
        ReferenceTable::new("study_cards", "topic_id"),
        ReferenceTable::new("topic_bookmarks", "topic_id"),
    ]
}

/// `[summaries]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummariesConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Summaries longer than this are truncated on a word boundary.
    #[serde(default = "default_summary_max_chars")]
    pub max_chars: usize,
}

impl Default for SummariesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_chars: default_summary_max_chars(),
        }
    }
}

fn default_summary_max_chars() -> usize {
    240
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.topicsync/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| TopicSyncError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.topicsync/topicsync.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| TopicSyncError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| TopicSyncError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| TopicSyncError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| TopicSyncError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| TopicSyncError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the embedding API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.embedding.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(TopicSyncError::config(format!(
            "embedding API key not found. Set the {var_name} environment variable \
             or run with --no-embeddings."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("database_path"));
        assert!(toml_str.contains("OPENAI_API_KEY"));
        assert!(toml_str.contains("study_cards"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.level_cap, 4);
        assert_eq!(parsed.embedding.batch_size, 32);
        assert_eq!(parsed.safety.reference_tables.len(), 2);
        assert!(!parsed.summaries.enabled);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[defaults]
database_path = "/tmp/topics.db"
level_offset = 1

[embedding]
batch_size = 8

[[safety.reference_tables]]
table = "flashcards"
column = "topic_id"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.defaults.database_path, "/tmp/topics.db");
        assert_eq!(config.defaults.level_offset, 1);
        assert_eq!(config.defaults.level_cap, 4);
        assert_eq!(config.embedding.batch_size, 8);
        assert_eq!(config.embedding.max_retries, 4);
        assert_eq!(
            config.safety.reference_tables,
            vec![ReferenceTable::new("flashcards", "topic_id")]
        );
        assert!(!config.filters.title_denylist.is_empty());
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.embedding.api_key_env = "TS_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
