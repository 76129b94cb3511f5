use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::TaxonError;

/// Secrets and environment-specific values. Models, limits and thresholds
/// live in the TOML [`FileConfig`].
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub config_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            database_url: env::var("DATABASE_URL").ok(),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            openai_base_url: env::var("OPENAI_BASE_URL").ok(),
            config_path: env::var("TAXON_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("taxon.toml")),
        }
    }

    pub fn require_database_url(&self) -> Result<&str, TaxonError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| TaxonError::Config("DATABASE_URL environment variable is required".into()))
    }

    pub fn require_openai_api_key(&self) -> Result<&str, TaxonError> {
        self.openai_api_key
            .as_deref()
            .ok_or_else(|| TaxonError::Config("OPENAI_API_KEY environment variable is required".into()))
    }

    pub fn log_redacted(&self) {
        fn preview(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => {
                    let n = v.char_indices().nth(5).map(|(i, _)| i).unwrap_or(v.len());
                    format!("{}...({} chars)", &v[..n], v.len())
                }
                _ => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", preview(&self.database_url));
        tracing::info!("  OPENAI_API_KEY: {}", preview(&self.openai_api_key));
        tracing::info!("  OPENAI_BASE_URL: {}", preview(&self.openai_base_url));
        tracing::info!("  TAXON_CONFIG: {}", self.config_path.display());
    }
}

/// TOML-backed configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ModelsConfig {
    pub classification: String,
    pub extraction: String,
    pub merge: String,
    pub analysis: String,
    pub embedding: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            classification: "gpt-4o-mini".to_string(),
            extraction: "gpt-4o".to_string(),
            merge: "gpt-4o".to_string(),
            analysis: "gpt-4o".to_string(),
            embedding: "text-embedding-3-small".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IngestConfig {
    /// Upper bound on tool-loop turns in the post-store analysis session.
    pub max_session_turns: usize,
    pub parent_candidate_limit: usize,
    pub dedup_top_k: usize,
    /// Deadline for a whole batch call. `None` disables it.
    pub batch_deadline_secs: Option<u64>,
    pub max_payload_chars: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_session_turns: 10,
            parent_candidate_limit: 50,
            dedup_top_k: 5,
            batch_deadline_secs: None,
            max_payload_chars: 30_000,
        }
    }
}

impl FileConfig {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config TOML")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), "No config file found, using defaults");
            Ok(Self::default())
        }
    }
}
