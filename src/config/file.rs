//! TOML configuration file loading
//!
//! Supports `~/.config/docchat/memory.toml` as a persistent config source.
//! All fields are optional; the file overlays the defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct MemoryConfigFile {
    /// `SQLite` database path
    #[serde(default)]
    pub database_path: Option<String>,

    /// Token budgeting and compaction settings
    #[serde(default)]
    pub memory: MemoryFileConfig,

    /// Summarizer provider settings
    #[serde(default)]
    pub summarizer: SummarizerFileConfig,
}

/// Token budgeting and compaction settings
#[derive(Debug, Default, Deserialize)]
pub struct MemoryFileConfig {
    pub token_limit: Option<i64>,
    pub target_ratio: Option<f64>,
    pub recent_limit: Option<i64>,
    pub preserve_recent_messages: Option<usize>,
    pub fallback_max_chars: Option<usize>,
    pub summarize_timeout_secs: Option<u64>,
    pub inactive_days: Option<i64>,
}

/// Summarizer provider settings
#[derive(Debug, Default, Deserialize)]
pub struct SummarizerFileConfig {
    /// Base URL of an OpenAI-compatible API (e.g. "https://api.openai.com/v1")
    pub api_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Parse configuration file contents
///
/// # Errors
///
/// Returns error if the contents are not valid TOML for this schema
pub fn parse_config_file(content: &str) -> Result<MemoryConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the TOML config file from `path`, or the standard path when `None`
///
/// Returns `MemoryConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> MemoryConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return MemoryConfigFile::default();
    };

    if !path.exists() {
        return MemoryConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config_file(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                MemoryConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            MemoryConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/docchat/memory.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("docchat").join("memory.toml"))
}
