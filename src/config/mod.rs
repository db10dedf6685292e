//! Configuration management for conversation memory
//!
//! Precedence: environment > TOML file > defaults. Validated once at load.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

use file::MemoryConfigFile;

/// Default per-conversation token budget
pub const DEFAULT_TOKEN_LIMIT: i64 = 128_000;

/// Default fraction of the budget to compact down to
pub const DEFAULT_TARGET_RATIO: f64 = 0.8;

/// Default character ceiling for the truncation fallback
pub const DEFAULT_FALLBACK_MAX_CHARS: usize = 1000;

/// Top-level configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the `SQLite` database
    pub database_path: PathBuf,

    /// Token budgeting and compaction
    pub memory: MemoryConfig,

    /// Summarizer provider
    pub summarizer: SummarizerConfig,
}

/// Token budgeting and compaction settings
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Budget given to new conversations
    pub token_limit: i64,

    /// Fraction of the budget to compact down to, in (0, 1]
    pub target_ratio: f64,

    /// Raw messages included in model context
    pub recent_limit: i64,

    /// Most recent raw messages never compacted
    pub preserve_recent_messages: usize,

    /// Transcript characters kept when the summarizer fails
    pub fallback_max_chars: usize,

    /// Timeout for one summarizer call
    pub summarize_timeout: Duration,

    /// Inactivity after which `cleanup` deletes a conversation
    pub inactive_days: i64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            token_limit: DEFAULT_TOKEN_LIMIT,
            target_ratio: DEFAULT_TARGET_RATIO,
            recent_limit: 10,
            preserve_recent_messages: 2,
            fallback_max_chars: DEFAULT_FALLBACK_MAX_CHARS,
            summarize_timeout: Duration::from_secs(60),
            inactive_days: 30,
        }
    }
}

impl MemoryConfig {
    /// Check values that would make compaction meaningless
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid field
    pub fn validate(&self) -> Result<()> {
        validate_budget(self.token_limit, self.target_ratio)?;

        if self.fallback_max_chars == 0 {
            return Err(Error::Config(
                "fallback_max_chars must be positive".to_string(),
            ));
        }
        if self.summarize_timeout.is_zero() {
            return Err(Error::Config(
                "summarize_timeout must be positive".to_string(),
            ));
        }
        if self.inactive_days <= 0 {
            return Err(Error::Config(format!(
                "inactive_days must be positive, got {}",
                self.inactive_days
            )));
        }

        Ok(())
    }
}

/// Validate a token limit and target ratio pair
///
/// # Errors
///
/// Returns `Error::Config` if `token_limit <= 0` or `target_ratio` is outside (0, 1]
pub fn validate_budget(token_limit: i64, target_ratio: f64) -> Result<()> {
    if token_limit <= 0 {
        return Err(Error::Config(format!(
            "token limit must be positive, got {token_limit}"
        )));
    }
    if !(target_ratio > 0.0 && target_ratio <= 1.0) {
        return Err(Error::Config(format!(
            "target ratio must be in (0, 1], got {target_ratio}"
        )));
    }
    Ok(())
}

/// Summarizer provider settings
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    /// Base URL of an OpenAI-compatible API
    pub api_url: String,

    /// Model identifier
    pub model: String,

    /// API key; without one every compaction uses the truncation fallback
    pub api_key: Option<String>,

    /// Sampling temperature
    pub temperature: f32,

    /// Completion token cap
    pub max_tokens: u32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            temperature: 0.2,
            max_tokens: 512,
        }
    }
}

/// Default database path: `~/.local/share/docchat/memory.db` on Linux
fn default_database_path() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("docchat-memory.db"),
        |d| d.data_dir().join("docchat").join("memory.db"),
    )
}

impl Config {
    /// Load configuration from the environment and an optional TOML file
    ///
    /// `config_path` overrides the standard `~/.config/docchat/memory.toml`.
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(config_path);
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn from_sources<F>(fc: MemoryConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = MemoryConfig::default();

        // Memory settings (env > toml > default)
        let memory = MemoryConfig {
            token_limit: env_parse(&env, "DOCCHAT_TOKEN_LIMIT")
                .or(fc.memory.token_limit)
                .unwrap_or(defaults.token_limit),
            target_ratio: env_parse(&env, "DOCCHAT_TARGET_RATIO")
                .or(fc.memory.target_ratio)
                .unwrap_or(defaults.target_ratio),
            recent_limit: env_parse(&env, "DOCCHAT_RECENT_LIMIT")
                .or(fc.memory.recent_limit)
                .unwrap_or(defaults.recent_limit),
            preserve_recent_messages: fc
                .memory
                .preserve_recent_messages
                .unwrap_or(defaults.preserve_recent_messages),
            fallback_max_chars: fc
                .memory
                .fallback_max_chars
                .unwrap_or(defaults.fallback_max_chars),
            summarize_timeout: env_parse(&env, "DOCCHAT_SUMMARIZE_TIMEOUT_SECS")
                .or(fc.memory.summarize_timeout_secs)
                .map_or(defaults.summarize_timeout, Duration::from_secs),
            inactive_days: fc.memory.inactive_days.unwrap_or(defaults.inactive_days),
        };
        memory.validate()?;

        // Summarizer settings (env > toml > default)
        let summarizer_defaults = SummarizerConfig::default();
        let summarizer = SummarizerConfig {
            api_url: env("DOCCHAT_SUMMARIZER_URL")
                .or(fc.summarizer.api_url)
                .unwrap_or(summarizer_defaults.api_url),
            model: env("DOCCHAT_SUMMARIZER_MODEL")
                .or(fc.summarizer.model)
                .unwrap_or(summarizer_defaults.model),
            api_key: env("OPENAI_API_KEY")
                .or(fc.summarizer.api_key)
                .filter(|k| !k.trim().is_empty()),
            temperature: fc
                .summarizer
                .temperature
                .unwrap_or(summarizer_defaults.temperature),
            max_tokens: fc
                .summarizer
                .max_tokens
                .unwrap_or(summarizer_defaults.max_tokens),
        };

        let database_path = env("DOCCHAT_DB_PATH")
            .or(fc.database_path)
            .map_or_else(default_database_path, PathBuf::from);

        Ok(Self {
            database_path,
            memory,
            summarizer,
        })
    }
}

/// Parse an environment variable, ignoring (with a warning) values that don't parse
fn env_parse<T, F>(env: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}
