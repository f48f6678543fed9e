//! Configuration file support for deskpilot
//!
//! Config is loaded from `~/.deskpilot/config.toml` (or
//! `$DESKPILOT_HOME/config.toml`). Environment variables override config
//! file settings.

use crate::storage::deskpilot_dir;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global config instance (loaded once on first access)
pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::load)
}

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Provider endpoint and model settings
    pub provider: ProviderConfig,

    /// Retry protocol constants
    pub retry: RetryConfig,

    /// Context window tracking and auto-compaction
    pub context: ContextConfig,
}

/// Provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Chat-completions endpoint base, without trailing path
    pub base_url: String,
    /// Default model id
    pub model: String,
    /// Environment variable holding the API key (never the key itself)
    pub api_key_env: String,
    /// Sampling temperature; omitted from requests when unset
    pub temperature: Option<f32>,
    /// Response token cap per request
    pub max_tokens: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "DESKPILOT_API_KEY".to_string(),
            temperature: None,
            max_tokens: 8192,
        }
    }
}

impl ProviderConfig {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

/// Retry protocol constants. The phased mechanism itself is fixed
/// (bounded attempts, one cooldown, bounded attempts, terminal); only the
/// counts and durations are configurable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per phase
    pub max_attempts: u32,
    /// Base backoff delay; attempt n waits base * 2^(n-1)
    pub base_delay_ms: u64,
    /// Cooldown between the two attempt phases
    pub cooldown_secs: u64,
    /// Wall-clock cap on a single request
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            cooldown_secs: 120,
            request_timeout_secs: 600,
        }
    }
}

/// Context tracking configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Model context window size used for usage percentages
    pub max_tokens: u64,
    /// Run compaction automatically when the tracker trigger fires
    pub auto_compact: bool,
    /// Usage percent at which the trigger fires, in (0, 100]
    pub compact_threshold_percent: f32,
    /// Messages kept verbatim at the tail when compacting
    pub keep_recent_messages: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 128_000,
            auto_compact: true,
            compact_threshold_percent: 80.0,
            keep_recent_messages: 10,
        }
    }
}

impl Config {
    /// Load config from disk, then apply environment overrides.
    fn load() -> Self {
        let mut config = Self::load_file().unwrap_or_default();
        config.apply_env_overrides();
        config
    }

    fn load_file() -> Option<Self> {
        let path = deskpilot_dir().ok()?.join("config.toml");
        let text = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&text) {
            Ok(config) => Some(config),
            Err(e) => {
                crate::logging::warn(&format!("Ignoring malformed config.toml: {}", e));
                None
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DESKPILOT_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Ok(model) = std::env::var("DESKPILOT_MODEL") {
            self.provider.model = model;
        }
        if let Ok(max) = std::env::var("DESKPILOT_CONTEXT_TOKENS") {
            if let Ok(max) = max.parse() {
                self.context.max_tokens = max;
            }
        }
    }
}
