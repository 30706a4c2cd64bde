//! TOML configuration parsing and validation.
//!
//! Every section has defaults, so an empty file (or [`Config::default`])
//! yields a runnable in-process service with the provider disabled.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8000"
//!
//! [rate_limit]
//! max_requests = 100
//! window_seconds = 60
//!
//! [cache]
//! realtime_ttl_secs = 3600
//! historical_ttl_secs = 86400
//!
//! [provider]
//! kind = "openai"
//! embedding_model = "text-embedding-ada-002"
//! completion_model = "gpt-4"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_min_api_key_len")]
    pub min_api_key_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            min_api_key_len: default_min_api_key_len(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_min_api_key_len() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_seconds: default_window_seconds(),
        }
    }
}

fn default_max_requests() -> usize {
    100
}
fn default_window_seconds() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_realtime_ttl")]
    pub realtime_ttl_secs: u64,
    #[serde(default = "default_historical_ttl")]
    pub historical_ttl_secs: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            realtime_ttl_secs: default_realtime_ttl(),
            historical_ttl_secs: default_historical_ttl(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_realtime_ttl() -> u64 {
    3600
}
fn default_historical_ttl() -> u64 {
    86400
}
fn default_key_prefix() -> String {
    "financial_rag".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: String,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub completion_model: Option<String>,
    /// Base URL override (Ollama, or an OpenAI-compatible gateway).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            embedding_model: None,
            completion_model: None,
            url: None,
            min_interval_ms: default_min_interval_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider_kind() -> String {
    "disabled".to_string()
}
fn default_min_interval_ms() -> u64 {
    50
}
fn default_timeout_secs() -> u64 {
    30
}

impl ProviderConfig {
    pub fn is_enabled(&self) -> bool {
        self.kind != "disabled"
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuditConfig {
    /// SQLite file for the audit trail. Audit is disabled when unset.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl Config {
    /// Check cross-field invariants that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.max_requests == 0 {
            bail!("rate_limit.max_requests must be >= 1");
        }
        if self.rate_limit.window_seconds == 0 {
            bail!("rate_limit.window_seconds must be >= 1");
        }
        if self.cache.realtime_ttl_secs == 0 || self.cache.historical_ttl_secs == 0 {
            bail!("cache TTLs must be >= 1 second");
        }
        if self.cache.realtime_ttl_secs > self.cache.historical_ttl_secs {
            bail!("cache.realtime_ttl_secs must not exceed cache.historical_ttl_secs");
        }
        if self.retrieval.top_k == 0 {
            bail!("retrieval.top_k must be >= 1");
        }
        if self.provider.timeout_secs == 0 {
            bail!("provider.timeout_secs must be >= 1");
        }

        match self.provider.kind.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => bail!(
                "Unknown provider kind: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }

        if self.provider.is_enabled() {
            if self.provider.embedding_model.is_none() {
                bail!(
                    "provider.embedding_model must be specified when kind is '{}'",
                    self.provider.kind
                );
            }
            if self.provider.completion_model.is_none() {
                bail!(
                    "provider.completion_model must be specified when kind is '{}'",
                    self.provider.kind
                );
            }
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
