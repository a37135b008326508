//! Deployment configuration.
//!
//! Two YAML files drive an instance: the provider config (`CONFIG_PATH`,
//! public, one per upstream) and the instance config (`INSTANCE_CONFIG`,
//! gitignored, carries secrets). Environment variables override both.
//! A missing instance file is not an error — env vars and defaults apply.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Retry behaviour for upstream calls, overridable per provider via the
/// `retry` section of the provider YAML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_s: f64,
    pub backoff_factor: f64,
    pub max_delay_s: f64,
    pub retry_on: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_s: 1.0,
            backoff_factor: 2.0,
            max_delay_s: 60.0,
            retry_on: vec![429, 500, 502, 503, 504],
        }
    }
}

/// Provider configuration loaded from `CONFIG_PATH`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub api_base: String,
    pub default_model: String,
    #[serde(default)]
    pub models: Option<Vec<String>>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub tts_model: Option<String>,
    #[serde(default)]
    pub image_model: Option<String>,
    #[serde(default)]
    pub audio_model: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl ProviderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content)
            .map_err(|e| GatewayError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_yaml(content: &str) -> std::result::Result<Self, String> {
        let config: ProviderConfig =
            serde_yaml::from_str(content).map_err(|e| e.to_string())?;
        for (field, value) in [
            ("name", &config.name),
            ("api_base", &config.api_base),
            ("default_model", &config.default_model),
        ] {
            if value.trim().is_empty() {
                return Err(format!("required field '{field}' is empty"));
            }
        }
        Ok(config)
    }

    /// Advertised model list; falls back to the default model.
    pub fn models(&self) -> Vec<String> {
        match &self.models {
            Some(models) if !models.is_empty() => models.clone(),
            _ => vec![self.default_model.clone()],
        }
    }
}

/// Retention policy for dialog logs and the cost store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionPolicy {
    pub log_max_age_days: u64,
    pub log_max_size_mb: u64,
    pub log_compress: bool,
    pub metrics_max_age_days: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            log_max_age_days: 30,
            log_max_size_mb: 500,
            log_compress: true,
            metrics_max_age_days: 90,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DatabaseSection {
    #[serde(default)]
    url: Option<String>,
}

/// Instance secrets and operational switches, loaded from
/// `INSTANCE_CONFIG`. Env vars win over the file, the file wins over
/// defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    log_requests: Option<bool>,
    #[serde(default)]
    database: DatabaseSection,
    #[serde(default)]
    retention: Option<RetentionPolicy>,
}

impl InstanceConfig {
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => {
                tracing::info!(path = %path.display(), "instance config not found, using env vars and defaults");
                return Self::default();
            }
        };
        match serde_yaml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "instance config unreadable, using defaults");
                Self::default()
            }
        }
    }

    /// API key resolution: `env_var` > instance file > empty.
    pub fn api_key(&self, env_var: &str) -> String {
        std::env::var(env_var)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.api_key.clone())
            .unwrap_or_default()
    }

    /// Dialog logging switch: `LOG_REQUESTS` env > instance file > true.
    pub fn log_requests(&self) -> bool {
        match std::env::var("LOG_REQUESTS")
            .unwrap_or_default()
            .trim()
            .to_lowercase()
            .as_str()
        {
            "false" | "0" | "no" => return false,
            "true" | "1" | "yes" => return true,
            _ => {}
        }
        self.log_requests.unwrap_or(true)
    }

    /// Cost-store URL: `DATABASE_URL` env > instance file > SQLite under
    /// the data dir. Relative sqlite paths are resolved against
    /// `data_dir`.
    pub fn database_url(&self, data_dir: &Path) -> String {
        let url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.database.url.clone())
            .unwrap_or_else(|| format!("sqlite:///{}/costs.db", data_dir.display()));
        normalize_sqlite_url(&url, data_dir)
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention.clone().unwrap_or_default()
    }
}

/// Anchor relative `sqlite:///` paths at the data directory. Absolute
/// paths and non-sqlite URLs pass through untouched.
pub fn normalize_sqlite_url(url: &str, data_dir: &Path) -> String {
    let Some(rest) = url.strip_prefix("sqlite:///") else {
        return url.to_string();
    };
    if rest.starts_with('/') {
        return url.to_string();
    }
    let rel = rest.strip_prefix("data/").unwrap_or(rest);
    format!("sqlite:///{}", data_dir.join(rel).display())
}

/// Env var carrying the API key for each of the shipped provider types.
pub fn api_key_env_var(provider_type: &str) -> Option<&'static str> {
    match provider_type {
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "openai" => Some("OPENAI_API_KEY"),
        "google" => Some("GOOGLE_API_KEY"),
        _ => None,
    }
}
