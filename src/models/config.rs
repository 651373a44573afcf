//! Configuration models for reroll.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns via config file or CLI flags.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Top-level configuration for reroll.
///
/// Every section has defaults, so an empty file (or no file) is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Chat-completions endpoint configuration
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Sampling parameters, fixed for the whole run
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Orchestration settings
    #[serde(default)]
    pub run: RunConfig,
}

/// Configuration for the OpenAI-compatible endpoint.
///
/// K_i: The endpoint must speak the chat completions API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Chat completions URL (or base URL, `/chat/completions` is appended)
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Model name sent with every request
    #[serde(default = "default_model")]
    pub model: String,

    /// API key (optional, local servers usually need none)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name for the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Custom headers to include in requests.
    /// Values can contain ${ENV_VAR} for environment variable expansion
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Per-call deadline in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Attempts per call before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_api_url() -> String {
    "http://localhost:30000/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "deepseek-ai/DeepSeek-V3.2".to_string()
}

fn default_timeout() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    5
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            model: default_model(),
            api_key: None,
            api_key_env: None,
            headers: HashMap::new(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

/// Sampling parameters.
///
/// K_i: The same values are used for every call of a run, never tuned per turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    2048
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum records regenerating at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

/// Largest semaphore a run can hold.
pub const MAX_CONCURRENCY: usize = tokio::sync::Semaphore::MAX_PERMITS;

fn default_concurrency() -> usize {
    3000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml(&content, path)
    }

    /// Parse configuration from TOML text. `path` is only used in errors.
    pub fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    ///
    /// Used for the implicit default config path; an explicitly requested
    /// file should go through [`Config::from_file`].
    pub fn from_file_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the API key from config or environment.
    ///
    /// Returns `Ok(None)` when no key is configured at all.
    pub fn resolve_api_key(&self) -> Result<Option<String>, ConfigError> {
        if let Some(key) = &self.endpoint.api_key {
            return Ok(Some(expand_env_vars(key)));
        }

        match &self.endpoint.api_key_env {
            Some(env_var) => std::env::var(env_var)
                .map(Some)
                .map_err(|_| ConfigError::MissingApiKey {
                    env_var: env_var.clone(),
                }),
            None => Ok(None),
        }
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.concurrency == 0 {
            return Err(ConfigError::Invalid("run.concurrency must be at least 1".into()));
        }
        if self.run.concurrency > MAX_CONCURRENCY {
            return Err(ConfigError::Invalid(format!(
                "run.concurrency must be at most {MAX_CONCURRENCY}"
            )));
        }
        if self.endpoint.max_retries == 0 {
            return Err(ConfigError::Invalid("endpoint.max_retries must be at least 1".into()));
        }
        if self.endpoint.model.trim().is_empty() {
            return Err(ConfigError::Invalid("endpoint.model must not be empty".into()));
        }
        Ok(())
    }
}

static ENV_VAR_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("valid env var pattern"));

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();

    for cap in ENV_VAR_RE.captures_iter(s) {
        if let Ok(value) = std::env::var(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Expand environment variables in all headers.
pub fn expand_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_vars(v)))
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing API key: {env_var} is not set")]
    MissingApiKey { env_var: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
