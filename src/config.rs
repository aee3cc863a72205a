//! Middleware configuration.
//!
//! A `Config` is built once at startup, either explicitly through
//! [`ConfigBuilder`] or from the environment, and is read-only afterwards.
//!
//! Environment:
//! - GOOGLE_API_KEY                 -> direct Gemini API key
//! - GOOGLE_CLOUD_PROJECT           -> Vertex AI project (selects Vertex unless disabled)
//! - GOOGLE_CLOUD_LOCATION          -> Vertex AI location
//! - REVENIUM_METERING_API_KEY      -> metering credential (required, `hak_` prefix)
//! - REVENIUM_METERING_BASE_URL     -> metering base URL (default https://api.revenium.ai)
//! - REVENIUM_VERTEX_DISABLE        -> force the direct Gemini API
//! - REVENIUM_DEBUG                 -> verbose logging
//! - REVENIUM_CAPTURE_PROMPTS       -> opt in to prompt/response capture

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::util::{env_flag, env_non_empty};

pub const DEFAULT_BASE_URL: &str = "https://api.revenium.ai";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const API_KEY_PREFIX: &str = "hak_";

#[derive(Clone)]
pub struct Config {
    pub google_api_key: Option<String>,
    pub project_id: Option<String>,
    pub location: Option<String>,
    pub revenium_api_key: String,
    /// Normalized: no trailing slash, no `/meter`, `/meter/v2` or `/v2` suffix.
    pub revenium_base_url: String,
    pub vertex_disabled: bool,
    pub debug: bool,
    pub capture_prompts: bool,
    /// Per-attempt timeout for metering requests.
    pub request_timeout: Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("google_api_key", &self.google_api_key.as_ref().map(|_| "<redacted>"))
            .field("project_id", &self.project_id)
            .field("location", &self.location)
            .field("revenium_api_key", &"<redacted>")
            .field("revenium_base_url", &self.revenium_base_url)
            .field("vertex_disabled", &self.vertex_disabled)
            .field("debug", &self.debug)
            .field("capture_prompts", &self.capture_prompts)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load `.env` files, then read everything from the environment.
    pub fn from_env() -> Result<Self> {
        ConfigBuilder::default().build_with_env()
    }

    /// Check the metering credential.
    pub fn validate(&self) -> Result<()> {
        if self.revenium_api_key.is_empty() {
            return Err(Error::config("REVENIUM_METERING_API_KEY is required"));
        }
        if !is_valid_api_key_format(&self.revenium_api_key) {
            return Err(Error::config("invalid Revenium API key format"));
        }
        tracing::debug!("configuration validation passed");
        Ok(())
    }
}

/// Explicit configuration values. Anything left unset falls back to the
/// environment in [`ConfigBuilder::build_with_env`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    google_api_key: Option<String>,
    project_id: Option<String>,
    location: Option<String>,
    revenium_api_key: Option<String>,
    revenium_base_url: Option<String>,
    vertex_disabled: Option<bool>,
    debug: Option<bool>,
    capture_prompts: Option<bool>,
    request_timeout: Option<Duration>,
}

impl ConfigBuilder {
    pub fn google_api_key(mut self, key: impl Into<String>) -> Self {
        self.google_api_key = Some(key.into());
        self
    }

    pub fn project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn revenium_api_key(mut self, key: impl Into<String>) -> Self {
        self.revenium_api_key = Some(key.into());
        self
    }

    pub fn revenium_base_url(mut self, url: impl Into<String>) -> Self {
        self.revenium_base_url = Some(url.into());
        self
    }

    pub fn vertex_disabled(mut self, disabled: bool) -> Self {
        self.vertex_disabled = Some(disabled);
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    /// System prompts, input messages and output text are sent with the
    /// metering payload, truncated at 50,000 characters per field.
    pub fn capture_prompts(mut self, capture: bool) -> Self {
        self.capture_prompts = Some(capture);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Build from explicit values only. The environment is not consulted.
    pub fn build(self) -> Result<Config> {
        let base_url = self
            .revenium_base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let config = Config {
            google_api_key: non_empty(self.google_api_key),
            project_id: non_empty(self.project_id),
            location: non_empty(self.location),
            revenium_api_key: self.revenium_api_key.unwrap_or_default().trim().to_string(),
            revenium_base_url: normalize_base_url(&base_url),
            vertex_disabled: self.vertex_disabled.unwrap_or(false),
            debug: self.debug.unwrap_or(false),
            capture_prompts: self.capture_prompts.unwrap_or(false),
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load `.env` files, fill unset values from the environment, then build.
    /// Explicit values always take precedence over the environment.
    pub fn build_with_env(self) -> Result<Config> {
        let loaded = load_env_files();
        if !loaded.is_empty() {
            tracing::debug!(files = ?loaded, "environment files loaded");
        }
        self.merge_env().build()
    }

    fn merge_env(self) -> Self {
        Self {
            google_api_key: self.google_api_key.or_else(|| env_non_empty("GOOGLE_API_KEY")),
            project_id: self
                .project_id
                .or_else(|| env_non_empty("GOOGLE_CLOUD_PROJECT")),
            location: self
                .location
                .or_else(|| env_non_empty("GOOGLE_CLOUD_LOCATION")),
            revenium_api_key: self
                .revenium_api_key
                .or_else(|| env_non_empty("REVENIUM_METERING_API_KEY")),
            revenium_base_url: self
                .revenium_base_url
                .or_else(|| env_non_empty("REVENIUM_METERING_BASE_URL")),
            vertex_disabled: self
                .vertex_disabled
                .or_else(|| Some(env_flag("REVENIUM_VERTEX_DISABLE"))),
            debug: self.debug.or_else(|| Some(env_flag("REVENIUM_DEBUG"))),
            capture_prompts: self
                .capture_prompts
                .or_else(|| Some(env_flag("REVENIUM_CAPTURE_PROMPTS"))),
            request_timeout: self.request_timeout,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn is_valid_api_key_format(key: &str) -> bool {
    key.len() > API_KEY_PREFIX.len() && key.starts_with(API_KEY_PREFIX)
}

/// Normalize a metering base URL to the bare origin.
///
/// Endpoint paths (`/meter/v2/ai/...`) are appended at delivery time, so a
/// trailing slash and any `/meter/v2`, `/meter` or `/v2` suffix are removed.
pub fn normalize_base_url(base_url: &str) -> String {
    let trimmed = base_url.trim();
    let url = trimmed.strip_suffix('/').unwrap_or(trimmed);
    for suffix in ["/meter/v2", "/meter", "/v2"] {
        if let Some(stripped) = url.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    url.to_string()
}

/// Load `.env.local` then `.env` from the working directory and its parent.
///
/// dotenvy never overwrites variables that are already set, so process
/// environment beats `.env.local`, which beats `.env`.
pub fn load_env_files() -> Vec<PathBuf> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    load_env_files_from(&cwd)
}

pub(crate) fn load_env_files_from(dir: &Path) -> Vec<PathBuf> {
    let mut search_dirs = vec![dir.to_path_buf()];
    if let Some(parent) = dir.parent() {
        search_dirs.push(parent.to_path_buf());
    }

    let mut loaded = Vec::new();
    for dir in search_dirs {
        for name in [".env.local", ".env"] {
            let candidate = dir.join(name);
            if candidate.is_file() && dotenvy::from_path(&candidate).is_ok() {
                loaded.push(candidate);
            }
        }
    }
    loaded
}
