//! Runtime configuration, loaded from TOML with environment overrides.

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::docs::extract::DEFAULT_MAX_TEXT_LEN;
use crate::docs::index::{IndexSettings, DEFAULT_SNIPPET_LEN};
use crate::docs::pagination::{Paginator, DEFAULT_PAGE_WINDOW};
use crate::docs::scoring::ScorerKind;
use crate::docs::ServiceSettings;

pub const ENV_HOST: &str = "LASTDOC_HOST";
pub const ENV_PORT: &str = "LASTDOC_PORT";
pub const ENV_DATA_DIR: &str = "LASTDOC_DATA_DIR";
pub const ENV_LOG: &str = "LASTDOC_LOG";

const CONFIG_FILE: &str = "config.toml";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "lastdoc")
}

/// `<config dir>/config.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

fn default_data_dir() -> String {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_string_lossy().into_owned())
        .unwrap_or_else(|| "~/.lastdoc".to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub pagination: PaginationConfig,
    pub indexing: IndexingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted request body, uploads included.
    pub max_body_bytes: usize,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8088,
            max_body_bytes: 50 * 1024 * 1024,
            request_timeout_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for stored content and the index database. `~` is expanded.
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).into_owned())
    }

    pub fn content_dir(&self) -> PathBuf {
        self.data_path().join("content")
    }

    pub fn index_db(&self) -> PathBuf {
        self.data_path().join("index.db")
    }

    pub fn catalog_db(&self) -> PathBuf {
        self.data_path().join("catalog.db")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PaginationConfig {
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Page links shown around the current page.
    pub page_window: usize,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_page_size: 10,
            max_page_size: 100,
            page_window: DEFAULT_PAGE_WINDOW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct IndexingConfig {
    /// Build an index as soon as a version completes.
    pub auto_index: bool,
    pub scorer: ScorerKind,
    /// Characters of extracted text kept as a search snippet.
    pub snippet_len: usize,
    /// Extracted text beyond this many bytes is not indexed.
    pub max_text_len: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            auto_index: true,
            scorer: ScorerKind::TermFrequency,
            snippet_len: DEFAULT_SNIPPET_LEN,
            max_text_len: DEFAULT_MAX_TEXT_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` wins when set.
    pub level: String,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

impl Config {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match default_config_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let expanded = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned());
        let raw = std::fs::read_to_string(&expanded)
            .with_context(|| format!("failed to read config file {}", expanded.display()))?;
        Self::from_toml(&raw).with_context(|| format!("invalid config file {}", expanded.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("failed to parse config TOML")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize config")
    }

    pub fn json_schema() -> Result<String> {
        serde_json::to_string_pretty(&schemars::schema_for!(Config)).context("failed to serialize config schema")
    }

    /// Apply `LASTDOC_*` overrides read through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup(ENV_HOST).filter(|v| !v.trim().is_empty()) {
            self.server.host = host.trim().to_string();
        }
        if let Some(port) = lookup(ENV_PORT).filter(|v| !v.trim().is_empty()) {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PORT} must be a port number, got '{port}'"))?;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.trim().is_empty()) {
            self.storage.data_dir = dir;
        }
        if let Some(level) = lookup(ENV_LOG).filter(|v| !v.trim().is_empty()) {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("server.port must be greater than 0");
        }
        if self.server.host.trim().is_empty() {
            bail!("server.host must not be empty");
        }
        if self.server.max_body_bytes == 0 {
            bail!("server.max_body_bytes must be greater than 0");
        }
        if self.server.request_timeout_secs == 0 {
            bail!("server.request_timeout_secs must be greater than 0");
        }
        if self.storage.data_dir.trim().is_empty() {
            bail!("storage.data_dir must not be empty");
        }
        let p = &self.pagination;
        if p.default_page_size == 0 || p.max_page_size == 0 {
            bail!("pagination page sizes must be greater than 0");
        }
        if p.default_page_size > p.max_page_size {
            bail!(
                "pagination.default_page_size ({}) exceeds max_page_size ({})",
                p.default_page_size,
                p.max_page_size
            );
        }
        if self.indexing.max_text_len == 0 {
            bail!("indexing.max_text_len must be greater than 0");
        }
        if self.indexing.snippet_len == 0 {
            bail!("indexing.snippet_len must be greater than 0");
        }
        Ok(())
    }

    pub fn paginator(&self) -> Paginator {
        Paginator {
            default_page_size: self.pagination.default_page_size,
            max_page_size: self.pagination.max_page_size,
            window: self.pagination.page_window,
        }
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            paginator: self.paginator(),
            index: IndexSettings {
                snippet_len: self.indexing.snippet_len,
                max_text_len: self.indexing.max_text_len,
            },
            scorer: self.indexing.scorer,
        }
    }
}
