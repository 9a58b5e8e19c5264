//! Server configuration.
//!
//! Values are layered: built-in defaults, then the TOML file, then
//! `TIDINGS__SECTION__KEY` environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::context::DEFAULT_CONTEXT;
use crate::llm::{DEFAULT_LIMIT, DEFAULT_MODEL};

pub const APP_NAME: &str = "tidings";

const DATABASE_FILE: &str = "tidings.db";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub infra: InfraConfig,
    pub chat: ChatConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// OpenAI-compatible HTTP API (including Azure).
    #[default]
    Openai,
    /// Echoes prompts back. Needs no credentials.
    Mock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    /// Empty means the public OpenAI endpoint.
    pub base_url: String,
    /// Falls back to `OPENAI_API_KEY` when empty.
    pub api_key: String,
    pub default_model: String,
    /// Characters allowed per completion request.
    pub limit: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            base_url: String::new(),
            api_key: String::new(),
            default_model: DEFAULT_MODEL.to_string(),
            limit: DEFAULT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfraConfig {
    /// `redis://...` for a shared broker and cache. Empty keeps both in process.
    pub redis_url: String,
    /// SQLite database file. Defaults to the data directory.
    pub database_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Largest context window a prompt may ask for.
    pub default_context: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_context: DEFAULT_CONTEXT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load the layered configuration, reading the file at `path` if present.
    pub fn load(path: &Path) -> Result<Self> {
        let env = Environment::with_prefix(env_prefix().as_str());
        let mut config = Self::build(path, env)?;

        if config.llm.api_key.is_empty() {
            config.llm.api_key = env::var("OPENAI_API_KEY").unwrap_or_default();
        }
        Ok(config)
    }

    fn build(path: &Path, env: Environment) -> Result<Self> {
        let built = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("server.port", 8080_i64)?
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                env.separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins"),
            )
            .build()
            .with_context(|| format!("loading config from {}", path.display()))?;

        let mut config: AppConfig = built
            .try_deserialize()
            .context("deserializing configuration")?;

        if let Some(ref db) = config.infra.database_path {
            config.infra.database_path = Some(expand_str_path(db)?.display().to_string());
        }
        Ok(config)
    }

    /// Database file to open, defaulting to the data directory.
    pub fn database_path(&self) -> Result<PathBuf> {
        match self.infra.database_path {
            Some(ref path) => expand_str_path(path),
            None => Ok(default_data_dir()?.join(DATABASE_FILE)),
        }
    }
}

/// Write the defaults to `path`, creating parent directories.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let toml = toml::to_string_pretty(&AppConfig::default())
        .context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push_str("# Environment overrides: ");
    buffer.push_str(&env_prefix());
    buffer.push_str("__SECTION__KEY\n");
    buffer.push('\n');
    buffer
}

pub fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::data_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
