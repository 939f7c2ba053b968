//! Configuration.
//!
//! Layered the usual way: serde-defaulted sections, a TOML file under the
//! platform config dir, and the `API_KEY` environment variable taking
//! precedence for the provider credential. Every default can be overridden
//! from the file; an empty file is a valid configuration.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model used for tool-enabled chat turns.
    #[serde(default = "default_chat_model")]
    pub chat_model: String,

    /// Image-capable model used when a turn carries an attachment.
    #[serde(default = "default_vision_model")]
    pub vision_model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// The single user identity every operation is scoped to. There is no
    /// authentication layer in front of this service.
    #[serde(default = "default_user_id")]
    pub default_user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Credential for the chat-completions endpoint. The `API_KEY`
    /// environment variable overrides whatever is configured here.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file location; resolved to the platform data dir when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_chat_model() -> String {
    "qwen-turbo".to_string()
}
fn default_vision_model() -> String {
    "qwen-vl-plus-latest".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_user_id() -> String {
    "user_6831885af26f9a4e3ab53166".to_string()
}
fn default_base_url() -> String {
    "https://dashscope-intl.aliyuncs.com/compatible-mode/v1".to_string()
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8642
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            chat_model: default_chat_model(),
            vision_model: default_vision_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            default_user_id: default_user_id(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("app", "kasbot", "kasbot")
        .context("Could not determine platform-specific directories")
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Reading config at {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Parsing config at {}", path.display()))?
        } else {
            Config::default()
        };

        if let Ok(key) = std::env::var("API_KEY")
            && !key.is_empty()
        {
            config.provider.api_key = key;
        }

        Ok(config)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join("kasbot.toml"))
    }

    /// The SQLite file to open, creating its parent directory if needed.
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.database.path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Creating {}", parent.display()))?;
            }
            return Ok(path.clone());
        }

        let data_dir = project_dirs()?.data_dir().to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("Creating data dir {}", data_dir.display()))?;
        Ok(data_dir.join("kasbot.sqlite"))
    }
}
