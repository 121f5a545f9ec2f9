// Manager configuration
//
// Loaded once at startup from an optional TOML file plus `INSTRUMENT_MANAGER__*` environment overrides,
// then handed to each component explicitly.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "INSTRUMENT_MANAGER";

#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Project base directory (the folder holding `project/` and `tools/`).
    pub base: PathBuf,
    pub database: DatabaseSettings,
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Privileged account used to apply generated table SQL.
    #[serde(default)]
    pub quat_user: Option<String>,
    #[serde(default)]
    pub quat_password: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolSettings {
    #[serde(default = "default_generator_program")]
    pub generator_program: String,
    #[serde(default = "default_generator_args")]
    pub generator_args: Vec<String>,
    #[serde(default = "default_apply_program")]
    pub apply_program: String,
    #[serde(default = "default_tool_timeout_secs")]
    pub generate_timeout_secs: u64,
    #[serde(default = "default_tool_timeout_secs")]
    pub apply_timeout_secs: u64,
    /// Unix mode applied to uploaded definition files.
    #[serde(default = "default_upload_file_mode")]
    pub upload_file_mode: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub level: Option<String>,
}

fn default_port() -> u16 {
    3306
}

fn default_connect_timeout_secs() -> u64 {
    20
}

fn default_generator_program() -> String {
    "php".to_string()
}

fn default_generator_args() -> Vec<String> {
    vec!["generate_tables_sql_and_testNames.php".to_string()]
}

fn default_apply_program() -> String {
    "mysql".to_string()
}

fn default_tool_timeout_secs() -> u64 {
    300
}

fn default_upload_file_mode() -> u32 {
    0o644
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            generator_program: default_generator_program(),
            generator_args: default_generator_args(),
            apply_program: default_apply_program(),
            generate_timeout_secs: default_tool_timeout_secs(),
            apply_timeout_secs: default_tool_timeout_secs(),
            upload_file_mode: default_upload_file_mode(),
        }
    }
}

impl DatabaseSettings {
    /// Privileged credentials, if both halves are present and non-empty.
    pub fn quat_credentials(&self) -> Option<(&str, &str)> {
        let user = self.quat_user.as_deref().map(str::trim).unwrap_or("");
        let password = self.quat_password.as_deref().unwrap_or("");
        if user.is_empty() || password.is_empty() {
            return None;
        }
        Some((user, password))
    }
}

impl ManagerConfig {
    /// Load configuration from `path` (optional file) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path(),
        };
        log::info!(
            "[PHASE: initialization] [STEP: config] Loading configuration (file={:?})",
            file
        );

        let settings = config::Config::builder()
            .add_source(config::File::from(file.as_path()).required(path.is_some()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration: {:?}", file))?;

        settings
            .try_deserialize::<ManagerConfig>()
            .context("Configuration is incomplete or malformed")
    }

    /// Parse configuration from TOML text (no environment overrides).
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()
            .context("Failed to parse configuration")?
            .try_deserialize::<ManagerConfig>()
            .context("Configuration is incomplete or malformed")
    }

    pub fn instruments_dir(&self) -> PathBuf {
        self.base.join("project").join("instruments")
    }

    pub fn tables_sql_dir(&self) -> PathBuf {
        self.base.join("project").join("tables_sql")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base.join("tools")
    }
}

/// `<config dir>/instrument-manager/config.toml`, or `./config.toml` when the platform has no config dir.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("instrument-manager").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}
