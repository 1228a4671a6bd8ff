//! Configuration layout
//!
//! ```toml
//! [storage]
//! backend = "local"          # or "sqlite"
//! root = "~/.local/share/dotfile"
//! database = "~/dotfilehub.db"
//!
//! [display]
//! utc_offset = "+00:00"
//! ```

use crate::backend::{LocalBackend, SqliteBackend};
use crate::error::{EngineError, Result};
use crate::storage::Backend;
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which [`Backend`] implementation to open
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Sqlite,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => f.write_str("local"),
            BackendKind::Sqlite => f.write_str("sqlite"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    /// Root directory of the local backend
    pub root: PathBuf,
    /// Database file of the sqlite backend
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data = dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("dotfile");
        Self {
            backend: BackendKind::Local,
            root: data.join("files"),
            database: data.join("dotfilehub.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Offset applied to listing timestamps, e.g. `"-07:00"`
    pub utc_offset: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            utc_offset: "+00:00".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub display: DisplayConfig,
}

impl Config {
    /// Read and parse a config file
    pub fn load(path: &Path) -> std::result::Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        data.parse()
    }

    /// Like [`Config::load`], falling back to defaults when the file is absent
    pub fn load_or_default(path: &Path) -> std::result::Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Default location of the config file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dotfile")
            .join("config.toml")
    }

    pub fn utc_offset(&self) -> std::result::Result<FixedOffset, ConfigError> {
        parse_offset(&self.display.utc_offset)
    }

    /// Open the configured backend, creating its storage if needed
    pub fn open_backend(&self) -> Result<Box<dyn Backend>> {
        tracing::debug!("Opening {} backend", self.storage.backend);
        match self.storage.backend {
            BackendKind::Local => {
                std::fs::create_dir_all(&self.storage.root).map_err(|e| {
                    EngineError::backend("open", self.storage.root.display(), e)
                })?;
                Ok(Box::new(LocalBackend::open(&self.storage.root)?))
            }
            BackendKind::Sqlite => {
                if let Some(parent) = self.storage.database.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)
                            .map_err(|e| EngineError::backend("open", parent.display(), e))?;
                    }
                }
                Ok(Box::new(SqliteBackend::open(&self.storage.database)?))
            }
        }
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(data: &str) -> std::result::Result<Self, Self::Err> {
        let mut config: Config = toml::de::from_str(data)?;
        config.storage.root = expand(&config.storage.root)?;
        config.storage.database = expand(&config.storage.database)?;
        parse_offset(&config.display.utc_offset)?;
        Ok(config)
    }
}

fn expand(path: &Path) -> std::result::Result<PathBuf, ConfigError> {
    let lossy = path.to_string_lossy();
    let expanded = shellexpand::full(lossy.as_ref())?;
    Ok(PathBuf::from(expanded.into_owned()))
}

/// Parse `"+hh:mm"`, `"-hh:mm"` or `"Z"`
pub fn parse_offset(value: &str) -> std::result::Result<FixedOffset, ConfigError> {
    if value.eq_ignore_ascii_case("z") || value.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| ConfigError::Offset(value.to_string()));
    }
    value
        .parse::<FixedOffset>()
        .map_err(|_| ConfigError::Offset(value.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    #[error("Invalid UTC offset {0:?}, expected e.g. \"+02:00\"")]
    Offset(String),
}
