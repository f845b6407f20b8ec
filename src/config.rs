//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup, fails fast if the store path is missing.
//! Nothing here is process-global: the resulting `StoreOptions` are passed
//! explicitly to `WorkDatabase::open_with`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Location of the store file.
    pub store_path: PathBuf,
    /// Default destination for `export` when none is given.
    #[serde(default)]
    pub export_path: Option<PathBuf>,
    #[serde(default)]
    pub otel_endpoint: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub options: StoreOptions,
}

/// Knobs applied when a store is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct StoreOptions {
    #[serde(default)]
    pub synchronous: Synchronous,
}

/// SQLite `synchronous` level. `Full` syncs on every commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    Off,
    Normal,
    #[default]
    Full,
}

impl Synchronous {
    pub(crate) fn as_pragma(self) -> &'static str {
        match self {
            Synchronous::Off => "OFF",
            Synchronous::Normal => "NORMAL",
            Synchronous::Full => "FULL",
        }
    }
}

impl std::str::FromStr for Synchronous {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Synchronous::Off),
            "normal" => Ok(Synchronous::Normal),
            "full" => Ok(Synchronous::Full),
            _ => Err(Error::Config(format!("unknown synchronous level: {s}"))),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let synchronous = match std::env::var("WORKDB_SYNCHRONOUS") {
            Ok(level) => level.parse()?,
            Err(_) => Synchronous::default(),
        };

        Ok(Self {
            store_path: PathBuf::from(required_var("WORKDB_PATH")?),
            export_path: std::env::var("WORKDB_EXPORT").ok().map(PathBuf::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| default_log_level()),
            options: StoreOptions { synchronous },
        })
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(format!("invalid config: {e}")))
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
