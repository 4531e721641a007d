use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::identity::Strategy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML config: {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Settings read from `docker-reuse.toml`. Every section is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReuseConfig {
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub build: BuildConfig,
}

impl ReuseConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str::<Self>(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `path` when it exists, defaults otherwise.
    pub fn load_optional(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FingerprintConfig {
    #[serde(default)]
    pub strategy: Strategy,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    /// Recipe path, relative to the working directory.
    pub dockerfile: Option<PathBuf>,
    /// Build arguments as `NAME` or `NAME=VALUE`, in fingerprint order.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra tags pushed alongside the fingerprint tag.
    #[serde(default)]
    pub tags: Vec<String>,
    pub placeholder: Option<String>,
    #[serde(default)]
    pub quiet: bool,
    /// Executable used for build, push and registry checks.
    pub docker: Option<String>,
}
