//! Resolver configuration.
//!
//! Values come from an optional TOML file, then `KOALA_JIP_*` environment
//! variables, then caller overrides. Each source is a [`ConfigLayer`] applied
//! with [`ResolverConfig::with_layers`].

use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::download::{DownloadSettings, EffectiveConcurrency};
use crate::registry::{HttpClient, RegistryError, RetryConfig};
use crate::repository::{RepositoryChain, RepositoryConfig, RepositoryError, expand_home};

mod logging;

pub use logging::{
    LogFormat, LogLevel, LoggingConfig, LoggingConfigError, LoggingConfigLayer, init_tracing,
};

pub const ENV_HOME: &str = "KOALA_JIP_HOME";
pub const ENV_CONCURRENCY: &str = "KOALA_JIP_CONCURRENCY";
pub const ENV_LOG: &str = "KOALA_JIP_LOG";

pub const DEFAULT_LIBRARY_ROOT: &str = "~/.jip-koalanlp";
pub const CACHE_DIR_NAME: &str = "cache";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("environment variable {key}={value:?} is invalid: {message}")]
    InvalidEnv {
        key: &'static str,
        value: String,
        message: String,
    },
    #[error(transparent)]
    Logging(#[from] LoggingConfigError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Root for the cache and the installed index. `~` is expanded.
    pub library_root: String,
    /// Defaults to `<library_root>/cache`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,
    pub max_concurrent_downloads: usize,
    pub request_timeout_secs: u64,
    pub retry: RetryConfig,
    /// Replaces the built-in chain when non-empty.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<RepositoryConfig>,
    pub logging: LoggingConfig,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            library_root: DEFAULT_LIBRARY_ROOT.to_string(),
            cache_dir: None,
            max_concurrent_downloads: DownloadSettings::default().default_workers,
            request_timeout_secs: 30,
            retry: RetryConfig::default(),
            repositories: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ResolverConfig {
    pub fn from_toml_str(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.retry.normalize();
        Ok(config)
    }

    /// Reads `path`; a missing file yields the defaults.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(raw) => {
                debug!(path = %path.display(), "configuration file loaded");
                Self::from_toml_str(&raw, path)
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// File, then environment, then `overrides`.
    pub fn load(path: Option<&Path>, overrides: ConfigLayer) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => Self::load_file(path)?,
            None => Self::default(),
        };
        Ok(base.with_layers(&[ConfigLayer::from_env()?, overrides]))
    }

    pub fn with_layers(mut self, layers: &[ConfigLayer]) -> Self {
        for layer in layers {
            self.apply_layer(layer);
        }
        self
    }

    fn apply_layer(&mut self, layer: &ConfigLayer) {
        if let Some(root) = &layer.library_root {
            self.library_root = root.clone();
        }
        if let Some(cache_dir) = &layer.cache_dir {
            self.cache_dir = Some(cache_dir.clone());
        }
        if let Some(workers) = layer.max_concurrent_downloads {
            self.max_concurrent_downloads = workers;
        }
        if let Some(timeout) = layer.request_timeout_secs {
            self.request_timeout_secs = timeout;
        }
        if let Some(repositories) = &layer.repositories {
            self.repositories = repositories.clone();
        }
        if !layer.logging.is_empty() {
            self.logging = self.logging.clone().with_layers(std::slice::from_ref(&layer.logging));
        }
    }

    pub fn library_root_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(expand_home(&self.library_root)?)
    }

    pub fn cache_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.cache_dir {
            Some(dir) => Ok(expand_home(dir)?),
            None => Ok(self.library_root_path()?.join(CACHE_DIR_NAME)),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn download_concurrency(&self) -> EffectiveConcurrency {
        DownloadSettings::default().effective_workers(Some(self.max_concurrent_downloads))
    }

    pub fn repository_chain(&self) -> Result<RepositoryChain, RepositoryError> {
        if self.repositories.is_empty() {
            RepositoryChain::with_defaults()
        } else {
            RepositoryChain::from_configs(&self.repositories)
        }
    }

    pub fn http_client(&self) -> Result<HttpClient, RegistryError> {
        HttpClient::new(self.request_timeout(), self.retry)
    }
}

/// Partial overrides applied on top of a [`ResolverConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigLayer {
    pub library_root: Option<String>,
    pub cache_dir: Option<String>,
    pub max_concurrent_downloads: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub repositories: Option<Vec<RepositoryConfig>>,
    pub logging: LoggingConfigLayer,
}

impl ConfigLayer {
    /// Reads `KOALA_JIP_HOME`, `KOALA_JIP_CONCURRENCY` and `KOALA_JIP_LOG`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut layer = Self::default();
        if let Some(home) = read_env(ENV_HOME) {
            layer.library_root = Some(home);
        }
        if let Some(raw) = read_env(ENV_CONCURRENCY) {
            let workers = raw.parse::<usize>().map_err(|error| ConfigError::InvalidEnv {
                key: ENV_CONCURRENCY,
                value: raw.clone(),
                message: error.to_string(),
            })?;
            layer.max_concurrent_downloads = Some(workers);
        }
        if let Some(raw) = read_env(ENV_LOG) {
            layer.logging.level = Some(LogLevel::from_str(&raw)?);
        }
        Ok(layer)
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
