use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::{Repository, RepositoryError};

/// Whether a repository is read from disk or over HTTP.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryKind {
    Local,
    Remote,
}

/// Repository entry as written in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositoryConfig {
    pub name: String,
    pub kind: RepositoryKind,
    /// Directory (`~` is expanded) or base URL.
    pub location: String,
    /// Lower values are consulted first.
    #[serde(default = "default_priority")]
    pub priority: u32,
}

fn default_priority() -> u32 {
    100
}

impl RepositoryConfig {
    pub fn local(name: impl Into<String>, location: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            kind: RepositoryKind::Local,
            location: location.into(),
            priority,
        }
    }

    pub fn remote(name: impl Into<String>, location: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            kind: RepositoryKind::Remote,
            location: location.into(),
            priority,
        }
    }

    pub fn to_repository(&self) -> Result<Repository, RepositoryError> {
        match self.kind {
            RepositoryKind::Local => Ok(Repository::local(
                self.name.clone(),
                expand_home(&self.location)?,
                self.priority,
            )),
            RepositoryKind::Remote => {
                Repository::remote(self.name.clone(), &self.location, self.priority)
            }
        }
    }
}

/// Expands a leading `~` to the user's home directory.
pub fn expand_home(location: &str) -> Result<PathBuf, RepositoryError> {
    let rest = match location.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\') => rest,
        _ => return Ok(PathBuf::from(location)),
    };
    let home = dirs::home_dir().ok_or(RepositoryError::HomeDirectoryUnavailable)?;
    let rest = rest.trim_start_matches(['/', '\\']);
    Ok(if rest.is_empty() { home } else { home.join(rest) })
}
