//! Persisted record of artifacts installed by previous runs.
//!
//! The index lives at `<library_root>/.jip/index.chkpt` as a versioned TOML
//! document. A missing, unreadable or unknown-version file loads as an empty
//! index so a damaged checkpoint only costs a re-resolution.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{CacheStore, JarState};
use crate::registry::ArtifactIdentity;

pub const INDEX_VERSION: u32 = 1;
pub const INDEX_DIR: &str = ".jip";
pub const INDEX_FILE: &str = "index.chkpt";

/// Serialises index writes across every resolver in the process.
static PERSIST_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to read or write the index at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse the index: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialise the index: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("unsupported index version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexDocument {
    version: u32,
    #[serde(default)]
    artifacts: Vec<ArtifactIdentity>,
}

#[derive(Debug, Clone)]
pub struct InstalledIndex {
    path: PathBuf,
    installed: BTreeSet<ArtifactIdentity>,
    dirty: bool,
}

impl InstalledIndex {
    /// Loads the index kept under `library_root`.
    pub fn load(library_root: &Path) -> Self {
        Self::load_from(Self::default_path(library_root))
    }

    pub fn default_path(library_root: &Path) -> PathBuf {
        library_root.join(INDEX_DIR).join(INDEX_FILE)
    }

    /// Loads the index file at `path`. Never fails.
    pub fn load_from(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let installed = match read_document(&path) {
            Ok(Some(artifacts)) => artifacts,
            Ok(None) => BTreeSet::new(),
            Err(error) => {
                warn!(
                    path = %path.display(),
                    %error,
                    "installed index is unreadable; starting from an empty index"
                );
                BTreeSet::new()
            }
        };
        debug!(path = %path.display(), entries = installed.len(), "installed index loaded");
        Self {
            path,
            installed,
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Exact membership.
    pub fn is_installed(&self, identity: &ArtifactIdentity) -> bool {
        self.installed.contains(identity)
    }

    /// Some version of the same artifact is installed.
    pub fn is_same_artifact_installed(&self, identity: &ArtifactIdentity) -> bool {
        self.installed_same_artifact(identity).is_some()
    }

    /// The installed entry standing in for `identity`: the exact match when
    /// present, otherwise the first installed version of the same artifact.
    pub fn installed_same_artifact(&self, identity: &ArtifactIdentity) -> Option<&ArtifactIdentity> {
        self.installed.get(identity).or_else(|| {
            self.installed
                .iter()
                .find(|installed| installed.same_artifact(identity))
        })
    }

    /// Adds `identity`. Returns `false` when it was already present.
    pub fn record_installed(&mut self, identity: ArtifactIdentity) -> bool {
        let added = self.installed.insert(identity);
        self.dirty |= added;
        added
    }

    pub fn remove(&mut self, identity: &ArtifactIdentity) -> bool {
        let removed = self.installed.remove(identity);
        self.dirty |= removed;
        removed
    }

    pub fn clear(&mut self) {
        if !self.installed.is_empty() {
            self.installed.clear();
            self.dirty = true;
        }
    }

    /// Installed identities in coordinate order.
    pub fn iter(&self) -> impl Iterator<Item = &ArtifactIdentity> {
        self.installed.iter()
    }

    pub fn len(&self) -> usize {
        self.installed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.installed.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Drops entries whose jar is gone from the cache or no longer matches
    /// its recorded checksum. Corrupt jars are deleted from the cache.
    /// Returns the removed identities.
    pub fn reconcile(&mut self, cache: &CacheStore) -> Vec<ArtifactIdentity> {
        let stale: Vec<ArtifactIdentity> = self
            .installed
            .iter()
            .filter(|identity| match cache.verify_jar(identity) {
                Ok(JarState::Intact) | Ok(JarState::Unverified) => false,
                Ok(JarState::Missing) => {
                    warn!(artifact = %identity, "indexed artifact is missing from the cache");
                    true
                }
                Ok(JarState::Corrupt { .. }) => {
                    if let Err(error) = cache.remove_jar(identity) {
                        warn!(artifact = %identity, %error, "cannot remove corrupt jar");
                    }
                    true
                }
                Err(error) => {
                    warn!(artifact = %identity, %error, "cannot verify cached artifact");
                    true
                }
            })
            .cloned()
            .collect();

        for identity in &stale {
            self.remove(identity);
        }
        stale
    }

    /// Writes the index if it changed since the last load or persist.
    /// Returns whether a write happened.
    pub fn persist(&mut self) -> Result<bool, IndexError> {
        if !self.dirty {
            return Ok(false);
        }

        let _guard = PERSIST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let document = IndexDocument {
            version: INDEX_VERSION,
            artifacts: self.installed.iter().cloned().collect(),
        };
        let text = toml::to_string_pretty(&document)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| IndexError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let temp = self.path.with_extension("chkpt.tmp");
        fs::write(&temp, text).map_err(|source| IndexError::Io {
            path: temp.clone(),
            source,
        })?;
        fs::rename(&temp, &self.path).map_err(|source| IndexError::Io {
            path: self.path.clone(),
            source,
        })?;

        self.dirty = false;
        debug!(path = %self.path.display(), entries = self.installed.len(), "installed index persisted");
        Ok(true)
    }
}

fn read_document(path: &Path) -> Result<Option<BTreeSet<ArtifactIdentity>>, IndexError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(IndexError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let document: IndexDocument = toml::from_str(&text)?;
    if document.version != INDEX_VERSION {
        return Err(IndexError::UnsupportedVersion {
            found: document.version,
            supported: INDEX_VERSION,
        });
    }
    Ok(Some(document.artifacts.into_iter().collect()))
}
