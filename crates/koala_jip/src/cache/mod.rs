use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::registry::ArtifactIdentity;
use crate::repository::{BINARY_EXTENSION, MANIFEST_EXTENSION, Repository};

const CHECKSUM_SUFFIX: &str = ".sha256";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache path {path:?} has no parent directory")]
    MissingParent { path: PathBuf },
    #[error("{path:?} resolves outside the cache directory")]
    OutsideRoot { path: PathBuf },
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl CacheError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Where a cached manifest came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestOrigin {
    /// Fetched earlier in this process from the given repository.
    Repository(Repository),
    /// Read back from the on-disk cache written by a previous run.
    Cache,
}

#[derive(Debug, Clone)]
pub struct CachedManifest {
    pub bytes: Vec<u8>,
    pub origin: ManifestOrigin,
}

/// Result of checking a cached jar against its checksum sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JarState {
    Missing,
    /// Present, no sidecar recorded.
    Unverified,
    Intact,
    Corrupt { expected: String, actual: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub manifest_memory_hits: u64,
    pub manifest_disk_hits: u64,
    pub manifest_misses: u64,
    pub manifests_stored: u64,
    pub jars_stored: u64,
}

#[derive(Debug, Default)]
struct CacheStats {
    manifest_memory_hits: AtomicU64,
    manifest_disk_hits: AtomicU64,
    manifest_misses: AtomicU64,
    manifests_stored: AtomicU64,
    jars_stored: AtomicU64,
}

impl CacheStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            manifest_memory_hits: self.manifest_memory_hits.load(Ordering::Relaxed),
            manifest_disk_hits: self.manifest_disk_hits.load(Ordering::Relaxed),
            manifest_misses: self.manifest_misses.load(Ordering::Relaxed),
            manifests_stored: self.manifests_stored.load(Ordering::Relaxed),
            jars_stored: self.jars_stored.load(Ordering::Relaxed),
        }
    }
}

/// Local artifact cache laid out like a Maven repository.
///
/// Manifests are memoised in memory for the lifetime of the store and
/// mirrored on disk. Jars live next to them under their exact identity path.
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    manifests: Mutex<HashMap<ArtifactIdentity, CachedManifest>>,
    stats: CacheStats,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        ensure_directory(&root)?;
        Ok(Self {
            root,
            manifests: Mutex::new(HashMap::new()),
            stats: CacheStats::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self, identity: &ArtifactIdentity) -> PathBuf {
        self.root.join(identity.manifest_path(MANIFEST_EXTENSION))
    }

    /// Local jar location. Pure; the file need not exist.
    pub fn jar_path(&self, identity: &ArtifactIdentity) -> PathBuf {
        self.root.join(identity.jar_path(BINARY_EXTENSION))
    }

    pub fn checksum_path(&self, identity: &ArtifactIdentity) -> PathBuf {
        sidecar_of(&self.jar_path(identity))
    }

    /// [`CacheStore::jar_path`], refusing identities whose path would leave
    /// the cache root.
    pub fn jar_destination(&self, identity: &ArtifactIdentity) -> Result<PathBuf, CacheError> {
        self.contained(identity.jar_path(BINARY_EXTENSION))
    }

    fn contained(&self, relative: String) -> Result<PathBuf, CacheError> {
        let relative = PathBuf::from(relative);
        let inside = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if inside {
            Ok(self.root.join(relative))
        } else {
            Err(CacheError::OutsideRoot {
                path: self.root.join(relative),
            })
        }
    }

    pub fn has_jar(&self, identity: &ArtifactIdentity) -> bool {
        self.jar_path(identity).is_file()
    }

    /// Memoised manifest, falling back to the copy a previous run left on disk.
    pub fn get_manifest(
        &self,
        identity: &ArtifactIdentity,
    ) -> Result<Option<CachedManifest>, CacheError> {
        if let Some(cached) = self.memo().get(identity) {
            CacheStats::bump(&self.stats.manifest_memory_hits);
            return Ok(Some(cached.clone()));
        }

        let path = self.contained(identity.manifest_path(MANIFEST_EXTENSION))?;
        match fs::read(&path) {
            Ok(bytes) => {
                debug!(artifact = %identity, "manifest read from disk cache");
                CacheStats::bump(&self.stats.manifest_disk_hits);
                let cached = CachedManifest {
                    bytes,
                    origin: ManifestOrigin::Cache,
                };
                self.memo().insert(identity.clone(), cached.clone());
                Ok(Some(cached))
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                CacheStats::bump(&self.stats.manifest_misses);
                Ok(None)
            }
            Err(error) => Err(CacheError::io(&path, error)),
        }
    }

    /// Records the manifest served by `repository`, in memory and on disk.
    pub fn put_manifest(
        &self,
        identity: &ArtifactIdentity,
        bytes: &[u8],
        repository: &Repository,
    ) -> Result<(), CacheError> {
        let path = self.contained(identity.manifest_path(MANIFEST_EXTENSION))?;
        self.memo().insert(
            identity.clone(),
            CachedManifest {
                bytes: bytes.to_vec(),
                origin: ManifestOrigin::Repository(repository.clone()),
            },
        );
        write_bytes(&path, bytes)?;
        CacheStats::bump(&self.stats.manifests_stored);
        Ok(())
    }

    /// Writes the checksum sidecar of a freshly stored jar.
    pub fn record_jar(&self, identity: &ArtifactIdentity, sha256: &str) -> Result<(), CacheError> {
        let jar = self.jar_destination(identity)?;
        set_file_permissions(&jar)?;
        write_bytes(&sidecar_of(&jar), sha256.as_bytes())?;
        CacheStats::bump(&self.stats.jars_stored);
        Ok(())
    }

    pub fn verify_jar(&self, identity: &ArtifactIdentity) -> Result<JarState, CacheError> {
        let jar = self.jar_destination(identity)?;
        if !jar.is_file() {
            return Ok(JarState::Missing);
        }
        let sidecar = sidecar_of(&jar);
        let expected = match fs::read_to_string(&sidecar) {
            Ok(text) => text.trim().to_ascii_lowercase(),
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(JarState::Unverified),
            Err(error) => return Err(CacheError::io(&sidecar, error)),
        };
        let actual = compute_file_sha256(&jar)?;
        if actual == expected {
            Ok(JarState::Intact)
        } else {
            warn!(artifact = %identity, %expected, %actual, "cached jar does not match its checksum");
            Ok(JarState::Corrupt { expected, actual })
        }
    }

    /// Deletes a cached jar and its sidecar. Missing files are not an error.
    pub fn remove_jar(&self, identity: &ArtifactIdentity) -> Result<(), CacheError> {
        let jar = self.jar_destination(identity)?;
        for path in [sidecar_of(&jar), jar] {
            match fs::remove_file(&path) {
                Ok(()) => debug!(artifact = %identity, path = %path.display(), "removed from cache"),
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => return Err(CacheError::io(&path, error)),
            }
        }
        Ok(())
    }

    /// Deletes the whole cache directory and forgets memoised manifests.
    pub fn clear(&self) -> Result<(), CacheError> {
        self.memo().clear();
        match fs::remove_dir_all(&self.root) {
            Ok(()) => info!(path = %self.root.display(), "cache cleared"),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(CacheError::io(&self.root, error)),
        }
        ensure_directory(&self.root)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    fn memo(&self) -> MutexGuard<'_, HashMap<ArtifactIdentity, CachedManifest>> {
        self.manifests.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sidecar_of(jar: &Path) -> PathBuf {
    let mut path = jar.as_os_str().to_os_string();
    path.push(CHECKSUM_SUFFIX);
    PathBuf::from(path)
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let parent = path.parent().ok_or_else(|| CacheError::MissingParent {
        path: path.to_path_buf(),
    })?;
    ensure_directory(parent)?;
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|error| CacheError::io(path, error))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .map_err(|error| CacheError::io(path, error))?;
    set_file_permissions(path)
}

pub(crate) fn ensure_directory(path: &Path) -> Result<(), CacheError> {
    fs::create_dir_all(path).map_err(|error| CacheError::io(path, error))?;
    set_dir_permissions(path)
}

fn compute_file_sha256(path: &Path) -> Result<String, CacheError> {
    let mut file = File::open(path).map_err(|error| CacheError::io(path, error))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|error| CacheError::io(path, error))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), CacheError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|error| CacheError::io(path, error))
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), CacheError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
        .map_err(|error| CacheError::io(path, error))
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), CacheError> {
    Ok(())
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), CacheError> {
    Ok(())
}
