//! Prioritised artifact sources.
//!
//! A [`Repository`] is either a directory laid out like a Maven repository or
//! a remote base URL. [`RepositoryChain`] keeps them in priority order and asks
//! each in turn until one answers.

pub mod config;
pub(crate) mod defaults;

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};
use url::Url;

use crate::registry::{
    self, ArtifactIdentity, CoordinateParseError, DownloadedFile, LOCAL_METADATA_FILE, METADATA_FILE, MavenMetadata,
    RegistryError, RemoteClient, SnapshotStamp,
};

pub use config::{RepositoryConfig, RepositoryKind, expand_home};

pub const MANIFEST_EXTENSION: &str = "pom";
pub const BINARY_EXTENSION: &str = "jar";

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("could not determine the home directory")]
    HomeDirectoryUnavailable,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Coordinates(#[from] CoordinateParseError),
    #[error("{artifact} is not available from repository '{repository}'")]
    MissingBinary {
        artifact: ArtifactIdentity,
        repository: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryLocation {
    Local(PathBuf),
    Remote(Url),
}

impl fmt::Display for RepositoryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryLocation::Local(path) => write!(f, "{}", path.display()),
            RepositoryLocation::Remote(url) => f.write_str(url.as_str()),
        }
    }
}

/// One artifact source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    name: String,
    location: RepositoryLocation,
    priority: u32,
}

impl Repository {
    pub fn local(name: impl Into<String>, root: impl Into<PathBuf>, priority: u32) -> Self {
        Self {
            name: name.into(),
            location: RepositoryLocation::Local(root.into()),
            priority,
        }
    }

    pub fn remote(
        name: impl Into<String>,
        base_url: &str,
        priority: u32,
    ) -> Result<Self, RepositoryError> {
        Ok(Self {
            name: name.into(),
            location: RepositoryLocation::Remote(registry::parse_base_url(base_url)?),
            priority,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RepositoryKind {
        match self.location {
            RepositoryLocation::Local(_) => RepositoryKind::Local,
            RepositoryLocation::Remote(_) => RepositoryKind::Remote,
        }
    }

    pub fn location(&self) -> &RepositoryLocation {
        &self.location
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Sort key used to group downloads by source.
    pub fn location_key(&self) -> String {
        self.location.to_string()
    }

    /// Reads the manifest of `artifact`. Absence and transport failures both
    /// come back as `None` so the chain moves on to the next repository.
    pub async fn lookup_manifest(
        &self,
        artifact: &ArtifactIdentity,
        client: &dyn RemoteClient,
    ) -> Option<Vec<u8>> {
        if let Err(error) = artifact.validate() {
            warn!(artifact = %artifact, %error, "not looking up unsafe coordinates");
            return None;
        }
        match &self.location {
            RepositoryLocation::Local(root) => {
                read_optional(&root.join(artifact.manifest_path(MANIFEST_EXTENSION))).await
            }
            RepositoryLocation::Remote(base) => {
                let stamp = self.snapshot_stamp(artifact, client).await;
                let relative = artifact.remote_manifest_path(MANIFEST_EXTENSION, stamp.as_ref());
                self.fetch_remote(base, &relative, client).await
            }
        }
    }

    /// Copies or downloads the binary of `artifact` to `destination`.
    pub async fn fetch_binary(
        &self,
        artifact: &ArtifactIdentity,
        destination: &Path,
        client: &dyn RemoteClient,
    ) -> Result<DownloadedFile, RepositoryError> {
        artifact.validate()?;
        match &self.location {
            RepositoryLocation::Local(root) => {
                let source = root.join(artifact.jar_path(BINARY_EXTENSION));
                let bytes = match fs::read(&source).await {
                    Ok(bytes) => bytes,
                    Err(error) if error.kind() == ErrorKind::NotFound => {
                        return Err(RepositoryError::MissingBinary {
                            artifact: artifact.clone(),
                            repository: self.name.clone(),
                        });
                    }
                    Err(source_error) => {
                        return Err(RepositoryError::Io {
                            path: source,
                            source: source_error,
                        });
                    }
                };
                write_atomically(destination, &bytes).await?;
                Ok(DownloadedFile {
                    path: destination.to_path_buf(),
                    len: bytes.len() as u64,
                    sha256: registry::sha256_hex(&bytes),
                })
            }
            RepositoryLocation::Remote(base) => {
                let stamp = self.snapshot_stamp(artifact, client).await;
                let url = registry::join_path(
                    base,
                    &artifact.remote_jar_path(BINARY_EXTENSION, stamp.as_ref()),
                )?;
                match client.download_to(&url, destination).await {
                    Ok(file) => Ok(file),
                    Err(RegistryError::NotFound { .. }) => Err(RepositoryError::MissingBinary {
                        artifact: artifact.clone(),
                        repository: self.name.clone(),
                    }),
                    Err(error) => Err(error.into()),
                }
            }
        }
    }

    /// Artifact-level `maven-metadata.xml`. Local repositories also consult
    /// the `maven-metadata-local.xml` written by `mvn install`.
    pub async fn fetch_metadata(
        &self,
        artifact: &ArtifactIdentity,
        client: &dyn RemoteClient,
    ) -> Option<MavenMetadata> {
        let file_names: &[&str] = match self.location {
            RepositoryLocation::Local(_) => &[LOCAL_METADATA_FILE, METADATA_FILE],
            RepositoryLocation::Remote(_) => &[METADATA_FILE],
        };
        for file_name in file_names {
            let relative = artifact.metadata_path(file_name);
            if let Some(metadata) = self.read_metadata(&relative, client).await {
                return Some(metadata);
            }
        }
        None
    }

    /// Resolves the timestamped file name of a remote snapshot build.
    async fn snapshot_stamp(
        &self,
        artifact: &ArtifactIdentity,
        client: &dyn RemoteClient,
    ) -> Option<SnapshotStamp> {
        if !artifact.is_snapshot() {
            return None;
        }
        let relative = artifact.snapshot_metadata_path(METADATA_FILE);
        let stamp = self
            .read_metadata(&relative, client)
            .await
            .and_then(|metadata| metadata.snapshot_stamp());
        if stamp.is_none() {
            debug!(
                artifact = %artifact,
                repository = %self.name,
                "no snapshot stamp published; using the plain version"
            );
        }
        stamp
    }

    async fn read_metadata(&self, relative: &str, client: &dyn RemoteClient) -> Option<MavenMetadata> {
        let bytes = match &self.location {
            RepositoryLocation::Local(root) => read_optional(&root.join(relative)).await?,
            RepositoryLocation::Remote(base) => self.fetch_remote(base, relative, client).await?,
        };
        match registry::parse_metadata(&bytes) {
            Ok(metadata) => Some(metadata),
            Err(error) => {
                warn!(repository = %self.name, path = relative, %error, "ignoring malformed metadata");
                None
            }
        }
    }

    async fn fetch_remote(
        &self,
        base: &Url,
        relative: &str,
        client: &dyn RemoteClient,
    ) -> Option<Vec<u8>> {
        let url = match registry::join_path(base, relative) {
            Ok(url) => url,
            Err(error) => {
                warn!(repository = %self.name, %error, "cannot build request URL");
                return None;
            }
        };
        match client.fetch_bytes(&url).await {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(repository = %self.name, url = %url, %error, "repository unreachable; trying next");
                None
            }
        }
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.location)
    }
}

async fn read_optional(path: &Path) -> Option<Vec<u8>> {
    match fs::read(path).await {
        Ok(bytes) => Some(bytes),
        Err(error) if error.kind() == ErrorKind::NotFound => None,
        Err(error) => {
            warn!(path = %path.display(), %error, "cannot read local repository file");
            None
        }
    }
}

async fn write_atomically(destination: &Path, bytes: &[u8]) -> Result<(), RepositoryError> {
    let io_error = |path: &Path, source| RepositoryError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| io_error(parent, source))?;
    }
    let partial = registry::partial_path(destination);
    fs::write(&partial, bytes)
        .await
        .map_err(|source| io_error(&partial, source))?;
    fs::rename(&partial, destination)
        .await
        .map_err(|source| io_error(destination, source))
}

/// Repositories ordered by ascending priority, ties kept in insertion order.
#[derive(Debug, Clone, Default)]
pub struct RepositoryChain {
    repositories: Vec<Repository>,
}

impl RepositoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[RepositoryConfig]) -> Result<Self, RepositoryError> {
        let mut chain = Self::new();
        for config in configs {
            chain.add_repository(config.to_repository()?);
        }
        Ok(chain)
    }

    /// Built-in chain: local Maven and Ivy caches followed by public mirrors.
    pub fn with_defaults() -> Result<Self, RepositoryError> {
        Self::from_configs(defaults::embedded_default_repositories())
    }

    /// Inserts `repository` after every entry whose priority is lower or equal.
    /// A repository whose location is already present is ignored.
    pub fn add_repository(&mut self, repository: Repository) -> bool {
        if self.contains_location(repository.location()) {
            debug!(repository = %repository, "repository already registered");
            return false;
        }
        let position = self
            .repositories
            .partition_point(|existing| existing.priority <= repository.priority);
        self.repositories.insert(position, repository);
        true
    }

    /// Appends a repository declared by a fetched manifest. It sorts after every
    /// existing entry and never reorders them.
    pub fn add_declared(&mut self, name: &str, url: &str) -> Result<bool, RepositoryError> {
        let priority = self
            .repositories
            .iter()
            .map(Repository::priority)
            .max()
            .map_or(0, |max| max.saturating_add(1));
        let repository = Repository::remote(name, url, priority)?;
        let added = self.add_repository(repository);
        if added {
            debug!(repository = name, url, priority, "registered manifest-declared repository");
        }
        Ok(added)
    }

    pub fn contains_location(&self, location: &RepositoryLocation) -> bool {
        self.repositories
            .iter()
            .any(|existing| existing.location() == location)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Repository> {
        self.repositories.iter()
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }

    /// First repository, in priority order, that serves the manifest.
    pub async fn find_manifest(
        &self,
        artifact: &ArtifactIdentity,
        client: &dyn RemoteClient,
    ) -> Option<(Vec<u8>, Repository)> {
        for repository in &self.repositories {
            if let Some(bytes) = repository.lookup_manifest(artifact, client).await {
                debug!(artifact = %artifact, repository = %repository.name(), "manifest found");
                return Some((bytes, repository.clone()));
            }
        }
        None
    }

    /// Concrete version for a `LATEST` request, taken from the first
    /// repository publishing usable metadata.
    pub async fn resolve_version(
        &self,
        artifact: &ArtifactIdentity,
        client: &dyn RemoteClient,
    ) -> Option<String> {
        for repository in &self.repositories {
            let Some(metadata) = repository.fetch_metadata(artifact, client).await else {
                continue;
            };
            if let Some(version) = metadata.preferred_version() {
                debug!(
                    artifact = %artifact,
                    repository = %repository.name(),
                    version,
                    "selected version from metadata"
                );
                return Some(version.to_string());
            }
        }
        None
    }
}
