//! One-call initialization: resolve the requested engine packages, download
//! what is missing and return the classpath.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexSet;
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{CacheError, CacheStore};
use crate::config::{ConfigError, ResolverConfig};
use crate::download::{DownloadError, DownloadPool, DownloadedArtifact};
use crate::index::{IndexError, InstalledIndex};
use crate::packages::{PackageRequest, default_exclusions};
use crate::registry::{ArtifactIdentity, ExclusionPattern, RegistryError, RemoteClient};
use crate::repository::{RepositoryChain, RepositoryError};
use crate::resolver::{ResolutionContext, ResolutionWarning, ResolveError, Resolver, jar_paths};

/// Fatal initialization failure.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error("failed to start the async runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("initialize_blocking was called from inside an async runtime; await initialize instead")]
    NestedRuntime,
}

#[derive(Debug, Clone, Default)]
pub struct InitializeRequest {
    pub packages: Vec<PackageRequest>,
    /// Coordinates requested directly, in addition to `packages`.
    pub artifacts: Vec<ArtifactIdentity>,
    /// Added to the default exclusions.
    pub exclusions: Vec<ExclusionPattern>,
    /// Clears the cache and the installed index first.
    pub force_refresh: bool,
}

impl InitializeRequest {
    pub fn new(packages: impl IntoIterator<Item = PackageRequest>) -> Self {
        Self {
            packages: packages.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_artifact(mut self, identity: ArtifactIdentity) -> Self {
        self.artifacts.push(identity);
        self
    }

    pub fn exclude(mut self, pattern: ExclusionPattern) -> Self {
        self.exclusions.push(pattern);
        self
    }

    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    pub fn requested_identities(&self) -> Vec<ArtifactIdentity> {
        self.packages
            .iter()
            .map(PackageRequest::identity)
            .chain(self.artifacts.iter().cloned())
            .collect()
    }

    fn all_exclusions(&self) -> Vec<ExclusionPattern> {
        let mut exclusions = default_exclusions();
        for pattern in &self.exclusions {
            if !exclusions.contains(pattern) {
                exclusions.push(pattern.clone());
            }
        }
        exclusions
    }
}

/// Ordered, de-duplicated jar paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classpath {
    entries: Vec<PathBuf>,
}

impl Classpath {
    pub fn from_paths(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        let unique: IndexSet<PathBuf> = paths.into_iter().collect();
        Self {
            entries: unique.into_iter().collect(),
        }
    }

    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Platform path-list form, suitable for `-cp`.
    pub fn to_os_string(&self) -> Result<OsString, env::JoinPathsError> {
        env::join_paths(&self.entries)
    }
}

#[derive(Debug)]
pub struct InitializeReport {
    pub classpath: Classpath,
    pub downloaded: Vec<DownloadedArtifact>,
    /// Index entries dropped because their jar was missing or corrupt.
    pub stale_entries: Vec<ArtifactIdentity>,
    pub warnings: Vec<ResolutionWarning>,
}

pub struct Bootstrap {
    library_root: PathBuf,
    chain: RepositoryChain,
    cache: Arc<CacheStore>,
    client: Arc<dyn RemoteClient>,
    workers: usize,
}

impl Bootstrap {
    /// Builds the HTTP client and repository chain described by `config`.
    pub fn from_config(config: &ResolverConfig) -> Result<Self, BootstrapError> {
        let client: Arc<dyn RemoteClient> = Arc::new(config.http_client()?);
        Self::with_client(config, client)
    }

    pub fn with_client(
        config: &ResolverConfig,
        client: Arc<dyn RemoteClient>,
    ) -> Result<Self, BootstrapError> {
        let library_root = config.library_root_path()?;
        let cache = Arc::new(CacheStore::new(config.cache_path()?)?);
        let chain = config.repository_chain()?;
        let workers = config.download_concurrency().applied;
        Ok(Self {
            library_root,
            chain,
            cache,
            client,
            workers,
        })
    }

    pub fn with_chain(mut self, chain: RepositoryChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn library_root(&self) -> &Path {
        &self.library_root
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub async fn initialize(
        &self,
        request: &InitializeRequest,
    ) -> Result<InitializeReport, BootstrapError> {
        let mut index = InstalledIndex::load(&self.library_root);
        if request.force_refresh {
            info!("force refresh requested; clearing cache and installed index");
            self.cache.clear()?;
            index.clear();
        }
        let stale_entries = index.reconcile(&self.cache);

        let mut context = ResolutionContext::new(
            self.chain.clone(),
            Arc::clone(&self.cache),
            index,
            Arc::clone(&self.client),
        );

        let resolution = {
            let mut resolver = Resolver::new(&mut context, request.all_exclusions());
            let mut roots = Vec::new();
            for identity in request.requested_identities() {
                roots.push(resolver.select_version(identity).await?);
            }
            // Stale entries may be dependencies of artifacts that are still
            // installed, which the walk would otherwise skip.
            roots.extend(stale_entries.iter().cloned());
            resolver.resolve(&roots).await
        };

        // Persisted before downloading; reconciliation drops entries whose
        // download never completed.
        context.index.persist()?;

        let mut pool = DownloadPool::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.client),
            self.workers,
        );
        let mut submit_error = None;
        for entry in resolution.downloads.iter().cloned() {
            if let Err(error) = pool.submit(entry).await {
                submit_error = Some(error);
                break;
            }
        }
        let report = pool.join_all().await?;
        if let Some(error) = submit_error {
            return Err(error.into());
        }

        // Only the closure of this request's roots.
        let classpath = Classpath::from_paths(
            jar_paths(&self.cache, &resolution.downloads)
                .into_iter()
                .chain(
                    resolution
                        .installed
                        .iter()
                        .map(|identity| self.cache.jar_path(identity)),
                ),
        );
        for warning in &resolution.warnings {
            warn!(?warning, "resolution completed with a warning");
        }
        info!(
            entries = classpath.len(),
            downloaded = report.downloaded.len(),
            "classpath ready"
        );

        Ok(InitializeReport {
            classpath,
            downloaded: report.downloaded,
            stale_entries,
            warnings: resolution.warnings,
        })
    }

    /// [`Bootstrap::initialize`] on a dedicated runtime, for synchronous callers.
    /// Returns [`BootstrapError::NestedRuntime`] when called from a tokio task.
    pub fn initialize_blocking(
        &self,
        request: &InitializeRequest,
    ) -> Result<InitializeReport, BootstrapError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(BootstrapError::NestedRuntime);
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.workers.max(1))
            .enable_all()
            .build()
            .map_err(BootstrapError::Runtime)?;
        runtime.block_on(self.initialize(request))
    }
}
