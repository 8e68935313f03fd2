//! Transitive dependency resolution.
//!
//! The [`Resolver`] walks the dependency graph of the requested artifacts in
//! FIFO order, looking manifests up in the [`CacheStore`] before the
//! [`RepositoryChain`], and produces the list of artifacts that still need to
//! be downloaded. The walk is sequential; all state it touches lives in one
//! [`ResolutionContext`] owned by the caller.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, ManifestOrigin};
use crate::index::InstalledIndex;
use crate::pom::{DependencySpec, EffectivePom, PomDescriptor, PomError, RawPom};
use crate::registry::{ArtifactIdentity, ExclusionPattern, RemoteClient};
use crate::repository::{Repository, RepositoryChain};

/// Version placeholders resolved from repository metadata.
pub const LATEST_VERSIONS: &[&str] = &["LATEST", "RELEASE"];

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no repository publishes a version of {group}:{name}")]
    UnresolvableVersion { group: String, name: String },
}

/// Everything a resolution reads and mutates.
pub struct ResolutionContext {
    pub chain: RepositoryChain,
    pub cache: Arc<CacheStore>,
    pub index: InstalledIndex,
    pub client: Arc<dyn RemoteClient>,
}

impl ResolutionContext {
    pub fn new(
        chain: RepositoryChain,
        cache: Arc<CacheStore>,
        index: InstalledIndex,
        client: Arc<dyn RemoteClient>,
    ) -> Self {
        Self {
            chain,
            cache,
            index,
            client,
        }
    }
}

/// One artifact to fetch, with the source that served its manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadEntry {
    pub identity: ArtifactIdentity,
    pub origin: ManifestOrigin,
}

impl DownloadEntry {
    pub fn repository(&self) -> Option<&Repository> {
        match &self.origin {
            ManifestOrigin::Repository(repository) => Some(repository),
            ManifestOrigin::Cache => None,
        }
    }

    /// Sort key: the serving repository's location. Cache-served entries sort
    /// first.
    fn source_key(&self) -> String {
        self.repository()
            .map(Repository::location_key)
            .unwrap_or_default()
    }
}

/// Recoverable problems met during the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionWarning {
    ManifestNotFound(ArtifactIdentity),
    /// Coordinates that would escape the repository layout.
    UnsafeCoordinates {
        artifact: ArtifactIdentity,
        message: String,
    },
    ManifestInvalid {
        artifact: ArtifactIdentity,
        message: String,
    },
}

#[derive(Debug, Default)]
pub struct Resolution {
    /// Artifacts to download, sorted by serving repository location.
    pub downloads: Vec<DownloadEntry>,
    /// Skipped because some version is already installed.
    pub skipped_installed: Vec<ArtifactIdentity>,
    /// Installed artifacts the walk reached, in walk order. Together with
    /// `downloads` this is the closure of the requested roots.
    pub installed: Vec<ArtifactIdentity>,
    pub excluded: Vec<ArtifactIdentity>,
    pub warnings: Vec<ResolutionWarning>,
}

impl Resolution {
    pub fn identities(&self) -> impl Iterator<Item = &ArtifactIdentity> {
        self.downloads.iter().map(|entry| &entry.identity)
    }
}

pub struct Resolver<'a> {
    context: &'a mut ResolutionContext,
    global_exclusions: Vec<ExclusionPattern>,
}

impl<'a> Resolver<'a> {
    pub fn new(context: &'a mut ResolutionContext, global_exclusions: Vec<ExclusionPattern>) -> Self {
        Self {
            context,
            global_exclusions,
        }
    }

    /// Replaces `LATEST`/`RELEASE` with the version advertised by the first
    /// repository publishing metadata for the artifact.
    pub async fn select_version(
        &self,
        requested: ArtifactIdentity,
    ) -> Result<ArtifactIdentity, ResolveError> {
        if !is_latest(requested.version()) {
            return Ok(requested);
        }
        let version = self
            .context
            .chain
            .resolve_version(&requested, self.context.client.as_ref())
            .await
            .ok_or_else(|| ResolveError::UnresolvableVersion {
                group: requested.group().to_string(),
                name: requested.name().to_string(),
            })?;
        info!(artifact = %format!("{}:{}", requested.group(), requested.name()), %version, "resolved LATEST");
        Ok(requested.with_version(version))
    }

    /// Computes the download list for `requested`.
    pub async fn resolve(&mut self, requested: &[ArtifactIdentity]) -> Resolution {
        let mut worklist: IndexMap<ArtifactIdentity, Vec<ExclusionPattern>> = IndexMap::new();
        for identity in requested {
            worklist.entry(identity.clone()).or_default();
        }

        let mut resolution = Resolution::default();
        let mut in_download_list: HashSet<ArtifactIdentity> = HashSet::new();
        let mut reached_installed: HashSet<ArtifactIdentity> = HashSet::new();
        let mut cursor = 0;

        while let Some((identity, inherited)) = worklist
            .get_index(cursor)
            .map(|(identity, exclusions)| (identity.clone(), exclusions.clone()))
        {
            cursor += 1;

            if let Err(error) = identity.validate() {
                warn!(artifact = %identity, %error, "unsafe coordinates; dropping");
                resolution.warnings.push(ResolutionWarning::UnsafeCoordinates {
                    artifact: identity,
                    message: error.to_string(),
                });
                continue;
            }

            if self.is_excluded(&identity, &inherited) {
                debug!(artifact = %identity, "excluded");
                resolution.excluded.push(identity);
                continue;
            }

            let installed = (!in_download_list.contains(&identity))
                .then(|| self.context.index.installed_same_artifact(&identity).cloned())
                .flatten();
            if let Some(installed) = installed {
                debug!(artifact = %identity, installed = %installed, "a version is already installed; skipping");
                if !in_download_list.contains(&installed) && reached_installed.insert(installed.clone()) {
                    for dependency in self.installed_dependencies(&installed).await {
                        enqueue(&mut worklist, dependency, &inherited);
                    }
                    resolution.installed.push(installed);
                }
                resolution.skipped_installed.push(identity);
                continue;
            }

            let Some((bytes, origin)) = self.fetch_manifest(&identity).await else {
                warn!(artifact = %identity, "no repository has a manifest; dropping its dependencies");
                resolution
                    .warnings
                    .push(ResolutionWarning::ManifestNotFound(identity));
                continue;
            };

            if self.context.index.is_installed(&identity) {
                if reached_installed.insert(identity.clone()) {
                    resolution.installed.push(identity);
                }
                continue;
            }

            let descriptor = match self.load_descriptor(&identity, &bytes, false).await {
                Ok(descriptor) => descriptor,
                Err(error) => {
                    warn!(artifact = %identity, %error, "manifest is malformed; dropping its dependencies");
                    resolution.warnings.push(ResolutionWarning::ManifestInvalid {
                        artifact: identity,
                        message: error.to_string(),
                    });
                    continue;
                }
            };

            if descriptor.has_binary() {
                in_download_list.insert(identity.clone());
                resolution.downloads.push(DownloadEntry {
                    identity: identity.clone(),
                    origin,
                });
                self.context.index.record_installed(identity.clone());
            }

            for declared in &descriptor.declared_repositories {
                if let Err(error) = self.context.chain.add_declared(&declared.id, &declared.url) {
                    warn!(artifact = %identity, repository = %declared.url, %error, "ignoring declared repository");
                }
            }

            for dependency in descriptor.dependencies {
                enqueue(&mut worklist, dependency, &inherited);
            }
        }

        resolution
            .downloads
            .sort_by_cached_key(DownloadEntry::source_key);
        info!(
            downloads = resolution.downloads.len(),
            installed = resolution.installed.len(),
            skipped = resolution.skipped_installed.len(),
            warnings = resolution.warnings.len(),
            "dependency graph resolved"
        );
        resolution
    }

    fn is_excluded(&self, identity: &ArtifactIdentity, inherited: &[ExclusionPattern]) -> bool {
        self.global_exclusions
            .iter()
            .chain(inherited)
            .any(|pattern| pattern.matches(identity))
    }

    /// Cache first, then the chain. A manifest left on disk by an earlier run
    /// is only trusted when its jar is cached too; otherwise the chain is asked
    /// so the download knows its source.
    async fn fetch_manifest(&self, identity: &ArtifactIdentity) -> Option<(Vec<u8>, ManifestOrigin)> {
        let cache = &self.context.cache;
        match cache.get_manifest(identity) {
            Ok(Some(cached)) => match cached.origin {
                ManifestOrigin::Repository(_) => return Some((cached.bytes, cached.origin)),
                ManifestOrigin::Cache if cache.has_jar(identity) => {
                    return Some((cached.bytes, ManifestOrigin::Cache));
                }
                ManifestOrigin::Cache => {}
            },
            Ok(None) => {}
            Err(error) => warn!(artifact = %identity, %error, "manifest cache unreadable"),
        }

        let (bytes, repository) = self
            .context
            .chain
            .find_manifest(identity, self.context.client.as_ref())
            .await?;
        if let Err(error) = cache.put_manifest(identity, &bytes, &repository) {
            warn!(artifact = %identity, %error, "could not cache manifest");
        }
        Some((bytes, ManifestOrigin::Repository(repository)))
    }

    /// Dependencies of an installed artifact, read from its cached manifest
    /// without asking any repository.
    async fn installed_dependencies(&self, installed: &ArtifactIdentity) -> Vec<DependencySpec> {
        let Some(bytes) = self.cached_manifest(installed) else {
            debug!(artifact = %installed, "no cached manifest for installed artifact");
            return Vec::new();
        };
        match self.load_descriptor(installed, &bytes, true).await {
            Ok(descriptor) => descriptor.dependencies,
            Err(error) => {
                warn!(artifact = %installed, %error, "cached manifest is malformed");
                Vec::new()
            }
        }
    }

    fn cached_manifest(&self, identity: &ArtifactIdentity) -> Option<Vec<u8>> {
        match self.context.cache.get_manifest(identity) {
            Ok(cached) => cached.map(|cached| cached.bytes),
            Err(error) => {
                warn!(artifact = %identity, %error, "manifest cache unreadable");
                None
            }
        }
    }

    /// Parses `bytes` with its parent chain folded in. `cache_only` keeps
    /// parent lookups away from the repository chain.
    async fn load_descriptor(
        &self,
        identity: &ArtifactIdentity,
        bytes: &[u8],
        cache_only: bool,
    ) -> Result<PomDescriptor, PomError> {
        let raw = RawPom::parse(bytes)?;
        let mut lineage: Vec<(ArtifactIdentity, RawPom)> = Vec::new();
        let mut seen: HashSet<ArtifactIdentity> = HashSet::from([identity.clone()]);
        let mut next_parent = raw.parent();

        while let Some(parent) = next_parent.take() {
            if !seen.insert(parent.clone()) {
                warn!(artifact = %identity, parent = %parent, "parent manifest cycle; stopping inheritance");
                break;
            }
            if let Err(error) = parent.validate() {
                warn!(artifact = %identity, parent = %parent, %error, "unsafe parent coordinates");
                break;
            }
            let parent_bytes = if cache_only {
                self.cached_manifest(&parent)
            } else {
                self.fetch_manifest(&parent).await.map(|(bytes, _)| bytes)
            };
            let Some(parent_bytes) = parent_bytes else {
                warn!(artifact = %identity, parent = %parent, "parent manifest unavailable");
                break;
            };
            match RawPom::parse(&parent_bytes) {
                Ok(parent_raw) => {
                    next_parent = parent_raw.parent();
                    lineage.push((parent, parent_raw));
                }
                Err(error) => {
                    warn!(artifact = %identity, parent = %parent, %error, "parent manifest malformed");
                    break;
                }
            }
        }

        let mut effective: Option<EffectivePom> = None;
        for (owner, parent_raw) in lineage.iter().rev() {
            effective = Some(EffectivePom::inherit(owner, parent_raw, effective.as_ref()));
        }
        let effective = EffectivePom::inherit(identity, &raw, effective.as_ref());
        Ok(PomDescriptor::build(identity, &raw, &effective))
    }
}

/// Adds `dependency` to the worklist unless already queued; the first
/// enqueued exclusion set wins.
fn enqueue(
    worklist: &mut IndexMap<ArtifactIdentity, Vec<ExclusionPattern>>,
    dependency: DependencySpec,
    inherited: &[ExclusionPattern],
) {
    let mut exclusions = inherited.to_vec();
    for pattern in dependency.exclusions {
        if !exclusions.contains(&pattern) {
            exclusions.push(pattern);
        }
    }
    worklist.entry(dependency.identity).or_insert(exclusions);
}

fn is_latest(version: &str) -> bool {
    LATEST_VERSIONS
        .iter()
        .any(|marker| version.eq_ignore_ascii_case(marker))
}

/// Local paths of `downloads`, in order.
pub fn jar_paths<'e>(
    cache: &CacheStore,
    downloads: impl IntoIterator<Item = &'e DownloadEntry>,
) -> Vec<PathBuf> {
    downloads
        .into_iter()
        .map(|entry| cache.jar_path(&entry.identity))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BoxFuture, DownloadedFile, RegistryError};
    use std::path::Path;
    use tempfile::{TempDir, tempdir};
    use url::Url;

    struct OfflineClient;

    impl RemoteClient for OfflineClient {
        fn fetch_bytes<'a>(
            &'a self,
            _url: &'a Url,
        ) -> BoxFuture<'a, Result<Option<Vec<u8>>, RegistryError>> {
            Box::pin(async { Ok(None) })
        }

        fn download_to<'a>(
            &'a self,
            url: &'a Url,
            _destination: &'a Path,
        ) -> BoxFuture<'a, Result<DownloadedFile, RegistryError>> {
            Box::pin(async move {
                Err(RegistryError::NotFound {
                    url: url.clone(),
                    status: reqwest::StatusCode::NOT_FOUND,
                })
            })
        }
    }

    fn write_pom(root: &Path, identity: &ArtifactIdentity, body: &str) {
        let path = root.join(identity.manifest_path("pom"));
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, format!("<project>{body}</project>")).expect("write");
    }

    fn dependency(identity: &ArtifactIdentity) -> String {
        format!(
            "<dependency><groupId>{}</groupId><artifactId>{}</artifactId><version>{}</version></dependency>",
            identity.group(),
            identity.name(),
            identity.version()
        )
    }

    fn context(repo: &TempDir, home: &TempDir) -> ResolutionContext {
        let mut chain = RepositoryChain::new();
        chain.add_repository(Repository::local("fixture", repo.path(), 0));
        ResolutionContext::new(
            chain,
            Arc::new(CacheStore::new(home.path().join("cache")).expect("cache")),
            InstalledIndex::load(home.path()),
            Arc::new(OfflineClient),
        )
    }

    fn id(name: &str) -> ArtifactIdentity {
        ArtifactIdentity::new("org.example", name, "1.0")
    }

    #[tokio::test]
    async fn first_enqueued_exclusions_win() {
        let repo = tempdir().expect("tempdir");
        let home = tempdir().expect("tempdir");
        let (a, b, c, x) = (id("a"), id("b"), id("c"), id("x"));
        write_pom(
            repo.path(),
            &a,
            &format!(
                "<dependencies>\
                 <dependency><groupId>org.example</groupId><artifactId>b</artifactId><version>1.0</version>\
                 <exclusions><exclusion><groupId>org.example</groupId><artifactId>x</artifactId></exclusion></exclusions>\
                 </dependency>{}</dependencies>",
                dependency(&c)
            ),
        );
        write_pom(repo.path(), &b, &format!("<dependencies>{}</dependencies>", dependency(&x)));
        write_pom(repo.path(), &c, &format!("<dependencies>{}</dependencies>", dependency(&x)));
        write_pom(repo.path(), &x, "");

        let mut ctx = context(&repo, &home);
        let resolution = Resolver::new(&mut ctx, Vec::new()).resolve(&[a.clone()]).await;

        let names: Vec<&str> = resolution.identities().map(ArtifactIdentity::name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(resolution.excluded, vec![x]);
    }

    #[tokio::test]
    async fn malformed_manifest_drops_only_that_subtree() {
        let repo = tempdir().expect("tempdir");
        let home = tempdir().expect("tempdir");
        let (a, broken, ok) = (id("a"), id("broken"), id("ok"));
        write_pom(
            repo.path(),
            &a,
            &format!("<dependencies>{}{}</dependencies>", dependency(&broken), dependency(&ok)),
        );
        let broken_path = repo.path().join(broken.manifest_path("pom"));
        std::fs::create_dir_all(broken_path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&broken_path, "<project><dependencies>").expect("write");
        write_pom(repo.path(), &ok, "");

        let mut ctx = context(&repo, &home);
        let resolution = Resolver::new(&mut ctx, Vec::new()).resolve(&[a]).await;

        let names: Vec<&str> = resolution.identities().map(ArtifactIdentity::name).collect();
        assert_eq!(names, vec!["a", "ok"]);
        assert!(matches!(
            resolution.warnings.as_slice(),
            [ResolutionWarning::ManifestInvalid { artifact, .. }] if artifact == &broken
        ));
        assert!(!ctx.index.is_installed(&broken));
    }

    #[tokio::test]
    async fn unsafe_root_is_reported_not_fetched() {
        let repo = tempdir().expect("tempdir");
        let home = tempdir().expect("tempdir");
        let escaping = id("evil").with_classifier("../../escaped");
        write_pom(repo.path(), &id("evil"), "");

        let mut ctx = context(&repo, &home);
        let resolution = Resolver::new(&mut ctx, Vec::new())
            .resolve(&[escaping.clone(), id("evil")])
            .await;

        assert_eq!(resolution.identities().cloned().collect::<Vec<_>>(), vec![id("evil")]);
        assert!(matches!(
            resolution.warnings.as_slice(),
            [ResolutionWarning::UnsafeCoordinates { artifact, .. }] if artifact == &escaping
        ));
        assert!(!ctx.index.is_installed(&escaping));
    }

    #[tokio::test]
    async fn parent_chain_supplies_managed_versions() {
        let repo = tempdir().expect("tempdir");
        let home = tempdir().expect("tempdir");
        let parent = ArtifactIdentity::new("org.example", "parent", "3");
        write_pom(
            repo.path(),
            &parent,
            "<packaging>pom</packaging>\
             <dependencyManagement><dependencies>\
               <dependency><groupId>org.example</groupId><artifactId>lib</artifactId><version>2.5</version></dependency>\
             </dependencies></dependencyManagement>",
        );
        let child = id("child");
        write_pom(
            repo.path(),
            &child,
            "<parent><groupId>org.example</groupId><artifactId>parent</artifactId><version>3</version></parent>\
             <dependencies><dependency><groupId>org.example</groupId><artifactId>lib</artifactId></dependency></dependencies>",
        );
        let lib = ArtifactIdentity::new("org.example", "lib", "2.5");
        write_pom(repo.path(), &lib, "");

        let mut ctx = context(&repo, &home);
        let resolution = Resolver::new(&mut ctx, Vec::new()).resolve(&[child.clone()]).await;

        assert_eq!(
            resolution.identities().cloned().collect::<Vec<_>>(),
            vec![child, lib]
        );
        assert!(!ctx.index.is_installed(&parent));
    }

    #[tokio::test]
    async fn select_version_reads_metadata() {
        let repo = tempdir().expect("tempdir");
        let home = tempdir().expect("tempdir");
        let dir = repo.path().join("org/example/a");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(
            dir.join("maven-metadata.xml"),
            "<metadata><versioning><latest>1.3</latest><release>1.2</release></versioning></metadata>",
        )
        .expect("write");

        let mut ctx = context(&repo, &home);
        let resolver = Resolver::new(&mut ctx, Vec::new());
        let chosen = resolver
            .select_version(ArtifactIdentity::new("org.example", "a", "LATEST"))
            .await
            .expect("version");
        assert_eq!(chosen.version(), "1.2");

        let pinned = resolver.select_version(id("a")).await.expect("pinned");
        assert_eq!(pinned.version(), "1.0");

        let missing = resolver
            .select_version(ArtifactIdentity::new("org.example", "none", "latest"))
            .await;
        assert!(matches!(missing, Err(ResolveError::UnresolvableVersion { .. })));
    }
}
