#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use koala_jip::cache::CacheStore;
use koala_jip::index::InstalledIndex;
use koala_jip::registry::{
    ArtifactIdentity, BoxFuture, DownloadedFile, RegistryError, RemoteClient, sha256_hex,
};
use koala_jip::repository::{Repository, RepositoryChain};
use koala_jip::resolver::ResolutionContext;
use url::Url;

pub const BASE: &str = "https://repo.example.org/maven2/";

/// In-memory remote repository recording every request it receives.
#[derive(Default)]
pub struct CountingRemote {
    files: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
}

impl CountingRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, relative: &str, bytes: impl Into<Vec<u8>>) {
        self.put_at(BASE, relative, bytes);
    }

    /// Serves `relative` under another base URL.
    pub fn put_at(&self, base: &str, relative: &str, bytes: impl Into<Vec<u8>>) {
        self.files
            .lock()
            .expect("files lock")
            .insert(format!("{base}{relative}"), bytes.into());
    }

    /// Publishes a jar-packaged artifact with its manifest and binary.
    pub fn publish(&self, identity: &ArtifactIdentity, dependencies: &[Dependency<'_>]) {
        self.put(&identity.manifest_path("pom"), pom(identity, None, dependencies));
        self.put_jar(identity);
    }

    pub fn put_jar(&self, identity: &ArtifactIdentity) {
        self.put(
            &identity.jar_path("jar"),
            format!("jar:{identity}").into_bytes(),
        );
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// Requests whose URL ends with `relative`.
    pub fn request_count(&self, relative: &str) -> usize {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .filter(|url| url.ends_with(relative))
            .count()
    }

    pub fn manifest_requests(&self, identity: &ArtifactIdentity) -> usize {
        self.request_count(&identity.manifest_path("pom"))
    }

    fn record(&self, url: &Url) -> Option<Vec<u8>> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(url.to_string());
        self.files
            .lock()
            .expect("files lock")
            .get(url.as_str())
            .cloned()
    }
}

impl RemoteClient for CountingRemote {
    fn fetch_bytes<'a>(
        &'a self,
        url: &'a Url,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, RegistryError>> {
        Box::pin(async move { Ok(self.record(url)) })
    }

    fn download_to<'a>(
        &'a self,
        url: &'a Url,
        destination: &'a Path,
    ) -> BoxFuture<'a, Result<DownloadedFile, RegistryError>> {
        Box::pin(async move {
            let Some(bytes) = self.record(url) else {
                return Err(RegistryError::NotFound {
                    url: url.clone(),
                    status: reqwest::StatusCode::NOT_FOUND,
                });
            };
            fs::create_dir_all(destination.parent().expect("parent")).expect("mkdir");
            fs::write(destination, &bytes).expect("write jar");
            Ok(DownloadedFile {
                path: destination.to_path_buf(),
                len: bytes.len() as u64,
                sha256: sha256_hex(&bytes),
            })
        })
    }
}

pub struct Dependency<'a> {
    pub identity: &'a ArtifactIdentity,
    pub exclusions: &'a [&'a str],
}

pub fn dep(identity: &ArtifactIdentity) -> Dependency<'_> {
    Dependency {
        identity,
        exclusions: &[],
    }
}

pub fn dep_excluding<'a>(identity: &'a ArtifactIdentity, exclusions: &'a [&'a str]) -> Dependency<'a> {
    Dependency {
        identity,
        exclusions,
    }
}

/// Minimal POM for `identity`.
pub fn pom(
    identity: &ArtifactIdentity,
    parent: Option<&ArtifactIdentity>,
    dependencies: &[Dependency<'_>],
) -> String {
    let mut xml = String::from("<project>\n  <modelVersion>4.0.0</modelVersion>\n");
    if let Some(parent) = parent {
        xml.push_str(&format!(
            "  <parent>\n    <groupId>{}</groupId>\n    <artifactId>{}</artifactId>\n    <version>{}</version>\n  </parent>\n",
            parent.group(),
            parent.name(),
            parent.version()
        ));
    }
    xml.push_str(&format!(
        "  <groupId>{}</groupId>\n  <artifactId>{}</artifactId>\n  <version>{}</version>\n",
        identity.group(),
        identity.name(),
        identity.version()
    ));
    xml.push_str("  <dependencies>\n");
    for dependency in dependencies {
        let id = dependency.identity;
        xml.push_str(&format!(
            "    <dependency>\n      <groupId>{}</groupId>\n      <artifactId>{}</artifactId>\n      <version>{}</version>\n",
            id.group(),
            id.name(),
            id.version()
        ));
        if let Some(classifier) = id.classifier() {
            xml.push_str(&format!("      <classifier>{classifier}</classifier>\n"));
        }
        if !dependency.exclusions.is_empty() {
            xml.push_str("      <exclusions>\n");
            for exclusion in dependency.exclusions {
                let (group, name) = exclusion.split_once(':').expect("group:name");
                xml.push_str(&format!(
                    "        <exclusion><groupId>{group}</groupId><artifactId>{name}</artifactId></exclusion>\n"
                ));
            }
            xml.push_str("      </exclusions>\n");
        }
        xml.push_str("    </dependency>\n");
    }
    xml.push_str("  </dependencies>\n</project>\n");
    xml
}

/// Parent POM with `pom` packaging.
pub fn parent_pom(identity: &ArtifactIdentity) -> String {
    format!(
        "<project>\n  <groupId>{}</groupId>\n  <artifactId>{}</artifactId>\n  <version>{}</version>\n  <packaging>pom</packaging>\n</project>\n",
        identity.group(),
        identity.name(),
        identity.version()
    )
}

pub fn id(name: &str) -> ArtifactIdentity {
    ArtifactIdentity::new("org.example", name, "1.0")
}

pub fn remote_chain() -> RepositoryChain {
    let mut chain = RepositoryChain::new();
    chain.add_repository(Repository::remote("example", BASE, 0).expect("repository"));
    chain
}

pub fn context(root: &Path, remote: Arc<CountingRemote>) -> ResolutionContext {
    let cache = Arc::new(CacheStore::new(root.join("cache")).expect("cache"));
    ResolutionContext::new(remote_chain(), cache, InstalledIndex::load(root), remote)
}
