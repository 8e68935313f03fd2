//! koala_jip - artifact resolver and local jar cache for the KoalaNLP classpath.
//!
//! Requested engine packages are turned into Maven coordinates, their
//! dependency graph is walked over a prioritised [`RepositoryChain`], missing
//! jars are downloaded into a [`CacheStore`] and the resulting classpath is
//! returned. Previously installed artifacts are remembered in an
//! [`InstalledIndex`] so repeat runs only touch the network for new ones.

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod download;
pub mod index;
pub mod packages;
pub mod pom;
pub mod registry;
pub mod repository;
pub mod resolver;

pub use bootstrap::{Bootstrap, BootstrapError, Classpath, InitializeReport, InitializeRequest};
pub use cache::{CacheError, CacheStore, ManifestOrigin};
pub use config::{ConfigLayer, LoggingConfig, ResolverConfig, init_tracing};
pub use download::{DownloadError, DownloadPool, DownloadReport, DownloadSettings};
pub use index::{IndexError, InstalledIndex};
pub use packages::{EnginePackage, PackageRequest, VersionSpec};
pub use registry::{ArtifactIdentity, ExclusionPattern, HttpClient, RemoteClient, RetryConfig};
pub use repository::{Repository, RepositoryChain, RepositoryConfig, RepositoryError};
pub use resolver::{DownloadEntry, Resolution, ResolutionContext, ResolveError, Resolver};
