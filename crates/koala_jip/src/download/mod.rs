//! Bounded worker pool fetching jars into the cache.
//!
//! Jobs go through a bounded channel, so [`DownloadPool::submit`] waits when
//! the workers fall behind. [`DownloadPool::join_all`] closes the queue and
//! waits for every worker. The first failure stops the remaining workers and
//! is returned from `join_all`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CacheStore, ManifestOrigin};
use crate::registry::{ArtifactIdentity, RemoteClient};
use crate::repository::{Repository, RepositoryError};
use crate::resolver::DownloadEntry;

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub default_workers: usize,
    pub warning_threshold: usize,
    pub hard_limit: usize,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            default_workers: 3,
            warning_threshold: 16,
            hard_limit: 32,
        }
    }
}

/// Worker count after applying [`DownloadSettings`] limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConcurrency {
    pub applied: usize,
    pub warnings: Vec<String>,
}

impl DownloadSettings {
    pub fn effective_workers(&self, requested: Option<usize>) -> EffectiveConcurrency {
        let mut warnings = Vec::new();
        let requested = requested.unwrap_or(self.default_workers);
        let hard_limit = self.hard_limit.max(1);
        let mut applied = requested.max(1);

        if requested == 0 {
            let message = "download concurrency of 0 raised to 1".to_string();
            warn!("{message}");
            warnings.push(message);
        }

        if applied > hard_limit {
            let message = format!(
                "download concurrency {applied} exceeds the limit of {hard_limit}; using {hard_limit}"
            );
            warn!(requested = applied, hard_limit, "{message}");
            warnings.push(message);
            applied = hard_limit;
        }

        if applied > self.warning_threshold.max(1) {
            let message = format!(
                "download concurrency {applied} is above the recommended {}",
                self.warning_threshold
            );
            warn!(applied, warning_threshold = self.warning_threshold, "{message}");
            warnings.push(message);
        }

        EffectiveConcurrency { applied, warnings }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("failed to fetch {artifact}: {source}")]
    Fetch {
        artifact: ArtifactIdentity,
        source: RepositoryError,
    },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("download worker terminated abnormally: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("download queue is closed")]
    Closed,
}

#[derive(Debug, Clone)]
struct DownloadJob {
    identity: ArtifactIdentity,
    repository: Repository,
}

/// A jar written to the cache by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedArtifact {
    pub identity: ArtifactIdentity,
    pub path: PathBuf,
    pub sha256: String,
    pub repository: String,
}

#[derive(Debug, Default)]
pub struct DownloadReport {
    pub downloaded: Vec<DownloadedArtifact>,
    /// Not queued: already cached, or served by the cache itself.
    pub skipped: Vec<ArtifactIdentity>,
}

type WorkerResult = Result<Vec<DownloadedArtifact>, DownloadError>;

pub struct DownloadPool {
    sender: Option<mpsc::Sender<DownloadJob>>,
    workers: JoinSet<WorkerResult>,
    aborted: Arc<AtomicBool>,
    cache: Arc<CacheStore>,
    skipped: Vec<ArtifactIdentity>,
}

impl DownloadPool {
    /// Starts `worker_count` workers. Must be called inside a tokio runtime.
    pub fn new(cache: Arc<CacheStore>, client: Arc<dyn RemoteClient>, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = mpsc::channel::<DownloadJob>(worker_count * 2);
        let receiver = Arc::new(Mutex::new(receiver));
        let aborted = Arc::new(AtomicBool::new(false));

        let mut workers = JoinSet::new();
        for worker in 0..worker_count {
            workers.spawn(run_worker(
                worker,
                Arc::clone(&receiver),
                Arc::clone(&cache),
                Arc::clone(&client),
                Arc::clone(&aborted),
            ));
        }
        debug!(workers = worker_count, "download pool started");

        Self {
            sender: Some(sender),
            workers,
            aborted,
            cache,
            skipped: Vec::new(),
        }
    }

    /// Queues a download unless the jar is already cached or its manifest
    /// came from the cache. Returns whether a job was queued.
    pub async fn submit(&mut self, entry: DownloadEntry) -> Result<bool, DownloadError> {
        let DownloadEntry { identity, origin } = entry;
        let repository = match origin {
            ManifestOrigin::Repository(repository) if !self.cache.has_jar(&identity) => repository,
            _ => {
                debug!(artifact = %identity, "already cached; not downloading");
                self.skipped.push(identity);
                return Ok(false);
            }
        };

        let sender = self.sender.as_ref().ok_or(DownloadError::Closed)?;
        sender
            .send(DownloadJob {
                identity,
                repository,
            })
            .await
            .map_err(|_| DownloadError::Closed)?;
        Ok(true)
    }

    /// Closes the queue and waits for the workers to drain it.
    pub async fn join_all(mut self) -> Result<DownloadReport, DownloadError> {
        self.sender.take();

        let mut downloaded = Vec::new();
        let mut first_error: Option<DownloadError> = None;
        while let Some(joined) = self.workers.join_next().await {
            let outcome = joined.map_err(DownloadError::from).and_then(|result| result);
            match outcome {
                Ok(mut artifacts) => downloaded.append(&mut artifacts),
                Err(error) => {
                    self.aborted.store(true, Ordering::SeqCst);
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        info!(downloaded = downloaded.len(), skipped = self.skipped.len(), "downloads complete");
        Ok(DownloadReport {
            downloaded,
            skipped: self.skipped,
        })
    }
}

async fn run_worker(
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<DownloadJob>>>,
    cache: Arc<CacheStore>,
    client: Arc<dyn RemoteClient>,
    aborted: Arc<AtomicBool>,
) -> WorkerResult {
    let mut completed = Vec::new();
    loop {
        if aborted.load(Ordering::SeqCst) {
            break;
        }
        let job = receiver.lock().await.recv().await;
        let Some(DownloadJob {
            identity,
            repository,
        }) = job
        else {
            break;
        };

        let destination = match cache.jar_destination(&identity) {
            Ok(destination) => destination,
            Err(error) => {
                aborted.store(true, Ordering::SeqCst);
                warn!(artifact = %identity, %error, "refusing to download outside the cache");
                return Err(error.into());
            }
        };
        debug!(worker, artifact = %identity, repository = %repository.name(), "downloading");
        let file = match repository
            .fetch_binary(&identity, &destination, client.as_ref())
            .await
        {
            Ok(file) => file,
            Err(source) => {
                aborted.store(true, Ordering::SeqCst);
                warn!(artifact = %identity, repository = %repository.name(), error = %source, "download failed");
                return Err(DownloadError::Fetch {
                    artifact: identity,
                    source,
                });
            }
        };
        if let Err(error) = cache.record_jar(&identity, &file.sha256) {
            aborted.store(true, Ordering::SeqCst);
            return Err(error.into());
        }
        info!(artifact = %identity, repository = %repository.name(), bytes = file.len, "downloaded");

        completed.push(DownloadedArtifact {
            identity,
            path: file.path,
            sha256: file.sha256,
            repository: repository.name().to_string(),
        });
    }
    Ok(completed)
}
