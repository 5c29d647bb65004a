//! Keeps the local model cache in step with an object-store bucket.
//!
//! One-shot mode copies every live artifact once and returns; watch mode
//! follows bucket updates until shutdown. Delete events never remove local
//! files, so a model deleted upstream keeps serving until replaced.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerError, Connector, ObjectStore, WatchOutcome};

pub const WATCH_POLL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to connect to broker: {0}")]
    Connect(#[source] BrokerError),
    #[error("failed to open bucket `{bucket}`: {source}")]
    Bucket {
        bucket: String,
        #[source]
        source: BrokerError,
    },
    #[error("no models found in bucket `{0}`")]
    NoModelsAvailable(String),
    #[error("failed to download `{name}`: {source}")]
    Download {
        name: String,
        #[source]
        source: BrokerError,
    },
    #[error("refusing to write artifact with unsafe name `{0}`")]
    UnsafeName(String),
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bucket watch failed: {0}")]
    Watch(#[source] BrokerError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub bucket: String,
    pub cache_dir: PathBuf,
    pub run_watcher: bool,
    pub poll_timeout: Duration,
}

pub struct ModelSync {
    config: SyncConfig,
}

/// Local path for artifact `name`, rejecting anything that would escape the
/// cache directory.
pub fn artifact_path(cache_dir: &Path, name: &str) -> Result<PathBuf, SyncError> {
    let relative = Path::new(name);
    let safe = !name.is_empty()
        && relative.components().all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        return Err(SyncError::UnsafeName(name.to_string()));
    }
    Ok(cache_dir.join(relative))
}

impl ModelSync {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    /// Connects, makes sure the bucket exists, then runs the configured mode.
    /// Returns the number of artifacts written.
    pub async fn watch(
        &self,
        connector: &dyn Connector,
        shutdown: watch::Receiver<bool>,
    ) -> Result<usize, SyncError> {
        let broker = connector.connect().await.map_err(SyncError::Connect)?;
        let result = self.run(broker.as_ref(), shutdown).await;
        if let Err(e) = broker.close().await {
            warn!(error = %e, "error closing model sync connection");
        }
        result
    }

    async fn run(&self, broker: &dyn Broker, shutdown: watch::Receiver<bool>) -> Result<usize, SyncError> {
        let store = self.ensure_bucket(broker).await?;
        if self.config.run_watcher {
            self.follow(store.as_ref(), shutdown).await
        } else {
            let written = self.sync_all(store.as_ref()).await?;
            info!(written, "skipping the model object store watcher");
            Ok(written)
        }
    }

    async fn ensure_bucket(&self, broker: &dyn Broker) -> Result<Arc<dyn ObjectStore>, SyncError> {
        let bucket = &self.config.bucket;
        match broker.object_store(bucket).await {
            Ok(store) => Ok(store),
            Err(BrokerError::BucketNotFound(_)) => {
                info!(bucket = %bucket, "bucket not found, creating it");
                broker
                    .create_object_store(bucket)
                    .await
                    .map_err(|source| SyncError::Bucket { bucket: bucket.clone(), source })
            }
            Err(source) => Err(SyncError::Bucket { bucket: bucket.clone(), source }),
        }
    }

    /// Downloads every live artifact. An empty bucket is fatal.
    pub async fn sync_all(&self, store: &dyn ObjectStore) -> Result<usize, SyncError> {
        let listed = store
            .list()
            .await
            .map_err(|source| SyncError::Bucket { bucket: self.config.bucket.clone(), source })?;
        let live: Vec<_> = listed.into_iter().filter(|o| !o.deleted).collect();
        if live.is_empty() {
            return Err(SyncError::NoModelsAvailable(self.config.bucket.clone()));
        }
        for object in &live {
            self.store_file(store, &object.name).await?;
        }
        Ok(live.len())
    }

    async fn follow(
        &self,
        store: &dyn ObjectStore,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<usize, SyncError> {
        let mut watcher = store.watch(false).await.map_err(SyncError::Watch)?;
        let mut written = 0;
        info!(bucket = %self.config.bucket, "watching for model updates");
        loop {
            let update = tokio::select! {
                update = watcher.next_update(self.config.poll_timeout) => update,
                _ = shutdown.changed() => {
                    info!("model watcher cancelled");
                    return Ok(written);
                }
            };
            match update.map_err(SyncError::Watch)? {
                WatchOutcome::Timeout => continue,
                WatchOutcome::Event(object) if object.deleted => {
                    debug!(name = %object.name, "ignoring delete event");
                }
                WatchOutcome::Event(object) => match self.store_file(store, &object.name).await {
                    Ok(_) => written += 1,
                    Err(e) => warn!(name = %object.name, error = %e, "failed to sync model"),
                },
            }
        }
    }

    pub async fn store_file(&self, store: &dyn ObjectStore, name: &str) -> Result<PathBuf, SyncError> {
        let path = artifact_path(&self.config.cache_dir, name)?;
        let data = store
            .get(name)
            .await
            .map_err(|source| SyncError::Download { name: name.to_string(), source })?;
        let write_err = |source| SyncError::Write { path: path.clone(), source };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        tokio::fs::write(&path, &data).await.map_err(write_err)?;
        metrics::counter!("neural_trade_models_synced_total").increment(1);
        info!(name, bytes = data.len(), path = %path.display(), "stored model");
        Ok(path)
    }
}
