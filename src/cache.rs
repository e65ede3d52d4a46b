//! Index cache and loader.
//!
//! [`IndexCache::load`] turns a collection id into a ready [`IndexHandle`]:
//!
//! 1. read the collection; refuse with `NotFound` / `NoModelForCollection`
//!    before touching any backend
//! 2. read the artifact from `{cache.dir}/model_{id}.json`, or fetch it
//!    from the repository and write it there (temp file + rename)
//! 3. validate the manifest against the collection and resolve the
//!    backend namespace
//!
//! Cache entries are never invalidated on their own. A refresh evicts the
//! entry it supersedes; operators evict by hand after out-of-band rebuilds.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chatdocs_core::manifest::IndexManifest;

use crate::backend::BackendSelector;
use crate::config::RetrievalConfig;
use crate::error::{Error, Result};
use crate::index::IndexHandle;
use crate::inference::InferenceEngine;
use crate::repository::Repository;

pub struct IndexCache {
    dir: PathBuf,
    repo: Arc<dyn Repository>,
    selector: Arc<BackendSelector>,
    engine: Arc<dyn InferenceEngine>,
    retrieval: RetrievalConfig,
}

impl IndexCache {
    pub fn new(
        dir: impl Into<PathBuf>,
        repo: Arc<dyn Repository>,
        selector: Arc<BackendSelector>,
        engine: Arc<dyn InferenceEngine>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            dir: dir.into(),
            repo,
            selector,
            engine,
            retrieval,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Local cache file for a collection's artifact.
    pub fn entry_path(&self, collection_id: i64) -> PathBuf {
        self.dir.join(format!("model_{}.json", collection_id))
    }

    pub async fn load(&self, collection_id: i64) -> Result<IndexHandle> {
        let collection = self
            .repo
            .get_collection(collection_id)
            .await
            .map_err(Error::Repository)?
            .ok_or(Error::NotFound(collection_id))?;

        let artifact = match collection.model.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(Error::NoModelForCollection(collection_id)),
        };

        let bytes = self.artifact_bytes(collection_id, &artifact).await?;
        let manifest = IndexManifest::from_bytes(&bytes).map_err(Error::Repository)?;
        manifest
            .ensure_matches(&collection)
            .map_err(Error::Repository)?;

        let resolved = self
            .selector
            .resolve(collection.backend, &collection.uuid)
            .await?;

        tracing::info!(
            collection_id,
            backend = %collection.backend,
            namespace = %resolved.context.namespace,
            "index loaded"
        );
        Ok(IndexHandle::new(
            collection_id,
            manifest,
            resolved.context,
            resolved.store,
            self.engine.clone(),
            self.retrieval.clone(),
        ))
    }

    async fn artifact_bytes(&self, collection_id: i64, artifact: &str) -> Result<Vec<u8>> {
        let path = self.entry_path(collection_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                tracing::debug!(collection_id, path = %path.display(), "artifact cache hit");
                return Ok(bytes);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let bytes = self
            .repo
            .read_artifact(artifact)
            .await
            .map_err(Error::Repository)?
            .ok_or(Error::NoModelForCollection(collection_id))?;

        let dir = self.dir.clone();
        let to_write = bytes.clone();
        tokio::task::spawn_blocking(move || write_atomic(&dir, &path, &to_write))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        Ok(bytes)
    }

    /// Drop the local cache entry. Returns whether one existed.
    pub async fn evict(&self, collection_id: i64) -> Result<bool> {
        match tokio::fs::remove_file(self.entry_path(collection_id)).await {
            Ok(()) => {
                tracing::info!(collection_id, "index cache entry evicted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write through a temp file in the same directory so readers never see a
/// partial file.
fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
