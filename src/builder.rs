//! Index builder and incremental loader.
//!
//! Both run as background jobs and report a plain `bool`; failures are
//! logged and recorded on the collection, never returned to a caller.
//!
//! **Build** drives `QUEUED → RUNNING → COMPLETE | ERROR`:
//! materialize every document into a private temp dir, extract text,
//! chunk, embed in batches and upsert into the collection's namespace,
//! then store a fresh manifest and mark the collection COMPLETE in one
//! repository transaction. Passage ids are deterministic, so building the
//! same documents twice overwrites rather than duplicates.
//!
//! **Refresh** merges one newly added document into a COMPLETE index:
//! upsert its passages, persist an updated manifest as the collection's
//! artifact, and evict the local cache entry so new sessions see it.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use walkdir::WalkDir;

use chatdocs_core::chunk::chunk_document;
use chatdocs_core::manifest::IndexManifest;
use chatdocs_core::models::{Collection, CollectionStatus, Document, Passage};
use chatdocs_core::store::VectorBackend;

use crate::backend::BackendSelector;
use crate::cache::IndexCache;
use crate::config::ChunkingConfig;
use crate::error::Error;
use crate::extract::extract_text;
use crate::inference::InferenceEngine;
use crate::repository::Repository;

/// Everything a build or refresh job needs. Cheap to clone.
#[derive(Clone)]
pub struct BuildContext {
    pub repo: Arc<dyn Repository>,
    pub selector: Arc<BackendSelector>,
    pub engine: Arc<dyn InferenceEngine>,
    pub cache: Arc<IndexCache>,
    pub chunking: ChunkingConfig,
    pub batch_size: usize,
}

/// Text pulled out of one materialized document.
#[derive(Debug)]
struct ExtractedDoc {
    document_id: i64,
    file_name: String,
    text: String,
}

/// Build the full index for `collection_id`. Returns `true` on COMPLETE.
pub async fn build_index(ctx: &BuildContext, collection_id: i64) -> bool {
    let collection = match ctx.repo.get_collection(collection_id).await {
        Ok(Some(c)) => c,
        Ok(None) => {
            tracing::error!(collection_id, "build requested for unknown collection");
            return false;
        }
        Err(e) => {
            tracing::error!(collection_id, "failed to read collection: {:#}", e);
            return false;
        }
    };

    if let Err(e) = ctx
        .repo
        .transition_status(collection_id, CollectionStatus::Queued, CollectionStatus::Running)
        .await
    {
        tracing::warn!(collection_id, status = %collection.status, "build not started: {:#}", e);
        return false;
    }
    tracing::info!(collection_id, backend = %collection.backend, "index build started");

    let outcome = match run_build(ctx, &collection).await {
        Ok((name, bytes)) => ctx
            .repo
            .complete_with_artifact(collection_id, &name, &bytes)
            .await
            .map(|_| name),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(name) => {
            tracing::info!(collection_id, artifact = %name, "index build complete");
            true
        }
        Err(e) => {
            let err = Error::build_failed(collection_id, e);
            tracing::error!(collection_id, "{:#}", anyhow!(err));
            if let Err(e) = ctx.repo.fail(collection_id).await {
                tracing::error!(collection_id, "failed to record ERROR status: {:#}", e);
            }
            false
        }
    }
}

async fn run_build(ctx: &BuildContext, collection: &Collection) -> Result<(String, Vec<u8>)> {
    let documents = ctx.repo.list_documents(collection.id).await?;
    let document_count = documents.len();
    let extracted = extract_documents(documents).await?;

    let resolved = ctx
        .selector
        .resolve(collection.backend, &collection.uuid)
        .await?;
    if resolved.context.overwrite {
        tracing::info!(namespace = %resolved.context.namespace, "clearing namespace before build");
        resolved.store.clear().await?;
    }

    let passages = chunk_all(ctx, &extracted);
    if passages.is_empty() {
        bail!("no indexable text in {} documents", document_count);
    }

    let dims = embed_and_upsert(ctx, resolved.store.as_ref(), &passages, None).await?;

    let manifest = IndexManifest {
        collection_uuid: collection.uuid,
        backend: collection.backend,
        namespace: resolved.context.namespace,
        embed_model: ctx.engine.embed_model().to_string(),
        dims,
        documents: document_count,
        passages: passages.len(),
        built_at: Utc::now(),
    };
    Ok((IndexManifest::artifact_name(), manifest.to_bytes()?))
}

/// Merge one added document into a COMPLETE collection's index.
pub async fn refresh_index(ctx: &BuildContext, collection_id: i64, document_id: i64) -> bool {
    match run_refresh(ctx, collection_id, document_id).await {
        Ok(true) => true,
        Ok(false) => false,
        Err(e) => {
            tracing::error!(collection_id, document_id, "index refresh failed: {:#}", e);
            false
        }
    }
}

async fn run_refresh(ctx: &BuildContext, collection_id: i64, document_id: i64) -> Result<bool> {
    let collection = ctx
        .repo
        .get_collection(collection_id)
        .await?
        .ok_or_else(|| anyhow!("collection {} not found", collection_id))?;

    if collection.status != CollectionStatus::Complete {
        tracing::warn!(
            collection_id,
            document_id,
            status = %collection.status,
            "refresh skipped: collection index is not COMPLETE"
        );
        return Ok(false);
    }
    let current = collection
        .model
        .as_deref()
        .ok_or_else(|| anyhow!("COMPLETE collection {} has no artifact", collection_id))?;

    let document = ctx
        .repo
        .get_document(document_id)
        .await?
        .filter(|d| d.collection_id == collection_id)
        .ok_or_else(|| {
            anyhow!(
                "document {} not found in collection {}",
                document_id,
                collection_id
            )
        })?;

    let bytes = ctx
        .repo
        .read_artifact(current)
        .await?
        .ok_or_else(|| anyhow!("artifact '{}' is missing", current))?;
    let mut manifest = IndexManifest::from_bytes(&bytes)?;
    manifest.ensure_matches(&collection)?;

    let extracted = extract_documents(vec![document]).await?;
    let resolved = ctx
        .selector
        .resolve(collection.backend, &collection.uuid)
        .await?;

    let passages = chunk_all(ctx, &extracted);
    if !passages.is_empty() {
        embed_and_upsert(
            ctx,
            resolved.store.as_ref(),
            &passages,
            Some(manifest.dims),
        )
        .await?;
    }

    // Recount: the build may already have indexed this document.
    manifest.documents = ctx.repo.document_names(collection_id).await?.len();
    manifest.passages = resolved.store.count().await?;
    manifest.built_at = Utc::now();
    let name = IndexManifest::artifact_name();
    ctx.repo
        .replace_artifact(collection_id, &name, &manifest.to_bytes()?)
        .await?;
    ctx.cache.evict(collection_id).await?;

    tracing::info!(
        collection_id,
        document_id,
        passages = passages.len(),
        artifact = %name,
        "document merged into index"
    );
    Ok(true)
}

fn chunk_all(ctx: &BuildContext, extracted: &[ExtractedDoc]) -> Vec<Passage> {
    extracted
        .iter()
        .flat_map(|d| {
            chunk_document(
                d.document_id,
                &d.file_name,
                &d.text,
                ctx.chunking.max_tokens,
                ctx.chunking.overlap_tokens,
            )
        })
        .collect()
}

/// Embed `passages` in batches and upsert each batch. Returns the vector
/// dimensionality. With `expected_dims`, a batch of any other width is
/// rejected before anything is written.
async fn embed_and_upsert(
    ctx: &BuildContext,
    store: &dyn VectorBackend,
    passages: &[Passage],
    expected_dims: Option<usize>,
) -> Result<usize> {
    let mut dims = expected_dims.unwrap_or(0);
    for batch in passages.chunks(ctx.batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
        let vectors = ctx.engine.embed(&texts).await.context("embedding failed")?;
        if let Some(first) = vectors.first() {
            if dims == 0 {
                dims = first.len();
            }
            if first.len() != dims && expected_dims.is_some() {
                bail!(
                    "embedding dims changed from {} to {}; rebuild the collection",
                    dims,
                    first.len()
                );
            }
            if vectors.iter().any(|v| v.len() != dims || v.is_empty()) {
                bail!("embedding engine returned inconsistent dimensions");
            }
        }
        store.upsert(batch, &vectors).await?;
    }
    Ok(dims)
}

/// Materialize `documents` into a private temp dir and extract their text.
/// The directory is removed when this returns, on every path.
async fn extract_documents(documents: Vec<Document>) -> Result<Vec<ExtractedDoc>> {
    tokio::task::spawn_blocking(move || {
        let dir = tempfile::tempdir().context("failed to create build directory")?;
        materialize(dir.path(), &documents)?;
        read_materialized(dir.path())
    })
    .await?
}

fn materialize(root: &Path, documents: &[Document]) -> Result<()> {
    for doc in documents {
        let path = root
            .join(doc.id.to_string())
            .join(safe_relative(&doc.file_name)?);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &doc.content)
            .with_context(|| format!("failed to materialize '{}'", doc.file_name))?;
    }
    Ok(())
}

fn read_materialized(root: &Path) -> Result<Vec<ExtractedDoc>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root)?;
        let mut parts = rel.components();
        let document_id: i64 = parts
            .next()
            .and_then(|c| c.as_os_str().to_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow!("unexpected path in build directory: {}", rel.display()))?;
        let file_name = parts
            .as_path()
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");

        let bytes = std::fs::read(entry.path())?;
        match extract_text(&file_name, &bytes)
            .with_context(|| format!("failed to extract '{}'", file_name))?
        {
            Some(text) => out.push(ExtractedDoc {
                document_id,
                file_name,
                text,
            }),
            None => tracing::warn!(document_id, file = %file_name, "skipping binary document"),
        }
    }
    Ok(out)
}

/// Keep only the normal components of a stored file name so it cannot
/// escape the build directory.
fn safe_relative(name: &str) -> Result<PathBuf> {
    let path: PathBuf = Path::new(name)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    if path.as_os_str().is_empty() {
        bail!("document name '{}' has no usable path", name);
    }
    Ok(path)
}
