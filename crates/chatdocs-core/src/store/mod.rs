//! Vector storage abstraction.
//!
//! A [`VectorBackend`] is a handle on one backend-side namespace (one
//! collection's vectors). Every storage engine chatdocs supports implements
//! it, so index building and querying never branch on the engine.
//!
//! Implementations must be `Send + Sync`; handles are shared read-only
//! across query sessions.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{BackendChoice, Passage, ScoredPassage};

/// Operations the index builder and query pipeline need from a vector store.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorBackend::upsert) | Insert or overwrite passages by id |
/// | [`query`](VectorBackend::query) | Nearest passages to a query vector |
/// | [`count`](VectorBackend::count) | Number of stored passages |
/// | [`clear`](VectorBackend::clear) | Drop every passage in the namespace |
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Which engine this handle talks to.
    fn kind(&self) -> BackendChoice;

    /// The backend-side namespace this handle is bound to.
    fn namespace(&self) -> &str;

    /// Write `passages` with their embedding `vectors` (same order and
    /// length). Passages whose id already exists are overwritten.
    async fn upsert(&self, passages: &[Passage], vectors: &[Vec<f32>]) -> Result<()>;

    /// The `top_k` passages most similar to `vector`, best first.
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<ScoredPassage>>;

    async fn count(&self) -> Result<usize>;

    async fn clear(&self) -> Result<()>;
}

/// Reject mismatched passage/vector batches before they reach a backend.
pub fn check_batch(passages: &[Passage], vectors: &[Vec<f32>]) -> Result<()> {
    if passages.len() != vectors.len() {
        anyhow::bail!(
            "passage/vector count mismatch: {} passages, {} vectors",
            passages.len(),
            vectors.len()
        );
    }
    Ok(())
}
