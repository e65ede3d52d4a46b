//! In-memory [`VectorBackend`] used in tests.
//!
//! Rows live in a `BTreeMap` keyed by passage id behind a `RwLock`;
//! queries are brute-force cosine similarity.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{BackendChoice, Passage, ScoredPassage};
use crate::vector::{cosine_similarity, rank_top_k};

use super::{check_batch, VectorBackend};

pub struct InMemoryBackend {
    kind: BackendChoice,
    namespace: String,
    rows: RwLock<BTreeMap<String, (Passage, Vec<f32>)>>,
}

impl InMemoryBackend {
    pub fn new(kind: BackendChoice, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            rows: RwLock::new(BTreeMap::new()),
        }
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory vector store lock poisoned")
}

#[async_trait]
impl VectorBackend for InMemoryBackend {
    fn kind(&self) -> BackendChoice {
        self.kind
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn upsert(&self, passages: &[Passage], vectors: &[Vec<f32>]) -> Result<()> {
        check_batch(passages, vectors)?;
        let mut rows = self.rows.write().map_err(poisoned)?;
        for (p, v) in passages.iter().zip(vectors) {
            rows.insert(p.id.clone(), (p.clone(), v.clone()));
        }
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<ScoredPassage>> {
        let rows = self.rows.read().map_err(poisoned)?;
        let hits = rows
            .values()
            .map(|(p, v)| ScoredPassage {
                id: p.id.clone(),
                document_id: p.document_id,
                file_name: p.file_name.clone(),
                text: p.text.clone(),
                score: cosine_similarity(vector, v),
            })
            .collect();
        Ok(rank_top_k(hits, top_k))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.rows.read().map_err(poisoned)?.len())
    }

    async fn clear(&self) -> Result<()> {
        self.rows.write().map_err(poisoned)?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(id: &str, text: &str) -> Passage {
        Passage {
            id: id.into(),
            document_id: 1,
            file_name: "a.txt".into(),
            chunk_index: 0,
            text: text.into(),
            hash: String::new(),
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_by_id() {
        let store = InMemoryBackend::new(BackendChoice::Embedded, "ns");
        store
            .upsert(&[passage("1:0", "old")], &[vec![1.0, 0.0]])
            .await
            .unwrap();
        store
            .upsert(&[passage("1:0", "new")], &[vec![0.0, 1.0]])
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        let hits = store.query(&[0.0, 1.0], 5).await.unwrap();
        assert_eq!(hits[0].text, "new");
    }

    #[tokio::test]
    async fn query_returns_nearest_first() {
        let store = InMemoryBackend::new(BackendChoice::Embedded, "ns");
        store
            .upsert(
                &[passage("a", "east"), passage("b", "north")],
                &[vec![1.0, 0.0], vec![0.0, 1.0]],
            )
            .await
            .unwrap();
        let hits = store.query(&[0.1, 0.9], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "b");
    }

    #[tokio::test]
    async fn mismatched_batch_is_rejected() {
        let store = InMemoryBackend::new(BackendChoice::Embedded, "ns");
        let err = store.upsert(&[passage("a", "x")], &[]).await;
        assert!(err.is_err());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_empties_namespace() {
        let store = InMemoryBackend::new(BackendChoice::Chroma, "ns");
        store.upsert(&[passage("a", "x")], &[vec![1.0]]).await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
