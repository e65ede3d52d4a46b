//! Embedded vector store: one SQLite file per namespace under
//! `[storage.embedded] persist_dir`.
//!
//! Vectors are stored as little-endian `f32` blobs next to the passage
//! text; queries scan the namespace and rank by cosine similarity.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use chatdocs_core::models::{BackendChoice, Passage, ScoredPassage};
use chatdocs_core::store::{check_batch, VectorBackend};
use chatdocs_core::vector::{cosine_similarity, decode_vector, encode_vector, rank_top_k};

pub struct EmbeddedBackend {
    namespace: String,
    pool: SqlitePool,
}

impl EmbeddedBackend {
    pub async fn open(persist_dir: &Path, namespace: String) -> Result<Self> {
        let path = persist_dir.join(format!("{}.sqlite", namespace));
        let pool = crate::db::connect_path(&path).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS passages (
                id TEXT PRIMARY KEY,
                document_id INTEGER NOT NULL,
                file_name TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                hash TEXT NOT NULL,
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { namespace, pool })
    }
}

#[async_trait]
impl VectorBackend for EmbeddedBackend {
    fn kind(&self) -> BackendChoice {
        BackendChoice::Embedded
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn upsert(&self, passages: &[Passage], vectors: &[Vec<f32>]) -> Result<()> {
        check_batch(passages, vectors)?;
        let mut tx = self.pool.begin().await?;
        for (p, v) in passages.iter().zip(vectors) {
            sqlx::query(
                r#"
                INSERT INTO passages (id, document_id, file_name, chunk_index, text, hash, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    document_id = excluded.document_id,
                    file_name = excluded.file_name,
                    chunk_index = excluded.chunk_index,
                    text = excluded.text,
                    hash = excluded.hash,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&p.id)
            .bind(p.document_id)
            .bind(&p.file_name)
            .bind(p.chunk_index)
            .bind(&p.text)
            .bind(&p.hash)
            .bind(encode_vector(v))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<ScoredPassage>> {
        let rows = sqlx::query("SELECT id, document_id, file_name, text, embedding FROM passages")
            .fetch_all(&self.pool)
            .await?;

        let hits = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                ScoredPassage {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    file_name: row.get("file_name"),
                    text: row.get("text"),
                    score: cosine_similarity(vector, &decode_vector(&blob)),
                }
            })
            .collect();
        Ok(rank_top_k(hits, top_k))
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM passages")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM passages")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
