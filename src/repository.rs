//! Document repository: durable collection/document metadata, file bytes
//! and index artifacts.
//!
//! The [`Repository`] trait is the boundary the ingestion pipeline, the
//! index jobs and the index loader talk to. [`SqliteRepository`] is the
//! production implementation.
//!
//! Status changes go through [`Repository::transition_status`], a
//! compare-and-set on the current status, so a stale writer can never move
//! a collection backwards.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use chatdocs_core::models::{
    BackendChoice, Collection, CollectionStatus, Document, NewCollection, NewDocument,
};

#[async_trait]
pub trait Repository: Send + Sync {
    /// Record a new collection in `QUEUED` state with a fresh uuid.
    async fn create_collection(&self, new: &NewCollection) -> Result<Collection>;

    /// Record a new `QUEUED` collection together with its documents in one
    /// transaction. Nothing is stored if any insert fails.
    async fn create_collection_with_documents(
        &self,
        new: &NewCollection,
        docs: &[NewDocument],
    ) -> Result<(Collection, Vec<Document>)>;

    /// Remove a collection and its documents. `false` if it did not exist.
    async fn delete_collection(&self, id: i64) -> Result<bool>;

    async fn get_collection(&self, id: i64) -> Result<Option<Collection>>;

    async fn list_collections(&self) -> Result<Vec<Collection>>;

    /// File names of a collection's documents, in insertion order.
    async fn document_names(&self, collection_id: i64) -> Result<Vec<String>>;

    /// Persist all `docs` atomically: either every document is stored or none.
    async fn add_documents(&self, collection_id: i64, docs: &[NewDocument])
        -> Result<Vec<Document>>;

    async fn add_document(&self, collection_id: i64, doc: &NewDocument) -> Result<Document> {
        self.add_documents(collection_id, std::slice::from_ref(doc))
            .await?
            .pop()
            .ok_or_else(|| anyhow!("document '{}' was not stored", doc.file_name))
    }

    async fn list_documents(&self, collection_id: i64) -> Result<Vec<Document>>;

    async fn get_document(&self, id: i64) -> Result<Option<Document>>;

    /// Move `id` from `from` to `to`. Fails if the collection is not
    /// currently in `from` or the edge is not part of the state machine.
    /// `processing` is set exactly while the collection is `RUNNING`.
    async fn transition_status(
        &self,
        id: i64,
        from: CollectionStatus,
        to: CollectionStatus,
    ) -> Result<()>;

    /// `RUNNING → ERROR`, clearing `processing`.
    async fn fail(&self, id: i64) -> Result<()> {
        self.transition_status(id, CollectionStatus::Running, CollectionStatus::Error)
            .await
    }

    /// Store the artifact and move `RUNNING → COMPLETE` in one transaction.
    async fn complete_with_artifact(&self, id: i64, name: &str, content: &[u8]) -> Result<()>;

    /// Point a `COMPLETE` collection at a new artifact.
    async fn replace_artifact(&self, id: i64, name: &str, content: &[u8]) -> Result<()>;

    async fn read_artifact(&self, name: &str) -> Result<Option<Vec<u8>>>;
}

pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_documents(&self, ids: Vec<i64>) -> Result<Vec<Document>> {
        let mut stored = Vec::with_capacity(ids.len());
        for id in ids {
            let doc = self
                .get_document(id)
                .await?
                .ok_or_else(|| anyhow!("document {} vanished after insert", id))?;
            stored.push(doc);
        }
        Ok(stored)
    }
}

async fn insert_collection(conn: &mut SqliteConnection, new: &NewCollection) -> Result<i64> {
    let now = Utc::now().timestamp_millis();
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO collections (uuid, title, description, backend, status, processing, model, created_at, modified_at)
        VALUES (?, ?, ?, ?, ?, 0, NULL, ?, ?)
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&new.title)
    .bind(&new.description)
    .bind(new.backend.as_str())
    .bind(CollectionStatus::Queued.as_str())
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await?;
    Ok(id)
}

async fn insert_documents(
    conn: &mut SqliteConnection,
    collection_id: i64,
    docs: &[NewDocument],
) -> Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(docs.len());
    for doc in docs {
        let now = Utc::now().timestamp_millis();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO documents (collection_id, file_name, description, content, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(collection_id)
        .bind(&doc.file_name)
        .bind(&doc.description)
        .bind(&doc.content)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("failed to store document '{}'", doc.file_name))?;
        ids.push(id);
    }
    Ok(ids)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn collection_from_row(row: &SqliteRow) -> Result<Collection> {
    let uuid: String = row.get("uuid");
    let backend: String = row.get("backend");
    let status: String = row.get("status");
    let processing: i64 = row.get("processing");
    Ok(Collection {
        id: row.get("id"),
        uuid: Uuid::parse_str(&uuid).with_context(|| format!("bad collection uuid '{}'", uuid))?,
        title: row.get("title"),
        description: row.get("description"),
        backend: backend.parse::<BackendChoice>()?,
        status: status.parse::<CollectionStatus>()?,
        processing: processing != 0,
        model: row.get("model"),
        created_at: from_millis(row.get("created_at")),
        modified_at: from_millis(row.get("modified_at")),
    })
}

fn document_from_row(row: &SqliteRow) -> Document {
    Document {
        id: row.get("id"),
        collection_id: row.get("collection_id"),
        file_name: row.get("file_name"),
        description: row.get("description"),
        content: row.get("content"),
        created_at: from_millis(row.get("created_at")),
        modified_at: from_millis(row.get("modified_at")),
    }
}

const COLLECTION_COLUMNS: &str =
    "id, uuid, title, description, backend, status, processing, model, created_at, modified_at";

const DOCUMENT_COLUMNS: &str =
    "id, collection_id, file_name, description, content, created_at, modified_at";

#[async_trait]
impl Repository for SqliteRepository {
    async fn create_collection(&self, new: &NewCollection) -> Result<Collection> {
        let mut tx = self.pool.begin().await?;
        let id = insert_collection(&mut *tx, new).await?;
        tx.commit().await?;

        self.get_collection(id)
            .await?
            .ok_or_else(|| anyhow!("collection {} vanished after insert", id))
    }

    async fn create_collection_with_documents(
        &self,
        new: &NewCollection,
        docs: &[NewDocument],
    ) -> Result<(Collection, Vec<Document>)> {
        let mut tx = self.pool.begin().await?;
        let id = insert_collection(&mut *tx, new).await?;
        let doc_ids = insert_documents(&mut *tx, id, docs).await?;
        tx.commit().await?;

        let collection = self
            .get_collection(id)
            .await?
            .ok_or_else(|| anyhow!("collection {} vanished after insert", id))?;
        Ok((collection, self.fetch_documents(doc_ids).await?))
    }

    async fn delete_collection(&self, id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM documents WHERE collection_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM collections WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_collection(&self, id: i64) -> Result<Option<Collection>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM collections WHERE id = ?",
            COLLECTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(collection_from_row).transpose()
    }

    async fn list_collections(&self) -> Result<Vec<Collection>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM collections ORDER BY id ASC",
            COLLECTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(collection_from_row).collect()
    }

    async fn document_names(&self, collection_id: i64) -> Result<Vec<String>> {
        let names = sqlx::query_scalar(
            "SELECT file_name FROM documents WHERE collection_id = ? ORDER BY id ASC",
        )
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn add_documents(
        &self,
        collection_id: i64,
        docs: &[NewDocument],
    ) -> Result<Vec<Document>> {
        let mut tx = self.pool.begin().await?;
        let ids = insert_documents(&mut *tx, collection_id, docs).await?;
        tx.commit().await?;
        self.fetch_documents(ids).await
    }

    async fn list_documents(&self, collection_id: i64) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE collection_id = ? ORDER BY id ASC",
            DOCUMENT_COLUMNS
        ))
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(document_from_row).collect())
    }

    async fn get_document(&self, id: i64) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(document_from_row))
    }

    async fn transition_status(
        &self,
        id: i64,
        from: CollectionStatus,
        to: CollectionStatus,
    ) -> Result<()> {
        if !from.can_transition_to(to) {
            bail!("illegal status transition {} -> {}", from, to);
        }
        let result = sqlx::query(
            "UPDATE collections SET status = ?, processing = ?, modified_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(i64::from(to == CollectionStatus::Running))
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("collection {} is not {}; cannot move to {}", id, from, to);
        }
        Ok(())
    }

    async fn complete_with_artifact(&self, id: i64, name: &str, content: &[u8]) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO artifacts (name, content, created_at) VALUES (?, ?, ?)")
            .bind(name)
            .bind(content)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            "UPDATE collections SET status = ?, processing = 0, model = ?, modified_at = ? WHERE id = ? AND status = ?",
        )
        .bind(CollectionStatus::Complete.as_str())
        .bind(name)
        .bind(now)
        .bind(id)
        .bind(CollectionStatus::Running.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            bail!("collection {} is not RUNNING; cannot complete", id);
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace_artifact(&self, id: i64, name: &str, content: &[u8]) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO artifacts (name, content, created_at) VALUES (?, ?, ?)")
            .bind(name)
            .bind(content)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            "UPDATE collections SET model = ?, modified_at = ? WHERE id = ? AND status = ?",
        )
        .bind(name)
        .bind(now)
        .bind(id)
        .bind(CollectionStatus::Complete.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            bail!("collection {} is not COMPLETE; cannot replace its artifact", id);
        }
        tx.commit().await?;
        Ok(())
    }

    async fn read_artifact(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let content = sqlx::query_scalar("SELECT content FROM artifacts WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(content)
    }
}
