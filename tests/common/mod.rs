//! Shared fixtures: a deterministic inference engine, an observing
//! repository wrapper, and a fully wired service stack in a temp dir.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use chatdocs::app::Services;
use chatdocs::backend::BackendSelector;
use chatdocs::builder::BuildContext;
use chatdocs::config::{parse_config, Config};
use chatdocs::inference::InferenceEngine;
use chatdocs::repository::{Repository, SqliteRepository};
use chatdocs_core::models::{Collection, CollectionStatus, Document, NewCollection, NewDocument};

pub const DIMS: usize = 64;

/// Bag-of-words embeddings hashed into `dims` buckets, so texts sharing
/// words land close together. Completions echo the prompt length.
pub struct HashEngine {
    pub completions: AtomicUsize,
    pub dims: usize,
}

impl Default for HashEngine {
    fn default() -> Self {
        Self::with_dims(DIMS)
    }
}

impl HashEngine {
    pub fn with_dims(dims: usize) -> Self {
        Self {
            completions: AtomicUsize::new(0),
            dims,
        }
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

pub fn hash_vector(text: &str, dims: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dims];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in word.to_lowercase().bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        v[(h % dims as u64) as usize] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    } else {
        v[0] = 1.0;
    }
    v
}

#[async_trait]
impl InferenceEngine for HashEngine {
    fn embed_model(&self) -> &str {
        "hash-test"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_vector(t, self.dims)).collect())
    }

    async fn complete(&self, _model: Option<&str>, prompt: &str) -> Result<String> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        Ok(format!("answer over {} prompt chars", prompt.len()))
    }
}

/// Repository wrapper recording status transitions and artifact reads.
pub struct ObservedRepo {
    inner: SqliteRepository,
    pub transitions: Mutex<Vec<(i64, CollectionStatus, CollectionStatus)>>,
    pub artifact_reads: AtomicUsize,
}

impl ObservedRepo {
    pub fn transitions_for(&self, id: i64) -> Vec<(CollectionStatus, CollectionStatus)> {
        self.transitions
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _, _)| *c == id)
            .map(|(_, from, to)| (*from, *to))
            .collect()
    }

    pub fn artifact_reads(&self) -> usize {
        self.artifact_reads.load(Ordering::SeqCst)
    }

    pub fn pool(&self) -> &sqlx::SqlitePool {
        self.inner.pool()
    }
}

#[async_trait]
impl Repository for ObservedRepo {
    async fn create_collection(&self, new: &NewCollection) -> Result<Collection> {
        self.inner.create_collection(new).await
    }

    async fn create_collection_with_documents(
        &self,
        new: &NewCollection,
        docs: &[NewDocument],
    ) -> Result<(Collection, Vec<Document>)> {
        self.inner.create_collection_with_documents(new, docs).await
    }

    async fn delete_collection(&self, id: i64) -> Result<bool> {
        self.inner.delete_collection(id).await
    }

    async fn get_collection(&self, id: i64) -> Result<Option<Collection>> {
        self.inner.get_collection(id).await
    }

    async fn list_collections(&self) -> Result<Vec<Collection>> {
        self.inner.list_collections().await
    }

    async fn document_names(&self, collection_id: i64) -> Result<Vec<String>> {
        self.inner.document_names(collection_id).await
    }

    async fn add_documents(
        &self,
        collection_id: i64,
        docs: &[NewDocument],
    ) -> Result<Vec<Document>> {
        self.inner.add_documents(collection_id, docs).await
    }

    async fn list_documents(&self, collection_id: i64) -> Result<Vec<Document>> {
        self.inner.list_documents(collection_id).await
    }

    async fn get_document(&self, id: i64) -> Result<Option<Document>> {
        self.inner.get_document(id).await
    }

    async fn transition_status(
        &self,
        id: i64,
        from: CollectionStatus,
        to: CollectionStatus,
    ) -> Result<()> {
        self.inner.transition_status(id, from, to).await?;
        self.transitions.lock().unwrap().push((id, from, to));
        Ok(())
    }

    async fn complete_with_artifact(&self, id: i64, name: &str, content: &[u8]) -> Result<()> {
        self.inner.complete_with_artifact(id, name, content).await?;
        self.transitions.lock().unwrap().push((
            id,
            CollectionStatus::Running,
            CollectionStatus::Complete,
        ));
        Ok(())
    }

    async fn replace_artifact(&self, id: i64, name: &str, content: &[u8]) -> Result<()> {
        self.inner.replace_artifact(id, name, content).await
    }

    async fn read_artifact(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.artifact_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_artifact(name).await
    }
}

/// A wired service stack rooted in a temp dir. The embedded backend works;
/// the Milvus backend points at a closed port.
pub struct Harness {
    pub dir: TempDir,
    pub config: Config,
    pub services: Services,
    pub repo: Arc<ObservedRepo>,
    pub engine: Arc<HashEngine>,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().display();
        let config = parse_config(&format!(
            r#"
[db]
path = "{root}/chatdocs.sqlite"

[server]
bind = "127.0.0.1:0"

[cache]
dir = "{root}/cache"

[retrieval]
similarity_top_k = 3
default_top_k = 6
summary_fanout = 2

[storage.embedded]
persist_dir = "{root}/persist"

[storage.milvus]
uri = "http://127.0.0.1:1"
"#
        ))
        .unwrap();

        let pool = chatdocs::db::connect(&config).await.unwrap();
        chatdocs::migrate::run_migrations(&pool).await.unwrap();
        let repo = Arc::new(ObservedRepo {
            inner: SqliteRepository::new(pool),
            transitions: Mutex::new(Vec::new()),
            artifact_reads: AtomicUsize::new(0),
        });
        let engine = Arc::new(HashEngine::default());
        let selector = Arc::new(BackendSelector::new(config.storage.clone(), DIMS).unwrap());

        let services = Services::assemble(&config, repo.clone(), selector, engine.clone());
        Self {
            dir,
            config,
            services,
            repo,
            engine,
        }
    }

    /// A build context over the same components the job runner uses.
    pub fn build_context(&self) -> BuildContext {
        BuildContext {
            repo: self.services.repo.clone(),
            selector: self.services.selector.clone(),
            engine: self.services.engine.clone(),
            cache: self.services.cache.clone(),
            chunking: self.config.chunking.clone(),
            batch_size: self.config.inference.batch_size,
        }
    }

    pub async fn collection(&self, id: i64) -> Collection {
        self.services
            .repo
            .get_collection(id)
            .await
            .unwrap()
            .expect("collection exists")
    }
}
