//! Backend selector: maps a collection's backend choice and uuid to a live
//! [`VectorBackend`] handle plus the [`StorageContext`] it was opened with.
//!
//! | Choice | Engine | Namespace |
//! |--------|--------|-----------|
//! | `chromadb` | [`chroma::ChromaBackend`] (HTTP v1 API) | uuid hex |
//! | `duckdb` | [`embedded::EmbeddedBackend`] (one file per namespace) | uuid hex |
//! | `milvus` | [`milvus::MilvusBackend`] (REST v2, bearer token) | `c_` + uuid hex |
//!
//! Resolution opens (or creates) the backend-side namespace, so a
//! reachable-but-misconfigured backend fails here with
//! [`Error::BackendUnavailable`] rather than halfway through a build.
//! Opened handles are kept and shared by every later resolution of the
//! same namespace. Past `[storage] max_open_handles`, handles nobody else
//! holds are dropped and reopened on next use.

pub mod chroma;
pub mod embedded;
pub mod milvus;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use serde_json::Value;
use uuid::Uuid;

use chatdocs_core::models::BackendChoice;
use chatdocs_core::store::memory::InMemoryBackend;
use chatdocs_core::store::VectorBackend;

use crate::config::StorageConfig;
use crate::error::{Error, Result};

/// Where a collection's vectors live and how builds may write to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageContext {
    pub backend: BackendChoice,
    pub namespace: String,
    /// Clear the namespace before a full build.
    pub overwrite: bool,
}

#[derive(Clone)]
pub struct ResolvedBackend {
    pub context: StorageContext,
    pub store: Arc<dyn VectorBackend>,
}

enum Mode {
    Configured {
        storage: StorageConfig,
        dims: usize,
        http: reqwest::Client,
    },
    /// Every choice resolves to a process-local store. Used by tests and
    /// dry runs.
    InMemory,
}

pub struct BackendSelector {
    mode: Mode,
    handles: Mutex<HashMap<(BackendChoice, String), Arc<dyn VectorBackend>>>,
    opened: AtomicUsize,
}

impl BackendSelector {
    pub fn new(storage: StorageConfig, dims: usize) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_mode(Mode::Configured {
            storage,
            dims,
            http,
        }))
    }

    pub fn in_memory() -> Self {
        Self::with_mode(Mode::InMemory)
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            handles: Mutex::new(HashMap::new()),
            opened: AtomicUsize::new(0),
        }
    }

    /// Deterministic storage context for `choice` and `key`. Makes no
    /// backend calls.
    pub fn context(&self, choice: BackendChoice, key: &Uuid) -> StorageContext {
        let overwrite = match &self.mode {
            Mode::InMemory => false,
            Mode::Configured { storage, .. } => match choice {
                BackendChoice::Chroma => storage.chroma.as_ref().is_some_and(|c| c.overwrite),
                BackendChoice::Embedded => storage.embedded.as_ref().is_some_and(|c| c.overwrite),
                BackendChoice::Milvus => storage.milvus.as_ref().is_some_and(|c| c.overwrite),
            },
        };
        StorageContext {
            backend: choice,
            namespace: choice.namespace(key),
            overwrite,
        }
    }

    /// Validate a stored backend identifier, then resolve it.
    pub async fn resolve_str(&self, choice: &str, key: &Uuid) -> Result<ResolvedBackend> {
        let choice: BackendChoice = choice.parse()?;
        self.resolve(choice, key).await
    }

    pub async fn resolve(&self, choice: BackendChoice, key: &Uuid) -> Result<ResolvedBackend> {
        let context = self.context(choice, key);
        let cache_key = (choice, context.namespace.clone());

        if let Some(store) = self.cached(&cache_key) {
            return Ok(ResolvedBackend { context, store });
        }

        let store = self
            .open(&context)
            .await
            .map_err(|e| Error::backend_unavailable(choice, format!("{:#}", e)))?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(backend = %choice, namespace = %context.namespace, "opened vector namespace");

        let store = {
            let mut handles = self
                .handles
                .lock()
                .map_err(|_| Error::backend_unavailable(choice, "handle cache poisoned"))?;
            let store = handles.entry(cache_key).or_insert(store).clone();
            if let Some(limit) = self.handle_limit() {
                if handles.len() > limit {
                    let before = handles.len();
                    handles.retain(|_, h| Arc::strong_count(h) > 1);
                    tracing::debug!(dropped = before - handles.len(), "dropped idle backend handles");
                }
            }
            store
        };
        Ok(ResolvedBackend { context, store })
    }

    /// Process-local stores hold their only copy of the data, so they are
    /// never dropped.
    fn handle_limit(&self) -> Option<usize> {
        match &self.mode {
            Mode::Configured { storage, .. } => Some(storage.max_open_handles.max(1)),
            Mode::InMemory => None,
        }
    }

    /// Number of namespace handles currently kept open.
    pub fn open_handles(&self) -> usize {
        self.handles.lock().map(|h| h.len()).unwrap_or(0)
    }

    /// Vector width new remote namespaces are created with. `None` for
    /// process-local stores.
    pub fn dims(&self) -> Option<usize> {
        match &self.mode {
            Mode::Configured { dims, .. } => Some(*dims),
            Mode::InMemory => None,
        }
    }

    /// Number of namespaces actually opened against a backend.
    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn cached(&self, key: &(BackendChoice, String)) -> Option<Arc<dyn VectorBackend>> {
        self.handles.lock().ok()?.get(key).cloned()
    }

    async fn open(&self, context: &StorageContext) -> anyhow::Result<Arc<dyn VectorBackend>> {
        let (storage, dims, http) = match &self.mode {
            Mode::InMemory => {
                return Ok(Arc::new(InMemoryBackend::new(
                    context.backend,
                    context.namespace.clone(),
                )))
            }
            Mode::Configured {
                storage,
                dims,
                http,
            } => (storage, *dims, http),
        };

        let ns = context.namespace.clone();
        let store: Arc<dyn VectorBackend> = match context.backend {
            BackendChoice::Chroma => {
                let cfg = storage
                    .chroma
                    .as_ref()
                    .ok_or_else(|| anyhow!("[storage.chroma] is not configured"))?;
                Arc::new(chroma::ChromaBackend::open(http.clone(), &cfg.url, ns).await?)
            }
            BackendChoice::Embedded => {
                let cfg = storage
                    .embedded
                    .as_ref()
                    .ok_or_else(|| anyhow!("[storage.embedded] is not configured"))?;
                Arc::new(embedded::EmbeddedBackend::open(&cfg.persist_dir, ns).await?)
            }
            BackendChoice::Milvus => {
                let cfg = storage
                    .milvus
                    .as_ref()
                    .ok_or_else(|| anyhow!("[storage.milvus] is not configured"))?;
                Arc::new(
                    milvus::MilvusBackend::open(
                        http.clone(),
                        &cfg.uri,
                        cfg.token.clone(),
                        ns,
                        dims,
                    )
                    .await?,
                )
            }
        };
        Ok(store)
    }
}

/// POST a JSON body and return the JSON response, failing on non-2xx.
pub(crate) async fn post_json(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &Value,
) -> anyhow::Result<Value> {
    let mut req = client.post(url).json(body);
    if let Some(token) = bearer {
        req = req.header("Authorization", format!("Bearer {}", token));
    }
    let response = req.send().await?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        bail!("{} returned {}: {}", url, status, text);
    }
    Ok(response.json().await?)
}
