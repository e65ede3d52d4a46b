//! Service wiring shared by the HTTP server and the CLI.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::backend::BackendSelector;
use crate::builder::BuildContext;
use crate::cache::IndexCache;
use crate::config::Config;
use crate::inference::{create_engine, InferenceEngine};
use crate::jobs::JobQueue;
use crate::repository::{Repository, SqliteRepository};

/// Every long-lived component, built once from a [`Config`].
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub repo: Arc<dyn Repository>,
    pub selector: Arc<BackendSelector>,
    pub engine: Arc<dyn InferenceEngine>,
    pub cache: Arc<IndexCache>,
    pub jobs: Arc<JobQueue>,
}

impl Services {
    /// Open the repository (running migrations), create the inference
    /// engine and backend selector, and start the job runner.
    pub async fn start(config: &Config) -> Result<Self> {
        let pool = crate::db::connect(config)
            .await
            .with_context(|| format!("failed to open database {}", config.db.path.display()))?;
        crate::migrate::run_migrations(&pool).await?;
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::new(pool));

        let engine = create_engine(&config.inference)?;
        let selector = Arc::new(BackendSelector::new(config.storage.clone(), engine.dims())?);
        Ok(Self::assemble(config, repo, selector, engine))
    }

    /// Wire already-built parts together and start the job runner.
    pub fn assemble(
        config: &Config,
        repo: Arc<dyn Repository>,
        selector: Arc<BackendSelector>,
        engine: Arc<dyn InferenceEngine>,
    ) -> Self {
        let cache = Arc::new(IndexCache::new(
            config.cache.dir.clone(),
            repo.clone(),
            selector.clone(),
            engine.clone(),
            config.retrieval.clone(),
        ));
        let ctx = BuildContext {
            repo: repo.clone(),
            selector: selector.clone(),
            engine: engine.clone(),
            cache: cache.clone(),
            chunking: config.chunking.clone(),
            batch_size: config.inference.batch_size,
        };
        let jobs = Arc::new(JobQueue::start(ctx, &config.jobs));

        Self {
            config: Arc::new(config.clone()),
            repo,
            selector,
            engine,
            cache,
            jobs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[tokio::test]
    async fn backends_are_sized_by_the_engine() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().display();
        let config = parse_config(&format!(
            r#"
[db]
path = "{root}/chatdocs.sqlite"

[server]
bind = "127.0.0.1:0"

[cache]
dir = "{root}/cache"

[inference]
provider = "ollama"
embed_model = "nomic-embed-text"
chat_model = "llama3"
dims = 768
"#
        ))
        .unwrap();

        let services = Services::start(&config).await.unwrap();
        assert_eq!(services.engine.dims(), 768);
        assert_eq!(services.selector.dims(), Some(768));
        services.jobs.shutdown().await;
    }
}
