//! Loaded vector indexes and the two query pipelines run against them.
//!
//! An [`IndexHandle`] binds a collection's manifest to its live vector
//! namespace and the inference engine. It is read-only and shared by every
//! query session on the same collection.
//!
//! - **Simple** ([`IndexHandle::query`]): retrieve `similarity_top_k`
//!   passages, answer with one completion over them.
//! - **Enhanced** ([`EnhancedPipeline`]): retrieve `top_k` passages, then
//!   tree-summarize: answer over groups of `summary_fanout` passages and
//!   fold the partial answers the same way until one remains.

use std::sync::Arc;

use anyhow::{bail, Result};

use chatdocs_core::answer::{markdown_request, Answer};
use chatdocs_core::manifest::IndexManifest;
use chatdocs_core::models::ScoredPassage;
use chatdocs_core::store::VectorBackend;

use crate::backend::StorageContext;
use crate::config::RetrievalConfig;
use crate::inference::{embed_one, InferenceEngine};

pub struct IndexHandle {
    pub collection_id: i64,
    pub manifest: IndexManifest,
    pub context: StorageContext,
    store: Arc<dyn VectorBackend>,
    engine: Arc<dyn InferenceEngine>,
    retrieval: RetrievalConfig,
}

impl std::fmt::Debug for IndexHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexHandle")
            .field("collection_id", &self.collection_id)
            .field("namespace", &self.context.namespace)
            .field("backend", &self.context.backend)
            .finish()
    }
}

impl IndexHandle {
    pub fn new(
        collection_id: i64,
        manifest: IndexManifest,
        context: StorageContext,
        store: Arc<dyn VectorBackend>,
        engine: Arc<dyn InferenceEngine>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            collection_id,
            manifest,
            context,
            store,
            engine,
            retrieval,
        }
    }

    pub fn retrieval(&self) -> &RetrievalConfig {
        &self.retrieval
    }

    /// The `top_k` passages nearest to `question`, best first.
    pub async fn retrieve(&self, question: &str, top_k: usize) -> Result<Vec<ScoredPassage>> {
        let vector = embed_one(self.engine.as_ref(), question).await?;
        if vector.len() != self.manifest.dims {
            bail!(
                "query embedding has {} dims but index was built with {}",
                vector.len(),
                self.manifest.dims
            );
        }
        self.store.query(&vector, top_k.max(1)).await
    }

    /// Simple mode: one retrieval and one completion.
    pub async fn query(&self, question: &str, model: Option<&str>) -> Result<Answer> {
        let request = markdown_request(question);
        let sources = self
            .retrieve(&request, self.retrieval.similarity_top_k)
            .await?;
        let text = self
            .engine
            .complete(model, &answer_prompt(&request, &passage_context(&sources)))
            .await?;
        Ok(Answer { text, sources })
    }

    pub fn enhanced(&self, top_k: usize, model: Option<&str>) -> EnhancedPipeline<'_> {
        EnhancedPipeline {
            index: self,
            top_k: top_k.max(1),
            fanout: self.retrieval.summary_fanout.max(2),
            model: model.map(str::to_string),
        }
    }
}

/// Retrieve-then-summarize pipeline over one [`IndexHandle`].
pub struct EnhancedPipeline<'a> {
    index: &'a IndexHandle,
    top_k: usize,
    fanout: usize,
    model: Option<String>,
}

impl EnhancedPipeline<'_> {
    pub async fn run(&self, question: &str) -> Result<Answer> {
        let request = markdown_request(question);
        let sources = self.index.retrieve(&request, self.top_k).await?;
        tracing::debug!(
            collection_id = self.index.collection_id,
            retrieved = sources.len(),
            top_k = self.top_k,
            "enhanced query retrieved passages"
        );

        let mut layer: Vec<String> = sources.iter().map(|s| s.text.clone()).collect();
        if layer.is_empty() {
            let text = self.complete(&answer_prompt(&request, "")).await?;
            return Ok(Answer { text, sources });
        }

        loop {
            let mut next = Vec::with_capacity(layer.len().div_ceil(self.fanout));
            for group in layer.chunks(self.fanout) {
                let prompt = summary_prompt(&request, group);
                next.push(self.complete(&prompt).await?);
            }
            if next.len() == 1 {
                let text = next.pop().unwrap_or_default();
                return Ok(Answer { text, sources });
            }
            layer = next;
        }
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        self.index
            .engine
            .complete(self.model.as_deref(), prompt)
            .await
    }
}

fn passage_context(sources: &[ScoredPassage]) -> String {
    sources
        .iter()
        .map(|s| format!("file_name: {}\n\n{}", s.file_name, s.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub(crate) fn answer_prompt(request: &str, context: &str) -> String {
    format!(
        "Context information is below.\n\
         ---------------------\n\
         {}\n\
         ---------------------\n\
         Given the context information and not prior knowledge, answer the query.\n\
         Query: {}\n\
         Answer: ",
        context, request
    )
}

pub(crate) fn summary_prompt(request: &str, chunks: &[String]) -> String {
    format!(
        "Context information from multiple sources is below.\n\
         ---------------------\n\
         {}\n\
         ---------------------\n\
         Given the information from multiple sources and not prior knowledge, answer the query.\n\
         Query: {}\n\
         Answer: ",
        chunks.join("\n\n"),
        request
    )
}
