//! Chroma HTTP backend (v1 REST API).
//!
//! The namespace is the Chroma collection name; the server-assigned
//! collection id is looked up once at open time with `get_or_create`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use chatdocs_core::models::{BackendChoice, Passage, ScoredPassage};
use chatdocs_core::store::{check_batch, VectorBackend};

use super::post_json;

pub struct ChromaBackend {
    client: reqwest::Client,
    base: String,
    namespace: String,
    collection_id: String,
}

impl ChromaBackend {
    pub async fn open(client: reqwest::Client, url: &str, namespace: String) -> Result<Self> {
        let base = format!("{}/api/v1", url.trim_end_matches('/'));
        let body = json!({
            "name": namespace,
            "get_or_create": true,
            "metadata": { "hnsw:space": "cosine" },
        });
        let resp = post_json(&client, &format!("{}/collections", base), None, &body).await?;
        let collection_id = resp
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Chroma did not return a collection id"))?
            .to_string();

        Ok(Self {
            client,
            base,
            namespace,
            collection_id,
        })
    }

    fn url(&self, op: &str) -> String {
        format!("{}/collections/{}/{}", self.base, self.collection_id, op)
    }
}

fn column<'a>(resp: &'a Value, name: &str) -> Result<&'a Vec<Value>> {
    resp.get(name)
        .and_then(|v| v.get(0))
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("Chroma query response missing '{}'", name))
}

/// Flatten the first (and only) query's columns into scored passages.
/// Chroma reports cosine distance; the score is `1 - distance`.
fn parse_query(resp: &Value) -> Result<Vec<ScoredPassage>> {
    let ids = column(resp, "ids")?;
    let documents = column(resp, "documents")?;
    let metadatas = column(resp, "metadatas")?;
    let distances = column(resp, "distances")?;

    let mut hits = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        let meta = metadatas.get(i).cloned().unwrap_or(Value::Null);
        hits.push(ScoredPassage {
            id: id.as_str().unwrap_or_default().to_string(),
            document_id: meta.get("document_id").and_then(|v| v.as_i64()).unwrap_or(0),
            file_name: meta
                .get("file_name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            text: documents
                .get(i)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            score: 1.0 - distances.get(i).and_then(|v| v.as_f64()).unwrap_or(1.0) as f32,
        });
    }
    Ok(hits)
}

#[async_trait]
impl VectorBackend for ChromaBackend {
    fn kind(&self) -> BackendChoice {
        BackendChoice::Chroma
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn upsert(&self, passages: &[Passage], vectors: &[Vec<f32>]) -> Result<()> {
        check_batch(passages, vectors)?;
        if passages.is_empty() {
            return Ok(());
        }
        let ids: Vec<&str> = passages.iter().map(|p| p.id.as_str()).collect();
        let documents: Vec<&str> = passages.iter().map(|p| p.text.as_str()).collect();
        let metadatas: Vec<Value> = passages
            .iter()
            .map(|p| {
                json!({
                    "document_id": p.document_id,
                    "file_name": p.file_name,
                    "chunk_index": p.chunk_index,
                    "hash": p.hash,
                })
            })
            .collect();
        let body = json!({
            "ids": ids,
            "embeddings": vectors,
            "documents": documents,
            "metadatas": metadatas,
        });
        post_json(&self.client, &self.url("upsert"), None, &body).await?;
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<ScoredPassage>> {
        let body = json!({
            "query_embeddings": [vector],
            "n_results": top_k,
            "include": ["documents", "metadatas", "distances"],
        });
        let resp = post_json(&self.client, &self.url("query"), None, &body).await?;
        parse_query(&resp)
    }

    async fn count(&self) -> Result<usize> {
        let resp = self.client.get(self.url("count")).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("Chroma count returned {}", status));
        }
        let n: Value = resp.json().await?;
        n.as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| anyhow!("Chroma count returned a non-number"))
    }

    async fn clear(&self) -> Result<()> {
        let resp = post_json(
            &self.client,
            &self.url("get"),
            None,
            &json!({ "include": [] }),
        )
        .await?;
        let ids = resp
            .get("ids")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        if ids.is_empty() {
            return Ok(());
        }
        post_json(&self.client, &self.url("delete"), None, &json!({ "ids": ids })).await?;
        Ok(())
    }
}
