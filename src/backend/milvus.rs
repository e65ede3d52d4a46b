//! Milvus / Zilliz cloud backend over the v2 REST API.
//!
//! Each namespace is a Milvus collection with a `VarChar` primary key
//! holding the passage id and a cosine-indexed `vector` field; passage
//! metadata rides in dynamic fields.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use chatdocs_core::models::{BackendChoice, Passage, ScoredPassage};
use chatdocs_core::store::{check_batch, VectorBackend};

use super::post_json;

const ID_MAX_LENGTH: usize = 128;

pub struct MilvusBackend {
    client: reqwest::Client,
    base: String,
    token: Option<String>,
    namespace: String,
}

impl MilvusBackend {
    pub async fn open(
        client: reqwest::Client,
        uri: &str,
        token: Option<String>,
        namespace: String,
        dims: usize,
    ) -> Result<Self> {
        let backend = Self {
            client,
            base: format!("{}/v2/vectordb", uri.trim_end_matches('/')),
            token,
            namespace,
        };
        backend.ensure_collection(dims).await?;
        Ok(backend)
    }

    async fn call(&self, path: &str, body: Value) -> Result<Value> {
        let resp = post_json(
            &self.client,
            &format!("{}/{}", self.base, path),
            self.token.as_deref(),
            &body,
        )
        .await?;
        check_code(&resp)?;
        Ok(resp)
    }

    async fn has_collection(&self) -> Result<bool> {
        let resp = self
            .call(
                "collections/has",
                json!({ "collectionName": self.namespace }),
            )
            .await?;
        Ok(resp
            .pointer("/data/has")
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    async fn ensure_collection(&self, dims: usize) -> Result<()> {
        if self.has_collection().await? {
            return Ok(());
        }
        let create = json!({
            "collectionName": self.namespace,
            "schema": {
                "autoId": false,
                "enableDynamicField": true,
                "fields": [
                    {
                        "fieldName": "id",
                        "dataType": "VarChar",
                        "isPrimary": true,
                        "elementTypeParams": { "max_length": ID_MAX_LENGTH.to_string() }
                    },
                    {
                        "fieldName": "vector",
                        "dataType": "FloatVector",
                        "elementTypeParams": { "dim": dims.to_string() }
                    }
                ]
            },
            "indexParams": [
                { "fieldName": "vector", "indexName": "vector", "metricType": "COSINE" }
            ]
        });
        // A concurrent creator may win the race; only fail if it still
        // does not exist.
        match self.call("collections/create", create).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if self.has_collection().await? {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}

/// Milvus reports failures as HTTP 200 with a non-zero `code`.
fn check_code(resp: &Value) -> Result<()> {
    match resp.get("code").and_then(|c| c.as_i64()) {
        Some(0) | None => Ok(()),
        Some(code) => bail!(
            "Milvus error {}: {}",
            code,
            resp.get("message").and_then(|m| m.as_str()).unwrap_or("")
        ),
    }
}

fn parse_search(resp: &Value) -> Result<Vec<ScoredPassage>> {
    let data = resp
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Milvus search response missing data"))?;
    Ok(data
        .iter()
        .map(|hit| ScoredPassage {
            id: hit
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            document_id: hit.get("document_id").and_then(|v| v.as_i64()).unwrap_or(0),
            file_name: hit
                .get("file_name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            text: hit
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            score: hit.get("distance").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32,
        })
        .collect())
}

#[async_trait]
impl VectorBackend for MilvusBackend {
    fn kind(&self) -> BackendChoice {
        BackendChoice::Milvus
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn upsert(&self, passages: &[Passage], vectors: &[Vec<f32>]) -> Result<()> {
        check_batch(passages, vectors)?;
        if passages.is_empty() {
            return Ok(());
        }
        let data: Vec<Value> = passages
            .iter()
            .zip(vectors)
            .map(|(p, v)| {
                json!({
                    "id": p.id,
                    "vector": v,
                    "document_id": p.document_id,
                    "file_name": p.file_name,
                    "chunk_index": p.chunk_index,
                    "text": p.text,
                    "hash": p.hash,
                })
            })
            .collect();
        self.call(
            "entities/upsert",
            json!({ "collectionName": self.namespace, "data": data }),
        )
        .await?;
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<ScoredPassage>> {
        let resp = self
            .call(
                "entities/search",
                json!({
                    "collectionName": self.namespace,
                    "data": [vector],
                    "annsField": "vector",
                    "limit": top_k,
                    "outputFields": ["id", "document_id", "file_name", "text"],
                }),
            )
            .await?;
        parse_search(&resp)
    }

    async fn count(&self) -> Result<usize> {
        let resp = self
            .call(
                "collections/get_stats",
                json!({ "collectionName": self.namespace }),
            )
            .await?;
        resp.pointer("/data/rowCount")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .ok_or_else(|| anyhow!("Milvus stats response missing rowCount"))
    }

    async fn clear(&self) -> Result<()> {
        self.call(
            "entities/delete",
            json!({ "collectionName": self.namespace, "filter": "id != \"\"" }),
        )
        .await?;
        Ok(())
    }
}
