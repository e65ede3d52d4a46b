//! Query sessions: one per WebSocket connection, bound to one collection.
//!
//! A session is a small state machine:
//!
//! ```text
//! Connecting ──load ok──▶ Ready(handle)
//!      │
//!      └──load failed──▶ Failed(reason)
//! ```
//!
//! The transport accepts every connection, calls [`QuerySession::open`],
//! and on failure closes with [`CLOSE_UNAVAILABLE`]. Messages are handled
//! one at a time; a `Failed` (or never-opened) session answers every
//! message with an error instead of querying.
//!
//! Inbound: `{"query": "...", "enhanced": true|false|"Y"|"N", "top_k": 20}`
//! Outbound: `{"response": "<markdown>"}` or `{"error": "..."}`

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::IndexCache;
use crate::error::{Error, Result};
use crate::index::IndexHandle;

/// Close code sent when the collection has no loadable index.
pub const CLOSE_UNAVAILABLE: u16 = 4000;

/// A close frame payload is at most 125 bytes, two of them the code.
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

pub const NO_INDEX_MESSAGE: &str = "No index loaded for this connection.";

/// The `enhanced` flag: a JSON bool or the legacy `"Y"` / `"N"` strings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EnhancedFlag {
    Bool(bool),
    Legacy(String),
}

impl Default for EnhancedFlag {
    fn default() -> Self {
        EnhancedFlag::Bool(false)
    }
}

impl EnhancedFlag {
    pub fn is_on(&self) -> bool {
        match self {
            EnhancedFlag::Bool(b) => *b,
            EnhancedFlag::Legacy(s) => s.trim().eq_ignore_ascii_case("y"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Inbound {
    pub query: String,
    #[serde(default)]
    pub enhanced: EnhancedFlag,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Outbound {
    Response { response: String },
    Error { error: String },
}

impl Outbound {
    pub fn error(message: impl Into<String>) -> Self {
        Outbound::Error {
            error: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self)
            .unwrap_or_else(|_| r#"{"error":"failed to encode response"}"#.to_string())
    }
}

#[derive(Debug)]
pub enum SessionState {
    Connecting,
    Ready(Arc<IndexHandle>),
    Failed(String),
}

pub struct QuerySession {
    collection_id: i64,
    model: Option<String>,
    state: SessionState,
}

impl QuerySession {
    /// `model` overrides the configured chat model for this session.
    pub fn new(collection_id: i64, model: Option<String>) -> Self {
        Self {
            collection_id,
            model: model.filter(|m| !m.trim().is_empty()),
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, SessionState::Ready(_))
    }

    /// Load the collection's index. On failure the session moves to
    /// `Failed` and the error is returned so the transport can close.
    pub async fn open(&mut self, cache: &IndexCache) -> Result<()> {
        match cache.load(self.collection_id).await {
            Ok(handle) => {
                tracing::info!(collection_id = self.collection_id, model = ?self.model, "query session ready");
                self.state = SessionState::Ready(Arc::new(handle));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(collection_id = self.collection_id, "query session unavailable: {}", e);
                self.state = SessionState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Answer one inbound text frame.
    pub async fn handle_text(&self, text: &str) -> Outbound {
        let handle = match &self.state {
            SessionState::Ready(handle) => handle,
            SessionState::Connecting | SessionState::Failed(_) => {
                return Outbound::error(NO_INDEX_MESSAGE)
            }
        };

        let inbound: Inbound = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => return Outbound::error(format!("invalid message: {}", e)),
        };
        if inbound.query.trim().is_empty() {
            return Outbound::error("query must not be empty");
        }

        let model = self.model.as_deref();
        let answer = if inbound.enhanced.is_on() {
            let top_k = inbound
                .top_k
                .unwrap_or(handle.retrieval().default_top_k);
            tracing::debug!(collection_id = self.collection_id, top_k, "enhanced query");
            handle.enhanced(top_k, model).run(&inbound.query).await
        } else {
            handle.query(&inbound.query, model).await
        };

        match answer {
            Ok(answer) => Outbound::Response {
                response: answer.to_markdown(),
            },
            Err(e) => {
                tracing::error!(collection_id = self.collection_id, "query failed: {:#}", e);
                Outbound::error(format!("query failed: {}", e))
            }
        }
    }
}

/// Close code and reason for a failed [`QuerySession::open`]. The reason
/// is cut on a character boundary to fit in a close frame.
pub fn close_reason(err: &Error) -> (u16, String) {
    let mut reason = err.to_string();
    if reason.len() > MAX_CLOSE_REASON_BYTES {
        let mut end = MAX_CLOSE_REASON_BYTES;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    (CLOSE_UNAVAILABLE, reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enhanced_flag_accepts_bool_and_legacy_strings() {
        let m: Inbound = serde_json::from_str(r#"{"query":"q","enhanced":"Y"}"#).unwrap();
        assert!(m.enhanced.is_on());
        let m: Inbound = serde_json::from_str(r#"{"query":"q","enhanced":"N"}"#).unwrap();
        assert!(!m.enhanced.is_on());
        let m: Inbound = serde_json::from_str(r#"{"query":"q","enhanced":true,"top_k":5}"#).unwrap();
        assert!(m.enhanced.is_on());
        assert_eq!(m.top_k, Some(5));
        let m: Inbound = serde_json::from_str(r#"{"query":"q"}"#).unwrap();
        assert!(!m.enhanced.is_on());
        assert_eq!(m.top_k, None);
    }

    #[test]
    fn outbound_shapes() {
        let ok = Outbound::Response {
            response: "## Response".into(),
        };
        let v: serde_json::Value = serde_json::from_str(&ok.to_json()).unwrap();
        assert_eq!(v["response"], "## Response");
        let err: serde_json::Value =
            serde_json::from_str(&Outbound::error(NO_INDEX_MESSAGE).to_json()).unwrap();
        assert_eq!(err["error"], NO_INDEX_MESSAGE);
    }

    #[tokio::test]
    async fn unopened_session_refuses_queries() {
        let session = QuerySession::new(1, Some(String::new()));
        assert!(!session.is_ready());
        assert_eq!(
            session.handle_text(r#"{"query":"hi"}"#).await,
            Outbound::error(NO_INDEX_MESSAGE)
        );
    }

    #[test]
    fn failed_open_closes_with_unavailable_code() {
        let (code, reason) = close_reason(&Error::NoModelForCollection(3));
        assert_eq!(code, 4000);
        assert!(reason.contains("3"));
    }

    #[test]
    fn long_close_reasons_fit_in_a_close_frame() {
        let detail = "connexion refusée par l'hôte distant; ".repeat(10);
        let err = Error::backend_unavailable("milvus", detail);
        let (code, reason) = close_reason(&err);
        assert_eq!(code, CLOSE_UNAVAILABLE);
        assert!(reason.len() <= MAX_CLOSE_REASON_BYTES);
        assert!(reason.len() > MAX_CLOSE_REASON_BYTES - 4);
        assert!(err.to_string().starts_with(&reason));
    }
}
