//! Data models shared by every layer of chatdocs.
//!
//! A [`Collection`] is one uploaded document set plus the state of its
//! derived vector index. [`Document`]s belong to exactly one collection.
//! [`Passage`]s are the chunked text units written into a vector backend.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Build status of a collection's index.
///
/// The only legal transitions are `QUEUED → RUNNING` and
/// `RUNNING → COMPLETE | ERROR`. Nothing ever moves back to `QUEUED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CollectionStatus {
    Queued,
    Running,
    Complete,
    Error,
}

impl CollectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionStatus::Queued => "QUEUED",
            CollectionStatus::Running => "RUNNING",
            CollectionStatus::Complete => "COMPLETE",
            CollectionStatus::Error => "ERROR",
        }
    }

    /// Whether `self → next` is an edge of the status state machine.
    pub fn can_transition_to(self, next: CollectionStatus) -> bool {
        matches!(
            (self, next),
            (CollectionStatus::Queued, CollectionStatus::Running)
                | (CollectionStatus::Running, CollectionStatus::Complete)
                | (CollectionStatus::Running, CollectionStatus::Error)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CollectionStatus::Complete | CollectionStatus::Error)
    }
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown collection status: '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for CollectionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(CollectionStatus::Queued),
            "RUNNING" => Ok(CollectionStatus::Running),
            "COMPLETE" => Ok(CollectionStatus::Complete),
            "ERROR" => Ok(CollectionStatus::Error),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Returned when a backend identifier is not one of [`BackendChoice::ALL`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported backend: '{0}' (expected one of: chromadb, duckdb, milvus)")]
pub struct UnsupportedBackend(pub String);

/// The vector-storage engine that materializes a collection's index.
///
/// Serialized with the identifiers operators type in upload forms:
/// `chromadb`, `duckdb` and `milvus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendChoice {
    /// Chroma-style HTTP vector server.
    #[serde(rename = "chromadb")]
    Chroma,
    /// Embedded columnar store: one local file per namespace.
    #[serde(rename = "duckdb")]
    Embedded,
    /// Hosted Milvus / Zilliz cloud vector service.
    #[serde(rename = "milvus")]
    Milvus,
}

impl BackendChoice {
    pub const ALL: [BackendChoice; 3] = [
        BackendChoice::Chroma,
        BackendChoice::Embedded,
        BackendChoice::Milvus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendChoice::Chroma => "chromadb",
            BackendChoice::Embedded => "duckdb",
            BackendChoice::Milvus => "milvus",
        }
    }

    /// Backend-side namespace for a collection.
    ///
    /// Derived only from the collection uuid, never from its title, so two
    /// collections can never share a namespace. Milvus collection names
    /// must start with a letter or underscore, hence the `c_` prefix.
    pub fn namespace(&self, key: &Uuid) -> String {
        let hex = key.simple().to_string();
        match self {
            BackendChoice::Milvus => format!("c_{}", hex),
            BackendChoice::Chroma | BackendChoice::Embedded => hex,
        }
    }
}

impl fmt::Display for BackendChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendChoice {
    type Err = UnsupportedBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendChoice::ALL
            .into_iter()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| UnsupportedBackend(s.to_string()))
    }
}

/// A document set and the state of its derived index.
#[derive(Debug, Clone)]
pub struct Collection {
    pub id: i64,
    pub uuid: Uuid,
    pub title: String,
    pub description: String,
    pub backend: BackendChoice,
    pub status: CollectionStatus,
    pub processing: bool,
    /// Name of the index artifact; set only once the build is COMPLETE.
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Collection {
    pub fn has_model(&self) -> bool {
        self.model.as_deref().is_some_and(|m| !m.is_empty())
    }
}

/// Fields supplied when a collection is first recorded.
#[derive(Debug, Clone)]
pub struct NewCollection {
    pub title: String,
    pub description: String,
    pub backend: BackendChoice,
}

/// One ingested file. Immutable once persisted.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: i64,
    pub collection_id: i64,
    pub file_name: String,
    pub description: Option<String>,
    pub content: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// A named payload about to be persisted as a [`Document`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDocument {
    pub file_name: String,
    pub description: Option<String>,
    pub content: Vec<u8>,
}

/// External view of a collection, as returned by the request API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionView {
    pub id: i64,
    pub uuid: Uuid,
    pub title: String,
    pub db_storage: String,
    pub description: String,
    pub status: CollectionStatus,
    pub created: String,
    pub modified: String,
    pub processing: bool,
    pub has_model: bool,
    pub document_names: Vec<String>,
}

impl CollectionView {
    pub fn new(collection: &Collection, document_names: Vec<String>) -> Self {
        Self {
            id: collection.id,
            uuid: collection.uuid,
            title: collection.title.clone(),
            db_storage: collection.backend.as_str().to_string(),
            description: collection.description.clone(),
            status: collection.status,
            created: collection.created_at.to_rfc3339(),
            modified: collection.modified_at.to_rfc3339(),
            processing: collection.processing,
            has_model: collection.has_model(),
            document_names,
        }
    }
}

/// A chunk of document text as written to a vector backend.
///
/// Passage ids are deterministic (`{document_id}:{chunk_index}`) so a
/// rebuild upserts over the same rows instead of duplicating them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    pub id: String,
    pub document_id: i64,
    pub file_name: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// A passage returned by a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPassage {
    pub id: String,
    pub document_id: i64,
    pub file_name: String,
    pub text: String,
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_state_machine() {
        use CollectionStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Complete));
        assert!(Running.can_transition_to(Error));

        assert!(!Running.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Complete));
        assert!(!Complete.can_transition_to(Error));
        assert!(!Error.can_transition_to(Running));
    }

    #[test]
    fn status_string_roundtrip_matches_wire_names() {
        for s in ["QUEUED", "RUNNING", "COMPLETE", "ERROR"] {
            let status: CollectionStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
            assert_eq!(serde_json::to_string(&status).unwrap(), format!("\"{}\"", s));
        }
        assert!("queued".parse::<CollectionStatus>().is_err());
    }

    #[test]
    fn backend_choice_parses_stored_identifiers() {
        assert_eq!("chromadb".parse::<BackendChoice>().unwrap(), BackendChoice::Chroma);
        assert_eq!("duckdb".parse::<BackendChoice>().unwrap(), BackendChoice::Embedded);
        assert_eq!("milvus".parse::<BackendChoice>().unwrap(), BackendChoice::Milvus);

        let err = "pinecone".parse::<BackendChoice>().unwrap_err();
        assert_eq!(err, UnsupportedBackend("pinecone".to_string()));
    }

    #[test]
    fn namespace_is_deterministic_and_milvus_safe() {
        let key = Uuid::parse_str("0b4c2a7e-1d2f-4e5a-9b6c-7d8e9f0a1b2c").unwrap();
        for backend in BackendChoice::ALL {
            assert_eq!(backend.namespace(&key), backend.namespace(&key));
        }
        assert_eq!(
            BackendChoice::Embedded.namespace(&key),
            "0b4c2a7e1d2f4e5a9b6c7d8e9f0a1b2c"
        );
        let milvus = BackendChoice::Milvus.namespace(&key);
        assert!(milvus.starts_with("c_"));
        assert!(!milvus.chars().next().unwrap().is_ascii_digit());
    }

    #[test]
    fn has_model_ignores_empty_reference() {
        let now = Utc::now();
        let mut c = Collection {
            id: 1,
            uuid: Uuid::new_v4(),
            title: "t".into(),
            description: "d".into(),
            backend: BackendChoice::Embedded,
            status: CollectionStatus::Queued,
            processing: false,
            model: None,
            created_at: now,
            modified_at: now,
        };
        assert!(!c.has_model());
        c.model = Some(String::new());
        assert!(!c.has_model());
        c.model = Some("model_x.json".into());
        assert!(c.has_model());
    }
}
