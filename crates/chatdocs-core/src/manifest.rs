//! Index artifact: the durable record of a successful build.
//!
//! The vector data itself lives in the collection's backend namespace.
//! The manifest only says where it is and how it was produced, so a
//! loader can bind to it and check it belongs to the collection it was
//! asked for.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{BackendChoice, Collection};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub collection_uuid: Uuid,
    pub backend: BackendChoice,
    pub namespace: String,
    pub embed_model: String,
    pub dims: usize,
    pub documents: usize,
    pub passages: usize,
    pub built_at: DateTime<Utc>,
}

impl IndexManifest {
    /// Artifact name under which a fresh manifest is stored.
    pub fn artifact_name() -> String {
        format!("model_{}.json", Uuid::new_v4())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("failed to serialize index manifest")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("index artifact is not a valid manifest")
    }

    /// Fail unless this manifest was built for `collection` on its backend.
    pub fn ensure_matches(&self, collection: &Collection) -> Result<()> {
        if self.collection_uuid != collection.uuid {
            bail!(
                "index artifact belongs to collection {}, not {}",
                self.collection_uuid,
                collection.uuid
            );
        }
        if self.backend != collection.backend {
            bail!(
                "index artifact was built on '{}' but collection uses '{}'",
                self.backend,
                collection.backend
            );
        }
        let expected = collection.backend.namespace(&collection.uuid);
        if self.namespace != expected {
            bail!(
                "index artifact namespace '{}' does not match '{}'",
                self.namespace,
                expected
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CollectionStatus;

    fn collection(backend: BackendChoice) -> Collection {
        let now = Utc::now();
        Collection {
            id: 4,
            uuid: Uuid::new_v4(),
            title: "t".into(),
            description: String::new(),
            backend,
            status: CollectionStatus::Complete,
            processing: false,
            model: Some("model_a.json".into()),
            created_at: now,
            modified_at: now,
        }
    }

    fn manifest_for(c: &Collection) -> IndexManifest {
        IndexManifest {
            collection_uuid: c.uuid,
            backend: c.backend,
            namespace: c.backend.namespace(&c.uuid),
            embed_model: "m".into(),
            dims: 8,
            documents: 2,
            passages: 5,
            built_at: Utc::now(),
        }
    }

    #[test]
    fn manifest_bytes_parse_back() {
        let c = collection(BackendChoice::Milvus);
        let m = manifest_for(&c);
        let parsed = IndexManifest::from_bytes(&m.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, m);
        parsed.ensure_matches(&c).unwrap();
    }

    #[test]
    fn mismatched_collection_is_rejected() {
        let c = collection(BackendChoice::Embedded);
        let other = collection(BackendChoice::Embedded);
        assert!(manifest_for(&other).ensure_matches(&c).is_err());

        let mut wrong_backend = manifest_for(&c);
        wrong_backend.backend = BackendChoice::Chroma;
        assert!(wrong_backend.ensure_matches(&c).is_err());
    }

    #[test]
    fn garbage_is_not_a_manifest() {
        assert!(IndexManifest::from_bytes(b"").is_err());
        assert!(IndexManifest::from_bytes(b"{\"x\":1}").is_err());
    }

    #[test]
    fn artifact_names_are_unique_json_files() {
        let a = IndexManifest::artifact_name();
        let b = IndexManifest::artifact_name();
        assert_ne!(a, b);
        assert!(a.starts_with("model_") && a.ends_with(".json"));
    }
}
