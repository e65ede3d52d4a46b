//! Ingestion pipeline: uploads → documents → queued build.
//!
//! [`ingest`] validates the backend choice and normalizes every payload
//! *before* anything is written, so a rejected upload leaves no
//! collection behind. A single ZIP payload (detected by its `PK\x03\x04`
//! signature) is expanded into a private temp dir; macOS resource-fork
//! entries are dropped and every other entry's bytes are kept exactly,
//! whether or not they decode as text. The collection and its documents
//! are committed in one transaction, and the build job is enqueued only
//! after that commit; if the queue refuses the job the collection is
//! removed again.

use std::io::Cursor;
use std::path::Path;

use walkdir::WalkDir;

use chatdocs_core::models::{BackendChoice, CollectionView, NewCollection, NewDocument};

use crate::error::{Error, Result};
use crate::jobs::{Job, JobHandle, JobQueue};
use crate::repository::Repository;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const MACOS_METADATA_DIR: &str = "__MACOSX";

/// One uploaded file as received from the transport.
#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    fn is_archive(&self) -> bool {
        self.bytes.starts_with(ZIP_MAGIC)
    }
}

/// How an archive entry's content was read. Both keep the exact bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryContent {
    Text(String),
    Binary(Vec<u8>),
}

impl EntryContent {
    fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => EntryContent::Text(text),
            Err(e) => EntryContent::Binary(e.into_bytes()),
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        match self {
            EntryContent::Text(text) => text.into_bytes(),
            EntryContent::Binary(bytes) => bytes,
        }
    }
}

#[derive(Debug)]
pub struct IngestOutcome {
    pub collection: CollectionView,
    pub job: JobHandle,
}

/// Create a collection from `payloads` and queue its build.
pub async fn ingest(
    repo: &dyn Repository,
    jobs: &JobQueue,
    title: &str,
    description: &str,
    backend: &str,
    payloads: Vec<Upload>,
) -> Result<IngestOutcome> {
    let backend: BackendChoice = backend.parse()?;
    let documents = normalize_payloads(payloads).await?;

    let (collection, _) = repo
        .create_collection_with_documents(
            &NewCollection {
                title: title.to_string(),
                description: description.to_string(),
                backend,
            },
            &documents,
        )
        .await
        .map_err(Error::Repository)?;

    let job = match jobs
        .submit(Job::Build {
            collection_id: collection.id,
        })
        .await
    {
        Ok(job) => job,
        Err(e) => {
            // A collection with no build job would sit in QUEUED forever.
            if let Err(cleanup) = repo.delete_collection(collection.id).await {
                tracing::error!(
                    collection_id = collection.id,
                    "failed to remove unqueued collection: {:#}",
                    cleanup
                );
            }
            return Err(Error::Queue(e));
        }
    };

    tracing::info!(
        collection_id = collection.id,
        backend = %backend,
        documents = documents.len(),
        "collection ingested, build queued"
    );

    let names = repo
        .document_names(collection.id)
        .await
        .map_err(Error::Repository)?;
    Ok(IngestOutcome {
        collection: CollectionView::new(&collection, names),
        job,
    })
}

/// Append one file to an existing collection and queue a refresh.
pub async fn add_file(
    repo: &dyn Repository,
    jobs: &JobQueue,
    collection_id: i64,
    upload: Upload,
    description: Option<String>,
) -> Result<(String, JobHandle)> {
    let collection = repo
        .get_collection(collection_id)
        .await
        .map_err(Error::Repository)?
        .ok_or(Error::NotFound(collection_id))?;
    if upload.name.trim().is_empty() {
        return Err(Error::EmptyUpload);
    }

    let document = repo
        .add_document(
            collection.id,
            &NewDocument {
                file_name: upload.name,
                description,
                content: upload.bytes,
            },
        )
        .await
        .map_err(Error::Repository)?;

    let job = jobs
        .submit(Job::Refresh {
            collection_id: collection.id,
            document_id: document.id,
        })
        .await
        .map_err(Error::Queue)?;

    Ok((
        format!(
            "File '{}' added to collection {}; index refresh queued.",
            document.file_name, collection.id
        ),
        job,
    ))
}

/// Turn raw payloads into the documents to persist.
pub async fn normalize_payloads(payloads: Vec<Upload>) -> Result<Vec<NewDocument>> {
    let single_archive = payloads.len() == 1 && payloads[0].is_archive();
    let documents = if single_archive {
        let archive = payloads.into_iter().next().ok_or(Error::EmptyUpload)?;
        tokio::task::spawn_blocking(move || expand_archive(&archive))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??
    } else {
        payloads
            .into_iter()
            .filter(|p| !p.name.trim().is_empty())
            .map(|p| NewDocument {
                file_name: p.name,
                description: None,
                content: p.bytes,
            })
            .collect()
    };

    if documents.is_empty() {
        return Err(Error::EmptyUpload);
    }
    Ok(documents)
}

/// Extract `archive` into a temp dir scoped to this call and read every
/// non-metadata file back. The temp dir is removed on every exit path.
fn expand_archive(archive: &Upload) -> Result<Vec<NewDocument>> {
    let invalid = |reason: String| Error::InvalidArchive {
        name: archive.name.clone(),
        reason,
    };

    let mut zip =
        zip::ZipArchive::new(Cursor::new(&archive.bytes)).map_err(|e| invalid(e.to_string()))?;
    let dir = tempfile::tempdir()?;
    zip.extract(dir.path()).map_err(|e| invalid(e.to_string()))?;

    read_extracted(dir.path())
}

fn read_extracted(root: &Path) -> Result<Vec<NewDocument>> {
    let mut documents = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != MACOS_METADATA_DIR);

    for entry in walker {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let file_name = rel
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        if file_name.rsplit('/').next().is_some_and(|n| n.starts_with("._")) {
            continue;
        }

        let content = EntryContent::from_bytes(std::fs::read(entry.path())?);
        if let EntryContent::Binary(_) = content {
            tracing::debug!(file = %file_name, "archive entry kept as binary");
        }
        documents.push(NewDocument {
            file_name,
            description: None,
            content: content.into_bytes(),
        });
    }
    Ok(documents)
}
