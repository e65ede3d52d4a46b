//! End-to-end ingestion, build, refresh and load over the embedded backend.

mod common;

use std::io::{Cursor, Write};
use std::sync::Arc;

use chatdocs::builder::{build_index, refresh_index, BuildContext};
use chatdocs::ingest::{add_file, ingest, Upload};
use chatdocs::Error;
use chatdocs_core::models::{BackendChoice, CollectionStatus, NewCollection, NewDocument};
use common::{HashEngine, Harness, DIMS};
use zip::write::SimpleFileOptions;

fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in entries {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(body).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn two_files() -> Vec<Upload> {
    vec![
        Upload::new(
            "rivers.txt",
            "The Danube flows through ten countries before reaching the Black Sea.",
        ),
        Upload::new(
            "mountains.md",
            "# Peaks\n\nEverest is the highest mountain above sea level.",
        ),
    ]
}

#[tokio::test]
async fn ingest_builds_and_answers_simple_queries() {
    let h = Harness::new().await;
    let outcome = ingest(
        h.services.repo.as_ref(),
        &h.services.jobs,
        "Geography",
        "notes",
        "duckdb",
        two_files(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.collection.status, CollectionStatus::Queued);
    assert_eq!(outcome.collection.db_storage, "duckdb");
    assert_eq!(
        outcome.collection.document_names,
        vec!["rivers.txt", "mountains.md"]
    );

    let id = outcome.collection.id;
    assert!(outcome.job.wait().await);

    let collection = h.collection(id).await;
    assert_eq!(collection.status, CollectionStatus::Complete);
    assert!(!collection.processing);
    assert!(collection.has_model());

    let handle = h.services.cache.load(id).await.unwrap();
    assert_eq!(handle.manifest.documents, 2);
    assert_eq!(handle.manifest.dims, common::DIMS);
    assert_eq!(handle.context.backend, BackendChoice::Embedded);

    let answer = handle.query("Which sea does the Danube reach?", None).await.unwrap();
    let markdown = answer.to_markdown();
    assert!(markdown.starts_with("## Response"));
    assert!(markdown.contains("## Sources"));
    assert!(markdown.contains("> Source (Doc id: "));
    assert_eq!(h.engine.completions(), 1);
}

#[tokio::test]
async fn archive_upload_skips_macos_metadata() {
    let h = Harness::new().await;
    let archive = zip_of(&[
        ("guide/intro.txt", b"Welcome to the guide."),
        ("guide/usage.txt", b"Run the tool with a config file."),
        ("__MACOSX/guide/._intro.txt", b"\x00\x05\x16\x07"),
    ]);

    let outcome = ingest(
        h.services.repo.as_ref(),
        &h.services.jobs,
        "Guide",
        "",
        "duckdb",
        vec![Upload::new("guide.zip", archive)],
    )
    .await
    .unwrap();

    assert_eq!(
        outcome.collection.document_names,
        vec!["guide/intro.txt", "guide/usage.txt"]
    );
    assert!(outcome.job.wait().await);
}

#[tokio::test]
async fn archive_entries_keep_their_exact_bytes() {
    let h = Harness::new().await;
    let binary: &[u8] = &[0x89, b'P', b'N', b'G', 0x00, 0xff];
    let archive = zip_of(&[("notes.txt", b"plain words here"), ("logo.png", binary)]);

    let outcome = ingest(
        h.services.repo.as_ref(),
        &h.services.jobs,
        "Mixed",
        "",
        "duckdb",
        vec![Upload::new("mixed.zip", archive)],
    )
    .await
    .unwrap();
    let id = outcome.collection.id;

    let docs = h.services.repo.list_documents(id).await.unwrap();
    let logo = docs.iter().find(|d| d.file_name == "logo.png").unwrap();
    assert_eq!(logo.content, binary);

    // The image is skipped during extraction; the text file still builds.
    assert!(outcome.job.wait().await);
    assert_eq!(h.collection(id).await.status, CollectionStatus::Complete);
}

#[tokio::test]
async fn unsupported_backend_creates_nothing() {
    let h = Harness::new().await;
    let err = ingest(
        h.services.repo.as_ref(),
        &h.services.jobs,
        "Nope",
        "",
        "postgres",
        two_files(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::UnsupportedBackend(_)));
    assert!(err.is_client_error());
    assert!(h.services.repo.list_collections().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_document_write_leaves_no_collection() {
    let h = Harness::new().await;
    sqlx::query("DROP TABLE documents")
        .execute(h.repo.pool())
        .await
        .unwrap();

    let err = ingest(
        h.services.repo.as_ref(),
        &h.services.jobs,
        "Geography",
        "",
        "duckdb",
        two_files(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Repository(_)));
    assert!(h.services.repo.list_collections().await.unwrap().is_empty());
}

#[tokio::test]
async fn ingest_after_shutdown_removes_the_collection() {
    let h = Harness::new().await;
    h.services.jobs.shutdown().await;

    let err = ingest(
        h.services.repo.as_ref(),
        &h.services.jobs,
        "Geography",
        "",
        "duckdb",
        two_files(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Queue(_)));
    assert!(h.services.repo.list_collections().await.unwrap().is_empty());
}

#[tokio::test]
async fn status_moves_forward_only() {
    let h = Harness::new().await;
    let outcome = ingest(
        h.services.repo.as_ref(),
        &h.services.jobs,
        "Geography",
        "",
        "duckdb",
        two_files(),
    )
    .await
    .unwrap();
    let id = outcome.collection.id;
    assert!(outcome.job.wait().await);

    assert_eq!(
        h.repo.transitions_for(id),
        vec![
            (CollectionStatus::Queued, CollectionStatus::Running),
            (CollectionStatus::Running, CollectionStatus::Complete),
        ]
    );
}

#[tokio::test]
async fn build_without_text_ends_in_error() {
    let h = Harness::new().await;
    let outcome = ingest(
        h.services.repo.as_ref(),
        &h.services.jobs,
        "Binary",
        "",
        "duckdb",
        vec![Upload::new("blob.bin", vec![0u8, 0xfe, 0xff, 0x80])],
    )
    .await
    .unwrap();
    let id = outcome.collection.id;
    assert!(!outcome.job.wait().await);

    let collection = h.collection(id).await;
    assert_eq!(collection.status, CollectionStatus::Error);
    assert!(!collection.processing);
    assert!(!collection.has_model());
    assert_eq!(
        h.repo.transitions_for(id),
        vec![
            (CollectionStatus::Queued, CollectionStatus::Running),
            (CollectionStatus::Running, CollectionStatus::Error),
        ]
    );
    assert!(matches!(
        h.services.cache.load(id).await.unwrap_err(),
        Error::NoModelForCollection(_)
    ));
}

#[tokio::test]
async fn unbuilt_collection_is_refused_before_any_backend_call() {
    let h = Harness::new().await;
    let collection = h
        .services
        .repo
        .create_collection(&NewCollection {
            title: "Pending".into(),
            description: String::new(),
            backend: BackendChoice::Milvus,
        })
        .await
        .unwrap();

    let err = h.services.cache.load(collection.id).await.unwrap_err();
    assert!(matches!(err, Error::NoModelForCollection(id) if id == collection.id));
    assert_eq!(h.services.selector.opened_count(), 0);

    assert!(matches!(
        h.services.cache.load(9999).await.unwrap_err(),
        Error::NotFound(9999)
    ));
}

#[tokio::test]
async fn cached_artifact_is_reused_until_evicted() {
    let h = Harness::new().await;
    let outcome = ingest(
        h.services.repo.as_ref(),
        &h.services.jobs,
        "Geography",
        "",
        "duckdb",
        two_files(),
    )
    .await
    .unwrap();
    let id = outcome.collection.id;
    assert!(outcome.job.wait().await);

    h.services.cache.load(id).await.unwrap();
    h.services.cache.load(id).await.unwrap();
    assert_eq!(h.repo.artifact_reads(), 1);
    assert!(h.services.cache.entry_path(id).exists());

    assert!(h.services.cache.evict(id).await.unwrap());
    assert!(!h.services.cache.evict(id).await.unwrap());
    h.services.cache.load(id).await.unwrap();
    assert_eq!(h.repo.artifact_reads(), 2);
}

#[tokio::test]
async fn added_file_is_merged_into_the_index() {
    let h = Harness::new().await;
    let outcome = ingest(
        h.services.repo.as_ref(),
        &h.services.jobs,
        "Geography",
        "",
        "duckdb",
        two_files(),
    )
    .await
    .unwrap();
    let id = outcome.collection.id;
    assert!(outcome.job.wait().await);
    let before = h.collection(id).await.model;
    h.services.cache.load(id).await.unwrap();

    let (message, job) = add_file(
        h.services.repo.as_ref(),
        &h.services.jobs,
        id,
        Upload::new("savanna.txt", "zebra zebra stripes grazing"),
        Some("animals".into()),
    )
    .await
    .unwrap();
    assert!(message.contains("savanna.txt"));
    assert!(job.wait().await);

    let collection = h.collection(id).await;
    assert_eq!(collection.status, CollectionStatus::Complete);
    assert_ne!(collection.model, before);
    assert!(!h.services.cache.entry_path(id).exists());

    let handle = h.services.cache.load(id).await.unwrap();
    assert_eq!(handle.manifest.documents, 3);
    let hits = handle.retrieve("zebra stripes", 1).await.unwrap();
    assert_eq!(hits[0].file_name, "savanna.txt");
}

#[tokio::test]
async fn refresh_of_an_already_built_document_does_not_double_count() {
    let h = Harness::new().await;
    let repo = &h.services.repo;
    let collection = repo
        .create_collection(&NewCollection {
            title: "Birds".into(),
            description: String::new(),
            backend: BackendChoice::Embedded,
        })
        .await
        .unwrap();
    let docs = repo
        .add_documents(
            collection.id,
            &["heron wading", "kestrel hovering", "swift gliding"]
                .iter()
                .enumerate()
                .map(|(i, text)| NewDocument {
                    file_name: format!("bird_{i}.txt"),
                    description: None,
                    content: text.as_bytes().to_vec(),
                })
                .collect::<Vec<_>>(),
        )
        .await
        .unwrap();

    // The third document was added while the build was still pending.
    let ctx = h.build_context();
    assert!(build_index(&ctx, collection.id).await);
    assert!(refresh_index(&ctx, collection.id, docs[2].id).await);

    let handle = h.services.cache.load(collection.id).await.unwrap();
    assert_eq!(handle.manifest.documents, 3);
    assert_eq!(handle.manifest.passages, 3);
}

#[tokio::test]
async fn refresh_with_a_different_embedding_width_writes_nothing() {
    let h = Harness::new().await;
    let outcome = ingest(
        h.services.repo.as_ref(),
        &h.services.jobs,
        "Geography",
        "",
        "duckdb",
        two_files(),
    )
    .await
    .unwrap();
    let id = outcome.collection.id;
    assert!(outcome.job.wait().await);
    let before = h.collection(id).await;

    let resolved = h
        .services
        .selector
        .resolve(BackendChoice::Embedded, &before.uuid)
        .await
        .unwrap();
    let stored = resolved.store.count().await.unwrap();

    let doc = h
        .services
        .repo
        .add_document(
            id,
            &NewDocument {
                file_name: "glacier.txt".into(),
                description: None,
                content: b"glaciers carve valleys".to_vec(),
            },
        )
        .await
        .unwrap();
    let wider = BuildContext {
        engine: Arc::new(HashEngine::with_dims(DIMS * 2)),
        ..h.build_context()
    };
    assert!(!refresh_index(&wider, id, doc.id).await);

    assert_eq!(resolved.store.count().await.unwrap(), stored);
    let after = h.collection(id).await;
    assert_eq!(after.status, CollectionStatus::Complete);
    assert_eq!(after.model, before.model);
}

#[tokio::test]
async fn add_file_to_missing_collection_is_not_found() {
    let h = Harness::new().await;
    let err = add_file(
        h.services.repo.as_ref(),
        &h.services.jobs,
        42,
        Upload::new("a.txt", "text"),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::NotFound(42)));
}

#[tokio::test]
async fn second_build_of_a_complete_collection_is_refused() {
    let h = Harness::new().await;
    let outcome = ingest(
        h.services.repo.as_ref(),
        &h.services.jobs,
        "Geography",
        "",
        "duckdb",
        two_files(),
    )
    .await
    .unwrap();
    let id = outcome.collection.id;
    assert!(outcome.job.wait().await);
    let model = h.collection(id).await.model;

    assert!(!build_index(&h.build_context(), id).await);

    let collection = h.collection(id).await;
    assert_eq!(collection.status, CollectionStatus::Complete);
    assert_eq!(collection.model, model);
}
