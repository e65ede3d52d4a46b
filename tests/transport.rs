//! Query sessions over a real WebSocket connection to the router.

mod common;

use std::net::SocketAddr;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use chatdocs::ingest::{ingest, Upload};
use chatdocs::server::router;
use chatdocs::session::{CLOSE_UNAVAILABLE, MAX_CLOSE_REASON_BYTES};
use chatdocs_core::manifest::IndexManifest;
use chatdocs_core::models::{BackendChoice, CollectionStatus, NewCollection};
use common::{Harness, DIMS};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn serve(h: &Harness) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(h.services.clone());
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

async fn connect(addr: SocketAddr, path: &str) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
    socket
}

async fn expect_close(socket: &mut Socket) -> CloseFrame {
    match socket.next().await {
        Some(Ok(Message::Close(Some(frame)))) => frame,
        other => panic!("expected a close frame, got {other:?}"),
    }
}

fn new_collection(title: &str, backend: BackendChoice) -> NewCollection {
    NewCollection {
        title: title.into(),
        description: String::new(),
        backend,
    }
}

#[tokio::test]
async fn queued_collection_closes_with_unavailable_code() {
    let h = Harness::new().await;
    let collection = h
        .services
        .repo
        .create_collection(&new_collection("Waiting", BackendChoice::Embedded))
        .await
        .unwrap();
    let addr = serve(&h).await;

    let mut socket = connect(addr, &format!("/ws/collections/{}", collection.id)).await;
    let frame = expect_close(&mut socket).await;
    assert_eq!(u16::from(frame.code), CLOSE_UNAVAILABLE);
    assert!(frame.reason.as_str().contains(&collection.id.to_string()));
}

#[tokio::test]
async fn unreachable_backend_closes_with_unavailable_code() {
    let h = Harness::new().await;
    let repo = &h.services.repo;
    let collection = repo
        .create_collection(&new_collection("Remote", BackendChoice::Milvus))
        .await
        .unwrap();
    repo.transition_status(collection.id, CollectionStatus::Queued, CollectionStatus::Running)
        .await
        .unwrap();
    let manifest = IndexManifest {
        collection_uuid: collection.uuid,
        backend: BackendChoice::Milvus,
        namespace: BackendChoice::Milvus.namespace(&collection.uuid),
        embed_model: "hash-test".into(),
        dims: DIMS,
        documents: 1,
        passages: 1,
        built_at: Utc::now(),
    };
    repo.complete_with_artifact(
        collection.id,
        &IndexManifest::artifact_name(),
        &manifest.to_bytes().unwrap(),
    )
    .await
    .unwrap();
    let addr = serve(&h).await;

    let mut socket = connect(addr, &format!("/ws/collections/{}", collection.id)).await;
    let frame = expect_close(&mut socket).await;
    assert_eq!(u16::from(frame.code), CLOSE_UNAVAILABLE);
    assert!(frame.reason.len() <= MAX_CLOSE_REASON_BYTES);
    assert!(frame.reason.as_str().contains("milvus"));
}

#[tokio::test]
async fn built_collection_answers_over_the_socket() {
    let h = Harness::new().await;
    let outcome = ingest(
        h.services.repo.as_ref(),
        &h.services.jobs,
        "Tides",
        "",
        "duckdb",
        vec![Upload::new(
            "tides.txt",
            "Spring tides happen when the sun and moon align.",
        )],
    )
    .await
    .unwrap();
    let id = outcome.collection.id;
    assert!(outcome.job.wait().await);
    let addr = serve(&h).await;

    let mut socket = connect(addr, &format!("/ws/collections/{id}?model=gpt-test")).await;
    socket
        .send(Message::Text(r#"{"query":"When are spring tides?"}"#.into()))
        .await
        .unwrap();
    let reply = match socket.next().await {
        Some(Ok(Message::Text(text))) => text,
        other => panic!("expected a text reply, got {other:?}"),
    };
    let body: serde_json::Value = serde_json::from_str(reply.as_str()).unwrap();
    let response = body["response"].as_str().unwrap();
    assert!(response.starts_with("## Response"));
    assert!(response.contains("tides.txt"));

    socket
        .send(Message::Text("not json".into()))
        .await
        .unwrap();
    match socket.next().await {
        Some(Ok(Message::Text(text))) => {
            let body: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            assert!(body["error"].is_string());
        }
        other => panic!("expected an error reply, got {other:?}"),
    }
    assert_eq!(h.engine.completions(), 1);
}
