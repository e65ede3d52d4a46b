//! HTTP and WebSocket server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/heartbeat` | `true` while the server is up |
//! | `GET`  | `/health` | Status and version |
//! | `POST` | `/collections/create` | Multipart: `title`, `description`, `storage`, `files`… |
//! | `GET`  | `/collections/available` | All collections |
//! | `GET`  | `/collections/get/{id}` | One collection |
//! | `POST` | `/collections/{id}/add_file` | Multipart: `file`, `description` |
//! | `POST` | `/collections/{id}/evict` | Drop the local index cache entry |
//! | `GET`  | `/ws/collections/{id}?model=` | Query session (WebSocket) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "unsupported backend: 'x' ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `unavailable` (503),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser front ends
//! on other origins can upload and open query sockets.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use chatdocs_core::models::CollectionView;

use crate::app::Services;
use crate::error::Error;
use crate::ingest::{add_file, ingest, Upload};
use crate::session::{close_reason, QuerySession};

const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

/// Build the router over `services`.
pub fn router(services: Services) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/heartbeat", get(handle_heartbeat))
        .route("/health", get(handle_health))
        .route("/collections/create", post(handle_create))
        .route("/collections/available", get(handle_list))
        .route("/collections/get/{id}", get(handle_get))
        .route("/collections/{id}/add_file", post(handle_add_file))
        .route("/collections/{id}/evict", post(handle_evict))
        .route("/ws/collections/{id}", get(handle_ws))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(services)
}

/// Serve on `[server].bind` until the process is stopped, then drain the
/// job runner.
pub async fn run_server(services: Services) -> anyhow::Result<()> {
    let bind_addr = services.config.server.bind.clone();
    let jobs = services.jobs.clone();
    let app = router(services);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("chatdocs listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    jobs.shutdown().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let (status, code) = match &err {
            e if e.is_client_error() => (StatusCode::BAD_REQUEST, "bad_request"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::BackendUnavailable { .. } | Error::NoModelForCollection(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!("request failed: {}", err);
        }
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

// ============ Health ============

async fn handle_heartbeat() -> Json<bool> {
    Json(true)
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Collections ============

async fn handle_create(
    State(services): State<Services>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<CollectionView>), AppError> {
    let mut title = String::new();
    let mut description = String::new();
    let mut storage = None;
    let mut uploads = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "title" => title = field.text().await.map_err(|e| bad_request(e.to_string()))?,
            "description" => {
                description = field.text().await.map_err(|e| bad_request(e.to_string()))?
            }
            "storage" => {
                storage = Some(field.text().await.map_err(|e| bad_request(e.to_string()))?)
            }
            "files" | "file" => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(e.to_string()))?;
                uploads.push(Upload::new(file_name, bytes.to_vec()));
            }
            other => tracing::debug!(field = other, "ignoring unknown multipart field"),
        }
    }

    let storage = storage.ok_or_else(|| bad_request("missing 'storage' field"))?;
    if title.trim().is_empty() {
        return Err(bad_request("missing 'title' field"));
    }

    let outcome = ingest(
        services.repo.as_ref(),
        &services.jobs,
        &title,
        &description,
        storage.trim(),
        uploads,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(outcome.collection)))
}

async fn handle_list(
    State(services): State<Services>,
) -> Result<Json<Vec<CollectionView>>, AppError> {
    let collections = services
        .repo
        .list_collections()
        .await
        .map_err(Error::Repository)?;
    let mut views = Vec::with_capacity(collections.len());
    for c in &collections {
        let names = services
            .repo
            .document_names(c.id)
            .await
            .map_err(Error::Repository)?;
        views.push(CollectionView::new(c, names));
    }
    Ok(Json(views))
}

async fn handle_get(
    State(services): State<Services>,
    Path(id): Path<i64>,
) -> Result<Json<CollectionView>, AppError> {
    let collection = services
        .repo
        .get_collection(id)
        .await
        .map_err(Error::Repository)?
        .ok_or(Error::NotFound(id))?;
    let names = services
        .repo
        .document_names(id)
        .await
        .map_err(Error::Repository)?;
    Ok(Json(CollectionView::new(&collection, names)))
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

async fn handle_add_file(
    State(services): State<Services>,
    Path(id): Path<i64>,
    mut multipart: Multipart,
) -> Result<Json<MessageResponse>, AppError> {
    let mut upload = None;
    let mut description = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.to_string()))?
    {
        match field.name().unwrap_or_default() {
            "file" | "files" => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(e.to_string()))?;
                upload = Some(Upload::new(file_name, bytes.to_vec()));
            }
            "description" => {
                description = Some(field.text().await.map_err(|e| bad_request(e.to_string()))?)
            }
            _ => {}
        }
    }

    let upload = upload.ok_or(Error::EmptyUpload)?;
    let (message, _job) = add_file(
        services.repo.as_ref(),
        &services.jobs,
        id,
        upload,
        description.filter(|d| !d.trim().is_empty()),
    )
    .await?;
    Ok(Json(MessageResponse { message }))
}

#[derive(Serialize)]
struct EvictResponse {
    evicted: bool,
}

async fn handle_evict(
    State(services): State<Services>,
    Path(id): Path<i64>,
) -> Result<Json<EvictResponse>, AppError> {
    let evicted = services.cache.evict(id).await?;
    Ok(Json(EvictResponse { evicted }))
}

// ============ Query sessions ============

#[derive(Deserialize)]
struct SessionParams {
    model: Option<String>,
}

async fn handle_ws(
    ws: WebSocketUpgrade,
    State(services): State<Services>,
    Path(id): Path<i64>,
    Query(params): Query<SessionParams>,
) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, services, id, params.model))
}

async fn run_session(mut socket: WebSocket, services: Services, id: i64, model: Option<String>) {
    let mut session = QuerySession::new(id, model);

    if let Err(err) = session.open(&services.cache).await {
        let (code, reason) = close_reason(&err);
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let _ = socket.send(Message::Close(Some(frame))).await;
        return;
    }

    while let Some(msg) = socket.recv().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let reply = session.handle_text(text.as_str()).await;
        if socket
            .send(Message::Text(reply.to_json().into()))
            .await
            .is_err()
        {
            break;
        }
    }
    tracing::debug!(collection_id = id, "query session closed");
}
