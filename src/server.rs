//! HTTP front end: upload, query, and health.
//!
//! Upload is deliberately thin: validate, stash the bytes, enqueue, and
//! return 204 before any extraction or embedding happens. All heavy work
//! belongs to the worker. Query runs the full retrieval pipeline inline
//! and synchronously, because the caller is waiting for the answer.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::PipelineError;
use crate::extract;
use crate::generate::Generator;
use crate::models::{Document, IngestionTask, QueryRequest};
use crate::queue::TaskQueue;
use crate::retrieve::QueryService;
use crate::storage::{self, Storage};
use crate::vector_index::VectorIndex;

pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<dyn Storage>,
    pub queue: Arc<dyn TaskQueue>,
    pub index: Arc<dyn VectorIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub query: QueryService,
}

/// JSON error contract: `{ "error": { "code", "message" } }`.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    /// Upload-path collaborator failure. The ingest contract reports these
    /// as 500, unlike the query path's 502 for upstream errors.
    fn upload_failed(service: &'static str, message: impl std::fmt::Display) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "upload_failed",
            format!("{}: {}", service, message),
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": { "code": self.code, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Validation(message) => Self::bad_request("invalid_request", message),
            PipelineError::Transient { service, message } => Self::new(
                StatusCode::BAD_GATEWAY,
                "upstream_unavailable",
                format!("{}: {}", service, message),
            ),
            PipelineError::Permanent { service, message } => Self::new(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                format!("{}: {}", service, message),
            ),
            PipelineError::Generation(message) => {
                Self::new(StatusCode::BAD_GATEWAY, "generation_failed", message)
            }
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.server.max_upload_bytes as usize + 64 * 1024;
    Router::new()
        .route("/ingest", post(handle_ingest))
        .route("/query", post(handle_query))
        .route("/health", get(handle_health))
        .route("/health/detailed", get(handle_health_detailed))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let bind = state.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Check an upload's filename and size; returns (filename, media type).
fn validate_upload(
    filename: Option<&str>,
    size_bytes: u64,
    max_bytes: u64,
) -> Result<(String, &'static str), AppError> {
    let filename = filename
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .ok_or_else(|| AppError::bad_request("missing_filename", "upload must carry a filename"))?;

    let extension = filename.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    let media_type = extract::media_type_for_extension(extension).ok_or_else(|| {
        AppError::bad_request(
            "unsupported_file_type",
            format!(
                "unsupported file type '{}'; accepted: .pdf .txt .md .docx .doc",
                filename
            ),
        )
    })?;

    if size_bytes > max_bytes {
        return Err(AppError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "file_too_large",
            format!("file is {} bytes, limit is {}", size_bytes, max_bytes),
        ));
    }

    Ok((filename.to_string(), media_type))
}

async fn handle_ingest(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<StatusCode, AppError> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError::bad_request("malformed_multipart", e.to_string())
    })? {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field.bytes().await.map_err(|e| {
            AppError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "file_too_large",
                e.to_string(),
            )
        })?;
        upload = Some((filename, bytes.to_vec()));
        break;
    }

    let Some((raw_filename, bytes)) = upload else {
        return Err(AppError::bad_request(
            "missing_file",
            "multipart body must contain a file field",
        ));
    };

    let max = state.config.server.max_upload_bytes;
    let (filename, media_type) = validate_upload(Some(&raw_filename), bytes.len() as u64, max)?;

    let document_id = Uuid::new_v4();
    let key = storage::storage_key(&state.config.storage.key_prefix, document_id, &filename);

    // Side-effect order matters: the blob must exist before the task that
    // references it is visible to any worker.
    let size_bytes = bytes.len() as u64;
    let storage_key = state
        .storage
        .put(&key, bytes, media_type)
        .await
        .map_err(|e| AppError::upload_failed("storage", e))?;

    let document = Document {
        id: document_id,
        filename: filename.clone(),
        media_type: media_type.to_string(),
        size_bytes,
        storage_key,
    };
    state
        .queue
        .enqueue(&IngestionTask::new(document))
        .await
        .map_err(|e| AppError::upload_failed("queue", e))?;

    tracing::info!(%document_id, filename = %filename, size_bytes, "upload accepted");
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<crate::models::Answer>, AppError> {
    let answer = state.query.answer(&request).await?;
    Ok(Json(answer))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_health_detailed(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let (storage, queue, index, embedder, generator) = tokio::join!(
        state.storage.ping(),
        state.queue.ping(),
        state.index.ping(),
        state.embedder.ping(),
        state.generator.ping(),
    );
    let healthy = storage && queue && index && embedder && generator;
    Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "components": {
            "storage": storage,
            "queue": queue,
            "vector_index": index,
            "embedder": embedder,
            "generator": generator,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u64 = 10 * 1024 * 1024;

    #[test]
    fn accepts_supported_extensions() {
        for name in ["a.pdf", "b.txt", "c.md", "d.docx", "e.doc", "F.PDF"] {
            let (filename, media_type) = validate_upload(Some(name), 100, MAX).unwrap();
            assert_eq!(filename, name);
            assert!(!media_type.is_empty());
        }
    }

    #[test]
    fn rejects_unsupported_extension_with_400() {
        let err = validate_upload(Some("malware.exe"), 100, MAX).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn rejects_missing_or_blank_filename() {
        assert_eq!(
            validate_upload(None, 100, MAX).unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            validate_upload(Some("   "), 100, MAX).unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn rejects_oversized_file_with_413() {
        let err = validate_upload(Some("big.pdf"), MAX + 1, MAX).unwrap_err();
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn size_exactly_at_limit_is_accepted() {
        assert!(validate_upload(Some("edge.pdf"), MAX, MAX).is_ok());
    }

    #[test]
    fn validation_error_maps_to_400() {
        let err: AppError = PipelineError::Validation("bad".into()).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn transient_error_maps_to_502() {
        let err: AppError = PipelineError::transient("storage", "down").into();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn upload_collaborator_failure_maps_to_500() {
        let err = AppError::upload_failed("storage", "connect timed out");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
