//! HTTP interface of the update agent.
//!
//! Handlers translate verbs into registry and session operations and marshal
//! snapshots back out. The pipeline never runs on a handler thread; status
//! polls read a snapshot of the session state.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::info;

use otad_common::manager::PartitionManager;

use crate::config::AgentConfig;
use crate::pipeline;
use crate::registry::{RegistryError, SessionRegistry};
use crate::session::{Snapshot, Stage};
use crate::validate::ExpectedImage;

/// Shared state behind the HTTP handlers.
pub struct Agent {
    config: AgentConfig,
    registry: SessionRegistry,
    manager: Arc<dyn PartitionManager>,
}

impl Agent {
    pub fn new(config: AgentConfig, manager: Arc<dyn PartitionManager>) -> Self {
        Self {
            config,
            registry: SessionRegistry::new(),
            manager,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}

/// Build the router exposing the update API.
pub fn create_app(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/update/begin", post(begin))
        .route("/update/:token/file", post(upload))
        .route("/update/:token/status", get(status))
        .route("/update/:token/commit", post(commit))
        .route("/update/:token/cancel", post(cancel))
        .layer(DefaultBodyLimit::disable())
        .with_state(agent)
}

#[derive(Debug, Serialize)]
struct TokenBody {
    token: String,
}

#[derive(Debug, Serialize)]
struct MessageBody {
    error: &'static str,
    message: String,
}

/// Error response of the HTTP interface.
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad-request",
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            kind: "conflict",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: message.into(),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(error: RegistryError) -> Self {
        let (status, kind) = match &error {
            RegistryError::Conflict | RegistryError::WrongStage { .. } => {
                (StatusCode::CONFLICT, "conflict")
            }
            RegistryError::NotFound => (StatusCode::NOT_FOUND, "not-found"),
            RegistryError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        Self {
            status,
            kind,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(MessageBody {
                error: self.kind,
                message: self.message,
            }),
        )
            .into_response()
    }
}

async fn begin(
    State(agent): State<Arc<Agent>>,
) -> Result<(StatusCode, Json<TokenBody>), ApiError> {
    let session = agent.registry.begin(&agent.config.download_dir).await?;
    info!("created update session {}", session.token());
    Ok((
        StatusCode::CREATED,
        Json(TokenBody {
            token: session.token().to_owned(),
        }),
    ))
}

async fn status(
    State(agent): State<Arc<Agent>>,
    Path(token): Path<String>,
) -> Result<Json<Snapshot>, ApiError> {
    let session = agent.registry.get(&token).await?;
    Ok(Json(session.snapshot()))
}

async fn commit(
    State(agent): State<Arc<Agent>>,
    Path(token): Path<String>,
) -> Result<Json<Snapshot>, ApiError> {
    let snapshot = agent.registry.finish(&token).await?;
    info!("update session {token} committed");
    Ok(Json(snapshot))
}

async fn cancel(
    State(agent): State<Arc<Agent>>,
    Path(token): Path<String>,
) -> Json<serde_json::Value> {
    agent.registry.cancel(&token).await;
    Json(serde_json::json!({ "message": "session cancelled" }))
}

async fn upload(
    State(agent): State<Arc<Agent>>,
    Path(token): Path<String>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Snapshot>), ApiError> {
    let session = agent.registry.get(&token).await?;
    if session.stage() != Stage::AwaitingFile {
        return Err(ApiError::conflict(format!(
            "session is in stage {}, not awaiting a file",
            session.stage()
        )));
    }

    let mut digest: Option<String> = None;
    let mut size: Option<u64> = None;
    let mut received: Option<u64> = None;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|error| ApiError::bad_request(format!("invalid multipart payload: {error}")))?
    {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "digest" => {
                digest = Some(field.text().await.map_err(|error| {
                    ApiError::bad_request(format!("invalid `digest` field: {error}"))
                })?);
            }
            "size" => {
                let text = field.text().await.map_err(|error| {
                    ApiError::bad_request(format!("invalid `size` field: {error}"))
                })?;
                size = Some(text.trim().parse().map_err(|_| {
                    ApiError::bad_request(format!("invalid `size` field: {text:?}"))
                })?);
            }
            "image" => {
                // Stream the image to the scratch file chunk by chunk; it is
                // far too large to buffer.
                let mut file = tokio::fs::File::create(session.bundle_path())
                    .await
                    .map_err(|error| {
                        ApiError::internal(format!("unable to create bundle file: {error}"))
                    })?;
                let mut total: u64 = 0;
                while let Some(chunk) = field.chunk().await.map_err(|error| {
                    ApiError::bad_request(format!("error reading upload: {error}"))
                })? {
                    file.write_all(&chunk).await.map_err(|error| {
                        ApiError::internal(format!("unable to write bundle file: {error}"))
                    })?;
                    total += chunk.len() as u64;
                }
                file.flush().await.map_err(|error| {
                    ApiError::internal(format!("unable to write bundle file: {error}"))
                })?;
                received = Some(total);
            }
            _ => {
                return Err(ApiError::bad_request(format!(
                    "unexpected field {name:?}"
                )));
            }
        }
    }

    let (Some(digest), Some(size), Some(received)) = (digest, size, received) else {
        return Err(ApiError::bad_request(
            "fields `digest`, `size`, and `image` are required",
        ));
    };
    let expected = ExpectedImage::parse(&digest, size)
        .map_err(|error| ApiError::bad_request(error.to_string()))?;
    info!(
        "received {received} bytes for update session {}",
        session.token()
    );

    if session.cancel_requested() {
        return Err(ApiError::conflict("session has been cancelled"));
    }
    if !session.advance(Stage::Validating) {
        return Err(ApiError::conflict("session already received a file"));
    }
    let task = tokio::task::spawn_blocking({
        let session = session.clone();
        let manager = agent.manager.clone();
        let marker_file = agent.config.marker_file.clone();
        move || pipeline::run(session, manager, expected, marker_file)
    });
    agent.registry.attach_task(&token, task).await;

    Ok((StatusCode::CREATED, Json(session.snapshot())))
}
