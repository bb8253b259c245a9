//! HTTP inference server built on axum.
//!
//! Two routes: `GET /` reports liveness and whether the model loaded, and
//! `POST /predict` accepts a multipart upload with a single `file` part and
//! answers with the integer fake score.

use super::engine::ModelState;
use crate::error::MlError;
use crate::nn::Architecture;
use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Multipart, State,
        multipart::{MultipartError, MultipartRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use deepfly_core::{ChannelOrder, DeepflyConfig};
use deepfly_core::config::ServerConfig;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Name of the multipart part carrying the image.
pub const FILE_FIELD: &str = "file";

/// Errors surfaced to HTTP clients as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("AI model is not loaded: {0}")]
    ModelUnavailable(String),

    #[error("No file part")]
    MissingFile,

    #[error("No selected file")]
    EmptyFilename,

    #[error("Only one file part may be uploaded per request")]
    DuplicateFile,

    /// Malformed or oversized multipart body; carries axum's status.
    #[error("Invalid upload: {message}")]
    InvalidUpload { status: StatusCode, message: String },

    #[error("{0}")]
    Processing(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::ModelUnavailable(_) | ApiError::Processing(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::MissingFile | ApiError::EmptyFilename | ApiError::DuplicateFile => {
                StatusCode::BAD_REQUEST
            }
            ApiError::InvalidUpload { status, .. } => *status,
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        ApiError::InvalidUpload {
            status: e.status(),
            message: e.body_text(),
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(e: MultipartRejection) -> Self {
        ApiError::InvalidUpload {
            status: e.status(),
            message: e.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "Prediction failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// State shared read-only by every request.
#[derive(Debug)]
pub struct AppState {
    model: ModelState,
    channel_order: ChannelOrder,
    started_at: chrono::DateTime<Utc>,
}

/// Thread-safe shared state reference for axum handlers.
pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(model: ModelState, channel_order: ChannelOrder) -> Self {
        Self {
            model,
            channel_order,
            started_at: Utc::now(),
        }
    }

    /// Load the configured weights, resolving relative paths against `workspace`.
    ///
    /// A missing or unreadable artifact degrades the model; an unknown
    /// architecture name is a configuration error.
    pub fn from_config(config: &DeepflyConfig, workspace: &Path) -> Result<Self, MlError> {
        let architecture = config
            .model
            .architecture
            .as_deref()
            .map(str::parse::<Architecture>)
            .transpose()?;
        let weights = DeepflyConfig::resolve(workspace, &config.model.weights_path);
        let model = ModelState::load(&weights, architecture);
        Ok(Self::new(model, config.model.channel_order))
    }

    pub fn model(&self) -> &ModelState {
        &self.model
    }

    pub fn channel_order(&self) -> ChannelOrder {
        self.channel_order
    }

    /// Uptime in seconds since the state was created.
    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}

/// Build the router with `/` and `/predict` routes.
pub fn router(state: SharedState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/predict", post(predict_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint; succeeds even when the model is unavailable.
async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "online",
        "message": "DeepFly MesoNet server is running",
        "model_loaded": state.model().is_loaded(),
        "uptime_secs": state.uptime_secs(),
    }))
}

async fn predict_handler(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let handle = match state.model() {
        ModelState::Loaded(handle) => handle.clone(),
        ModelState::Unavailable { reason } => {
            return Err(ApiError::ModelUnavailable(reason.clone()));
        }
    };

    let multipart = multipart?;
    let (filename, bytes) = read_upload(multipart).await?;

    let order = state.channel_order();
    let result = tokio::task::spawn_blocking(move || handle.classify(&bytes, order))
        .await
        .map_err(|e| ApiError::Processing(format!("inference task failed: {e}")))?
        .map_err(|e| ApiError::Processing(e.to_string()))?;

    info!(
        filename = %filename,
        fake_probability = result.fake_probability,
        score = result.score,
        "Prediction complete"
    );

    Ok(Json(json!({ "score": result.score, "metrics": {} })))
}

/// Pull exactly one non-empty `file` part out of the form.
async fn read_upload(mut multipart: Multipart) -> Result<(String, bytes::Bytes), ApiError> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        if upload.is_some() {
            return Err(ApiError::DuplicateFile);
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        if filename.is_empty() {
            return Err(ApiError::EmptyFilename);
        }
        let bytes = field.bytes().await?;
        upload = Some((filename, bytes));
    }
    upload.ok_or(ApiError::MissingFile)
}

/// Bind the configured address and serve until Ctrl-C.
pub async fn run(state: SharedState, config: &ServerConfig) -> Result<(), std::io::Error> {
    let app = router(state, config.max_upload_bytes);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "DeepFly server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::engine::ModelHandle;
    use crate::nn::Network;
    use crate::nn::keras::tests::write_keras_weights;
    use axum::body::Body;
    use tower::ServiceExt;

    fn loaded_state() -> SharedState {
        let handle = ModelHandle::new(Network::new(Architecture::Meso4), "memory");
        Arc::new(AppState::new(ModelState::Loaded(handle), ChannelOrder::Bgr))
    }

    fn unavailable_state() -> SharedState {
        Arc::new(AppState::new(
            ModelState::Unavailable {
                reason: "weights file missing".into(),
            },
            ChannelOrder::Bgr,
        ))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(
            ApiError::ModelUnavailable("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ApiError::MissingFile.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::DuplicateFile.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::InvalidUpload {
                status: StatusCode::PAYLOAD_TOO_LARGE,
                message: "length limit exceeded".into(),
            }
            .status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::Processing("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::ModelUnavailable("no weights".into()).to_string(),
            "AI model is not loaded: no weights"
        );
    }

    #[tokio::test]
    async fn test_health_reports_model_state() {
        for (state, loaded) in [(loaded_state(), true), (unavailable_state(), false)] {
            let req = axum::http::Request::builder()
                .uri("/")
                .body(Body::empty())
                .unwrap();
            let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(router(state, 1024), req)
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
            let json = body_json(resp).await;
            assert_eq!(json["status"], "online");
            assert_eq!(json["model_loaded"], loaded);
            assert!(json["uptime_secs"].is_u64());
        }
    }

    #[tokio::test]
    async fn test_unavailable_model_checked_before_body() {
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/predict")
            .body(Body::empty())
            .unwrap();
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(
            router(unavailable_state(), 1024),
            req,
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), 500);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "AI model is not loaded: weights file missing");
    }

    #[tokio::test]
    async fn test_non_multipart_is_bad_request() {
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/predict")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(router(loaded_state(), 1024), req)
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert!(body_json(resp).await["error"].is_string());
    }

    #[test]
    fn test_default_config_serves_fetched_weights() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeepflyConfig::default();
        let fetched = dir.path().join(&config.fetch.destination);
        write_keras_weights(&Network::random(Architecture::Meso4, 6), &fetched, 1);

        let state = AppState::from_config(&config, dir.path()).unwrap();
        let handle = state.model().handle().expect("fetched weights should load");
        assert_eq!(handle.source(), fetched.as_path());
    }

    #[test]
    fn test_unknown_architecture_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DeepflyConfig::default();
        config.model.architecture = Some("resnet".into());
        let err = AppState::from_config(&config, dir.path()).unwrap_err();
        assert!(matches!(err, MlError::InvalidInput(_)));
    }
}
