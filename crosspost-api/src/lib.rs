//! crosspost-api - HTTP front end
//!
//! - `POST /post` accepts a post request and fans it out to delivery jobs
//! - `POST /webhook/:provider` accepts provider callbacks
//! - `GET /health` answers `ok`

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower::limit::ConcurrencyLimitLayer;
use tracing::{debug, error, warn};

use libcrosspost::config::ServerConfig;
use libcrosspost::service::CrosspostService;
use libcrosspost::types::{PostRequest, SubmitReceipt};
use libcrosspost::webhook::{WebhookAck, WebhookError, WebhookIngestor};
use libcrosspost::{CrosspostError, Producer};

#[derive(Clone)]
pub struct AppState {
    pub producer: Producer,
    pub webhooks: WebhookIngestor,
}

impl AppState {
    pub fn from_service(service: &CrosspostService) -> Self {
        Self {
            producer: service.producer(),
            webhooks: service.webhooks(),
        }
    }
}

pub fn router(state: AppState, server: &ServerConfig) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/post", post(submit_post))
        .route("/webhook/:provider", post(receive_webhook))
        .with_state(state)
        .layer(DefaultBodyLimit::max(server.max_body_size))
        .layer(ConcurrencyLimitLayer::new(server.concurrency_limit))
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Error response with a JSON `{ "error": ... }` body
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

impl From<CrosspostError> for ApiError {
    fn from(err: CrosspostError) -> Self {
        match &err {
            CrosspostError::Unauthorized(_) => {
                ApiError::new(StatusCode::UNAUTHORIZED, err.to_string())
            }
            CrosspostError::InvalidInput(_) | CrosspostError::Serialization(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, err.to_string())
            }
            CrosspostError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, err.to_string()),
            _ => {
                error!(error = %err, "request failed");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::Unauthorized(msg) => ApiError::new(StatusCode::FORBIDDEN, msg),
            WebhookError::BadRequest(msg) => ApiError::new(StatusCode::BAD_REQUEST, msg),
            WebhookError::UnknownProvider(provider) => {
                ApiError::new(StatusCode::NOT_FOUND, format!("unknown provider {}", provider))
            }
            WebhookError::Internal(e) => {
                error!(error = %e, "webhook processing failed");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn submit_post(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SubmitReceipt>, ApiError> {
    let request: PostRequest = serde_json::from_slice(&body).map_err(|e| {
        ApiError::new(StatusCode::BAD_REQUEST, format!("invalid post request: {}", e))
    })?;
    debug!(
        user_id = %request.api_key.user_id,
        targets = request.target_platforms.len(),
        "received post request"
    );

    match state.producer.submit(&request).await {
        Ok(receipt) => Ok(Json(receipt)),
        Err(e) => {
            if matches!(e, CrosspostError::Unauthorized(_)) {
                warn!(user_id = %request.api_key.user_id, "rejected post request: {}", e);
            }
            Err(e.into())
        }
    }
}

pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let ack = state.webhooks.ingest(&provider, &headers, &body).await?;

    Ok(match ack {
        WebhookAck::Challenge(challenge) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            challenge,
        )
            .into_response(),
        WebhookAck::Queued | WebhookAck::Duplicate | WebhookAck::Ignored(_) => {
            (StatusCode::OK, "ok").into_response()
        }
    })
}
