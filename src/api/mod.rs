//! HTTP surface.
//!
//! Handlers are short-lived: validate, touch the store, enqueue background
//! work, return. Every response carries the
//! `{status, message, data?, error?}` envelope; the body's `status` is
//! authoritative and the HTTP status code is advisory.

pub mod git_services;
pub mod plugins;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::Error;
use crate::pipeline::{Deps, PipelineController};

pub struct App {
    pub pipelines: Arc<PipelineController>,
}

impl App {
    pub fn new(pipelines: Arc<PipelineController>) -> Self {
        App { pipelines }
    }

    pub fn deps(&self) -> &Arc<Deps> {
        self.pipelines.deps()
    }
}

#[derive(Debug, Serialize)]
pub struct Envelope {
    pub status: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn success(message: impl Into<String>, data: Option<Value>) -> Json<Envelope> {
        Json(Envelope {
            status: "success",
            message: message.into(),
            data,
            error: None,
        })
    }

    pub fn failure(message: impl Into<String>, error: impl Into<String>) -> Envelope {
        Envelope {
            status: "failed",
            message: message.into(),
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Error wrapper that renders the envelope with an advisory status code.
pub struct ApiError(pub Error);

impl<E: Into<Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        ApiError(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.advisory_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = self.0.to_string();
        (status, Json(Envelope::failure(message.clone(), message))).into_response()
    }
}

pub type ApiResult<T = Json<Envelope>> = Result<T, ApiError>;

/// Requester identity forwarded by the (external) auth front end.
pub fn user_id(headers: &HeaderMap) -> String {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("system")
        .to_string()
}

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .nest("/api/v1/plugins", plugins::routes())
        .nest("/api/v1/git-services", git_services::routes())
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shapes() {
        let ok = Envelope::success("saved", Some(serde_json::json!({"plugin_id": "p1"})));
        let body = serde_json::to_value(&ok.0).unwrap();
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["plugin_id"], "p1");
        assert!(body.get("error").is_none());

        let failed = Envelope::failure("boom", "boom");
        let body = serde_json::to_value(&failed).unwrap();
        assert_eq!(body["status"], "failed");
        assert_eq!(body["error"], "boom");
    }

    #[test]
    fn test_user_id_fallback() {
        let mut headers = HeaderMap::new();
        assert_eq!(user_id(&headers), "system");
        headers.insert("x-user-id", "u42".parse().unwrap());
        assert_eq!(user_id(&headers), "u42");
    }
}
