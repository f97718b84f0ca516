//! HTTP/1.1 front end.
//!
//! A single catch-all handler implements the request semantics: only `GET`,
//! `HEAD` and `POST` are served, the target must resolve to a known
//! resource, and `POST /inference[/{device}]` turns the raw body into a
//! queued inference job and waits on its bell. Each connection is a tokio
//! task; a 30-second timeout bounds every request.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use detect_core::engine::DeviceKind;
use detect_core::sync::{Message, DONE};
use detect_core::{BoundingBox, Prediction};

use crate::dispatch::Dispatcher;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Wire form of one detection in the JSON response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionDto {
    pub label_id: i32,
    pub label: String,
    pub confidences: f32,
    /// `[xmin, ymin, xmax, ymax]` in image pixels.
    pub detection_box: [i32; 4],
}

/// Body of a successful inference response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub predictions: Vec<DetectionDto>,
}

impl From<&BoundingBox> for DetectionDto {
    fn from(b: &BoundingBox) -> Self {
        Self {
            label_id: b.label_id,
            label: b.label.clone(),
            confidences: b.score,
            detection_box: [b.xmin, b.ymin, b.xmax, b.ymax],
        }
    }
}

impl From<Prediction> for PredictionResponse {
    fn from(prediction: Prediction) -> Self {
        Self {
            predictions: prediction.iter().map(DetectionDto::from).collect(),
        }
    }
}

/// Recognized request targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Resource {
    Root,
    Metadata,
    Inference(Option<DeviceKind>),
}

enum Target {
    /// Malformed: empty, relative, or containing a dot-dot segment.
    Illegal,
    /// Well-formed but not a known resource.
    Unknown,
    Resource(Resource),
}

fn resolve_target(path: &str) -> Target {
    if path.is_empty() || !path.starts_with('/') || path.contains("..") {
        return Target::Illegal;
    }
    let trimmed = path[1..].trim_end_matches('/');
    match trimmed {
        "" => Target::Resource(Resource::Root),
        "metadata" => Target::Resource(Resource::Metadata),
        "inference" => Target::Resource(Resource::Inference(None)),
        other => match other
            .strip_prefix("inference/")
            .and_then(DeviceKind::from_path_segment)
        {
            Some(device) => Target::Resource(Resource::Inference(Some(device))),
            None => Target::Unknown,
        },
    }
}

/// Content type derived from the target's extension, for `HEAD` responses.
fn mime_type(target: &str) -> &'static str {
    let ext = match target.rfind('.') {
        Some(pos) => &target[pos..],
        None => "",
    };
    match ext {
        ".htm" | ".html" | ".php" => "text/html",
        ".css" => "text/css",
        ".txt" => "text/plain",
        ".js" => "application/javascript",
        ".json" => "application/json",
        ".xml" => "application/xml",
        ".swf" => "application/x-shockwave-flash",
        ".flv" => "video/x-flv",
        ".png" => "image/png",
        ".jpe" | ".jpeg" | ".jpg" => "image/jpeg",
        ".gif" => "image/gif",
        ".bmp" => "image/bmp",
        ".ico" => "image/vnd.microsoft.icon",
        ".tif" | ".tiff" => "image/tiff",
        ".svg" | ".svgz" => "image/svg+xml",
        _ => "application/text",
    }
}

fn error_response(status: StatusCode, why: &'static str) -> Response {
    (status, [(header::CONTENT_TYPE, "text/html")], why).into_response()
}

fn greeting() -> serde_json::Value {
    serde_json::json!({
        "type": "greeting",
        "from": "detect-server",
        "message": "welcome to the detection serving gateway",
        "what next": {
            "API": "GET /v1/ for supported API",
            "INFO": "GET /metadata/ for model information"
        }
    })
}

fn metadata() -> serde_json::Value {
    serde_json::json!({
        "from": "detect-server",
        "message": "this is metadata request"
    })
}

async fn handle_request(
    State(dispatcher): State<Arc<Dispatcher>>,
    request: Request,
) -> Response {
    let method = request.method().clone();
    if !matches!(method, Method::GET | Method::HEAD | Method::POST) {
        return error_response(StatusCode::BAD_REQUEST, "Unknown HTTP-method");
    }

    let resource = match resolve_target(request.uri().path()) {
        Target::Illegal => {
            return error_response(StatusCode::BAD_REQUEST, "Illegal request-target")
        }
        Target::Unknown => return error_response(StatusCode::NOT_FOUND, "Not found"),
        Target::Resource(resource) => resource,
    };

    if method == Method::HEAD {
        let content_type = mime_type(request.uri().path());
        return ([(header::CONTENT_TYPE, content_type)], StatusCode::OK).into_response();
    }

    match (method, resource) {
        (Method::GET, Resource::Root) => Json(greeting()).into_response(),
        (Method::GET, Resource::Metadata) => Json(metadata()).into_response(),
        (Method::POST, Resource::Inference(device)) => {
            handle_inference(dispatcher, device, request).await
        }
        _ => error_response(StatusCode::BAD_REQUEST, "Illegal HTTP method"),
    }
}

async fn handle_inference(
    dispatcher: Arc<Dispatcher>,
    device: Option<DeviceKind>,
    request: Request,
) -> Response {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.contains("image/") {
        return Json(serde_json::json!({ "message": "not an image" })).into_response();
    }

    let body = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(%err, "failed to read inference request body");
            return error_response(StatusCode::BAD_REQUEST, "Unable to read request body");
        }
    };

    let (message, result, bell) = Message::new(body);
    if let Err(err) = dispatcher.dispatch(device, message) {
        tracing::warn!(%err, "cannot dispatch inference request");
        return error_response(StatusCode::NOT_IMPLEMENTED, "No engine for the requested device");
    }

    tracing::debug!("waiting for the inference worker");
    let waiter = Arc::clone(&bell);
    if tokio::task::spawn_blocking(move || waiter.wait(DONE))
        .await
        .is_err()
    {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Inference wait failed");
    }
    tracing::debug!("inference result received");

    let prediction =
        std::mem::take(&mut *result.lock().unwrap_or_else(PoisonError::into_inner));
    Json(PredictionResponse::from(prediction)).into_response()
}

/// Build the front-end router around a shared dispatcher.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .fallback(handle_request)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(READ_TIMEOUT))
        .with_state(dispatcher)
}

/// Serve HTTP on an already-bound listener.
pub async fn serve(listener: std::net::TcpListener, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    tracing::info!(addr = %listener.local_addr()?, "http front end listening");
    axum::serve(listener, router(dispatcher)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_resolve_like_the_resource_table() {
        assert!(matches!(resolve_target("/"), Target::Resource(Resource::Root)));
        assert!(matches!(
            resolve_target("/metadata"),
            Target::Resource(Resource::Metadata)
        ));
        assert!(matches!(
            resolve_target("/inference"),
            Target::Resource(Resource::Inference(None))
        ));
        assert!(matches!(
            resolve_target("/inference/cpu"),
            Target::Resource(Resource::Inference(Some(DeviceKind::Cpu)))
        ));
        assert!(matches!(
            resolve_target("/inference/fpga"),
            Target::Resource(Resource::Inference(Some(DeviceKind::Fpga)))
        ));
        assert!(matches!(
            resolve_target("/inference/gpu"),
            Target::Resource(Resource::Inference(Some(DeviceKind::Gpu)))
        ));
    }

    #[test]
    fn dot_dot_targets_are_illegal() {
        assert!(matches!(resolve_target("/../secret"), Target::Illegal));
        assert!(matches!(resolve_target(""), Target::Illegal));
        assert!(matches!(resolve_target("metadata"), Target::Illegal));
    }

    #[test]
    fn unknown_targets_are_distinct_from_illegal_ones() {
        assert!(matches!(resolve_target("/foo"), Target::Unknown));
        assert!(matches!(resolve_target("/inference/tpu"), Target::Unknown));
    }

    #[test]
    fn mime_types_follow_the_extension() {
        assert_eq!(mime_type("/index.html"), "text/html");
        assert_eq!(mime_type("/data.json"), "application/json");
        assert_eq!(mime_type("/player.swf"), "application/x-shockwave-flash");
        assert_eq!(mime_type("/clip.flv"), "video/x-flv");
        assert_eq!(mime_type("/metadata"), "application/text");
    }
}
