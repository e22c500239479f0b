//! REST API handlers

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::MasterError;
use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

fn failure(e: MasterError) -> Response {
    let status = match &e {
        MasterError::NoDeviceSelected => StatusCode::CONFLICT,
        MasterError::Unsupported { .. } => StatusCode::NOT_IMPLEMENTED,
        MasterError::NotDiscovered(_) => StatusCode::NOT_FOUND,
        _ if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, Json(ApiError::new(e.to_string()))).into_response()
}

/// Discovered devices, sorted by name
pub async fn list_devices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.feed.snapshot().await)
}

/// Make a discovered device the current one
pub async fn select_device(State(state): State<Arc<AppState>>, Path(uuid): Path<String>) -> impl IntoResponse {
    let Some(device) = state.feed.get(&uuid).await else {
        return (StatusCode::NOT_FOUND, Json(ApiError::new("Device not found"))).into_response();
    };

    match state.master.select_device(&device).await {
        Ok(()) => Json(json!({"success": true})).into_response(),
        Err(e) => {
            warn!(uuid = %uuid, error = %e, "Select failed");
            let message = state.master.connection_error_message(&uuid, &e);
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"success": false, "error": e, "message": message})),
            )
                .into_response()
        }
    }
}

/// Status of the current device
pub async fn get_report(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.master.poll_report().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => failure(e),
    }
}

/// Job control on the current device
pub async fn play(State(state): State<Arc<AppState>>, Path(action): Path<String>) -> impl IntoResponse {
    info!(action = %action, "Play action requested");
    let master = &state.master;
    let result = match action.as_str() {
        "pause" => master.pause().await,
        "resume" => master.resume().await,
        "stop" => master.stop().await,
        "restart" => master.restart().await,
        "quit" => master.quit().await,
        "kick" => master.kick().await,
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiError::new(format!("Unknown action: {other}"))),
            )
                .into_response()
        }
    };
    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => failure(e),
    }
}

#[derive(Deserialize)]
pub struct FilesQuery {
    #[serde(default = "default_path")]
    path: String,
}

fn default_path() -> String {
    "/".to_string()
}

/// Directory listing on the current device
pub async fn list_files(State(state): State<Arc<AppState>>, Query(query): Query<FilesQuery>) -> impl IntoResponse {
    match state.master.ls(&query.path).await {
        Ok(listing) => Json(listing).into_response(),
        Err(e) => failure(e),
    }
}

pub async fn reconnect(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.master.reconnect().await {
        Ok(()) => Json(json!({"success": true})).into_response(),
        Err(e) => failure(e),
    }
}

/// One camera frame from the current device
pub async fn camera_snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.master.take_one_picture().await {
        Ok(frame) => {
            let content_type = if frame.data.starts_with(b"\x89PNG") {
                "image/png"
            } else {
                "image/jpeg"
            };
            ([(header::CONTENT_TYPE, content_type)], frame.data).into_response()
        }
        Err(e) => failure(e),
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::master::tests::{harness, selected};
    use crate::server::router;
    use crate::state::AppState;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use beamlink_control::mock::MockDevice;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(master: Arc<crate::master::DeviceMaster>) -> axum::Router {
        router(Arc::new(AppState {
            config: Config::default(),
            feed: master.feed().clone(),
            master,
        }))
    }

    async fn call(app: axum::Router, method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn json_body(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn test_list_devices() {
        let h = harness(vec![]);
        h.master
            .feed()
            .ingest(&json!({"uuid": "abc", "name": "beamo", "ipaddr": "10.0.0.2", "model": "fbm1"}))
            .await;

        let (status, body) = call(app(h.master.clone()), "GET", "/api/devices").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)[0]["uuid"], "abc");
    }

    #[tokio::test]
    async fn test_select_unknown_device_is_404() {
        let h = harness(vec![]);
        let (status, _) = call(app(h.master.clone()), "POST", "/api/devices/nope/select").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_select_and_report() {
        let device = MockDevice::new("abc").with_status(128, "ABORTING");
        let h = harness(vec![device.clone()]);
        h.master
            .feed()
            .ingest(&serde_json::to_value(&device.descriptor).unwrap())
            .await;
        let app = app(h.master.clone());

        let (status, body) = call(app.clone(), "POST", "/api/devices/abc/select").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["success"], true);

        let (status, body) = call(app, "GET", "/api/report").await;
        assert_eq!(status, StatusCode::OK);
        let report = json_body(&body);
        assert_eq!(report["st_id"], 128);
        assert_eq!(report["st_label"], "ABORTED");
    }

    #[tokio::test]
    async fn test_commands_without_selection() {
        let h = harness(vec![]);
        let (status, body) = call(app(h.master.clone()), "POST", "/api/play/pause").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json_body(&body)["error"], "No device selected");
    }

    #[tokio::test]
    async fn test_play_actions() {
        let h = selected(vec![MockDevice::new("abc")]).await;
        let app = app(h.master.clone());

        let (status, _) = call(app.clone(), "POST", "/api/play/pause").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(app, "POST", "/api/play/dance").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert_eq!(h.backend.commands("abc"), vec!["play pause"]);
    }

    #[tokio::test]
    async fn test_files_default_to_root() {
        let h = selected(vec![MockDevice::new("abc")]).await;
        let (status, _) = call(app(h.master.clone()), "GET", "/api/files").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(h.backend.commands("abc"), vec!["file ls /"]);
    }

    #[tokio::test]
    async fn test_camera_snapshot_is_jpeg() {
        let h = selected(vec![MockDevice::new("abc")]).await;
        let (status, body) = call(app(h.master.clone()), "GET", "/api/camera/snapshot").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..2], &[0xFF, 0xD8]);
    }
}
