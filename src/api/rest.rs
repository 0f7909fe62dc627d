//! REST API Handlers
//!
//! Exposes the controller verbs as JSON endpoints under `/csi/v1`. Status
//! codes follow the usual RPC-to-HTTP mapping so a client can branch on the
//! HTTP status alone; the body carries the RPC code name and the message.

use crate::controller::ControllerService;
use crate::domain::requests::*;
use crate::error::{Code, Error};
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::debug;

// =============================================================================
// Response Types
// =============================================================================

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    /// RPC status code name, e.g. `FailedPrecondition`
    pub code: String,
    pub message: String,
}

/// HTTP status for an RPC status code
pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::InvalidArgument | Code::FailedPrecondition => StatusCode::BAD_REQUEST,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        // Client closed request
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT),
    }
}

fn error_response(err: Error) -> Response {
    let code = err.code();
    debug!("Request failed with {}: {}", code.as_str(), err);
    (
        http_status(code),
        Json(ApiErrorResponse {
            code: code.as_str().to_string(),
            message: err.to_string(),
        }),
    )
        .into_response()
}

fn respond<T: Serialize>(result: crate::error::Result<T>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => error_response(e),
    }
}

fn respond_empty(result: crate::error::Result<()>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    service: Arc<ControllerService>,
    shutdown: CancellationToken,
}

impl RestRouter {
    /// `shutdown` abandons the polling of every in-flight request when cancelled
    pub fn new(service: Arc<ControllerService>, shutdown: CancellationToken) -> Self {
        Self { service, shutdown }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            service: self.service,
            shutdown: self.shutdown,
        };

        Router::new()
            // Volume endpoints
            .route("/csi/v1/volumes", post(create_volume))
            .route("/csi/v1/volumes/:volume_id", delete(delete_volume))
            .route("/csi/v1/volumes/:volume_id/expand", post(expand_volume))
            .route("/csi/v1/volumes/:volume_id/publish", post(publish_volume))
            .route("/csi/v1/volumes/:volume_id/unpublish", post(unpublish_volume))
            // Snapshot endpoints
            .route("/csi/v1/snapshots", post(create_snapshot).get(list_snapshots))
            .route("/csi/v1/snapshots/:snapshot_id", delete(delete_snapshot))
            // Ledger inspection
            .route("/csi/v1/operations/:instance_name", get(get_operation))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    service: Arc<ControllerService>,
    shutdown: CancellationToken,
}

impl AppState {
    /// Cancellation scope of one request
    fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_volume(
    State(state): State<AppState>,
    Json(request): Json<CreateVolumeRequest>,
) -> Response {
    let cancel = state.request_token();
    respond(state.service.create_volume(request, &cancel).await)
}

async fn delete_volume(State(state): State<AppState>, Path(volume_id): Path<String>) -> Response {
    let cancel = state.request_token();
    let request = DeleteVolumeRequest { volume_id };
    respond_empty(state.service.delete_volume(request, &cancel).await)
}

async fn expand_volume(
    State(state): State<AppState>,
    Path(volume_id): Path<String>,
    Json(mut request): Json<ControllerExpandVolumeRequest>,
) -> Response {
    let cancel = state.request_token();
    request.volume_id = volume_id;
    respond(state.service.controller_expand_volume(request, &cancel).await)
}

async fn publish_volume(
    State(state): State<AppState>,
    Path(volume_id): Path<String>,
    Json(mut request): Json<ControllerPublishVolumeRequest>,
) -> Response {
    let cancel = state.request_token();
    request.volume_id = volume_id;
    respond(state.service.controller_publish_volume(request, &cancel).await)
}

async fn unpublish_volume(
    State(state): State<AppState>,
    Path(volume_id): Path<String>,
    Json(mut request): Json<ControllerUnpublishVolumeRequest>,
) -> Response {
    let cancel = state.request_token();
    request.volume_id = volume_id;
    respond_empty(state.service.controller_unpublish_volume(request, &cancel).await)
}

async fn create_snapshot(
    State(state): State<AppState>,
    Json(request): Json<CreateSnapshotRequest>,
) -> Response {
    let cancel = state.request_token();
    respond(state.service.create_snapshot(request, &cancel).await)
}

async fn delete_snapshot(State(state): State<AppState>, Path(snapshot_id): Path<String>) -> Response {
    let cancel = state.request_token();
    let request = DeleteSnapshotRequest { snapshot_id };
    respond_empty(state.service.delete_snapshot(request, &cancel).await)
}

async fn list_snapshots(
    State(state): State<AppState>,
    Query(request): Query<ListSnapshotsRequest>,
) -> Response {
    respond(state.service.list_snapshots(request).await)
}

async fn get_operation(State(state): State<AppState>, Path(instance_name): Path<String>) -> Response {
    match state.service.operation(&instance_name).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => error_response(Error::NotFound(format!(
            "no operation recorded for {}",
            instance_name
        ))),
        Err(e) => error_response(e),
    }
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.service.backend_ready().await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "backend unavailable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{Harness, GIB};
    use crate::ledger::{instance, OperationRecord, OperationStatus};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use serde::de::DeserializeOwned;
    use serde_json::json;
    use tower::ServiceExt;

    fn router(h: &Harness) -> Router {
        RestRouter::new(h.service.clone(), CancellationToken::new()).build()
    }

    async fn call(router: &Router, method: Method, uri: &str, body: Option<serde_json::Value>) -> Response {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        router.clone().oneshot(request).await.unwrap()
    }

    async fn read<T: DeserializeOwned>(response: Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn create_body(name: &str) -> serde_json::Value {
        json!({
            "name": name,
            "capacityRange": { "requiredBytes": GIB },
            "volumeCapabilities": [{
                "accessType": { "type": "mount", "fsType": "ext4" },
                "accessMode": "SINGLE_NODE_WRITER"
            }]
        })
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(http_status(Code::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(http_status(Code::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(http_status(Code::AlreadyExists), StatusCode::CONFLICT);
        assert_eq!(http_status(Code::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(http_status(Code::Cancelled).as_u16(), 499);
    }

    #[tokio::test]
    async fn test_volume_lifecycle_over_http() {
        let h = Harness::new();
        let router = router(&h);

        let response = call(&router, Method::POST, "/csi/v1/volumes", Some(create_body("pvc-1"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let created: CreateVolumeResponse = read(response).await;
        assert_eq!(created.volume.capacity_bytes, GIB);
        let volume_id = created.volume.volume_id;

        let response = call(
            &router,
            Method::POST,
            &format!("/csi/v1/volumes/{}/publish", volume_id),
            Some(json!({ "nodeId": "node-1", "volumeCapability": {
                "accessType": { "type": "block" },
                "accessMode": "SINGLE_NODE_WRITER"
            }})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let published: ControllerPublishVolumeResponse = read(response).await;
        assert!(published.publish_context.contains_key(ATTRIBUTE_DISK_UUID));

        let response = call(
            &router,
            Method::POST,
            &format!("/csi/v1/volumes/{}/unpublish", volume_id),
            Some(json!({ "nodeId": "node-1" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = call(
            &router,
            Method::POST,
            &format!("/csi/v1/volumes/{}/expand", volume_id),
            Some(json!({ "capacityRange": { "requiredBytes": 2 * GIB } })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let expanded: ControllerExpandVolumeResponse = read(response).await;
        assert_eq!(expanded.capacity_bytes, 2 * GIB);

        let response = call(
            &router,
            Method::DELETE,
            &format!("/csi/v1/volumes/{}", volume_id),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_errors_carry_code() {
        let h = Harness::new();
        let router = router(&h);

        let mut body = create_body("pvc-1");
        body["volumeCapabilities"] = json!([]);
        let response = call(&router, Method::POST, "/csi/v1/volumes", Some(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error: ApiErrorResponse = read(response).await;
        assert_eq!(error.code, "InvalidArgument");

        let response = call(&router, Method::POST, "/csi/v1/volumes", Some(create_body("pvc-1"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let mut divergent = create_body("pvc-1");
        divergent["capacityRange"]["requiredBytes"] = json!(2 * GIB);
        let response = call(&router, Method::POST, "/csi/v1/volumes", Some(divergent)).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let error: ApiErrorResponse = read(response).await;
        assert_eq!(error.code, "AlreadyExists");
    }

    #[tokio::test]
    async fn test_snapshots_over_http() {
        let h = Harness::new();
        let router = router(&h);
        let volume_id = h.create_volume("pvc-1", GIB).await.unwrap().volume.volume_id;

        let response = call(
            &router,
            Method::POST,
            "/csi/v1/snapshots",
            Some(json!({ "sourceVolumeId": volume_id, "name": "snap-1" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let created: CreateSnapshotResponse = read(response).await;

        let response = call(
            &router,
            Method::GET,
            &format!("/csi/v1/snapshots?sourceVolumeId={}&maxEntries=10", volume_id),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let listing: ListSnapshotsResponse = read(response).await;
        assert_eq!(listing.entries, vec![created.snapshot.clone()]);

        let response = call(
            &router,
            Method::GET,
            "/csi/v1/snapshots?startingToken=bogus",
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let encoded = urlencoding::encode(&created.snapshot.snapshot_id);
        let response = call(
            &router,
            Method::DELETE,
            &format!("/csi/v1/snapshots/{}", encoded),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(h.backend.snapshot_count(), 0);
    }

    #[tokio::test]
    async fn test_operation_lookup() {
        let h = Harness::new();
        let router = router(&h);
        h.create_volume("pvc-1", GIB).await.unwrap();

        let uri = format!("/csi/v1/operations/{}", instance::create_volume("pvc-1"));
        let response = call(&router, Method::GET, &uri, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let record: OperationRecord = read(response).await;
        assert_eq!(record.status, OperationStatus::Success);

        let response = call(&router, Method::GET, "/csi/v1/operations/unknown", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let h = Harness::new();
        let router = router(&h);

        let response = call(&router, Method::GET, "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = call(&router, Method::GET, "/ready", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        h.backend.set_available(false);
        let response = call(&router, Method::GET, "/ready", None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
