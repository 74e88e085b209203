//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};

use crate::bridge::protocol::Command;
use crate::link::{LinkInfo, RequestError, WorkerId};
use crate::registry::{Registry, RegistryError};

/// Shared state for the admin routes.
///
/// `registry` is `None` when the admin runs without a monitoring port.
#[derive(Clone, Default)]
pub struct AdminState {
    registry: Option<Arc<Registry>>,
}

impl AdminState {
    pub fn new(registry: Option<Arc<Registry>>) -> Self {
        Self { registry }
    }

    pub fn with_registry(registry: Arc<Registry>) -> Self {
        Self::new(Some(registry))
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> Option<&Arc<Registry>> {
        self.registry.as_ref()
    }
}

/// Error answered with `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: serde_json::Value,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": message.into() }),
        }
    }

    fn monitoring_disabled() -> Self {
        Self::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "QGIS Server monitoring is not activated",
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownWorker(id) => {
                Self::new(StatusCode::NOT_FOUND, format!("instance {id} not found"))
            }
            RegistryError::Request(e) => {
                let status = match e {
                    RequestError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                    RequestError::Disconnected | RequestError::Io(_) => StatusCode::BAD_GATEWAY,
                };
                Self {
                    status,
                    body: e.to_json(),
                }
            }
            RegistryError::Bind { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn registry(state: &AdminState) -> Result<&Arc<Registry>, ApiError> {
    state.registry().ok_or_else(ApiError::monitoring_disabled)
}

async fn list_instances(
    State(state): State<AdminState>,
) -> Result<Json<Vec<LinkInfo>>, ApiError> {
    Ok(Json(registry(&state)?.list()))
}

async fn get_instance(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<LinkInfo>, ApiError> {
    let id = WorkerId::from(id);
    registry(&state)?
        .get(&id)
        .map(|link| Json(link.info()))
        .ok_or_else(|| RegistryError::UnknownWorker(id).into())
}

async fn query_instance(
    State(state): State<AdminState>,
    Path((id, command)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let registry = registry(&state)?;
    let command: Command = command
        .parse()
        .map_err(|e: crate::bridge::protocol::UnknownCommand| {
            ApiError::new(StatusCode::NOT_FOUND, e.to_string())
        })?;

    let id = WorkerId::from(id);
    let body = registry.request(&id, command).await.inspect_err(|e| {
        tracing::debug!(worker_id = %id, %command, error = %e, "Instance query failed");
    })?;
    Ok(Json(body))
}

pub fn routes(state: AdminState) -> Router {
    Router::new()
        .route("/api/instances", get(list_instances))
        .route("/api/instances/{id}", get(get_instance))
        .route("/api/instances/{id}/{command}", get(query_instance))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::WorkerMetadata;
    use crate::probe::{
        LogBuffer, Probe, ProbeConfig, ProbeHandle, Responder, StaticMetadata, StatsAccumulator,
    };
    use crate::registry::RegistryConfig;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tower::ServiceExt;

    async fn response_json(response: Response) -> serde_json::Value {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        (status, response_json(response).await)
    }

    async fn start_registry(timeout: Duration) -> Arc<Registry> {
        let config = RegistryConfig::new("127.0.0.1:0").with_request_timeout(timeout);
        Arc::new(Registry::start(config).await.unwrap())
    }

    async fn wait_for_instance(registry: &Registry) -> WorkerId {
        for _ in 0..500 {
            if let Some(info) = registry.list().into_iter().next() {
                return info.id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no instance connected");
    }

    fn spawn_probe(registry: &Registry, logs: LogBuffer) -> ProbeHandle {
        let responder = Responder::new(
            Arc::new(StaticMetadata(WorkerMetadata::default())),
            logs,
            Arc::new(StatsAccumulator::default()),
        );
        Probe::new(
            ProbeConfig::new(registry.local_addr().to_string()),
            responder,
        )
        .spawn()
    }

    #[tokio::test]
    async fn instances_unavailable_without_registry() {
        let (status, json) = get_json(routes(AdminState::disabled()), "/api/instances").await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(
            json,
            json!({"error": "QGIS Server monitoring is not activated"})
        );

        let (status, _) = get_json(
            routes(AdminState::disabled()),
            "/api/instances/deadbeef/stats",
        )
        .await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn empty_registry_lists_nothing() {
        let registry = start_registry(Duration::from_secs(2)).await;
        let (status, json) =
            get_json(routes(AdminState::with_registry(registry)), "/api/instances").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, json!([]));
    }

    #[tokio::test]
    async fn unknown_instance_is_404() {
        let registry = start_registry(Duration::from_secs(2)).await;
        let app = routes(AdminState::with_registry(registry));

        let (status, json) = get_json(app.clone(), "/api/instances/deadbeef").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json, json!({"error": "instance deadbeef not found"}));

        let (status, _) = get_json(app, "/api/instances/deadbeef/logs").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_command_is_404() {
        let registry = start_registry(Duration::from_secs(2)).await;
        let (status, json) = get_json(
            routes(AdminState::with_registry(registry)),
            "/api/instances/deadbeef/reload",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json, json!({"error": "unknown command: reload"}));
    }

    #[tokio::test]
    async fn connected_probe_is_listed_and_queried() {
        let registry = start_registry(Duration::from_secs(2)).await;
        let logs = LogBuffer::default();
        logs.push("hello");
        let probe = spawn_probe(&registry, logs);
        let id = wait_for_instance(&registry).await;
        let app = routes(AdminState::with_registry(Arc::clone(&registry)));

        let (status, json) = get_json(app.clone(), "/api/instances").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["id"], id.as_str());
        assert_eq!(json[0]["ip"], "127.0.0.1");

        let (status, json) = get_json(app.clone(), &format!("/api/instances/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["alive"], true);

        let (status, json) = get_json(app.clone(), &format!("/api/instances/{id}/logs")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, json!({"logs": "hello"}));

        let (status, json) = get_json(app, &format!("/api/instances/{id}/metadata")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["versions"]["qsa-monitor"].is_string());

        probe.shutdown().await;
        registry.stop().await;
    }

    #[tokio::test]
    async fn silent_worker_times_out_with_504() {
        let registry = start_registry(Duration::from_millis(200)).await;
        let _silent = TcpStream::connect(registry.local_addr()).await.unwrap();
        let id = wait_for_instance(&registry).await;

        let (status, json) = get_json(
            routes(AdminState::with_registry(Arc::clone(&registry))),
            &format!("/api/instances/{id}/stats"),
        )
        .await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(json, json!({"error": "timeout"}));

        // A timeout leaves the instance registered.
        assert!(registry.get(&id).is_some());
    }

    #[test]
    fn disconnected_worker_maps_to_502() {
        let err = ApiError::from(RegistryError::Request(RequestError::Disconnected));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.body, json!({"error": "worker disconnected"}));
    }
}
