//! Axum request handlers for the forward and cluster-browsing endpoints.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use common::protocol::{
    CreateForwardRequest, ErrorResponse, HealthResponse, Resource, StopResponse,
};
use common::{ForwardRule, ForwardStatus, ResourceKind, ServiceError};
use serde::Deserialize;
use tracing::{info, warn};

use super::error::ApiError;
use super::state::AppState;

/// `GET /api/forwards` — every forward rule, oldest first.
pub async fn list_forwards(State(state): State<AppState>) -> Json<Vec<ForwardRule>> {
    Json(state.manager.list())
}

/// `POST /api/forwards` — validate the request and start a forward.
///
/// Ports may be sent as numbers or numeric strings. Validation failures are
/// 400s; anything the forward manager rejects (port conflict, bind failure,
/// unresolvable service) is a 500 carrying its message.
pub async fn create_forward(
    State(state): State<AppState>,
    payload: Result<Json<CreateForwardRequest>, JsonRejection>,
) -> Result<Json<ForwardRule>, ApiError> {
    let Json(req) = payload?;
    let spec = req.validate()?;

    let rule = state.manager.create_forward(spec).await.map_err(|e| {
        warn!(error = %e, "create forward failed");
        ApiError::from(e)
    })?;
    Ok(Json(rule))
}

/// `DELETE /api/forwards/:id` — stop and remove a forward.
pub async fn delete_forward(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    if !state.manager.stop_forward(&id).await {
        return Err(ServiceError::NotFound("Forward not found".into()).into());
    }
    info!(rule_id = %id, "forward deleted");
    Ok(Json(StopResponse { success: true }))
}

/// `GET /api/namespaces` — namespace names, sorted.
pub async fn list_namespaces(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    let mut names = state.cluster.list_namespaces().await?;
    names.sort();
    Ok(Json(names))
}

#[derive(Debug, Deserialize)]
pub struct ResourceQuery {
    namespace: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// `GET /api/resources?namespace=&type=` — forwardable pods or services.
///
/// Pods are listed only while `Running`, with their declared container ports;
/// services with their spec ports.
pub async fn list_resources(
    State(state): State<AppState>,
    Query(query): Query<ResourceQuery>,
) -> Result<Json<Vec<Resource>>, ApiError> {
    let namespace = query
        .namespace
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| "default".into());
    let kind = match query.kind.as_deref() {
        None | Some("") => ResourceKind::Pod,
        Some(kind) => kind.parse()?,
    };

    let resources = match kind {
        ResourceKind::Pod => state
            .cluster
            .list_pods(&namespace, None)
            .await?
            .into_iter()
            .filter(|pod| pod.is_running())
            .map(|pod| Resource {
                name: pod.name,
                ports: pod.ports,
            })
            .collect(),
        ResourceKind::Service => state
            .cluster
            .list_services(&namespace)
            .await?
            .into_iter()
            .map(|svc| Resource {
                name: svc.name,
                ports: svc.ports,
            })
            .collect(),
    };
    Ok(Json(resources))
}

/// `GET /health` — liveness check with rule counts.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let rules = state.manager.list();
    let running = rules
        .iter()
        .filter(|r| r.status == ForwardStatus::Running)
        .count();
    Json(HealthResponse {
        status: "ok".into(),
        forwards: rules.len(),
        running,
    })
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{delete, get};
    use axum::Router;
    use axum_test::TestServer;
    use forwarder::testing::{free_port, StaticCluster};
    use serde_json::{json, Value};

    fn server(state: AppState) -> TestServer {
        let app = Router::new()
            .route("/api/forwards", get(list_forwards).post(create_forward))
            .route("/api/forwards/:id", delete(delete_forward))
            .route("/api/namespaces", get(list_namespaces))
            .route("/api/resources", get(list_resources))
            .route("/health", get(health))
            .with_state(state);
        TestServer::new(app).unwrap()
    }

    fn create_body(port: u16) -> Value {
        json!({
            "namespace": "default",
            "resourceType": "pod",
            "resourceName": "web-1",
            "localPort": port,
            "remotePort": "80",
        })
    }

    #[tokio::test]
    async fn create_list_delete() {
        let server = server(AppState::default());
        let port = free_port();

        let resp = server.post("/api/forwards").json(&create_body(port)).await;
        resp.assert_status_ok();
        let rule: ForwardRule = resp.json();
        assert_eq!(rule.local_port, port);
        assert_eq!(rule.remote_port, 80);
        assert_eq!(rule.status, ForwardStatus::Running);

        let listed: Vec<ForwardRule> = server.get("/api/forwards").await.json();
        assert_eq!(listed, vec![rule.clone()]);

        let health: Value = server.get("/health").await.json();
        assert_eq!(health, json!({"status": "ok", "forwards": 1, "running": 1}));

        let resp = server.delete(&format!("/api/forwards/{}", rule.id)).await;
        resp.assert_status_ok();
        resp.assert_json(&json!({"success": true}));

        let resp = server.delete(&format!("/api/forwards/{}", rule.id)).await;
        resp.assert_status(StatusCode::NOT_FOUND);
        resp.assert_json(&json!({"code": "not_found", "message": "Forward not found"}));
    }

    #[tokio::test]
    async fn create_validation_messages() {
        let server = server(AppState::default());
        let cases = [
            (json!({"namespace": "default"}), "Missing required fields"),
            (
                json!({"namespace": "default", "resourceType": "deployment", "resourceName": "web",
                       "localPort": 8080, "remotePort": 80}),
                r#"resourceType must be "pod" or "service""#,
            ),
            (
                json!({"namespace": "default", "resourceType": "pod", "resourceName": "web",
                       "localPort": 70000, "remotePort": 80}),
                "Invalid localPort",
            ),
            (
                json!({"namespace": "default", "resourceType": "pod", "resourceName": "web",
                       "localPort": 8080, "remotePort": "eighty"}),
                "Invalid remotePort",
            ),
        ];

        for (body, message) in cases {
            let resp = server.post("/api/forwards").json(&body).await;
            resp.assert_status_bad_request();
            let err: ErrorResponse = resp.json();
            assert_eq!(err.code, "bad_request");
            assert_eq!(err.message, message);
        }
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let server = server(AppState::default());
        let resp = server
            .post("/api/forwards")
            .text("{not json")
            .content_type("application/json")
            .await;
        resp.assert_status_bad_request();
        let err: ErrorResponse = resp.json();
        assert_eq!(err.code, "bad_request");
    }

    #[tokio::test]
    async fn port_conflict_is_a_server_error_with_message() {
        let server = server(AppState::default());
        let port = free_port();
        server.post("/api/forwards").json(&create_body(port)).await.assert_status_ok();

        let resp = server.post("/api/forwards").json(&create_body(port)).await;
        resp.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        let err: ErrorResponse = resp.json();
        assert_eq!(err.message, format!("Local port {port} is already in use by web-1"));
    }

    #[tokio::test]
    async fn namespaces_are_sorted() {
        let cluster = StaticCluster::default()
            .with_namespace("kube-system")
            .with_namespace("default")
            .with_namespace("apps");
        let server = server(AppState::with_cluster(cluster));
        let names: Vec<String> = server.get("/api/namespaces").await.json();
        assert_eq!(names, ["apps", "default", "kube-system"]);
    }

    #[tokio::test]
    async fn cluster_failures_are_unavailable() {
        let server = server(AppState::with_cluster(StaticCluster::unreachable()));
        let resp = server.get("/api/namespaces").await;
        resp.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        let err: ErrorResponse = resp.json();
        assert_eq!(err.code, "service_unavailable");
    }

    #[tokio::test]
    async fn resources_list_running_pods_by_default() {
        let cluster = StaticCluster::default()
            .with_pod_ports("web-0", "Pending", &[], &[8080])
            .with_pod_ports("web-1", "Running", &[], &[8080, 9090])
            .with_service_ports("web", &[("app", "web")], &[80]);
        let server = server(AppState::with_cluster(cluster));

        let pods: Value = server.get("/api/resources").await.json();
        assert_eq!(
            pods,
            json!([{"name": "web-1", "ports": [{"port": 8080}, {"port": 9090}]}])
        );

        let services: Value = server
            .get("/api/resources")
            .add_query_param("namespace", "default")
            .add_query_param("type", "service")
            .await
            .json();
        assert_eq!(services, json!([{"name": "web", "ports": [{"port": 80}]}]));
    }

    #[tokio::test]
    async fn resources_reject_unknown_type() {
        let server = server(AppState::default());
        let resp = server
            .get("/api/resources")
            .add_query_param("type", "deployment")
            .await;
        resp.assert_status_bad_request();
    }
}
