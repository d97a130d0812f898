//! HTTP surface of the gateway.
//!
//! JSON bodies, 2xx on success, `{"error": ...}` envelope otherwise. The
//! handlers are thin: validation and behavior live in the session runtime.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

use crate::crd::{ResourceSpec, ToolSource};
use crate::error::Result;
use crate::gateway::runtime::SessionRuntime;
use crate::gateway::session::StepRequest;
use crate::gateway::shell;

pub type AppState = Arc<SessionRuntime>;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(rename = "poolRef")]
    pub pool_ref: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default, rename = "keepAlive")]
    pub keep_alive: bool,
    #[serde(default, rename = "idleTimeoutSeconds")]
    pub idle_timeout_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteStepsRequest {
    pub steps: Vec<StepRequest>,
    #[serde(default, rename = "traceID")]
    pub trace_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    #[serde(rename = "snapshotID")]
    pub snapshot_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreatePoolRequest {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub tools: Option<Vec<ToolSource>>,
    #[serde(default)]
    pub resources: Option<ResourceSpec>,
    #[serde(default, rename = "workspaceDir")]
    pub workspace_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScalePoolRequest {
    pub replicas: i32,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub resources: Option<ResourceSpec>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NamespaceQuery {
    #[serde(default)]
    pub namespace: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/{id}", get(get_session).delete(delete_session))
        .route("/v1/sessions/{id}/execute", post(execute_steps))
        .route("/v1/sessions/{id}/restore", post(restore))
        .route("/v1/sessions/{id}/history", get(history))
        .route("/v1/sessions/{id}/trajectory", get(trajectory))
        .route("/v1/sessions/{id}/shell", get(shell::ws_handler))
        .route("/v1/pools", post(create_pool))
        .route(
            "/v1/pools/{name}",
            get(get_pool).patch(scale_pool).delete(delete_pool),
        )
        .with_state(state)
}

async fn create_session(
    State(runtime): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Response> {
    let info = runtime
        .create_session(
            &request.pool_ref,
            request.namespace.as_deref(),
            request.keep_alive,
            request.idle_timeout_seconds,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(info)).into_response())
}

async fn get_session(State(runtime): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    Ok(Json(runtime.get_session(&id)?).into_response())
}

async fn delete_session(
    State(runtime): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    runtime.delete_session(&id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn execute_steps(
    State(runtime): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExecuteStepsRequest>,
) -> Result<Response> {
    let response = runtime
        .execute_steps(&id, request.steps, request.trace_id)
        .await?;
    Ok(Json(response).into_response())
}

async fn restore(
    State(runtime): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RestoreRequest>,
) -> Result<Response> {
    runtime.restore(&id, &request.snapshot_id).await?;
    Ok(Json(serde_json::json!({ "status": "restored" })).into_response())
}

async fn history(State(runtime): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    Ok(Json(runtime.history(&id)?).into_response())
}

async fn trajectory(State(runtime): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    let body = runtime.export_trajectory(&id)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        body,
    )
        .into_response())
}

async fn create_pool(
    State(runtime): State<AppState>,
    Json(request): Json<CreatePoolRequest>,
) -> Result<Response> {
    let info = runtime
        .create_pool(
            &request.name,
            request.namespace.as_deref(),
            &request.image,
            request.replicas,
            request.tools,
            request.resources,
            request.workspace_dir,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(info)).into_response())
}

async fn get_pool(
    State(runtime): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> Result<Response> {
    Ok(Json(runtime.pool_info(query.namespace.as_deref(), &name).await?).into_response())
}

async fn scale_pool(
    State(runtime): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<ScalePoolRequest>,
) -> Result<Response> {
    runtime
        .scale_pool(
            request.namespace.as_deref(),
            &name,
            request.replicas,
            request.resources,
        )
        .await?;
    Ok(Json(runtime.pool_info(request.namespace.as_deref(), &name).await?).into_response())
}

async fn delete_pool(
    State(runtime): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> Result<Response> {
    runtime.delete_pool(query.namespace.as_deref(), &name).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Settings;
    use crate::crd::{PoolTemplate, WarmPool, WarmPoolSpec, WarmPoolStatus};
    use crate::gateway::backend::mock::MockBackend;
    use crate::gateway::sidecar_client::mock::MockSidecarClient;
    use crate::trajectory::{NoopSink, TrajectoryWriter};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn test_router() -> Router {
        let mut pool = WarmPool::new(
            "p1",
            WarmPoolSpec {
                replicas: 1,
                template: PoolTemplate {
                    image: "img".into(),
                    sidecar_image: None,
                    resources: None,
                    workspace_dir: None,
                    env: None,
                },
                tools: Vec::new(),
                image_locality: None,
            },
        );
        pool.status = Some(WarmPoolStatus {
            ready_replicas: 1,
            allocated_replicas: 0,
            conditions: Vec::new(),
        });
        let backend = Arc::new(MockBackend::new().with_pool("default", pool));
        let runtime = SessionRuntime::new(
            backend,
            Arc::new(MockSidecarClient::new()),
            Arc::new(ManualClock::new(chrono::Utc::now())),
            TrajectoryWriter::spawn(
                Arc::new(NoopSink),
                100,
                tokio::time::Duration::from_secs(10),
            ),
            Settings::default(),
        );
        router(Arc::new(runtime))
    }

    async fn request(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let router = test_router();
        let response = router
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn session_lifecycle_over_http() {
        let router = test_router();

        let (status, session) = request(
            &router,
            "POST",
            "/v1/sessions",
            Some(serde_json::json!({ "poolRef": "p1" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = session["id"].as_str().unwrap().to_string();
        assert_ne!(session["podIP"], "");

        let (status, body) = request(
            &router,
            "POST",
            &format!("/v1/sessions/{id}/execute"),
            Some(serde_json::json!({
                "steps": [{ "name": "e", "command": ["echo", "hi"] }]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"][0]["snapshot_id"], "0");
        assert_eq!(body["results"][0]["output"]["exit_code"], 0);
        assert_eq!(body["sessionID"], id.as_str());

        let (status, history) =
            request(&router, "GET", &format!("/v1/sessions/{id}/history"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history.as_array().unwrap().len(), 1);

        let (status, _) = request(&router, "DELETE", &format!("/v1/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn unknown_session_is_404_with_envelope() {
        let router = test_router();
        let (status, body) = request(&router, "GET", "/v1/sessions/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn bad_snapshot_id_is_400() {
        let router = test_router();
        let (_, session) = request(
            &router,
            "POST",
            "/v1/sessions",
            Some(serde_json::json!({ "poolRef": "p1" })),
        )
        .await;
        let id = session["id"].as_str().unwrap();

        let (status, body) = request(
            &router,
            "POST",
            &format!("/v1/sessions/{id}/restore"),
            Some(serde_json::json!({ "snapshotID": "not-a-number" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("snapshot"));
    }

    #[tokio::test]
    async fn missing_pool_ref_is_400() {
        let router = test_router();
        let (status, _) = request(
            &router,
            "POST",
            "/v1/sessions",
            Some(serde_json::json!({ "poolRef": "" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn pool_crud_over_http() {
        let router = test_router();

        let (status, _) = request(
            &router,
            "POST",
            "/v1/pools",
            Some(serde_json::json!({ "name": "p2", "image": "python:3.12", "replicas": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, pool) = request(&router, "GET", "/v1/pools/p2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pool["replicas"], 2);
        assert_eq!(pool["image"], "python:3.12");

        let (status, pool) = request(
            &router,
            "PATCH",
            "/v1/pools/p2",
            Some(serde_json::json!({ "replicas": 4 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pool["replicas"], 4);

        let (status, _) = request(&router, "DELETE", "/v1/pools/p2", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = request(&router, "GET", "/v1/pools/p2", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trajectory_is_ndjson() {
        let router = test_router();
        let (_, session) = request(
            &router,
            "POST",
            "/v1/sessions",
            Some(serde_json::json!({ "poolRef": "p1" })),
        )
        .await;
        let id = session["id"].as_str().unwrap();
        request(
            &router,
            "POST",
            &format!("/v1/sessions/{id}/execute"),
            Some(serde_json::json!({
                "steps": [{ "name": "e", "command": ["echo", "hi"] }]
            })),
        )
        .await;

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/sessions/{id}/trajectory"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-ndjson"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(text.lines().count(), 1);
    }
}
