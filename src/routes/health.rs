use axum::{extract::State, response::Json};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::{AppState, BUILD_TIME, GIT_HASH, VERSION, timestamp_millis};

#[derive(Serialize, ToSchema)]
pub struct BackendHealth {
    pub url: String,
    pub reachable: bool,
    pub version: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    /// `healthy`, or `degraded` when the backend is unreachable
    pub status: String,
    pub timestamp: u64,
    pub backend: BackendHealth,
}

#[derive(Serialize, ToSchema)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Service status and backend reachability
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, body = HealthResponse))
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let version = state.ollama.version().await;
    let reachable = version.is_some();
    Json(HealthResponse {
        status: if reachable { "healthy" } else { "degraded" }.to_string(),
        timestamp: timestamp_millis(),
        backend: BackendHealth {
            url: state.ollama.base_url().to_string(),
            reachable,
            version,
        },
    })
}

#[utoipa::path(
    get,
    path = "/version",
    tag = "health",
    responses((status = 200, body = VersionResponse))
)]
pub async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: VERSION.to_string(),
        git_hash: GIT_HASH.to_string(),
        build_time: BUILD_TIME.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::build_app;
    use crate::test_utils::{send, test_state};

    #[tokio::test]
    async fn test_health_reports_backend() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "0.5.1"})))
            .mount(&server)
            .await;

        let (_dir, state) = test_state(&server.uri()).await;
        let (status, body) = send(&build_app(state), "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["backend"]["reachable"], true);
        assert_eq!(body["backend"]["version"], "0.5.1");
    }

    #[tokio::test]
    async fn test_health_degraded_when_backend_down() {
        let (_dir, state) = test_state("http://127.0.0.1:9").await;
        let (status, body) = send(&build_app(state), "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["backend"]["reachable"], false);
    }

    #[tokio::test]
    async fn test_version_and_openapi() {
        let (_dir, state) = test_state("http://127.0.0.1:9").await;
        let app = build_app(state);

        let (status, body) = send(&app, "GET", "/version", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

        let (status, doc) = send(&app, "GET", "/api-docs/openapi.json", None, None).await;
        assert_eq!(status, StatusCode::OK);
        let paths = doc["paths"].as_object().unwrap();
        for route in ["/auth/token", "/registry/models", "/autocomplete", "/chat", "/health"] {
            assert!(paths.contains_key(route), "missing {route}");
        }
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let (_dir, state) = test_state("http://127.0.0.1:9").await;
        let app = build_app(state);

        let request = Request::builder()
            .uri("/version")
            .header("x-request-id", "abc-123")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.headers()["x-request-id"], "abc-123");

        let request = Request::builder().uri("/version").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert!(response.headers().contains_key("x-request-id"));
    }
}
