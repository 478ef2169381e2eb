use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crate::AppState;
use crate::auth::{NewUser, User};
use crate::config::{Config, CorsMode};
use crate::constants::OLLAMA_PROVIDER;
use crate::db::Db;
use crate::registry::NewModel;

/// A fresh database in its own temp directory. Keep the `TempDir` alive.
pub async fn test_db() -> (TempDir, Db) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&dir.path().join("test.db")).await.unwrap();
    (dir, db)
}

/// An active, non-default Ollama model named after its backend id
pub fn new_model(model_id: &str) -> NewModel {
    NewModel {
        name: model_id.to_string(),
        model_id: model_id.to_string(),
        provider: OLLAMA_PROVIDER.to_string(),
        description: None,
        context_length: 4096,
        capabilities: vec!["chat".to_string()],
        parameters: None,
        is_active: true,
        is_default: false,
    }
}

pub fn test_config(ollama_url: &str) -> Config {
    Config {
        host: "127.0.0.1".into(),
        port: 0,
        db_path: "unused.db".into(),
        ollama_url: ollama_url.to_string(),
        ollama_timeout: Duration::from_secs(5),
        max_concurrent_inference: 4,
        cors_mode: CorsMode::LocalhostOnly,
        token_ttl: Duration::from_secs(1800),
        jwt_secret: Some("test-secret".into()),
        open_registration: true,
    }
}

pub async fn test_state_with(config: Config) -> (TempDir, Arc<AppState>) {
    let (dir, db) = test_db().await;
    let state = AppState::new(config, db).unwrap();
    (dir, Arc::new(state))
}

pub async fn test_state(ollama_url: &str) -> (TempDir, Arc<AppState>) {
    test_state_with(test_config(ollama_url)).await
}

/// Create a user and return it with a bearer token.
///
/// The first user created in a database is an admin.
pub async fn user_with_token(state: &AppState, username: &str) -> (User, String) {
    let user = state
        .users
        .create(NewUser {
            email: format!("{username}@example.com"),
            username: username.to_string(),
            password: "password123".into(),
            full_name: None,
        })
        .await
        .unwrap();
    let token = state.signer.issue(&user).unwrap();
    (user, token)
}

/// Send a request through the router; returns the status and the JSON body
/// (`Value::Null` for an empty or non-JSON body).
pub async fn send(
    app: &axum::Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
) -> (axum::http::StatusCode, serde_json::Value) {
    use axum::body::Body;
    use axum::http::{Request, header};
    use tower::ServiceExt;

    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value)
}
