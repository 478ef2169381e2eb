use axum::{
    Json,
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::AppState;
use crate::auth::CurrentUser;
use crate::error::GatewayError;
use crate::inference::{
    ChatCompletionRequest, ChatCompletionResponse, CompletionRequest, CompletionResponse,
};
use crate::registry::Model;
use crate::routes::ErrorResponse;

/// A model as offered to inference clients
#[derive(Serialize, Deserialize, ToSchema)]
pub struct GatewayModel {
    /// Backend identifier to pass as `model_id`
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub context_length: u32,
    pub capabilities: Vec<String>,
    pub is_default: bool,
}

impl From<Model> for GatewayModel {
    fn from(m: Model) -> Self {
        Self {
            id: m.model_id,
            name: m.name,
            description: m.description,
            context_length: m.context_length,
            capabilities: m.capabilities,
            is_default: m.is_default,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct GatewayModelsResponse {
    pub models: Vec<GatewayModel>,
}

/// Complete a code prompt
#[utoipa::path(
    post,
    path = "/autocomplete",
    tag = "gateway",
    request_body = CompletionRequest,
    responses(
        (status = 200, body = CompletionResponse),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
        (status = 429, body = ErrorResponse),
        (status = 502, body = ErrorResponse),
        (status = 503, body = ErrorResponse),
    )
)]
pub async fn autocomplete(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Json(body): Json<CompletionRequest>,
) -> Result<Json<CompletionResponse>, GatewayError> {
    let principal = current.principal();
    let model = state
        .resolver
        .resolve(&principal, body.model_id.as_deref())
        .await?;
    Ok(Json(state.inference.complete(&principal, &model, body).await?))
}

/// Chat with a model. With `stream: true` the reply is NDJSON.
#[utoipa::path(
    post,
    path = "/chat",
    tag = "gateway",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, body = ChatCompletionResponse),
        (status = 400, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
        (status = 429, body = ErrorResponse),
        (status = 502, body = ErrorResponse),
        (status = 503, body = ErrorResponse),
    )
)]
pub async fn chat(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Json(body): Json<ChatCompletionRequest>,
) -> Result<Response, GatewayError> {
    if body.messages.is_empty() {
        return Err(GatewayError::BadRequest(
            "At least one message is required".into(),
        ));
    }

    let principal = current.principal();
    let model = state
        .resolver
        .resolve(&principal, body.model_id.as_deref())
        .await?;

    if body.stream {
        let stream = state.inference.chat_stream(&principal, &model, body).await?;
        Ok((
            [
                (header::CONTENT_TYPE, "application/x-ndjson"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            Body::from_stream(stream),
        )
            .into_response())
    } else {
        let reply = state.inference.chat(&principal, &model, body).await?;
        Ok(Json(reply).into_response())
    }
}

/// Models the caller may use
#[utoipa::path(
    get,
    path = "/models",
    tag = "gateway",
    responses(
        (status = 200, body = GatewayModelsResponse),
        (status = 401, body = ErrorResponse),
    )
)]
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
) -> Result<Json<GatewayModelsResponse>, GatewayError> {
    let models = state.resolver.selectable(&current.principal()).await?;
    Ok(Json(GatewayModelsResponse {
        models: models.into_iter().map(GatewayModel::from).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::build_app;
    use crate::registry::{NewGrant, NewModel, UsageFilter};
    use crate::test_utils::{
        new_model, send, test_config, test_state, test_state_with, user_with_token,
    };
    use crate::timestamp_millis;

    fn default_model(model_id: &str) -> NewModel {
        NewModel {
            is_default: true,
            ..new_model(model_id)
        }
    }

    fn grant(model_id: &str, user_id: &str) -> NewGrant {
        NewGrant {
            model_id: model_id.to_string(),
            user_id: user_id.to_string(),
            can_use: true,
            token_limit: None,
            expires_at: None,
        }
    }

    async fn mock_generate(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": "fn main() {}",
                "done": true,
                "prompt_eval_count": 5,
                "eval_count": 7
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_default_requires_grant_but_explicit_model_works() {
        let server = MockServer::start().await;
        mock_generate(&server).await;

        let (_dir, state) = test_state(&server.uri()).await;
        let (_, admin) = user_with_token(&state, "root").await;
        let (bob, bob_token) = user_with_token(&state, "bob").await;
        state.models.create(default_model("llama3.2:1b")).await.unwrap();
        let mistral = state.models.create(new_model("mistral:7b")).await.unwrap();
        state.grants.create(grant(&mistral.id, &bob.id)).await.unwrap();
        let app = build_app(state.clone());

        let (status, body) = send(
            &app,
            "POST",
            "/autocomplete",
            Some(&bob_token),
            Some(json!({"prompt": "fn main"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["error"].is_string());

        let (status, body) = send(
            &app,
            "POST",
            "/autocomplete",
            Some(&bob_token),
            Some(json!({"prompt": "fn main", "model_id": "mistral:7b"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["completion"], "fn main() {}");
        assert_eq!(body["model"], "mistral:7b");
        assert_eq!(body["usage"]["total_tokens"], 12);

        // Admins skip grants
        let (status, body) = send(
            &app,
            "POST",
            "/autocomplete",
            Some(&admin),
            Some(json!({"prompt": "fn main"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model"], "llama3.2:1b");

        let records = state
            .usage
            .list(UsageFilter {
                user_id: Some(bob.id.clone()),
                model_id: None,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].model_id, mistral.id);
        assert_eq!(records[0].total_tokens, 12);
    }

    #[tokio::test]
    async fn test_expired_grant_is_forbidden() {
        let server = MockServer::start().await;
        mock_generate(&server).await;

        let (_dir, state) = test_state(&server.uri()).await;
        let _ = user_with_token(&state, "root").await;
        let (bob, bob_token) = user_with_token(&state, "bob").await;
        let mistral = state.models.create(new_model("mistral:7b")).await.unwrap();
        state
            .grants
            .create(NewGrant {
                expires_at: Some(timestamp_millis() - 1000),
                ..grant(&mistral.id, &bob.id)
            })
            .await
            .unwrap();
        let app = build_app(state);

        let (status, _) = send(
            &app,
            "POST",
            "/autocomplete",
            Some(&bob_token),
            Some(json!({"prompt": "x", "model_id": "mistral:7b"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unknown_model_and_missing_default() {
        let (_dir, state) = test_state("http://127.0.0.1:9").await;
        let (_, admin) = user_with_token(&state, "root").await;
        let app = build_app(state);

        let (status, _) = send(
            &app,
            "POST",
            "/autocomplete",
            Some(&admin),
            Some(json!({"prompt": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = send(
            &app,
            "POST",
            "/autocomplete",
            Some(&admin),
            Some(json!({"prompt": "x", "model_id": "nope:1b"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(
            &app,
            "POST",
            "/autocomplete",
            None,
            Some(json!({"prompt": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_backend_failure_is_bad_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let (_dir, state) = test_state(&server.uri()).await;
        let (_, admin) = user_with_token(&state, "root").await;
        state.models.create(default_model("llama3.2:1b")).await.unwrap();
        let app = build_app(state);

        let (status, _) = send(
            &app,
            "POST",
            "/chat",
            Some(&admin),
            Some(json!({"messages": [{"role": "user", "content": "hi"}]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let (status, _) = send(
            &app,
            "POST",
            "/chat",
            Some(&admin),
            Some(json!({"messages": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_chat_forwards_messages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({"model": "llama3.2:1b", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "hello"},
                "done": true,
                "prompt_eval_count": 3,
                "eval_count": 1
            })))
            .mount(&server)
            .await;

        let (_dir, state) = test_state(&server.uri()).await;
        let (_, admin) = user_with_token(&state, "root").await;
        state.models.create(default_model("llama3.2:1b")).await.unwrap();
        let app = build_app(state);

        let (status, body) = send(
            &app,
            "POST",
            "/chat",
            Some(&admin),
            Some(json!({"messages": [{"role": "user", "content": "hi"}]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"]["content"], "hello");
        assert_eq!(body["usage"]["total_tokens"], 4);
    }

    #[tokio::test]
    async fn test_chat_stream_ndjson() {
        let server = MockServer::start().await;
        let ndjson = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"prompt_eval_count\":2,\"eval_count\":2}\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(ndjson, "application/x-ndjson"),
            )
            .mount(&server)
            .await;

        let (_dir, state) = test_state(&server.uri()).await;
        let (_, admin) = user_with_token(&state, "root").await;
        state.models.create(default_model("llama3.2:1b")).await.unwrap();
        let app = build_app(state);

        let request = Request::builder()
            .method("POST")
            .uri("/chat")
            .header(header::AUTHORIZATION, format!("Bearer {admin}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"messages": [{"role": "user", "content": "hi"}], "stream": true})
                    .to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-ndjson"
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let lines: Vec<Value> = std::str::from_utf8(&bytes)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["delta"], "Hel");
        assert_eq!(lines[1]["done"], false);
        assert_eq!(lines[2]["done"], true);
        assert_eq!(lines[2]["model"], "llama3.2:1b");
        assert_eq!(lines[2]["usage"]["total_tokens"], 4);
    }

    #[tokio::test]
    async fn test_list_models_per_caller() {
        let (_dir, state) = test_state("http://127.0.0.1:9").await;
        let (_, admin) = user_with_token(&state, "root").await;
        let (bob, bob_token) = user_with_token(&state, "bob").await;
        state.models.create(default_model("llama3.2:1b")).await.unwrap();
        let mistral = state.models.create(new_model("mistral:7b")).await.unwrap();
        state
            .models
            .create(NewModel {
                is_active: false,
                ..new_model("old:1b")
            })
            .await
            .unwrap();
        state.grants.create(grant(&mistral.id, &bob.id)).await.unwrap();
        let app = build_app(state);

        let (status, body) = send(&app, "GET", "/models", Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["models"].as_array().unwrap().len(), 2);

        let (_, body) = send(&app, "GET", "/models", Some(&bob_token), None).await;
        let models = body["models"].as_array().unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0]["id"], "mistral:7b");
        assert_eq!(models[0]["is_default"], false);
    }

    #[tokio::test]
    async fn test_zero_concurrency_still_serves() {
        let server = MockServer::start().await;
        mock_generate(&server).await;

        let mut config = test_config(&server.uri());
        config.max_concurrent_inference = 0;
        let (_dir, state) = test_state_with(config).await;
        let (_, admin) = user_with_token(&state, "root").await;
        state.models.create(default_model("llama3.2:1b")).await.unwrap();
        let app = build_app(state);

        let request = send(
            &app,
            "POST",
            "/autocomplete",
            Some(&admin),
            Some(json!({"prompt": "x"})),
        );
        let (status, _) = tokio::time::timeout(std::time::Duration::from_secs(5), request)
            .await
            .expect("inference routes must not block with a zero limit");
        assert_eq!(status, StatusCode::OK);
    }
}
