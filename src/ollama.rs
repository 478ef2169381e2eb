//! HTTP client for the Ollama inference backend.

use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GatewayError;

/// Response from `/api/tags`
#[derive(Debug, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<BackendModel>,
}

/// A model installed on the backend
#[derive(Debug, Clone, Deserialize)]
pub struct BackendModel {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// Request body for `/api/generate`
#[derive(Debug, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub stream: bool,
    pub options: GenerationOptions,
}

/// Non-streaming response from `/api/generate`
#[derive(Debug, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
    #[serde(default)]
    pub eval_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendMessage {
    pub role: String,
    pub content: String,
}

/// Request body for `/api/chat`
#[derive(Debug, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<BackendMessage>,
    pub stream: bool,
    pub options: GenerationOptions,
}

/// A `/api/chat` response, or one NDJSON line of a streamed one
#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    pub message: Option<BackendMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
    #[serde(default)]
    pub eval_count: Option<u64>,
}

#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    http: Client,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn list_models(&self) -> Result<Vec<BackendModel>, GatewayError> {
        let response = self.http.get(self.url("/api/tags")).send().await?;
        let tags: TagsResponse = check_status(response).await?.json().await.map_err(|e| {
            GatewayError::BackendError(format!("Invalid model list from Ollama: {e}"))
        })?;
        Ok(tags.models)
    }

    pub async fn generate(
        &self,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, GatewayError> {
        let response = self
            .http
            .post(self.url("/api/generate"))
            .json(request)
            .send()
            .await?;
        check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::BackendError(format!("Invalid completion from Ollama: {e}")))
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, GatewayError> {
        let response = self
            .http
            .post(self.url("/api/chat"))
            .json(request)
            .send()
            .await?;
        check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::BackendError(format!("Invalid chat reply from Ollama: {e}")))
    }

    /// Start a streaming chat. Yields the raw NDJSON body.
    pub async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<
        impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static + use<>,
        GatewayError,
    > {
        let response = self
            .http
            .post(self.url("/api/chat"))
            .json(request)
            .send()
            .await?;
        Ok(check_status(response).await?.bytes_stream())
    }

    /// Backend version, or `None` when it can't be reached
    pub async fn version(&self) -> Option<String> {
        #[derive(Deserialize)]
        struct VersionResponse {
            version: String,
        }

        let response = match self.http.get(self.url("/api/version")).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!("Ollama version check returned {}", r.status());
                return None;
            }
            Err(e) => {
                debug!("Ollama unreachable: {e}");
                return None;
            }
        };
        response
            .json::<VersionResponse>()
            .await
            .ok()
            .map(|v| v.version)
    }
}

async fn check_status(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        return Err(GatewayError::NotFound(format!(
            "Model not available on the backend: {body}"
        )));
    }
    Err(GatewayError::BackendError(format!(
        "Ollama returned {status}: {body}"
    )))
}
