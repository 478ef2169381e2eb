//! Forwarding completion and chat requests to the backend, with usage logging.

mod streaming;

use std::time::Instant;

use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::auth::Principal;
use crate::constants::{
    AUTOCOMPLETE_MAX_TOKENS, AUTOCOMPLETE_TEMPERATURE, CHAT_MAX_TOKENS, CHAT_TEMPERATURE,
};
use crate::error::GatewayError;
use crate::ollama::{
    BackendMessage, ChatRequest, GenerateRequest, GenerationOptions, OllamaClient,
};
use crate::registry::{Model, NewUsage, RequestType, UsageOutcome, UsageStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Backend model identifier; the default model when absent
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CompletionResponse {
    pub completion: String,
    pub model: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Stream NDJSON chunks instead of a single JSON reply
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatCompletionResponse {
    pub message: ChatMessage,
    pub model: String,
    pub usage: Usage,
}

/// Request value, then the model's stored parameter, then the built-in default
pub fn generation_options(
    model: &Model,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
    stop: Option<Vec<String>>,
    defaults: (u32, f64),
) -> GenerationOptions {
    let stored = model.parameters.clone().unwrap_or_default();
    GenerationOptions {
        temperature: Some(temperature.or(stored.temperature).unwrap_or(defaults.1)),
        top_p: stored.top_p,
        num_predict: Some(max_tokens.or(stored.max_tokens).unwrap_or(defaults.0)),
        stop: stop.filter(|s| !s.is_empty()),
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Runs inference on the backend and logs each call's usage
#[derive(Clone)]
pub struct InferenceService {
    ollama: OllamaClient,
    usage: UsageStore,
}

impl InferenceService {
    pub fn new(ollama: OllamaClient, usage: UsageStore) -> Self {
        Self { ollama, usage }
    }

    async fn record(
        &self,
        principal: &Principal,
        model: &Model,
        request_type: RequestType,
        usage: Usage,
        started: Instant,
        outcome: UsageOutcome,
    ) {
        record_usage(
            &self.usage,
            NewUsage {
                model_id: model.id.clone(),
                user_id: principal.user_id.clone(),
                request_type,
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                latency_ms: elapsed_ms(started),
                outcome,
            },
        )
        .await;
    }

    pub async fn complete(
        &self,
        principal: &Principal,
        model: &Model,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, GatewayError> {
        let started = Instant::now();
        let backend_request = GenerateRequest {
            model: model.model_id.clone(),
            prompt: request.prompt,
            stream: false,
            options: generation_options(
                model,
                request.max_tokens,
                request.temperature,
                request.stop_sequences,
                (AUTOCOMPLETE_MAX_TOKENS, AUTOCOMPLETE_TEMPERATURE),
            ),
        };

        match self.ollama.generate(&backend_request).await {
            Ok(reply) => {
                let usage = Usage::new(
                    reply.prompt_eval_count.unwrap_or(0),
                    reply.eval_count.unwrap_or(0),
                );
                self.record(
                    principal,
                    model,
                    RequestType::Completion,
                    usage,
                    started,
                    UsageOutcome::Success,
                )
                .await;
                info!(
                    "Completion on {} for {}: {} tokens",
                    model.model_id, principal.user_id, usage.total_tokens
                );
                Ok(CompletionResponse {
                    completion: reply.response,
                    model: model.model_id.clone(),
                    usage,
                })
            }
            Err(e) => {
                self.record(
                    principal,
                    model,
                    RequestType::Completion,
                    Usage::default(),
                    started,
                    UsageOutcome::Error,
                )
                .await;
                Err(e)
            }
        }
    }

    fn chat_request(model: &Model, request: &ChatCompletionRequest, stream: bool) -> ChatRequest {
        ChatRequest {
            model: model.model_id.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| BackendMessage {
                    role: m.role.clone(),
                    content: m.content.clone(),
                })
                .collect(),
            stream,
            options: generation_options(
                model,
                request.max_tokens,
                request.temperature,
                None,
                (CHAT_MAX_TOKENS, CHAT_TEMPERATURE),
            ),
        }
    }

    pub async fn chat(
        &self,
        principal: &Principal,
        model: &Model,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, GatewayError> {
        let started = Instant::now();
        let backend_request = Self::chat_request(model, &request, false);

        match self.ollama.chat(&backend_request).await {
            Ok(reply) => {
                let usage = Usage::new(
                    reply.prompt_eval_count.unwrap_or(0),
                    reply.eval_count.unwrap_or(0),
                );
                self.record(
                    principal,
                    model,
                    RequestType::Chat,
                    usage,
                    started,
                    UsageOutcome::Success,
                )
                .await;
                let message = reply.message.unwrap_or(BackendMessage {
                    role: "assistant".into(),
                    content: String::new(),
                });
                Ok(ChatCompletionResponse {
                    message: ChatMessage {
                        role: message.role,
                        content: message.content,
                    },
                    model: model.model_id.clone(),
                    usage,
                })
            }
            Err(e) => {
                self.record(
                    principal,
                    model,
                    RequestType::Chat,
                    Usage::default(),
                    started,
                    UsageOutcome::Error,
                )
                .await;
                Err(e)
            }
        }
    }

    /// Start a streaming chat. Usage is recorded once the stream finishes.
    pub async fn chat_stream(
        &self,
        principal: &Principal,
        model: &Model,
        request: ChatCompletionRequest,
    ) -> Result<
        impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static + use<>,
        GatewayError,
    > {
        let started = Instant::now();
        let backend_request = Self::chat_request(model, &request, true);

        let body = match self.ollama.chat_stream(&backend_request).await {
            Ok(body) => body,
            Err(e) => {
                self.record(
                    principal,
                    model,
                    RequestType::Chat,
                    Usage::default(),
                    started,
                    UsageOutcome::Error,
                )
                .await;
                return Err(e);
            }
        };

        Ok(streaming::ndjson_chat_stream(
            body,
            streaming::StreamContext {
                model_name: model.model_id.clone(),
                model_id: model.id.clone(),
                user_id: principal.user_id.clone(),
                usage: self.usage.clone(),
                started,
            },
        ))
    }
}

/// Append a usage record; failures are logged and swallowed
async fn record_usage(store: &UsageStore, usage: NewUsage) {
    if let Err(e) = store.record(usage).await {
        warn!("Failed to record usage: {e}");
    }
}
