use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

use crate::AppState;
use crate::auth::{CurrentUser, require_admin, require_self_or_admin};
use crate::error::GatewayError;
use crate::registry::{
    ModelUsageStats, NewUsage, RequestType, UsageFilter, UsageOutcome, UsageRecord,
};
use crate::routes::ErrorResponse;

const DEFAULT_USAGE_LIMIT: u64 = 100;
const MAX_USAGE_LIMIT: u64 = 1000;

#[derive(Deserialize, ToSchema)]
pub struct RecordUsageRequest {
    /// Registry model ID
    pub model_id: String,
    /// Defaults to the caller; only admins may record for someone else
    #[serde(default)]
    pub user_id: Option<String>,
    pub request_type: RequestType,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    pub latency_ms: f64,
    pub outcome: UsageOutcome,
}

#[derive(Deserialize, IntoParams)]
pub struct UsageQuery {
    pub user_id: Option<String>,
    pub model_id: Option<String>,
    pub limit: Option<u64>,
}

/// Append a usage record
#[utoipa::path(
    post,
    path = "/usage",
    tag = "usage",
    request_body = RecordUsageRequest,
    responses(
        (status = 200, body = UsageRecord),
        (status = 400, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn record_usage(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Json(body): Json<RecordUsageRequest>,
) -> Result<Json<UsageRecord>, GatewayError> {
    let principal = current.principal();
    let user_id = body.user_id.unwrap_or_else(|| principal.user_id.clone());
    require_self_or_admin(&principal, &user_id)?;

    if !body.latency_ms.is_finite() || body.latency_ms < 0.0 {
        return Err(GatewayError::BadRequest(
            "Latency must be a non-negative number".into(),
        ));
    }
    if state.models.get(&body.model_id).await?.is_none() {
        return Err(GatewayError::NotFound("Model not found".into()));
    }

    let record = state
        .usage
        .record(NewUsage {
            model_id: body.model_id,
            user_id,
            request_type: body.request_type,
            prompt_tokens: body.prompt_tokens,
            completion_tokens: body.completion_tokens,
            latency_ms: body.latency_ms,
            outcome: body.outcome,
        })
        .await?;
    Ok(Json(record))
}

/// Recent usage records, newest first (admin)
#[utoipa::path(
    get,
    path = "/usage",
    tag = "usage",
    params(UsageQuery),
    responses(
        (status = 200, body = Vec<UsageRecord>),
        (status = 403, body = ErrorResponse),
    )
)]
pub async fn list_usage(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Vec<UsageRecord>>, GatewayError> {
    require_admin(&current.principal())?;
    let records = state
        .usage
        .list(UsageFilter {
            user_id: query.user_id,
            model_id: query.model_id,
            limit: query
                .limit
                .unwrap_or(DEFAULT_USAGE_LIMIT)
                .min(MAX_USAGE_LIMIT),
        })
        .await?;
    Ok(Json(records))
}

/// Per-model totals (admin)
#[utoipa::path(
    get,
    path = "/usage/stats",
    tag = "usage",
    responses(
        (status = 200, body = Vec<ModelUsageStats>),
        (status = 403, body = ErrorResponse),
    )
)]
pub async fn usage_stats(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
) -> Result<Json<Vec<ModelUsageStats>>, GatewayError> {
    require_admin(&current.principal())?;
    Ok(Json(state.usage.stats().await?))
}
