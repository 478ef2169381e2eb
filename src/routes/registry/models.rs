use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use crate::AppState;
use crate::auth::{CurrentUser, require_admin};
use crate::constants::OLLAMA_PROVIDER;
use crate::error::GatewayError;
use crate::registry::{Model, ModelUpdate, NewModel};
use crate::routes::{ErrorResponse, SuccessResponse, validate_display_name, validate_model_id};

// --- Types ---

#[derive(Deserialize, IntoParams)]
pub struct ListModelsQuery {
    /// Only active models; non-admins always get active models only
    #[serde(default)]
    pub active_only: bool,
}

#[derive(Serialize, ToSchema)]
pub struct SyncModelsResponse {
    /// Backend identifiers registered by this sync
    pub created: Vec<String>,
    /// Full registry after the sync
    pub models: Vec<Model>,
}

fn bad_request(e: &str) -> GatewayError {
    GatewayError::BadRequest(e.into())
}

// --- Handlers ---

/// List registered models
#[utoipa::path(
    get,
    path = "/models",
    tag = "registry",
    params(ListModelsQuery),
    responses(
        (status = 200, body = Vec<Model>),
        (status = 401, body = ErrorResponse),
    )
)]
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Query(query): Query<ListModelsQuery>,
) -> Result<Json<Vec<Model>>, GatewayError> {
    let active_only = query.active_only || !current.0.is_admin;
    Ok(Json(state.models.list(active_only).await?))
}

/// Get one model
#[utoipa::path(
    get,
    path = "/models/{id}",
    tag = "registry",
    params(("id" = String, Path, description = "Registry model ID")),
    responses(
        (status = 200, body = Model),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn get_model(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<Model>, GatewayError> {
    state
        .models
        .get(&id)
        .await?
        .filter(|m| m.is_active || current.0.is_admin)
        .map(Json)
        .ok_or_else(|| GatewayError::NotFound("Model not found".into()))
}

/// Register a model (admin)
#[utoipa::path(
    post,
    path = "/models",
    tag = "registry",
    request_body = NewModel,
    responses(
        (status = 200, body = Model),
        (status = 400, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
    )
)]
pub async fn create_model(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Json(mut body): Json<NewModel>,
) -> Result<Json<Model>, GatewayError> {
    require_admin(&current.principal())?;
    body.model_id = body.model_id.trim().to_string();
    body.name = body.name.trim().to_string();
    body.provider = body.provider.trim().to_string();
    validate_model_id(&body.model_id).map_err(bad_request)?;
    validate_display_name(&body.name).map_err(bad_request)?;
    if body.provider.is_empty() {
        return Err(bad_request("Provider cannot be empty"));
    }

    let model = state.models.create(body).await?;
    info!(
        "Registered model {} ({}){}",
        model.model_id,
        model.id,
        if model.is_default { " as default" } else { "" }
    );
    Ok(Json(model))
}

/// Update a model (admin)
#[utoipa::path(
    put,
    path = "/models/{id}",
    tag = "registry",
    params(("id" = String, Path, description = "Registry model ID")),
    request_body = ModelUpdate,
    responses(
        (status = 200, body = Model),
        (status = 400, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn update_model(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<String>,
    Json(mut body): Json<ModelUpdate>,
) -> Result<Json<Model>, GatewayError> {
    require_admin(&current.principal())?;
    if let Some(name) = body.name.as_mut() {
        *name = name.trim().to_string();
        validate_display_name(name).map_err(bad_request)?;
    }

    state
        .models
        .update(&id, body)
        .await?
        .map(Json)
        .ok_or_else(|| GatewayError::NotFound("Model not found".into()))
}

/// Delete a model (admin). Refused while grants or usage reference it.
#[utoipa::path(
    delete,
    path = "/models/{id}",
    tag = "registry",
    params(("id" = String, Path, description = "Registry model ID")),
    responses(
        (status = 200, body = SuccessResponse),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
        (status = 409, body = ErrorResponse),
    )
)]
pub async fn delete_model(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, GatewayError> {
    require_admin(&current.principal())?;
    if state.models.delete(&id).await? {
        info!("Deleted model {id}");
        Ok(Json(SuccessResponse { success: true }))
    } else {
        Err(GatewayError::NotFound("Model not found".into()))
    }
}

/// Make a model the default (admin)
#[utoipa::path(
    post,
    path = "/models/{id}/default",
    tag = "registry",
    params(("id" = String, Path, description = "Registry model ID")),
    responses(
        (status = 200, body = Model),
        (status = 400, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn set_default_model(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<Model>, GatewayError> {
    require_admin(&current.principal())?;
    let model = state.models.set_default(&id).await?;
    info!("Default model is now {}", model.model_id);
    Ok(Json(model))
}

/// Register models installed on the Ollama backend (admin)
#[utoipa::path(
    get,
    path = "/models/sync/ollama",
    tag = "registry",
    responses(
        (status = 200, body = SyncModelsResponse),
        (status = 403, body = ErrorResponse),
        (status = 502, body = ErrorResponse),
    )
)]
pub async fn sync_ollama_models(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
) -> Result<Json<SyncModelsResponse>, GatewayError> {
    require_admin(&current.principal())?;
    let backend_ids: Vec<String> = state
        .ollama
        .list_models()
        .await?
        .into_iter()
        .map(|m| m.name)
        .filter(|name| validate_model_id(name).is_ok())
        .collect();

    let created = state.models.sync(OLLAMA_PROVIDER, &backend_ids).await?;
    info!(
        "Synced {} backend models, {} new",
        backend_ids.len(),
        created.len()
    );
    Ok(Json(SyncModelsResponse {
        created,
        models: state.models.list(false).await?,
    }))
}

/// The active default model
#[utoipa::path(
    get,
    path = "/default-model",
    tag = "registry",
    responses(
        (status = 200, body = Model),
        (status = 503, body = ErrorResponse),
    )
)]
pub async fn get_default_model(
    State(state): State<Arc<AppState>>,
    _current: CurrentUser,
) -> Result<Json<Model>, GatewayError> {
    state
        .models
        .get_default()
        .await?
        .filter(|m| m.is_active)
        .map(Json)
        .ok_or(GatewayError::NoDefaultModel)
}
