use axum::{
    Json,
    extract::{Path, State},
};
use std::sync::Arc;
use tracing::info;

use crate::AppState;
use crate::auth::{CurrentUser, require_admin, require_self_or_admin};
use crate::error::GatewayError;
use crate::registry::{AccessGrant, GrantUpdate, NewGrant};
use crate::routes::{ErrorResponse, SuccessResponse};

/// Grant a user access to a model (admin)
#[utoipa::path(
    post,
    path = "/access",
    tag = "access",
    request_body = NewGrant,
    responses(
        (status = 200, body = AccessGrant),
        (status = 400, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn create_grant(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Json(body): Json<NewGrant>,
) -> Result<Json<AccessGrant>, GatewayError> {
    require_admin(&current.principal())?;
    if !state.users.exists(&body.user_id).await? {
        return Err(GatewayError::NotFound("User not found".into()));
    }
    let grant = state.grants.create(body).await?;
    info!(
        "Granted user {} access to model {}",
        grant.user_id, grant.model_id
    );
    Ok(Json(grant))
}

/// Update a grant (admin)
#[utoipa::path(
    put,
    path = "/access/{id}",
    tag = "access",
    params(("id" = String, Path, description = "Grant ID")),
    request_body = GrantUpdate,
    responses(
        (status = 200, body = AccessGrant),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn update_grant(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<String>,
    Json(body): Json<GrantUpdate>,
) -> Result<Json<AccessGrant>, GatewayError> {
    require_admin(&current.principal())?;
    state
        .grants
        .update(&id, body)
        .await?
        .map(Json)
        .ok_or_else(|| GatewayError::NotFound("Access control entry not found".into()))
}

/// Revoke a grant (admin)
#[utoipa::path(
    delete,
    path = "/access/{id}",
    tag = "access",
    params(("id" = String, Path, description = "Grant ID")),
    responses(
        (status = 200, body = SuccessResponse),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn delete_grant(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, GatewayError> {
    require_admin(&current.principal())?;
    if state.grants.delete(&id).await? {
        info!("Revoked grant {id}");
        Ok(Json(SuccessResponse { success: true }))
    } else {
        Err(GatewayError::NotFound(
            "Access control entry not found".into(),
        ))
    }
}

/// A user's grants (self or admin)
#[utoipa::path(
    get,
    path = "/access/user/{user_id}",
    tag = "access",
    params(("user_id" = String, Path, description = "User ID")),
    responses(
        (status = 200, body = Vec<AccessGrant>),
        (status = 403, body = ErrorResponse),
    )
)]
pub async fn list_user_grants(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<AccessGrant>>, GatewayError> {
    require_self_or_admin(&current.principal(), &user_id)?;
    Ok(Json(state.grants.list_for_user(&user_id).await?))
}

/// A model's grants (admin)
#[utoipa::path(
    get,
    path = "/access/model/{model_id}",
    tag = "access",
    params(("model_id" = String, Path, description = "Registry model ID")),
    responses(
        (status = 200, body = Vec<AccessGrant>),
        (status = 403, body = ErrorResponse),
    )
)]
pub async fn list_model_grants(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(model_id): Path<String>,
) -> Result<Json<Vec<AccessGrant>>, GatewayError> {
    require_admin(&current.principal())?;
    Ok(Json(state.grants.list_for_model(&model_id).await?))
}
