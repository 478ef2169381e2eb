use axum::{
    Form, Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use super::{
    ErrorResponse, SuccessResponse, validate_email, validate_password, validate_username,
};
use crate::AppState;
use crate::auth::{
    CurrentUser, NewUser, User, UserUpdate, require_admin, require_self_or_admin,
};
use crate::error::GatewayError;

// --- Types ---

#[derive(Deserialize, ToSchema)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub user_id: String,
    pub username: String,
    pub is_admin: bool,
}

#[derive(Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub password: Option<String>,
    /// Admin only
    pub is_active: Option<bool>,
    /// Admin only
    pub is_admin: Option<bool>,
}

#[derive(Deserialize, IntoParams)]
pub struct Pagination {
    #[serde(default)]
    pub skip: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
}

const DEFAULT_PAGE_SIZE: u64 = 100;

// --- Handlers ---

/// Exchange username and password for a bearer token
#[utoipa::path(
    post,
    path = "/token",
    tag = "auth",
    request_body(content = LoginForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, body = TokenResponse),
        (status = 400, body = ErrorResponse),
        (status = 401, body = ErrorResponse),
    )
)]
pub async fn login(
    State(state): State<Arc<AppState>>,
    Form(form): Form<LoginForm>,
) -> Result<Json<TokenResponse>, GatewayError> {
    let user = state
        .users
        .authenticate(&form.username, &form.password)
        .await?
        .ok_or(GatewayError::InvalidCredentials)?;
    if !user.is_active {
        return Err(GatewayError::BadRequest("Inactive user".into()));
    }

    let access_token = state.signer.issue(&user)?;
    info!("User {} logged in", user.username);
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer".into(),
        user_id: user.id,
        username: user.username,
        is_admin: user.is_admin,
    }))
}

/// Register a user. The first user becomes an admin.
#[utoipa::path(
    post,
    path = "/users",
    tag = "auth",
    request_body = RegisterRequest,
    responses(
        (status = 200, body = User),
        (status = 400, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
    )
)]
pub async fn register(
    State(state): State<Arc<AppState>>,
    caller: Option<CurrentUser>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<User>, GatewayError> {
    if !state.config.open_registration && state.users.count().await? > 0 {
        let caller = caller.ok_or(GatewayError::Unauthenticated)?;
        require_admin(&caller.principal())?;
    }

    let username = body.username.trim();
    let email = body.email.trim();
    validate_username(username).map_err(|e| GatewayError::BadRequest(e.into()))?;
    validate_email(email).map_err(|e| GatewayError::BadRequest(e.into()))?;
    validate_password(&body.password).map_err(|e| GatewayError::BadRequest(e.into()))?;

    let user = state
        .users
        .create(NewUser {
            email: email.to_string(),
            username: username.to_string(),
            password: body.password,
            full_name: body.full_name.filter(|n| !n.trim().is_empty()),
        })
        .await?;
    info!(
        "Registered user {} ({})",
        user.username,
        if user.is_admin { "admin" } else { "user" }
    );
    Ok(Json(user))
}

/// The authenticated user
#[utoipa::path(
    get,
    path = "/users/me",
    tag = "auth",
    responses(
        (status = 200, body = User),
        (status = 401, body = ErrorResponse),
    )
)]
pub async fn me(current: CurrentUser) -> Json<User> {
    Json(current.0)
}

/// List users (admin)
#[utoipa::path(
    get,
    path = "/users",
    tag = "auth",
    params(Pagination),
    responses(
        (status = 200, body = Vec<User>),
        (status = 403, body = ErrorResponse),
    )
)]
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<User>>, GatewayError> {
    require_admin(&current.principal())?;
    let users = state
        .users
        .list(
            page.skip.unwrap_or(0),
            page.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;
    Ok(Json(users))
}

/// Get a user (self or admin)
#[utoipa::path(
    get,
    path = "/users/{id}",
    tag = "auth",
    params(("id" = String, Path, description = "User ID")),
    responses(
        (status = 200, body = User),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<User>, GatewayError> {
    require_self_or_admin(&current.principal(), &id)?;
    state
        .users
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| GatewayError::NotFound("User not found".into()))
}

/// Update a user (self or admin; only admins change flags)
#[utoipa::path(
    put,
    path = "/users/{id}",
    tag = "auth",
    params(("id" = String, Path, description = "User ID")),
    request_body = UpdateUserRequest,
    responses(
        (status = 200, body = User),
        (status = 400, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn update_user(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<String>,
    Json(body): Json<UpdateUserRequest>,
) -> Result<Json<User>, GatewayError> {
    let principal = current.principal();
    require_self_or_admin(&principal, &id)?;
    if body.is_admin.is_some() || body.is_active.is_some() {
        require_admin(&principal)?;
    }

    let email = body.email.as_deref().map(str::trim);
    if let Some(email) = email {
        validate_email(email).map_err(|e| GatewayError::BadRequest(e.into()))?;
    }
    if let Some(password) = &body.password {
        validate_password(password).map_err(|e| GatewayError::BadRequest(e.into()))?;
    }

    state
        .users
        .update(
            &id,
            UserUpdate {
                email: email.map(str::to_string),
                full_name: body.full_name,
                password: body.password,
                is_active: body.is_active,
                is_admin: body.is_admin,
            },
        )
        .await?
        .map(Json)
        .ok_or_else(|| GatewayError::NotFound("User not found".into()))
}

/// Delete a user (admin; not yourself)
#[utoipa::path(
    delete,
    path = "/users/{id}",
    tag = "auth",
    params(("id" = String, Path, description = "User ID")),
    responses(
        (status = 200, body = SuccessResponse),
        (status = 400, body = ErrorResponse),
        (status = 403, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, GatewayError> {
    let principal = current.principal();
    require_admin(&principal)?;
    if principal.user_id == id {
        return Err(GatewayError::BadRequest(
            "Cannot delete your own account".into(),
        ));
    }
    if state.users.delete(&id).await? {
        info!("Deleted user {id}");
        Ok(Json(SuccessResponse { success: true }))
    } else {
        Err(GatewayError::NotFound("User not found".into()))
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use serde_json::json;
    use tower::ServiceExt;

    use crate::build_app;
    use crate::test_utils::{send, test_config, test_state, test_state_with, user_with_token};

    #[tokio::test]
    async fn test_register_and_login() {
        let (_dir, state) = test_state("http://127.0.0.1:9").await;
        let app = build_app(state);

        let (status, body) = send(
            &app,
            "POST",
            "/auth/users",
            None,
            Some(json!({"email": "ada@example.com", "username": "ada", "password": "password123"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_admin"], true);
        assert!(body.get("password_hash").is_none());

        let request = Request::builder()
            .method("POST")
            .uri("/auth/token")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("username=ada&password=password123"))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let token: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(token["token_type"], "bearer");
        assert_eq!(token["username"], "ada");

        let access_token = token["access_token"].as_str().unwrap();
        let (status, me) = send(&app, "GET", "/auth/users/me", Some(access_token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["username"], "ada");
    }

    #[tokio::test]
    async fn test_login_rejects_bad_password() {
        let (_dir, state) = test_state("http://127.0.0.1:9").await;
        user_with_token(&state, "ada").await;
        let app = build_app(state);

        let request = Request::builder()
            .method("POST")
            .uri("/auth/token")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("username=ada&password=wrong"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }

    #[tokio::test]
    async fn test_register_validation_and_duplicates() {
        let (_dir, state) = test_state("http://127.0.0.1:9").await;
        user_with_token(&state, "ada").await;
        let app = build_app(state);

        let (status, body) = send(
            &app,
            "POST",
            "/auth/users",
            None,
            Some(json!({
                "email": "other@example.com",
                "username": "ada",
                "password": "password123"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Username already registered");

        let (status, _) = send(
            &app,
            "POST",
            "/auth/users",
            None,
            Some(json!({"email": "bob@example.com", "username": "bob", "password": "short"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_closed_registration_requires_admin() {
        let mut config = test_config("http://127.0.0.1:9");
        config.open_registration = false;
        let (_dir, state) = test_state_with(config).await;
        let (_, admin_token) = user_with_token(&state, "root").await;
        let (_, user_token) = user_with_token(&state, "bob").await;
        let app = build_app(state);

        let body = json!({
            "email": "eve@example.com",
            "username": "eve",
            "password": "password123"
        });
        let (status, _) = send(&app, "POST", "/auth/users", None, Some(body.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) =
            send(&app, "POST", "/auth/users", Some(&user_token), Some(body.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, created) =
            send(&app, "POST", "/auth/users", Some(&admin_token), Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["is_admin"], false);
    }

    #[tokio::test]
    async fn test_user_permissions() {
        let (_dir, state) = test_state("http://127.0.0.1:9").await;
        let (admin, admin_token) = user_with_token(&state, "root").await;
        let (bob, bob_token) = user_with_token(&state, "bob").await;
        let app = build_app(state);

        let (status, _) = send(&app, "GET", "/auth/users", Some(&bob_token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, users) = send(
            &app,
            "GET",
            "/auth/users?limit=1",
            Some(&admin_token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(users.as_array().unwrap().len(), 1);

        let admin_uri = format!("/auth/users/{}", admin.id);
        let bob_uri = format!("/auth/users/{}", bob.id);
        let (status, _) = send(&app, "GET", &admin_uri, Some(&bob_token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = send(&app, "GET", &bob_uri, Some(&bob_token), None).await;
        assert_eq!(status, StatusCode::OK);

        // Only admins can change flags
        let (status, _) = send(
            &app,
            "PUT",
            &bob_uri,
            Some(&bob_token),
            Some(json!({"is_admin": true})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, updated) = send(
            &app,
            "PUT",
            &bob_uri,
            Some(&bob_token),
            Some(json!({"full_name": "Bob Builder"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["full_name"], "Bob Builder");

        let (status, _) = send(&app, "DELETE", &admin_uri, Some(&admin_token), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, "DELETE", &bob_uri, Some(&bob_token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = send(&app, "DELETE", &bob_uri, Some(&admin_token), None).await;
        assert_eq!(status, StatusCode::OK);

        // A deleted user's token no longer works
        let (status, _) = send(&app, "GET", "/auth/users/me", Some(&bob_token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_inactive_user_rejected() {
        let (_dir, state) = test_state("http://127.0.0.1:9").await;
        let (_, admin_token) = user_with_token(&state, "root").await;
        let (bob, bob_token) = user_with_token(&state, "bob").await;
        let app = build_app(state);

        let (status, _) = send(
            &app,
            "PUT",
            &format!("/auth/users/{}", bob.id),
            Some(&admin_token),
            Some(json!({"is_active": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, "GET", "/auth/users/me", Some(&bob_token), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Inactive user");
    }

    #[tokio::test]
    async fn test_missing_or_bad_token() {
        let (_dir, state) = test_state("http://127.0.0.1:9").await;
        let app = build_app(state);
        let (status, _) = send(&app, "GET", "/auth/users/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(&app, "GET", "/auth/users/me", Some("garbage"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
