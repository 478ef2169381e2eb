use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Not authenticated")]
    Unauthenticated,

    #[error("Could not validate credentials")]
    InvalidToken,

    #[error("Incorrect username or password")]
    InvalidCredentials,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("No default model configured")]
    NoDefaultModel,

    #[error("Ollama API error: {0}")]
    BackendError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthenticated
            | GatewayError::InvalidToken
            | GatewayError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NoDefaultModel => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BackendError(_) | GatewayError::NetworkError(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::DatabaseError(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to hand back to clients; storage and internal details stay in the logs
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::DatabaseError(_) | GatewayError::Internal(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("{self}");
        } else {
            tracing::debug!("Client error ({status}): {self}");
        }

        let body = Json(json!({ "error": self.user_message() }));
        match self {
            GatewayError::Unauthenticated
            | GatewayError::InvalidToken
            | GatewayError::InvalidCredentials => {
                (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}
