pub mod auth;
pub mod gateway;
pub mod health;
pub mod registry;

use serde::Serialize;
use utoipa::ToSchema;

// --- Shared response types ---

#[derive(Serialize, ToSchema)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

// --- Validation helpers ---

const MAX_MODEL_ID_LENGTH: usize = 100;

pub(crate) fn validate_model_id(id: &str) -> Result<(), &'static str> {
    let id = id.trim();
    if id.is_empty() {
        return Err("Model ID cannot be empty");
    }
    if id.len() > MAX_MODEL_ID_LENGTH {
        return Err("Model ID too long (max 100 characters)");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-' | '/'))
    {
        return Err(
            "Model ID can only contain letters, digits, dots, underscores, colons, hyphens, and slashes",
        );
    }
    Ok(())
}

const MAX_NAME_LENGTH: usize = 100;

pub(crate) fn validate_display_name(name: &str) -> Result<(), &'static str> {
    let name = name.trim();
    if name.is_empty() {
        return Err("Name cannot be empty");
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err("Name too long (max 100 characters)");
    }
    if name.chars().any(|c| c.is_control()) {
        return Err("Name cannot contain control characters");
    }
    Ok(())
}

const MIN_USERNAME_LENGTH: usize = 3;
const MAX_USERNAME_LENGTH: usize = 50;

pub(crate) fn validate_username(username: &str) -> Result<(), &'static str> {
    if username.len() < MIN_USERNAME_LENGTH {
        return Err("Username too short (min 3 characters)");
    }
    if username.len() > MAX_USERNAME_LENGTH {
        return Err("Username too long (max 50 characters)");
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err("Username can only contain letters, digits, dots, underscores, and hyphens");
    }
    Ok(())
}

pub(crate) fn validate_email(email: &str) -> Result<(), &'static str> {
    let Some((local, domain)) = email.split_once('@') else {
        return Err("Invalid email address");
    };
    if local.is_empty()
        || domain.is_empty()
        || !domain.contains('.')
        || domain.starts_with('.')
        || domain.ends_with('.')
        || email.chars().any(|c| c.is_whitespace())
    {
        return Err("Invalid email address");
    }
    Ok(())
}

const MIN_PASSWORD_LENGTH: usize = 8;

pub(crate) fn validate_password(password: &str) -> Result<(), &'static str> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err("Password too short (min 8 characters)");
    }
    Ok(())
}
