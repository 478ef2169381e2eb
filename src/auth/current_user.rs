use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts},
    http::{header, request::Parts},
};
use tracing::debug;

use super::{Principal, User};
use crate::AppState;
use crate::error::GatewayError;

/// The user behind the request's bearer token.
///
/// The user row is reloaded on every request so deactivation and admin
/// changes take effect before the token expires.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

impl CurrentUser {
    pub fn principal(&self) -> Principal {
        Principal::new(self.0.id.clone(), self.0.is_admin)
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(GatewayError::Unauthenticated)?;
        let claims = state.signer.verify(token)?;

        let Some(user) = state.users.get(&claims.user_id).await? else {
            debug!("Token for unknown user {}", claims.user_id);
            return Err(GatewayError::InvalidToken);
        };
        if !user.is_active {
            return Err(GatewayError::BadRequest("Inactive user".into()));
        }
        Ok(Self(user))
    }
}

impl OptionalFromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = GatewayError;

    /// `None` when no credentials were sent; invalid credentials still reject.
    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Option<Self>, Self::Rejection> {
        if !parts.headers.contains_key(header::AUTHORIZATION) {
            return Ok(None);
        }
        <Self as FromRequestParts<Arc<AppState>>>::from_request_parts(parts, state)
            .await
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_with(auth: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = auth {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(&parts_with(Some("Bearer abc"))), Some("abc"));
        assert_eq!(bearer_token(&parts_with(Some("bearer abc"))), Some("abc"));
        assert_eq!(bearer_token(&parts_with(Some("Basic abc"))), None);
        assert_eq!(bearer_token(&parts_with(Some("Bearer "))), None);
        assert_eq!(bearer_token(&parts_with(None)), None);
    }
}
