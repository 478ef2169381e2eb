//! Bearer token (JWT) creation and verification.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use super::User;
use crate::error::GatewayError;

/// JWT claims carried by every bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Username
    pub sub: String,
    pub user_id: String,
    pub is_admin: bool,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and verifies HS256 bearer tokens
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    /// Signer with a random per-process secret. Tokens die with the process.
    pub fn ephemeral(ttl: Duration) -> Self {
        let secret = format!(
            "{:032x}{:032x}",
            rand::random::<u128>(),
            rand::random::<u128>()
        );
        Self::new(&secret, ttl)
    }

    pub fn issue(&self, user: &User) -> Result<String, GatewayError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user.username.clone(),
            user_id: user.id.clone(),
            is_admin: user.is_admin,
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| GatewayError::Internal(format!("Failed to create token: {e}")))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, GatewayError> {
        use jsonwebtoken::errors::ErrorKind;

        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidEcdsaKey
                | ErrorKind::InvalidRsaKey(_)
                | ErrorKind::RsaFailedSigning
                | ErrorKind::InvalidKeyFormat
                | ErrorKind::Crypto(_) => {
                    GatewayError::Internal(format!("Token verification failed: {e}"))
                }
                _ => GatewayError::InvalidToken,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(is_admin: bool) -> User {
        User {
            id: "user-1".into(),
            email: "dev@example.com".into(),
            username: "dev".into(),
            full_name: None,
            is_active: true,
            is_admin,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let signer = TokenSigner::new("test-secret", Duration::from_secs(1800));
        let token = signer.issue(&user(true)).unwrap();
        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.sub, "dev");
        assert_eq!(claims.user_id, "user-1");
        assert!(claims.is_admin);
        assert_eq!(claims.exp - claims.iat, 1800);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = TokenSigner::new("one", Duration::from_secs(60))
            .issue(&user(false))
            .unwrap();
        let result = TokenSigner::new("two", Duration::from_secs(60)).verify(&token);
        assert!(matches!(result, Err(GatewayError::InvalidToken)));
    }

    #[test]
    fn test_expired_token_rejected() {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "dev".into(),
            user_id: "user-1".into(),
            is_admin: false,
            iat: now - 7200,
            exp: now - 3600,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        let result = TokenSigner::new("secret", Duration::from_secs(60)).verify(&token);
        assert!(matches!(result, Err(GatewayError::InvalidToken)));
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        let signer = TokenSigner::ephemeral(Duration::from_secs(60));
        for token in ["", "invalid", "not.a.token", "too.many.parts.in.token"] {
            assert!(
                matches!(signer.verify(token), Err(GatewayError::InvalidToken)),
                "expected InvalidToken for {token:?}"
            );
        }
    }
}
