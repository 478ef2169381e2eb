//! Password hashing and verification.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};

use crate::error::GatewayError;

/// Hash a password with Argon2id and a fresh salt, returning a PHC string.
pub fn hash_password(password: &str) -> Result<String, GatewayError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| GatewayError::Internal(format!("Failed to hash password: {e}")))
}

/// Verify a password against a stored PHC string.
///
/// Uses the parameters embedded in the hash, so older hashes keep verifying
/// after the defaults change.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, GatewayError> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| GatewayError::Internal(format!("Failed to parse password hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}
