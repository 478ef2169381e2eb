//! Capability checks over the authenticated caller.

use crate::error::GatewayError;

/// The identity a request acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub is_admin: bool,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, is_admin: bool) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin,
        }
    }
}

pub fn require_admin(principal: &Principal) -> Result<(), GatewayError> {
    if principal.is_admin {
        Ok(())
    } else {
        Err(GatewayError::Forbidden("Admin privileges required".into()))
    }
}

/// Allow the user acting on their own records, or any admin.
pub fn require_self_or_admin(principal: &Principal, user_id: &str) -> Result<(), GatewayError> {
    if principal.is_admin || principal.user_id == user_id {
        Ok(())
    } else {
        Err(GatewayError::Forbidden("Not enough permissions".into()))
    }
}
