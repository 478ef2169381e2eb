//! Which model a caller's inference request runs on, and whether it may.

use std::collections::HashSet;

use tracing::debug;

use super::{AccessGrant, GrantsStore, Model, ModelsStore, UsageStore};
use crate::auth::Principal;
use crate::constants::{OLLAMA_PROVIDER, TOKEN_LIMIT_WINDOW_MS};
use crate::error::GatewayError;
use crate::timestamp_millis;

/// Check that `principal` may select `model`, given their grant for it (if any).
///
/// Admins may select any model. Everyone else needs a grant for this exact
/// model that is enabled and not expired at `now`.
pub fn check_model_access(
    principal: &Principal,
    model: &Model,
    grant: Option<&AccessGrant>,
    now: u64,
) -> Result<(), GatewayError> {
    if principal.is_admin {
        return Ok(());
    }
    match grant {
        Some(g) if g.model_id == model.id && g.user_id == principal.user_id && g.is_usable(now) => {
            Ok(())
        }
        _ => Err(GatewayError::Forbidden(format!(
            "No access to model '{}'",
            model.model_id
        ))),
    }
}

/// Resolves requested model identifiers against the registry
#[derive(Clone)]
pub struct ModelResolver {
    models: ModelsStore,
    grants: GrantsStore,
    usage: UsageStore,
}

impl ModelResolver {
    pub fn new(models: ModelsStore, grants: GrantsStore, usage: UsageStore) -> Self {
        Self {
            models,
            grants,
            usage,
        }
    }

    /// The model to run for `principal`.
    ///
    /// `requested` is the backend identifier (e.g. `mistral:7b`). Without one,
    /// the flagged default is used, provided it is active. Non-admins need a
    /// usable grant either way, and a grant's token limit must not be spent.
    pub async fn resolve(
        &self,
        principal: &Principal,
        requested: Option<&str>,
    ) -> Result<Model, GatewayError> {
        let now = timestamp_millis();
        let model = match requested.map(str::trim).filter(|id| !id.is_empty()) {
            Some(model_id) => self
                .models
                .find_by_model_id(OLLAMA_PROVIDER, model_id)
                .await?
                .filter(|m| m.is_active)
                .ok_or_else(|| GatewayError::NotFound(format!("Model '{model_id}' not found")))?,
            None => self
                .models
                .get_default()
                .await?
                .filter(|m| m.is_active && m.provider == OLLAMA_PROVIDER)
                .ok_or(GatewayError::NoDefaultModel)?,
        };

        if principal.is_admin {
            return Ok(model);
        }

        let grant = self.grants.find(&model.id, &principal.user_id).await?;
        check_model_access(principal, &model, grant.as_ref(), now)?;

        if let Some(limit) = grant.and_then(|g| g.token_limit) {
            let since = now.saturating_sub(TOKEN_LIMIT_WINDOW_MS);
            let used = self
                .usage
                .tokens_since(&principal.user_id, &model.id, since)
                .await?;
            if used >= limit {
                debug!(
                    "User {} spent {used}/{limit} tokens on {}",
                    principal.user_id, model.model_id
                );
                return Err(GatewayError::RateLimitExceeded(format!(
                    "Token limit of {limit} per 24h reached for model '{}'",
                    model.model_id
                )));
            }
        }

        Ok(model)
    }

    /// Active models `principal` could select
    pub async fn selectable(&self, principal: &Principal) -> Result<Vec<Model>, GatewayError> {
        let models = self
            .models
            .list(true)
            .await?
            .into_iter()
            .filter(|m| m.provider == OLLAMA_PROVIDER);
        if principal.is_admin {
            return Ok(models.collect());
        }

        let now = timestamp_millis();
        let granted: HashSet<String> = self
            .grants
            .list_for_user(&principal.user_id)
            .await?
            .into_iter()
            .filter(|g| g.is_usable(now))
            .map(|g| g.model_id)
            .collect();
        Ok(models.filter(|m| granted.contains(&m.id)).collect())
    }
}
