use serde::{Deserialize, Serialize};
use turso::{Connection, Row};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::constants::{OLLAMA_PROVIDER, SYNC_CAPABILITIES, SYNC_CONTEXT_LENGTH};
use crate::db::{Db, get_bool, get_opt_text, get_text, get_u64, query_all, query_count, query_first};
use crate::error::GatewayError;
use crate::timestamp_millis;

const MODEL_COLUMNS: &str = "id, name, provider, model_id, description, context_length, \
     is_active, is_default, capabilities, parameters, created_at, updated_at";

/// Default generation parameters stored on a model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ModelParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ModelParameters {
    /// Parameters assigned to models discovered by sync
    pub fn sync_defaults() -> Self {
        Self {
            temperature: Some(0.7),
            top_p: Some(0.9),
            max_tokens: Some(1024),
        }
    }
}

/// A registered inference-backend model
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub provider: String,
    /// Identifier understood by the backend, e.g. `mistral:7b`
    pub model_id: String,
    pub description: Option<String>,
    pub context_length: u32,
    pub is_active: bool,
    pub is_default: bool,
    pub capabilities: Vec<String>,
    pub parameters: Option<ModelParameters>,
    pub created_at: u64,
    pub updated_at: u64,
}

fn default_provider() -> String {
    OLLAMA_PROVIDER.to_string()
}

fn default_context_length() -> u32 {
    SYNC_CONTEXT_LENGTH as u32
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct NewModel {
    pub name: String,
    pub model_id: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_context_length")]
    pub context_length: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub parameters: Option<ModelParameters>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_default: bool,
}

/// Partial update; absent fields are left unchanged
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct ModelUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub context_length: Option<u32>,
    pub capabilities: Option<Vec<String>>,
    pub parameters: Option<ModelParameters>,
    pub is_active: Option<bool>,
    pub is_default: Option<bool>,
}

fn model_from_row(row: &Row) -> Model {
    let capabilities = serde_json::from_str(&get_text(row, 8)).unwrap_or_default();
    let parameters = get_opt_text(row, 9).and_then(|p| serde_json::from_str(&p).ok());
    Model {
        id: get_text(row, 0),
        name: get_text(row, 1),
        provider: get_text(row, 2),
        model_id: get_text(row, 3),
        description: get_opt_text(row, 4),
        context_length: get_u64(row, 5) as u32,
        is_active: get_bool(row, 6),
        is_default: get_bool(row, 7),
        capabilities,
        parameters,
        created_at: get_u64(row, 10),
        updated_at: get_u64(row, 11),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, GatewayError> {
    serde_json::to_string(value)
        .map_err(|e| GatewayError::Internal(format!("Failed to serialize model field: {e}")))
}

/// `Llama3.2:1b` for `llama3.2:1b`
pub fn display_name(model_id: &str) -> String {
    let mut chars = model_id.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

async fn query_models(
    conn: &Connection,
    filter: &str,
    param: Option<&str>,
    context: &str,
) -> Result<Vec<Model>, GatewayError> {
    let sql = format!("SELECT {MODEL_COLUMNS} FROM models {filter} ORDER BY created_at, name");
    let rows = match param {
        Some(p) => query_all(conn, &sql, [p], context).await?,
        None => query_all(conn, &sql, (), context).await?,
    };
    Ok(rows.iter().map(model_from_row).collect())
}

async fn fetch_model(conn: &Connection, id: &str) -> Result<Option<Model>, GatewayError> {
    Ok(query_models(conn, "WHERE id = ?", Some(id), "load model")
        .await?
        .into_iter()
        .next())
}

/// Flag `id` as the default and clear the flag everywhere else.
///
/// Callers run this inside a transaction so no reader sees zero or two defaults.
async fn swap_default(conn: &Connection, id: &str, now: u64) -> Result<(), GatewayError> {
    conn.execute(
        "UPDATE models SET is_default = 0, updated_at = ? WHERE is_default = 1 AND id != ?",
        (now as i64, id),
    )
    .await
    .map_err(|e| GatewayError::DatabaseError(format!("Failed to clear default model: {e}")))?;
    conn.execute(
        "UPDATE models SET is_default = 1, updated_at = ? WHERE id = ?",
        (now as i64, id),
    )
    .await
    .map_err(|e| GatewayError::DatabaseError(format!("Failed to set default model: {e}")))?;
    Ok(())
}

#[derive(Clone)]
pub struct ModelsStore {
    db: Db,
}

impl ModelsStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// List models, optionally only active ones
    pub async fn list(&self, active_only: bool) -> Result<Vec<Model>, GatewayError> {
        let conn = self.db.conn()?;
        let filter = if active_only { "WHERE is_active = 1" } else { "" };
        query_models(&conn, filter, None, "list models").await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Model>, GatewayError> {
        let conn = self.db.conn()?;
        fetch_model(&conn, id).await
    }

    /// Look up by backend identifier within a provider
    pub async fn find_by_model_id(
        &self,
        provider: &str,
        model_id: &str,
    ) -> Result<Option<Model>, GatewayError> {
        let conn = self.db.conn()?;
        Ok(query_first(
            &conn,
            &format!("SELECT {MODEL_COLUMNS} FROM models WHERE provider = ? AND model_id = ?"),
            (provider, model_id),
            "find model",
        )
        .await?
        .map(|row| model_from_row(&row)))
    }

    /// The model carrying the default flag, active or not
    pub async fn get_default(&self) -> Result<Option<Model>, GatewayError> {
        let conn = self.db.conn()?;
        Ok(
            query_models(&conn, "WHERE is_default = 1", None, "load default model")
                .await?
                .into_iter()
                .next(),
        )
    }

    pub async fn create(&self, new: NewModel) -> Result<Model, GatewayError> {
        if new.is_default && !new.is_active {
            return Err(GatewayError::BadRequest(
                "An inactive model cannot be the default".into(),
            ));
        }
        let capabilities = to_json(&new.capabilities)?;
        let parameters = new.parameters.as_ref().map(to_json).transpose()?;

        let tx = self.db.begin().await?;
        let result = async {
            let existing = query_count(
                &tx,
                "SELECT COUNT(*) FROM models WHERE provider = ? AND model_id = ?",
                (new.provider.as_str(), new.model_id.as_str()),
                "check model",
            )
            .await?;
            if existing > 0 {
                return Err(GatewayError::BadRequest(format!(
                    "Model '{}' already exists",
                    new.model_id
                )));
            }

            let id = Uuid::new_v4().to_string();
            let now = timestamp_millis();
            tx.execute(
                "INSERT INTO models (id, name, provider, model_id, description, context_length, \
                 is_active, is_default, capabilities, parameters, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)",
                (
                    id.as_str(),
                    new.name.as_str(),
                    new.provider.as_str(),
                    new.model_id.as_str(),
                    new.description.clone(),
                    new.context_length as i64,
                    new.is_active as i64,
                    capabilities.as_str(),
                    parameters.clone(),
                    now as i64,
                    now as i64,
                ),
            )
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to create model: {e}")))?;

            if new.is_default {
                swap_default(&tx, &id, now).await?;
            }
            fetch_model(&tx, &id)
                .await?
                .ok_or_else(|| GatewayError::Internal("Created model vanished".into()))
        }
        .await;
        tx.finish(result).await
    }

    /// Apply a partial update. Returns `None` if the model doesn't exist.
    pub async fn update(
        &self,
        id: &str,
        update: ModelUpdate,
    ) -> Result<Option<Model>, GatewayError> {
        let capabilities = update.capabilities.as_ref().map(to_json).transpose()?;
        let parameters = update.parameters.as_ref().map(to_json).transpose()?;

        let tx = self.db.begin().await?;
        let result = async {
            let Some(current) = fetch_model(&tx, id).await? else {
                return Ok(None);
            };
            let will_be_active = update.is_active.unwrap_or(current.is_active);
            if update.is_default == Some(true) && !will_be_active {
                return Err(GatewayError::BadRequest(
                    "An inactive model cannot be the default".into(),
                ));
            }

            let now = timestamp_millis();
            tx.execute(
                "UPDATE models SET \
                 name = COALESCE(?, name), \
                 description = COALESCE(?, description), \
                 context_length = COALESCE(?, context_length), \
                 capabilities = COALESCE(?, capabilities), \
                 parameters = COALESCE(?, parameters), \
                 is_active = COALESCE(?, is_active), \
                 updated_at = ? \
                 WHERE id = ?",
                (
                    update.name.clone(),
                    update.description.clone(),
                    update.context_length.map(|v| v as i64),
                    capabilities.clone(),
                    parameters.clone(),
                    update.is_active.map(|v| v as i64),
                    now as i64,
                    id,
                ),
            )
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to update model: {e}")))?;

            match update.is_default {
                Some(true) => swap_default(&tx, id, now).await?,
                Some(false) => {
                    tx.execute("UPDATE models SET is_default = 0 WHERE id = ?", [id])
                        .await
                        .map_err(|e| {
                            GatewayError::DatabaseError(format!(
                                "Failed to clear default model: {e}"
                            ))
                        })?;
                }
                None => {}
            }
            fetch_model(&tx, id).await
        }
        .await;
        tx.finish(result).await
    }

    /// Make `id` the single default model
    pub async fn set_default(&self, id: &str) -> Result<Model, GatewayError> {
        let tx = self.db.begin().await?;
        let result = async {
            let model = fetch_model(&tx, id)
                .await?
                .ok_or_else(|| GatewayError::NotFound(format!("Model '{id}' not found")))?;
            if !model.is_active {
                return Err(GatewayError::BadRequest(
                    "An inactive model cannot be the default".into(),
                ));
            }
            swap_default(&tx, id, timestamp_millis()).await?;
            fetch_model(&tx, id)
                .await?
                .ok_or_else(|| GatewayError::NotFound(format!("Model '{id}' not found")))
        }
        .await;
        tx.finish(result).await
    }

    /// Delete a model. Refused while grants or usage records reference it.
    pub async fn delete(&self, id: &str) -> Result<bool, GatewayError> {
        let tx = self.db.begin().await?;
        let result = async {
            let (grants, usage) = query_first(
                &tx,
                "SELECT (SELECT COUNT(*) FROM access_grants WHERE model_id = ?), \
                 (SELECT COUNT(*) FROM usage_records WHERE model_id = ?)",
                (id, id),
                "check model references",
            )
            .await?
            .map(|r| (get_u64(&r, 0), get_u64(&r, 1)))
            .unwrap_or((0, 0));
            if grants > 0 || usage > 0 {
                return Err(GatewayError::Conflict(format!(
                    "Model is referenced by {grants} access grant(s) and {usage} usage record(s); deactivate it instead"
                )));
            }

            let affected = tx
                .execute("DELETE FROM models WHERE id = ?", [id])
                .await
                .map_err(|e| GatewayError::DatabaseError(format!("Failed to delete model: {e}")))?;
            Ok(affected > 0)
        }
        .await;
        tx.finish(result).await
    }

    /// Insert backend models not yet registered, as inactive and non-default.
    ///
    /// Existing rows are left untouched and nothing is ever deleted.
    /// Returns the backend identifiers that were newly inserted.
    pub async fn sync(
        &self,
        provider: &str,
        backend_ids: &[String],
    ) -> Result<Vec<String>, GatewayError> {
        let capabilities = to_json(&SYNC_CAPABILITIES)?;
        let parameters = to_json(&ModelParameters::sync_defaults())?;

        let tx = self.db.begin().await?;
        let result = async {
            let now = timestamp_millis();
            let mut created = Vec::new();
            for model_id in backend_ids {
                let affected = tx
                    .execute(
                        "INSERT OR IGNORE INTO models (id, name, provider, model_id, description, \
                         context_length, is_active, is_default, capabilities, parameters, \
                         created_at, updated_at) \
                         VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?, ?, ?, ?)",
                        (
                            Uuid::new_v4().to_string(),
                            display_name(model_id),
                            provider,
                            model_id.as_str(),
                            format!("Ollama model: {model_id}"),
                            SYNC_CONTEXT_LENGTH,
                            capabilities.as_str(),
                            parameters.as_str(),
                            now as i64,
                            now as i64,
                        ),
                    )
                    .await
                    .map_err(|e| {
                        GatewayError::DatabaseError(format!("Failed to insert synced model: {e}"))
                    })?;
                if affected > 0 {
                    created.push(model_id.clone());
                }
            }
            Ok(created)
        }
        .await;
        tx.finish(result).await
    }
}
