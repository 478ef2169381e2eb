use serde::{Deserialize, Deserializer, Serialize};
use turso::{Connection, Row};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::db::{Db, get_bool, get_opt_u64, get_text, get_u64, query_all, query_first};
use crate::error::GatewayError;
use crate::timestamp_millis;

const GRANT_COLUMNS: &str =
    "id, model_id, user_id, can_use, token_limit, expires_at, created_at, updated_at";

/// Permission for one user to select one model
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AccessGrant {
    pub id: String,
    /// Registry id of the model
    pub model_id: String,
    pub user_id: String,
    pub can_use: bool,
    /// Maximum tokens per rolling 24 hours
    pub token_limit: Option<u64>,
    /// Epoch ms after which the grant no longer applies
    pub expires_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl AccessGrant {
    /// Whether the grant lets its user select the model at `now`
    pub fn is_usable(&self, now: u64) -> bool {
        self.can_use && self.expires_at.is_none_or(|exp| exp > now)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct NewGrant {
    pub model_id: String,
    pub user_id: String,
    #[serde(default = "default_true")]
    pub can_use: bool,
    #[serde(default)]
    pub token_limit: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<u64>,
}

/// Distinguishes an absent field from an explicit `null`
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Partial update. `null` clears `token_limit` / `expires_at`; an absent field keeps it.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct GrantUpdate {
    pub can_use: Option<bool>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<u64>)]
    pub token_limit: Option<Option<u64>>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<u64>)]
    pub expires_at: Option<Option<u64>>,
}

fn grant_from_row(row: &Row) -> AccessGrant {
    AccessGrant {
        id: get_text(row, 0),
        model_id: get_text(row, 1),
        user_id: get_text(row, 2),
        can_use: get_bool(row, 3),
        token_limit: get_opt_u64(row, 4),
        expires_at: get_opt_u64(row, 5),
        created_at: get_u64(row, 6),
        updated_at: get_u64(row, 7),
    }
}

async fn query_grants(
    conn: &Connection,
    filter: &str,
    params: (&str, Option<&str>),
    context: &str,
) -> Result<Vec<AccessGrant>, GatewayError> {
    let sql =
        format!("SELECT {GRANT_COLUMNS} FROM access_grants WHERE {filter} ORDER BY created_at");
    let rows = match params {
        (a, Some(b)) => query_all(conn, &sql, (a, b), context).await?,
        (a, None) => query_all(conn, &sql, [a], context).await?,
    };
    Ok(rows.iter().map(grant_from_row).collect())
}

#[derive(Clone)]
pub struct GrantsStore {
    db: Db,
}

impl GrantsStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a grant. The model must exist and the pair must not already have one.
    pub async fn create(&self, new: NewGrant) -> Result<AccessGrant, GatewayError> {
        let tx = self.db.begin().await?;
        let result = async {
            let (models, grants) = query_first(
                &tx,
                "SELECT (SELECT COUNT(*) FROM models WHERE id = ?), \
                 (SELECT COUNT(*) FROM access_grants WHERE model_id = ? AND user_id = ?)",
                (
                    new.model_id.as_str(),
                    new.model_id.as_str(),
                    new.user_id.as_str(),
                ),
                "check grant",
            )
            .await?
            .map(|r| (get_u64(&r, 0), get_u64(&r, 1)))
            .unwrap_or((0, 0));
            if models == 0 {
                return Err(GatewayError::NotFound(format!(
                    "Model '{}' not found",
                    new.model_id
                )));
            }
            if grants > 0 {
                return Err(GatewayError::BadRequest(
                    "Access control entry already exists".into(),
                ));
            }

            let now = timestamp_millis();
            let grant = AccessGrant {
                id: Uuid::new_v4().to_string(),
                model_id: new.model_id.clone(),
                user_id: new.user_id.clone(),
                can_use: new.can_use,
                token_limit: new.token_limit,
                expires_at: new.expires_at,
                created_at: now,
                updated_at: now,
            };
            tx.execute(
                "INSERT INTO access_grants (id, model_id, user_id, can_use, token_limit, expires_at, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    grant.id.as_str(),
                    grant.model_id.as_str(),
                    grant.user_id.as_str(),
                    grant.can_use as i64,
                    grant.token_limit.map(|v| v as i64),
                    grant.expires_at.map(|v| v as i64),
                    now as i64,
                    now as i64,
                ),
            )
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to create grant: {e}")))?;
            Ok(grant)
        }
        .await;
        tx.finish(result).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<AccessGrant>, GatewayError> {
        let conn = self.db.conn()?;
        Ok(query_grants(&conn, "id = ?", (id, None), "load grant")
            .await?
            .into_iter()
            .next())
    }

    /// The grant for a (model, user) pair, usable or not
    pub async fn find(
        &self,
        model_id: &str,
        user_id: &str,
    ) -> Result<Option<AccessGrant>, GatewayError> {
        let conn = self.db.conn()?;
        Ok(query_grants(
            &conn,
            "model_id = ? AND user_id = ?",
            (model_id, Some(user_id)),
            "load grant",
        )
        .await?
        .into_iter()
        .next())
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<AccessGrant>, GatewayError> {
        let conn = self.db.conn()?;
        query_grants(&conn, "user_id = ?", (user_id, None), "list user grants").await
    }

    pub async fn list_for_model(&self, model_id: &str) -> Result<Vec<AccessGrant>, GatewayError> {
        let conn = self.db.conn()?;
        query_grants(&conn, "model_id = ?", (model_id, None), "list model grants").await
    }

    /// Apply a partial update. Returns `None` if the grant doesn't exist.
    pub async fn update(
        &self,
        id: &str,
        update: GrantUpdate,
    ) -> Result<Option<AccessGrant>, GatewayError> {
        let tx = self.db.begin().await?;
        let result = async {
            let Some(mut grant) = query_grants(&tx, "id = ?", (id, None), "load grant")
                .await?
                .into_iter()
                .next()
            else {
                return Ok(None);
            };

            if let Some(can_use) = update.can_use {
                grant.can_use = can_use;
            }
            if let Some(token_limit) = update.token_limit {
                grant.token_limit = token_limit;
            }
            if let Some(expires_at) = update.expires_at {
                grant.expires_at = expires_at;
            }
            grant.updated_at = timestamp_millis();

            tx.execute(
                "UPDATE access_grants SET can_use = ?, token_limit = ?, expires_at = ?, updated_at = ? WHERE id = ?",
                (
                    grant.can_use as i64,
                    grant.token_limit.map(|v| v as i64),
                    grant.expires_at.map(|v| v as i64),
                    grant.updated_at as i64,
                    id,
                ),
            )
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to update grant: {e}")))?;
            Ok(Some(grant))
        }
        .await;
        tx.finish(result).await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, GatewayError> {
        let conn = self.db.conn()?;
        let affected = conn
            .execute("DELETE FROM access_grants WHERE id = ?", [id])
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to delete grant: {e}")))?;
        Ok(affected > 0)
    }
}
