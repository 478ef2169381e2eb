use serde::{Deserialize, Serialize};
use turso::Row;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::db::{Db, get_f64, get_text, get_u64, query_all, query_count};
use crate::error::GatewayError;
use crate::timestamp_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Completion,
    Chat,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completion => "completion",
            Self::Chat => "chat",
        }
    }

    fn from_db(s: &str) -> Self {
        match s {
            "chat" => Self::Chat,
            _ => Self::Completion,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    Success,
    Error,
}

impl UsageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    fn from_db(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            _ => Self::Error,
        }
    }
}

/// One append-only usage log entry
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UsageRecord {
    pub id: String,
    pub model_id: String,
    pub user_id: String,
    pub request_type: RequestType,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub latency_ms: f64,
    pub outcome: UsageOutcome,
    pub created_at: u64,
}

#[derive(Debug, Clone)]
pub struct NewUsage {
    pub model_id: String,
    pub user_id: String,
    pub request_type: RequestType,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub latency_ms: f64,
    pub outcome: UsageOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct UsageFilter {
    pub user_id: Option<String>,
    pub model_id: Option<String>,
    pub limit: u64,
}

/// Largest token count the store can hold
pub const MAX_TOKEN_COUNT: u64 = i64::MAX as u64;

/// Aggregated usage for one model
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ModelUsageStats {
    pub model_id: String,
    pub model_name: String,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub avg_latency_ms: f64,
}

fn usage_from_row(row: &Row) -> UsageRecord {
    UsageRecord {
        id: get_text(row, 0),
        model_id: get_text(row, 1),
        user_id: get_text(row, 2),
        request_type: RequestType::from_db(&get_text(row, 3)),
        prompt_tokens: get_u64(row, 4),
        completion_tokens: get_u64(row, 5),
        total_tokens: get_u64(row, 6),
        latency_ms: get_f64(row, 7),
        outcome: UsageOutcome::from_db(&get_text(row, 8)),
        created_at: get_u64(row, 9),
    }
}

#[derive(Clone)]
pub struct UsageStore {
    db: Db,
}

impl UsageStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn record(&self, usage: NewUsage) -> Result<UsageRecord, GatewayError> {
        if usage.prompt_tokens > MAX_TOKEN_COUNT || usage.completion_tokens > MAX_TOKEN_COUNT {
            return Err(GatewayError::BadRequest("Token count out of range".into()));
        }
        let record = UsageRecord {
            id: Uuid::new_v4().to_string(),
            total_tokens: usage
                .prompt_tokens
                .saturating_add(usage.completion_tokens)
                .min(MAX_TOKEN_COUNT),
            model_id: usage.model_id,
            user_id: usage.user_id,
            request_type: usage.request_type,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            latency_ms: usage.latency_ms,
            outcome: usage.outcome,
            created_at: timestamp_millis(),
        };

        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO usage_records (id, model_id, user_id, request_type, prompt_tokens, \
             completion_tokens, total_tokens, latency_ms, outcome, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                record.id.as_str(),
                record.model_id.as_str(),
                record.user_id.as_str(),
                record.request_type.as_str(),
                record.prompt_tokens as i64,
                record.completion_tokens as i64,
                record.total_tokens as i64,
                record.latency_ms,
                record.outcome.as_str(),
                record.created_at as i64,
            ),
        )
        .await
        .map_err(|e| GatewayError::DatabaseError(format!("Failed to record usage: {e}")))?;
        Ok(record)
    }

    /// Most recent records first
    pub async fn list(&self, filter: UsageFilter) -> Result<Vec<UsageRecord>, GatewayError> {
        let conn = self.db.conn()?;
        let rows = query_all(
            &conn,
            "SELECT id, model_id, user_id, request_type, prompt_tokens, completion_tokens, \
             total_tokens, latency_ms, outcome, created_at FROM usage_records \
             WHERE (? IS NULL OR user_id = ?) AND (? IS NULL OR model_id = ?) \
             ORDER BY created_at DESC LIMIT ?",
            (
                filter.user_id.clone(),
                filter.user_id.clone(),
                filter.model_id.clone(),
                filter.model_id.clone(),
                filter.limit as i64,
            ),
            "list usage",
        )
        .await?;
        Ok(rows.iter().map(usage_from_row).collect())
    }

    /// Request count, token total and mean latency for every registered model,
    /// including models with no usage yet
    pub async fn stats(&self) -> Result<Vec<ModelUsageStats>, GatewayError> {
        let conn = self.db.conn()?;
        let rows = query_all(
            &conn,
            "SELECT m.id, m.name, COUNT(u.id), COALESCE(SUM(u.total_tokens), 0), \
             COALESCE(AVG(u.latency_ms), 0) \
             FROM models m LEFT JOIN usage_records u ON u.model_id = m.id \
             GROUP BY m.id, m.name ORDER BY COUNT(u.id) DESC, m.created_at",
            (),
            "aggregate usage",
        )
        .await?;
        Ok(rows
            .iter()
            .map(|row| ModelUsageStats {
                model_id: get_text(row, 0),
                model_name: get_text(row, 1),
                total_requests: get_u64(row, 2),
                total_tokens: get_u64(row, 3),
                avg_latency_ms: get_f64(row, 4),
            })
            .collect())
    }

    /// Tokens a user has spent on a model since `since` (epoch ms)
    pub async fn tokens_since(
        &self,
        user_id: &str,
        model_id: &str,
        since: u64,
    ) -> Result<u64, GatewayError> {
        let conn = self.db.conn()?;
        query_count(
            &conn,
            "SELECT COALESCE(SUM(total_tokens), 0) FROM usage_records \
             WHERE user_id = ? AND model_id = ? AND created_at >= ?",
            (user_id, model_id, since as i64),
            "sum usage",
        )
        .await
    }
}
