use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use tracing::info;
use turso::{Builder, Connection, Database, IntoParams, Row, Rows, Value};

use crate::error::GatewayError;

const SCHEMA: &[(&str, &str)] = &[
    (
        "users",
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            full_name TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            is_admin INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "models",
        r#"
        CREATE TABLE IF NOT EXISTS models (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            provider TEXT NOT NULL,
            model_id TEXT NOT NULL,
            description TEXT,
            context_length INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0,
            is_default INTEGER NOT NULL DEFAULT 0,
            capabilities TEXT NOT NULL DEFAULT '[]',
            parameters TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (provider, model_id)
        )
        "#,
    ),
    (
        "access_grants",
        r#"
        CREATE TABLE IF NOT EXISTS access_grants (
            id TEXT PRIMARY KEY,
            model_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            can_use INTEGER NOT NULL DEFAULT 1,
            token_limit INTEGER,
            expires_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (model_id, user_id)
        )
        "#,
    ),
    (
        "usage_records",
        r#"
        CREATE TABLE IF NOT EXISTS usage_records (
            id TEXT PRIMARY KEY,
            model_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            request_type TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL DEFAULT 0,
            completion_tokens INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            latency_ms REAL NOT NULL,
            outcome TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    ),
];

/// Shared handle to the embedded database. Cheap to clone.
#[derive(Clone)]
pub struct Db {
    inner: Arc<Database>,
}

impl Db {
    /// Open (or create) the database at `path` and create all tables
    pub async fn open(path: &Path) -> Result<Self, GatewayError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                GatewayError::DatabaseError(format!("Failed to create DB directory: {e}"))
            })?;
        }

        let path_str = path.to_str().ok_or_else(|| {
            GatewayError::DatabaseError(format!("Database path is not UTF-8: {}", path.display()))
        })?;
        let db = Builder::new_local(path_str)
            .build()
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to open database: {e}")))?;

        let db = Self {
            inner: Arc::new(db),
        };
        db.create_schema().await?;

        info!("Database initialized at {}", path_str);
        Ok(db)
    }

    async fn create_schema(&self) -> Result<(), GatewayError> {
        let conn = self.conn()?;
        for (table, ddl) in SCHEMA {
            conn.execute(ddl, ()).await.map_err(|e| {
                GatewayError::DatabaseError(format!("Failed to create {table}: {e}"))
            })?;
        }
        Ok(())
    }

    /// Get a database connection
    pub fn conn(&self) -> Result<Connection, GatewayError> {
        self.inner
            .connect()
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to get connection: {e}")))
    }

    /// Start a transaction on a fresh connection
    pub async fn begin(&self) -> Result<Transaction, GatewayError> {
        let conn = self.conn()?;
        conn.execute("BEGIN", ())
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to begin transaction: {e}")))?;
        Ok(Transaction { conn })
    }
}

/// An open `BEGIN` on a dedicated connection.
///
/// Must be finished with [`Transaction::commit`] or [`Transaction::rollback`];
/// [`Transaction::finish`] does the right one for a `Result`.
pub struct Transaction {
    conn: Connection,
}

impl Transaction {
    pub async fn commit(self) -> Result<(), GatewayError> {
        self.conn
            .execute("COMMIT", ())
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to commit: {e}")))?;
        Ok(())
    }

    pub async fn rollback(self) {
        if let Err(e) = self.conn.execute("ROLLBACK", ()).await {
            tracing::warn!("Failed to roll back transaction: {e}");
        }
    }

    /// Commit on `Ok`, roll back on `Err`
    pub async fn finish<T>(self, result: Result<T, GatewayError>) -> Result<T, GatewayError> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                self.rollback().await;
                Err(e)
            }
        }
    }
}

impl Deref for Transaction {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

// --- Query helpers ---

/// Read a result set to the end.
///
/// Inside `BEGIN`, a `Rows` dropped before it is exhausted ends the
/// transaction, so every read goes through here.
pub async fn collect_rows(mut rows: Rows, context: &str) -> Result<Vec<Row>, GatewayError> {
    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| GatewayError::DatabaseError(format!("Failed to {context}: {e}")))?
    {
        out.push(row);
    }
    Ok(out)
}

pub async fn query_all(
    conn: &Connection,
    sql: &str,
    params: impl IntoParams,
    context: &str,
) -> Result<Vec<Row>, GatewayError> {
    let rows = conn
        .query(sql, params)
        .await
        .map_err(|e| GatewayError::DatabaseError(format!("Failed to {context}: {e}")))?;
    collect_rows(rows, context).await
}

pub async fn query_first(
    conn: &Connection,
    sql: &str,
    params: impl IntoParams,
    context: &str,
) -> Result<Option<Row>, GatewayError> {
    Ok(query_all(conn, sql, params, context).await?.into_iter().next())
}

/// First column of the first row as a count, 0 when there is no row
pub async fn query_count(
    conn: &Connection,
    sql: &str,
    params: impl IntoParams,
    context: &str,
) -> Result<u64, GatewayError> {
    Ok(query_first(conn, sql, params, context)
        .await?
        .map(|row| get_u64(&row, 0))
        .unwrap_or(0))
}

// --- Row helpers ---

pub fn get_text(row: &Row, idx: usize) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

pub fn get_opt_text(row: &Row, idx: usize) -> Option<String> {
    match row.get_value(idx) {
        Ok(Value::Text(s)) => Some(s),
        _ => None,
    }
}

pub fn get_bool(row: &Row, idx: usize) -> bool {
    row.get::<i64>(idx).unwrap_or(0) != 0
}

pub fn get_u64(row: &Row, idx: usize) -> u64 {
    row.get::<i64>(idx).unwrap_or(0).max(0) as u64
}

pub fn get_opt_u64(row: &Row, idx: usize) -> Option<u64> {
    match row.get_value(idx) {
        Ok(Value::Integer(v)) => Some(v.max(0) as u64),
        _ => None,
    }
}

pub fn get_f64(row: &Row, idx: usize) -> f64 {
    match row.get_value(idx) {
        Ok(Value::Real(v)) => v,
        Ok(Value::Integer(v)) => v as f64,
        _ => 0.0,
    }
}
