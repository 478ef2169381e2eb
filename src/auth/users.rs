use serde::{Deserialize, Serialize};
use turso::{Connection, Row};
use utoipa::ToSchema;
use uuid::Uuid;

use super::password::{hash_password, verify_password};
use crate::db::{Db, get_bool, get_opt_text, get_text, get_u64, query_all, query_count, query_first};
use crate::error::GatewayError;
use crate::timestamp_millis;

const USER_COLUMNS: &str =
    "id, email, username, full_name, is_active, is_admin, created_at, updated_at";

/// A user record. The password hash never leaves the store.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: String,
    pub email: String,
    pub username: String,
    pub full_name: Option<String>,
    pub is_active: bool,
    pub is_admin: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub password: String,
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub password: Option<String>,
    pub is_active: Option<bool>,
    pub is_admin: Option<bool>,
}

fn user_from_row(row: &Row) -> User {
    User {
        id: get_text(row, 0),
        email: get_text(row, 1),
        username: get_text(row, 2),
        full_name: get_opt_text(row, 3),
        is_active: get_bool(row, 4),
        is_admin: get_bool(row, 5),
        created_at: get_u64(row, 6),
        updated_at: get_u64(row, 7),
    }
}

async fn fetch_one(
    conn: &Connection,
    column: &str,
    value: &str,
) -> Result<Option<User>, GatewayError> {
    Ok(query_first(
        conn,
        &format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = ?"),
        [value],
        "load user",
    )
    .await?
    .map(|row| user_from_row(&row)))
}

async fn count(conn: &Connection, sql: &str, value: &str) -> Result<u64, GatewayError> {
    query_count(conn, sql, [value], "count users").await
}

#[derive(Clone)]
pub struct UsersStore {
    db: Db,
}

impl UsersStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a user. The very first user becomes an admin.
    pub async fn create(&self, new: NewUser) -> Result<User, GatewayError> {
        let password_hash = hash_password(&new.password)?;
        let tx = self.db.begin().await?;
        let result = async {
            if count(
                &tx,
                "SELECT COUNT(*) FROM users WHERE username = ?",
                &new.username,
            )
            .await?
                > 0
            {
                return Err(GatewayError::BadRequest(
                    "Username already registered".into(),
                ));
            }
            if count(&tx, "SELECT COUNT(*) FROM users WHERE email = ?", &new.email).await? > 0 {
                return Err(GatewayError::BadRequest("Email already registered".into()));
            }

            let existing =
                query_count(&tx, "SELECT COUNT(*) FROM users", (), "count users").await?;

            let now = timestamp_millis();
            let user = User {
                id: Uuid::new_v4().to_string(),
                email: new.email.clone(),
                username: new.username.clone(),
                full_name: new.full_name.clone(),
                is_active: true,
                is_admin: existing == 0,
                created_at: now,
                updated_at: now,
            };

            tx.execute(
                "INSERT INTO users (id, email, username, password_hash, full_name, is_active, is_admin, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?)",
                (
                    user.id.as_str(),
                    user.email.as_str(),
                    user.username.as_str(),
                    password_hash.as_str(),
                    user.full_name.clone(),
                    user.is_admin as i64,
                    now as i64,
                    now as i64,
                ),
            )
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to create user: {e}")))?;
            Ok(user)
        }
        .await;
        tx.finish(result).await
    }

    /// Check credentials. Returns `None` for unknown users and wrong passwords alike.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<User>, GatewayError> {
        let conn = self.db.conn()?;
        let Some(row) = query_first(
            &conn,
            "SELECT password_hash FROM users WHERE username = ?",
            [username],
            "load user",
        )
        .await?
        else {
            return Ok(None);
        };
        let hash = get_text(&row, 0);

        if !verify_password(password, &hash)? {
            return Ok(None);
        }
        fetch_one(&conn, "username", username).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<User>, GatewayError> {
        let conn = self.db.conn()?;
        fetch_one(&conn, "id", id).await
    }

    pub async fn exists(&self, id: &str) -> Result<bool, GatewayError> {
        let conn = self.db.conn()?;
        Ok(count(&conn, "SELECT COUNT(*) FROM users WHERE id = ?", id).await? > 0)
    }

    pub async fn count(&self) -> Result<u64, GatewayError> {
        let conn = self.db.conn()?;
        query_count(&conn, "SELECT COUNT(*) FROM users", (), "count users").await
    }

    pub async fn list(&self, skip: u64, limit: u64) -> Result<Vec<User>, GatewayError> {
        let conn = self.db.conn()?;
        let rows = query_all(
            &conn,
            &format!("SELECT {USER_COLUMNS} FROM users ORDER BY created_at LIMIT ? OFFSET ?"),
            (limit as i64, skip as i64),
            "list users",
        )
        .await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    /// Apply a partial update. Returns `None` if the user doesn't exist.
    pub async fn update(&self, id: &str, update: UserUpdate) -> Result<Option<User>, GatewayError> {
        let password_hash = update.password.as_deref().map(hash_password).transpose()?;
        let tx = self.db.begin().await?;
        let result = async {
            if let Some(email) = &update.email {
                let taken = query_count(
                    &tx,
                    "SELECT COUNT(*) FROM users WHERE email = ? AND id != ?",
                    (email.as_str(), id),
                    "check email",
                )
                .await?;
                if taken > 0 {
                    return Err(GatewayError::BadRequest("Email already registered".into()));
                }
            }

            let affected = tx
                .execute(
                    "UPDATE users SET \
                     email = COALESCE(?, email), \
                     full_name = COALESCE(?, full_name), \
                     password_hash = COALESCE(?, password_hash), \
                     is_active = COALESCE(?, is_active), \
                     is_admin = COALESCE(?, is_admin), \
                     updated_at = ? \
                     WHERE id = ?",
                    (
                        update.email.clone(),
                        update.full_name.clone(),
                        password_hash.clone(),
                        update.is_active.map(|v| v as i64),
                        update.is_admin.map(|v| v as i64),
                        timestamp_millis() as i64,
                        id,
                    ),
                )
                .await
                .map_err(|e| GatewayError::DatabaseError(format!("Failed to update user: {e}")))?;
            if affected == 0 {
                return Ok(None);
            }
            fetch_one(&tx, "id", id).await
        }
        .await;
        tx.finish(result).await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, GatewayError> {
        let conn = self.db.conn()?;
        let affected = conn
            .execute("DELETE FROM users WHERE id = ?", [id])
            .await
            .map_err(|e| GatewayError::DatabaseError(format!("Failed to delete user: {e}")))?;
        Ok(affected > 0)
    }
}
