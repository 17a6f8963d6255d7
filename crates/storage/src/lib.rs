use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::User;

const MEMORY_DATABASE_URL: &str = "sqlite::memory:";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// The persisted half of an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub user: User,
    pub access_token: String,
    pub refresh_token: String,
    pub updated_at: DateTime<Utc>,
}

impl StoredSession {
    /// A record missing either token cannot authenticate anything.
    pub fn is_complete(&self) -> bool {
        !self.access_token.is_empty() && !self.refresh_token.is_empty()
    }
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every pooled connection to an in-memory database sees its own empty
        // database, so those are pinned to a single connection.
        let max_connections = if database_url.starts_with(MEMORY_DATABASE_URL) {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open session database '{database_url}'"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn save_session(
        &self,
        user: &User,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<()> {
        let user_json = serde_json::to_string(user).context("failed to encode session user")?;
        sqlx::query(
            "INSERT INTO auth_session (slot, user_json, access_token, refresh_token, updated_at)
             VALUES (1, ?, ?, ?, ?)
             ON CONFLICT(slot) DO UPDATE SET
                user_json=excluded.user_json,
                access_token=excluded.access_token,
                refresh_token=excluded.refresh_token,
                updated_at=excluded.updated_at",
        )
        .bind(user_json)
        .bind(access_token)
        .bind(refresh_token)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to persist auth session")?;
        Ok(())
    }

    pub async fn load_session(&self) -> Result<Option<StoredSession>> {
        let row = sqlx::query(
            "SELECT user_json, access_token, refresh_token, updated_at
             FROM auth_session WHERE slot = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to read auth session")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let user_json: String = row.try_get("user_json")?;
        let user: User =
            serde_json::from_str(&user_json).context("persisted session user is corrupt")?;
        Ok(Some(StoredSession {
            user,
            access_token: row.try_get("access_token")?,
            refresh_token: row.try_get("refresh_token")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    pub async fn clear_session(&self) -> Result<()> {
        sqlx::query("DELETE FROM auth_session")
            .execute(&self.pool)
            .await
            .context("failed to clear auth session")?;
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with(MEMORY_DATABASE_URL) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
