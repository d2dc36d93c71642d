use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{MessageId, UserId};

#[derive(Clone)]
pub struct ChatStore {
    pool: Pool<Sqlite>,
}

/// One persisted message row. The store is the sole source of truth for
/// conversation history; live connections never hold rows beyond an
/// in-flight fan-out.
#[derive(Debug, Clone)]
pub struct StoredChat {
    pub chat_id: MessageId,
    pub sender: UserId,
    pub receiver: UserId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
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

    /// Inserts one message. The store assigns the id; the returned row is
    /// the persisted shape.
    pub async fn insert_chat(
        &self,
        sender: &UserId,
        receiver: &UserId,
        body: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<StoredChat> {
        let rec = sqlx::query(
            "INSERT INTO chats (sender, receiver, body, sent_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(sender.as_str())
        .bind(receiver.as_str())
        .bind(body)
        .bind(sent_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(StoredChat {
            chat_id: MessageId(rec.get::<i64, _>(0)),
            sender: sender.clone(),
            receiver: receiver.clone(),
            body: body.to_owned(),
            sent_at,
        })
    }

    /// Removes one message by id. Returns the number of rows removed; 0 is
    /// not an error, the id may already be gone.
    pub async fn delete_chat(&self, chat_id: MessageId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(chat_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Full conversation between two identities, both directions, oldest
    /// first (insertion order).
    pub async fn list_between(&self, a: &UserId, b: &UserId) -> Result<Vec<StoredChat>> {
        let rows = sqlx::query(
            "SELECT id, sender, receiver, body, sent_at
             FROM chats
             WHERE (sender = ?1 AND receiver = ?2) OR (sender = ?2 AND receiver = ?1)
             ORDER BY id ASC",
        )
        .bind(a.as_str())
        .bind(b.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StoredChat {
                chat_id: MessageId(r.get::<i64, _>(0)),
                sender: UserId(r.get::<String, _>(1)),
                receiver: UserId(r.get::<String, _>(2)),
                body: r.get::<String, _>(3),
                sent_at: r.get::<DateTime<Utc>, _>(4),
            })
            .collect())
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
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
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
