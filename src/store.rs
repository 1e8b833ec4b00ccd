use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

/// One persisted pairing of a chat identity with a game identity.
///
/// `game_id` is nullable in the schema so rows imported from older systems can
/// be half-linked, but this service only ever writes fully-paired rows.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LinkRecord {
    pub chat_id: String,
    pub game_id: Option<String>,
    pub linked_at: DateTime<Utc>,
}

impl LinkRecord {
    pub fn is_complete(&self) -> bool {
        self.game_id.is_some()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store's uniqueness constraint rejected a write. The payload names
    /// the column that lost the race ("chat_id" or "game_id").
    #[error("unique constraint violated on {0}")]
    UniqueViolation(&'static str),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone)]
enum Backend {
    Memory(Arc<RwLock<HashMap<String, LinkRecord>>>),
    Postgres(PgPool),
}

/// Durable table of link records. Uniqueness of both identity columns is
/// enforced here, not in the reconciler: concurrent finalize attempts are
/// settled by the constraint, never by a prior read.
#[derive(Clone)]
pub struct LinkStore {
    backend: Backend,
    op_timeout: Duration,
    max_retries: u32,
}

impl LinkStore {
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(RwLock::new(HashMap::new()))),
            op_timeout: Duration::from_secs(5),
            max_retries: 2,
        }
    }

    pub fn postgres(pool: PgPool, op_timeout: Duration, max_retries: u32) -> Self {
        Self {
            backend: Backend::Postgres(pool),
            op_timeout,
            max_retries,
        }
    }

    pub async fn get_by_chat(&self, chat_id: &str) -> Result<Option<LinkRecord>, StoreError> {
        match &self.backend {
            Backend::Memory(map) => Ok(map.read().await.get(chat_id).cloned()),
            Backend::Postgres(pool) => {
                let pool = pool.clone();
                let chat_id = chat_id.to_string();
                self.run("get_by_chat", move || {
                    let pool = pool.clone();
                    let chat_id = chat_id.clone();
                    async move {
                        sqlx::query_as::<_, LinkRecord>(
                            "SELECT chat_id, game_id, linked_at FROM account_link WHERE chat_id = $1",
                        )
                        .bind(chat_id)
                        .fetch_optional(&pool)
                        .await
                    }
                })
                .await
            }
        }
    }

    pub async fn get_by_game(&self, game_id: &str) -> Result<Option<LinkRecord>, StoreError> {
        match &self.backend {
            Backend::Memory(map) => Ok(map
                .read()
                .await
                .values()
                .find(|rec| rec.game_id.as_deref() == Some(game_id))
                .cloned()),
            Backend::Postgres(pool) => {
                let pool = pool.clone();
                let game_id = game_id.to_string();
                self.run("get_by_game", move || {
                    let pool = pool.clone();
                    let game_id = game_id.clone();
                    async move {
                        sqlx::query_as::<_, LinkRecord>(
                            "SELECT chat_id, game_id, linked_at FROM account_link WHERE game_id = $1",
                        )
                        .bind(game_id)
                        .fetch_optional(&pool)
                        .await
                    }
                })
                .await
            }
        }
    }

    /// Commit a fully-paired link in one atomic write. A half-linked row for
    /// the same chat identity is finalized in place; any other collision on
    /// either column surfaces as `UniqueViolation`.
    pub async fn link(&self, chat_id: &str, game_id: &str) -> Result<LinkRecord, StoreError> {
        match &self.backend {
            Backend::Memory(map) => {
                let mut map = map.write().await;
                let taken = map
                    .values()
                    .any(|rec| rec.chat_id != chat_id && rec.game_id.as_deref() == Some(game_id));
                if taken {
                    return Err(StoreError::UniqueViolation("game_id"));
                }
                match map.get_mut(chat_id) {
                    Some(rec) => {
                        if matches!(rec.game_id.as_deref(), Some(existing) if existing != game_id) {
                            return Err(StoreError::UniqueViolation("chat_id"));
                        }
                        rec.game_id = Some(game_id.to_string());
                        Ok(rec.clone())
                    }
                    None => {
                        let rec = LinkRecord {
                            chat_id: chat_id.to_string(),
                            game_id: Some(game_id.to_string()),
                            linked_at: Utc::now(),
                        };
                        map.insert(chat_id.to_string(), rec.clone());
                        Ok(rec)
                    }
                }
            }
            Backend::Postgres(pool) => {
                let pool = pool.clone();
                let chat = chat_id.to_string();
                let game = game_id.to_string();
                let row = self
                    .run("link", move || {
                        let pool = pool.clone();
                        let chat = chat.clone();
                        let game = game.clone();
                        async move {
                            sqlx::query_as::<_, LinkRecord>(
                                r#"
                                INSERT INTO account_link (chat_id, game_id)
                                VALUES ($1, $2)
                                ON CONFLICT (chat_id) DO UPDATE SET game_id = EXCLUDED.game_id
                                WHERE account_link.game_id IS NULL
                                   OR account_link.game_id = EXCLUDED.game_id
                                RETURNING chat_id, game_id, linked_at
                                "#,
                            )
                            .bind(chat)
                            .bind(game)
                            .fetch_optional(&pool)
                            .await
                        }
                    })
                    .await?;
                // A filtered-out upsert means the chat identity already holds
                // a different game identity.
                row.ok_or(StoreError::UniqueViolation("chat_id"))
            }
        }
    }

    /// Delete any record whose chat or game column matches `id`. Returns the
    /// number of rows removed; zero is a valid answer, not a failure.
    pub async fn delete_matching(&self, id: &str) -> Result<u64, StoreError> {
        match &self.backend {
            Backend::Memory(map) => {
                let mut map = map.write().await;
                let before = map.len();
                map.retain(|chat_id, rec| {
                    chat_id.as_str() != id && rec.game_id.as_deref() != Some(id)
                });
                Ok((before - map.len()) as u64)
            }
            Backend::Postgres(pool) => {
                let pool = pool.clone();
                let id = id.to_string();
                self.run("delete_matching", move || {
                    let pool = pool.clone();
                    let id = id.clone();
                    async move {
                        sqlx::query("DELETE FROM account_link WHERE chat_id = $1 OR game_id = $1")
                            .bind(id)
                            .execute(&pool)
                            .await
                            .map(|done| done.rows_affected())
                    }
                })
                .await
            }
        }
    }

    /// Run one Postgres operation with a bounded timeout, retrying transient
    /// failures at most `max_retries` times. Constraint violations are final
    /// and returned immediately.
    async fn run<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            match tokio::time::timeout(self.op_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => {
                    if let Some(constraint) = unique_violation(&err) {
                        return Err(StoreError::UniqueViolation(constraint));
                    }
                    if attempt >= self.max_retries {
                        return Err(StoreError::Unavailable(err.to_string()));
                    }
                    warn!(%op, attempt, error = %err, "store operation failed; retrying");
                }
                Err(_) => {
                    if attempt >= self.max_retries {
                        return Err(StoreError::Unavailable(format!(
                            "{} timed out after {:?}",
                            op, self.op_timeout
                        )));
                    }
                    warn!(%op, attempt, "store operation timed out; retrying");
                }
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
impl LinkStore {
    /// Seed a half-linked row the way a legacy import would, memory backend only.
    pub(crate) async fn seed_partial_chat(&self, chat_id: &str) {
        if let Backend::Memory(map) = &self.backend {
            map.write().await.insert(
                chat_id.to_string(),
                LinkRecord {
                    chat_id: chat_id.to_string(),
                    game_id: None,
                    linked_at: Utc::now(),
                },
            );
        }
    }
}

fn unique_violation(err: &sqlx::Error) -> Option<&'static str> {
    let db = err.as_database_error()?;
    if db.code().as_deref() != Some("23505") {
        return None;
    }
    match db.constraint() {
        Some("account_link_pkey") => Some("chat_id"),
        _ => Some("game_id"),
    }
}
