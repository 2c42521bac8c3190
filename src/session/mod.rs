//! Session persistence
//!
//! Append-only conversation transcripts keyed by session id, plus the
//! "last findings" map the router consults for continuity. Sessions are
//! scoped to one calendar day per user. Backed by Postgres when a
//! database URL is configured, otherwise in-memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::models::{FindingsMap, MessageRecord};
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: Uuid,
    pub messages: Vec<MessageRecord>,
    pub last_findings: FindingsMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Day-scoped session id: `chat-YYYY-MM-DD-<8 hex>`.
fn new_session_id() -> String {
    let today = Utc::now().date_naive();
    let suffix = &Uuid::new_v4().simple().to_string()[..8];
    format!("chat-{}-{}", today, suffix)
}

fn today_prefix() -> String {
    format!("chat-{}", Utc::now().date_naive())
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<Session>>;

    /// Today's session for a user, if one exists.
    async fn find_today(&self, user_id: Uuid) -> Result<Option<Session>>;

    /// Create today's session seeded with an opening assistant message.
    async fn create_today(
        &self,
        user_id: Uuid,
        opening: MessageRecord,
        last_findings: FindingsMap,
    ) -> Result<Session>;

    /// Append one user/assistant exchange and replace `last_findings`.
    async fn append_exchange(
        &self,
        session_id: &str,
        user_record: MessageRecord,
        assistant_record: MessageRecord,
        last_findings: FindingsMap,
    ) -> Result<()>;

    /// Delete today's session so the next create starts fresh.
    async fn clear_today(&self, user_id: Uuid) -> Result<bool>;
}

//
// ================= In-memory store =================
//

pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).cloned())
    }

    async fn find_today(&self, user_id: Uuid) -> Result<Option<Session>> {
        let prefix = today_prefix();
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .find(|s| s.user_id == user_id && s.session_id.starts_with(&prefix))
            .cloned())
    }

    async fn create_today(
        &self,
        user_id: Uuid,
        opening: MessageRecord,
        last_findings: FindingsMap,
    ) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            session_id: new_session_id(),
            user_id,
            messages: vec![opening],
            last_findings,
            created_at: now,
            updated_at: now,
        };
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    async fn append_exchange(
        &self,
        session_id: &str,
        user_record: MessageRecord,
        assistant_record: MessageRecord,
        last_findings: FindingsMap,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
        session.messages.push(user_record);
        session.messages.push(assistant_record);
        session.last_findings = last_findings;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn clear_today(&self, user_id: Uuid) -> Result<bool> {
        let prefix = today_prefix();
        let mut sessions = self.sessions.write().await;
        let target: Option<String> = sessions
            .values()
            .find(|s| s.user_id == user_id && s.session_id.starts_with(&prefix))
            .map(|s| s.session_id.clone());
        match target {
            Some(id) => {
                sessions.remove(&id);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

//
// ================= Postgres store =================
//

pub struct PgSessionStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS chat_sessions (
                      session_id TEXT PRIMARY KEY,
                      user_id UUID NOT NULL,
                      messages JSONB NOT NULL DEFAULT '[]'::jsonb,
                      last_findings JSONB NOT NULL DEFAULT '{}'::jsonb,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_chat_sessions_user
                    ON chat_sessions (user_id, session_id);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestratorError::DatabaseError(format!(
                    "Failed to initialize session schema: {}",
                    e
                ))
            })?;

        Ok(())
    }

    fn row_to_session(row: &sqlx::postgres::PgRow) -> Result<Session> {
        let messages: serde_json::Value = row.try_get("messages")?;
        let last_findings: serde_json::Value = row.try_get("last_findings")?;
        Ok(Session {
            session_id: row.try_get("session_id")?,
            user_id: row.try_get("user_id")?,
            messages: serde_json::from_value(messages)?,
            last_findings: serde_json::from_value(last_findings)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM chat_sessions WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_session(&r)).transpose()
    }

    async fn find_today(&self, user_id: Uuid) -> Result<Option<Session>> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            "SELECT * FROM chat_sessions WHERE user_id = $1 AND session_id LIKE $2 LIMIT 1",
        )
        .bind(user_id)
        .bind(format!("{}%", today_prefix()))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::row_to_session(&r)).transpose()
    }

    async fn create_today(
        &self,
        user_id: Uuid,
        opening: MessageRecord,
        last_findings: FindingsMap,
    ) -> Result<Session> {
        self.ensure_schema().await?;
        let now = Utc::now();
        let session = Session {
            session_id: new_session_id(),
            user_id,
            messages: vec![opening],
            last_findings,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO chat_sessions
              (session_id, user_id, messages, last_findings, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&session.session_id)
        .bind(session.user_id)
        .bind(serde_json::to_value(&session.messages)?)
        .bind(serde_json::to_value(&session.last_findings)?)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(session)
    }

    async fn append_exchange(
        &self,
        session_id: &str,
        user_record: MessageRecord,
        assistant_record: MessageRecord,
        last_findings: FindingsMap,
    ) -> Result<()> {
        self.ensure_schema().await?;
        let appended = serde_json::to_value(vec![&user_record, &assistant_record])?;
        let result = sqlx::query(
            r#"
            UPDATE chat_sessions
            SET messages = messages || $2::jsonb,
                last_findings = $3,
                updated_at = NOW()
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(appended)
        .bind(serde_json::to_value(&last_findings)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn clear_today(&self, user_id: Uuid) -> Result<bool> {
        self.ensure_schema().await?;
        let result = sqlx::query(
            "DELETE FROM chat_sessions WHERE user_id = $1 AND session_id LIKE $2",
        )
        .bind(user_id)
        .bind(format!("{}%", today_prefix()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Pick the store from the environment: Postgres when a database URL is
/// configured and a lazy pool can be built, in-memory otherwise.
pub fn store_from_env() -> Arc<dyn SessionStore> {
    let database_url = env::var("POSTGRES_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .ok();

    if let Some(url) = database_url {
        match PgPoolOptions::new().max_connections(5).connect_lazy(&url) {
            Ok(pool) => {
                info!("Session store backend: postgres");
                return Arc::new(PgSessionStore::new(pool));
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres session store, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Session store backend: in-memory");
    Arc::new(InMemorySessionStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_find_append_clear_cycle() {
        let store = InMemorySessionStore::new();
        let user_id = Uuid::new_v4();

        let session = store
            .create_today(
                user_id,
                MessageRecord::assistant("Welcome", vec![], FindingsMap::new()),
                FindingsMap::new(),
            )
            .await
            .unwrap();
        assert!(session.session_id.starts_with("chat-"));

        let found = store.find_today(user_id).await.unwrap().unwrap();
        assert_eq!(found.session_id, session.session_id);

        store
            .append_exchange(
                &session.session_id,
                MessageRecord::user("question"),
                MessageRecord::assistant("answer", vec!["tax".to_string()], FindingsMap::new()),
                FindingsMap::new(),
            )
            .await
            .unwrap();

        let after = store.get(&session.session_id).await.unwrap().unwrap();
        assert_eq!(after.messages.len(), 3);
        assert_eq!(after.messages[1].role, "user");
        assert_eq!(after.messages[2].role, "assistant");

        assert!(store.clear_today(user_id).await.unwrap());
        assert!(store.find_today(user_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_to_unknown_session_fails() {
        let store = InMemorySessionStore::new();
        let result = store
            .append_exchange(
                "chat-missing",
                MessageRecord::user("q"),
                MessageRecord::assistant("a", vec![], FindingsMap::new()),
                FindingsMap::new(),
            )
            .await;
        assert!(matches!(
            result,
            Err(OrchestratorError::SessionNotFound(_))
        ));
    }
}
