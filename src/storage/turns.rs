//! `TurnStore` backed by the `turns` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::{Error, Result};
use crate::ledger::{ConversationId, Turn, TurnId, TurnStatus, TurnStore};
use crate::provider::Role;

#[derive(Debug, sqlx::FromRow)]
struct TurnRow {
    id: String,
    conversation_id: String,
    role: String,
    content: String,
    provider: Option<String>,
    status: String,
    failure_reason: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl TurnRow {
    fn into_turn(self) -> Result<Turn> {
        let corrupt = |field: &str, value: &str| {
            Error::Internal(format!(
                "corrupt turn row {}: bad {} '{}'",
                self.id, field, value
            ))
        };

        let id = TurnId::parse(&self.id).ok_or_else(|| corrupt("id", &self.id))?;
        let role = Role::parse(&self.role).ok_or_else(|| corrupt("role", &self.role))?;
        let status =
            TurnStatus::parse(&self.status).ok_or_else(|| corrupt("status", &self.status))?;
        let created_at =
            parse_timestamp(&self.created_at).ok_or_else(|| corrupt("created_at", &self.created_at))?;
        let completed_at = match &self.completed_at {
            Some(ts) => Some(parse_timestamp(ts).ok_or_else(|| corrupt("completed_at", ts))?),
            None => None,
        };

        Ok(Turn {
            id,
            conversation_id: ConversationId::from(self.conversation_id.clone()),
            role,
            content: self.content.clone(),
            provider: self.provider.clone(),
            status,
            failure_reason: self.failure_reason.clone(),
            created_at,
            completed_at,
        })
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

pub struct SqliteTurnStore {
    pool: SqlitePool,
}

impl SqliteTurnStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TurnStore for SqliteTurnStore {
    async fn append(&self, turn: &Turn) -> Result<()> {
        sqlx::query(
            "INSERT INTO turns (
                id, conversation_id, seq, role, content, provider,
                status, failure_reason, created_at, completed_at
            ) VALUES (
                ?, ?,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM turns WHERE conversation_id = ?),
                ?, ?, ?, ?, ?, ?, ?
            )",
        )
        .bind(turn.id.to_string())
        .bind(turn.conversation_id.as_str())
        .bind(turn.conversation_id.as_str())
        .bind(turn.role.as_str())
        .bind(&turn.content)
        .bind(turn.provider.as_deref())
        .bind(turn.status.as_str())
        .bind(turn.failure_reason.as_deref())
        .bind(turn.created_at.to_rfc3339())
        .bind(turn.completed_at.map(|ts| ts.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_all(&self, conversation_id: &ConversationId) -> Result<Vec<Turn>> {
        let rows = sqlx::query_as::<_, TurnRow>(
            "SELECT id, conversation_id, role, content, provider, status,
                    failure_reason, created_at, completed_at
             FROM turns WHERE conversation_id = ? ORDER BY seq",
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TurnRow::into_turn).collect()
    }

    async fn delete(&self, conversation_id: &ConversationId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM turns WHERE conversation_id = ?")
            .bind(conversation_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TurnOutcome;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_store() -> SqliteTurnStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::storage::migrate(&pool).await.unwrap();
        SqliteTurnStore::new(pool)
    }

    fn finished(conversation: &str, content: &str, outcome: TurnOutcome) -> Turn {
        let mut turn = Turn::assistant(ConversationId::from(conversation));
        turn.content = content.to_string();
        turn.provider = Some("alpha".to_string());
        turn.status = outcome.status();
        turn.failure_reason = outcome.reason().map(str::to_string);
        turn.completed_at = Some(Utc::now());
        turn
    }

    #[tokio::test]
    async fn test_append_and_read_in_order() {
        let store = memory_store().await;
        let conv = ConversationId::from("c1");

        let user = Turn::user(conv.clone(), "hello?");
        let reply = finished("c1", "hi there", TurnOutcome::Complete);
        store.append(&user).await.unwrap();
        store.append(&reply).await.unwrap();
        store
            .append(&Turn::user(ConversationId::from("other"), "unrelated"))
            .await
            .unwrap();

        let turns = store.read_all(&conv).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].id, user.id);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].content, "hi there");
        assert_eq!(turns[1].provider.as_deref(), Some("alpha"));
        assert_eq!(turns[1].status, TurnStatus::Complete);
        assert!(turns[1].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_failure_reason_persisted() {
        let store = memory_store().await;
        let reply = finished(
            "c1",
            "Hello wor",
            TurnOutcome::Failed {
                reason: "connection reset".to_string(),
            },
        );
        store.append(&reply).await.unwrap();

        let turns = store.read_all(&ConversationId::from("c1")).await.unwrap();
        assert_eq!(turns[0].status, TurnStatus::Failed);
        assert_eq!(turns[0].failure_reason.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn test_delete_conversation() {
        let store = memory_store().await;
        let conv = ConversationId::from("c1");
        store.append(&Turn::user(conv.clone(), "a")).await.unwrap();
        store.append(&Turn::user(conv.clone(), "b")).await.unwrap();

        assert_eq!(store.delete(&conv).await.unwrap(), 2);
        assert!(store.read_all(&conv).await.unwrap().is_empty());
        assert_eq!(store.delete(&conv).await.unwrap(), 0);
    }
}
