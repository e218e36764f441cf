//! SQLite-based persistence store
//!
//! Records are stored as JSON bodies next to the columns the queries filter
//! on. Updates are guarded by the `version` column.

use crate::core::{NodeExecution, PlanExecution};
use crate::persistence::{NodeExecutionStore, PlanExecutionStore, ProcessedEventStore, StoreError};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        StoreError::Backend(error.to_string())
    }
}

/// SQLite execution store
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    /// Open (or create) the database file at `db_path`
    pub async fn new(db_path: &str) -> Result<Self> {
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", db_path))
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Private in-memory database, mostly for tests
    pub async fn in_memory() -> Result<Self> {
        // One connection, otherwise every connection sees its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("plan-engine");
        std::fs::create_dir_all(&db_dir)?;

        let db_path = db_dir.join("executions.db");
        let db_path = db_path
            .to_str()
            .context("Database path is not valid UTF-8")?;
        Self::new(db_path).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS node_executions (
                id TEXT PRIMARY KEY,
                plan_execution_id TEXT NOT NULL,
                parent_id TEXT,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                body TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_node_plan_execution ON node_executions(plan_execution_id)",
            "CREATE INDEX IF NOT EXISTS idx_node_parent ON node_executions(parent_id)",
            r#"
            CREATE TABLE IF NOT EXISTS plan_executions (
                id TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                start_ts TEXT NOT NULL,
                body TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_plan_id ON plan_executions(plan_id)",
            r#"
            CREATE TABLE IF NOT EXISTS event_claims (
                event_key TEXT PRIMARY KEY,
                done INTEGER NOT NULL DEFAULT 0,
                claimed_at_ms INTEGER NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to initialize schema")?;
        }

        Ok(())
    }

    async fn stored_version(&self, table: &str, id: Uuid) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query(&format!("SELECT version FROM {} WHERE id = ?1", table))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get::<i64, _>("version") as u64))
    }

    async fn conflict_or_missing(&self, table: &str, id: Uuid, expected: u64) -> StoreError {
        match self.stored_version(table, id).await {
            Ok(Some(found)) => StoreError::VersionConflict { id, expected, found },
            Ok(None) => StoreError::NotFound(id),
            Err(error) => error,
        }
    }

    fn decode_nodes(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<NodeExecution>, StoreError> {
        rows.iter()
            .map(|row| Ok(serde_json::from_str(&row.get::<String, _>("body"))?))
            .collect()
    }
}

#[async_trait::async_trait]
impl NodeExecutionStore for SqliteExecutionStore {
    async fn save(&self, node: &NodeExecution) -> Result<NodeExecution, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO node_executions
            (id, plan_execution_id, parent_id, status, version, created_at, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(node.id.to_string())
        .bind(node.ambiance.plan_execution_id.to_string())
        .bind(node.parent_id.map(|id| id.to_string()))
        .bind(node.status.as_str())
        .bind(node.version as i64)
        .bind(node.created_at.to_rfc3339())
        .bind(serde_json::to_string(node)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(node.id));
        }
        Ok(node.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<NodeExecution>, StoreError> {
        let row = sqlx::query("SELECT body FROM node_executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_str(&row.get::<String, _>("body"))?)),
            None => Ok(None),
        }
    }

    async fn update(&self, node: &NodeExecution) -> Result<NodeExecution, StoreError> {
        let mut next = node.clone();
        next.version = node.version + 1;
        next.last_updated_at = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE node_executions
            SET status = ?1, version = ?2, body = ?3
            WHERE id = ?4 AND version = ?5
            "#,
        )
        .bind(next.status.as_str())
        .bind(next.version as i64)
        .bind(serde_json::to_string(&next)?)
        .bind(node.id.to_string())
        .bind(node.version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.conflict_or_missing("node_executions", node.id, node.version).await);
        }
        Ok(next)
    }

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<NodeExecution>, StoreError> {
        let rows = sqlx::query(
            "SELECT body FROM node_executions WHERE parent_id = ?1 ORDER BY created_at",
        )
        .bind(parent_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Self::decode_nodes(rows)
    }

    async fn list_by_plan_execution(
        &self,
        plan_execution_id: Uuid,
    ) -> Result<Vec<NodeExecution>, StoreError> {
        let rows = sqlx::query(
            "SELECT body FROM node_executions WHERE plan_execution_id = ?1 ORDER BY created_at",
        )
        .bind(plan_execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Self::decode_nodes(rows)
    }
}

#[async_trait::async_trait]
impl PlanExecutionStore for SqliteExecutionStore {
    async fn save_plan_execution(&self, execution: &PlanExecution) -> Result<PlanExecution, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO plan_executions
            (id, plan_id, status, version, start_ts, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(&execution.plan_id)
        .bind(execution.status.as_str())
        .bind(execution.version as i64)
        .bind(execution.start_ts.to_rfc3339())
        .bind(serde_json::to_string(execution)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(execution.id));
        }
        Ok(execution.clone())
    }

    async fn get_plan_execution(&self, id: Uuid) -> Result<Option<PlanExecution>, StoreError> {
        let row = sqlx::query("SELECT body FROM plan_executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_str(&row.get::<String, _>("body"))?)),
            None => Ok(None),
        }
    }

    async fn update_plan_execution(&self, execution: &PlanExecution) -> Result<PlanExecution, StoreError> {
        let mut next = execution.clone();
        next.version = execution.version + 1;

        let result = sqlx::query(
            r#"
            UPDATE plan_executions
            SET status = ?1, version = ?2, body = ?3
            WHERE id = ?4 AND version = ?5
            "#,
        )
        .bind(next.status.as_str())
        .bind(next.version as i64)
        .bind(serde_json::to_string(&next)?)
        .bind(execution.id.to_string())
        .bind(execution.version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .conflict_or_missing("plan_executions", execution.id, execution.version)
                .await);
        }
        Ok(next)
    }

    async fn list_plan_executions(&self, plan_id: Option<&str>) -> Result<Vec<PlanExecution>, StoreError> {
        let rows = match plan_id {
            Some(plan_id) => {
                sqlx::query(
                    "SELECT body FROM plan_executions WHERE plan_id = ?1 ORDER BY start_ts DESC",
                )
                .bind(plan_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT body FROM plan_executions ORDER BY start_ts DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter()
            .map(|row| Ok(serde_json::from_str(&row.get::<String, _>("body"))?))
            .collect()
    }
}

#[async_trait::async_trait]
impl ProcessedEventStore for SqliteExecutionStore {
    async fn try_claim(&self, key: &str, lease: Duration) -> Result<bool, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let stale_before_ms = now_ms.saturating_sub(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX));
        let result = sqlx::query(
            r#"
            INSERT INTO event_claims (event_key, done, claimed_at_ms) VALUES (?1, 0, ?2)
            ON CONFLICT(event_key) DO UPDATE SET claimed_at_ms = excluded.claimed_at_ms
            WHERE event_claims.done = 0 AND event_claims.claimed_at_ms <= ?3
            "#,
        )
        .bind(key)
        .bind(now_ms)
        .bind(stale_before_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE event_claims SET done = 1 WHERE event_key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM event_claims WHERE event_key = ?1 AND done = 0")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
