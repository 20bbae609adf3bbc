//! Durable storage of task snapshots and pipeline configuration.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};

use crate::Result;

/// A persisted task snapshot.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StoredTask {
    pub uuid: String,
    /// JSON document of the task.
    pub snapshot: String,
}

/// Store of task snapshots keyed by pipeline kind and task UUID, plus one
/// configuration document per pipeline kind.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn load_tasks(&self, kind: &str) -> Result<Vec<StoredTask>>;
    async fn save_task(&self, kind: &str, uuid: &str, snapshot: &str) -> Result<()>;
    async fn delete_task(&self, kind: &str, uuid: &str) -> Result<()>;
    async fn delete_tasks(&self, kind: &str) -> Result<()>;

    async fn load_config(&self, kind: &str) -> Result<Option<String>>;
    async fn save_config(&self, kind: &str, config: &str) -> Result<()>;
}

/// SQLx implementation of PipelineStore.
pub struct SqlitePipelineStore {
    pool: SqlitePool,
}

impl SqlitePipelineStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PipelineStore for SqlitePipelineStore {
    async fn load_tasks(&self, kind: &str) -> Result<Vec<StoredTask>> {
        let tasks = sqlx::query_as::<_, StoredTask>(
            "SELECT uuid, snapshot FROM pipeline_task WHERE kind = ? ORDER BY uuid",
        )
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    async fn save_task(&self, kind: &str, uuid: &str, snapshot: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_task (kind, uuid, snapshot, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(kind, uuid) DO UPDATE SET
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(kind)
        .bind(uuid)
        .bind(snapshot)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_task(&self, kind: &str, uuid: &str) -> Result<()> {
        sqlx::query("DELETE FROM pipeline_task WHERE kind = ? AND uuid = ?")
            .bind(kind)
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_tasks(&self, kind: &str) -> Result<()> {
        sqlx::query("DELETE FROM pipeline_task WHERE kind = ?")
            .bind(kind)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_config(&self, kind: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT config FROM pipeline_config WHERE kind = ?")
                .bind(kind)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(config,)| config))
    }

    async fn save_config(&self, kind: &str, config: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_config (kind, config, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(kind) DO UPDATE SET
                config = excluded.config,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(kind)
        .bind(config)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory PipelineStore, for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryPipelineStore {
    tasks: Mutex<HashMap<String, BTreeMap<String, String>>>,
    configs: Mutex<HashMap<String, String>>,
}

impl MemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineStore for MemoryPipelineStore {
    async fn load_tasks(&self, kind: &str) -> Result<Vec<StoredTask>> {
        Ok(self
            .tasks
            .lock()
            .get(kind)
            .map(|tasks| {
                tasks
                    .iter()
                    .map(|(uuid, snapshot)| StoredTask {
                        uuid: uuid.clone(),
                        snapshot: snapshot.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save_task(&self, kind: &str, uuid: &str, snapshot: &str) -> Result<()> {
        self.tasks
            .lock()
            .entry(kind.to_string())
            .or_default()
            .insert(uuid.to_string(), snapshot.to_string());
        Ok(())
    }

    async fn delete_task(&self, kind: &str, uuid: &str) -> Result<()> {
        if let Some(tasks) = self.tasks.lock().get_mut(kind) {
            tasks.remove(uuid);
        }
        Ok(())
    }

    async fn delete_tasks(&self, kind: &str) -> Result<()> {
        self.tasks.lock().remove(kind);
        Ok(())
    }

    async fn load_config(&self, kind: &str) -> Result<Option<String>> {
        Ok(self.configs.lock().get(kind).cloned())
    }

    async fn save_config(&self, kind: &str, config: &str) -> Result<()> {
        self.configs
            .lock()
            .insert(kind.to_string(), config.to_string());
        Ok(())
    }
}
