//! SQLite-backed persistence implementation.
//!
//! SQLite admits a single writer at a time. Two attempts that read the same
//! current state cannot both commit: the loser either fails the current-state
//! compare-and-set or gets `SQLITE_BUSY`, and both surface as
//! [`CoreError::ConcurrentModification`].

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::context::{ConcurrencySlotUsage, PendingEffect};
use crate::error::CoreError;
use crate::migrations;
use crate::runs::{Run, RunCreate};
use crate::states::State;

use super::{Persistence, RunRecord, RunTransaction, StateRecord, encode_data, parse_uuid};

const RUN_COLUMNS: &str =
    "id, name, tags, parameters, current_state_id, heartbeat_at, created_at";

const STATE_COLUMNS: &str =
    "id, run_id, position, state_type, name, message, data, scheduled_time, timestamp";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a `sqlite:` URL and run migrations.
    ///
    /// In-memory databases are private to a connection, so they always get a
    /// single-connection pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let max_connections = if url.contains(":memory:") {
            1
        } else {
            max_connections.max(1)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| {
                CoreError::database("connect", format!("Failed to connect to {}: {}", url, e))
            })?;

        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::database("migrate", format!("Failed to run migrations: {}", e)))?;

        Ok(Self { pool })
    }

    /// Create and initialize a SQLite database at a file path.
    ///
    /// Creates parent directories and the database file as needed.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::database(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Transaction handle over a pooled SQLite connection.
pub struct SqliteRunTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl RunTransaction for SqliteRunTransaction {
    async fn get_run(&mut self, run_id: Uuid) -> Result<Option<Run>, CoreError> {
        let record = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {} FROM runs WHERE id = ?",
            RUN_COLUMNS
        ))
        .bind(run_id.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;

        record.map(Run::try_from).transpose()
    }

    async fn get_current_state(&mut self, run_id: Uuid) -> Result<Option<State>, CoreError> {
        let record = sqlx::query_as::<_, StateRecord>(
            r#"
            SELECT s.id, s.run_id, s.position, s.state_type, s.name, s.message, s.data,
                   s.scheduled_time, s.timestamp
            FROM runs r
            JOIN run_states s ON s.id = r.current_state_id
            WHERE r.id = ?
            "#,
        )
        .bind(run_id.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;

        record.map(State::try_from).transpose()
    }

    async fn concurrency_usage(
        &mut self,
        run_id: Uuid,
        tags: &[String],
    ) -> Result<Vec<ConcurrencySlotUsage>, CoreError> {
        let run_id = run_id.to_string();
        let mut usage = Vec::new();

        for tag in tags {
            let limit: Option<i64> = sqlx::query_scalar(
                "SELECT concurrency_limit FROM concurrency_limits WHERE tag = ?",
            )
            .bind(tag)
            .fetch_optional(&mut *self.tx)
            .await?;
            let Some(limit) = limit else {
                continue;
            };

            let active: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM concurrency_slots WHERE tag = ?")
                    .bind(tag)
                    .fetch_one(&mut *self.tx)
                    .await?;

            let held: Option<i64> = sqlx::query_scalar(
                "SELECT 1 FROM concurrency_slots WHERE tag = ? AND run_id = ?",
            )
            .bind(tag)
            .bind(&run_id)
            .fetch_optional(&mut *self.tx)
            .await?;

            usage.push(ConcurrencySlotUsage {
                tag: tag.clone(),
                limit: u32::try_from(limit).unwrap_or(0),
                active: u32::try_from(active).unwrap_or(u32::MAX),
                held_by_run: held.is_some(),
            });
        }

        Ok(usage)
    }

    async fn append_state(
        &mut self,
        expected_current: Option<Uuid>,
        state: &State,
    ) -> Result<State, CoreError> {
        let run_id = state.run_id.to_string();

        let updated = sqlx::query(
            r#"
            UPDATE runs
            SET current_state_id = ?1
            WHERE id = ?2 AND current_state_id IS ?3
            "#,
        )
        .bind(state.id.to_string())
        .bind(&run_id)
        .bind(expected_current.map(|id| id.to_string()))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| CoreError::from(e).with_run_id(state.run_id))?;

        if updated.rows_affected() == 0 {
            return Err(CoreError::conflict(
                state.run_id,
                "current state changed since it was read",
            ));
        }

        let position: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(position), 0) + 1 FROM run_states WHERE run_id = ?",
        )
        .bind(&run_id)
        .fetch_one(&mut *self.tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO run_states
                (id, run_id, position, state_type, name, message, data, scheduled_time, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(state.id.to_string())
        .bind(&run_id)
        .bind(position)
        .bind(state.state_type.as_str())
        .bind(&state.name)
        .bind(&state.message)
        .bind(encode_data(state)?)
        .bind(state.details.scheduled_time)
        .bind(state.timestamp)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| CoreError::from(e).with_run_id(state.run_id))?;

        Ok(state.clone())
    }

    async fn apply_pending_effects(
        &mut self,
        run_id: Uuid,
        effects: &[PendingEffect],
    ) -> Result<(), CoreError> {
        let run_id = run_id.to_string();
        for effect in effects {
            match effect {
                PendingEffect::AcquireConcurrencySlot { tag } => {
                    sqlx::query(
                        r#"
                        INSERT OR IGNORE INTO concurrency_slots (tag, run_id, acquired_at)
                        VALUES (?, ?, ?)
                        "#,
                    )
                    .bind(tag)
                    .bind(&run_id)
                    .bind(Utc::now())
                    .execute(&mut *self.tx)
                    .await?;
                }
                PendingEffect::ReleaseConcurrencySlot { tag } => {
                    sqlx::query("DELETE FROM concurrency_slots WHERE tag = ? AND run_id = ?")
                        .bind(tag)
                        .bind(&run_id)
                        .execute(&mut *self.tx)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), CoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), CoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn begin(&self) -> Result<Box<dyn RunTransaction>, CoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteRunTransaction { tx }))
    }

    async fn register_run(&self, run: &RunCreate) -> Result<Run, CoreError> {
        let run_id = run.id.unwrap_or_else(Uuid::new_v4);
        if self.get_run(run_id).await?.is_some() {
            return Err(CoreError::RunAlreadyExists {
                run_id: run_id.to_string(),
            });
        }

        let created_at = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO runs (id, name, tags, parameters, current_state_id, heartbeat_at, created_at)
            VALUES (?, ?, ?, ?, NULL, NULL, ?)
            "#,
        )
        .bind(run_id.to_string())
        .bind(&run.name)
        .bind(serde_json::to_string(&run.tags)?)
        .bind(serde_json::to_string(&run.parameters)?)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match CoreError::from(e) {
            CoreError::ConcurrentModification { .. } => CoreError::RunAlreadyExists {
                run_id: run_id.to_string(),
            },
            other => other,
        })?;

        Ok(Run {
            id: run_id,
            name: run.name.clone(),
            tags: run.tags.clone(),
            parameters: run.parameters.clone(),
            current_state_id: None,
            heartbeat_at: None,
            created_at,
        })
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, CoreError> {
        let record = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {} FROM runs WHERE id = ?",
            RUN_COLUMNS
        ))
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        record.map(Run::try_from).transpose()
    }

    async fn get_state(&self, state_id: Uuid) -> Result<Option<State>, CoreError> {
        let record = sqlx::query_as::<_, StateRecord>(&format!(
            "SELECT {} FROM run_states WHERE id = ?",
            STATE_COLUMNS
        ))
        .bind(state_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        record.map(State::try_from).transpose()
    }

    async fn list_states(&self, run_id: Uuid) -> Result<Vec<State>, CoreError> {
        let records = sqlx::query_as::<_, StateRecord>(&format!(
            "SELECT {} FROM run_states WHERE run_id = ? ORDER BY position ASC",
            STATE_COLUMNS
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        records.into_iter().map(State::try_from).collect()
    }

    async fn record_heartbeat(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<bool, CoreError> {
        let result = sqlx::query("UPDATE runs SET heartbeat_at = ? WHERE id = ?")
            .bind(at)
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_concurrency_limit(&self, tag: &str, limit: u32) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO concurrency_limits (tag, concurrency_limit, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(tag) DO UPDATE SET concurrency_limit = ?2, updated_at = ?3
            "#,
        )
        .bind(tag)
        .bind(i64::from(limit))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_concurrency_limit(&self, tag: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM concurrency_limits WHERE tag = ?")
            .bind(tag)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_concurrency_slots(&self, tag: &str) -> Result<Vec<Uuid>, CoreError> {
        let run_ids: Vec<String> = sqlx::query_scalar(
            "SELECT run_id FROM concurrency_slots WHERE tag = ? ORDER BY acquired_at ASC",
        )
        .bind(tag)
        .fetch_all(&self.pool)
        .await?;

        run_ids
            .iter()
            .map(|id| parse_uuid("concurrency_slots.run_id", id))
            .collect()
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
