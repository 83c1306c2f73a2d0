//! PostgreSQL-backed persistence implementation.
//!
//! Orchestration transactions lock the run row (`SELECT ... FOR UPDATE`) when
//! loading it, so attempts on the same run serialize while attempts on
//! different runs proceed independently. Concurrency limit rows are locked
//! the same way before slots are counted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
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

/// PostgreSQL-backed persistence provider.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new PostgreSQL persistence provider from an already migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to a `postgres://` URL and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await
            .map_err(|e| CoreError::database("connect", format!("Failed to connect: {}", e)))?;

        migrations::run_postgres(&pool)
            .await
            .map_err(|e| CoreError::database("migrate", format!("Failed to run migrations: {}", e)))?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Transaction handle over a pooled PostgreSQL connection.
pub struct PostgresRunTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl RunTransaction for PostgresRunTransaction {
    async fn get_run(&mut self, run_id: Uuid) -> Result<Option<Run>, CoreError> {
        let record = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {} FROM runs WHERE id = $1 FOR UPDATE",
            RUN_COLUMNS
        ))
        .bind(run_id.to_string())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| CoreError::from(e).with_run_id(run_id))?;

        record.map(Run::try_from).transpose()
    }

    async fn get_current_state(&mut self, run_id: Uuid) -> Result<Option<State>, CoreError> {
        let record = sqlx::query_as::<_, StateRecord>(
            r#"
            SELECT s.id, s.run_id, s.position, s.state_type, s.name, s.message, s.data,
                   s.scheduled_time, s.timestamp
            FROM runs r
            JOIN run_states s ON s.id = r.current_state_id
            WHERE r.id = $1
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

        // Lock in tag order so two runs sharing tags cannot deadlock.
        let mut sorted: Vec<&String> = tags.iter().collect();
        sorted.sort();
        sorted.dedup();

        for tag in sorted {
            let limit: Option<i64> = sqlx::query_scalar(
                "SELECT concurrency_limit FROM concurrency_limits WHERE tag = $1 FOR UPDATE",
            )
            .bind(tag)
            .fetch_optional(&mut *self.tx)
            .await?;
            let Some(limit) = limit else {
                continue;
            };

            let active: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM concurrency_slots WHERE tag = $1")
                    .bind(tag)
                    .fetch_one(&mut *self.tx)
                    .await?;

            let held: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM concurrency_slots WHERE tag = $1 AND run_id = $2)",
            )
            .bind(tag)
            .bind(&run_id)
            .fetch_one(&mut *self.tx)
            .await?;

            usage.push(ConcurrencySlotUsage {
                tag: tag.clone(),
                limit: u32::try_from(limit).unwrap_or(0),
                active: u32::try_from(active).unwrap_or(u32::MAX),
                held_by_run: held,
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
            SET current_state_id = $1
            WHERE id = $2 AND current_state_id IS NOT DISTINCT FROM $3
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

        let record = sqlx::query_as::<_, StateRecord>(&format!(
            r#"
            INSERT INTO run_states
                (id, run_id, position, state_type, name, message, data, scheduled_time, timestamp)
            VALUES (
                $1, $2,
                (SELECT COALESCE(MAX(position), 0) + 1 FROM run_states WHERE run_id = $2),
                $3, $4, $5, $6, $7, $8
            )
            RETURNING {}
            "#,
            STATE_COLUMNS
        ))
        .bind(state.id.to_string())
        .bind(&run_id)
        .bind(state.state_type.as_str())
        .bind(&state.name)
        .bind(&state.message)
        .bind(encode_data(state)?)
        .bind(state.details.scheduled_time)
        .bind(state.timestamp)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| CoreError::from(e).with_run_id(state.run_id))?;

        State::try_from(record)
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
                        INSERT INTO concurrency_slots (tag, run_id, acquired_at)
                        VALUES ($1, $2, NOW())
                        ON CONFLICT (tag, run_id) DO NOTHING
                        "#,
                    )
                    .bind(tag)
                    .bind(&run_id)
                    .execute(&mut *self.tx)
                    .await?;
                }
                PendingEffect::ReleaseConcurrencySlot { tag } => {
                    sqlx::query("DELETE FROM concurrency_slots WHERE tag = $1 AND run_id = $2")
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
impl Persistence for PostgresPersistence {
    async fn begin(&self) -> Result<Box<dyn RunTransaction>, CoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresRunTransaction { tx }))
    }

    async fn register_run(&self, run: &RunCreate) -> Result<Run, CoreError> {
        let run_id = run.id.unwrap_or_else(Uuid::new_v4);

        let record = sqlx::query_as::<_, RunRecord>(&format!(
            r#"
            INSERT INTO runs (id, name, tags, parameters, current_state_id, heartbeat_at, created_at)
            VALUES ($1, $2, $3, $4, NULL, NULL, NOW())
            ON CONFLICT (id) DO NOTHING
            RETURNING {}
            "#,
            RUN_COLUMNS
        ))
        .bind(run_id.to_string())
        .bind(&run.name)
        .bind(serde_json::to_string(&run.tags)?)
        .bind(serde_json::to_string(&run.parameters)?)
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => Run::try_from(record),
            None => Err(CoreError::RunAlreadyExists {
                run_id: run_id.to_string(),
            }),
        }
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, CoreError> {
        let record = sqlx::query_as::<_, RunRecord>(&format!(
            "SELECT {} FROM runs WHERE id = $1",
            RUN_COLUMNS
        ))
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        record.map(Run::try_from).transpose()
    }

    async fn get_state(&self, state_id: Uuid) -> Result<Option<State>, CoreError> {
        let record = sqlx::query_as::<_, StateRecord>(&format!(
            "SELECT {} FROM run_states WHERE id = $1",
            STATE_COLUMNS
        ))
        .bind(state_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        record.map(State::try_from).transpose()
    }

    async fn list_states(&self, run_id: Uuid) -> Result<Vec<State>, CoreError> {
        let records = sqlx::query_as::<_, StateRecord>(&format!(
            "SELECT {} FROM run_states WHERE run_id = $1 ORDER BY position ASC",
            STATE_COLUMNS
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        records.into_iter().map(State::try_from).collect()
    }

    async fn record_heartbeat(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<bool, CoreError> {
        let result = sqlx::query("UPDATE runs SET heartbeat_at = $1 WHERE id = $2")
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
            VALUES ($1, $2, NOW())
            ON CONFLICT (tag) DO UPDATE
            SET concurrency_limit = EXCLUDED.concurrency_limit, updated_at = NOW()
            "#,
        )
        .bind(tag)
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_concurrency_limit(&self, tag: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM concurrency_limits WHERE tag = $1")
            .bind(tag)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_concurrency_slots(&self, tag: &str) -> Result<Vec<Uuid>, CoreError> {
        let run_ids: Vec<String> = sqlx::query_scalar(
            "SELECT run_id FROM concurrency_slots WHERE tag = $1 ORDER BY acquired_at ASC",
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
