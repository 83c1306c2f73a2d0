//! Persistence interfaces and backends for runstate-core.
//!
//! This module defines the persistence abstraction the orchestrator consumes
//! and the SQLite and PostgreSQL backend implementations.
//!
//! Orchestration goes through a [`RunTransaction`]: the current state is read
//! and the new state appended inside one transaction. Dropping a transaction
//! handle without calling [`RunTransaction::commit`] rolls it back, so an
//! aborted or failed attempt never leaves a partial commit.

pub mod postgres;
pub mod sqlite;

use std::sync::Arc;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::context::{ConcurrencySlotUsage, PendingEffect};
use crate::error::CoreError;
use crate::runs::{Run, RunCreate};
use crate::states::{State, StateDetails, StateType};

/// Run row from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    /// Run identifier.
    pub id: String,
    /// Run name.
    pub name: String,
    /// Tags as a JSON array.
    pub tags: String,
    /// Parameters as JSON.
    pub parameters: Option<String>,
    /// Id of the current state.
    pub current_state_id: Option<String>,
    /// Last heartbeat.
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// When the run was registered.
    pub created_at: DateTime<Utc>,
}

impl TryFrom<RunRecord> for Run {
    type Error = CoreError;

    fn try_from(record: RunRecord) -> Result<Self, Self::Error> {
        Ok(Run {
            id: parse_uuid("runs.id", &record.id)?,
            name: record.name,
            tags: serde_json::from_str(&record.tags)?,
            parameters: match record.parameters {
                Some(raw) => serde_json::from_str(&raw)?,
                None => serde_json::Value::Null,
            },
            current_state_id: record
                .current_state_id
                .as_deref()
                .map(|id| parse_uuid("runs.current_state_id", id))
                .transpose()?,
            heartbeat_at: record.heartbeat_at,
            created_at: record.created_at,
        })
    }
}

/// State history row from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StateRecord {
    /// State identifier.
    pub id: String,
    /// Owning run.
    pub run_id: String,
    /// 1-based position in the run's history.
    pub position: i64,
    /// State type (SCHEDULED, PENDING, RUNNING, ...).
    pub state_type: String,
    /// Display name.
    pub name: String,
    /// Optional message.
    pub message: Option<String>,
    /// Payload as JSON.
    pub data: Option<String>,
    /// Scheduled time detail.
    pub scheduled_time: Option<DateTime<Utc>>,
    /// State timestamp.
    pub timestamp: DateTime<Utc>,
}

impl TryFrom<StateRecord> for State {
    type Error = CoreError;

    fn try_from(record: StateRecord) -> Result<Self, Self::Error> {
        let state_type: StateType = record
            .state_type
            .parse()
            .map_err(|e: String| CoreError::database("decode_state", e))?;
        Ok(State {
            id: parse_uuid("run_states.id", &record.id)?,
            run_id: parse_uuid("run_states.run_id", &record.run_id)?,
            state_type,
            name: record.name,
            message: record.message,
            data: record
                .data
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            details: StateDetails {
                scheduled_time: record.scheduled_time,
            },
            timestamp: record.timestamp,
        })
    }
}

fn parse_uuid(column: &str, raw: &str) -> Result<Uuid, CoreError> {
    Uuid::parse_str(raw)
        .map_err(|e| CoreError::database("decode", format!("invalid uuid in {}: {}", column, e)))
}

fn encode_data(state: &State) -> Result<Option<String>, CoreError> {
    Ok(state
        .data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?)
}

/// Transaction scoped to one orchestration attempt.
///
/// All reads see a snapshot isolated from concurrent attempts on the same
/// run; `append_state` fails with [`CoreError::ConcurrentModification`] if
/// another attempt committed first.
#[async_trait]
pub trait RunTransaction: Send {
    /// Load the run, locking it against concurrent orchestration where the
    /// backend supports row locks.
    async fn get_run(&mut self, run_id: Uuid) -> Result<Option<Run>, CoreError>;

    /// Load the run's current state.
    async fn get_current_state(&mut self, run_id: Uuid) -> Result<Option<State>, CoreError>;

    /// Concurrency usage for every tag in `tags` that has a limit.
    async fn concurrency_usage(
        &mut self,
        run_id: Uuid,
        tags: &[String],
    ) -> Result<Vec<ConcurrencySlotUsage>, CoreError>;

    /// Append `state` to its run's history and make it current.
    ///
    /// `expected_current` is the current-state id observed when the attempt
    /// started; the write only succeeds if it is still current.
    async fn append_state(
        &mut self,
        expected_current: Option<Uuid>,
        state: &State,
    ) -> Result<State, CoreError>;

    /// Apply effects recorded by rules, in order.
    async fn apply_pending_effects(
        &mut self,
        run_id: Uuid,
        effects: &[PendingEffect],
    ) -> Result<(), CoreError>;

    /// Commit everything written through this handle.
    async fn commit(self: Box<Self>) -> Result<(), CoreError>;

    /// Discard everything written through this handle.
    async fn rollback(self: Box<Self>) -> Result<(), CoreError>;
}

/// Persistence interface used by the orchestrator and state handlers.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Open a transaction for one orchestration attempt.
    async fn begin(&self) -> Result<Box<dyn RunTransaction>, CoreError>;

    /// Register a run with no states.
    async fn register_run(&self, run: &RunCreate) -> Result<Run, CoreError>;

    /// Look up a run.
    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, CoreError>;

    /// Look up a committed state.
    async fn get_state(&self, state_id: Uuid) -> Result<Option<State>, CoreError>;

    /// Committed states of a run, oldest first.
    async fn list_states(&self, run_id: Uuid) -> Result<Vec<State>, CoreError>;

    /// Record a heartbeat. Returns false if the run does not exist.
    async fn record_heartbeat(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<bool, CoreError>;

    /// Create or update the concurrency limit for a tag.
    async fn set_concurrency_limit(&self, tag: &str, limit: u32) -> Result<(), CoreError>;

    /// Remove the concurrency limit for a tag. Returns false if none existed.
    async fn delete_concurrency_limit(&self, tag: &str) -> Result<bool, CoreError>;

    /// Run ids currently holding a slot under `tag`.
    async fn list_concurrency_slots(&self, tag: &str) -> Result<Vec<Uuid>, CoreError>;

    /// Check database connectivity.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}

/// Connect to the database at `url`, run migrations, and return the backend.
///
/// `sqlite:` URLs select [`SqlitePersistence`]; `postgres://` and
/// `postgresql://` select [`PostgresPersistence`].
pub async fn connect(url: &str, max_connections: u32) -> Result<Arc<dyn Persistence>, CoreError> {
    if url.starts_with("sqlite:") {
        let persistence = SqlitePersistence::connect(url, max_connections).await?;
        Ok(Arc::new(persistence))
    } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let persistence = PostgresPersistence::connect(url, max_connections).await?;
        Ok(Arc::new(persistence))
    } else {
        Err(CoreError::ValidationError {
            field: "database_url".to_string(),
            message: "expected a sqlite: or postgres:// URL".to_string(),
        })
    }
}
