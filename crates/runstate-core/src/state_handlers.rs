// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run and state handlers for runstate-core.
//!
//! These handlers are the surface transport adapters call into: run
//! registration, state proposals, state reads, heartbeats and concurrency
//! limit administration. All state writes go through the [`Orchestrator`].

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::context::OrchestrationResult;
use crate::error::{CoreError, Result};
use crate::orchestrator::Orchestrator;
use crate::persistence::Persistence;
use crate::runs::{Run, RunCreate};
use crate::states::{State, StateCreate};

/// Shared state for the run and state handlers.
pub struct StateHandlerState {
    /// Orchestrator that decides every state write.
    pub orchestrator: Arc<Orchestrator>,
    /// Persistence implementation.
    pub persistence: Arc<dyn Persistence>,
}

impl StateHandlerState {
    /// Create handler state around an orchestrator, sharing its persistence.
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let persistence = orchestrator.persistence().clone();
        Self {
            orchestrator,
            persistence,
        }
    }
}

/// Request to create a state for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStateRequest {
    /// Target run.
    pub run_id: Uuid,
    /// State to create.
    pub state: StateCreate,
}

/// Request to move a run to a new state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStateRequest {
    /// Target run.
    pub run_id: Uuid,
    /// Proposed state.
    pub state: StateCreate,
}

// ============================================================================
// Runs
// ============================================================================

/// Handle run registration.
///
/// # Errors
///
/// - [`CoreError::ValidationError`] if the name is empty
/// - [`CoreError::RunAlreadyExists`] if an explicit id is already taken
#[instrument(skip(state, request), fields(name = %request.name))]
pub async fn handle_register_run(state: &StateHandlerState, request: RunCreate) -> Result<Run> {
    if request.name.trim().is_empty() {
        return Err(CoreError::ValidationError {
            field: "name".to_string(),
            message: "name is required".to_string(),
        });
    }

    let run = state.persistence.register_run(&request).await?;
    info!(run_id = %run.id, tags = ?run.tags, "Run registered");
    Ok(run)
}

/// Handle a run heartbeat.
#[instrument(skip(state))]
pub async fn handle_record_heartbeat(state: &StateHandlerState, run_id: Uuid) -> Result<()> {
    if !state.persistence.record_heartbeat(run_id, Utc::now()).await? {
        return Err(CoreError::RunNotFound {
            run_id: run_id.to_string(),
        });
    }
    debug!("Heartbeat recorded");
    Ok(())
}

// ============================================================================
// State writes
// ============================================================================

/// Handle state creation.
///
/// The first state of a run is trusted registration and skips the rule
/// pipeline. Once a run has a current state, creation is governed like any
/// other proposal. The check happens inside the orchestration transaction.
///
/// # Errors
///
/// - [`CoreError::RunNotFound`] if the run does not exist
#[instrument(skip(state, request), fields(run_id = %request.run_id, state_type = %request.state.state_type))]
pub async fn handle_create_state(
    state: &StateHandlerState,
    request: CreateStateRequest,
) -> Result<OrchestrationResult> {
    let proposed = request.state.into_state(request.run_id);
    state
        .orchestrator
        .orchestrate_initial(request.run_id, proposed)
        .await
}

/// Handle a state proposal. Always governed by the rule pipeline.
#[instrument(skip(state, request), fields(run_id = %request.run_id, state_type = %request.state.state_type))]
pub async fn handle_set_state(
    state: &StateHandlerState,
    request: SetStateRequest,
) -> Result<OrchestrationResult> {
    let proposed = request.state.into_state(request.run_id);
    state
        .orchestrator
        .orchestrate(request.run_id, proposed, true)
        .await
}

// ============================================================================
// Reads
// ============================================================================

/// Handle a read of one committed state.
#[instrument(skip(state))]
pub async fn handle_read_state(state: &StateHandlerState, state_id: Uuid) -> Result<State> {
    state.orchestrator.read_state(state_id).await
}

/// Handle a read of a run's history. Unknown runs have an empty history.
#[instrument(skip(state))]
pub async fn handle_read_states(state: &StateHandlerState, run_id: Uuid) -> Result<Vec<State>> {
    state.orchestrator.read_states_for_run(run_id).await
}

// ============================================================================
// Concurrency limits
// ============================================================================

/// Handle creating or updating a tag's concurrency limit.
#[instrument(skip(state))]
pub async fn handle_set_concurrency_limit(
    state: &StateHandlerState,
    tag: &str,
    limit: u32,
) -> Result<()> {
    if tag.trim().is_empty() {
        return Err(CoreError::ValidationError {
            field: "tag".to_string(),
            message: "tag is required".to_string(),
        });
    }

    state.persistence.set_concurrency_limit(tag, limit).await?;
    info!("Concurrency limit set");
    Ok(())
}

/// Handle removing a tag's concurrency limit. Returns false if none existed.
#[instrument(skip(state))]
pub async fn handle_delete_concurrency_limit(state: &StateHandlerState, tag: &str) -> Result<bool> {
    let deleted = state.persistence.delete_concurrency_limit(tag).await?;
    if deleted {
        info!("Concurrency limit removed");
    }
    Ok(deleted)
}

// ============================================================================
// Health
// ============================================================================

/// Handle a health check.
pub async fn handle_health_check(state: &StateHandlerState) -> Result<bool> {
    state.persistence.health_check_db().await
}
