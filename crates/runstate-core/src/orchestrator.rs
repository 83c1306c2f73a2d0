// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The orchestrator: transactional entry point for state proposals.
//!
//! One call to [`Orchestrator::orchestrate`] runs one or more attempts. Each
//! attempt opens a transaction, loads the run and its current state, applies
//! the structural check and (on the governed path) the rule pipeline, and
//! commits the decided state together with the effects rules recorded.
//! Attempts that lose a race with a concurrent commit on the same run are
//! retried from scratch against the newly committed state, up to
//! `max_commit_attempts`.
//!
//! # Example
//!
//! ```rust,ignore
//! use runstate_core::orchestrator::Orchestrator;
//! use runstate_core::persistence::SqlitePersistence;
//! use runstate_core::states::{State, StateType};
//!
//! let persistence = Arc::new(SqlitePersistence::from_path(".data/runs.db").await?);
//! let orchestrator = Orchestrator::builder().persistence(persistence).build()?;
//!
//! let result = orchestrator
//!     .orchestrate(run_id, State::new(run_id, StateType::Running), true)
//!     .await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::context::{
    INVALID_TRANSITION, OrchestrationContext, OrchestrationResult, ResponseDetails,
    SetStateStatus,
};
use crate::error::{CoreError, Result};
use crate::persistence::{Persistence, RunTransaction};
use crate::pipeline::{DEFAULT_CONCURRENCY_RETRY_AFTER, RulePipeline};
use crate::states::{State, is_structurally_allowed_from};

/// Default number of attempts before a conflict is surfaced to the caller.
pub const DEFAULT_MAX_COMMIT_ATTEMPTS: u32 = 3;

/// Builder for creating an [`Orchestrator`].
pub struct OrchestratorBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    pipeline: Option<RulePipeline>,
    max_commit_attempts: u32,
}

impl std::fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("pipeline", &self.pipeline)
            .field("max_commit_attempts", &self.max_commit_attempts)
            .finish()
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            pipeline: None,
            max_commit_attempts: DEFAULT_MAX_COMMIT_ATTEMPTS,
        }
    }
}

impl OrchestratorBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the rule pipeline for governed proposals.
    ///
    /// Default: [`RulePipeline::standard`] without heartbeat expiry.
    pub fn pipeline(mut self, pipeline: RulePipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Set how many attempts a proposal gets when it loses a commit race.
    ///
    /// Default: 3. Values below 1 are treated as 1.
    pub fn max_commit_attempts(mut self, attempts: u32) -> Self {
        self.max_commit_attempts = attempts.max(1);
        self
    }

    /// Create a builder with the pipeline and retry settings from a [`Config`].
    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .pipeline(RulePipeline::standard(
                config.concurrency_retry_after,
                config.heartbeat_timeout,
            ))
            .max_commit_attempts(config.max_commit_attempts)
    }

    /// Build the orchestrator.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<Orchestrator> {
        let persistence = self.persistence.ok_or_else(|| CoreError::ValidationError {
            field: "persistence".to_string(),
            message: "persistence is required".to_string(),
        })?;

        Ok(Orchestrator {
            persistence,
            pipeline: self
                .pipeline
                .unwrap_or_else(|| RulePipeline::standard(DEFAULT_CONCURRENCY_RETRY_AFTER, None)),
            max_commit_attempts: self.max_commit_attempts,
        })
    }
}

/// Decides and commits run state transitions.
pub struct Orchestrator {
    persistence: Arc<dyn Persistence>,
    pipeline: RulePipeline,
    max_commit_attempts: u32,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("persistence", &"...")
            .field("pipeline", &self.pipeline)
            .field("max_commit_attempts", &self.max_commit_attempts)
            .finish()
    }
}

impl Orchestrator {
    /// Create a builder.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// The persistence backend.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// The governed-path pipeline.
    pub fn pipeline(&self) -> &RulePipeline {
        &self.pipeline
    }

    /// Propose `proposed` as the new state of `run_id`.
    ///
    /// With `apply_orchestration_rules` false the pipeline is skipped and the
    /// proposal is committed as given. This path is for trusted initial
    /// registration only. The structural check applies on both paths.
    ///
    /// # Errors
    ///
    /// - [`CoreError::RunNotFound`] if the run does not exist
    /// - [`CoreError::ValidationError`] if `proposed` belongs to another run
    /// - [`CoreError::ConcurrentModification`] if every attempt lost a commit race
    /// - [`CoreError::DatabaseError`] on storage faults
    #[instrument(
        skip(self, proposed),
        fields(run_id = %run_id, proposed = %proposed.state_type, governed = apply_orchestration_rules)
    )]
    pub async fn orchestrate(
        &self,
        run_id: Uuid,
        proposed: State,
        apply_orchestration_rules: bool,
    ) -> Result<OrchestrationResult> {
        self.orchestrate_with_retry(
            run_id,
            proposed,
            Governance::from_flag(apply_orchestration_rules),
        )
        .await
    }

    /// Propose `proposed`, skipping the pipeline only if the run has no state yet.
    ///
    /// The choice is made inside each attempt from the state loaded in that
    /// attempt's transaction. A proposal that loses the race for a run's first
    /// state is re-evaluated against the winner under the full pipeline.
    ///
    /// # Errors
    ///
    /// Same as [`Orchestrator::orchestrate`].
    #[instrument(skip(self, proposed), fields(run_id = %run_id, proposed = %proposed.state_type))]
    pub async fn orchestrate_initial(
        &self,
        run_id: Uuid,
        proposed: State,
    ) -> Result<OrchestrationResult> {
        self.orchestrate_with_retry(run_id, proposed, Governance::BypassFirstState)
            .await
    }

    async fn orchestrate_with_retry(
        &self,
        run_id: Uuid,
        proposed: State,
        governance: Governance,
    ) -> Result<OrchestrationResult> {
        check_owner(run_id, &proposed)?;

        let mut attempt = 1;
        loop {
            let outcome = match self.persistence.begin().await {
                Ok(tx) => self.attempt(tx, run_id, proposed.clone(), governance).await,
                Err(err) => Err(err),
            };
            match outcome {
                Err(err @ CoreError::ConcurrentModification { .. })
                    if attempt < self.max_commit_attempts =>
                {
                    warn!(attempt, error = %err, "Lost commit race, re-evaluating proposal");
                    attempt += 1;
                }
                Err(err @ CoreError::ConcurrentModification { .. }) => {
                    warn!(attempt, error = %err, "Giving up after repeated commit conflicts");
                    return Err(err.with_run_id(run_id));
                }
                other => return other,
            }
        }
    }

    /// Run a single orchestration attempt inside `tx`.
    ///
    /// The transaction is committed when the proposal is accepted and rolled
    /// back otherwise, including on every error path. No retry happens here;
    /// a lost commit race surfaces as [`CoreError::ConcurrentModification`].
    pub async fn orchestrate_in(
        &self,
        tx: Box<dyn RunTransaction>,
        run_id: Uuid,
        proposed: State,
        apply_orchestration_rules: bool,
    ) -> Result<OrchestrationResult> {
        self.attempt(tx, run_id, proposed, Governance::from_flag(apply_orchestration_rules))
            .await
    }

    async fn attempt(
        &self,
        mut tx: Box<dyn RunTransaction>,
        run_id: Uuid,
        mut proposed: State,
        governance: Governance,
    ) -> Result<OrchestrationResult> {
        check_owner(run_id, &proposed)?;

        let run = tx
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        let initial = tx.get_current_state(run_id).await?;
        let apply_orchestration_rules = governance.applies_rules(initial.as_ref());

        if !is_structurally_allowed_from(initial.as_ref(), proposed.state_type) {
            debug!(
                from = ?initial.as_ref().map(|s| s.state_type),
                "Structurally invalid transition rejected"
            );
            tx.rollback().await?;
            return Ok(OrchestrationResult {
                state: initial,
                status: SetStateStatus::Reject,
                details: ResponseDetails::Rejected {
                    reason: INVALID_TRANSITION.to_string(),
                },
            });
        }

        // History timestamps never go backwards.
        if let Some(current) = &initial
            && proposed.timestamp < current.timestamp
        {
            proposed.timestamp = current.timestamp;
        }

        let concurrency = if apply_orchestration_rules {
            tx.concurrency_usage(run_id, &run.tags).await?
        } else {
            Vec::new()
        };

        let mut ctx =
            OrchestrationContext::new(run, initial.clone(), proposed, concurrency, Utc::now());
        if apply_orchestration_rules {
            self.pipeline.evaluate(&mut ctx);
        } else {
            RulePipeline::empty().evaluate(&mut ctx);
        }
        let noop = ctx.is_noop();
        let (mut result, effects) = ctx.into_result();

        if result.status != SetStateStatus::Accept {
            tx.rollback().await?;
            match &result.details {
                ResponseDetails::Wait { retry_after } => {
                    info!(retry_after_ms = duration_ms(*retry_after), "Proposal deferred")
                }
                details => info!(status = result.status.as_str(), ?details, "Proposal not accepted"),
            }
            return Ok(result);
        }

        match result.state.take() {
            Some(validated) if !noop => {
                let expected = initial.as_ref().map(|s| s.id);
                let committed = tx.append_state(expected, &validated).await?;
                tx.apply_pending_effects(run_id, &effects).await?;
                tx.commit().await?;
                info!(
                    state_id = %committed.id,
                    state_type = %committed.state_type,
                    effects = effects.len(),
                    "State committed"
                );
                result.state = Some(committed);
            }
            _ => {
                tx.apply_pending_effects(run_id, &effects).await?;
                tx.commit().await?;
                debug!("Proposal re-asserts current state, nothing appended");
                result.state = initial;
            }
        }

        Ok(result)
    }

    /// Read a committed state.
    pub async fn read_state(&self, state_id: Uuid) -> Result<State> {
        self.persistence
            .get_state(state_id)
            .await?
            .ok_or_else(|| CoreError::StateNotFound {
                state_id: state_id.to_string(),
            })
    }

    /// Committed states of a run, oldest first.
    pub async fn read_states_for_run(&self, run_id: Uuid) -> Result<Vec<State>> {
        self.persistence.list_states(run_id).await
    }
}

/// Which proposals the rule pipeline governs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Governance {
    Rules,
    Bypass,
    BypassFirstState,
}

impl Governance {
    fn from_flag(apply_orchestration_rules: bool) -> Self {
        if apply_orchestration_rules {
            Governance::Rules
        } else {
            Governance::Bypass
        }
    }

    fn applies_rules(self, initial: Option<&State>) -> bool {
        match self {
            Governance::Rules => true,
            Governance::Bypass => false,
            Governance::BypassFirstState => initial.is_some(),
        }
    }
}

fn check_owner(run_id: Uuid, proposed: &State) -> Result<()> {
    if proposed.run_id != run_id {
        return Err(CoreError::ValidationError {
            field: "run_id".to_string(),
            message: format!(
                "proposed state belongs to run '{}', not '{}'",
                proposed.run_id, run_id
            ),
        });
    }
    Ok(())
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
