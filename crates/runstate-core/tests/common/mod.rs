// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runstate-core integration tests.
//!
//! Provides TestContext for setting up persistence, the orchestrator and the
//! handler state.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use runstate_core::orchestrator::Orchestrator;
use runstate_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use runstate_core::pipeline::RulePipeline;
use runstate_core::runs::{Run, RunCreate};
use runstate_core::state_handlers::StateHandlerState;
use runstate_core::states::{State, StateType};

/// Retry delay configured on test pipelines.
pub const RETRY_AFTER: Duration = Duration::from_secs(7);

/// Test context wiring persistence, orchestrator and handlers together.
pub struct TestContext {
    pub persistence: Arc<dyn Persistence>,
    pub orchestrator: Arc<Orchestrator>,
    pub handlers: StateHandlerState,
    // Keeps a file-backed database alive for the lifetime of the context.
    _dir: Option<TempDir>,
}

impl TestContext {
    /// In-memory SQLite with the standard pipeline.
    pub async fn sqlite() -> Self {
        Self::sqlite_with(RulePipeline::standard(RETRY_AFTER, None)).await
    }

    /// In-memory SQLite with a custom pipeline.
    pub async fn sqlite_with(pipeline: RulePipeline) -> Self {
        let persistence = SqlitePersistence::connect("sqlite::memory:", 1)
            .await
            .expect("Failed to open in-memory database");
        Self::build(Arc::new(persistence), pipeline, 3, None)
    }

    /// File-backed SQLite in a temporary directory, for tests that need
    /// several connections.
    pub async fn sqlite_file(max_commit_attempts: u32) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let persistence = SqlitePersistence::from_path(dir.path().join("runs.db"))
            .await
            .expect("Failed to open database file");
        Self::build(
            Arc::new(persistence),
            RulePipeline::standard(RETRY_AFTER, None),
            max_commit_attempts,
            Some(dir),
        )
    }

    /// PostgreSQL from TEST_DATABASE_URL, or None when it is not set.
    pub async fn postgres() -> Option<Self> {
        let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
        let persistence = PostgresPersistence::connect(&database_url, 10).await.ok()?;
        Some(Self::build(
            Arc::new(persistence),
            RulePipeline::standard(RETRY_AFTER, None),
            10,
            None,
        ))
    }

    fn build(
        persistence: Arc<dyn Persistence>,
        pipeline: RulePipeline,
        max_commit_attempts: u32,
        dir: Option<TempDir>,
    ) -> Self {
        let orchestrator = Arc::new(
            Orchestrator::builder()
                .persistence(persistence.clone())
                .pipeline(pipeline)
                .max_commit_attempts(max_commit_attempts)
                .build()
                .expect("Failed to build orchestrator"),
        );
        let handlers = StateHandlerState::new(orchestrator.clone());
        Self {
            persistence,
            orchestrator,
            handlers,
            _dir: dir,
        }
    }

    /// Register a run with a unique name.
    pub async fn create_run(&self) -> Run {
        self.create_tagged_run(&[]).await
    }

    /// Register a run carrying `tags`.
    pub async fn create_tagged_run(&self, tags: &[&str]) -> Run {
        self.persistence
            .register_run(
                &RunCreate::named(format!("test-run-{}", Uuid::new_v4()))
                    .with_tags(tags.iter().copied()),
            )
            .await
            .expect("Failed to register run")
    }

    /// Register a run and commit `state_type` as its first state.
    pub async fn create_run_in(&self, state_type: StateType) -> Run {
        let run = self.create_run().await;
        self.force_state(&run, state_type).await;
        run
    }

    /// Commit `state_type` through the bypass path.
    pub async fn force_state(&self, run: &Run, state_type: StateType) -> State {
        self.orchestrator
            .orchestrate(run.id, State::new(run.id, state_type), false)
            .await
            .expect("Failed to force state")
            .state
            .expect("Bypass commit returned no state")
    }

    /// Current state via the run's pointer.
    pub async fn current_state(&self, run_id: Uuid) -> Option<State> {
        let run = self
            .persistence
            .get_run(run_id)
            .await
            .expect("Failed to load run")?;
        let state_id = run.current_state_id?;
        self.persistence
            .get_state(state_id)
            .await
            .expect("Failed to load state")
    }

    /// Committed history of a run.
    pub async fn history(&self, run_id: Uuid) -> Vec<State> {
        self.orchestrator
            .read_states_for_run(run_id)
            .await
            .expect("Failed to list states")
    }
}

/// Helper macro to skip tests if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
