// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! runstate-core - Run State Orchestration Engine
//!
//! This crate decides and commits state transitions for tracked runs. Every
//! proposed state passes a structural check and an ordered rule pipeline, and
//! the decided state is appended to the run's history atomically with any
//! side effects the rules recorded.
//!
//! # Architecture
//!
//! ```text
//!   transport adapters
//!          │  state_handlers::handle_*
//!          ▼
//! ┌────────────────────────┐     ┌───────────────────────────┐
//! │      Orchestrator      │────►│       RulePipeline        │
//! │ begin / check / commit │     │ Rule, Rule, ... (ordered) │
//! └────────────────────────┘     └───────────────────────────┘
//!          │ RunTransaction
//!          ▼
//! ┌────────────────────────┐
//! │  PostgreSQL / SQLite   │
//! │  runs, run_states,     │
//! │  concurrency slots     │
//! └────────────────────────┘
//! ```
//!
//! # State Machine
//!
//! ```text
//!  SCHEDULED ──► PENDING ──► RUNNING ──► COMPLETED
//!      │            │           │   └──► FAILED
//!      │            │           └──────► CRASHED
//!      └────────────┴──────────────────► CANCELLED
//! ```
//!
//! Any non-terminal state may move to any state. COMPLETED, FAILED,
//! CANCELLED and CRASHED are terminal: nothing leaves them.
//!
//! ## Response Status
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `ACCEPT` | The validated state is now current (or already was) |
//! | `REJECT` | Refused; the current state is unchanged |
//! | `WAIT` | Not yet; retry after the returned duration |
//! | `ABORT` | The proposal is meaningless in context |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `RUNSTATE_DATABASE_URL` | Yes | - | PostgreSQL or SQLite connection string |
//! | `RUNSTATE_DB_MAX_CONNECTIONS` | No | `10` | Pool size |
//! | `RUNSTATE_MAX_COMMIT_ATTEMPTS` | No | `3` | Attempts per proposal on commit conflicts |
//! | `RUNSTATE_CONCURRENCY_RETRY_SECS` | No | `30` | Retry delay for exhausted concurrency slots |
//! | `RUNSTATE_HEARTBEAT_TIMEOUT_SECS` | No | - | Enables heartbeat expiry |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`context`]: Orchestration context and result types
//! - [`error`]: Error types with error code mapping
//! - [`orchestrator`]: Transactional orchestration entry point
//! - [`persistence`]: Persistence traits with PostgreSQL and SQLite backends
//! - [`pipeline`]: Ordered rule evaluation
//! - [`rules`]: Orchestration rules
//! - [`state_handlers`]: Handlers for transport adapters

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Orchestration context, pending effects and results.
pub mod context;

/// Error types for core operations.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Transactional orchestration of proposed states.
pub mod orchestrator;

/// Persistence layer.
pub mod persistence;

/// Ordered evaluation of orchestration rules.
pub mod pipeline;

/// Orchestration rules.
pub mod rules;

/// Run metadata.
pub mod runs;

/// Run and state handlers (registration, proposals, reads, limits).
pub mod state_handlers;

/// State data model and structural transitions.
pub mod states;

pub use context::{OrchestrationResult, ResponseDetails, SetStateStatus};
pub use error::{CoreError, Result};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use pipeline::RulePipeline;
pub use states::{State, StateCreate, StateType};
