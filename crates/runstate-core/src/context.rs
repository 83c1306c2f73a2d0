// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-attempt orchestration context and result types.
//!
//! An [`OrchestrationContext`] lives for exactly one `orchestrate` call and is
//! owned by it. Rules read it and record pending effects on it; only the
//! pipeline replaces the proposal or settles the response.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runs::Run;
use crate::states::State;

/// Rejection reason used for structural and terminal-state violations.
pub const INVALID_TRANSITION: &str = "INVALID_TRANSITION";

/// Decision of an orchestration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SetStateStatus {
    /// The proposal (possibly rewritten) was committed.
    Accept,
    /// The proposal was vetoed; the run keeps its current state.
    Reject,
    /// The proposal cannot be decided yet; retry later.
    Wait,
    /// The proposal is invalid for this run and should not be retried.
    Abort,
}

impl SetStateStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Reject => "REJECT",
            Self::Wait => "WAIT",
            Self::Abort => "ABORT",
        }
    }
}

/// Status-specific details of an orchestration result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseDetails {
    /// Nothing further to report.
    Accepted,
    /// Why the proposal was rejected.
    Rejected {
        /// Rule-supplied reason.
        reason: String,
    },
    /// When the caller should propose again.
    Wait {
        /// Delay before retrying.
        retry_after: Duration,
    },
    /// Why the proposal was aborted.
    Aborted {
        /// Rule-supplied reason.
        reason: String,
    },
}

/// A persistent side effect requested by a rule.
///
/// Effects are applied by the orchestrator in the same transaction as the
/// state commit, and only when the proposal is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum PendingEffect {
    /// Occupy a concurrency slot for the run under `tag`.
    AcquireConcurrencySlot {
        /// Concurrency tag.
        tag: String,
    },
    /// Free the run's concurrency slot under `tag`.
    ReleaseConcurrencySlot {
        /// Concurrency tag.
        tag: String,
    },
}

/// Concurrency limit usage for one of the run's tags, read inside the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencySlotUsage {
    /// Concurrency tag.
    pub tag: String,
    /// Maximum number of runs allowed to hold a slot.
    pub limit: u32,
    /// Number of slots currently held.
    pub active: u32,
    /// Whether the run being orchestrated already holds one of them.
    pub held_by_run: bool,
}

impl ConcurrencySlotUsage {
    /// True when a run without a slot cannot take one.
    pub fn is_exhausted(&self) -> bool {
        !self.held_by_run && self.active >= self.limit
    }
}

/// Outcome of an orchestration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationResult {
    /// Run's current state after the attempt: the committed state on accept,
    /// the unchanged initial state otherwise (absent if the run had none).
    pub state: Option<State>,
    /// Decision.
    pub status: SetStateStatus,
    /// Status-specific details.
    pub details: ResponseDetails,
}

impl OrchestrationResult {
    /// Retry delay when the result is `Wait`.
    pub fn retry_after(&self) -> Option<Duration> {
        match &self.details {
            ResponseDetails::Wait { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Reason when the result is `Reject` or `Abort`.
    pub fn reason(&self) -> Option<&str> {
        match &self.details {
            ResponseDetails::Rejected { reason } | ResponseDetails::Aborted { reason } => {
                Some(reason)
            }
            _ => None,
        }
    }
}

/// Mutable, per-attempt bundle evaluated by the rule pipeline.
#[derive(Debug, Clone)]
pub struct OrchestrationContext {
    run: Run,
    initial_state: Option<State>,
    proposed_state: State,
    validated_state: Option<State>,
    response_status: SetStateStatus,
    response_details: ResponseDetails,
    pending_effects: Vec<PendingEffect>,
    concurrency: Vec<ConcurrencySlotUsage>,
    now: DateTime<Utc>,
}

impl OrchestrationContext {
    /// Build a context for one proposal.
    ///
    /// `now` is the clock every rule consults, so evaluation of the same
    /// context is repeatable.
    pub fn new(
        run: Run,
        initial_state: Option<State>,
        proposed_state: State,
        concurrency: Vec<ConcurrencySlotUsage>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run,
            initial_state,
            proposed_state,
            validated_state: None,
            response_status: SetStateStatus::Accept,
            response_details: ResponseDetails::Accepted,
            pending_effects: Vec::new(),
            concurrency,
            now,
        }
    }

    /// The run being orchestrated.
    pub fn run(&self) -> &Run {
        &self.run
    }

    /// Current state before this proposal.
    pub fn initial_state(&self) -> Option<&State> {
        self.initial_state.as_ref()
    }

    /// The proposal as rewritten by every rule evaluated so far.
    pub fn proposed_state(&self) -> &State {
        &self.proposed_state
    }

    /// Final state decided by the pipeline, once it has run.
    pub fn validated_state(&self) -> Option<&State> {
        self.validated_state.as_ref()
    }

    /// Current response status.
    pub fn response_status(&self) -> SetStateStatus {
        self.response_status
    }

    /// Current response details.
    pub fn response_details(&self) -> &ResponseDetails {
        &self.response_details
    }

    /// Concurrency usage for the run's limited tags.
    pub fn concurrency(&self) -> &[ConcurrencySlotUsage] {
        &self.concurrency
    }

    /// Effects recorded so far.
    pub fn pending_effects(&self) -> &[PendingEffect] {
        &self.pending_effects
    }

    /// Clock for this attempt.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// True when the proposal re-asserts the initial state itself.
    pub fn is_noop(&self) -> bool {
        self.initial_state
            .as_ref()
            .is_some_and(|initial| initial.id == self.proposed_state.id)
    }

    /// Record a persistent side effect to apply with the commit.
    pub fn record_effect(&mut self, effect: PendingEffect) {
        if !self.pending_effects.contains(&effect) {
            self.pending_effects.push(effect);
        }
    }

    pub(crate) fn replace_proposal(&mut self, state: State) {
        self.proposed_state = state;
    }

    /// Settle the response. Non-accepting outcomes keep the initial state
    /// and drop every recorded effect.
    pub(crate) fn settle(&mut self, status: SetStateStatus, details: ResponseDetails) {
        self.response_status = status;
        self.response_details = details;
        if status == SetStateStatus::Accept {
            self.validated_state = Some(self.proposed_state.clone());
        } else {
            self.validated_state = self.initial_state.clone();
            self.pending_effects.clear();
        }
    }

    /// Consume the context into the caller-facing result and the effects to apply.
    pub fn into_result(self) -> (OrchestrationResult, Vec<PendingEffect>) {
        let result = OrchestrationResult {
            state: self.validated_state,
            status: self.response_status,
            details: self.response_details,
        };
        (result, self.pending_effects)
    }
}
