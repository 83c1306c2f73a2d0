// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ordered rule pipeline.
//!
//! Rules run strictly in the order the caller configured; later rules see the
//! cumulative effect of earlier rewrites. The first `Reject`, `Wait` or
//! `Abort` stops evaluation.

use std::time::Duration;

use tracing::{debug, trace};

use crate::context::{OrchestrationContext, ResponseDetails, SetStateStatus};
use crate::rules::{
    ConcurrencyLimit, HeartbeatExpiry, IdempotentReproposal, NormalizeScheduledTime,
    OrchestrationRule, PreventDuplicateClaim, Rule, RuleOutcome, TerminalStateGuard,
    WaitForScheduledTime,
};

/// Default delay suggested while concurrency slots are exhausted.
pub const DEFAULT_CONCURRENCY_RETRY_AFTER: Duration = Duration::from_secs(30);

/// An ordered sequence of rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RulePipeline {
    rules: Vec<Rule>,
}

impl RulePipeline {
    /// A pipeline with no rules; every structurally valid proposal is accepted.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The standard policy, in order: terminal guard, (heartbeat expiry),
    /// idempotent re-proposal, duplicate-claim prevention, scheduled-time
    /// normalization, scheduled-time wait, concurrency limits.
    pub fn standard(concurrency_retry_after: Duration, heartbeat_timeout: Option<Duration>) -> Self {
        let mut pipeline = Self::empty().with_rule(TerminalStateGuard);
        if let Some(timeout) = heartbeat_timeout {
            pipeline = pipeline.with_rule(HeartbeatExpiry { timeout });
        }
        pipeline
            .with_rule(IdempotentReproposal)
            .with_rule(PreventDuplicateClaim)
            .with_rule(NormalizeScheduledTime)
            .with_rule(WaitForScheduledTime)
            .with_rule(ConcurrencyLimit {
                retry_after: concurrency_retry_after,
            })
    }

    /// Append a rule at the end of the pipeline.
    pub fn with_rule(mut self, rule: impl Into<Rule>) -> Self {
        self.rules.push(rule.into());
        self
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Evaluate every rule against `ctx` and settle its response.
    pub fn evaluate(&self, ctx: &mut OrchestrationContext) {
        for rule in &self.rules {
            let outcome = rule.evaluate(ctx);
            trace!(rule = rule.name(), outcome = ?outcome, "Rule evaluated");

            match outcome {
                RuleOutcome::Continue => {}
                RuleOutcome::MutateAndContinue(state) => {
                    debug!(
                        rule = rule.name(),
                        from = %ctx.proposed_state().state_type,
                        to = %state.state_type,
                        "Rule rewrote proposed state"
                    );
                    ctx.replace_proposal(state);
                }
                RuleOutcome::Reject(reason) => {
                    debug!(rule = rule.name(), reason = %reason, "Rule rejected proposal");
                    ctx.settle(SetStateStatus::Reject, ResponseDetails::Rejected { reason });
                    return;
                }
                RuleOutcome::Wait(retry_after) => {
                    debug!(rule = rule.name(), ?retry_after, "Rule deferred proposal");
                    ctx.settle(SetStateStatus::Wait, ResponseDetails::Wait { retry_after });
                    return;
                }
                RuleOutcome::Abort(reason) => {
                    debug!(rule = rule.name(), reason = %reason, "Rule aborted proposal");
                    ctx.settle(SetStateStatus::Abort, ResponseDetails::Aborted { reason });
                    return;
                }
            }
        }

        ctx.settle(SetStateStatus::Accept, ResponseDetails::Accepted);
    }
}
