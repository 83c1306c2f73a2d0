// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestration rules.
//!
//! Each rule is a single policy unit. Rules inspect an [`OrchestrationContext`]
//! and return a [`RuleOutcome`]; they never touch storage. A persistent side
//! effect is requested with [`OrchestrationContext::record_effect`] and applied
//! by the orchestrator together with the state commit.
//!
//! Rules derive any replacement state from the current proposal (keeping its
//! id) rather than minting new ids, so evaluating the same context twice gives
//! the same result.
//!
//! | Rule | Outcome |
//! |------|---------|
//! | [`TerminalStateGuard`] | `Reject` when the run is already terminal |
//! | [`HeartbeatExpiry`] | `MutateAndContinue(CRASHED)` for a running run with a stale heartbeat |
//! | [`IdempotentReproposal`] | `MutateAndContinue(initial)` when nothing changed |
//! | [`PreventDuplicateClaim`] | `Abort` when a running run is proposed `PENDING` |
//! | [`NormalizeScheduledTime`] | fills in `scheduled_time` on `SCHEDULED` proposals |
//! | [`WaitForScheduledTime`] | `Wait` until a scheduled run is due |
//! | [`ConcurrencyLimit`] | `Wait` while a tag's slots are exhausted; acquires/releases slots |

use std::time::Duration;

use crate::context::{INVALID_TRANSITION, OrchestrationContext, PendingEffect};
use crate::states::{State, StateType};

/// Result of evaluating one rule.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    /// Proceed to the next rule with the proposal unchanged.
    Continue,
    /// Halt; nothing is committed.
    Reject(String),
    /// Substitute the proposal and proceed.
    MutateAndContinue(State),
    /// Halt; the caller should propose again after the delay.
    Wait(Duration),
    /// Halt; the proposal should not be retried.
    Abort(String),
}

/// A unit of transition policy.
pub trait OrchestrationRule {
    /// Stable rule name, used in logs.
    fn name(&self) -> &'static str;

    /// Evaluate the rule against the context.
    fn evaluate(&self, ctx: &mut OrchestrationContext) -> RuleOutcome;
}

/// Rejects every proposal for a run whose current state is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminalStateGuard;

impl OrchestrationRule for TerminalStateGuard {
    fn name(&self) -> &'static str {
        "terminal_state_guard"
    }

    fn evaluate(&self, ctx: &mut OrchestrationContext) -> RuleOutcome {
        match ctx.initial_state() {
            Some(initial) if initial.is_terminal() => {
                RuleOutcome::Reject(INVALID_TRANSITION.to_string())
            }
            _ => RuleOutcome::Continue,
        }
    }
}

/// Coerces any non-terminal proposal for a running run into `CRASHED` once
/// the run has not reported a heartbeat within `timeout`.
///
/// The `RUNNING` state's own timestamp counts as the first heartbeat. A stale
/// run re-asserting `RUNNING` is crashed too, since this rule runs before
/// [`IdempotentReproposal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatExpiry {
    /// Maximum silence before a running run is considered crashed.
    pub timeout: Duration,
}

impl OrchestrationRule for HeartbeatExpiry {
    fn name(&self) -> &'static str {
        "heartbeat_expiry"
    }

    fn evaluate(&self, ctx: &mut OrchestrationContext) -> RuleOutcome {
        let Some(initial) = ctx.initial_state() else {
            return RuleOutcome::Continue;
        };
        if initial.state_type != StateType::Running || ctx.proposed_state().is_terminal() {
            return RuleOutcome::Continue;
        }

        let last_seen = match ctx.run().heartbeat_at {
            Some(heartbeat) => heartbeat.max(initial.timestamp),
            None => initial.timestamp,
        };
        let stale = match (ctx.now() - last_seen).to_std() {
            Ok(elapsed) => elapsed > self.timeout,
            // Heartbeat in the future relative to our clock.
            Err(_) => false,
        };
        if !stale {
            return RuleOutcome::Continue;
        }

        let mut crashed = ctx.proposed_state().clone();
        crashed.state_type = StateType::Crashed;
        crashed.name = StateType::Crashed.default_name().to_string();
        crashed.message = Some("Run heartbeat expired".to_string());
        crashed.data = None;
        crashed.details = Default::default();
        RuleOutcome::MutateAndContinue(crashed)
    }
}

/// Turns a re-proposal of the current state into a no-op.
///
/// A proposal with the same type, payload and details as the current state
/// is replaced by the current state itself, so a retried call adds no
/// history row and keeps the original timestamp. A `SCHEDULED` proposal
/// without a scheduled time matches whatever time the current state was
/// given when it was normalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdempotentReproposal;

impl OrchestrationRule for IdempotentReproposal {
    fn name(&self) -> &'static str {
        "idempotent_reproposal"
    }

    fn evaluate(&self, ctx: &mut OrchestrationContext) -> RuleOutcome {
        let Some(initial) = ctx.initial_state() else {
            return RuleOutcome::Continue;
        };
        if ctx.is_noop() {
            return RuleOutcome::Continue;
        }

        let mut candidate = ctx.proposed_state().clone();
        if candidate.state_type == StateType::Scheduled && candidate.details.scheduled_time.is_none()
        {
            candidate.details.scheduled_time = initial.details.scheduled_time;
        }

        if initial.is_same_assertion(&candidate) {
            RuleOutcome::MutateAndContinue(initial.clone())
        } else {
            RuleOutcome::Continue
        }
    }
}

/// Aborts attempts to claim (`PENDING`) a run that is already running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreventDuplicateClaim;

impl OrchestrationRule for PreventDuplicateClaim {
    fn name(&self) -> &'static str {
        "prevent_duplicate_claim"
    }

    fn evaluate(&self, ctx: &mut OrchestrationContext) -> RuleOutcome {
        let running = ctx
            .initial_state()
            .is_some_and(|initial| initial.state_type == StateType::Running);
        if running && ctx.proposed_state().state_type == StateType::Pending {
            RuleOutcome::Abort("run is already running".to_string())
        } else {
            RuleOutcome::Continue
        }
    }
}

/// Gives `SCHEDULED` proposals without a scheduled time the attempt's clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeScheduledTime;

impl OrchestrationRule for NormalizeScheduledTime {
    fn name(&self) -> &'static str {
        "normalize_scheduled_time"
    }

    fn evaluate(&self, ctx: &mut OrchestrationContext) -> RuleOutcome {
        let proposed = ctx.proposed_state();
        if ctx.is_noop()
            || proposed.state_type != StateType::Scheduled
            || proposed.details.scheduled_time.is_some()
        {
            return RuleOutcome::Continue;
        }
        let normalized = proposed.clone().with_scheduled_time(ctx.now());
        RuleOutcome::MutateAndContinue(normalized)
    }
}

/// Holds a scheduled run in place until its scheduled time arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitForScheduledTime;

impl OrchestrationRule for WaitForScheduledTime {
    fn name(&self) -> &'static str {
        "wait_for_scheduled_time"
    }

    fn evaluate(&self, ctx: &mut OrchestrationContext) -> RuleOutcome {
        let Some(initial) = ctx.initial_state() else {
            return RuleOutcome::Continue;
        };
        if initial.state_type != StateType::Scheduled
            || !matches!(
                ctx.proposed_state().state_type,
                StateType::Pending | StateType::Running
            )
        {
            return RuleOutcome::Continue;
        }
        let Some(scheduled_time) = initial.details.scheduled_time else {
            return RuleOutcome::Continue;
        };
        match (scheduled_time - ctx.now()).to_std() {
            Ok(remaining) if !remaining.is_zero() => RuleOutcome::Wait(remaining),
            _ => RuleOutcome::Continue,
        }
    }
}

/// Tag-based concurrency limiting.
///
/// Entering `RUNNING` takes a slot under every limited tag of the run; if any
/// of them is full the proposal waits. Leaving `RUNNING` frees the run's
/// slots. Must run after every rule that can rewrite the proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyLimit {
    /// Delay suggested to callers while slots are exhausted.
    pub retry_after: Duration,
}

impl OrchestrationRule for ConcurrencyLimit {
    fn name(&self) -> &'static str {
        "concurrency_limit"
    }

    fn evaluate(&self, ctx: &mut OrchestrationContext) -> RuleOutcome {
        let from_running = ctx
            .initial_state()
            .is_some_and(|initial| initial.state_type == StateType::Running);
        let to_running = ctx.proposed_state().state_type == StateType::Running;

        if to_running && !from_running {
            if ctx.concurrency().iter().any(|usage| usage.is_exhausted()) {
                return RuleOutcome::Wait(self.retry_after);
            }
            let tags: Vec<String> = ctx
                .concurrency()
                .iter()
                .filter(|usage| !usage.held_by_run)
                .map(|usage| usage.tag.clone())
                .collect();
            for tag in tags {
                ctx.record_effect(PendingEffect::AcquireConcurrencySlot { tag });
            }
        } else if from_running && !to_running {
            let tags = ctx.run().tags.clone();
            for tag in tags {
                ctx.record_effect(PendingEffect::ReleaseConcurrencySlot { tag });
            }
        }

        RuleOutcome::Continue
    }
}

/// The closed set of rules a pipeline can hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    /// See [`TerminalStateGuard`].
    TerminalStateGuard(TerminalStateGuard),
    /// See [`HeartbeatExpiry`].
    HeartbeatExpiry(HeartbeatExpiry),
    /// See [`IdempotentReproposal`].
    IdempotentReproposal(IdempotentReproposal),
    /// See [`PreventDuplicateClaim`].
    PreventDuplicateClaim(PreventDuplicateClaim),
    /// See [`NormalizeScheduledTime`].
    NormalizeScheduledTime(NormalizeScheduledTime),
    /// See [`WaitForScheduledTime`].
    WaitForScheduledTime(WaitForScheduledTime),
    /// See [`ConcurrencyLimit`].
    ConcurrencyLimit(ConcurrencyLimit),
}

impl OrchestrationRule for Rule {
    fn name(&self) -> &'static str {
        match self {
            Rule::TerminalStateGuard(rule) => rule.name(),
            Rule::HeartbeatExpiry(rule) => rule.name(),
            Rule::IdempotentReproposal(rule) => rule.name(),
            Rule::PreventDuplicateClaim(rule) => rule.name(),
            Rule::NormalizeScheduledTime(rule) => rule.name(),
            Rule::WaitForScheduledTime(rule) => rule.name(),
            Rule::ConcurrencyLimit(rule) => rule.name(),
        }
    }

    fn evaluate(&self, ctx: &mut OrchestrationContext) -> RuleOutcome {
        match self {
            Rule::TerminalStateGuard(rule) => rule.evaluate(ctx),
            Rule::HeartbeatExpiry(rule) => rule.evaluate(ctx),
            Rule::IdempotentReproposal(rule) => rule.evaluate(ctx),
            Rule::PreventDuplicateClaim(rule) => rule.evaluate(ctx),
            Rule::NormalizeScheduledTime(rule) => rule.evaluate(ctx),
            Rule::WaitForScheduledTime(rule) => rule.evaluate(ctx),
            Rule::ConcurrencyLimit(rule) => rule.evaluate(ctx),
        }
    }
}

impl From<TerminalStateGuard> for Rule {
    fn from(rule: TerminalStateGuard) -> Self {
        Rule::TerminalStateGuard(rule)
    }
}

impl From<HeartbeatExpiry> for Rule {
    fn from(rule: HeartbeatExpiry) -> Self {
        Rule::HeartbeatExpiry(rule)
    }
}

impl From<IdempotentReproposal> for Rule {
    fn from(rule: IdempotentReproposal) -> Self {
        Rule::IdempotentReproposal(rule)
    }
}

impl From<PreventDuplicateClaim> for Rule {
    fn from(rule: PreventDuplicateClaim) -> Self {
        Rule::PreventDuplicateClaim(rule)
    }
}

impl From<NormalizeScheduledTime> for Rule {
    fn from(rule: NormalizeScheduledTime) -> Self {
        Rule::NormalizeScheduledTime(rule)
    }
}

impl From<WaitForScheduledTime> for Rule {
    fn from(rule: WaitForScheduledTime) -> Self {
        Rule::WaitForScheduledTime(rule)
    }
}

impl From<ConcurrencyLimit> for Rule {
    fn from(rule: ConcurrencyLimit) -> Self {
        Rule::ConcurrencyLimit(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConcurrencySlotUsage;
    use crate::runs::Run;
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    fn run_with_tags(tags: &[&str]) -> Run {
        Run {
            id: Uuid::new_v4(),
            name: "test-run".to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            parameters: serde_json::Value::Null,
            current_state_id: None,
            heartbeat_at: None,
            created_at: Utc::now(),
        }
    }

    fn context(
        run: Run,
        initial: Option<State>,
        proposed: StateType,
        concurrency: Vec<ConcurrencySlotUsage>,
        now: DateTime<Utc>,
    ) -> OrchestrationContext {
        let proposed = State::new(run.id, proposed);
        OrchestrationContext::new(run, initial, proposed, concurrency, now)
    }

    fn usage(tag: &str, limit: u32, active: u32, held_by_run: bool) -> ConcurrencySlotUsage {
        ConcurrencySlotUsage {
            tag: tag.to_string(),
            limit,
            active,
            held_by_run,
        }
    }

    #[test]
    fn test_terminal_guard_rejects_from_every_terminal_type() {
        for terminal in StateType::ALL.iter().filter(|t| t.is_terminal()) {
            let run = run_with_tags(&[]);
            let initial = State::new(run.id, *terminal);
            let mut ctx = context(run, Some(initial), StateType::Running, vec![], Utc::now());
            assert_eq!(
                TerminalStateGuard.evaluate(&mut ctx),
                RuleOutcome::Reject(INVALID_TRANSITION.to_string())
            );
        }
    }

    #[test]
    fn test_terminal_guard_continues_without_initial_state() {
        let run = run_with_tags(&[]);
        let mut ctx = context(run, None, StateType::Completed, vec![], Utc::now());
        assert_eq!(TerminalStateGuard.evaluate(&mut ctx), RuleOutcome::Continue);
    }

    #[test]
    fn test_idempotent_reproposal_returns_initial() {
        let run = run_with_tags(&[]);
        let initial = State::new(run.id, StateType::Running);
        let mut ctx = context(
            run,
            Some(initial.clone()),
            StateType::Running,
            vec![],
            Utc::now(),
        );
        assert_eq!(
            IdempotentReproposal.evaluate(&mut ctx),
            RuleOutcome::MutateAndContinue(initial)
        );
    }

    #[test]
    fn test_idempotent_reproposal_ignores_payload_change() {
        let run = run_with_tags(&[]);
        let initial = State::new(run.id, StateType::Running);
        let proposed = State::new(run.id, StateType::Running).with_data(serde_json::json!(1));
        let mut ctx = OrchestrationContext::new(run, Some(initial), proposed, vec![], Utc::now());
        assert_eq!(IdempotentReproposal.evaluate(&mut ctx), RuleOutcome::Continue);
    }

    #[test]
    fn test_idempotent_reproposal_matches_normalized_schedule() {
        let now = Utc::now();
        let run = run_with_tags(&[]);
        let initial = State::new(run.id, StateType::Scheduled)
            .with_scheduled_time(now - chrono::Duration::seconds(10));
        let mut ctx = context(run, Some(initial.clone()), StateType::Scheduled, vec![], now);
        assert_eq!(
            IdempotentReproposal.evaluate(&mut ctx),
            RuleOutcome::MutateAndContinue(initial)
        );
    }

    #[test]
    fn test_idempotent_reproposal_respects_explicit_schedule() {
        let now = Utc::now();
        let run = run_with_tags(&[]);
        let initial = State::new(run.id, StateType::Scheduled).with_scheduled_time(now);
        let proposed = State::new(run.id, StateType::Scheduled)
            .with_scheduled_time(now + chrono::Duration::minutes(5));
        let mut ctx = OrchestrationContext::new(run, Some(initial), proposed, vec![], now);
        assert_eq!(IdempotentReproposal.evaluate(&mut ctx), RuleOutcome::Continue);
    }

    #[test]
    fn test_heartbeat_expiry_crashes_running_reassertion() {
        let now = Utc::now();
        let run = run_with_tags(&[]);
        let mut initial = State::new(run.id, StateType::Running);
        initial.timestamp = now - chrono::Duration::seconds(120);
        let mut ctx = context(run, Some(initial), StateType::Running, vec![], now);
        let rule = HeartbeatExpiry {
            timeout: Duration::from_secs(60),
        };
        match rule.evaluate(&mut ctx) {
            RuleOutcome::MutateAndContinue(state) => assert_eq!(state.state_type, StateType::Crashed),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_prevent_duplicate_claim() {
        let run = run_with_tags(&[]);
        let initial = State::new(run.id, StateType::Running);
        let mut ctx = context(run, Some(initial), StateType::Pending, vec![], Utc::now());
        assert!(matches!(
            PreventDuplicateClaim.evaluate(&mut ctx),
            RuleOutcome::Abort(_)
        ));
    }

    #[test]
    fn test_heartbeat_expiry_crashes_stale_run() {
        let now = Utc::now();
        let run = run_with_tags(&[]);
        let mut initial = State::new(run.id, StateType::Running);
        initial.timestamp = now - chrono::Duration::seconds(120);
        let mut ctx = context(run, Some(initial), StateType::Paused, vec![], now);
        let rule = HeartbeatExpiry {
            timeout: Duration::from_secs(60),
        };
        match rule.evaluate(&mut ctx) {
            RuleOutcome::MutateAndContinue(state) => {
                assert_eq!(state.state_type, StateType::Crashed);
                assert_eq!(state.id, ctx.proposed_state().id);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_expiry_respects_recent_heartbeat() {
        let now = Utc::now();
        let mut run = run_with_tags(&[]);
        run.heartbeat_at = Some(now - chrono::Duration::seconds(5));
        let mut initial = State::new(run.id, StateType::Running);
        initial.timestamp = now - chrono::Duration::seconds(120);
        let mut ctx = context(run, Some(initial), StateType::Paused, vec![], now);
        let rule = HeartbeatExpiry {
            timeout: Duration::from_secs(60),
        };
        assert_eq!(rule.evaluate(&mut ctx), RuleOutcome::Continue);
    }

    #[test]
    fn test_normalize_scheduled_time_uses_context_clock() {
        let now = Utc::now();
        let run = run_with_tags(&[]);
        let mut ctx = context(run, None, StateType::Scheduled, vec![], now);
        match NormalizeScheduledTime.evaluate(&mut ctx) {
            RuleOutcome::MutateAndContinue(state) => {
                assert_eq!(state.details.scheduled_time, Some(now));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_wait_for_scheduled_time() {
        let now = Utc::now();
        let run = run_with_tags(&[]);
        let initial = State::new(run.id, StateType::Scheduled)
            .with_scheduled_time(now + chrono::Duration::seconds(90));
        let mut ctx = context(run, Some(initial), StateType::Running, vec![], now);
        assert_eq!(
            WaitForScheduledTime.evaluate(&mut ctx),
            RuleOutcome::Wait(Duration::from_secs(90))
        );
    }

    #[test]
    fn test_wait_for_scheduled_time_due() {
        let now = Utc::now();
        let run = run_with_tags(&[]);
        let initial = State::new(run.id, StateType::Scheduled)
            .with_scheduled_time(now - chrono::Duration::seconds(1));
        let mut ctx = context(run, Some(initial), StateType::Pending, vec![], now);
        assert_eq!(WaitForScheduledTime.evaluate(&mut ctx), RuleOutcome::Continue);
    }

    #[test]
    fn test_concurrency_limit_waits_when_exhausted() {
        let run = run_with_tags(&["db"]);
        let initial = State::new(run.id, StateType::Pending);
        let mut ctx = context(
            run,
            Some(initial),
            StateType::Running,
            vec![usage("db", 1, 1, false)],
            Utc::now(),
        );
        let rule = ConcurrencyLimit {
            retry_after: Duration::from_secs(30),
        };
        assert_eq!(
            rule.evaluate(&mut ctx),
            RuleOutcome::Wait(Duration::from_secs(30))
        );
        assert!(ctx.pending_effects().is_empty());
    }

    #[test]
    fn test_concurrency_limit_acquires_free_slots() {
        let run = run_with_tags(&["db", "gpu"]);
        let initial = State::new(run.id, StateType::Pending);
        let mut ctx = context(
            run,
            Some(initial),
            StateType::Running,
            vec![usage("db", 2, 1, false), usage("gpu", 1, 1, true)],
            Utc::now(),
        );
        let rule = ConcurrencyLimit {
            retry_after: Duration::from_secs(30),
        };
        assert_eq!(rule.evaluate(&mut ctx), RuleOutcome::Continue);
        assert_eq!(
            ctx.pending_effects(),
            &[PendingEffect::AcquireConcurrencySlot {
                tag: "db".to_string()
            }]
        );
    }

    #[test]
    fn test_concurrency_limit_releases_on_exit() {
        let run = run_with_tags(&["db"]);
        let initial = State::new(run.id, StateType::Running);
        let mut ctx = context(run, Some(initial), StateType::Completed, vec![], Utc::now());
        let rule = ConcurrencyLimit {
            retry_after: Duration::from_secs(30),
        };
        assert_eq!(rule.evaluate(&mut ctx), RuleOutcome::Continue);
        assert_eq!(
            ctx.pending_effects(),
            &[PendingEffect::ReleaseConcurrencySlot {
                tag: "db".to_string()
            }]
        );
    }

    #[test]
    fn test_rule_enum_dispatches_by_variant() {
        let rule: Rule = TerminalStateGuard.into();
        assert_eq!(rule.name(), "terminal_state_guard");
        let rule: Rule = ConcurrencyLimit {
            retry_after: Duration::from_secs(1),
        }
        .into();
        assert_eq!(rule.name(), "concurrency_limit");
    }
}
