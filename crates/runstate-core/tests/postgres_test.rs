// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestration tests against PostgreSQL.
//!
//! Requires TEST_DATABASE_URL; skipped otherwise.

mod common;

use futures::future::join_all;
use serde_json::json;
use uuid::Uuid;

use common::TestContext;
use runstate_core::context::{INVALID_TRANSITION, SetStateStatus};
use runstate_core::runs::RunCreate;
use runstate_core::states::{State, StateType};

async fn context() -> TestContext {
    TestContext::postgres()
        .await
        .expect("Failed to connect to TEST_DATABASE_URL")
}

#[tokio::test]
async fn test_pg_lifecycle() {
    skip_if_no_db!();
    let ctx = context().await;
    let run = ctx.create_run_in(StateType::Scheduled).await;

    for state_type in [StateType::Pending, StateType::Running, StateType::Completed] {
        let result = ctx
            .orchestrator
            .orchestrate(run.id, State::new(run.id, state_type), true)
            .await
            .unwrap();
        assert_eq!(result.status, SetStateStatus::Accept);
    }

    let rejected = ctx
        .orchestrator
        .orchestrate(run.id, State::new(run.id, StateType::Running), true)
        .await
        .unwrap();
    assert_eq!(rejected.status, SetStateStatus::Reject);
    assert_eq!(rejected.reason(), Some(INVALID_TRANSITION));

    let types: Vec<StateType> = ctx
        .history(run.id)
        .await
        .iter()
        .map(|s| s.state_type)
        .collect();
    assert_eq!(
        types,
        vec![
            StateType::Scheduled,
            StateType::Pending,
            StateType::Running,
            StateType::Completed
        ]
    );
}

#[tokio::test]
async fn test_pg_reproposal_is_noop() {
    skip_if_no_db!();
    let ctx = context().await;
    let run = ctx.create_run_in(StateType::Running).await;
    let before = ctx.current_state(run.id).await.unwrap();

    let result = ctx
        .orchestrator
        .orchestrate(run.id, State::new(run.id, StateType::Running), true)
        .await
        .unwrap();

    assert_eq!(result.status, SetStateStatus::Accept);
    assert_eq!(result.state, Some(before));
    assert_eq!(ctx.history(run.id).await.len(), 1);
}

#[tokio::test]
async fn test_pg_register_duplicate_run() {
    skip_if_no_db!();
    let ctx = context().await;
    let mut request = RunCreate::named("pg-duplicate");
    request.id = Some(Uuid::new_v4());
    ctx.persistence.register_run(&request).await.unwrap();

    let err = ctx.persistence.register_run(&request).await.unwrap_err();
    assert_eq!(err.error_code(), "RUN_ALREADY_EXISTS");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pg_concurrent_proposals_lose_no_updates() {
    skip_if_no_db!();
    let ctx = context().await;
    let run = ctx.create_run_in(StateType::Pending).await;

    let handles = (0..8).map(|worker| {
        let orchestrator = ctx.orchestrator.clone();
        let run_id = run.id;
        tokio::spawn(async move {
            orchestrator
                .orchestrate(
                    run_id,
                    State::new(run_id, StateType::Running).with_data(json!({ "worker": worker })),
                    true,
                )
                .await
        })
    });

    for outcome in join_all(handles).await {
        let result = outcome.expect("task panicked").unwrap();
        assert_eq!(result.status, SetStateStatus::Accept);
    }

    let history = ctx.history(run.id).await;
    assert_eq!(history.len(), 9);
    assert_eq!(history.last(), ctx.current_state(run.id).await.as_ref());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pg_concurrency_limit_holds_under_contention() {
    skip_if_no_db!();
    let ctx = context().await;
    let tag = format!("pg-etl-{}", Uuid::new_v4());
    ctx.persistence.set_concurrency_limit(&tag, 2).await.unwrap();

    let mut runs = Vec::new();
    for _ in 0..6 {
        let run = ctx.create_tagged_run(&[tag.as_str()]).await;
        ctx.force_state(&run, StateType::Pending).await;
        runs.push(run);
    }

    let handles = runs.iter().map(|run| {
        let orchestrator = ctx.orchestrator.clone();
        let run_id = run.id;
        tokio::spawn(async move {
            orchestrator
                .orchestrate(run_id, State::new(run_id, StateType::Running), true)
                .await
        })
    });

    let mut accepted = 0;
    for outcome in join_all(handles).await {
        let result = outcome.expect("task panicked").unwrap();
        match result.status {
            SetStateStatus::Accept => accepted += 1,
            status => assert_eq!(status, SetStateStatus::Wait),
        }
    }

    assert_eq!(accepted, 2);
    assert_eq!(
        ctx.persistence
            .list_concurrency_slots(&tag)
            .await
            .unwrap()
            .len(),
        2
    );

    ctx.persistence.delete_concurrency_limit(&tag).await.unwrap();
}
