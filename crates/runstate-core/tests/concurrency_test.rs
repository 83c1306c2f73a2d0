// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Concurrent orchestration against a file-backed SQLite database.
//!
//! Proposals race on real connections; the store must serialize them so no
//! accepted transition is lost and no concurrency slot is over-allocated.

mod common;

use futures::future::join_all;
use serde_json::json;

use common::TestContext;
use runstate_core::context::SetStateStatus;
use runstate_core::states::{State, StateType};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_proposals_lose_no_updates() {
    let ctx = TestContext::sqlite_file(20).await;
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

    let mut accepted = 0;
    for outcome in join_all(handles).await {
        match outcome.expect("task panicked") {
            Ok(result) => {
                assert_eq!(result.status, SetStateStatus::Accept);
                accepted += 1;
            }
            Err(err) => assert!(err.is_retryable(), "unexpected error: {}", err),
        }
    }

    let history = ctx.history(run.id).await;
    assert!(accepted > 0);
    assert_eq!(history.len(), 1 + accepted);
    assert_eq!(history.last(), ctx.current_state(run.id).await.as_ref());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_limit_holds_under_contention() {
    let ctx = TestContext::sqlite_file(20).await;
    ctx.persistence.set_concurrency_limit("etl", 1).await.unwrap();

    let mut runs = Vec::new();
    for _ in 0..6 {
        let run = ctx.create_tagged_run(&["etl"]).await;
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
        match outcome.expect("task panicked") {
            Ok(result) if result.status == SetStateStatus::Accept => accepted += 1,
            Ok(result) => assert_eq!(result.status, SetStateStatus::Wait),
            Err(err) => assert!(err.is_retryable(), "unexpected error: {}", err),
        }
    }

    assert_eq!(accepted, 1);
    let slots = ctx.persistence.list_concurrency_slots("etl").await.unwrap();
    assert_eq!(slots.len(), 1);

    let mut running = 0;
    for run in &runs {
        if ctx.current_state(run.id).await.unwrap().state_type == StateType::Running {
            running += 1;
            assert_eq!(slots[0], run.id);
        }
    }
    assert_eq!(running, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_first_creates_commit_one_state() {
    let ctx = TestContext::sqlite_file(20).await;
    let run = ctx.create_run().await;

    let handles = (0..6).map(|_| {
        let orchestrator = ctx.orchestrator.clone();
        let run_id = run.id;
        tokio::spawn(async move {
            orchestrator
                .orchestrate_initial(run_id, State::new(run_id, StateType::Running))
                .await
        })
    });

    let outcomes = join_all(handles).await;
    let history = ctx.history(run.id).await;
    assert_eq!(history.len(), 1);

    for outcome in outcomes {
        match outcome.expect("task panicked") {
            Ok(result) => {
                assert_eq!(result.status, SetStateStatus::Accept);
                assert_eq!(result.state.map(|s| s.id), Some(history[0].id));
            }
            Err(err) => assert!(err.is_retryable(), "unexpected error: {}", err),
        }
    }
}
