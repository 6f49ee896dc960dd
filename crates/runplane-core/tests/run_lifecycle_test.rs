// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end run lifecycle through the run service.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use runplane_core::artifacts::PlanFormat;
use runplane_core::authz::Subject;
use runplane_core::error::CoreError;
use runplane_core::events::Event;
use runplane_core::logs::{Chunk, GetChunkOptions};
use runplane_core::persistence::ListRunsFilter;
use runplane_core::run::{PhaseKind, PhaseStatus, ResourceReport, RunOptions, RunStatus};
use runplane_core::service::WatchOptions;

use common::{APPLY_LOG, AllowSubjects, PLAN_WITH_CHANGES, PLAN_WITHOUT_CHANGES};

#[tokio::test]
async fn test_plan_and_apply_lifecycle() {
    let service = common::service().await;
    let user = Subject::user("alice");
    let agent = Subject::agent("agent-1");

    let run = service
        .create(&user, "ws-1", "cv-1", RunOptions::default())
        .await
        .unwrap();
    let run_id = run.id().to_string();

    service.enqueue_plan(&user, &run_id).await.unwrap();
    service
        .start_phase(&agent, &run_id, PhaseKind::Plan)
        .await
        .unwrap();
    service
        .upload_plan_file(&agent, &run_id, PlanFormat::Json, Bytes::from_static(PLAN_WITH_CHANGES))
        .await
        .unwrap();
    let run = service
        .finish_phase(&agent, &run_id, PhaseKind::Plan, false)
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Planned);
    assert_eq!(run.plan().status(), PhaseStatus::Finished);
    assert_eq!(run.plan().report(), Some(&ResourceReport::new(3, 0, 1)));
    assert_eq!(run.apply().status(), PhaseStatus::Pending);

    service.apply(&user, &run_id).await.unwrap();
    service
        .start_phase(&agent, &run_id, PhaseKind::Apply)
        .await
        .unwrap();
    service
        .put_chunk(
            &agent,
            Chunk::new(&run_id, PhaseKind::Apply, 0, Bytes::from_static(APPLY_LOG)),
        )
        .await
        .unwrap();
    let run = service
        .finish_phase(&agent, &run_id, PhaseKind::Apply, false)
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::Applied);
    assert_eq!(run.apply().status(), PhaseStatus::Finished);
    assert_eq!(run.apply().report(), Some(&ResourceReport::new(2, 0, 1)));

    let statuses: Vec<RunStatus> = service
        .get(&user, &run_id)
        .await
        .unwrap()
        .status_log()
        .entries()
        .iter()
        .map(|entry| entry.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            RunStatus::Pending,
            RunStatus::PlanQueued,
            RunStatus::Planning,
            RunStatus::Planned,
            RunStatus::ApplyQueued,
            RunStatus::Applying,
            RunStatus::Applied,
        ]
    );
}

#[tokio::test]
async fn test_auto_apply_queues_apply_after_plan() {
    let service = common::service().await;
    let agent = Subject::agent("agent-1");
    let options = RunOptions {
        auto_apply: true,
        ..RunOptions::default()
    };

    let run = service.create(&agent, "ws-1", "cv-1", options).await.unwrap();
    service.enqueue_plan(&agent, run.id()).await.unwrap();
    service
        .start_phase(&agent, run.id(), PhaseKind::Plan)
        .await
        .unwrap();
    service
        .upload_plan_file(&agent, run.id(), PlanFormat::Json, Bytes::from_static(PLAN_WITH_CHANGES))
        .await
        .unwrap();

    let run = service
        .finish_phase(&agent, run.id(), PhaseKind::Plan, false)
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::ApplyQueued);
    assert_eq!(run.apply().status(), PhaseStatus::Queued);
    assert!(run.timestamp_of(RunStatus::Planned).is_some());
}

#[tokio::test]
async fn test_plan_without_changes_finishes_run() {
    let service = common::service().await;
    let agent = Subject::agent("agent-1");

    let run = service
        .create(&agent, "ws-1", "cv-1", RunOptions::default())
        .await
        .unwrap();
    service.enqueue_plan(&agent, run.id()).await.unwrap();
    service
        .start_phase(&agent, run.id(), PhaseKind::Plan)
        .await
        .unwrap();
    service
        .upload_plan_file(&agent, run.id(), PlanFormat::Json, Bytes::from_static(PLAN_WITHOUT_CHANGES))
        .await
        .unwrap();

    let run = service
        .finish_phase(&agent, run.id(), PhaseKind::Plan, false)
        .await
        .unwrap();

    assert_eq!(run.status(), RunStatus::PlannedAndFinished);
    assert_eq!(run.apply().status(), PhaseStatus::Unreachable);
    assert!(run.plan().report().is_none());
}

#[tokio::test]
async fn test_cancel_then_force_cancel() {
    let service = common::service().await;
    let user = Subject::user("alice");
    let agent = Subject::agent("agent-1");
    let mut sub = service.subscribe("test-cancel");

    let run = service
        .create(&user, "ws-1", "cv-1", RunOptions::default())
        .await
        .unwrap();
    service.enqueue_plan(&user, run.id()).await.unwrap();
    service
        .start_phase(&agent, run.id(), PhaseKind::Plan)
        .await
        .unwrap();

    let canceled = service.cancel(&user, run.id()).await.unwrap();
    assert_eq!(canceled.status(), RunStatus::Canceled);
    assert_eq!(canceled.plan().status(), PhaseStatus::Canceled);
    assert_eq!(canceled.apply().status(), PhaseStatus::Unreachable);
    assert!(canceled.force_cancel_available_at().is_some());

    let err = service.cancel(&user, run.id()).await.unwrap_err();
    assert!(matches!(err, CoreError::CancelNotAllowed { .. }));

    let forced = service.force_cancel(&user, run.id()).await.unwrap();
    assert_eq!(forced.status(), RunStatus::ForceCanceled);

    let mut cancels = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await
    {
        if let Event::CancelRequested { run_id, force } = event {
            assert_eq!(run_id, run.id());
            cancels.push(force);
        }
    }
    assert_eq!(cancels, vec![false, true]);
}

#[tokio::test]
async fn test_cancel_pending_run_sends_no_interrupt() {
    let service = common::service().await;
    let user = Subject::user("alice");
    let mut sub = service.subscribe("test-cancel-pending");

    let run = service
        .create(&user, "ws-1", "cv-1", RunOptions::default())
        .await
        .unwrap();
    service.cancel(&user, run.id()).await.unwrap();

    while let Ok(Some(event)) =
        tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await
    {
        assert!(!matches!(event, Event::CancelRequested { .. }));
    }
}

#[tokio::test]
async fn test_force_cancel_waits_for_cooldown() {
    let service = common::builder()
        .await
        .force_cancel_cooldown(std::time::Duration::from_secs(3600))
        .build()
        .unwrap();
    let user = Subject::user("alice");

    let run = service
        .create(&user, "ws-1", "cv-1", RunOptions::default())
        .await
        .unwrap();

    let err = service.force_cancel(&user, run.id()).await.unwrap_err();
    assert!(matches!(err, CoreError::ForceCancelNotAllowed { .. }));

    service.cancel(&user, run.id()).await.unwrap();
    let err = service.force_cancel(&user, run.id()).await.unwrap_err();
    assert!(matches!(err, CoreError::ForceCancelNotAllowed { .. }));
    assert!(err.is_precondition());
}

#[tokio::test]
async fn test_discard_planned_run() {
    let service = common::service().await;
    let agent = Subject::agent("agent-1");

    let run = service
        .create(&agent, "ws-1", "cv-1", RunOptions::default())
        .await
        .unwrap();
    service.enqueue_plan(&agent, run.id()).await.unwrap();

    let err = service.discard(&agent, run.id()).await.unwrap_err();
    assert!(matches!(err, CoreError::DiscardNotAllowed { .. }));

    service
        .start_phase(&agent, run.id(), PhaseKind::Plan)
        .await
        .unwrap();
    service
        .upload_plan_file(&agent, run.id(), PlanFormat::Json, Bytes::from_static(PLAN_WITH_CHANGES))
        .await
        .unwrap();
    service
        .finish_phase(&agent, run.id(), PhaseKind::Plan, false)
        .await
        .unwrap();

    let run = service.discard(&agent, run.id()).await.unwrap();
    assert_eq!(run.status(), RunStatus::Discarded);
    assert_eq!(run.plan().status(), PhaseStatus::Finished);
    assert_eq!(run.apply().status(), PhaseStatus::Unreachable);
}

#[tokio::test]
async fn test_unauthorized_subject_is_rejected() {
    let service = common::builder()
        .await
        .authorizer(Arc::new(AllowSubjects(vec!["alice"])))
        .build()
        .unwrap();
    let alice = Subject::user("alice");
    let mallory = Subject::user("mallory");

    let err = service
        .create(&mallory, "ws-1", "cv-1", RunOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "UNAUTHORIZED");

    let run = service
        .create(&alice, "ws-1", "cv-1", RunOptions::default())
        .await
        .unwrap();

    let err = service.enqueue_plan(&mallory, run.id()).await.unwrap_err();
    assert!(matches!(err, CoreError::Unauthorized { .. }));
    let err = service.get(&mallory, run.id()).await.unwrap_err();
    assert!(matches!(err, CoreError::Unauthorized { .. }));

    // the denied transition left the run untouched
    let run = service.get(&alice, run.id()).await.unwrap();
    assert_eq!(run.status(), RunStatus::Pending);

    let filter = ListRunsFilter {
        workspace_id: Some("ws-1".to_string()),
        ..ListRunsFilter::default()
    };
    let err = service.list(&mallory, filter.clone()).await.unwrap_err();
    assert!(matches!(err, CoreError::Unauthorized { .. }));
    assert_eq!(service.list(&alice, filter).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_artifacts_survive_cache_clear() {
    let service = common::service().await;
    let agent = Subject::agent("agent-1");
    let run = service
        .create(&agent, "ws-1", "cv-1", RunOptions::default())
        .await
        .unwrap();

    service
        .upload_plan_file(&agent, run.id(), PlanFormat::Binary, Bytes::from_static(b"\x00plan"))
        .await
        .unwrap();
    service
        .upload_lock_file(&agent, run.id(), Bytes::from_static(b"provider \"aws\" {}"))
        .await
        .unwrap();

    service.artifacts().clear_cache();
    assert_eq!(service.artifacts().cached_len(), 0);

    let plan = service
        .get_plan_file(&agent, run.id(), PlanFormat::Binary)
        .await
        .unwrap();
    assert_eq!(&plan[..], b"\x00plan");
    let lock = service.get_lock_file(&agent, run.id()).await.unwrap();
    assert_eq!(&lock[..], b"provider \"aws\" {}");

    let err = service
        .get_plan_file(&agent, run.id(), PlanFormat::Json)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = service
        .upload_lock_file(&agent, run.id(), Bytes::from_static(b"different"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ArtifactAlreadyExists { .. }));
}

#[tokio::test]
async fn test_watch_filters_by_run() {
    let service = common::service().await;
    let user = Subject::user("alice");
    let token = CancellationToken::new();

    let watched = service
        .create(&user, "ws-1", "cv-1", RunOptions::default())
        .await
        .unwrap();
    let other = service
        .create(&user, "ws-1", "cv-2", RunOptions::default())
        .await
        .unwrap();

    let mut events = service
        .watch(
            &user,
            WatchOptions {
                workspace_id: None,
                run_id: Some(watched.id().to_string()),
            },
            token.clone(),
        )
        .await
        .unwrap();

    service.enqueue_plan(&user, other.id()).await.unwrap();
    service.enqueue_plan(&user, watched.id()).await.unwrap();
    service
        .put_chunk(
            &user,
            Chunk::new(watched.id(), PhaseKind::Plan, 0, Bytes::from_static(b"noise")),
        )
        .await
        .unwrap();
    service.cancel(&user, watched.id()).await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        match events.next().await {
            Some(Event::RunStatusChanged(run)) => {
                assert_eq!(run.id(), watched.id());
                seen.push(run.status());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    token.cancel();
    assert!(events.next().await.is_none());
    assert_eq!(seen, vec![RunStatus::PlanQueued, RunStatus::Canceled]);
}

#[tokio::test]
async fn test_get_chunk_past_end_is_empty() {
    let service = common::service().await;
    let agent = Subject::agent("agent-1");
    let run = service
        .create(&agent, "ws-1", "cv-1", RunOptions::default())
        .await
        .unwrap();

    service
        .put_chunk(
            &agent,
            Chunk::new(run.id(), PhaseKind::Plan, 0, Bytes::from_static(b"hello")),
        )
        .await
        .unwrap();

    let segment = service
        .get_chunk(&agent, GetChunkOptions::from_offset(run.id(), PhaseKind::Plan, 2))
        .await
        .unwrap();
    assert_eq!(&segment.chunk.data[..], b"llo");
    assert!(!segment.terminal);

    let segment = service
        .get_chunk(&agent, GetChunkOptions::from_offset(run.id(), PhaseKind::Plan, 42))
        .await
        .unwrap();
    assert!(segment.chunk.is_empty());
    assert!(!segment.terminal);
}
