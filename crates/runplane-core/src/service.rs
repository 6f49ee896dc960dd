// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run service: the façade every caller goes through.
//!
//! Each mutating entry point follows the same sequence:
//!
//! 1. lock the run row and authorize the subject against its workspace
//! 2. apply the state-machine transition to the locked run
//! 3. commit the run, phase and status-timestamp rows together
//! 4. publish the resulting event
//!
//! A failed step leaves nothing behind: an uncommitted transaction rolls back
//! on drop and nothing is published before the commit succeeds.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runplane_core::persistence::SqlitePersistence;
//! use runplane_core::service::RunService;
//!
//! let persistence = Arc::new(SqlitePersistence::from_path(".data/runs.db").await?);
//! let service = RunService::builder().persistence(persistence).build()?;
//!
//! let run = service.create(&subject, "ws-1", "cv-1", RunOptions::default()).await?;
//! let run = service.enqueue_plan(&subject, run.id()).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::artifacts::{ArtifactCache, ArtifactKey, DEFAULT_CACHE_CAPACITY, PlanFormat};
use crate::authz::{Action, AllowAll, Authorizer, Subject, authorize};
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::events::{Event, EventBus, Subscription};
use crate::logs::{Chunk, GetChunkOptions, LogSegment, LogStore, PersistedChunk};
use crate::persistence::{ListRunsFilter, Persistence};
use crate::run::{
    PhaseKind, PhaseOutcome, ResourceReport, Run, RunOptions, parse_apply_output,
    parse_plan_json,
};

/// Default delay between a cancel and the earliest force-cancel.
pub const DEFAULT_FORCE_CANCEL_COOLDOWN: Duration = Duration::from_secs(10);

/// Which run events a watcher receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Only runs of this workspace.
    pub workspace_id: Option<String>,
    /// Only this run.
    pub run_id: Option<String>,
}

/// Builder for creating a [`RunService`].
pub struct RunServiceBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    authorizer: Arc<dyn Authorizer>,
    event_bus: Option<EventBus>,
    artifact_cache_capacity: usize,
    force_cancel_cooldown: Duration,
}

impl std::fmt::Debug for RunServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunServiceBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("artifact_cache_capacity", &self.artifact_cache_capacity)
            .field("force_cancel_cooldown", &self.force_cancel_cooldown)
            .finish()
    }
}

impl Default for RunServiceBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            authorizer: Arc::new(AllowAll),
            event_bus: None,
            artifact_cache_capacity: DEFAULT_CACHE_CAPACITY,
            force_cancel_cooldown: DEFAULT_FORCE_CANCEL_COOLDOWN,
        }
    }
}

impl RunServiceBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder seeded with the tunables from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::default()
            .event_bus(EventBus::new(config.event_buffer))
            .artifact_cache_capacity(config.artifact_cache_capacity)
            .force_cancel_cooldown(config.force_cancel_cooldown)
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the authorization predicate.
    ///
    /// Default: [`AllowAll`]
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Share an existing event bus.
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Number of artifacts kept in memory.
    ///
    /// Default: 512
    pub fn artifact_cache_capacity(mut self, capacity: usize) -> Self {
        self.artifact_cache_capacity = capacity;
        self
    }

    /// Delay between a cancel and the earliest force-cancel.
    ///
    /// Default: 10 seconds
    pub fn force_cancel_cooldown(mut self, cooldown: Duration) -> Self {
        self.force_cancel_cooldown = cooldown;
        self
    }

    /// Build the service.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<RunService> {
        let persistence = self.persistence.ok_or_else(|| CoreError::Validation {
            field: "persistence".to_string(),
            message: "persistence is required".to_string(),
        })?;
        let force_cancel_cooldown = chrono::Duration::from_std(self.force_cancel_cooldown)
            .map_err(|e| CoreError::Validation {
                field: "force_cancel_cooldown".to_string(),
                message: e.to_string(),
            })?;

        let bus = self.event_bus.unwrap_or_default();
        Ok(RunService {
            logs: LogStore::new(persistence.clone(), bus.clone()),
            artifacts: Arc::new(ArtifactCache::new(
                persistence.clone(),
                self.artifact_cache_capacity,
            )),
            persistence,
            authorizer: self.authorizer,
            bus,
            force_cancel_cooldown,
        })
    }
}

/// The run lifecycle façade. Cheap to clone.
#[derive(Clone)]
pub struct RunService {
    persistence: Arc<dyn Persistence>,
    authorizer: Arc<dyn Authorizer>,
    bus: EventBus,
    artifacts: Arc<ArtifactCache>,
    logs: LogStore,
    force_cancel_cooldown: chrono::Duration,
}

impl std::fmt::Debug for RunService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunService")
            .field("persistence", &"...")
            .field("bus", &self.bus)
            .field("force_cancel_cooldown", &self.force_cancel_cooldown)
            .finish()
    }
}

impl RunService {
    /// Create a new builder for configuring the service.
    pub fn builder() -> RunServiceBuilder {
        RunServiceBuilder::new()
    }

    /// The event bus the service publishes on.
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// The log store, for callers holding a signed log URL.
    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    /// The artifact cache.
    pub fn artifacts(&self) -> &ArtifactCache {
        &self.artifacts
    }

    async fn load(&self, run_id: &str) -> Result<Run> {
        self.persistence
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Load a run and authorize `action` against its workspace.
    async fn load_authorized(&self, subject: &Subject, action: Action, run_id: &str) -> Result<Run> {
        let run = self.load(run_id).await?;
        authorize(self.authorizer.as_ref(), subject, action, run.workspace_id()).await?;
        Ok(run)
    }

    /// Lock, authorize, transition, commit, publish.
    ///
    /// `apply` may return one extra event, published after the status change.
    async fn transition<F>(
        &self,
        subject: &Subject,
        action: Action,
        run_id: &str,
        apply: F,
    ) -> Result<Run>
    where
        F: FnOnce(&mut Run, DateTime<Utc>) -> Result<Option<Event>> + Send,
    {
        let mut tx = self.persistence.lock_run(run_id).await?;
        authorize(
            self.authorizer.as_ref(),
            subject,
            action,
            tx.run().workspace_id(),
        )
        .await?;

        let extra = match apply(tx.run_mut(), Utc::now()) {
            Ok(extra) => extra,
            Err(e) => {
                if e.is_precondition() {
                    debug!(error = %e, "Transition rejected");
                }
                return Err(e);
            }
        };

        let run = tx.commit().await.inspect_err(|e| {
            error!(error = %e, "Failed to commit run transition");
        })?;
        info!(status = %run.status(), "Run transitioned");

        self.bus.publish(Event::RunStatusChanged(run.clone()));
        if let Some(event) = extra {
            self.bus.publish(event);
        }
        Ok(run)
    }

    // ========================================================================
    // Run lifecycle
    // ========================================================================

    /// Create a pending run.
    #[instrument(skip(self, subject, options), fields(subject = %subject))]
    pub async fn create(
        &self,
        subject: &Subject,
        workspace_id: &str,
        configuration_version_id: &str,
        options: RunOptions,
    ) -> Result<Run> {
        authorize(
            self.authorizer.as_ref(),
            subject,
            Action::CreateRun,
            workspace_id,
        )
        .await?;

        let run = Run::new(workspace_id, configuration_version_id, options, Utc::now())?;
        self.persistence.insert_run(&run).await?;
        info!(run_id = %run.id(), "Run created");

        self.bus.publish(Event::RunCreated(run.clone()));
        Ok(run)
    }

    /// Fetch a run.
    #[instrument(skip(self, subject), fields(subject = %subject))]
    pub async fn get(&self, subject: &Subject, run_id: &str) -> Result<Run> {
        self.load_authorized(subject, Action::GetRun, run_id).await
    }

    /// List a workspace's runs, newest first.
    ///
    /// A workspace filter is required; the listing is authorized against it
    /// once, so every page is as full as `limit` allows.
    #[instrument(skip(self, subject), fields(subject = %subject))]
    pub async fn list(&self, subject: &Subject, filter: ListRunsFilter) -> Result<Vec<Run>> {
        let Some(workspace_id) = &filter.workspace_id else {
            return Err(CoreError::Validation {
                field: "workspace_id".to_string(),
                message: "a workspace filter is required".to_string(),
            });
        };
        authorize(
            self.authorizer.as_ref(),
            subject,
            Action::ListRuns,
            workspace_id,
        )
        .await?;
        self.persistence.list_runs(&filter).await
    }

    /// Queue the plan phase.
    #[instrument(skip(self, subject), fields(subject = %subject))]
    pub async fn enqueue_plan(&self, subject: &Subject, run_id: &str) -> Result<Run> {
        self.transition(subject, Action::EnqueuePlan, run_id, |run, now| {
            run.enqueue_plan(now).map(|_| None)
        })
        .await
    }

    /// A worker picked up a phase.
    #[instrument(skip(self, subject), fields(subject = %subject))]
    pub async fn start_phase(
        &self,
        subject: &Subject,
        run_id: &str,
        phase: PhaseKind,
    ) -> Result<Run> {
        self.transition(subject, Action::StartPhase, run_id, |run, now| {
            run.start_phase(phase, now).map(|_| None)
        })
        .await
    }

    /// A worker finished a phase.
    ///
    /// Once the phase is known to be running, the resource report is parsed
    /// from its output: the JSON plan file for the plan phase, the log for
    /// the apply phase. A report that cannot be produced marks the phase
    /// errored. The status is checked again under the row lock.
    #[instrument(skip(self, subject), fields(subject = %subject))]
    pub async fn finish_phase(
        &self,
        subject: &Subject,
        run_id: &str,
        phase: PhaseKind,
        errored: bool,
    ) -> Result<Run> {
        self.load_authorized(subject, Action::FinishPhase, run_id)
            .await?
            .ensure_finishable(phase)?;

        let outcome = if errored {
            PhaseOutcome {
                errored: true,
                report: None,
            }
        } else {
            match self.phase_report(run_id, phase).await {
                Ok(report) => PhaseOutcome {
                    errored: false,
                    report: Some(report),
                },
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Failed to produce resource report, marking phase errored");
                    PhaseOutcome {
                        errored: true,
                        report: None,
                    }
                }
            }
        };

        self.transition(subject, Action::FinishPhase, run_id, |run, now| {
            run.finish_phase(phase, outcome, now).map(|_| None)
        })
        .await
    }

    async fn phase_report(&self, run_id: &str, phase: PhaseKind) -> Result<ResourceReport> {
        let parsed = match phase {
            PhaseKind::Plan => {
                let json = self
                    .artifacts
                    .get(&ArtifactKey::plan_file(run_id, PlanFormat::Json))
                    .await?;
                parse_plan_json(&json)
            }
            PhaseKind::Apply => {
                let log = self
                    .logs
                    .get_chunk(GetChunkOptions::from_offset(run_id, PhaseKind::Apply, 0))
                    .await?;
                parse_apply_output(&log.chunk.data)
            }
        };

        parsed.map_err(|e| CoreError::ReportParse {
            run_id: run_id.to_string(),
            phase,
            reason: e.to_string(),
        })
    }

    /// Confirm a planned run, queueing its apply.
    #[instrument(skip(self, subject), fields(subject = %subject))]
    pub async fn apply(&self, subject: &Subject, run_id: &str) -> Result<Run> {
        self.transition(subject, Action::ApplyRun, run_id, |run, now| {
            run.enqueue_apply(now).map(|_| None)
        })
        .await
    }

    /// Queue the apply phase on behalf of a satellite.
    #[instrument(skip(self, subject), fields(subject = %subject))]
    pub async fn enqueue_apply(&self, subject: &Subject, run_id: &str) -> Result<Run> {
        self.transition(subject, Action::EnqueueApply, run_id, |run, now| {
            run.enqueue_apply(now).map(|_| None)
        })
        .await
    }

    /// Discard a pending or planned run.
    #[instrument(skip(self, subject), fields(subject = %subject))]
    pub async fn discard(&self, subject: &Subject, run_id: &str) -> Result<Run> {
        self.transition(subject, Action::DiscardRun, run_id, |run, now| {
            run.discard(now).map(|_| None)
        })
        .await
    }

    /// Cancel a run. A running phase gets an interrupt notification and
    /// force-cancel becomes available after the cooldown.
    #[instrument(skip(self, subject), fields(subject = %subject))]
    pub async fn cancel(&self, subject: &Subject, run_id: &str) -> Result<Run> {
        let cooldown = self.force_cancel_cooldown;
        self.transition(subject, Action::CancelRun, run_id, |run, now| {
            let signal = run.cancel(now, cooldown)?;
            Ok(signal.then(|| Event::CancelRequested {
                run_id: run.id().to_string(),
                force: false,
            }))
        })
        .await
    }

    /// Force-cancel a run once the cooldown has elapsed. Emits a kill
    /// notification.
    #[instrument(skip(self, subject), fields(subject = %subject))]
    pub async fn force_cancel(&self, subject: &Subject, run_id: &str) -> Result<Run> {
        self.transition(subject, Action::ForceCancelRun, run_id, |run, now| {
            run.force_cancel(now)?;
            Ok(Some(Event::CancelRequested {
                run_id: run.id().to_string(),
                force: true,
            }))
        })
        .await
    }

    // ========================================================================
    // Artifacts
    // ========================================================================

    /// Upload a run's plan file in `format`.
    #[instrument(skip(self, subject, data), fields(subject = %subject, len = data.len()))]
    pub async fn upload_plan_file(
        &self,
        subject: &Subject,
        run_id: &str,
        format: PlanFormat,
        data: Bytes,
    ) -> Result<()> {
        self.load_authorized(subject, Action::UploadPlanFile, run_id)
            .await?;
        self.artifacts
            .set(&ArtifactKey::plan_file(run_id, format), data)
            .await
    }

    /// Download a run's plan file in `format`.
    #[instrument(skip(self, subject), fields(subject = %subject))]
    pub async fn get_plan_file(
        &self,
        subject: &Subject,
        run_id: &str,
        format: PlanFormat,
    ) -> Result<Bytes> {
        self.load_authorized(subject, Action::GetPlanFile, run_id)
            .await?;
        self.artifacts
            .get(&ArtifactKey::plan_file(run_id, format))
            .await
    }

    /// Upload a run's lock file.
    #[instrument(skip(self, subject, data), fields(subject = %subject, len = data.len()))]
    pub async fn upload_lock_file(&self, subject: &Subject, run_id: &str, data: Bytes) -> Result<()> {
        self.load_authorized(subject, Action::UploadLockFile, run_id)
            .await?;
        self.artifacts
            .set(&ArtifactKey::lock_file(run_id), data)
            .await
    }

    /// Download a run's lock file.
    #[instrument(skip(self, subject), fields(subject = %subject))]
    pub async fn get_lock_file(&self, subject: &Subject, run_id: &str) -> Result<Bytes> {
        self.load_authorized(subject, Action::GetLockFile, run_id)
            .await?;
        self.artifacts.get(&ArtifactKey::lock_file(run_id)).await
    }

    // ========================================================================
    // Logs
    // ========================================================================

    /// Append a chunk to a phase's log.
    ///
    /// A chunk written after the phase is done is the terminal chunk.
    #[instrument(skip(self, subject, chunk), fields(subject = %subject, run_id = %chunk.run_id, phase = %chunk.phase))]
    pub async fn put_chunk(&self, subject: &Subject, chunk: Chunk) -> Result<PersistedChunk> {
        let run = self
            .load_authorized(subject, Action::PutChunk, &chunk.run_id)
            .await?;
        let terminal = run.phase(chunk.phase).status().is_done();
        self.logs.put_chunk(chunk, terminal).await
    }

    /// Read a phase's log.
    #[instrument(skip(self, subject, opts), fields(subject = %subject, run_id = %opts.run_id, phase = %opts.phase))]
    pub async fn get_chunk(&self, subject: &Subject, opts: GetChunkOptions) -> Result<LogSegment> {
        self.load_authorized(subject, Action::GetChunk, &opts.run_id)
            .await?;
        self.logs.get_chunk(opts).await
    }

    /// Follow a phase's log from `offset` until its terminal chunk or `token`
    /// is cancelled.
    #[instrument(skip(self, subject, token), fields(subject = %subject))]
    pub async fn tail(
        &self,
        subject: &Subject,
        run_id: &str,
        phase: PhaseKind,
        offset: u64,
        token: CancellationToken,
    ) -> Result<BoxStream<'static, Result<LogSegment>>> {
        self.load_authorized(subject, Action::GetChunk, run_id)
            .await?;
        Ok(self.logs.tail(run_id, phase, offset, token))
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Stream run events matching `opts` until `token` is cancelled.
    ///
    /// Yields run creations, status changes and (when watching a single run)
    /// cancel notifications. Log notes are not included.
    #[instrument(skip(self, subject, token), fields(subject = %subject))]
    pub async fn watch(
        &self,
        subject: &Subject,
        opts: WatchOptions,
        token: CancellationToken,
    ) -> Result<BoxStream<'static, Event>> {
        let workspace_id = match (&opts.workspace_id, &opts.run_id) {
            (Some(workspace_id), _) => workspace_id.clone(),
            (None, Some(run_id)) => self.load(run_id).await?.workspace_id().to_string(),
            (None, None) => {
                return Err(CoreError::Validation {
                    field: "watch".to_string(),
                    message: "a workspace or run filter is required".to_string(),
                });
            }
        };
        authorize(
            self.authorizer.as_ref(),
            subject,
            Action::WatchRuns,
            &workspace_id,
        )
        .await?;

        let mut sub = self.bus.subscribe(format!("watch:{}", subject.id));
        let run_filter = opts.run_id;

        Ok(Box::pin(async_stream::stream! {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => None,
                    event = sub.recv() => event,
                };
                let Some(event) = event else {
                    break;
                };

                let matches = match &event {
                    Event::RunCreated(run) | Event::RunStatusChanged(run) => {
                        run.workspace_id() == workspace_id
                            && run_filter.as_deref().is_none_or(|id| id == run.id())
                    }
                    Event::CancelRequested { run_id, .. } => {
                        run_filter.as_deref() == Some(run_id.as_str())
                    }
                    Event::LogAppended(_) | Event::Domain { .. } => false,
                };
                if matches {
                    yield event;
                }
            }
        }))
    }

    /// Subscribe to the raw event bus, for satellite processes.
    pub fn subscribe(&self, name: impl Into<String>) -> Subscription {
        self.bus.subscribe(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use crate::persistence::sqlite::tests::test_pool;
    use crate::run::{PhaseStatus, RunStatus};

    async fn service() -> RunService {
        let persistence = Arc::new(SqlitePersistence::new(test_pool().await));
        RunService::builder()
            .persistence(persistence)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_persistence() {
        let err = RunServiceBuilder::new().build().unwrap_err();
        assert!(err.to_string().contains("persistence is required"));
    }

    #[test]
    fn test_builder_debug_hides_persistence() {
        let builder = RunServiceBuilder::new().force_cancel_cooldown(Duration::from_secs(3));
        let debug_str = format!("{:?}", builder);
        assert!(debug_str.contains("RunServiceBuilder"));
        assert!(debug_str.contains("force_cancel_cooldown"));
    }

    #[tokio::test]
    async fn test_create_publishes_run_created() {
        let service = service().await;
        let mut sub = service.subscribe("test");
        let subject = Subject::user("alice");

        let run = service
            .create(&subject, "ws-1", "cv-1", RunOptions::default())
            .await
            .unwrap();

        match sub.recv().await {
            Some(Event::RunCreated(created)) => assert_eq!(created.id(), run.id()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_finish_plan_without_json_plan_errors_phase() {
        let service = service().await;
        let subject = Subject::agent("agent-1");
        let run = service
            .create(&subject, "ws-1", "cv-1", RunOptions::default())
            .await
            .unwrap();
        service.enqueue_plan(&subject, run.id()).await.unwrap();
        service
            .start_phase(&subject, run.id(), PhaseKind::Plan)
            .await
            .unwrap();

        let run = service
            .finish_phase(&subject, run.id(), PhaseKind::Plan, false)
            .await
            .unwrap();
        assert_eq!(run.status(), RunStatus::Errored);
        assert_eq!(run.plan().status(), PhaseStatus::Errored);
        assert_eq!(run.apply().status(), PhaseStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_finish_phase_not_running_is_rejected_before_report() {
        let service = service().await;
        let subject = Subject::agent("agent-1");
        let run = service
            .create(&subject, "ws-1", "cv-1", RunOptions::default())
            .await
            .unwrap();

        let err = service
            .finish_phase(&subject, run.id(), PhaseKind::Plan, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidRunStatus {
                expected: "planning",
                actual: RunStatus::Pending,
                ..
            }
        ));

        let run = service.get(&subject, run.id()).await.unwrap();
        assert_eq!(run.status(), RunStatus::Pending);
        assert_eq!(run.plan().status(), PhaseStatus::Pending);
    }

    #[tokio::test]
    async fn test_list_requires_workspace() {
        let service = service().await;
        let subject = Subject::user("alice");
        service
            .create(&subject, "ws-1", "cv-1", RunOptions::default())
            .await
            .unwrap();

        let err = service
            .list(&subject, ListRunsFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { ref field, .. } if field == "workspace_id"));

        let filter = ListRunsFilter {
            workspace_id: Some("ws-1".to_string()),
            ..ListRunsFilter::default()
        };
        assert_eq!(service.list(&subject, filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_precondition_publishes_nothing() {
        let service = service().await;
        let subject = Subject::user("alice");
        let run = service
            .create(&subject, "ws-1", "cv-1", RunOptions::default())
            .await
            .unwrap();
        let mut sub = service.subscribe("test");

        let err = service.apply(&subject, run.id()).await.unwrap_err();
        assert!(err.is_precondition());

        service.enqueue_plan(&subject, run.id()).await.unwrap();
        match sub.recv().await {
            Some(Event::RunStatusChanged(changed)) => {
                assert_eq!(changed.status(), RunStatus::PlanQueued)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_run() {
        let service = service().await;
        let err = service
            .cancel(&Subject::user("alice"), "run-missing")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_watch_requires_filter() {
        let service = service().await;
        let result = service
            .watch(
                &Subject::user("alice"),
                WatchOptions::default(),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(CoreError::Validation { .. })));
    }
}
