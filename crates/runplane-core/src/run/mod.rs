// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The run aggregate and its plan/apply phases.
//!
//! Every status change goes through one of the transition methods on [`Run`].
//! They only touch the in-memory value (appending to status logs); the
//! [`RunService`](crate::service::RunService) wraps each call in a store
//! transaction and publishes the result.
//!
//! ```text
//! pending ──enqueue_plan──► plan_queued ──start(plan)──► planning
//!                                                           │ finish(plan)
//!                        ┌──────────────────┬───────────────┼──────────────────┐
//!                        ▼                  ▼               ▼                  ▼
//!                    errored     planned_and_finished    planned ──────► apply_queued
//!                                                      (enqueue_apply     (auto-apply)
//!                                                       or auto-apply)         │ start(apply)
//!                                                                              ▼
//!                                                       errored ◄──finish── applying
//!                                                       applied ◄──(apply)──┘
//! ```
//!
//! `cancel`, `force_cancel` and `discard` are reachable as described on each
//! method.

mod phase;
mod report;
mod status;

pub use self::phase::{Phase, PhaseKind};
pub use self::report::{ReportError, ResourceReport, parse_apply_output, parse_plan_json};
pub use self::status::{PhaseStatus, RunStatus, StatusLog, StatusTimestamp};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// User-selected options for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Destroy every resource instead of converging.
    pub is_destroy: bool,
    /// Refresh state before planning.
    pub refresh: bool,
    /// Only refresh state; plan no changes.
    pub refresh_only: bool,
    /// Enqueue the apply as soon as the plan finishes with changes.
    pub auto_apply: bool,
    /// Speculative run: never applies.
    pub plan_only: bool,
    /// Resource addresses to restrict the run to.
    pub target_addrs: Vec<String>,
    /// Resource addresses to force replacement of.
    pub replace_addrs: Vec<String>,
    /// Free-text message.
    pub message: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            is_destroy: false,
            refresh: true,
            refresh_only: false,
            auto_apply: false,
            plan_only: false,
            target_addrs: Vec::new(),
            replace_addrs: Vec::new(),
            message: None,
        }
    }
}

impl RunOptions {
    fn validate(&self) -> Result<()> {
        if self.is_destroy && self.refresh_only {
            return Err(CoreError::Validation {
                field: "refresh_only".to_string(),
                message: "a destroy run cannot be refresh-only".to_string(),
            });
        }
        if self.plan_only && self.auto_apply {
            return Err(CoreError::Validation {
                field: "auto_apply".to_string(),
                message: "a plan-only run cannot auto-apply".to_string(),
            });
        }
        Ok(())
    }
}

/// How a worker reports the end of a phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseOutcome {
    /// The phase failed.
    pub errored: bool,
    /// Report parsed from the phase's output (ignored when errored).
    pub report: Option<ResourceReport>,
}

/// One plan-then-apply execution attempt against a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    id: String,
    workspace_id: String,
    configuration_version_id: String,
    created_at: DateTime<Utc>,
    status: StatusLog<RunStatus>,
    options: RunOptions,
    force_cancel_available_at: Option<DateTime<Utc>>,
    plan: Phase,
    apply: Phase,
}

/// Persisted parts a run is rebuilt from.
pub(crate) struct RunParts {
    pub id: String,
    pub workspace_id: String,
    pub configuration_version_id: String,
    pub created_at: DateTime<Utc>,
    pub status: StatusLog<RunStatus>,
    pub options: RunOptions,
    pub force_cancel_available_at: Option<DateTime<Utc>>,
    pub plan: Phase,
    pub apply: Phase,
}

/// Generate a new run ID.
pub fn new_run_id() -> String {
    format!("run-{}", Uuid::new_v4().simple())
}

impl Run {
    /// Create a pending run with pending plan and apply phases.
    pub fn new(
        workspace_id: &str,
        configuration_version_id: &str,
        options: RunOptions,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if workspace_id.is_empty() {
            return Err(CoreError::Validation {
                field: "workspace_id".to_string(),
                message: "workspace_id is required".to_string(),
            });
        }
        if configuration_version_id.is_empty() {
            return Err(CoreError::Validation {
                field: "configuration_version_id".to_string(),
                message: "configuration_version_id is required".to_string(),
            });
        }
        options.validate()?;

        let id = new_run_id();
        Ok(Self {
            plan: Phase::new(&id, PhaseKind::Plan, now),
            apply: Phase::new(&id, PhaseKind::Apply, now),
            id,
            workspace_id: workspace_id.to_string(),
            configuration_version_id: configuration_version_id.to_string(),
            created_at: now,
            status: StatusLog::new(RunStatus::Pending, now),
            options,
            force_cancel_available_at: None,
        })
    }

    pub(crate) fn restore(parts: RunParts) -> Self {
        Self {
            id: parts.id,
            workspace_id: parts.workspace_id,
            configuration_version_id: parts.configuration_version_id,
            created_at: parts.created_at,
            status: parts.status,
            options: parts.options,
            force_cancel_available_at: parts.force_cancel_available_at,
            plan: parts.plan,
            apply: parts.apply,
        }
    }

    /// Run ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Workspace the run belongs to.
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Configuration version the run executes.
    pub fn configuration_version_id(&self) -> &str {
        &self.configuration_version_id
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current status.
    pub fn status(&self) -> RunStatus {
        self.status.current()
    }

    /// Full status history.
    pub fn status_log(&self) -> &StatusLog<RunStatus> {
        &self.status
    }

    /// Run options.
    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Earliest instant at which a force-cancel is permitted.
    pub fn force_cancel_available_at(&self) -> Option<DateTime<Utc>> {
        self.force_cancel_available_at
    }

    /// The plan phase.
    pub fn plan(&self) -> &Phase {
        &self.plan
    }

    /// The apply phase.
    pub fn apply(&self) -> &Phase {
        &self.apply
    }

    /// The phase of the given kind.
    pub fn phase(&self, kind: PhaseKind) -> &Phase {
        match kind {
            PhaseKind::Plan => &self.plan,
            PhaseKind::Apply => &self.apply,
        }
    }

    fn phase_mut(&mut self, kind: PhaseKind) -> &mut Phase {
        match kind {
            PhaseKind::Plan => &mut self.plan,
            PhaseKind::Apply => &mut self.apply,
        }
    }

    /// When `status` was first entered.
    pub fn timestamp_of(&self, status: RunStatus) -> Option<DateTime<Utc>> {
        self.status.timestamp_of(status)
    }

    /// True once the run can make no further progress.
    pub fn is_done(&self) -> bool {
        self.status().is_done()
    }

    /// True if `cancel` would succeed.
    pub fn is_cancelable(&self) -> bool {
        !self.is_done()
    }

    /// True if `discard` would succeed.
    pub fn is_discardable(&self) -> bool {
        matches!(self.status(), RunStatus::Pending | RunStatus::Planned)
    }

    /// True if the plan reported changes.
    pub fn has_changes(&self) -> bool {
        self.plan.report().is_some_and(ResourceReport::has_changes)
    }

    fn update_status(&mut self, status: RunStatus, at: DateTime<Utc>) {
        self.status.update(status, at);
    }

    fn expect_status(&self, action: &'static str, expected: RunStatus) -> Result<()> {
        if self.status() != expected {
            return Err(CoreError::InvalidRunStatus {
                run_id: self.id.clone(),
                action,
                expected: expected.as_str(),
                actual: self.status(),
            });
        }
        Ok(())
    }

    /// `pending → plan_queued`; plan becomes queued.
    pub fn enqueue_plan(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect_status("enqueue plan", RunStatus::Pending)?;
        self.update_status(RunStatus::PlanQueued, now);
        self.plan.update_status(PhaseStatus::Queued, now);
        Ok(())
    }

    /// `planned → apply_queued`; apply becomes queued.
    pub fn enqueue_apply(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect_status("enqueue apply", RunStatus::Planned)?;
        self.update_status(RunStatus::ApplyQueued, now);
        self.apply.update_status(PhaseStatus::Queued, now);
        Ok(())
    }

    /// A worker picked up the phase.
    ///
    /// Plan: `plan_queued → planning`. Apply: `apply_queued → applying`.
    pub fn start_phase(&mut self, kind: PhaseKind, now: DateTime<Utc>) -> Result<()> {
        let (action, required, next) = match kind {
            PhaseKind::Plan => ("start plan", RunStatus::PlanQueued, RunStatus::Planning),
            PhaseKind::Apply => ("start apply", RunStatus::ApplyQueued, RunStatus::Applying),
        };
        self.expect_status(action, required)?;

        let phase_status = self.phase(kind).status();
        if phase_status != PhaseStatus::Queued {
            return Err(CoreError::InvalidPhaseStatus {
                run_id: self.id.clone(),
                phase: kind,
                action: "start",
                actual: phase_status,
            });
        }

        self.update_status(next, now);
        self.phase_mut(kind).update_status(PhaseStatus::Running, now);
        Ok(())
    }

    /// Fails unless the phase is the one currently running.
    pub fn ensure_finishable(&self, kind: PhaseKind) -> Result<()> {
        match kind {
            PhaseKind::Plan => self.expect_status("finish plan", RunStatus::Planning),
            PhaseKind::Apply => self.expect_status("finish apply", RunStatus::Applying),
        }
    }

    /// A worker finished the phase.
    ///
    /// The report is attached before the run status is decided; it is only
    /// kept when the phase succeeded with changes.
    pub fn finish_phase(
        &mut self,
        kind: PhaseKind,
        outcome: PhaseOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_finishable(kind)?;

        if outcome.errored {
            self.phase_mut(kind).update_status(PhaseStatus::Errored, now);
            if kind == PhaseKind::Plan {
                self.apply.update_status(PhaseStatus::Unreachable, now);
            }
            self.update_status(RunStatus::Errored, now);
            return Ok(());
        }

        let report = outcome.report.filter(ResourceReport::has_changes);
        let phase = self.phase_mut(kind);
        phase.set_report(report);
        phase.update_status(PhaseStatus::Finished, now);

        match kind {
            PhaseKind::Apply => self.update_status(RunStatus::Applied, now),
            PhaseKind::Plan if report.is_none() || self.options.plan_only => {
                self.update_status(RunStatus::PlannedAndFinished, now);
                self.apply.update_status(PhaseStatus::Unreachable, now);
            }
            PhaseKind::Plan => {
                self.update_status(RunStatus::Planned, now);
                if self.options.auto_apply {
                    self.enqueue_apply(now)?;
                }
            }
        }
        Ok(())
    }

    /// Discard a pending or planned run. Unfinished phases become unreachable.
    pub fn discard(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.is_discardable() {
            return Err(CoreError::DiscardNotAllowed {
                run_id: self.id.clone(),
                status: self.status(),
            });
        }

        for kind in PhaseKind::ALL {
            if !self.phase(kind).status().is_done() {
                self.phase_mut(kind)
                    .update_status(PhaseStatus::Unreachable, now);
            }
        }
        self.update_status(RunStatus::Discarded, now);
        Ok(())
    }

    /// Cancel a run that is not yet done.
    ///
    /// Returns true when a phase was running and the worker must be sent an
    /// interrupt. The force-cancel cooldown starts either way.
    pub fn cancel(&mut self, now: DateTime<Utc>, cooldown: Duration) -> Result<bool> {
        if !self.is_cancelable() {
            return Err(CoreError::CancelNotAllowed {
                run_id: self.id.clone(),
                status: self.status(),
            });
        }

        let signal = self.status().is_running();

        for kind in PhaseKind::ALL {
            let next = match self.phase(kind).status() {
                PhaseStatus::Pending => PhaseStatus::Unreachable,
                PhaseStatus::Queued | PhaseStatus::Running => PhaseStatus::Canceled,
                _ => continue,
            };
            self.phase_mut(kind).update_status(next, now);
        }

        self.force_cancel_available_at = Some(now + cooldown);
        self.update_status(RunStatus::Canceled, now);
        Ok(signal)
    }

    /// Force-cancel a run once the cooldown set by `cancel` has elapsed.
    pub fn force_cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.force_cancel_available_at {
            Some(available_at)
                if now >= available_at && self.status() != RunStatus::ForceCanceled =>
            {
                self.update_status(RunStatus::ForceCanceled, now);
                Ok(())
            }
            _ => Err(CoreError::ForceCancelNotAllowed {
                run_id: self.id.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_run(options: RunOptions) -> Run {
        Run::new("ws-123", "cv-123", options, Utc::now()).unwrap()
    }

    fn planning_run(options: RunOptions) -> Run {
        let mut run = new_run(options);
        run.enqueue_plan(Utc::now()).unwrap();
        run.start_phase(PhaseKind::Plan, Utc::now()).unwrap();
        run
    }

    fn with_changes(additions: u32) -> PhaseOutcome {
        PhaseOutcome {
            errored: false,
            report: Some(ResourceReport::new(additions, 0, 0)),
        }
    }

    /// Last status recorded in the log.
    fn replayed_status(run: &Run) -> RunStatus {
        let entries = run.status_log().entries();
        entries[entries.len() - 1].status
    }

    #[test]
    fn test_create_run_has_pending_phases() {
        let run = new_run(RunOptions::default());

        assert!(run.id().starts_with("run-"));
        assert_eq!(run.status(), RunStatus::Pending);
        assert_eq!(run.plan().status(), PhaseStatus::Pending);
        assert_eq!(run.apply().status(), PhaseStatus::Pending);
        assert_eq!(run.plan().run_id(), run.id());
        assert_eq!(run.apply().run_id(), run.id());
        assert_eq!(run.plan().kind(), PhaseKind::Plan);
        assert_eq!(run.apply().kind(), PhaseKind::Apply);
        assert!(run.force_cancel_available_at().is_none());
    }

    #[test]
    fn test_create_run_validates_options() {
        let options = RunOptions {
            is_destroy: true,
            refresh_only: true,
            ..RunOptions::default()
        };
        assert!(matches!(
            Run::new("ws", "cv", options, Utc::now()),
            Err(CoreError::Validation { .. })
        ));

        assert!(matches!(
            Run::new("", "cv", RunOptions::default(), Utc::now()),
            Err(CoreError::Validation { .. })
        ));
    }

    #[test]
    fn test_plan_with_changes_is_planned() {
        let mut run = planning_run(RunOptions::default());
        run.finish_phase(PhaseKind::Plan, with_changes(2), Utc::now())
            .unwrap();

        assert_eq!(run.status(), RunStatus::Planned);
        assert_eq!(run.plan().status(), PhaseStatus::Finished);
        assert_eq!(run.apply().status(), PhaseStatus::Pending);
        assert_eq!(run.plan().report(), Some(&ResourceReport::new(2, 0, 0)));
        assert!(run.has_changes());
    }

    #[test]
    fn test_plan_with_changes_and_auto_apply_is_apply_queued() {
        let options = RunOptions {
            auto_apply: true,
            ..RunOptions::default()
        };
        let mut run = planning_run(options);
        run.finish_phase(PhaseKind::Plan, with_changes(2), Utc::now())
            .unwrap();

        assert_eq!(run.status(), RunStatus::ApplyQueued);
        assert_eq!(run.apply().status(), PhaseStatus::Queued);
        assert!(run.timestamp_of(RunStatus::Planned).is_some());
    }

    #[test]
    fn test_errored_plan_makes_apply_unreachable() {
        let mut run = planning_run(RunOptions::default());
        let outcome = PhaseOutcome {
            errored: true,
            report: Some(ResourceReport::new(1, 0, 0)),
        };
        run.finish_phase(PhaseKind::Plan, outcome, Utc::now())
            .unwrap();

        assert_eq!(run.status(), RunStatus::Errored);
        assert_eq!(run.plan().status(), PhaseStatus::Errored);
        assert_eq!(run.apply().status(), PhaseStatus::Unreachable);
        assert!(run.plan().report().is_none());
    }

    #[test]
    fn test_plan_without_changes_is_planned_and_finished() {
        for report in [None, Some(ResourceReport::default())] {
            let mut run = planning_run(RunOptions::default());
            let outcome = PhaseOutcome {
                errored: false,
                report,
            };
            run.finish_phase(PhaseKind::Plan, outcome, Utc::now())
                .unwrap();

            assert_eq!(run.status(), RunStatus::PlannedAndFinished);
            assert_eq!(run.plan().status(), PhaseStatus::Finished);
            assert_eq!(run.apply().status(), PhaseStatus::Unreachable);
            assert!(run.plan().report().is_none());
        }
    }

    #[test]
    fn test_plan_only_run_never_applies() {
        let options = RunOptions {
            plan_only: true,
            ..RunOptions::default()
        };
        let mut run = planning_run(options);
        run.finish_phase(PhaseKind::Plan, with_changes(3), Utc::now())
            .unwrap();

        assert_eq!(run.status(), RunStatus::PlannedAndFinished);
        assert_eq!(run.apply().status(), PhaseStatus::Unreachable);
        assert!(run.has_changes());
    }

    #[test]
    fn test_full_lifecycle_to_applied() {
        let mut run = planning_run(RunOptions::default());
        run.finish_phase(PhaseKind::Plan, with_changes(1), Utc::now())
            .unwrap();
        run.enqueue_apply(Utc::now()).unwrap();
        run.start_phase(PhaseKind::Apply, Utc::now()).unwrap();
        assert_eq!(run.status(), RunStatus::Applying);
        assert!(run.apply().started_at().is_some());

        run.finish_phase(PhaseKind::Apply, with_changes(1), Utc::now())
            .unwrap();
        assert_eq!(run.status(), RunStatus::Applied);
        assert_eq!(run.apply().status(), PhaseStatus::Finished);

        let statuses: Vec<RunStatus> = run
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
        assert_eq!(replayed_status(&run), run.status());
    }

    #[test]
    fn test_errored_apply() {
        let mut run = planning_run(RunOptions::default());
        run.finish_phase(PhaseKind::Plan, with_changes(1), Utc::now())
            .unwrap();
        run.enqueue_apply(Utc::now()).unwrap();
        run.start_phase(PhaseKind::Apply, Utc::now()).unwrap();
        run.finish_phase(
            PhaseKind::Apply,
            PhaseOutcome {
                errored: true,
                report: None,
            },
            Utc::now(),
        )
        .unwrap();

        assert_eq!(run.status(), RunStatus::Errored);
        assert_eq!(run.apply().status(), PhaseStatus::Errored);
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let mut run = new_run(RunOptions::default());

        let err = run.start_phase(PhaseKind::Plan, Utc::now()).unwrap_err();
        assert!(err.is_precondition());
        let err = run.enqueue_apply(Utc::now()).unwrap_err();
        assert!(err.is_precondition());
        let err = run
            .finish_phase(PhaseKind::Plan, PhaseOutcome::default(), Utc::now())
            .unwrap_err();
        assert!(err.is_precondition());

        assert_eq!(run.status(), RunStatus::Pending);
        assert_eq!(run.status_log().len(), 1);
    }

    #[test]
    fn test_ensure_finishable_names_expected_status() {
        let run = planning_run(RunOptions::default());
        assert!(run.ensure_finishable(PhaseKind::Plan).is_ok());

        match run.ensure_finishable(PhaseKind::Apply).unwrap_err() {
            CoreError::InvalidRunStatus {
                action,
                expected,
                actual,
                ..
            } => {
                assert_eq!(action, "finish apply");
                assert_eq!(expected, "applying");
                assert_eq!(actual, RunStatus::Planning);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_discard_while_applying_fails() {
        let mut run = planning_run(RunOptions::default());
        run.finish_phase(PhaseKind::Plan, with_changes(1), Utc::now())
            .unwrap();
        run.enqueue_apply(Utc::now()).unwrap();
        run.start_phase(PhaseKind::Apply, Utc::now()).unwrap();

        let err = run.discard(Utc::now()).unwrap_err();
        assert!(matches!(err, CoreError::DiscardNotAllowed { .. }));
        assert_eq!(run.status(), RunStatus::Applying);
    }

    #[test]
    fn test_discard_planned_run() {
        let mut run = planning_run(RunOptions::default());
        run.finish_phase(PhaseKind::Plan, with_changes(1), Utc::now())
            .unwrap();
        run.discard(Utc::now()).unwrap();

        assert_eq!(run.status(), RunStatus::Discarded);
        assert_eq!(run.plan().status(), PhaseStatus::Finished);
        assert_eq!(run.apply().status(), PhaseStatus::Unreachable);
    }

    #[test]
    fn test_cancel_running_plan_signals() {
        let mut run = planning_run(RunOptions::default());
        let now = Utc::now();
        let signal = run.cancel(now, Duration::seconds(10)).unwrap();

        assert!(signal);
        assert_eq!(run.status(), RunStatus::Canceled);
        assert_eq!(run.plan().status(), PhaseStatus::Canceled);
        assert_eq!(run.apply().status(), PhaseStatus::Unreachable);
        assert_eq!(
            run.force_cancel_available_at(),
            Some(now + Duration::seconds(10))
        );
    }

    #[test]
    fn test_cancel_pending_run_sets_cooldown_without_signal() {
        let mut run = new_run(RunOptions::default());
        let now = Utc::now();
        let signal = run.cancel(now, Duration::seconds(10)).unwrap();

        assert!(!signal);
        assert_eq!(
            run.force_cancel_available_at(),
            Some(now + Duration::seconds(10))
        );
    }

    #[test]
    fn test_cancel_twice_keeps_cooldown() {
        let mut run = planning_run(RunOptions::default());
        let first = Utc::now();
        run.cancel(first, Duration::seconds(10)).unwrap();

        let err = run
            .cancel(first + Duration::seconds(5), Duration::seconds(10))
            .unwrap_err();
        assert!(matches!(err, CoreError::CancelNotAllowed { .. }));
        assert_eq!(
            run.force_cancel_available_at(),
            Some(first + Duration::seconds(10))
        );
    }

    #[test]
    fn test_force_cancel_respects_cooldown() {
        let mut run = planning_run(RunOptions::default());
        let now = Utc::now();

        // never canceled
        assert!(matches!(
            run.force_cancel(now),
            Err(CoreError::ForceCancelNotAllowed { .. })
        ));

        run.cancel(now, Duration::seconds(10)).unwrap();
        assert!(matches!(
            run.force_cancel(now + Duration::seconds(5)),
            Err(CoreError::ForceCancelNotAllowed { .. })
        ));

        run.force_cancel(now + Duration::seconds(10)).unwrap();
        assert_eq!(run.status(), RunStatus::ForceCanceled);

        assert!(run.force_cancel(now + Duration::seconds(20)).is_err());
    }
}
