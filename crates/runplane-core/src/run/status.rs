// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status vocabularies for runs and phases, plus the append-only status log
//! shared by both.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, plan not yet enqueued.
    Pending,
    /// Plan enqueued, waiting for a worker.
    PlanQueued,
    /// Plan running on a worker.
    Planning,
    /// Plan finished with changes, waiting for confirmation.
    Planned,
    /// Plan finished and nothing more will happen.
    PlannedAndFinished,
    /// Apply enqueued, waiting for a worker.
    ApplyQueued,
    /// Apply running on a worker.
    Applying,
    /// Apply finished.
    Applied,
    /// A phase errored.
    Errored,
    /// Canceled by a user.
    Canceled,
    /// Force-canceled after the cancel cooldown.
    ForceCanceled,
    /// Planned changes discarded.
    Discarded,
}

impl RunStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [RunStatus; 12] = [
        RunStatus::Pending,
        RunStatus::PlanQueued,
        RunStatus::Planning,
        RunStatus::Planned,
        RunStatus::PlannedAndFinished,
        RunStatus::ApplyQueued,
        RunStatus::Applying,
        RunStatus::Applied,
        RunStatus::Errored,
        RunStatus::Canceled,
        RunStatus::ForceCanceled,
        RunStatus::Discarded,
    ];

    /// Stable string form used in storage and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::PlanQueued => "plan_queued",
            RunStatus::Planning => "planning",
            RunStatus::Planned => "planned",
            RunStatus::PlannedAndFinished => "planned_and_finished",
            RunStatus::ApplyQueued => "apply_queued",
            RunStatus::Applying => "applying",
            RunStatus::Applied => "applied",
            RunStatus::Errored => "errored",
            RunStatus::Canceled => "canceled",
            RunStatus::ForceCanceled => "force_canceled",
            RunStatus::Discarded => "discarded",
        }
    }

    /// True once the run can make no further progress.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            RunStatus::Applied
                | RunStatus::PlannedAndFinished
                | RunStatus::Errored
                | RunStatus::Canceled
                | RunStatus::ForceCanceled
                | RunStatus::Discarded
        )
    }

    /// True while a worker is executing a phase.
    pub fn is_running(&self) -> bool {
        matches!(self, RunStatus::Planning | RunStatus::Applying)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::Validation {
                field: "run_status".to_string(),
                message: format!("unknown run status '{}'", s),
            })
    }
}

/// Status of a plan or apply phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Not yet enqueued.
    Pending,
    /// Enqueued, waiting for a worker.
    Queued,
    /// Running on a worker.
    Running,
    /// Completed successfully.
    Finished,
    /// Completed with an error.
    Errored,
    /// Canceled while queued or running.
    Canceled,
    /// Will never run.
    Unreachable,
}

impl PhaseStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [PhaseStatus; 7] = [
        PhaseStatus::Pending,
        PhaseStatus::Queued,
        PhaseStatus::Running,
        PhaseStatus::Finished,
        PhaseStatus::Errored,
        PhaseStatus::Canceled,
        PhaseStatus::Unreachable,
    ];

    /// Stable string form used in storage and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Queued => "queued",
            PhaseStatus::Running => "running",
            PhaseStatus::Finished => "finished",
            PhaseStatus::Errored => "errored",
            PhaseStatus::Canceled => "canceled",
            PhaseStatus::Unreachable => "unreachable",
        }
    }

    /// True once the phase will produce no more output.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Finished
                | PhaseStatus::Errored
                | PhaseStatus::Canceled
                | PhaseStatus::Unreachable
        )
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PhaseStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::Validation {
                field: "phase_status".to_string(),
                message: format!("unknown phase status '{}'", s),
            })
    }
}

/// One entry in a status log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTimestamp<S> {
    /// The status entered.
    pub status: S,
    /// When it was entered.
    pub timestamp: DateTime<Utc>,
}

/// Current status plus its append-only, timestamped history.
///
/// The log is never empty and the current status is always the last entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusLog<S> {
    entries: Vec<StatusTimestamp<S>>,
}

impl<S: Copy + PartialEq> StatusLog<S> {
    /// Start a log in `initial`.
    pub fn new(initial: S, at: DateTime<Utc>) -> Self {
        Self {
            entries: vec![StatusTimestamp {
                status: initial,
                timestamp: at,
            }],
        }
    }

    /// Rebuild a log from persisted entries, oldest first.
    pub fn from_entries(entries: Vec<StatusTimestamp<S>>) -> Result<Self, CoreError> {
        if entries.is_empty() {
            return Err(CoreError::Validation {
                field: "status_log".to_string(),
                message: "status log has no entries".to_string(),
            });
        }
        Ok(Self { entries })
    }

    /// The current status.
    pub fn current(&self) -> S {
        // never empty: constructors guarantee at least one entry
        self.entries[self.entries.len() - 1].status
    }

    /// Append a new status.
    pub fn update(&mut self, status: S, at: DateTime<Utc>) {
        self.entries.push(StatusTimestamp {
            status,
            timestamp: at,
        });
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[StatusTimestamp<S>] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no status was ever recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// When `status` was first entered, if ever.
    pub fn timestamp_of(&self, status: S) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .find(|entry| entry.status == status)
            .map(|entry| entry.timestamp)
    }
}
