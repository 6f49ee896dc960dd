// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plan and apply phases.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::report::ResourceReport;
use super::status::{PhaseStatus, StatusLog};
use crate::error::CoreError;

/// Which half of a run a phase is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// The plan phase.
    Plan,
    /// The apply phase.
    Apply,
}

impl PhaseKind {
    /// Both kinds, plan first.
    pub const ALL: [PhaseKind; 2] = [PhaseKind::Plan, PhaseKind::Apply];

    /// Stable string form used in storage and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Plan => "plan",
            PhaseKind::Apply => "apply",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(PhaseKind::Plan),
            "apply" => Ok(PhaseKind::Apply),
            other => Err(CoreError::Validation {
                field: "phase".to_string(),
                message: format!("unknown phase '{}'", other),
            }),
        }
    }
}

/// A plan or apply phase, owned by exactly one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    run_id: String,
    kind: PhaseKind,
    status: StatusLog<PhaseStatus>,
    report: Option<ResourceReport>,
}

impl Phase {
    pub(crate) fn new(run_id: &str, kind: PhaseKind, at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.to_string(),
            kind,
            status: StatusLog::new(PhaseStatus::Pending, at),
            report: None,
        }
    }

    pub(crate) fn restore(
        run_id: &str,
        kind: PhaseKind,
        status: StatusLog<PhaseStatus>,
        report: Option<ResourceReport>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            kind,
            status,
            report,
        }
    }

    /// ID of the owning run.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Plan or apply.
    pub fn kind(&self) -> PhaseKind {
        self.kind
    }

    /// Current status.
    pub fn status(&self) -> PhaseStatus {
        self.status.current()
    }

    /// Full status history.
    pub fn status_log(&self) -> &StatusLog<PhaseStatus> {
        &self.status
    }

    /// Resource report, once the phase finished with detectable changes.
    pub fn report(&self) -> Option<&ResourceReport> {
        self.report.as_ref()
    }

    /// When a worker started the phase.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.status.timestamp_of(PhaseStatus::Running)
    }

    pub(crate) fn update_status(&mut self, status: PhaseStatus, at: DateTime<Utc>) {
        self.status.update(status, at);
    }

    pub(crate) fn set_report(&mut self, report: Option<ResourceReport>) {
        self.report = report;
    }
}
