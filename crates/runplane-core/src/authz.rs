// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authorization seam.
//!
//! Policy evaluation lives outside this crate; the engine only asks "may this
//! subject perform this action in this workspace" and fails closed.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CoreError, Result};

/// What kind of caller a subject is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    /// An end user.
    User,
    /// A remote execution agent.
    Agent,
    /// An in-process satellite (reporter, spawner).
    System,
}

/// The acting caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    /// Caller identity.
    pub id: String,
    /// Caller kind.
    pub kind: SubjectKind,
}

impl Subject {
    /// An end user.
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: SubjectKind::User,
        }
    }

    /// A remote agent.
    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: SubjectKind::Agent,
        }
    }

    /// An in-process satellite.
    pub fn system(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: SubjectKind::System,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Actions checked against the policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Action {
    CreateRun,
    GetRun,
    ListRuns,
    WatchRuns,
    EnqueuePlan,
    EnqueueApply,
    ApplyRun,
    DiscardRun,
    CancelRun,
    ForceCancelRun,
    StartPhase,
    FinishPhase,
    PutChunk,
    GetChunk,
    UploadPlanFile,
    GetPlanFile,
    UploadLockFile,
    GetLockFile,
}

impl Action {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::CreateRun => "create_run",
            Action::GetRun => "get_run",
            Action::ListRuns => "list_runs",
            Action::WatchRuns => "watch_runs",
            Action::EnqueuePlan => "enqueue_plan",
            Action::EnqueueApply => "enqueue_apply",
            Action::ApplyRun => "apply_run",
            Action::DiscardRun => "discard_run",
            Action::CancelRun => "cancel_run",
            Action::ForceCancelRun => "force_cancel_run",
            Action::StartPhase => "start_phase",
            Action::FinishPhase => "finish_phase",
            Action::PutChunk => "put_chunk",
            Action::GetChunk => "get_chunk",
            Action::UploadPlanFile => "upload_plan_file",
            Action::GetPlanFile => "get_plan_file",
            Action::UploadLockFile => "upload_lock_file",
            Action::GetLockFile => "get_lock_file",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The "may subject S perform action A in workspace W" predicate.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// True if the subject may perform the action.
    async fn can_access(&self, subject: &Subject, action: Action, workspace_id: &str) -> bool;
}

/// Permits everything. For embedded and single-tenant setups.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn can_access(&self, _subject: &Subject, _action: Action, _workspace_id: &str) -> bool {
        true
    }
}

/// Check `action`, turning a denial into [`CoreError::Unauthorized`].
pub(crate) async fn authorize(
    authorizer: &dyn Authorizer,
    subject: &Subject,
    action: Action,
    workspace_id: &str,
) -> Result<()> {
    if authorizer.can_access(subject, action, workspace_id).await {
        return Ok(());
    }

    warn!(subject = %subject, action = %action, workspace_id, "Authorization denied");
    Err(CoreError::Unauthorized {
        subject: subject.id.clone(),
        action: action.to_string(),
        workspace_id: workspace_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AgentsOnly;

    #[async_trait]
    impl Authorizer for AgentsOnly {
        async fn can_access(&self, subject: &Subject, _action: Action, _ws: &str) -> bool {
            subject.kind == SubjectKind::Agent
        }
    }

    #[tokio::test]
    async fn test_authorize_fails_closed() {
        let err = authorize(&AgentsOnly, &Subject::user("alice"), Action::StartPhase, "ws-1")
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "UNAUTHORIZED");
        assert_eq!(
            err.to_string(),
            "subject 'alice' is not authorized to start_phase in workspace 'ws-1'"
        );

        authorize(&AgentsOnly, &Subject::agent("agent-1"), Action::StartPhase, "ws-1")
            .await
            .unwrap();
        authorize(&AllowAll, &Subject::user("alice"), Action::CancelRun, "ws-1")
            .await
            .unwrap();
    }
}
