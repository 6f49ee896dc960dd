// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for runplane-core.
//!
//! A single error type covers every façade entry point. Each variant maps to a
//! stable error code so adapters can translate it into their own status codes
//! (permission error, conflict, not found, server error).

use crate::run::{PhaseKind, RunStatus};

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while processing a run operation.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// The subject may not perform the action on the run's workspace.
    #[error("subject '{subject}' is not authorized to {action} in workspace '{workspace_id}'")]
    Unauthorized {
        /// The acting subject.
        subject: String,
        /// The denied action.
        action: String,
        /// The workspace the run belongs to.
        workspace_id: String,
    },

    /// Run was not found.
    #[error("run '{run_id}' not found")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// Artifact was not found.
    #[error("{artifact} not found for run '{run_id}'")]
    ArtifactNotFound {
        /// The run ID.
        run_id: String,
        /// Human-readable artifact name (e.g. "plan file (json)").
        artifact: String,
    },

    /// Artifact was already uploaded with different content.
    #[error("{artifact} already uploaded for run '{run_id}'")]
    ArtifactAlreadyExists {
        /// The run ID.
        run_id: String,
        /// Human-readable artifact name.
        artifact: String,
    },

    /// Run is in the wrong status for the requested transition.
    #[error("run '{run_id}' cannot {action}: expected status {expected}, got '{actual}'")]
    InvalidRunStatus {
        /// The run ID.
        run_id: String,
        /// The attempted transition.
        action: &'static str,
        /// The status the transition requires.
        expected: &'static str,
        /// The status the run is actually in.
        actual: RunStatus,
    },

    /// Phase is in the wrong status for the requested transition.
    #[error("{phase} phase of run '{run_id}' cannot {action} from status '{actual}'")]
    InvalidPhaseStatus {
        /// The run ID.
        run_id: String,
        /// The phase.
        phase: PhaseKind,
        /// The attempted transition.
        action: &'static str,
        /// The status the phase is actually in.
        actual: crate::run::PhaseStatus,
    },

    /// Discard attempted on a run that is neither pending nor planned.
    #[error("discard not allowed: run '{run_id}' is '{status}'")]
    DiscardNotAllowed {
        /// The run ID.
        run_id: String,
        /// The current run status.
        status: RunStatus,
    },

    /// Cancel attempted on a run that is already done.
    #[error("cancel not allowed: run '{run_id}' is '{status}'")]
    CancelNotAllowed {
        /// The run ID.
        run_id: String,
        /// The current run status.
        status: RunStatus,
    },

    /// Force-cancel attempted before the cooldown elapsed (or without a prior cancel).
    #[error("force-cancel not allowed for run '{run_id}'")]
    ForceCancelNotAllowed {
        /// The run ID.
        run_id: String,
    },

    /// Phase output could not be turned into a resource report.
    #[error("failed to parse {phase} report for run '{run_id}': {reason}")]
    ReportParse {
        /// The run ID.
        run_id: String,
        /// The phase whose output failed to parse.
        phase: PhaseKind,
        /// Parser message.
        reason: String,
    },

    /// Input validation failed.
    #[error("validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::ArtifactNotFound { .. } => "ARTIFACT_NOT_FOUND",
            Self::ArtifactAlreadyExists { .. } => "ARTIFACT_ALREADY_EXISTS",
            Self::InvalidRunStatus { .. } => "INVALID_RUN_STATUS",
            Self::InvalidPhaseStatus { .. } => "INVALID_PHASE_STATUS",
            Self::DiscardNotAllowed { .. } => "DISCARD_NOT_ALLOWED",
            Self::CancelNotAllowed { .. } => "CANCEL_NOT_ALLOWED",
            Self::ForceCancelNotAllowed { .. } => "FORCE_CANCEL_NOT_ALLOWED",
            Self::ReportParse { .. } => "REPORT_PARSE_FAILED",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// True for state-machine precondition failures (surfaced as a conflict).
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::InvalidRunStatus { .. }
                | Self::InvalidPhaseStatus { .. }
                | Self::DiscardNotAllowed { .. }
                | Self::CancelNotAllowed { .. }
                | Self::ForceCancelNotAllowed { .. }
                | Self::ArtifactAlreadyExists { .. }
        )
    }

    /// True for not-found errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RunNotFound { .. } | Self::ArtifactNotFound { .. }
        )
    }

    /// Only transient store failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DatabaseError { .. })
    }

    pub(crate) fn database(operation: &str, details: impl std::fmt::Display) -> Self {
        CoreError::DatabaseError {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::database("query", err)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::database("json", err)
    }
}
