// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for runplane-core.
//!
//! This module defines the narrow repository interface the engine needs and
//! the SQLite and PostgreSQL implementations of it.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::artifacts::ArtifactKey;
use crate::error::{CoreError, Result};
use crate::logs::{Chunk, PersistedChunk};
use crate::run::{
    Phase, PhaseKind, PhaseStatus, ResourceReport, Run, RunOptions, RunParts, RunStatus,
    StatusLog, StatusTimestamp,
};

/// Run row from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    /// Run ID.
    pub run_id: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// Configuration version executed.
    pub configuration_version_id: String,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// Current status (denormalised from the status log).
    pub status: String,
    /// Destroy run.
    pub is_destroy: bool,
    /// Refresh before planning.
    pub refresh: bool,
    /// Refresh only.
    pub refresh_only: bool,
    /// Auto-apply after a plan with changes.
    pub auto_apply: bool,
    /// Speculative run.
    pub plan_only: bool,
    /// Free-text message.
    pub message: Option<String>,
    /// JSON array of target addresses.
    pub target_addrs: String,
    /// JSON array of replace addresses.
    pub replace_addrs: String,
    /// Earliest force-cancel instant.
    pub force_cancel_available_at: Option<DateTime<Utc>>,
}

/// Phase row from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PhaseRecord {
    /// Owning run.
    pub run_id: String,
    /// `plan` or `apply`.
    pub phase: String,
    /// Current status.
    pub status: String,
    /// Report additions, when a report is attached.
    pub additions: Option<i64>,
    /// Report changes.
    pub changes: Option<i64>,
    /// Report destructions.
    pub destructions: Option<i64>,
}

/// One row of a run's status history.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunStatusTimestampRecord {
    /// Position in the log, from 0.
    pub seq: i64,
    /// Status entered.
    pub status: String,
    /// When it was entered.
    pub timestamp: DateTime<Utc>,
}

/// One row of a phase's status history.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PhaseStatusTimestampRecord {
    /// `plan` or `apply`.
    pub phase: String,
    /// Position in the log, from 0.
    pub seq: i64,
    /// Status entered.
    pub status: String,
    /// When it was entered.
    pub timestamp: DateTime<Utc>,
}

/// Log chunk row from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChunkRecord {
    /// Database primary key.
    pub id: i64,
    /// Owning run.
    pub run_id: String,
    /// `plan` or `apply`.
    pub phase: String,
    /// Byte offset of the chunk.
    pub chunk_offset: i64,
    /// Payload.
    pub data: Vec<u8>,
    /// End-of-stream marker.
    pub terminal: bool,
}

impl TryFrom<ChunkRecord> for PersistedChunk {
    type Error = CoreError;

    fn try_from(record: ChunkRecord) -> Result<Self> {
        let offset = u64::try_from(record.chunk_offset)
            .map_err(|e| CoreError::database("decode_chunk", e))?;
        Ok(PersistedChunk {
            id: record.id,
            chunk: Chunk::new(
                record.run_id,
                record.phase.parse()?,
                offset,
                Bytes::from(record.data),
            ),
            terminal: record.terminal,
        })
    }
}

/// Filter options for listing runs. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct ListRunsFilter {
    /// Only runs of this workspace.
    pub workspace_id: Option<String>,
    /// Only runs in one of these statuses; any status when empty.
    pub statuses: Vec<RunStatus>,
    /// Maximum number of runs.
    pub limit: Option<i64>,
    /// Number of runs to skip.
    pub offset: Option<i64>,
}

/// Persistence interface used by the run service.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Insert a new run with its phases and initial status history.
    async fn insert_run(&self, run: &Run) -> Result<()>;

    /// Load a run with its phases and status history.
    async fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// List runs matching `filter`.
    async fn list_runs(&self, filter: &ListRunsFilter) -> Result<Vec<Run>>;

    /// Load a run for update inside a transaction holding its row lock.
    ///
    /// Fails with [`CoreError::RunNotFound`] when the run does not exist.
    async fn lock_run(&self, run_id: &str) -> Result<Box<dyn RunTransaction>>;

    /// Append a log chunk.
    async fn insert_chunk(&self, chunk: &Chunk, terminal: bool) -> Result<PersistedChunk>;

    /// All chunks of a phase, ordered by offset then row ID.
    async fn list_chunks(&self, run_id: &str, phase: PhaseKind) -> Result<Vec<PersistedChunk>>;

    /// Store an artifact. Returns false, leaving the stored value untouched,
    /// when the key already exists.
    async fn put_artifact(&self, key: &ArtifactKey, data: &[u8]) -> Result<bool>;

    /// Load an artifact.
    async fn get_artifact(&self, key: &ArtifactKey) -> Result<Option<Bytes>>;

    /// Check the database is reachable.
    async fn health_check_db(&self) -> Result<bool>;
}

/// A run loaded under its row lock.
///
/// Mutate the run through [`run_mut`](Self::run_mut), then
/// [`commit`](Self::commit) to persist the new status, phase rows and every
/// status-log entry appended since the load. Dropping the transaction rolls
/// it back.
#[async_trait]
pub trait RunTransaction: Send {
    /// The locked run.
    fn run(&self) -> &Run;

    /// The locked run, for applying transitions.
    fn run_mut(&mut self) -> &mut Run;

    /// Persist the changes and release the lock.
    async fn commit(self: Box<Self>) -> Result<Run>;
}

/// Status-log lengths at load time; entries past them are new.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LogWatermark {
    pub run: usize,
    pub plan: usize,
    pub apply: usize,
}

impl LogWatermark {
    pub fn of(run: &Run) -> Self {
        Self {
            run: run.status_log().len(),
            plan: run.plan().status_log().len(),
            apply: run.apply().status_log().len(),
        }
    }

    pub fn empty() -> Self {
        Self {
            run: 0,
            plan: 0,
            apply: 0,
        }
    }

    pub fn phase(&self, kind: PhaseKind) -> usize {
        match kind {
            PhaseKind::Plan => self.plan,
            PhaseKind::Apply => self.apply,
        }
    }
}

/// Everything persisted for one run.
pub(crate) struct RunRows {
    pub run: RunRecord,
    pub phases: Vec<PhaseRecord>,
    pub run_timestamps: Vec<RunStatusTimestampRecord>,
    pub phase_timestamps: Vec<PhaseStatusTimestampRecord>,
}

pub(crate) fn encode_addrs(addrs: &[String]) -> Result<String> {
    Ok(serde_json::to_string(addrs)?)
}

fn decode_addrs(json: &str) -> Result<Vec<String>> {
    Ok(serde_json::from_str(json)?)
}

pub(crate) fn encode_offset(offset: u64) -> Result<i64> {
    i64::try_from(offset).map_err(|_| CoreError::Validation {
        field: "offset".to_string(),
        message: format!("offset {} out of range", offset),
    })
}

/// Report columns of a phase row.
pub(crate) fn encode_report(phase: &Phase) -> (Option<i64>, Option<i64>, Option<i64>) {
    match phase.report() {
        Some(report) => (
            Some(i64::from(report.additions)),
            Some(i64::from(report.changes)),
            Some(i64::from(report.destructions)),
        ),
        None => (None, None, None),
    }
}

fn decode_report(record: &PhaseRecord) -> Result<Option<ResourceReport>> {
    let (Some(additions), Some(changes), Some(destructions)) =
        (record.additions, record.changes, record.destructions)
    else {
        return Ok(None);
    };
    let count = |value: i64| u32::try_from(value).map_err(|e| CoreError::database("decode_report", e));
    Ok(Some(ResourceReport::new(
        count(additions)?,
        count(changes)?,
        count(destructions)?,
    )))
}

/// Rebuild a run from its rows. Status-log rows must be ordered by `seq`.
pub(crate) fn assemble_run(rows: RunRows) -> Result<Run> {
    let RunRows {
        run: record,
        phases,
        run_timestamps,
        phase_timestamps,
    } = rows;

    let run_log = StatusLog::from_entries(
        run_timestamps
            .into_iter()
            .map(|row| {
                Ok(StatusTimestamp {
                    status: row.status.parse::<RunStatus>()?,
                    timestamp: row.timestamp,
                })
            })
            .collect::<Result<Vec<_>>>()?,
    )?;

    let mut plan = None;
    let mut apply = None;
    for phase_record in &phases {
        let kind: PhaseKind = phase_record.phase.parse()?;
        let entries = phase_timestamps
            .iter()
            .filter(|row| row.phase == phase_record.phase)
            .map(|row| {
                Ok(StatusTimestamp {
                    status: row.status.parse::<PhaseStatus>()?,
                    timestamp: row.timestamp,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let phase = Phase::restore(
            &record.run_id,
            kind,
            StatusLog::from_entries(entries)?,
            decode_report(phase_record)?,
        );
        match kind {
            PhaseKind::Plan => plan = Some(phase),
            PhaseKind::Apply => apply = Some(phase),
        }
    }

    let missing = |kind: PhaseKind| {
        CoreError::database(
            "load_run",
            format!("run '{}' has no {} phase", record.run_id, kind),
        )
    };
    let plan = plan.ok_or_else(|| missing(PhaseKind::Plan))?;
    let apply = apply.ok_or_else(|| missing(PhaseKind::Apply))?;

    let options = RunOptions {
        is_destroy: record.is_destroy,
        refresh: record.refresh,
        refresh_only: record.refresh_only,
        auto_apply: record.auto_apply,
        plan_only: record.plan_only,
        target_addrs: decode_addrs(&record.target_addrs)?,
        replace_addrs: decode_addrs(&record.replace_addrs)?,
        message: record.message,
    };

    Ok(Run::restore(RunParts {
        id: record.run_id,
        workspace_id: record.workspace_id,
        configuration_version_id: record.configuration_version_id,
        created_at: record.created_at,
        status: run_log,
        options,
        force_cancel_available_at: record.force_cancel_available_at,
        plan,
        apply,
    }))
}
