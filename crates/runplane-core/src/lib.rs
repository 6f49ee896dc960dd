// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runplane Core - Run Lifecycle Engine
//!
//! This crate owns the lifecycle of infrastructure runs: a run moves through a
//! plan phase and an optional apply phase, streams its logs in chunks, and
//! stores a plan file and a lock file. Every state change is persisted
//! transactionally and announced on an in-process event bus.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Transports (HTTP, RPC, agents)                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             RunService                                   │
//! │        authorize ─► lock run ─► transition ─► commit ─► publish          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!      │                    │                     │                 │
//!      ▼                    ▼                     ▼                 ▼
//! ┌───────────┐    ┌─────────────────┐    ┌──────────────┐   ┌─────────────┐
//! │    Run    │    │    LogStore     │    │ArtifactCache │   │  EventBus   │
//! │  (state   │    │ put/get/tail of │    │ write-once + │   │ fan-out to  │
//! │  machine) │    │  log chunks     │    │ LRU in front │   │ subscribers │
//! └───────────┘    └─────────────────┘    └──────────────┘   └─────────────┘
//!                           │                     │                 ▲
//!                           ▼                     ▼                 │
//! ┌─────────────────────────────────────────────────────┐           │
//! │         Persistence (PostgreSQL or SQLite)          │   satellites
//! └─────────────────────────────────────────────────────┘   (Singleton)
//! ```
//!
//! # Run Lifecycle
//!
//! | From | Operation | To |
//! |------|-----------|----|
//! | `pending` | enqueue plan | `plan_queued` |
//! | `plan_queued` | start plan | `planning` |
//! | `planning` | finish plan, changes | `planned` (or `apply_queued` with auto-apply) |
//! | `planning` | finish plan, no changes | `planned_and_finished` |
//! | `planned` | apply | `apply_queued` |
//! | `apply_queued` | start apply | `applying` |
//! | `applying` | finish apply | `applied` |
//! | `pending`, `planned` | discard | `discarded` |
//! | any non-final | cancel | `canceled` |
//! | `canceled` after cooldown | force cancel | `force_canceled` |
//! | `planning`, `applying` | phase errored | `errored` |
//!
//! # Logs
//!
//! Log chunks carry a byte offset. Overlapping chunks (retries by an agent)
//! are trimmed so readers see each byte once, and a reader never skips past a
//! gap. [`LogStore::tail`] follows a phase's log live and ends after the
//! terminal chunk.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use runplane_core::{RunOptions, RunService, SqlitePersistence, Subject};
//!
//! let persistence = Arc::new(SqlitePersistence::from_path("runs.db").await?);
//! let service = RunService::builder().persistence(persistence).build()?;
//!
//! let user = Subject::user("alice");
//! let run = service.create(&user, "ws-1", "cv-1", RunOptions::default()).await?;
//! service.enqueue_plan(&user, run.id()).await?;
//! ```

#![deny(missing_docs)]

/// Write-once plan and lock file storage with an in-memory LRU.
pub mod artifacts;

/// Subjects, actions and the authorization seam.
pub mod authz;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types with stable error codes.
pub mod error;

/// In-process event bus.
pub mod events;

/// Log chunk storage, reassembly and tailing.
pub mod logs;

/// Embedded database migrations.
pub mod migrations;

/// Persistence trait and the PostgreSQL and SQLite backends.
pub mod persistence;

/// The run and phase state machine.
pub mod run;

/// The run service façade.
pub mod service;

/// Advisory-lock based leader election for satellites.
pub mod singleton;

pub use artifacts::{ArtifactCache, ArtifactKey, ArtifactKind, PlanFormat};
pub use authz::{Action, AllowAll, Authorizer, Subject, SubjectKind};
pub use config::{Config, ConfigError};
pub use error::{CoreError, Result};
pub use events::{Event, EventBus, Subscription};
pub use logs::{Chunk, GetChunkOptions, LogSegment, LogStore, PersistedChunk};
pub use persistence::{
    ListRunsFilter, Persistence, PostgresPersistence, RunTransaction, SqlitePersistence,
};
pub use run::{
    Phase, PhaseKind, PhaseOutcome, PhaseStatus, ResourceReport, Run, RunOptions, RunStatus,
};
pub use service::{RunService, RunServiceBuilder, WatchOptions};
pub use singleton::{AdvisoryLock, Backoff, LocalLock, PgAdvisoryLock, Singleton};
