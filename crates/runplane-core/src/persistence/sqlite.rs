// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction};

use crate::artifacts::ArtifactKey;
use crate::error::{CoreError, Result};
use crate::logs::{Chunk, PersistedChunk};
use crate::migrations;
use crate::run::{PhaseKind, Run};

use super::{
    ChunkRecord, ListRunsFilter, LogWatermark, Persistence, PhaseRecord,
    PhaseStatusTimestampRecord, RunRecord, RunRows, RunStatusTimestampRecord, RunTransaction,
    assemble_run, encode_addrs, encode_offset, encode_report,
};

const RUN_COLUMNS: &str = "run_id, workspace_id, configuration_version_id, created_at, status, \
     is_destroy, refresh, refresh_only, auto_apply, plan_only, message, target_addrs, \
     replace_addrs, force_cancel_available_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/runplane.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::database(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| {
                CoreError::database(
                    "connect",
                    format!("Failed to connect to SQLite at {:?}: {}", path, e),
                )
            })?;

        migrations::run_sqlite(&pool).await.map_err(|e| {
            CoreError::database("migrate", format!("Failed to run migrations: {}", e))
        })?;

        Ok(Self { pool })
    }
}

async fn load_run(conn: &mut SqliteConnection, run_id: &str) -> Result<Option<Run>> {
    let Some(run) = sqlx::query_as::<_, RunRecord>(&format!(
        "SELECT {} FROM runs WHERE run_id = ?",
        RUN_COLUMNS
    ))
    .bind(run_id)
    .fetch_optional(&mut *conn)
    .await?
    else {
        return Ok(None);
    };

    let phases = sqlx::query_as::<_, PhaseRecord>(
        r#"
        SELECT run_id, phase, status, additions, changes, destructions
        FROM phases
        WHERE run_id = ?
        "#,
    )
    .bind(run_id)
    .fetch_all(&mut *conn)
    .await?;

    let run_timestamps = sqlx::query_as::<_, RunStatusTimestampRecord>(
        r#"
        SELECT seq, status, timestamp
        FROM run_status_timestamps
        WHERE run_id = ?
        ORDER BY seq
        "#,
    )
    .bind(run_id)
    .fetch_all(&mut *conn)
    .await?;

    let phase_timestamps = sqlx::query_as::<_, PhaseStatusTimestampRecord>(
        r#"
        SELECT phase, seq, status, timestamp
        FROM phase_status_timestamps
        WHERE run_id = ?
        ORDER BY phase, seq
        "#,
    )
    .bind(run_id)
    .fetch_all(&mut *conn)
    .await?;

    assemble_run(RunRows {
        run,
        phases,
        run_timestamps,
        phase_timestamps,
    })
    .map(Some)
}

/// Insert every status-log entry past `from`.
async fn insert_status_entries(
    conn: &mut SqliteConnection,
    run: &Run,
    from: LogWatermark,
) -> Result<()> {
    for (seq, entry) in run.status_log().entries().iter().enumerate().skip(from.run) {
        sqlx::query(
            r#"
            INSERT INTO run_status_timestamps (run_id, seq, status, timestamp)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(run.id())
        .bind(seq as i64)
        .bind(entry.status.as_str())
        .bind(entry.timestamp)
        .execute(&mut *conn)
        .await?;
    }

    for kind in PhaseKind::ALL {
        let phase = run.phase(kind);
        for (seq, entry) in phase
            .status_log()
            .entries()
            .iter()
            .enumerate()
            .skip(from.phase(kind))
        {
            sqlx::query(
                r#"
                INSERT INTO phase_status_timestamps (run_id, phase, seq, status, timestamp)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(run.id())
            .bind(kind.as_str())
            .bind(seq as i64)
            .bind(entry.status.as_str())
            .bind(entry.timestamp)
            .execute(&mut *conn)
            .await?;
        }
    }

    Ok(())
}

/// A run locked by an open SQLite write transaction.
struct SqliteRunTransaction {
    tx: Transaction<'static, Sqlite>,
    run: Run,
    loaded: LogWatermark,
}

#[async_trait]
impl RunTransaction for SqliteRunTransaction {
    fn run(&self) -> &Run {
        &self.run
    }

    fn run_mut(&mut self) -> &mut Run {
        &mut self.run
    }

    async fn commit(self: Box<Self>) -> Result<Run> {
        let SqliteRunTransaction {
            mut tx,
            run,
            loaded,
        } = *self;

        sqlx::query(
            r#"
            UPDATE runs
            SET status = ?, force_cancel_available_at = ?
            WHERE run_id = ?
            "#,
        )
        .bind(run.status().as_str())
        .bind(run.force_cancel_available_at())
        .bind(run.id())
        .execute(&mut *tx)
        .await?;

        for kind in PhaseKind::ALL {
            let phase = run.phase(kind);
            let (additions, changes, destructions) = encode_report(phase);
            sqlx::query(
                r#"
                UPDATE phases
                SET status = ?, additions = ?, changes = ?, destructions = ?
                WHERE run_id = ? AND phase = ?
                "#,
            )
            .bind(phase.status().as_str())
            .bind(additions)
            .bind(changes)
            .bind(destructions)
            .bind(run.id())
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await?;
        }

        insert_status_entries(&mut tx, &run, loaded).await?;
        tx.commit().await?;

        Ok(run)
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_run(&self, run: &Run) -> Result<()> {
        let options = run.options();
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO runs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            RUN_COLUMNS
        ))
        .bind(run.id())
        .bind(run.workspace_id())
        .bind(run.configuration_version_id())
        .bind(run.created_at())
        .bind(run.status().as_str())
        .bind(options.is_destroy)
        .bind(options.refresh)
        .bind(options.refresh_only)
        .bind(options.auto_apply)
        .bind(options.plan_only)
        .bind(options.message.as_deref())
        .bind(encode_addrs(&options.target_addrs)?)
        .bind(encode_addrs(&options.replace_addrs)?)
        .bind(run.force_cancel_available_at())
        .execute(&mut *tx)
        .await?;

        for kind in PhaseKind::ALL {
            let phase = run.phase(kind);
            let (additions, changes, destructions) = encode_report(phase);
            sqlx::query(
                r#"
                INSERT INTO phases (run_id, phase, status, additions, changes, destructions)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(run.id())
            .bind(kind.as_str())
            .bind(phase.status().as_str())
            .bind(additions)
            .bind(changes)
            .bind(destructions)
            .execute(&mut *tx)
            .await?;
        }

        insert_status_entries(&mut tx, run, LogWatermark::empty()).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let mut conn = self.pool.acquire().await?;
        load_run(&mut conn, run_id).await
    }

    async fn list_runs(&self, filter: &ListRunsFilter) -> Result<Vec<Run>> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT run_id FROM runs WHERE 1 = 1");
        if let Some(workspace_id) = &filter.workspace_id {
            query.push(" AND workspace_id = ").push_bind(workspace_id);
        }
        if !filter.statuses.is_empty() {
            query.push(" AND status IN (");
            let mut separated = query.separated(", ");
            for status in &filter.statuses {
                separated.push_bind(status.as_str());
            }
            separated.push_unseparated(")");
        }
        query.push(" ORDER BY created_at DESC, run_id DESC");
        query
            .push(" LIMIT ")
            .push_bind(filter.limit.unwrap_or(-1));
        query
            .push(" OFFSET ")
            .push_bind(filter.offset.unwrap_or(0));

        let mut conn = self.pool.acquire().await?;
        let run_ids = query
            .build_query_scalar::<String>()
            .fetch_all(&mut *conn)
            .await?;

        let mut runs = Vec::with_capacity(run_ids.len());
        for run_id in run_ids {
            if let Some(run) = load_run(&mut conn, &run_id).await? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    async fn lock_run(&self, run_id: &str) -> Result<Box<dyn RunTransaction>> {
        let mut tx = self.pool.begin().await?;

        // SQLite has no row locks: a no-op write takes the database write lock
        let locked = sqlx::query("UPDATE runs SET status = status WHERE run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if locked == 0 {
            return Err(CoreError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }

        let run = load_run(&mut tx, run_id)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })?;

        Ok(Box::new(SqliteRunTransaction {
            tx,
            loaded: LogWatermark::of(&run),
            run,
        }))
    }

    async fn insert_chunk(&self, chunk: &Chunk, terminal: bool) -> Result<PersistedChunk> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO chunks (run_id, phase, chunk_offset, data, terminal)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&chunk.run_id)
        .bind(chunk.phase.as_str())
        .bind(encode_offset(chunk.offset)?)
        .bind(&chunk.data[..])
        .bind(terminal)
        .fetch_one(&self.pool)
        .await?;

        Ok(PersistedChunk {
            id,
            chunk: chunk.clone(),
            terminal,
        })
    }

    async fn list_chunks(&self, run_id: &str, phase: PhaseKind) -> Result<Vec<PersistedChunk>> {
        let records = sqlx::query_as::<_, ChunkRecord>(
            r#"
            SELECT id, run_id, phase, chunk_offset, data, terminal
            FROM chunks
            WHERE run_id = ? AND phase = ?
            ORDER BY chunk_offset, id
            "#,
        )
        .bind(run_id)
        .bind(phase.as_str())
        .fetch_all(&self.pool)
        .await?;

        records.into_iter().map(PersistedChunk::try_from).collect()
    }

    async fn put_artifact(&self, key: &ArtifactKey, data: &[u8]) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO artifacts (run_id, kind, format, data)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (run_id, kind, format) DO NOTHING
            "#,
        )
        .bind(key.run_id())
        .bind(key.kind().as_str())
        .bind(key.format_str())
        .bind(data)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn get_artifact(&self, key: &ArtifactKey) -> Result<Option<Bytes>> {
        let data: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT data FROM artifacts
            WHERE run_id = ? AND kind = ? AND format = ?
            "#,
        )
        .bind(key.run_id())
        .bind(key.kind().as_str())
        .bind(key.format_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(data.map(Bytes::from))
    }

    async fn health_check_db(&self) -> Result<bool> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }
}
