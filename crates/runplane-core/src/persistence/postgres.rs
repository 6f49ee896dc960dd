// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.
//!
//! Status transitions lock the run row with `SELECT ... FOR UPDATE`, so
//! concurrent transitions on one run are serialised while other runs proceed.

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Transaction};

use crate::artifacts::ArtifactKey;
use crate::error::{CoreError, Result};
use crate::logs::{Chunk, PersistedChunk};
use crate::run::{PhaseKind, Run};

use super::{
    ChunkRecord, ListRunsFilter, LogWatermark, Persistence, PhaseRecord,
    PhaseStatusTimestampRecord, RunRecord, RunRows, RunStatusTimestampRecord, RunTransaction,
    assemble_run, encode_addrs, encode_offset, encode_report,
};

const RUN_COLUMNS: &str = "run_id, workspace_id, configuration_version_id, created_at, status, \
     is_destroy, refresh, refresh_only, auto_apply, plan_only, message, target_addrs, \
     replace_addrs, force_cancel_available_at";

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, shared with [`PgAdvisoryLock`](crate::singleton::PgAdvisoryLock).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn load_run(conn: &mut PgConnection, run_id: &str, for_update: bool) -> Result<Option<Run>> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let Some(run) = sqlx::query_as::<_, RunRecord>(&format!(
        "SELECT {} FROM runs WHERE run_id = $1{}",
        RUN_COLUMNS, lock
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
        WHERE run_id = $1
        "#,
    )
    .bind(run_id)
    .fetch_all(&mut *conn)
    .await?;

    let run_timestamps = sqlx::query_as::<_, RunStatusTimestampRecord>(
        r#"
        SELECT seq, status, timestamp
        FROM run_status_timestamps
        WHERE run_id = $1
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
        WHERE run_id = $1
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

async fn insert_status_entries(
    conn: &mut PgConnection,
    run: &Run,
    from: LogWatermark,
) -> Result<()> {
    for (seq, entry) in run.status_log().entries().iter().enumerate().skip(from.run) {
        sqlx::query(
            r#"
            INSERT INTO run_status_timestamps (run_id, seq, status, timestamp)
            VALUES ($1, $2, $3, $4)
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
        let entries = run.phase(kind).status_log().entries();
        for (seq, entry) in entries.iter().enumerate().skip(from.phase(kind)) {
            sqlx::query(
                r#"
                INSERT INTO phase_status_timestamps (run_id, phase, seq, status, timestamp)
                VALUES ($1, $2, $3, $4, $5)
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

async fn write_phases(conn: &mut PgConnection, run: &Run, insert: bool) -> Result<()> {
    let sql = if insert {
        r#"
        INSERT INTO phases (status, additions, changes, destructions, run_id, phase)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#
    } else {
        r#"
        UPDATE phases
        SET status = $1, additions = $2, changes = $3, destructions = $4
        WHERE run_id = $5 AND phase = $6
        "#
    };

    for kind in PhaseKind::ALL {
        let phase = run.phase(kind);
        let (additions, changes, destructions) = encode_report(phase);
        sqlx::query(sql)
            .bind(phase.status().as_str())
            .bind(additions)
            .bind(changes)
            .bind(destructions)
            .bind(run.id())
            .bind(kind.as_str())
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}

/// A run whose row is locked by an open PostgreSQL transaction.
struct PgRunTransaction {
    tx: Transaction<'static, Postgres>,
    run: Run,
    loaded: LogWatermark,
}

#[async_trait]
impl RunTransaction for PgRunTransaction {
    fn run(&self) -> &Run {
        &self.run
    }

    fn run_mut(&mut self) -> &mut Run {
        &mut self.run
    }

    async fn commit(self: Box<Self>) -> Result<Run> {
        let PgRunTransaction {
            mut tx,
            run,
            loaded,
        } = *self;

        sqlx::query(
            r#"
            UPDATE runs
            SET status = $1, force_cancel_available_at = $2
            WHERE run_id = $3
            "#,
        )
        .bind(run.status().as_str())
        .bind(run.force_cancel_available_at())
        .bind(run.id())
        .execute(&mut *tx)
        .await?;

        write_phases(&mut tx, &run, false).await?;
        insert_status_entries(&mut tx, &run, loaded).await?;
        tx.commit().await?;

        Ok(run)
    }
}

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn insert_run(&self, run: &Run) -> Result<()> {
        let options = run.options();
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO runs ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
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

        write_phases(&mut tx, run, true).await?;
        insert_status_entries(&mut tx, run, LogWatermark::empty()).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let mut conn = self.pool.acquire().await?;
        load_run(&mut conn, run_id, false).await
    }

    async fn list_runs(&self, filter: &ListRunsFilter) -> Result<Vec<Run>> {
        let mut query = QueryBuilder::<Postgres>::new("SELECT run_id FROM runs WHERE TRUE");
        if let Some(workspace_id) = &filter.workspace_id {
            query.push(" AND workspace_id = ").push_bind(workspace_id);
        }
        if !filter.statuses.is_empty() {
            let statuses: Vec<&str> = filter.statuses.iter().map(|s| s.as_str()).collect();
            query.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        query.push(" ORDER BY created_at DESC, run_id DESC");
        query.push(" LIMIT ").push_bind(filter.limit);
        query.push(" OFFSET ").push_bind(filter.offset.unwrap_or(0));

        let mut conn = self.pool.acquire().await?;
        let run_ids = query
            .build_query_scalar::<String>()
            .fetch_all(&mut *conn)
            .await?;

        let mut runs = Vec::with_capacity(run_ids.len());
        for run_id in run_ids {
            if let Some(run) = load_run(&mut conn, &run_id, false).await? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    async fn lock_run(&self, run_id: &str) -> Result<Box<dyn RunTransaction>> {
        let mut tx = self.pool.begin().await?;
        let run = load_run(&mut tx, run_id, true)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })?;

        Ok(Box::new(PgRunTransaction {
            tx,
            loaded: LogWatermark::of(&run),
            run,
        }))
    }

    async fn insert_chunk(&self, chunk: &Chunk, terminal: bool) -> Result<PersistedChunk> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO chunks (run_id, phase, chunk_offset, data, terminal)
            VALUES ($1, $2, $3, $4, $5)
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
            WHERE run_id = $1 AND phase = $2
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
            VALUES ($1, $2, $3, $4)
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
            WHERE run_id = $1 AND kind = $2 AND format = $3
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
        let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }
}
