// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Leader election for satellite processes.
//!
//! A satellite that must run at most once across a cluster (the VCS status
//! reporter, for example) wraps its subscribe-and-process loop in a
//! [`Singleton`]. The singleton blocks on an [`AdvisoryLock`], runs the task
//! while holding it, releases it when the task returns, and retries the whole
//! cycle with capped exponential backoff until cancelled.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// A held lock. Call [`release`](LockGuard::release) to give it up cleanly.
#[async_trait]
pub trait LockGuard: Send {
    /// Release the lock.
    async fn release(self: Box<Self>) -> Result<()>;
}

/// Cooperative mutual exclusion across processes.
#[async_trait]
pub trait AdvisoryLock: Send + Sync {
    /// Block until the lock is held.
    async fn acquire(&self) -> Result<Box<dyn LockGuard>>;
}

/// In-process lock, for single-node deployments and tests.
#[derive(Debug, Clone, Default)]
pub struct LocalLock {
    inner: Arc<Mutex<()>>,
}

impl LocalLock {
    /// Create an unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }
}

struct LocalGuard(OwnedMutexGuard<()>);

#[async_trait]
impl LockGuard for LocalGuard {
    async fn release(self: Box<Self>) -> Result<()> {
        drop(self.0);
        Ok(())
    }
}

#[async_trait]
impl AdvisoryLock for LocalLock {
    async fn acquire(&self) -> Result<Box<dyn LockGuard>> {
        let guard = self.inner.clone().lock_owned().await;
        Ok(Box::new(LocalGuard(guard)))
    }
}

/// Derive a PostgreSQL advisory-lock key from a lock name.
pub fn lock_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Session-level `pg_advisory_lock`, held on a dedicated pool connection.
#[derive(Debug, Clone)]
pub struct PgAdvisoryLock {
    pool: PgPool,
    name: String,
    key: i64,
}

impl PgAdvisoryLock {
    /// Lock named `name`.
    pub fn new(pool: PgPool, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            key: lock_key(&name),
            pool,
            name,
        }
    }

    /// Numeric key passed to PostgreSQL.
    pub fn key(&self) -> i64 {
        self.key
    }
}

struct PgGuard {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
}

#[async_trait]
impl LockGuard for PgGuard {
    async fn release(mut self: Box<Self>) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(self.key)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}

impl Drop for PgGuard {
    fn drop(&mut self) {
        // never return a connection still holding the lock to the pool;
        // closing the session releases it
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

#[async_trait]
impl AdvisoryLock for PgAdvisoryLock {
    async fn acquire(&self) -> Result<Box<dyn LockGuard>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(self.key)
            .execute(&mut *conn)
            .await?;
        debug!(lock = %self.name, key = self.key, "Acquired advisory lock");

        Ok(Box::new(PgGuard {
            conn: Some(conn),
            key: self.key,
        }))
    }
}

/// Capped exponential backoff: `initial * multiplier^(attempt - 1)`, at most
/// `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
    /// Growth factor per failure.
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Runs a task on at most one node at a time.
pub struct Singleton {
    name: String,
    lock: Arc<dyn AdvisoryLock>,
    backoff: Backoff,
}

impl Singleton {
    /// Create a singleton guarded by `lock`.
    pub fn new(name: impl Into<String>, lock: Arc<dyn AdvisoryLock>) -> Self {
        Self {
            name: name.into(),
            lock,
            backoff: Backoff::default(),
        }
    }

    /// Override the retry backoff.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Elect, run `task`, release, repeat until `token` is cancelled.
    ///
    /// The task receives the token and must return once it is cancelled. A
    /// task error or a lock failure is retried after a backoff delay; a task
    /// returning `Ok` is re-elected immediately.
    pub async fn run<F, Fut>(&self, token: CancellationToken, mut task: F)
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut failures: u32 = 0;

        while !token.is_cancelled() {
            let guard = tokio::select! {
                _ = token.cancelled() => break,
                guard = self.lock.acquire() => guard,
            };

            let failed = match guard {
                Ok(guard) => {
                    info!(singleton = %self.name, "Elected leader");
                    let result = task(token.clone()).await;
                    if let Err(e) = guard.release().await {
                        error!(singleton = %self.name, error = %e, "Failed to release lock");
                    }
                    match result {
                        Ok(()) => false,
                        Err(e) => {
                            warn!(singleton = %self.name, error = %e, "Singleton task failed");
                            true
                        }
                    }
                }
                Err(e) => {
                    warn!(singleton = %self.name, error = %e, "Failed to acquire lock");
                    true
                }
            };

            if !failed {
                failures = 0;
                continue;
            }

            failures = failures.saturating_add(1);
            let delay = self.backoff.delay(failures);
            debug!(singleton = %self.name, ?delay, failures, "Retrying after backoff");
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(singleton = %self.name, "Singleton stopped");
    }
}
