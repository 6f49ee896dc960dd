// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plan and lock file artifacts.
//!
//! Reads are cache-aside, writes are write-through. The cache is a bounded
//! LRU in front of the durable artifact table; every artifact is write-once
//! per key, so cached entries never go stale.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{CoreError, Result};
use crate::persistence::Persistence;

/// Default number of artifacts kept in memory.
pub const DEFAULT_CACHE_CAPACITY: usize = 512;

/// Which per-run artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// The plan file produced by the plan phase.
    PlanFile,
    /// The dependency lock file.
    LockFile,
}

impl ArtifactKind {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::PlanFile => "plan_file",
            ArtifactKind::LockFile => "lock_file",
        }
    }
}

/// Rendering of a plan file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanFormat {
    /// The provisioning tool's binary plan.
    Binary,
    /// Its JSON rendering.
    Json,
}

impl PlanFormat {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanFormat::Binary => "binary",
            PlanFormat::Json => "json",
        }
    }
}

impl FromStr for PlanFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "binary" => Ok(PlanFormat::Binary),
            "json" => Ok(PlanFormat::Json),
            other => Err(CoreError::Validation {
                field: "format".to_string(),
                message: format!("unknown plan format '{}'", other),
            }),
        }
    }
}

/// Identifies one artifact: (run, kind, format).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    run_id: String,
    kind: ArtifactKind,
    format: Option<PlanFormat>,
}

impl ArtifactKey {
    /// Key of a run's plan file in `format`.
    pub fn plan_file(run_id: impl Into<String>, format: PlanFormat) -> Self {
        Self {
            run_id: run_id.into(),
            kind: ArtifactKind::PlanFile,
            format: Some(format),
        }
    }

    /// Key of a run's lock file.
    pub fn lock_file(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            kind: ArtifactKind::LockFile,
            format: None,
        }
    }

    /// Owning run.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Artifact kind.
    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    /// Storage form of the format column; lock files have none.
    pub fn format_str(&self) -> &'static str {
        self.format.map(|f| f.as_str()).unwrap_or("none")
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.format) {
            (ArtifactKind::PlanFile, Some(format)) => write!(f, "plan file ({})", format.as_str()),
            (ArtifactKind::PlanFile, None) => f.write_str("plan file"),
            (ArtifactKind::LockFile, _) => f.write_str("lock file"),
        }
    }
}

/// Least-recently-used map with a fixed capacity. A zero capacity stores
/// nothing.
#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    entries: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Clone + Eq + Hash, V: Clone> LruCache<K, V> {
    /// Create an empty cache.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.clone());
    }

    /// Look up `key`, marking it most recently used.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let value = self.entries.get(key).cloned()?;
        self.touch(key);
        Some(value)
    }

    /// Insert or replace `key`, evicting the least recently used entry when
    /// full.
    pub fn put(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(&key)
            && self.entries.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.entries.remove(&oldest);
        }
        self.touch(&key);
        self.entries.insert(key, value);
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache-aside/write-through store for plan and lock files.
pub struct ArtifactCache {
    persistence: Arc<dyn Persistence>,
    cache: Mutex<LruCache<ArtifactKey, Bytes>>,
}

impl ArtifactCache {
    /// Create a cache holding at most `capacity` artifacts in memory.
    pub fn new(persistence: Arc<dyn Persistence>, capacity: usize) -> Self {
        Self {
            persistence,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn cached(&self, key: &ArtifactKey) -> Option<Bytes> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
    }

    fn populate(&self, key: &ArtifactKey, data: Bytes) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(key.clone(), data);
    }

    /// Fetch an artifact, falling back to the durable store on a cache miss.
    #[instrument(skip(self), fields(run_id = %key.run_id(), artifact = %key))]
    pub async fn get(&self, key: &ArtifactKey) -> Result<Bytes> {
        if let Some(data) = self.cached(key) {
            return Ok(data);
        }

        let data = self
            .persistence
            .get_artifact(key)
            .await?
            .ok_or_else(|| CoreError::ArtifactNotFound {
                run_id: key.run_id().to_string(),
                artifact: key.to_string(),
            })?;
        debug!(len = data.len(), "Artifact cache miss, loaded from store");

        self.populate(key, data.clone());
        Ok(data)
    }

    /// Persist an artifact, then cache it.
    ///
    /// Uploading the same bytes again succeeds; different bytes for an
    /// existing key fail with [`CoreError::ArtifactAlreadyExists`].
    #[instrument(skip(self, data), fields(run_id = %key.run_id(), artifact = %key, len = data.len()))]
    pub async fn set(&self, key: &ArtifactKey, data: Bytes) -> Result<()> {
        let inserted = self.persistence.put_artifact(key, &data).await?;
        if !inserted {
            let existing = self.persistence.get_artifact(key).await?;
            if existing.as_deref() != Some(&data[..]) {
                return Err(CoreError::ArtifactAlreadyExists {
                    run_id: key.run_id().to_string(),
                    artifact: key.to_string(),
                });
            }
            debug!("Artifact re-uploaded with identical content");
        }

        self.populate(key, data);
        Ok(())
    }

    /// Empty the in-memory layer. Durable data is untouched.
    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of artifacts currently held in memory.
    pub fn cached_len(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
