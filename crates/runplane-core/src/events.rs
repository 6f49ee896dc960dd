// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process event bus.
//!
//! Every subscriber owns an unbounded queue. Publishing never blocks: status
//! events are always enqueued, while log notes are dropped for a subscriber
//! that already has `log_buffer` undelivered notes. Drops are counted per
//! subscription so tailers can resync from the log store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::logs::PersistedChunk;
use crate::run::Run;

/// Default number of undelivered log notes kept per subscriber.
pub const DEFAULT_LOG_BUFFER: usize = 256;

/// A typed notification broadcast on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    /// A run was created.
    RunCreated(Run),
    /// A run's status changed.
    RunStatusChanged(Run),
    /// A running phase must be interrupted (`force: false`) or killed.
    CancelRequested {
        /// The run to stop.
        run_id: String,
        /// Kill instead of interrupt.
        force: bool,
    },
    /// A log chunk was persisted.
    LogAppended(PersistedChunk),
    /// Opaque event for satellite consumers.
    Domain {
        /// Consumer-defined event kind.
        kind: String,
        /// Consumer-defined payload.
        payload: serde_json::Value,
    },
}

impl Event {
    /// Stable name of the event type.
    pub fn kind(&self) -> &str {
        match self {
            Event::RunCreated(_) => "run_created",
            Event::RunStatusChanged(_) => "run_status_changed",
            Event::CancelRequested { .. } => "cancel_requested",
            Event::LogAppended(_) => "log_appended",
            Event::Domain { kind, .. } => kind,
        }
    }

    fn is_droppable(&self) -> bool {
        matches!(self, Event::LogAppended(_))
    }
}

struct Slot {
    name: String,
    tx: mpsc::UnboundedSender<Event>,
    pending_logs: Arc<AtomicUsize>,
    dropped: Arc<AtomicU64>,
}

struct Registry {
    slots: RwLock<HashMap<u64, Slot>>,
    next_id: AtomicU64,
    log_buffer: usize,
}

impl Registry {
    fn remove(&self, id: u64) -> Option<Slot> {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }
}

/// Process-wide publish/subscribe backbone. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_BUFFER)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("log_buffer", &self.registry.log_buffer)
            .finish()
    }
}

impl EventBus {
    /// Create a bus keeping at most `log_buffer` undelivered log notes per
    /// subscriber.
    pub fn new(log_buffer: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                slots: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                log_buffer,
            }),
        }
    }

    /// Register a new subscriber. Dropping the returned subscription
    /// unregisters it.
    pub fn subscribe(&self, name: impl Into<String>) -> Subscription {
        let name = name.into();
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let pending_logs = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicU64::new(0));

        self.registry
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Slot {
                    name: name.clone(),
                    tx,
                    pending_logs: pending_logs.clone(),
                    dropped: dropped.clone(),
                },
            );
        debug!(subscriber = %name, id, "Subscribed to event bus");

        Subscription {
            id,
            name,
            rx,
            pending_logs,
            dropped,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Enqueue `event` to every live subscriber without blocking.
    pub fn publish(&self, event: Event) {
        let droppable = event.is_droppable();
        let mut closed = Vec::new();

        {
            let slots = self
                .registry
                .slots
                .read()
                .unwrap_or_else(PoisonError::into_inner);

            for (id, slot) in slots.iter() {
                if droppable {
                    if slot.pending_logs.load(Ordering::Acquire) >= self.registry.log_buffer {
                        slot.dropped.fetch_add(1, Ordering::AcqRel);
                        trace!(subscriber = %slot.name, "Dropped log note for slow subscriber");
                        continue;
                    }
                    slot.pending_logs.fetch_add(1, Ordering::AcqRel);
                }

                if slot.tx.send(event.clone()).is_err() {
                    closed.push(*id);
                }
            }
        }

        for id in closed {
            if let Some(slot) = self.registry.remove(id) {
                debug!(subscriber = %slot.name, id, "Removed closed subscriber");
            }
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.registry
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Receive side of a bus subscription.
pub struct Subscription {
    id: u64,
    name: String,
    rx: mpsc::UnboundedReceiver<Event>,
    pending_logs: Arc<AtomicUsize>,
    dropped: Arc<AtomicU64>,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Subscriber name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        let event = self.rx.recv().await?;
        if event.is_droppable() {
            self.pending_logs.fetch_sub(1, Ordering::AcqRel);
        }
        Some(event)
    }

    /// Number of log notes dropped since the last call, resetting the count.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::AcqRel)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
            debug!(subscriber = %self.name, id = self.id, "Unsubscribed from event bus");
        }
    }
}
