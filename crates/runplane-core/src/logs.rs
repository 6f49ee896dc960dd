// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Phase log chunks: durable writes, materialised reads and live tailing.
//!
//! A phase's log is an append-only byte stream. Each write is a chunk whose
//! offset is the number of bytes the writer had already sent. A writer that
//! retries a partially failed append may resend bytes, so chunks can overlap;
//! reads and tails always trim the overlap away and deliver each byte once.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::persistence::Persistence;
use crate::run::PhaseKind;

/// An immutable byte range of a phase's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Owning run.
    pub run_id: String,
    /// Owning phase.
    pub phase: PhaseKind,
    /// Bytes written for this (run, phase) before this chunk.
    pub offset: u64,
    /// Payload.
    pub data: Bytes,
}

impl Chunk {
    /// Build a chunk.
    pub fn new(run_id: impl Into<String>, phase: PhaseKind, offset: u64, data: Bytes) -> Self {
        Self {
            run_id: run_id.into(),
            phase,
            offset,
            data,
        }
    }

    /// An empty chunk at `offset`.
    pub fn empty(run_id: impl Into<String>, phase: PhaseKind, offset: u64) -> Self {
        Self::new(run_id, phase, offset, Bytes::new())
    }

    /// Offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    /// True if the chunk carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The part of this chunk at or after `cursor`.
    ///
    /// Returns `None` when the chunk lies wholly before `cursor`, and the chunk
    /// unchanged when it starts at or after it.
    pub fn cut(&self, cursor: u64) -> Option<Chunk> {
        if self.offset >= cursor {
            return Some(self.clone());
        }
        if self.end() <= cursor {
            return None;
        }
        let skip = (cursor - self.offset) as usize;
        Some(Chunk {
            run_id: self.run_id.clone(),
            phase: self.phase,
            offset: cursor,
            data: self.data.slice(skip..),
        })
    }

    fn belongs_to(&self, run_id: &str, phase: PhaseKind) -> bool {
        self.run_id == run_id && self.phase == phase
    }
}

/// A chunk as stored: the row ID plus whether it closed the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedChunk {
    /// Store-assigned row ID.
    pub id: i64,
    /// The chunk.
    #[serde(flatten)]
    pub chunk: Chunk,
    /// Written after the phase finished: end of stream.
    pub terminal: bool,
}

/// A contiguous slice of a phase's log, as returned by reads and tails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSegment {
    /// The bytes.
    pub chunk: Chunk,
    /// No bytes follow this segment.
    pub terminal: bool,
}

/// Parameters of a chunk read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetChunkOptions {
    /// Run to read.
    pub run_id: String,
    /// Phase to read.
    pub phase: PhaseKind,
    /// First byte to return.
    pub offset: u64,
    /// Maximum number of bytes to return; unlimited when `None`.
    pub limit: Option<usize>,
}

impl GetChunkOptions {
    /// Read everything from `offset`.
    pub fn from_offset(run_id: impl Into<String>, phase: PhaseKind, offset: u64) -> Self {
        Self {
            run_id: run_id.into(),
            phase,
            offset,
            limit: None,
        }
    }
}

/// Fold stored chunks, ordered by offset then row ID, into one gap-free
/// stream starting at byte 0. Stops at the first gap.
fn materialize(chunks: &[PersistedChunk]) -> (Bytes, bool) {
    let mut stream = BytesMut::new();
    let mut terminal = false;

    for persisted in chunks {
        let len = stream.len() as u64;
        if persisted.chunk.offset > len {
            break;
        }
        if let Some(suffix) = persisted.chunk.cut(len) {
            stream.extend_from_slice(&suffix.data);
        }
        terminal |= persisted.terminal;
    }

    (stream.freeze(), terminal)
}

/// Durable, tail-able log store for phase output.
///
/// Performs no authorization: callers reach it either through the
/// [`RunService`](crate::service::RunService) or through a signed URL.
#[derive(Clone)]
pub struct LogStore {
    persistence: Arc<dyn Persistence>,
    bus: EventBus,
}

impl LogStore {
    /// Create a store writing through `persistence` and announcing on `bus`.
    pub fn new(persistence: Arc<dyn Persistence>, bus: EventBus) -> Self {
        Self { persistence, bus }
    }

    /// Persist a chunk and publish it.
    #[instrument(skip(self, chunk), fields(run_id = %chunk.run_id, phase = %chunk.phase, offset = chunk.offset, len = chunk.data.len()))]
    pub async fn put_chunk(&self, chunk: Chunk, terminal: bool) -> Result<PersistedChunk> {
        let persisted = self.persistence.insert_chunk(&chunk, terminal).await?;
        debug!(id = persisted.id, terminal, "Persisted log chunk");
        self.bus.publish(Event::LogAppended(persisted.clone()));
        Ok(persisted)
    }

    /// Read the log from `offset`.
    ///
    /// A phase without output, or an offset past the end, yields an empty
    /// segment rather than an error. Past the end of a finished log that
    /// segment is terminal.
    pub async fn get_chunk(&self, opts: GetChunkOptions) -> Result<LogSegment> {
        let chunks = self
            .persistence
            .list_chunks(&opts.run_id, opts.phase)
            .await?;
        let (stream, stream_terminal) = materialize(&chunks);

        let len = stream.len() as u64;
        if opts.offset >= len {
            return Ok(LogSegment {
                chunk: Chunk::empty(opts.run_id, opts.phase, opts.offset),
                terminal: stream_terminal,
            });
        }

        let start = opts.offset as usize;
        let end = match opts.limit {
            Some(limit) => start.saturating_add(limit).min(stream.len()),
            None => stream.len(),
        };

        Ok(LogSegment {
            chunk: Chunk::new(opts.run_id, opts.phase, opts.offset, stream.slice(start..end)),
            terminal: stream_terminal && end == stream.len(),
        })
    }

    /// Stream the log from `offset`, following new writes until the terminal
    /// chunk is delivered or `token` is cancelled.
    ///
    /// Every byte is delivered exactly once, even when writers resend
    /// overlapping chunks or log notes are dropped by the bus.
    pub fn tail(
        &self,
        run_id: &str,
        phase: PhaseKind,
        offset: u64,
        token: CancellationToken,
    ) -> BoxStream<'static, Result<LogSegment>> {
        // subscribe before the first read so no write falls between the two
        let mut sub = self
            .bus
            .subscribe(format!("tail:{}:{}", run_id, phase.as_str()));
        let store = self.clone();
        let run_id = run_id.to_string();

        Box::pin(async_stream::try_stream! {
            let mut cursor = offset;
            // furthest end of any chunk announced so far
            let mut horizon = offset;
            let mut resync = true;

            loop {
                if resync {
                    resync = false;
                    let segment = store
                        .get_chunk(GetChunkOptions::from_offset(run_id.clone(), phase, cursor))
                        .await?;
                    let terminal = segment.terminal;
                    if !segment.chunk.is_empty() || terminal {
                        cursor = segment.chunk.end();
                        yield segment;
                    }
                    if terminal {
                        break;
                    }
                }

                let event = tokio::select! {
                    _ = token.cancelled() => None,
                    event = sub.recv() => event,
                };
                let Some(event) = event else {
                    break;
                };

                if sub.take_dropped() > 0 {
                    debug!(run_id = %run_id, phase = %phase, cursor, "Tail lagged, re-reading log");
                    resync = true;
                    continue;
                }

                let Event::LogAppended(persisted) = event else {
                    continue;
                };
                if !persisted.chunk.belongs_to(&run_id, phase) {
                    continue;
                }
                horizon = horizon.max(persisted.chunk.end());
                // a gap before this chunk, or bytes announced earlier past it,
                // are only reassembled correctly by the store
                if persisted.chunk.offset > cursor || horizon > persisted.chunk.end().max(cursor) {
                    resync = true;
                    continue;
                }

                match persisted.chunk.cut(cursor) {
                    Some(suffix) if !suffix.is_empty() => {
                        cursor = suffix.end();
                        yield LogSegment {
                            chunk: suffix,
                            terminal: persisted.terminal,
                        };
                    }
                    _ if persisted.terminal => {
                        yield LogSegment {
                            chunk: Chunk::empty(run_id.clone(), phase, cursor),
                            terminal: true,
                        };
                    }
                    _ => continue,
                }

                if persisted.terminal {
                    break;
                }
            }
        })
    }
}
