//! Failure event persistence
//!
//! The store hands batches of [`PersistOp`]s to an [`EventSink`] from its
//! background flusher. The JSONL sink appends one op per line so the log can
//! be replayed on start-up.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::{FailureEvent, Severity};
use crate::error::ResilienceResult;

/// File name used under the data directory
pub const FAILURE_EVENTS_FILE: &str = "failure_events.jsonl";

/// A single mutation of the event log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PersistOp {
    Record {
        event: FailureEvent,
    },
    Resolve {
        id: String,
        method: String,
        at: DateTime<Utc>,
    },
    /// Severity raised after the event was recorded
    RaiseSeverity {
        id: String,
        severity: Severity,
    },
}

/// Destination for flushed event-log operations
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn persist(&self, batch: &[PersistOp]) -> ResilienceResult<()>;
}

/// Append-only JSON-lines file sink
pub struct JsonlEventSink {
    path: PathBuf,
}

impl JsonlEventSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Sink writing to `failure_events.jsonl` inside `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(FAILURE_EVENTS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay the log into events in insertion order.
    ///
    /// A missing file yields an empty history. Lines that fail to parse are
    /// skipped with a warning so one torn write does not lose the whole log.
    pub fn load(&self) -> ResilienceResult<Vec<FailureEvent>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events: Vec<FailureEvent> = Vec::new();
        let mut by_id: HashMap<String, usize> = HashMap::new();

        for (line_no, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PersistOp>(&line) {
                Ok(PersistOp::Record { event }) => {
                    by_id.insert(event.id.clone(), events.len());
                    events.push(event);
                }
                Ok(PersistOp::Resolve { id, method, at }) => {
                    if let Some(&idx) = by_id.get(&id) {
                        events[idx].resolve(&method, at);
                    }
                }
                Ok(PersistOp::RaiseSeverity { id, severity }) => {
                    if let Some(&idx) = by_id.get(&id) {
                        let event = &mut events[idx];
                        event.severity = event.severity.max(severity);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Skipping malformed event log line {} in {}: {}",
                        line_no + 1,
                        self.path.display(),
                        e
                    );
                }
            }
        }

        Ok(events)
    }
}

#[async_trait]
impl EventSink for JsonlEventSink {
    async fn persist(&self, batch: &[PersistOp]) -> ResilienceResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(batch.len() * 256);
        for op in batch {
            serde_json::to_writer(&mut buf, op)?;
            buf.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }
}

/// In-memory sink, used when no data directory is configured and in tests
#[derive(Default)]
pub struct MemoryEventSink {
    ops: Mutex<Vec<PersistOp>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<PersistOp> {
        self.ops.lock().clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn persist(&self, batch: &[PersistOp]) -> ResilienceResult<()> {
        self.ops.lock().extend_from_slice(batch);
        Ok(())
    }
}

/// Discards every op. The event log stays queryable in memory only.
#[derive(Debug, Default)]
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn persist(&self, _batch: &[PersistOp]) -> ResilienceResult<()> {
        Ok(())
    }
}
