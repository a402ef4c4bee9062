//! Failure event store
//!
//! Keeps the queryable event log in memory and buffers every mutation into a
//! bounded queue drained by a background flusher, so `record` and
//! `mark_resolved` never wait on I/O. When the queue is full the oldest
//! pending op is dropped and counted.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use super::sink::{EventSink, MemoryEventSink, PersistOp};
use super::{EventFilter, FailureEvent, FailureStats, Severity};
use crate::config::EventStoreSettings;
use crate::error::{ResilienceError, ResilienceResult};

#[derive(Default)]
struct EventLog {
    events: Vec<FailureEvent>,
    by_id: HashMap<String, usize>,
}

struct StoreInner {
    log: RwLock<EventLog>,
    pending: Mutex<VecDeque<PersistOp>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
    tx: broadcast::Sender<FailureEvent>,
    sink: Arc<dyn EventSink>,
    flush_interval: Duration,
}

/// Shared handle to the failure event log. Cheap to clone.
#[derive(Clone)]
pub struct FailureEventStore {
    inner: Arc<StoreInner>,
}

impl FailureEventStore {
    /// Create an empty store flushing to `sink`
    pub fn new(sink: Arc<dyn EventSink>, settings: &EventStoreSettings) -> Self {
        Self::with_history(sink, settings, Vec::new())
    }

    /// Create a store seeded with previously persisted events
    pub fn with_history(
        sink: Arc<dyn EventSink>,
        settings: &EventStoreSettings,
        history: Vec<FailureEvent>,
    ) -> Self {
        let mut log = EventLog::default();
        for event in history {
            log.by_id.insert(event.id.clone(), log.events.len());
            log.events.push(event);
        }
        let (tx, _) = broadcast::channel(settings.broadcast_capacity.max(1));

        Self {
            inner: Arc::new(StoreInner {
                log: RwLock::new(log),
                pending: Mutex::new(VecDeque::with_capacity(settings.queue_capacity)),
                capacity: settings.queue_capacity.max(1),
                dropped: AtomicU64::new(0),
                notify: Notify::new(),
                tx,
                sink,
                flush_interval: Duration::from_millis(settings.flush_interval_ms.max(1)),
            }),
        }
    }

    /// Store backed by an in-memory sink with default settings
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryEventSink::new()),
            &EventStoreSettings::default(),
        )
    }

    /// Append an event and return its id.
    ///
    /// The persistence op and the broadcast are issued under the log lock so
    /// the durable order matches the in-memory order.
    pub fn record(&self, event: FailureEvent) -> String {
        let id = event.id.clone();
        tracing::debug!(
            "Recorded failure event {} [{}/{}] for {}",
            id,
            event.category,
            event.severity,
            event.service_name
        );

        let mut log = self.inner.log.write();
        let idx = log.events.len();
        log.by_id.insert(id.clone(), idx);
        log.events.push(event.clone());
        self.enqueue(PersistOp::Record {
            event: event.clone(),
        });
        // No subscribers is fine
        let _ = self.inner.tx.send(event);
        id
    }

    /// Mark an event resolved. Resolving an already-resolved event is a no-op
    /// that returns the stored record unchanged.
    pub fn mark_resolved(&self, id: &str, method: &str) -> ResilienceResult<FailureEvent> {
        let now = Utc::now();
        let resolved = {
            let mut log = self.inner.log.write();
            let idx = *log
                .by_id
                .get(id)
                .ok_or_else(|| ResilienceError::EventNotFound(id.to_string()))?;
            let event = &mut log.events[idx];
            if event.resolved {
                return Ok(event.clone());
            }
            event.resolve(method, now);
            let resolved = event.clone();
            self.enqueue(PersistOp::Resolve {
                id: id.to_string(),
                method: method.to_string(),
                at: now,
            });
            resolved
        };

        tracing::info!(
            "Failure event {} for {} resolved via {}",
            id,
            resolved.service_name,
            method
        );
        Ok(resolved)
    }

    /// Raise an event's severity to at least `severity`. Never lowers it.
    pub fn raise_severity(&self, id: &str, severity: Severity) -> ResilienceResult<FailureEvent> {
        let mut log = self.inner.log.write();
        let idx = *log
            .by_id
            .get(id)
            .ok_or_else(|| ResilienceError::EventNotFound(id.to_string()))?;
        let event = &mut log.events[idx];
        if event.severity >= severity {
            return Ok(event.clone());
        }
        tracing::info!(
            "Failure event {} for {} raised {} -> {}",
            id,
            event.service_name,
            event.severity,
            severity
        );
        event.severity = severity;
        let raised = event.clone();
        self.enqueue(PersistOp::RaiseSeverity {
            id: id.to_string(),
            severity,
        });
        Ok(raised)
    }

    pub fn get(&self, id: &str) -> Option<FailureEvent> {
        let log = self.inner.log.read();
        log.by_id.get(id).map(|&idx| log.events[idx].clone())
    }

    /// Events matching `filter`, in insertion order
    pub fn query(&self, filter: &EventFilter) -> Vec<FailureEvent> {
        self.inner
            .log
            .read()
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// Most recent events first
    pub fn recent(&self, limit: usize, severity: Option<Severity>) -> Vec<FailureEvent> {
        self.inner
            .log
            .read()
            .events
            .iter()
            .rev()
            .filter(|e| severity.map_or(true, |s| e.severity == s))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Statistics over events that occurred within the trailing `window`
    pub fn stats(&self, window: Duration) -> FailureStats {
        let since = window_start(Utc::now(), window);
        let log = self.inner.log.read();
        FailureStats::from_events(
            window.as_millis() as u64,
            log.events.iter().filter(|e| e.timestamp >= since),
        )
    }

    pub fn len(&self) -> usize {
        self.inner.log.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive every event recorded from now on
    pub fn subscribe(&self) -> broadcast::Receiver<FailureEvent> {
        self.inner.tx.subscribe()
    }

    /// Persistence ops discarded because the queue was full
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    fn enqueue(&self, op: PersistOp) {
        let len = {
            let mut pending = self.inner.pending.lock();
            if pending.len() >= self.inner.capacity {
                pending.pop_front();
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    "Event persistence queue full ({}), dropped oldest op ({} dropped total)",
                    self.inner.capacity,
                    dropped
                );
            }
            pending.push_back(op);
            pending.len()
        };

        if len * 2 >= self.inner.capacity {
            self.inner.notify.notify_one();
        }
    }

    /// Drain the pending queue into the sink. Returns the number of ops written.
    ///
    /// On sink failure the batch goes back to the head of the queue (still
    /// subject to the capacity bound) and the error is returned.
    pub async fn flush(&self) -> ResilienceResult<usize> {
        let batch: Vec<PersistOp> = {
            let mut pending = self.inner.pending.lock();
            pending.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        match self.inner.sink.persist(&batch).await {
            Ok(()) => Ok(batch.len()),
            Err(e) => {
                let mut pending = self.inner.pending.lock();
                for op in batch.into_iter().rev() {
                    pending.push_front(op);
                }
                while pending.len() > self.inner.capacity {
                    pending.pop_front();
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }

    /// Start the background flusher
    pub fn spawn_flusher(&self) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.inner.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = store.inner.notify.notified() => {}
                    _ = ticker.tick() => {}
                }

                if let Err(e) = store.flush().await {
                    tracing::warn!("Failed to flush failure events: {}", e);
                }
            }
        })
    }
}

fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl std::fmt::Debug for FailureEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureEventStore")
            .field("events", &self.len())
            .field("pending", &self.pending_len())
            .field("dropped", &self.dropped_events())
            .finish()
    }
}
