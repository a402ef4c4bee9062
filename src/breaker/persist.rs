//! Best-effort breaker persistence
//!
//! Breakers push snapshots through a bounded channel with `try_send`; a
//! single writer task owns the file. A full channel drops the snapshot, the
//! next transition of that breaker rewrites it anyway.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use super::BreakerSnapshot;
use crate::error::ResilienceResult;

/// File name used under the data directory
pub const BREAKERS_FILE: &str = "breakers.json";

const CHANNEL_CAPACITY: usize = 256;

/// Sending side handed to every breaker
#[derive(Clone, Debug)]
pub struct BreakerPersistence {
    tx: mpsc::Sender<BreakerSnapshot>,
}

/// Receiving side; run it on the runtime with [`BreakerWriter::run`]
pub struct BreakerWriter {
    path: PathBuf,
    rx: mpsc::Receiver<BreakerSnapshot>,
    snapshots: BTreeMap<String, BreakerSnapshot>,
}

impl BreakerPersistence {
    /// Create the channel pair. `known` seeds the writer so breakers that
    /// never transition in this process are kept in the file.
    pub fn channel(
        path: impl Into<PathBuf>,
        known: BTreeMap<String, BreakerSnapshot>,
    ) -> (Self, BreakerWriter) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self { tx },
            BreakerWriter {
                path: path.into(),
                rx,
                snapshots: known,
            },
        )
    }

    pub fn submit(&self, snapshot: BreakerSnapshot) {
        if let Err(e) = self.tx.try_send(snapshot) {
            tracing::debug!("Dropped breaker snapshot: {}", e);
        }
    }

    /// Read previously persisted snapshots. A missing file is empty.
    pub fn load(path: &Path) -> ResilienceResult<BTreeMap<String, BreakerSnapshot>> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let list: Vec<BreakerSnapshot> = serde_json::from_slice(&bytes)?;
                Ok(list.into_iter().map(|s| (s.name.clone(), s)).collect())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl BreakerWriter {
    pub async fn run(mut self) {
        while let Some(snapshot) = self.rx.recv().await {
            self.snapshots.insert(snapshot.name.clone(), snapshot);
            // Coalesce whatever else is already queued
            while let Ok(more) = self.rx.try_recv() {
                self.snapshots.insert(more.name.clone(), more);
            }
            if let Err(e) = self.write().await {
                tracing::warn!(
                    "Failed to persist breaker state to {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
        tracing::debug!("Breaker persistence writer stopped");
    }

    async fn write(&self) -> ResilienceResult<()> {
        let list: Vec<&BreakerSnapshot> = self.snapshots.values().collect();
        let bytes = serde_json::to_vec_pretty(&list)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
