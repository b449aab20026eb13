//! Revisioned document history: optimistic concurrency plus linear undo/redo.
//!
//! Architecture:
//! ```text
//! mutate / undo / redo ──► gate (one Mutex for the whole store)
//!                              │
//!                              ├── HistoryRecord (clone, edit)
//!                              └── commit task (owns the gate guard)
//!                                    ├── DocumentStore.set  (data.json)
//!                                    ├── HistoryFile.save   (page_history.json)
//!                                    ├── install record     (record table)
//!                                    └── EventBus.publish   (snapshot fan-out)
//!
//! read / history_info ──► record table (no gate)
//! ```
//!
//! The revision is the concurrency token. A write carrying a stale base
//! revision is rejected with [`HistoryError::Conflict`]; the caller re-reads
//! and retries. Undo and redo move the same counter.
//!
//! A change is installed in memory only after both files are written, so a
//! failed write leaves the visible state and revision untouched. The commit
//! runs on its own task and finishes even if the caller stops waiting.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use labsync_core::{HistoryInfo, HistoryRecord, Snapshot, DEFAULT_MAX_HISTORY};

use crate::broadcast::EventBus;
use crate::storage::{DocumentStore, HistoryFile, StoreError};

/// History engine errors.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// The base revision is stale. Re-read and retry.
    #[error("revision conflict: current revision is {current_revision}")]
    Conflict { current_revision: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The commit task was torn down, e.g. by runtime shutdown.
    #[error("commit interrupted: {0}")]
    Interrupted(String),
}

/// Current records, plus the ids whose record only exists because of a read.
#[derive(Default)]
struct RecordTable {
    records: HashMap<String, HistoryRecord>,
    /// Re-derivable from the document store, so never written to disk.
    lazy: HashSet<String>,
}

impl RecordTable {
    /// Every record worth persisting, with `record` installed under `id`.
    fn persistable_with(&self, id: &str, record: &HistoryRecord) -> HashMap<String, HistoryRecord> {
        let mut out: HashMap<String, HistoryRecord> = self
            .records
            .iter()
            .filter(|(key, _)| !self.lazy.contains(*key))
            .map(|(key, r)| (key.clone(), r.clone()))
            .collect();
        out.insert(id.to_string(), record.clone());
        out
    }
}

/// Everything a commit task needs.
struct Shared {
    store: Arc<DocumentStore>,
    file: HistoryFile,
    events: Arc<EventBus>,
    table: RwLock<RecordTable>,
}

impl Shared {
    /// Persist, install and publish an edited record.
    async fn apply(&self, id: &str, record: HistoryRecord) -> Result<Snapshot, HistoryError> {
        let snapshot = record.snapshot();
        self.store.set(id, snapshot.state.clone()).await?;

        let to_save = self.table.read().await.persistable_with(id, &record);
        self.file.save(&to_save).await?;

        {
            let mut table = self.table.write().await;
            table.lazy.remove(id);
            table.records.insert(id.to_string(), record);
        }
        self.events.publish(id, snapshot.clone());
        Ok(snapshot)
    }
}

/// Owns every document's [`HistoryRecord`].
pub struct HistoryEngine {
    shared: Arc<Shared>,
    /// Global serialization point for every mutating operation.
    gate: Arc<Mutex<()>>,
    max_history: usize,
}

impl HistoryEngine {
    /// Load persisted history and wrap `store`.
    pub async fn open(
        store: Arc<DocumentStore>,
        file: HistoryFile,
        events: Arc<EventBus>,
        max_history: usize,
    ) -> Self {
        let records = file.load().await;
        log::info!("History loaded for {} documents", records.len());
        Self::assemble(store, file, events, records, max_history)
    }

    /// Engine with no persistence and a private event bus.
    pub fn in_memory() -> Self {
        Self::assemble(
            Arc::new(DocumentStore::in_memory()),
            HistoryFile::in_memory(),
            Arc::new(EventBus::new(256)),
            HashMap::new(),
            DEFAULT_MAX_HISTORY,
        )
    }

    fn assemble(
        store: Arc<DocumentStore>,
        file: HistoryFile,
        events: Arc<EventBus>,
        records: HashMap<String, HistoryRecord>,
        max_history: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                file,
                events,
                table: RwLock::new(RecordTable {
                    records,
                    lazy: HashSet::new(),
                }),
            }),
            gate: Arc::new(Mutex::new(())),
            max_history,
        }
    }

    /// Override the undo depth.
    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    /// Snapshot at the cursor. Creates the record on first access.
    pub async fn read(&self, id: &str) -> Snapshot {
        self.record(id).await.snapshot()
    }

    pub async fn history_info(&self, id: &str) -> HistoryInfo {
        self.record(id).await.info()
    }

    /// Replace the document with `next_state` if `base_revision` is current.
    ///
    /// A structurally identical `next_state` is a no-op returning the
    /// unchanged snapshot. Otherwise the redo branch is dropped, the
    /// revision increments, and the snapshot is persisted and published.
    pub async fn mutate(
        &self,
        id: &str,
        base_revision: u64,
        next_state: Value,
    ) -> Result<Snapshot, HistoryError> {
        let gate = self.gate.clone().lock_owned().await;
        let mut record = self.record(id).await;

        if base_revision != record.revision {
            log::debug!(
                "Rejected mutate on doc {id}: base {base_revision}, current {}",
                record.revision
            );
            return Err(HistoryError::Conflict {
                current_revision: record.revision,
            });
        }
        if !record.push(next_state, self.max_history) {
            return Ok(record.snapshot());
        }

        let snapshot = self.commit(gate, id, record).await?;
        log::debug!("Doc {id} mutated to revision {}", snapshot.revision);
        Ok(snapshot)
    }

    /// Step back one entry. At the baseline, returns the snapshot unchanged.
    pub async fn undo(&self, id: &str) -> Result<Snapshot, HistoryError> {
        let gate = self.gate.clone().lock_owned().await;
        let mut record = self.record(id).await;
        if !record.step_back() {
            return Ok(record.snapshot());
        }
        let snapshot = self.commit(gate, id, record).await?;
        log::info!("Doc {id} undone to revision {}", snapshot.revision);
        Ok(snapshot)
    }

    /// Step forward one entry. At the head, returns the snapshot unchanged.
    pub async fn redo(&self, id: &str) -> Result<Snapshot, HistoryError> {
        let gate = self.gate.clone().lock_owned().await;
        let mut record = self.record(id).await;
        if !record.step_forward() {
            return Ok(record.snapshot());
        }
        let snapshot = self.commit(gate, id, record).await?;
        log::info!("Doc {id} redone to revision {}", snapshot.revision);
        Ok(snapshot)
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.shared.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.shared.events
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Copy of the record for `id`, lazily created from the persisted
    /// document at revision 0.
    async fn record(&self, id: &str) -> HistoryRecord {
        if let Some(record) = self.shared.table.read().await.records.get(id) {
            return record.clone();
        }
        let baseline = self.shared.store.get(id).await.unwrap_or(Value::Null);
        let mut table = self.shared.table.write().await;
        let table = &mut *table;
        match table.records.entry(id.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                table.lazy.insert(id.to_string());
                entry.insert(HistoryRecord::baseline(baseline)).clone()
            }
        }
    }

    /// Hand the edited record and the gate to a commit task and wait for it.
    ///
    /// Dropping the returned future does not cancel the commit: the gate is
    /// released only once the record is fully applied or rejected.
    async fn commit(
        &self,
        gate: OwnedMutexGuard<()>,
        id: &str,
        record: HistoryRecord,
    ) -> Result<Snapshot, HistoryError> {
        let shared = self.shared.clone();
        let id = id.to_string();
        let task = tokio::spawn(async move {
            let _gate = gate;
            shared.apply(&id, record).await
        });
        task.await
            .map_err(|e| HistoryError::Interrupted(e.to_string()))?
    }
}
