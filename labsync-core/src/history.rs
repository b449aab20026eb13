//! Linear undo/redo history for one document.
//!
//! ```text
//!  stack:  [ s0 | s1 | s2 | s3 ]      cap = max_history + 1
//!                      ▲
//!                    cursor           redo branch = entries after cursor
//! ```
//!
//! The record only does arithmetic. Locking, persistence and publishing
//! happen in the engine that owns it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{now_millis, structurally_equal, Snapshot};

/// Default number of undoable steps.
pub const DEFAULT_MAX_HISTORY: usize = 50;

/// Per-document revision, cursor and snapshot stack.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    #[serde(alias = "rev")]
    pub revision: u64,
    pub cursor: usize,
    /// Oldest first. Never empty; index 0 is the baseline.
    pub stack: Vec<Value>,
    #[serde(alias = "lastTs", default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<u64>,
}

/// Read-only view derived from a [`HistoryRecord`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryInfo {
    pub revision: u64,
    pub can_undo: bool,
    pub can_redo: bool,
    pub length: usize,
    pub cursor: usize,
}

impl HistoryRecord {
    /// Fresh record at revision 0 with `state` as the only entry.
    pub fn baseline(state: Value) -> Self {
        Self {
            revision: 0,
            cursor: 0,
            stack: vec![state],
            last_modified: Some(now_millis()),
        }
    }

    /// Rebuild a record from loosely shaped persisted JSON.
    ///
    /// Missing numbers default to 0, a missing stack to `[null]`, and the
    /// cursor is clamped into the stack.
    pub fn from_loose(raw: &Value) -> Self {
        let revision = raw
            .get("revision")
            .or_else(|| raw.get("rev"))
            .and_then(Value::as_f64)
            .map(|n| n.max(0.0) as u64)
            .unwrap_or(0);
        let cursor = raw
            .get("cursor")
            .and_then(Value::as_f64)
            .map(|n| n.max(0.0) as usize)
            .unwrap_or(0);
        let stack = match raw.get("stack") {
            Some(Value::Array(items)) => items.clone(),
            _ => vec![Value::Null],
        };
        let last_modified = raw
            .get("lastModified")
            .or_else(|| raw.get("lastTs"))
            .and_then(Value::as_u64);

        let mut record = Self {
            revision,
            cursor,
            stack,
            last_modified,
        };
        record.normalize();
        record
    }

    /// Restore the structural invariants after loading.
    pub fn normalize(&mut self) {
        if self.stack.is_empty() {
            self.stack.push(Value::Null);
        }
        if self.cursor > self.stack.len() - 1 {
            self.cursor = self.stack.len() - 1;
        }
    }

    /// State at the cursor.
    pub fn current(&self) -> &Value {
        self.stack.get(self.cursor).unwrap_or(&Value::Null)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.revision, self.current().clone())
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor + 1 < self.stack.len()
    }

    pub fn info(&self) -> HistoryInfo {
        HistoryInfo {
            revision: self.revision,
            can_undo: self.can_undo(),
            can_redo: self.can_redo(),
            length: self.stack.len(),
            cursor: self.cursor,
        }
    }

    /// Append `next` as the new head.
    ///
    /// Returns `false` without touching anything when `next` equals the
    /// state at the cursor. Otherwise drops the redo branch, pushes, bumps
    /// the revision and trims to `max_history + 1` entries.
    pub fn push(&mut self, next: Value, max_history: usize) -> bool {
        if structurally_equal(self.current(), &next) {
            return false;
        }
        self.stack.truncate(self.cursor + 1);
        self.stack.push(next);
        self.cursor = self.stack.len() - 1;
        self.revision += 1;
        self.last_modified = Some(now_millis());
        self.trim(max_history + 1);
        true
    }

    /// Move the cursor one step back. `false` at the baseline.
    pub fn step_back(&mut self) -> bool {
        if !self.can_undo() {
            return false;
        }
        self.cursor -= 1;
        self.revision = self.revision.saturating_sub(1);
        self.last_modified = Some(now_millis());
        true
    }

    /// Move the cursor one step forward. `false` at the head.
    pub fn step_forward(&mut self) -> bool {
        if !self.can_redo() {
            return false;
        }
        self.cursor += 1;
        self.revision += 1;
        self.last_modified = Some(now_millis());
        true
    }

    /// Left-trim to at most `max_len` entries, never dropping the cursor entry.
    fn trim(&mut self, max_len: usize) {
        let max_len = max_len.max(1);
        if self.stack.len() <= max_len {
            return;
        }
        let prune = (self.stack.len() - max_len).min(self.cursor);
        self.stack.drain(..prune);
        self.cursor -= prune;
    }
}
