//! `page_history.json`: document id → [`HistoryRecord`].
//!
//! Holds no lock of its own. The history engine only calls [`HistoryFile::save`]
//! from inside its serialization point, so writes are already ordered.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use serde_json::Value;

use labsync_core::HistoryRecord;

use super::{atomic_write_json, read_json, StoreError, HISTORY_FILE};

pub struct HistoryFile {
    path: Option<PathBuf>,
}

impl HistoryFile {
    pub fn in_memory() -> Self {
        Self { path: None }
    }

    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: Some(dir.as_ref().join(HISTORY_FILE)),
        }
    }

    /// Load every record. Missing or invalid files load empty.
    pub async fn load(&self) -> HashMap<String, HistoryRecord> {
        let Some(path) = &self.path else {
            return HashMap::new();
        };
        match read_json(path).await {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(id, raw)| (id.clone(), HistoryRecord::from_loose(raw)))
                .collect(),
            Some(_) => {
                log::warn!("{} is not a JSON object, starting with empty history", path.display());
                HashMap::new()
            }
            None => HashMap::new(),
        }
    }

    pub async fn save(&self, records: &HashMap<String, HistoryRecord>) -> Result<(), StoreError> {
        match &self.path {
            Some(path) => atomic_write_json(path, records).await,
            None => Ok(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = HistoryFile::new(dir.path());

        let mut record = HistoryRecord::baseline(json!({"count": 0}));
        record.push(json!({"count": 1}), 50);
        let mut records = HashMap::new();
        records.insert("1".to_string(), record.clone());
        file.save(&records).await.unwrap();

        let loaded = file.load().await;
        assert_eq!(loaded.get("1"), Some(&record));
    }

    #[tokio::test]
    async fn test_legacy_shape_and_clamping() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(HISTORY_FILE),
            br#"{"1": {"rev": 3, "cursor": 12, "stack": [{"a": 1}, {"a": 2}], "lastTs": 1700000000000}}"#,
        )
        .unwrap();

        let loaded = HistoryFile::new(dir.path()).load().await;
        let rec = &loaded["1"];
        assert_eq!(rec.revision, 3);
        assert_eq!(rec.cursor, 1);
        assert_eq!(rec.current(), &json!({"a": 2}));
    }

    #[tokio::test]
    async fn test_in_memory_is_empty() {
        let file = HistoryFile::in_memory();
        assert!(file.load().await.is_empty());
        assert!(file.save(&HashMap::new()).await.is_ok());
        assert!(file.path().is_none());
    }
}
