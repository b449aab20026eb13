//! Durable `id → {title, state}` mapping backed by `data.json`.
//!
//! A passive store: whole-value get/set with no revision logic. The
//! history engine writes through it on every accepted change.

use std::path::{Path, PathBuf};
use serde_json::Value;
use tokio::sync::Mutex;

use labsync_core::{PageMeta, StoredPage};

use super::{atomic_write_json, read_json, StoreError, PAGES_FILE, PAGES_FILE_ALT};

/// Document store persisted as a JSON array of `{id, title, state}`.
pub struct DocumentStore {
    /// Target file (None = in-memory only)
    path: Option<PathBuf>,
    /// Records in file order. The lock also serializes file writes.
    pages: Mutex<Vec<StoredPage>>,
}

impl DocumentStore {
    /// Store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            pages: Mutex::new(Vec::new()),
        }
    }

    /// Open the pages file inside `dir`, falling back to the legacy name.
    pub async fn open(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let path = dir.join(PAGES_FILE);
        let raw = match read_json(&path).await {
            Some(v) => Some(v),
            None => read_json(&dir.join(PAGES_FILE_ALT)).await,
        };
        let pages = raw.map(|v| parse_pages(&v)).unwrap_or_default();
        log::info!("Loaded {} pages from {}", pages.len(), path.display());
        Self {
            path: Some(path),
            pages: Mutex::new(pages),
        }
    }

    /// Current state of a document, if the document exists.
    pub async fn get(&self, id: &str) -> Option<Value> {
        let pages = self.pages.lock().await;
        pages.iter().find(|p| p.id == id).map(|p| p.state.clone())
    }

    /// Replace the state of a document, creating it with an empty title.
    ///
    /// On a failed write the store keeps its previous contents.
    pub async fn set(&self, id: &str, state: Value) -> Result<(), StoreError> {
        let mut pages = self.pages.lock().await;
        let mut next = pages.clone();
        match next.iter_mut().find(|p| p.id == id) {
            Some(page) => page.state = state,
            None => next.push(StoredPage {
                id: id.to_string(),
                title: String::new(),
                state,
            }),
        }
        self.persist(&next).await?;
        *pages = next;
        Ok(())
    }

    /// All documents as `{id, title}`.
    pub async fn list_pages(&self) -> Vec<PageMeta> {
        self.pages.lock().await.iter().map(StoredPage::meta).collect()
    }

    /// Rename a document, creating it with a `null` state if absent.
    pub async fn set_title(&self, id: &str, title: &str) -> Result<PageMeta, StoreError> {
        let mut pages = self.pages.lock().await;
        let mut next = pages.clone();
        match next.iter_mut().find(|p| p.id == id) {
            Some(page) => page.title = title.to_string(),
            None => next.push(StoredPage {
                id: id.to_string(),
                title: title.to_string(),
                state: Value::Null,
            }),
        }
        self.persist(&next).await?;
        *pages = next;
        Ok(PageMeta {
            id: id.to_string(),
            title: title.to_string(),
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn persist(&self, pages: &[StoredPage]) -> Result<(), StoreError> {
        match &self.path {
            Some(path) => atomic_write_json(path, pages).await,
            None => Ok(()),
        }
    }
}

fn parse_pages(raw: &Value) -> Vec<StoredPage> {
    match raw {
        Value::Array(items) => items.iter().map(StoredPage::from_loose).collect(),
        _ => Vec::new(),
    }
}
