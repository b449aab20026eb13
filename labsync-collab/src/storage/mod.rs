//! Persistent storage layer: three JSON files behind atomic writes.
//!
//! Layout:
//! ```text
//! <data_dir>/
//! ├── data.json           [{id, title, state}, ...]        DocumentStore
//! ├── endpoints.json      {key: {baseAddress, ...}}        EndpointRegistry
//! └── page_history.json   {id: {revision, cursor, stack}}  HistoryFile
//! ```
//!
//! Every write goes to a unique temporary sibling and is renamed into
//! place, so a crash or a concurrent reader never sees a torn file.
//! A store opened without a directory keeps everything in memory.

pub mod endpoints;
pub mod history;
pub mod pages;

pub use endpoints::EndpointRegistry;
pub use history::HistoryFile;
pub use pages::DocumentStore;

use std::path::{Path, PathBuf};
use serde::Serialize;
use thiserror::Error;

/// Pages file name.
pub const PAGES_FILE: &str = "data.json";
/// Legacy pages file name, read when [`PAGES_FILE`] is missing.
pub const PAGES_FILE_ALT: &str = "Data.json";
/// Endpoint registry file name.
pub const ENDPOINTS_FILE: &str = "endpoints.json";
/// History file name.
pub const HISTORY_FILE: &str = "page_history.json";

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid record: {0}")]
    Invalid(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
///
/// Writes `<file>.<millis base36>.<random hex>.tmp` first, then renames.
/// If the rename fails the target is written directly and the temporary
/// file removed.
pub async fn atomic_write_json<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &data).await
}

/// Atomically replace `path` with `data`.
pub async fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
    }

    let tmp = temp_path(path);
    tokio::fs::write(&tmp, data)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        log::warn!("Rename {} -> {} failed ({e}), writing in place", tmp.display(), path.display());
        let written = tokio::fs::write(path, data).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        written.map_err(|e| StoreError::io(path, e))?;
    }
    Ok(())
}

/// Read and parse a JSON file. `None` when missing or unparsable.
pub async fn read_json(path: &Path) -> Option<serde_json::Value> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            log::warn!("Failed to read {}: {e}", path.display());
            return None;
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("Ignoring unparsable {}: {e}", path.display());
            None
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let stamp = to_base36(labsync_core::now_millis());
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{stamp}.{}.tmp", &nonce[..12]));
    path.with_file_name(name)
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
