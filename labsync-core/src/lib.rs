//! # labsync-core: shared data model for the lab-state service
//!
//! Plain serde types that every other crate speaks:
//!
//! ```text
//! ┌──────────────┐   read / mutate    ┌───────────────┐
//! │  Snapshot    │ ◄───────────────── │ HistoryRecord │
//! │ {rev, state} │                    │ rev · cursor  │
//! └──────────────┘                    │ stack[0..=50] │
//!                                     └───────────────┘
//! ┌──────────────┐   routed by key    ┌───────────────┐
//! │  Endpoint    │ ─────────────────► │ RPC envelope  │
//! │ base · instr │                    │ {ok, result}  │
//! └──────────────┘                    └───────────────┘
//! ```
//!
//! No I/O lives here. Persistence, locking and fan-out belong to
//! `labsync-collab`.

pub mod history;
pub mod rpc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;

pub use history::{HistoryInfo, HistoryRecord, DEFAULT_MAX_HISTORY};

/// Opaque document payload. The core never interprets its structure.
pub type Json = Value;

/// Externally visible read of a document at one point in time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub revision: u64,
    pub state: Value,
}

impl Snapshot {
    pub fn new(revision: u64, state: Value) -> Self {
        Self { revision, state }
    }
}

/// Page listing entry (documents plus their titles).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    pub id: String,
    pub title: String,
}

/// One record of the persisted pages file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredPage {
    pub id: String,
    pub title: String,
    pub state: Value,
}

impl StoredPage {
    /// Build a record from a loosely shaped JSON object.
    ///
    /// `id` and `title` are stringified, `state` falls back to the legacy
    /// `content` field and then to `null`.
    pub fn from_loose(raw: &Value) -> Self {
        let text = |key: &str| match raw.get(key) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        let state = match raw.get("state") {
            Some(v) if !v.is_null() => v.clone(),
            _ => raw.get("content").cloned().unwrap_or(Value::Null),
        };
        Self {
            id: text("id"),
            title: text("title"),
            state,
        }
    }

    pub fn meta(&self) -> PageMeta {
        PageMeta {
            id: self.id.clone(),
            title: self.title.clone(),
        }
    }
}

/// Static routing entry for one hardware RPC server.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(alias = "base", default)]
    pub base_address: String,
    #[serde(alias = "instrument", default)]
    pub instrument_identifier: String,
}

impl Endpoint {
    pub fn new(base_address: impl Into<String>, instrument_identifier: impl Into<String>) -> Self {
        Self {
            base_address: base_address.into(),
            instrument_identifier: instrument_identifier.into(),
        }
    }

    /// Both the address and the instrument identifier are present.
    pub fn is_configured(&self) -> bool {
        !self.base_address.trim().is_empty() && !self.instrument_identifier.trim().is_empty()
    }
}

/// Process-wide channel scheduler state.
///
/// Empty (`running == false`, every other field `None`) whenever the
/// scheduler is stopped.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerState {
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(
        rename = "lastActiveChannelIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_active_channel: Option<usize>,
}

impl RunnerState {
    pub fn stopped() -> Self {
        Self::default()
    }

    pub fn started(document_id: impl Into<String>) -> Self {
        Self {
            running: true,
            document_id: Some(document_id.into()),
            started_at: Some(now_millis()),
            last_active_channel: None,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Structural equality between two documents.
///
/// Numbers compare by value, so `1` and `1.0` are the same state.
/// Object key order never matters.
pub fn structurally_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(fx), Some(fy)) if x.is_f64() || y.is_f64() => fx == fy,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| structurally_equal(x, y))
        }
        (Value::Object(xm), Value::Object(ym)) => {
            xm.len() == ym.len()
                && xm
                    .iter()
                    .all(|(k, x)| ym.get(k).is_some_and(|y| structurally_equal(x, y)))
        }
        _ => a == b,
    }
}
