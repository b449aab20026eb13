//! JSON frames exchanged over the WebSocket.
//!
//! Client → server, one text message per request:
//! ```text
//! { "id": 7, "op": "mutate", "doc": "1", "baseRevision": 3, "nextState": {...} }
//! ```
//! Server → client:
//! ```text
//! { "type": "response", "id": 7, "status": 200, "body": {...} }
//! { "type": "event", "doc": "1", "revision": 4, "state": {...} }
//! ```
//!
//! `status` follows HTTP: 200 ok, 400 malformed request, 409 stale
//! revision, 500 storage failure.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::broadcast::SnapshotEvent;

/// Reply status codes.
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const CONFLICT: u16 = 409;
    pub const INTERNAL: u16 = 500;
}

/// One client operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Request {
    Read {
        #[serde(deserialize_with = "doc_id")]
        doc: String,
    },
    #[serde(rename_all = "camelCase")]
    Mutate {
        #[serde(deserialize_with = "doc_id")]
        doc: String,
        base_revision: u64,
        next_state: Value,
    },
    Undo {
        #[serde(deserialize_with = "doc_id")]
        doc: String,
    },
    Redo {
        #[serde(deserialize_with = "doc_id")]
        doc: String,
    },
    History {
        #[serde(deserialize_with = "doc_id")]
        doc: String,
    },
    Subscribe {
        #[serde(deserialize_with = "doc_id")]
        doc: String,
    },
    Unsubscribe {
        #[serde(deserialize_with = "doc_id")]
        doc: String,
    },
    #[serde(rename_all = "camelCase")]
    Rpc {
        endpoint_key: String,
        command: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
    },
    SchedulerStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        doc: Option<String>,
    },
    SchedulerStop,
    SchedulerState,
    ListPages,
    SetPageTitle {
        #[serde(deserialize_with = "doc_id")]
        doc: String,
        title: String,
    },
    ListEndpoints,
    SetEndpoints {
        endpoints: Value,
    },
    Ping,
}

impl Request {
    /// Wire name of the operation.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Mutate { .. } => "mutate",
            Self::Undo { .. } => "undo",
            Self::Redo { .. } => "redo",
            Self::History { .. } => "history",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Rpc { .. } => "rpc",
            Self::SchedulerStart { .. } => "schedulerStart",
            Self::SchedulerStop => "schedulerStop",
            Self::SchedulerState => "schedulerState",
            Self::ListPages => "listPages",
            Self::SetPageTitle { .. } => "setPageTitle",
            Self::ListEndpoints => "listEndpoints",
            Self::SetEndpoints { .. } => "setEndpoints",
            Self::Ping => "ping",
        }
    }

    /// Encode as a client frame tagged with `id`.
    pub fn encode(&self, id: u64) -> Result<String, ProtocolError> {
        let mut value =
            serde_json::to_value(self).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if let Value::Object(map) = &mut value {
            map.insert("id".into(), json!(id));
        }
        Ok(value.to_string())
    }

    /// Decode a client frame.
    ///
    /// The correlation id is returned even when the request itself is
    /// malformed, so the rejection can still be routed back.
    pub fn decode(text: &str) -> (Option<u64>, Result<Request, ProtocolError>) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return (None, Err(ProtocolError::Validation(format!("invalid JSON: {e}")))),
        };
        let id = value.get("id").and_then(Value::as_u64);
        let request = serde_json::from_value(value).map_err(|e| ProtocolError::Validation(e.to_string()));
        (id, request)
    }
}

/// Document ids are strings on the wire; bare numbers are accepted.
fn doc_id<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    match Value::deserialize(de)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid document id: {other}"))),
    }
}

/// Server → client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Response {
        id: Option<u64>,
        status: u16,
        body: Value,
    },
    Event {
        doc: String,
        revision: u64,
        state: Value,
    },
}

impl ServerFrame {
    pub fn ok(id: Option<u64>, body: Value) -> Self {
        Self::Response {
            id,
            status: status::OK,
            body,
        }
    }

    /// `{ "error": message }` with the given status.
    pub fn error(id: Option<u64>, status: u16, message: impl Into<String>) -> Self {
        Self::Response {
            id,
            status,
            body: json!({ "error": message.into() }),
        }
    }

    /// 409 carrying the revision the caller must rebase on.
    pub fn conflict(id: Option<u64>, current_revision: u64) -> Self {
        Self::Response {
            id,
            status: status::CONFLICT,
            body: json!({ "error": "conflict", "revision": current_revision }),
        }
    }

    pub fn event(event: &SnapshotEvent) -> Self {
        Self::Event {
            doc: event.doc_id.clone(),
            revision: event.snapshot.revision,
            state: event.snapshot.state.clone(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Request timeout")]
    Timeout,
    /// Non-200 reply from the server.
    #[error("Server replied {status}: {message}")]
    Remote { status: u16, message: String },
}

impl ProtocolError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Remote { status: code, .. } if *code == status::CONFLICT)
    }
}
