//! Outbound RPC to hardware servers.
//!
//! ```text
//! RpcCall { endpoint_key, command, args, kwargs }
//!     │
//!     ├── EndpointRegistry lookup ──► EndpointNotConfigured (no network)
//!     │
//!     └── POST {base}/rpc  { instrument, command, args, kwargs }
//!             │   (one attempt, hard deadline)
//!             ├── non-2xx        ──► Transport("HTTP 500 ...: <excerpt>")
//!             ├── not JSON       ──► Transport("Server did not return JSON: ...")
//!             ├── { "ok": .. }   ──► passed through
//!             └── anything else  ──► { "ok": true, "result": <body> }
//! ```
//!
//! Nothing is retried here. Retry policy belongs to the caller.

use std::sync::Arc;
use std::time::Duration;
use serde_json::{json, Map, Value};
use thiserror::Error;

use labsync_core::rpc;

use crate::storage::EndpointRegistry;

/// Default deadline for one call.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Longest body excerpt carried in an error, in bytes.
const EXCERPT_LIMIT: usize = 200;

/// Gateway failures. `Display` is the user-visible reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("endpoint '{0}' not configured")]
    EndpointNotConfigured(String),
    /// Non-2xx status, non-JSON body or a failed connection.
    #[error("{0}")]
    Transport(String),
    #[error("RPC timeout after {millis}ms")]
    Timeout { millis: u64 },
}

/// One command addressed to a logical endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
    pub endpoint_key: String,
    pub command: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Overrides the gateway default when set.
    pub timeout: Option<Duration>,
}

impl RpcCall {
    pub fn new(endpoint_key: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            endpoint_key: endpoint_key.into(),
            command: command.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            timeout: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Resolves endpoint keys and forwards commands over HTTP.
pub struct RpcGateway {
    endpoints: Arc<EndpointRegistry>,
    http: reqwest::Client,
    default_timeout: Duration,
}

impl RpcGateway {
    pub fn new(endpoints: Arc<EndpointRegistry>, default_timeout: Duration) -> Self {
        Self {
            endpoints,
            http: reqwest::Client::new(),
            default_timeout,
        }
    }

    pub fn endpoints(&self) -> &Arc<EndpointRegistry> {
        &self.endpoints
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Issue `call` once and return the normalized `{ok, ...}` envelope.
    ///
    /// A hardware server answering `{"ok": false, ...}` is still `Ok` here:
    /// the envelope is passed through untouched. `Err` means the call never
    /// produced a usable reply.
    pub async fn call(&self, call: &RpcCall) -> Result<Value, GatewayError> {
        let endpoint = self
            .endpoints
            .get(&call.endpoint_key)
            .await
            .filter(|ep| ep.is_configured())
            .ok_or_else(|| GatewayError::EndpointNotConfigured(call.endpoint_key.clone()))?;

        let url = format!("{}/rpc", normalize_base_address(&endpoint.base_address));
        let body = json!({
            "instrument": endpoint.instrument_identifier,
            "command": call.command,
            "args": call.args,
            "kwargs": call.kwargs,
        });
        let deadline = call.timeout.unwrap_or(self.default_timeout);

        log::debug!("→ {} {} {}", call.endpoint_key, call.command, url);
        let result = match tokio::time::timeout(deadline, self.post(&url, &body)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                millis: deadline.as_millis() as u64,
            }),
        };

        match &result {
            Ok(reply) => log::debug!("← {} {} {}", call.endpoint_key, call.command, reply),
            Err(e) => log::warn!("RPC {} {} failed: {}", call.endpoint_key, call.command, e),
        }
        result
    }

    /// Like [`call`](Self::call), folding errors into `{ok: false, error}`.
    pub async fn dispatch(&self, call: &RpcCall) -> Value {
        match self.call(call).await {
            Ok(envelope) => envelope,
            Err(e) => rpc::err(e.to_string()),
        }
    }

    async fn post(&self, url: &str, body: &Value) -> Result<Value, GatewayError> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("fetch failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Transport(format!("fetch failed: {e}")))?;

        if !status.is_success() {
            return Err(GatewayError::Transport(format!(
                "HTTP {} {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or(""),
                excerpt(&text)
            )));
        }

        let value: Value = serde_json::from_str(&text).map_err(|_| {
            GatewayError::Transport(format!("Server did not return JSON: {}", excerpt(&text)))
        })?;
        Ok(rpc::normalize(value))
    }
}

/// `" 10.0.0.5:8000/ "` → `"http://10.0.0.5:8000"`.
pub fn normalize_base_address(raw: &str) -> String {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    let with_scheme = if lower.starts_with("http://") || lower.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    with_scheme.trim_end_matches('/').to_string()
}

/// At most [`EXCERPT_LIMIT`] bytes, cut on a char boundary.
fn excerpt(text: &str) -> &str {
    let mut end = EXCERPT_LIMIT.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
