//! WebSocket client for the state server.
//!
//! Provides:
//! - Request/response correlation by frame id
//! - Typed async methods for every operation
//! - Change notifications with echo suppression
//! - Optimistic read-modify-write with conflict retry ([`StateClient::update`])

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;

use labsync_core::{Endpoint, HistoryInfo, PageMeta, RunnerState, Snapshot};

use crate::protocol::{status, ProtocolError, Request, ServerFrame};
use crate::server::error_text;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// A subscribed document moved past the last revision seen.
    DocumentChanged { doc: String, snapshot: Snapshot },
}

/// Outstanding request: the document whose snapshot the reply carries, if
/// any, and the waiter.
type Pending = Arc<StdMutex<HashMap<u64, (Option<String>, oneshot::Sender<(u16, Value)>)>>>;

/// Last revision observed per document. Events at or below it are dropped.
#[derive(Debug, Default)]
struct RevisionFilter {
    seen: StdMutex<HashMap<String, u64>>,
}

impl RevisionFilter {
    fn observe(&self, doc: &str, revision: u64) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.insert(doc.to_string(), revision);
        }
    }

    /// Record `revision` and return true if it is newer than anything seen.
    fn admit(&self, doc: &str, revision: u64) -> bool {
        let Ok(mut seen) = self.seen.lock() else {
            return true;
        };
        match seen.get(doc) {
            Some(&last) if revision <= last => false,
            _ => {
                seen.insert(doc.to_string(), revision);
                true
            }
        }
    }

    fn last(&self, doc: &str) -> Option<u64> {
        self.seen.lock().ok().and_then(|s| s.get(doc).copied())
    }
}

/// The state client.
pub struct StateClient {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    next_id: AtomicU64,
    pending: Pending,
    revisions: Arc<RevisionFilter>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
    request_timeout: Duration,
}

impl StateClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            next_id: AtomicU64::new(1),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            revisions: Arc::new(RevisionFilter::default()),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;
        log::debug!("Connected to {}", self.server_url);

        // Reader task: route replies and filter events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let pending = self.pending.clone();
        let revisions = self.revisions.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match ServerFrame::decode(text.as_str()) {
                    Ok(ServerFrame::Response { id: Some(id), status: code, body }) => {
                        let waiter = pending.lock().ok().and_then(|mut p| p.remove(&id));
                        if let Some((doc, waiter)) = waiter {
                            // Recorded before any later event frame is looked at
                            if let (Some(doc), status::OK) = (doc, code) {
                                if let Some(revision) = body.get("revision").and_then(Value::as_u64) {
                                    revisions.observe(&doc, revision);
                                }
                            }
                            let _ = waiter.send((code, body));
                        }
                    }
                    Ok(ServerFrame::Response { id: None, body, .. }) => {
                        log::warn!("Uncorrelated reply: {body}");
                    }
                    Ok(ServerFrame::Event { doc, revision, state }) => {
                        if revisions.admit(&doc, revision) {
                            let snapshot = Snapshot::new(revision, state);
                            let _ = event_tx.send(ClientEvent::DocumentChanged { doc, snapshot }).await;
                        } else {
                            log::trace!("Dropped stale event for doc {doc} at revision {revision}");
                        }
                    }
                    Err(e) => log::warn!("Undecodable frame: {e}"),
                }
            }

            // Connection lost: outstanding requests fail with ConnectionClosed
            if let Ok(mut p) = pending.lock() {
                p.clear();
            }
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. Outstanding requests fail.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Last revision observed for `doc` through replies or events.
    pub fn last_revision(&self, doc: &str) -> Option<u64> {
        self.revisions.last(doc)
    }

    /// Send `request` and wait for its reply body.
    ///
    /// Non-200 replies become [`ProtocolError::Remote`].
    pub async fn request(&self, request: &Request) -> Result<Value, ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = request.encode(id)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        if let Ok(mut p) = self.pending.lock() {
            p.insert(id, (snapshot_doc(request), reply_tx));
        }
        if tx.send(frame).await.is_err() {
            self.forget(id);
            return Err(ProtocolError::ConnectionClosed);
        }

        let (code, body) = match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                self.forget(id);
                return Err(ProtocolError::Timeout);
            }
        };
        if code == status::OK {
            Ok(body)
        } else {
            Err(ProtocolError::Remote {
                status: code,
                message: error_text(&body),
            })
        }
    }

    async fn request_as<T: DeserializeOwned>(&self, request: &Request) -> Result<T, ProtocolError> {
        let body = self.request(request).await?;
        serde_json::from_value(body).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Request returning a snapshot; the reader task records its revision.
    async fn snapshot_request(&self, request: &Request) -> Result<Snapshot, ProtocolError> {
        self.request_as(request).await
    }

    fn forget(&self, id: u64) {
        if let Ok(mut p) = self.pending.lock() {
            p.remove(&id);
        }
    }

    pub async fn read(&self, doc: &str) -> Result<Snapshot, ProtocolError> {
        self.snapshot_request(&Request::Read { doc: doc.into() }).await
    }

    /// Fails with a 409 [`ProtocolError::Remote`] if `base_revision` is stale.
    pub async fn mutate(&self, doc: &str, base_revision: u64, next_state: Value) -> Result<Snapshot, ProtocolError> {
        let request = Request::Mutate {
            doc: doc.into(),
            base_revision,
            next_state,
        };
        self.snapshot_request(&request).await
    }

    pub async fn undo(&self, doc: &str) -> Result<Snapshot, ProtocolError> {
        self.snapshot_request(&Request::Undo { doc: doc.into() }).await
    }

    pub async fn redo(&self, doc: &str) -> Result<Snapshot, ProtocolError> {
        self.snapshot_request(&Request::Redo { doc: doc.into() }).await
    }

    pub async fn history_info(&self, doc: &str) -> Result<HistoryInfo, ProtocolError> {
        self.request_as(&Request::History { doc: doc.into() }).await
    }

    /// Start receiving change events for `doc`; returns the authoritative
    /// snapshot at subscription time.
    pub async fn subscribe(&self, doc: &str) -> Result<Snapshot, ProtocolError> {
        self.snapshot_request(&Request::Subscribe { doc: doc.into() }).await
    }

    pub async fn unsubscribe(&self, doc: &str) -> Result<(), ProtocolError> {
        self.request(&Request::Unsubscribe { doc: doc.into() }).await.map(|_| ())
    }

    /// Read-modify-write with retry on conflict.
    ///
    /// Re-reads and re-applies `f` after each conflict, up to `max_attempts`
    /// writes. The last conflict is returned if every attempt loses.
    pub async fn update<F>(&self, doc: &str, mut f: F, max_attempts: usize) -> Result<Snapshot, ProtocolError>
    where
        F: FnMut(&Value) -> Value,
    {
        let mut last_err = ProtocolError::Remote {
            status: status::CONFLICT,
            message: "conflict".into(),
        };
        for attempt in 1..=max_attempts.max(1) {
            let current = self.read(doc).await?;
            let next = f(&current.state);
            match self.mutate(doc, current.revision, next).await {
                Err(e) if e.is_conflict() => {
                    log::debug!("Update of doc {doc} conflicted (attempt {attempt})");
                    last_err = e;
                }
                other => return other,
            }
        }
        Err(last_err)
    }

    /// Forward a command to a hardware endpoint. Returns the `{ok, ...}` envelope.
    pub async fn rpc(
        &self,
        endpoint_key: &str,
        command: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, ProtocolError> {
        self.request(&Request::Rpc {
            endpoint_key: endpoint_key.into(),
            command: command.into(),
            args,
            kwargs,
        })
        .await
    }

    pub async fn scheduler_start(&self, doc: Option<&str>) -> Result<RunnerState, ProtocolError> {
        self.request_as(&Request::SchedulerStart {
            doc: doc.map(str::to_string),
        })
        .await
    }

    pub async fn scheduler_stop(&self) -> Result<RunnerState, ProtocolError> {
        self.request_as(&Request::SchedulerStop).await
    }

    pub async fn scheduler_state(&self) -> Result<RunnerState, ProtocolError> {
        self.request_as(&Request::SchedulerState).await
    }

    pub async fn list_pages(&self) -> Result<Vec<PageMeta>, ProtocolError> {
        self.request_as(&Request::ListPages).await
    }

    pub async fn set_page_title(&self, doc: &str, title: &str) -> Result<PageMeta, ProtocolError> {
        self.request_as(&Request::SetPageTitle {
            doc: doc.into(),
            title: title.into(),
        })
        .await
    }

    pub async fn list_endpoints(&self) -> Result<BTreeMap<String, Endpoint>, ProtocolError> {
        self.request_as(&Request::ListEndpoints).await
    }

    pub async fn set_endpoints(
        &self,
        endpoints: &BTreeMap<String, Endpoint>,
    ) -> Result<BTreeMap<String, Endpoint>, ProtocolError> {
        let endpoints =
            serde_json::to_value(endpoints).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        self.request_as(&Request::SetEndpoints { endpoints }).await
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.request(&Request::Ping).await.map(|_| ())
    }
}

/// Document whose snapshot the reply to `request` carries.
fn snapshot_doc(request: &Request) -> Option<String> {
    match request {
        Request::Read { doc }
        | Request::Mutate { doc, .. }
        | Request::Undo { doc }
        | Request::Redo { doc }
        | Request::Subscribe { doc } => Some(doc.clone()),
        _ => None,
    }
}
