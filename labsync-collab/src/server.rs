//! WebSocket state server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── HistoryEngine ── DocumentStore
//!             ├── connection task ─────┤         │
//! Client B ──┘    (request frames)     │         └── EventBus ──┐
//!                                      ├── RpcGateway ──► hardware │
//!                                      └── ChannelScheduler        │
//!                                                                  │
//!                 forwarding task per subscribed doc ◄─────────────┘
//!                     │
//!                     └── mpsc ──► connection task ──► event frames
//! ```
//!
//! Document and subscription replies are written by the connection task
//! itself, so the reply to a `subscribe` always precedes the events it
//! enables. Hardware calls and scheduler requests run on their own tasks and
//! send their reply back over a second channel, so a slow instrument never
//! stalls the rest of the connection.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::EventBus;
use crate::config::LabConfig;
use crate::gateway::{RpcCall, RpcGateway};
use crate::history::{HistoryEngine, HistoryError};
use crate::protocol::{status, ProtocolError, Request, ServerFrame};
use crate::scheduler::ChannelScheduler;
use crate::storage::{DocumentStore, EndpointRegistry, HistoryFile, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Event channel capacity per document
    pub broadcast_capacity: usize,
    /// Upper bound on handling one request
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            request_timeout_secs: 30,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
    pub events_pushed: u64,
}

/// Everything a connection can reach.
#[derive(Clone)]
pub struct Services {
    pub history: Arc<HistoryEngine>,
    pub gateway: Arc<RpcGateway>,
    pub scheduler: Arc<ChannelScheduler>,
}

impl Services {
    /// Open storage (or stay in memory) and wire the engine, gateway and
    /// scheduler together.
    pub async fn from_config(config: &LabConfig) -> Self {
        let (store, file, endpoints) = match &config.storage.data_dir {
            Some(dir) => (
                DocumentStore::open(dir).await,
                HistoryFile::new(dir),
                EndpointRegistry::open(dir).await,
            ),
            None => (
                DocumentStore::in_memory(),
                HistoryFile::in_memory(),
                EndpointRegistry::in_memory(),
            ),
        };
        let events = Arc::new(EventBus::new(config.server.broadcast_capacity));
        let history = Arc::new(
            HistoryEngine::open(Arc::new(store), file, events, config.history.max_history).await,
        );
        let gateway = Arc::new(RpcGateway::new(Arc::new(endpoints), config.gateway.timeout()));
        let scheduler = Arc::new(ChannelScheduler::new(
            history.clone(),
            gateway.clone(),
            config.scheduler.clone(),
        ));
        Self {
            history,
            gateway,
            scheduler,
        }
    }
}

/// The state server.
pub struct StateServer {
    config: ServerConfig,
    services: Services,
    stats: Arc<RwLock<ServerStats>>,
}

impl StateServer {
    pub fn new(config: ServerConfig, services: Services) -> Self {
        Self {
            config,
            services,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind and serve until the process ends.
    pub async fn run(&self) -> Result<(), BoxError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("State server listening on {}", listener.local_addr()?);
        self.serve(listener, shutdown).await
    }

    /// Serve an already-bound listener until `shutdown` resolves.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), BoxError> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("State server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let connection = Connection {
                        services: self.services.clone(),
                        stats: self.stats.clone(),
                        request_timeout: Duration::from_secs(self.config.request_timeout_secs),
                        event_capacity: self.config.broadcast_capacity.max(1),
                    };
                    tokio::spawn(async move {
                        if let Err(e) = connection.run(stream, addr).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn services(&self) -> &Services {
        &self.services
    }
}

/// Per-connection handler.
struct Connection {
    services: Services,
    stats: Arc<RwLock<ServerStats>>,
    request_timeout: Duration,
    event_capacity: usize,
}

impl Connection {
    async fn run(self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let conn_id = Uuid::new_v4();
        log::info!("WebSocket connection {conn_id} established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (event_tx, mut event_rx) = mpsc::channel::<ServerFrame>(self.event_capacity);
        let (reply_tx, mut reply_rx) = mpsc::channel::<ServerFrame>(self.event_capacity);
        let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let reply = match msg {
                            Some(Ok(Message::Text(text))) => {
                                {
                                    let mut s = self.stats.write().await;
                                    s.total_frames += 1;
                                    s.total_bytes += text.len() as u64;
                                }
                                match self.handle_text(text.as_str(), &event_tx, &reply_tx, &mut subscriptions).await {
                                    Some(reply) => reply,
                                    None => continue,
                                }
                            }
                            Some(Ok(Message::Binary(_))) => {
                                ServerFrame::error(None, status::BAD_REQUEST, "binary frames are not supported")
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection {conn_id} from {addr} closed");
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                log::error!("WebSocket error on connection {conn_id}: {e}");
                                break;
                            }
                        };
                        self.count_rejection(&reply).await;
                        ws_sender.send(Message::text(reply.encode()?)).await?;
                    }

                    Some(reply) = reply_rx.recv() => {
                        self.count_rejection(&reply).await;
                        ws_sender.send(Message::text(reply.encode()?)).await?;
                    }

                    Some(frame) = event_rx.recv() => {
                        ws_sender.send(Message::text(frame.encode()?)).await?;
                        self.stats.write().await.events_pushed += 1;
                    }
                }
            }
            Ok(())
        }
        .await;

        for (_, task) in subscriptions.drain() {
            task.abort();
        }
        self.stats.write().await.active_connections -= 1;
        result
    }

    async fn count_rejection(&self, reply: &ServerFrame) {
        if matches!(reply, ServerFrame::Response { status: code, .. } if *code != status::OK) {
            self.stats.write().await.rejected_frames += 1;
        }
    }

    /// Reply to one text frame. `None` when the reply will arrive on
    /// `reply_tx` from a detached task.
    async fn handle_text(
        &self,
        text: &str,
        event_tx: &mpsc::Sender<ServerFrame>,
        reply_tx: &mpsc::Sender<ServerFrame>,
        subscriptions: &mut HashMap<String, JoinHandle<()>>,
    ) -> Option<ServerFrame> {
        let (id, request) = Request::decode(text);
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                log::debug!("Rejected frame: {e}");
                return Some(ServerFrame::error(id, status::BAD_REQUEST, e.to_string()));
            }
        };

        let op = request.op();
        let limit = self.request_timeout;
        if runs_detached(&request) {
            let services = self.services.clone();
            let reply_tx = reply_tx.clone();
            tokio::spawn(async move {
                let frame = bounded(limit, id, op, execute_detached(&services, id, request)).await;
                if reply_tx.send(frame).await.is_err() {
                    log::debug!("Connection gone before {op} reply");
                }
            });
            return None;
        }
        Some(bounded(limit, id, op, self.execute(id, request, event_tx, subscriptions)).await)
    }

    async fn execute(
        &self,
        id: Option<u64>,
        request: Request,
        event_tx: &mpsc::Sender<ServerFrame>,
        subscriptions: &mut HashMap<String, JoinHandle<()>>,
    ) -> ServerFrame {
        let Services { history, gateway, .. } = &self.services;

        match request {
            Request::Read { doc } => reply(id, &history.read(&doc).await),
            Request::Mutate {
                doc,
                base_revision,
                next_state,
            } => history_reply(id, history.mutate(&doc, base_revision, next_state).await),
            Request::Undo { doc } => history_reply(id, history.undo(&doc).await),
            Request::Redo { doc } => history_reply(id, history.redo(&doc).await),
            Request::History { doc } => reply(id, &history.history_info(&doc).await),

            Request::Subscribe { doc } => {
                let mut subscription = history.events().subscribe(&doc);
                let tx = event_tx.clone();
                let task = tokio::spawn(async move {
                    while let Some(event) = subscription.recv().await {
                        if tx.send(ServerFrame::event(&event)).await.is_err() {
                            break;
                        }
                    }
                });
                if let Some(previous) = subscriptions.insert(doc.clone(), task) {
                    previous.abort();
                }
                log::debug!("Subscribed to doc {doc}");
                reply(id, &history.read(&doc).await)
            }
            Request::Unsubscribe { doc } => {
                if let Some(task) = subscriptions.remove(&doc) {
                    task.abort();
                    log::debug!("Unsubscribed from doc {doc}");
                }
                ServerFrame::ok(id, json!({}))
            }

            Request::Rpc { .. }
            | Request::SchedulerStart { .. }
            | Request::SchedulerStop
            | Request::SchedulerState => execute_detached(&self.services, id, request).await,

            Request::ListPages => reply(id, &history.store().list_pages().await),
            Request::SetPageTitle { doc, title } => {
                store_reply(id, history.store().set_title(&doc, &title).await)
            }
            Request::ListEndpoints => reply(id, &gateway.endpoints().list().await),
            Request::SetEndpoints { endpoints } => {
                store_reply(id, gateway.endpoints().set_many_json(&endpoints).await)
            }

            Request::Ping => ServerFrame::ok(id, json!({ "pong": true })),
        }
    }
}

/// Requests that wait on hardware or on the scheduler lock.
fn runs_detached(request: &Request) -> bool {
    matches!(
        request,
        Request::Rpc { .. } | Request::SchedulerStart { .. } | Request::SchedulerStop | Request::SchedulerState
    )
}

async fn execute_detached(services: &Services, id: Option<u64>, request: Request) -> ServerFrame {
    match request {
        Request::Rpc {
            endpoint_key,
            command,
            args,
            kwargs,
        } => {
            let call = RpcCall::new(endpoint_key, command)
                .with_args(args)
                .with_kwargs(kwargs);
            ServerFrame::ok(id, services.gateway.dispatch(&call).await)
        }
        Request::SchedulerStart { doc } => reply(id, &services.scheduler.start(doc).await),
        Request::SchedulerStop => reply(id, &services.scheduler.stop().await),
        Request::SchedulerState => reply(id, &services.scheduler.state().await),
        other => {
            log::error!("Request {} cannot run detached", other.op());
            ServerFrame::error(id, status::INTERNAL, format!("{} cannot run detached", other.op()))
        }
    }
}

/// Run `work`, answering with a timeout error past `limit`.
async fn bounded(
    limit: Duration,
    id: Option<u64>,
    op: &str,
    work: impl Future<Output = ServerFrame>,
) -> ServerFrame {
    match tokio::time::timeout(limit, work).await {
        Ok(frame) => frame,
        Err(_) => {
            log::warn!("Request {op} timed out after {limit:?}");
            ServerFrame::error(id, status::INTERNAL, ProtocolError::Timeout.to_string())
        }
    }
}

fn reply<T: Serialize>(id: Option<u64>, body: &T) -> ServerFrame {
    match serde_json::to_value(body) {
        Ok(value) => ServerFrame::ok(id, value),
        Err(e) => ServerFrame::error(id, status::INTERNAL, e.to_string()),
    }
}

fn history_reply<T: Serialize>(id: Option<u64>, result: Result<T, HistoryError>) -> ServerFrame {
    match result {
        Ok(body) => reply(id, &body),
        Err(HistoryError::Conflict { current_revision }) => ServerFrame::conflict(id, current_revision),
        Err(HistoryError::Store(e)) => {
            log::error!("History persistence failed: {e}");
            ServerFrame::error(id, status::INTERNAL, e.to_string())
        }
        Err(e @ HistoryError::Interrupted(_)) => {
            log::error!("{e}");
            ServerFrame::error(id, status::INTERNAL, e.to_string())
        }
    }
}

fn store_reply<T: Serialize>(id: Option<u64>, result: Result<T, StoreError>) -> ServerFrame {
    match result {
        Ok(body) => reply(id, &body),
        Err(StoreError::Invalid(message)) => ServerFrame::error(id, status::BAD_REQUEST, message),
        Err(e) => {
            log::error!("Store write failed: {e}");
            ServerFrame::error(id, status::INTERNAL, e.to_string())
        }
    }
}

/// `{"error": ...}` of a non-200 body, or the whole body as text.
pub(crate) fn error_text(body: &Value) -> String {
    match body.get("error") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::DEFAULT_RPC_TIMEOUT;
    use crate::scheduler::SchedulerConfig;

    fn services() -> Services {
        let history = Arc::new(HistoryEngine::in_memory());
        let gateway = Arc::new(RpcGateway::new(Arc::new(EndpointRegistry::in_memory()), DEFAULT_RPC_TIMEOUT));
        let scheduler = Arc::new(ChannelScheduler::new(
            history.clone(),
            gateway.clone(),
            SchedulerConfig::default(),
        ));
        Services {
            history,
            gateway,
            scheduler,
        }
    }

    fn connection() -> Connection {
        Connection {
            services: services(),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            request_timeout: Duration::from_secs(5),
            event_capacity: 16,
        }
    }

    fn status_of(frame: &ServerFrame) -> u16 {
        match frame {
            ServerFrame::Response { status, .. } => *status,
            ServerFrame::Event { .. } => panic!("unexpected event"),
        }
    }

    fn body_of(frame: ServerFrame) -> Value {
        match frame {
            ServerFrame::Response { body, .. } => body,
            ServerFrame::Event { .. } => panic!("unexpected event"),
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = StateServer::new(ServerConfig::default(), services());
        assert_eq!(server.stats().await, ServerStats::default());
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_services_from_config_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LabConfig::default();
        config.storage.data_dir = Some(dir.path().to_path_buf());
        config.history.max_history = 2;

        let services = Services::from_config(&config).await;
        assert_eq!(services.history.max_history(), 2);
        services.history.mutate("1", 0, json!(1)).await.unwrap();
        assert!(dir.path().join("data.json").exists());
        assert!(dir.path().join("page_history.json").exists());
        assert_eq!(services.gateway.default_timeout(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_mutate_conflict_and_validation_statuses() {
        let conn = connection();
        let (tx, _rx) = mpsc::channel(4);
        let (reply_tx, _reply_rx) = mpsc::channel(4);
        let mut subs = HashMap::new();

        let ok = conn
            .handle_text(r#"{"id":1,"op":"mutate","doc":"1","baseRevision":0,"nextState":{"n":1}}"#, &tx, &reply_tx, &mut subs)
            .await
            .unwrap();
        assert_eq!(status_of(&ok), 200);
        assert_eq!(body_of(ok), json!({"revision": 1, "state": {"n": 1}}));

        let stale = conn
            .handle_text(r#"{"id":2,"op":"mutate","doc":"1","baseRevision":0,"nextState":{"n":2}}"#, &tx, &reply_tx, &mut subs)
            .await
            .unwrap();
        assert_eq!(stale, ServerFrame::conflict(Some(2), 1));

        let bad = conn
            .handle_text(r#"{"id":3,"op":"mutate","doc":"1","nextState":{"n":2}}"#, &tx, &reply_tx, &mut subs)
            .await
            .unwrap();
        assert_eq!(status_of(&bad), 400);
        assert_eq!(conn.services.history.read("1").await.revision, 1);
    }

    #[tokio::test]
    async fn test_subscribe_forwards_events() {
        let conn = connection();
        let (tx, mut rx) = mpsc::channel(4);
        let (reply_tx, _reply_rx) = mpsc::channel(4);
        let mut subs = HashMap::new();

        let snap = conn.handle_text(r#"{"id":1,"op":"subscribe","doc":"9"}"#, &tx, &reply_tx, &mut subs).await.unwrap();
        assert_eq!(body_of(snap), json!({"revision": 0, "state": null}));

        conn.services.history.mutate("9", 0, json!("x")).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event, ServerFrame::Event { doc: "9".into(), revision: 1, state: json!("x") });

        conn.handle_text(r#"{"id":2,"op":"unsubscribe","doc":"9"}"#, &tx, &reply_tx, &mut subs).await.unwrap();
        assert!(subs.is_empty());
    }

    #[tokio::test]
    async fn test_admin_ops() {
        let conn = connection();
        let (tx, _rx) = mpsc::channel(4);
        let (reply_tx, mut reply_rx) = mpsc::channel(4);
        let mut subs = HashMap::new();

        let pong = conn.handle_text(r#"{"id":1,"op":"ping"}"#, &tx, &reply_tx, &mut subs).await.unwrap();
        assert_eq!(body_of(pong), json!({"pong": true}));

        let title = conn
            .handle_text(r#"{"id":2,"op":"setPageTitle","doc":"3","title":"SpinCore"}"#, &tx, &reply_tx, &mut subs)
            .await
            .unwrap();
        assert_eq!(body_of(title), json!({"id": "3", "title": "SpinCore"}));

        let invalid = conn
            .handle_text(r#"{"id":3,"op":"setEndpoints","endpoints":{"k":{"baseAddress":"h"}}}"#, &tx, &reply_tx, &mut subs)
            .await
            .unwrap();
        assert_eq!(status_of(&invalid), 400);
        assert_eq!(error_text(&body_of(invalid)), "endpoint k invalid");

        conn
            .handle_text(r#"{"id":4,"op":"rpc","endpointKey":"nope","command":"c"}"#, &tx, &reply_tx, &mut subs)
            .await;
        let rpc = tokio::time::timeout(Duration::from_secs(1), reply_rx.recv()).await.unwrap().unwrap();
        assert_eq!(body_of(rpc), json!({"ok": false, "error": "endpoint 'nope' not configured"}));

        conn.handle_text(r#"{"id":5,"op":"schedulerState"}"#, &tx, &reply_tx, &mut subs).await;
        let state = tokio::time::timeout(Duration::from_secs(1), reply_rx.recv()).await.unwrap().unwrap();
        assert_eq!(body_of(state), json!({"running": false}));
    }
}
