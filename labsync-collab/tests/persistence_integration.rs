//! Integration tests for on-disk state surviving a server restart.

use labsync_collab::client::StateClient;
use labsync_collab::config::LabConfig;
use labsync_collab::server::{Services, StateServer};
use labsync_collab::storage::{DocumentStore, EndpointRegistry, HistoryFile};
use labsync_core::{Endpoint, Snapshot};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Duration;

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct RunningServer {
    port: u16,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RunningServer {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        self.task.await.unwrap();
    }
}

async fn start_server(data_dir: &Path) -> RunningServer {
    let port = free_port().await;
    let mut config = LabConfig::default();
    config.server.bind_addr = format!("127.0.0.1:{port}");
    config.storage.data_dir = Some(data_dir.to_path_buf());
    config.history.max_history = 5;

    let services = Services::from_config(&config).await;
    let server = StateServer::new(config.server.clone(), services);
    let (shutdown, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        server
            .run_until(async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    RunningServer { port, shutdown, task }
}

async fn client_for(port: u16) -> StateClient {
    let mut client = StateClient::new(format!("ws://127.0.0.1:{port}"));
    client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn test_documents_and_history_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let server = start_server(dir.path()).await;
    let client = client_for(server.port).await;
    client.mutate("1", 0, json!({"v": 1})).await.unwrap();
    client.mutate("1", 1, json!({"v": 2})).await.unwrap();
    client.mutate("1", 2, json!({"v": 3})).await.unwrap();
    client.undo("1").await.unwrap();
    client.set_page_title("1", "Laser table").await.unwrap();
    drop(client);
    server.stop().await;

    let server = start_server(dir.path()).await;
    let client = client_for(server.port).await;

    assert_eq!(client.read("1").await.unwrap(), Snapshot::new(2, json!({"v": 2})));
    let info = client.history_info("1").await.unwrap();
    assert_eq!(info.length, 4);
    assert!(info.can_redo);

    // Redo branch is still there after the restart
    let redone = client.redo("1").await.unwrap();
    assert_eq!(redone, Snapshot::new(3, json!({"v": 3})));

    let pages = client.list_pages().await.unwrap();
    assert!(pages.iter().any(|p| p.id == "1" && p.title == "Laser table"));
    server.stop().await;
}

#[tokio::test]
async fn test_history_cap_applies_to_persisted_records() {
    let dir = tempfile::tempdir().unwrap();

    let server = start_server(dir.path()).await;
    let client = client_for(server.port).await;
    for i in 0..10u64 {
        client.mutate("cap", i, json!({ "i": i })).await.unwrap();
    }
    server.stop().await;

    let records = HistoryFile::new(dir.path()).load().await;
    let record = &records["cap"];
    assert_eq!(record.info().length, 6);
    assert_eq!(record.current(), &json!({"i": 9}));
}

#[tokio::test]
async fn test_endpoints_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let server = start_server(dir.path()).await;
    let client = client_for(server.port).await;
    let mut endpoints = BTreeMap::new();
    endpoints.insert(
        "usb3104 digital".to_string(),
        Endpoint::new("http://10.0.0.5:8000", "USB3104"),
    );
    client.set_endpoints(&endpoints).await.unwrap();
    server.stop().await;

    let registry = EndpointRegistry::open(dir.path()).await;
    assert_eq!(registry.list().await, endpoints);

    let server = start_server(dir.path()).await;
    let client = client_for(server.port).await;
    assert_eq!(client.list_endpoints().await.unwrap(), endpoints);
    server.stop().await;
}

#[tokio::test]
async fn test_store_written_by_server_is_readable_directly() {
    let dir = tempfile::tempdir().unwrap();

    let server = start_server(dir.path()).await;
    let client = client_for(server.port).await;
    client.mutate("42", 0, json!({"HighFinesse": {"State": [1, 0]}})).await.unwrap();
    server.stop().await;

    let store = DocumentStore::open(dir.path()).await;
    assert_eq!(store.get("42").await, Some(json!({"HighFinesse": {"State": [1, 0]}})));
}
