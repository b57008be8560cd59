//! Test utilities and common setup.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use replbox::config::StorageConfig;
use replbox::{AppConfig, AppState, create_router};
use replbox_protocol::{ClientMessage, ServerMessage};
use replbox_storage::{MemoryStore, StorageMirror};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Config rooted in `root`, with `/bin/sh` as the shell.
pub fn test_config(root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.workspaces.root = root.join("workspaces");
    config.workspaces.templates_dir = root.join("templates");
    config.terminal.shell = "/bin/sh".to_string();
    config
}

pub fn storage_config() -> StorageConfig {
    StorageConfig {
        bucket: "test".to_string(),
        endpoint: None,
        region: None,
        base_prefix: "base".to_string(),
        code_prefix: "code".to_string(),
        mirror_writes: true,
    }
}

/// A workspace root with `proj1` populated and a `node` template.
pub fn test_tree() -> TempDir {
    let temp = TempDir::new().unwrap();
    let ws = temp.path().join("workspaces/proj1");
    std::fs::create_dir_all(ws.join("src")).unwrap();
    std::fs::write(ws.join("index.js"), "hello").unwrap();
    std::fs::write(ws.join("src/app.js"), "world").unwrap();
    std::fs::write(ws.join(".env"), "SECRET=1").unwrap();

    let template = temp.path().join("templates/node");
    std::fs::create_dir_all(template.join("src")).unwrap();
    std::fs::write(template.join("index.js"), "console.log('hi')").unwrap();
    std::fs::write(template.join("src/util.js"), "").unwrap();
    temp
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub temp: TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        let temp = test_tree();
        let state = AppState::new(test_config(temp.path()), None);
        Self::serve(temp, state).await
    }

    /// Start with a memory-backed storage mirror.
    pub async fn start_with_store(store: Arc<MemoryStore>) -> Self {
        let temp = test_tree();
        let mut config = test_config(temp.path());
        config.storage = Some(storage_config());
        let state = AppState::new(config, Some(StorageMirror::new(store)));
        Self::serve(temp, state).await
    }

    async fn serve(temp: TempDir, state: AppState) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state, temp }
    }

    pub fn workspace(&self, id: &str) -> PathBuf {
        self.temp.path().join("workspaces").join(id)
    }

    pub async fn connect(&self, query: &str) -> Client {
        let url = format!("ws://{}/ws{}", self.addr, query);
        let (client, _) = connect_async(url).await.unwrap();
        client
    }

    /// Connect to `room` and consume the `loaded` message.
    pub async fn open(&self, room: &str) -> (Client, ServerMessage) {
        let mut client = self.connect(&format!("?roomId={room}")).await;
        let loaded = next_message(&mut client).await;
        assert!(matches!(loaded, ServerMessage::Loaded { .. }), "{loaded:?}");
        (client, loaded)
    }
}

pub async fn send(client: &mut Client, message: &ClientMessage) {
    let text = serde_json::to_string(message).unwrap();
    client.send(Message::text(text)).await.unwrap();
}

pub async fn send_raw(client: &mut Client, text: &str) {
    client.send(Message::text(text)).await.unwrap();
}

/// Next server message, skipping control frames.
pub async fn next_message(client: &mut Client) -> ServerMessage {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<ServerMessage>(text.as_str()).unwrap();
                }
                Some(Ok(Message::Close(frame))) => panic!("connection closed: {frame:?}"),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a server message")
}

/// Skip messages until one matches `predicate`.
pub async fn next_matching(
    client: &mut Client,
    predicate: impl Fn(&ServerMessage) -> bool,
) -> ServerMessage {
    loop {
        let message = next_message(client).await;
        if predicate(&message) {
            return message;
        }
    }
}

/// Wait until `condition` holds, polling every 20ms.
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
