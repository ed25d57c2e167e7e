//! Shared test harness: spins up the real router on an ephemeral port and
//! drives it with a JSON-speaking WebSocket client, the same shape as the
//! teacher's `tests/common/mod.rs`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use inkwell_server::config::ServerConfig;
use inkwell_server::hub::Hub;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub struct JsonSocket(WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>);

impl JsonSocket {
    pub async fn send(&mut self, msg: &Value) {
        self.0.send(Message::Text(msg.to_string().into())).await.unwrap();
    }

    /// Send raw, possibly-malformed text, bypassing JSON serialization.
    pub async fn send_raw(&mut self, text: &str) {
        self.0.send(Message::Text(text.to_string().into())).await.unwrap();
    }

    pub async fn recv(&mut self) -> Result<Value> {
        loop {
            let msg = self.0.next().await.ok_or_else(|| anyhow!("websocket closed"))??;
            match msg {
                Message::Text(text) => return Ok(serde_json::from_str(&text)?),
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => return Err(anyhow!("websocket closed by peer")),
                other => return Err(anyhow!("unexpected message: {other:?}")),
            }
        }
    }

    pub async fn recv_closed(&mut self) -> Result<u16> {
        loop {
            match self.0.next().await {
                Some(Ok(Message::Close(Some(frame)))) => return Ok(frame.code.into()),
                Some(Ok(Message::Close(None))) => return Ok(1000),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Err(anyhow!("connection ended without a close frame")),
            }
        }
    }
}

pub struct TestServer {
    client: reqwest::Client,
    addr: SocketAddr,
    pub hub: Arc<Hub>,
}

impl TestServer {
    /// Start against a fresh, process-owned temp vault. Returns the server
    /// plus the `TempDir` so the caller can keep it alive across a
    /// simulated restart (dropping it deletes the vault).
    pub async fn start() -> Result<(Self, tempfile::TempDir)> {
        let storage = tempfile::tempdir()?;
        let server = Self::start_at(storage.path()).await?;
        Ok((server, storage))
    }

    /// Start (or restart) a server against an existing vault directory,
    /// simulating a process restart that reopens the same storage.
    pub async fn start_at(storage: &std::path::Path) -> Result<Self> {
        Self::start_with_config(ServerConfig { storage: storage.to_path_buf(), ..ServerConfig::default() }).await
    }

    /// Start against a fresh temp vault with a non-default transform
    /// window, for scenarios that depend on a small `W`.
    pub async fn start_with_window(transform_window: u64) -> Result<(Self, tempfile::TempDir)> {
        let storage = tempfile::tempdir()?;
        let config = ServerConfig { storage: storage.path().to_path_buf(), transform_window, ..ServerConfig::default() };
        let server = Self::start_with_config(config).await?;
        Ok((server, storage))
    }

    async fn start_with_config(config: ServerConfig) -> Result<Self> {
        let (router, hub) = inkwell_server::app(config);
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;
        tokio::spawn(axum::serve(listener, router).into_future());
        Ok(Self { client: reqwest::Client::new(), addr, hub })
    }

    pub async fn connect(&self, slug: &str) -> Result<JsonSocket> {
        let (socket, _) = connect_async(format!("ws://{}/api/ws?slug={slug}", self.addr)).await?;
        Ok(JsonSocket(socket))
    }

    pub async fn snapshot(&self, slug: &str) -> Result<Value> {
        let resp = self.client.get(format!("http://{}/api/snapshot?slug={slug}", self.addr)).send().await?;
        Ok(resp.json().await?)
    }
}
