// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness: starts a real control plane on an ephemeral port and
//! drives it over real WebSockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use switchboard::auth::token::TokenKeys;
use switchboard::config::ServerConfig;
use switchboard::protocol::{
    DashboardInit, Envelope, Message, SubscriptionSpec, MAX_MESSAGE_BYTES, MAX_TIMESTAMP_SKEW_MS,
};
use switchboard::store::MemoryStore;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);
pub const SECRET: &str = "specs-shared-secret";

/// A running control plane plus handles the tests poke at directly.
pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<MemoryStore>,
    pub shutdown: CancellationToken,
    keys: TokenKeys,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Spec-default config with short deadlines where tests need speed.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
        auth_secret: SECRET.to_owned(),
        max_connections: 100,
        max_message_bytes: 1024 * 1024,
        timestamp_skew_ms: 300_000,
        heartbeat_interval_ms: 30_000,
        connection_timeout_ms: 60_000,
        liveness_sweep_ms: 200,
        agent_heartbeat_timeout_ms: 90_000,
        init_deadline_ms: 500,
        max_queue_length: 100,
        outbound_queue_depth: 256,
        max_sessions_per_user: 5,
        rate_limit_max: 1_000,
        rate_limit_window_ms: 60_000,
        rate_limit_block_ms: 2_000,
        dispatch_max_attempts: 3,
        cancel_deadline_ms: 700,
        rotation_threshold_secs: 60,
        token_ttl_secs: 3_600,
        compression_min_bytes: 1_024,
        compression: "off".to_owned(),
        audit_buffer_cap: 10_000,
        audit_flush_ms: 50,
        compaction_ms: 60_000,
    }
}

impl TestServer {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(test_config()).await
    }

    pub async fn start_with(config: ServerConfig) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let store = Arc::new(MemoryStore::new());
        let shutdown = CancellationToken::new();

        let server_store: Arc<dyn switchboard::store::Store> = store.clone();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) =
                switchboard::run_with(config, listener, server_store, server_shutdown).await
            {
                eprintln!("server exited: {e:#}");
            }
        });

        Ok(Self { addr, store, shutdown, keys: TokenKeys::new(SECRET.as_bytes()) })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self, path: &str, token: &str) -> String {
        format!("ws://{}{path}?token={token}", self.addr)
    }

    /// Mint a token signed with the server's secret.
    pub fn token(&self, sub: &str, role: &str) -> String {
        self.token_with_ttl(sub, role, 3_600)
    }

    pub fn token_with_ttl(&self, sub: &str, role: &str, ttl_secs: u64) -> String {
        self.keys.issue(sub, role, None, ttl_secs).map(|(token, _)| token).unwrap_or_default()
    }
}

/// Thin wrapper over a tungstenite socket speaking envelopes.
pub struct WsPeer {
    sink: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>,
    stream: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl WsPeer {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let (socket, _) = connect_async(url).await?;
        let (sink, stream) = socket.split();
        Ok(Self { sink, stream })
    }

    /// Send a message; returns the envelope id.
    pub async fn send(&mut self, message: Message) -> anyhow::Result<String> {
        let envelope = Envelope::new(message);
        let id = envelope.id.clone();
        self.sink.send(WsMessage::Text(envelope.encode()?.into())).await?;
        Ok(id)
    }

    /// Send raw text, for malformed-frame tests.
    pub async fn send_raw(&mut self, text: String) -> anyhow::Result<()> {
        self.sink.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    /// Receive decoded envelopes until `pick` returns `Some`, within the
    /// harness timeout. Frames that fail to decode are skipped.
    pub async fn recv_until<T>(
        &mut self,
        mut pick: impl FnMut(Envelope) -> Option<T>,
    ) -> anyhow::Result<T> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| anyhow::anyhow!("timed out waiting for message"))?;
            let frame = tokio::time::timeout(remaining, self.stream.next())
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for message"))?
                .ok_or_else(|| anyhow::anyhow!("socket closed"))?;
            match frame? {
                WsMessage::Text(text) => {
                    if let Ok(envelope) =
                        switchboard::protocol::decode(text.as_str(), MAX_MESSAGE_BYTES, MAX_TIMESTAMP_SKEW_MS)
                    {
                        if let Some(found) = pick(envelope) {
                            return Ok(found);
                        }
                    }
                }
                WsMessage::Close(_) => anyhow::bail!("socket closed"),
                _ => {}
            }
        }
    }

    /// Wait for the server to close the socket; returns the close code.
    pub async fn expect_close(&mut self) -> anyhow::Result<Option<u16>> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| anyhow::anyhow!("timed out waiting for close"))?;
            match tokio::time::timeout(remaining, self.stream.next())
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for close"))?
            {
                Some(Ok(WsMessage::Close(frame))) => {
                    return Ok(frame.map(|f| f.code.into()));
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Ok(None),
            }
        }
    }
}

/// Connect a dashboard: upgrade, send `DASHBOARD_INIT`, await the ack.
pub async fn connect_dashboard(
    server: &TestServer,
    user_id: &str,
    role: &str,
    subscriptions: SubscriptionSpec,
) -> anyhow::Result<WsPeer> {
    let token = server.token(user_id, role);
    let mut peer = WsPeer::connect(&server.ws_url("/ws/dashboard", &token)).await?;
    let init_id = peer
        .send(Message::DashboardInit(DashboardInit {
            user_id: user_id.to_owned(),
            subscriptions,
        }))
        .await?;
    peer.recv_until(|envelope| match envelope.message {
        Message::Ack(ack) if ack.original_message_id == init_id => Some(()),
        _ => None,
    })
    .await?;
    Ok(peer)
}

/// Connect an agent: upgrade, send `AGENT_CONNECT`, wait until the server
/// has the agent registered online.
pub async fn connect_agent(server: &TestServer, agent_id: &str) -> anyhow::Result<WsPeer> {
    let token = server.token(agent_id, "agent");
    let url = format!("{}&agentId={agent_id}", server.ws_url("/ws/agent", &token));
    let mut peer = WsPeer::connect(&url).await?;
    peer.send(Message::AgentConnect(switchboard::protocol::AgentConnect {
        agent_id: agent_id.to_owned(),
        name: Some(agent_id.to_owned()),
        agent_type: Some("claude".to_owned()),
        version: Some("0.1.0".to_owned()),
        capabilities: vec![],
        metadata: serde_json::json!({}),
    }))
    .await?;

    use switchboard::store::{AgentStatus, AgentStore};
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let online = server
            .store
            .get_agent(agent_id)
            .await?
            .is_some_and(|r| r.status == AgentStatus::Online);
        if online {
            return Ok(peer);
        }
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "agent {agent_id} never came online"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Subscription spec covering everything.
pub fn subscribe_all() -> SubscriptionSpec {
    SubscriptionSpec { agents: vec![], commands: vec![], traces: true, terminals: true }
}
