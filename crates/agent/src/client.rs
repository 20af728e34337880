// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent-side WebSocket session.
//!
//! The runtime connects (directly or via the reconnection engine), declares
//! itself with `AGENT_CONNECT`, then heartbeats and executes commands
//! handed down by the control plane. Subprocess supervision is external;
//! commands run through the [`CommandRunner`] seam.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use switchboard::protocol::{
    self, AgentConnect, AgentHeartbeat, AckStatus, CommandAck, CommandComplete, CompletionStatus,
    Envelope, Message, OutputStream, TerminalChunk,
};

use crate::config::AgentConfig;
use crate::credential::{CredentialBackend, StoredCredentials};
use crate::identity::AgentIdentity;
use crate::reconnect::Connector;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A command as handed to the runner.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub command_id: String,
    pub command: String,
    pub args: Vec<String>,
}

/// Terminal state reported back as `COMMAND_COMPLETE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { exit_code: i32 },
    Failed { error: String },
    Cancelled,
}

/// Streams output chunks for one command with per-stream sequence numbers.
pub struct OutputSink {
    agent_id: String,
    command_id: String,
    tx: mpsc::UnboundedSender<Envelope>,
    stdout_seq: u64,
    stderr_seq: u64,
}

impl OutputSink {
    fn new(agent_id: String, command_id: String, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { agent_id, command_id, tx, stdout_seq: 0, stderr_seq: 0 }
    }

    pub fn stdout(&mut self, content: impl Into<String>) {
        self.emit(OutputStream::Stdout, content.into());
    }

    pub fn stderr(&mut self, content: impl Into<String>) {
        self.emit(OutputStream::Stderr, content.into());
    }

    fn emit(&mut self, stream: OutputStream, content: String) {
        let sequence = match stream {
            OutputStream::Stdout => {
                self.stdout_seq += 1;
                self.stdout_seq
            }
            OutputStream::Stderr => {
                self.stderr_seq += 1;
                self.stderr_seq
            }
        };
        let _ = self.tx.send(Envelope::new(Message::TerminalOutput(TerminalChunk {
            command_id: self.command_id.clone(),
            agent_id: self.agent_id.clone(),
            stream,
            content,
            sequence,
        })));
    }
}

/// Seam to the external process supervisor.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        request: RunRequest,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> RunOutcome;
}

/// Trivial runner used for drills and tests: echoes the command line.
pub struct EchoRunner;

#[async_trait]
impl CommandRunner for EchoRunner {
    async fn run(
        &self,
        request: RunRequest,
        mut sink: OutputSink,
        cancel: CancellationToken,
    ) -> RunOutcome {
        if cancel.is_cancelled() {
            return RunOutcome::Cancelled;
        }
        let mut line = request.command;
        for arg in &request.args {
            line.push(' ');
            line.push_str(arg);
        }
        line.push('\n');
        sink.stdout(line);
        RunOutcome::Completed { exit_code: 0 }
    }
}

/// Connector that establishes the socket and parks it for the session loop.
pub struct WsConnector {
    url: String,
    slot: Mutex<Option<WsStream>>,
}

impl WsConnector {
    pub fn new(url: String) -> Self {
        Self { url, slot: Mutex::new(None) }
    }

    pub fn take(&self) -> Option<WsStream> {
        self.slot.lock().take()
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> anyhow::Result<()> {
        let (stream, _) = connect_async(&self.url).await?;
        *self.slot.lock() = Some(stream);
        Ok(())
    }
}

/// Build the agent WS URL from the configured HTTP base.
pub fn agent_ws_url(base_url: &str, token: &str, agent_id: &str) -> String {
    let ws_base = if base_url.starts_with("https://") {
        base_url.replacen("https://", "wss://", 1)
    } else {
        base_url.replacen("http://", "ws://", 1)
    };
    format!("{ws_base}/ws/agent?token={token}&agentId={agent_id}")
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Server closed or the stream ended.
    Disconnected,
    /// Local shutdown was requested.
    Shutdown,
}

pub struct AgentSession {
    pub config: AgentConfig,
    pub identity: AgentIdentity,
    pub runner: Arc<dyn CommandRunner>,
    pub credentials: Arc<dyn CredentialBackend>,
    pub shutdown: CancellationToken,
}

impl AgentSession {
    /// Drive one established socket until it ends.
    pub async fn run(&self, stream: WsStream) -> anyhow::Result<SessionEnd> {
        let (mut sink, mut stream) = stream.split();

        let connect = Envelope::new(Message::AgentConnect(AgentConnect {
            agent_id: self.identity.id.clone(),
            name: Some(self.identity.name.clone()),
            agent_type: Some(self.identity.agent_type.clone()),
            version: Some(env!("CARGO_PKG_VERSION").to_owned()),
            capabilities: self.config.capabilities.clone(),
            metadata: serde_json::json!({
                "hostMachine": self.identity.metadata.host_machine,
                "platform": self.identity.metadata.platform,
            }),
        }));
        sink.send(WsMessage::Text(connect.encode()?.into())).await?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
        let running: Arc<Mutex<HashMap<String, CancellationToken>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let end = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break SessionEnd::Shutdown,
                _ = heartbeat.tick() => {
                    let beat = Envelope::new(Message::AgentHeartbeat(AgentHeartbeat {
                        agent_id: self.identity.id.clone(),
                    }));
                    if sink.send(WsMessage::Text(beat.encode()?.into())).await.is_err() {
                        break SessionEnd::Disconnected;
                    }
                }
                outbound = out_rx.recv() => {
                    let Some(envelope) = outbound else { break SessionEnd::Disconnected };
                    if sink.send(WsMessage::Text(envelope.encode()?.into())).await.is_err() {
                        break SessionEnd::Disconnected;
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(WsMessage::Text(text))) => {
                            self.handle_frame(text.as_str(), &out_tx, &running);
                        }
                        Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                        Some(Ok(WsMessage::Close(_))) | None => break SessionEnd::Disconnected,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!(err = %e, "socket error");
                            break SessionEnd::Disconnected;
                        }
                    }
                }
            }
        };

        // Whatever is still running dies with the session.
        for (_, cancel) in running.lock().drain() {
            cancel.cancel();
        }
        Ok(end)
    }

    fn handle_frame(
        &self,
        text: &str,
        out_tx: &mpsc::UnboundedSender<Envelope>,
        running: &Arc<Mutex<HashMap<String, CancellationToken>>>,
    ) {
        let envelope = match protocol::decode(
            text,
            protocol::MAX_MESSAGE_BYTES,
            protocol::MAX_TIMESTAMP_SKEW_MS,
        ) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(err = %e, "undecodable frame from server");
                return;
            }
        };

        match envelope.message {
            Message::CommandRequest(request) => {
                let Some(command_id) = request.command_id else {
                    tracing::warn!("COMMAND_REQUEST without command id");
                    return;
                };
                self.start_command(command_id, request.command, request.args, out_tx, running);
            }
            Message::CommandCancel(cancel) => {
                if let Some(token) = running.lock().get(&cancel.command_id) {
                    tracing::info!(command_id = %cancel.command_id, reason = %cancel.reason, "cancelling command");
                    token.cancel();
                }
            }
            Message::EmergencyStop(stop) => {
                tracing::warn!(reason = %stop.reason, "emergency stop: terminating all commands");
                for (_, token) in running.lock().iter() {
                    token.cancel();
                }
            }
            Message::TokenRefresh(refresh) => {
                let credentials = StoredCredentials {
                    access_token: refresh.token,
                    refresh_token: None,
                    expires_at: refresh.expires_at,
                };
                if let Err(e) = self.credentials.store(&credentials) {
                    tracing::warn!(err = %e, "failed to persist rotated token");
                }
            }
            Message::ServerHeartbeat(_) => {}
            other => {
                tracing::debug!(kind = other.type_name(), "ignoring message");
            }
        }
    }

    fn start_command(
        &self,
        command_id: String,
        command: String,
        args: Vec<String>,
        out_tx: &mpsc::UnboundedSender<Envelope>,
        running: &Arc<Mutex<HashMap<String, CancellationToken>>>,
    ) {
        let cancel = CancellationToken::new();
        running.lock().insert(command_id.clone(), cancel.clone());

        let _ = out_tx.send(Envelope::new(Message::CommandAck(CommandAck {
            command_id: command_id.clone(),
            agent_id: self.identity.id.clone(),
            status: AckStatus::Executing,
        })));

        let runner = Arc::clone(&self.runner);
        let agent_id = self.identity.id.clone();
        let out_tx = out_tx.clone();
        let running = Arc::clone(running);
        tokio::spawn(async move {
            let sink = OutputSink::new(agent_id.clone(), command_id.clone(), out_tx.clone());
            let request =
                RunRequest { command_id: command_id.clone(), command, args };
            let outcome = tokio::select! {
                outcome = runner.run(request, sink, cancel.clone()) => outcome,
                _ = cancel.cancelled() => RunOutcome::Cancelled,
            };
            running.lock().remove(&command_id);

            let (status, exit_code, error) = match outcome {
                RunOutcome::Completed { exit_code } => {
                    let status = if exit_code == 0 {
                        CompletionStatus::Completed
                    } else {
                        CompletionStatus::Failed
                    };
                    (status, Some(exit_code), None)
                }
                RunOutcome::Failed { error } => (CompletionStatus::Failed, None, Some(error)),
                RunOutcome::Cancelled => (CompletionStatus::Cancelled, None, None),
            };
            let _ = out_tx.send(Envelope::new(Message::CommandComplete(CommandComplete {
                command_id,
                agent_id,
                status,
                exit_code,
                error,
            })));
        });
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
