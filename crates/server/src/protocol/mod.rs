// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol: the `{id, type, timestamp, payload}` envelope, the closed
//! message set, and validation.
//!
//! Decoding yields an exhaustive [`Message`] variant so every handler is a
//! total match; unknown types are a schema violation, not a silent drop.

pub mod compress;

use serde::{Deserialize, Serialize};

use crate::command::ExecutionConstraints;
use crate::store::AgentStatus;

/// Hard cap on serialized message size.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Tolerated skew between an envelope timestamp and the local clock.
pub const MAX_TIMESTAMP_SKEW_MS: u64 = 5 * 60 * 1000;

/// Standard message wrapper. `type` and `payload` live in [`Message`] and
/// are flattened into the same JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub timestamp: u64,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    /// Wrap a message with a fresh id and the current clock.
    pub fn new(message: Message) -> Self {
        Self { id: uuid::Uuid::new_v4().to_string(), timestamp: crate::epoch_ms(), message }
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::Schema(e.to_string()))
    }
}

/// The closed message-type set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    // Agent -> server.
    AgentConnect(AgentConnect),
    AgentHeartbeat(AgentHeartbeat),
    CommandAck(CommandAck),
    TerminalOutput(TerminalChunk),
    TraceEvent(Trace),
    CommandComplete(CommandComplete),
    InvestigationReport(InvestigationReport),
    AgentError(AgentErrorReport),

    // Server -> agent.
    CommandRequest(CommandRequest),
    CommandCancel(CommandCancel),
    AgentControl(AgentControl),
    TokenRefresh(TokenRefresh),
    ServerHeartbeat(ServerHeartbeat),

    // Server -> dashboard.
    AgentStatus(AgentStatusUpdate),
    CommandStatus(CommandStatusUpdate),
    TerminalStream(TerminalChunk),
    TraceUpdate(Trace),
    EmergencyStop(EmergencyStop),
    Ack(Ack),
    Error(ErrorPayload),

    // Dashboard -> server.
    DashboardInit(DashboardInit),
    Ping(Ping),
}

impl Message {
    /// Wire name of this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::AgentConnect(_) => "AGENT_CONNECT",
            Self::AgentHeartbeat(_) => "AGENT_HEARTBEAT",
            Self::CommandAck(_) => "COMMAND_ACK",
            Self::TerminalOutput(_) => "TERMINAL_OUTPUT",
            Self::TraceEvent(_) => "TRACE_EVENT",
            Self::CommandComplete(_) => "COMMAND_COMPLETE",
            Self::InvestigationReport(_) => "INVESTIGATION_REPORT",
            Self::AgentError(_) => "AGENT_ERROR",
            Self::CommandRequest(_) => "COMMAND_REQUEST",
            Self::CommandCancel(_) => "COMMAND_CANCEL",
            Self::AgentControl(_) => "AGENT_CONTROL",
            Self::TokenRefresh(_) => "TOKEN_REFRESH",
            Self::ServerHeartbeat(_) => "SERVER_HEARTBEAT",
            Self::AgentStatus(_) => "AGENT_STATUS",
            Self::CommandStatus(_) => "COMMAND_STATUS",
            Self::TerminalStream(_) => "TERMINAL_STREAM",
            Self::TraceUpdate(_) => "TRACE_UPDATE",
            Self::EmergencyStop(_) => "EMERGENCY_STOP",
            Self::Ack(_) => "ACK",
            Self::Error(_) => "ERROR",
            Self::DashboardInit(_) => "DASHBOARD_INIT",
            Self::Ping(_) => "PING",
        }
    }

    /// Heartbeats and pongs are exempt from rate limiting.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::AgentHeartbeat(_) | Self::ServerHeartbeat(_) | Self::Ping(_))
    }
}

// -- Payloads ------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConnect {
    pub agent_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHeartbeat {
    pub agent_id: String,
}

/// `COMMAND_ACK` status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Executing,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAck {
    pub command_id: String,
    pub agent_id: String,
    pub status: AckStatus,
}

/// Stdout/stderr stream tag for output chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Output chunk payload, shared by `TERMINAL_OUTPUT` (agent-side) and
/// `TERMINAL_STREAM` (dashboard-side).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalChunk {
    pub command_id: String,
    pub agent_id: String,
    pub stream: OutputStream,
    pub content: String,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceKind {
    Request,
    Response,
    Error,
}

/// LLM trace payload, shared by `TRACE_EVENT` and `TRACE_UPDATE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub command_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub parent_trace_id: Option<String>,
    pub kind: TraceKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens_in: Option<u64>,
    #[serde(default)]
    pub tokens_out: Option<u64>,
    #[serde(default)]
    pub excerpt: Option<String>,
}

/// `COMMAND_COMPLETE` status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandComplete {
    pub command_id: String,
    pub agent_id: String,
    pub status: CompletionStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestigationReport {
    pub agent_id: String,
    #[serde(default)]
    pub command_id: Option<String>,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentErrorReport {
    pub agent_id: String,
    pub message: String,
    #[serde(default)]
    pub fatal: bool,
}

/// Command submission/dispatch payload. Dashboards omit `command_id`; the
/// server assigns one before the command reaches an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(default)]
    pub command_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub constraints: ExecutionConstraints,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandCancel {
    pub command_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentControl {
    pub agent_id: String,
    pub action: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRefresh {
    pub token: String,
    /// Epoch seconds.
    pub expires_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerHeartbeat {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusUpdate {
    pub agent_id: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub last_ping: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStatusUpdate {
    pub command_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub status: crate::command::CommandStatus,
    #[serde(default)]
    pub queue_position: Option<usize>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyStop {
    pub reason: String,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub original_message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_message_id: Option<String>,
}

/// Subscription intents sent in `DASHBOARD_INIT`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    /// Agent ids, or `["all"]` / empty for all agents.
    #[serde(default)]
    pub agents: Vec<String>,
    /// Command ids, or `["all"]` / empty for all commands.
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default = "default_true")]
    pub traces: bool,
    #[serde(default = "default_true")]
    pub terminals: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardInit {
    pub user_id: String,
    #[serde(default)]
    pub subscriptions: SubscriptionSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ping {}

// -- Decoding and validation ---------------------------------------------------

/// Codec failure, carried back to clients as `ERROR{VALIDATION_FAILED}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Payload does not conform to the schema for its type.
    Schema(String),
    /// Serialized size exceeds the cap.
    TooLarge { size: usize, max: usize },
    /// Envelope timestamp outside the skew window.
    ClockSkew { delta_ms: u64 },
    /// Compression wrapper problem (bad algorithm, nested, corrupt data).
    Compression(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schema(msg) => write!(f, "schema violation: {msg}"),
            Self::TooLarge { size, max } => write!(f, "message of {size} bytes exceeds {max}"),
            Self::ClockSkew { delta_ms } => write!(f, "timestamp skew of {delta_ms}ms"),
            Self::Compression(msg) => write!(f, "compression: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Decode and validate one inbound text frame.
///
/// Accepts either a plain envelope or a `compressed` wrapper. `max_bytes`
/// and `skew_ms` come from config; validation order is size, then schema,
/// then timestamp, so the cheapest check runs first.
pub fn decode(text: &str, max_bytes: usize, skew_ms: u64) -> Result<Envelope, CodecError> {
    if text.len() > max_bytes {
        return Err(CodecError::TooLarge { size: text.len(), max: max_bytes });
    }

    let text = match compress::unwrap_if_compressed(text)? {
        Some(inner) => {
            if inner.len() > max_bytes {
                return Err(CodecError::TooLarge { size: inner.len(), max: max_bytes });
            }
            std::borrow::Cow::Owned(inner)
        }
        None => std::borrow::Cow::Borrowed(text),
    };

    let envelope: Envelope =
        serde_json::from_str(&text).map_err(|e| CodecError::Schema(e.to_string()))?;

    validate_timestamp(envelope.timestamp, crate::epoch_ms(), skew_ms)?;
    Ok(envelope)
}

/// Reject timestamps further than `skew_ms` from `now`. The exact boundary
/// is accepted.
pub fn validate_timestamp(timestamp: u64, now: u64, skew_ms: u64) -> Result<(), CodecError> {
    let delta = now.abs_diff(timestamp);
    if delta > skew_ms {
        return Err(CodecError::ClockSkew { delta_ms: delta });
    }
    Ok(())
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
