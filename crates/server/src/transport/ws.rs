// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared WebSocket plumbing: token extraction, the writer task, and error
//! envelopes.
//!
//! Every connection runs two tasks: the reader (owned by the handler
//! module) and the writer spawned here. They share only the connection's
//! bounded outbound queue; the reader never blocks on the writer.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde::Deserialize;

use crate::error::ErrorCode;
use crate::protocol::{Envelope, ErrorPayload, Message};
use crate::registry::{Connection, Outbound};

/// Grace given to the writer to flush its queue after cancellation.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Query parameters accepted on WS upgrade paths.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    #[serde(rename = "agentId")]
    pub agent_id: Option<String>,
}

/// Token from the `token` query parameter or `Authorization: Bearer` header.
pub fn extract_token(query: &WsQuery, headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(ref token) = query.token {
        return Some(token.clone());
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

/// Queue an `ERROR` envelope on a connection.
pub fn send_error(
    connection: &Connection,
    code: ErrorCode,
    message: impl Into<String>,
    original_message_id: Option<String>,
) {
    connection.send(&Envelope::new(Message::Error(ErrorPayload {
        code: code.as_str().to_owned(),
        message: message.into(),
        recoverable: code.recoverable(),
        original_message_id,
    })));
}

/// Best-effort extraction of the envelope id from a raw frame, for
/// `ERROR.originalMessageId` on frames that failed to decode.
pub fn raw_message_id(text: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()?
        .get("id")?
        .as_str()
        .map(str::to_owned)
}

/// Writer task: drain the outbound queue into the socket until cancelled
/// or the peer goes away. On cancellation, flushes briefly and closes.
pub async fn run_writer(connection: Arc<Connection>, mut sink: SplitSink<WebSocket, WsMessage>) {
    loop {
        let item = tokio::select! {
            _ = connection.cancel.cancelled() => break,
            item = connection.outbound.pop() => item,
        };
        match item {
            Outbound::Frame(json) => {
                if sink.send(WsMessage::Text(json.to_string().into())).await.is_err() {
                    return;
                }
            }
            Outbound::Ping => {
                if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
            }
            Outbound::Close(code) => {
                let _ = sink
                    .send(WsMessage::Close(Some(CloseFrame { code, reason: "".into() })))
                    .await;
                return;
            }
        }
    }

    // Cancelled: drain what is already queued, bounded by the grace period.
    let drain = async {
        for item in connection.outbound.drain_now() {
            match item {
                Outbound::Frame(json) => {
                    if sink.send(WsMessage::Text(json.to_string().into())).await.is_err() {
                        return;
                    }
                }
                Outbound::Close(code) => {
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame { code, reason: "".into() })))
                        .await;
                    return;
                }
                Outbound::Ping => {}
            }
        }
        let _ = sink
            .send(WsMessage::Close(Some(CloseFrame {
                code: crate::error::close::NORMAL,
                reason: "".into(),
            })))
            .await;
    };
    if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
        let dropped = connection.outbound.len();
        if dropped > 0 {
            tracing::debug!(conn_id = %connection.id, dropped, "writer drain grace elapsed");
        }
    }
}

/// Close an upgraded socket with a code before any connection was
/// registered (auth failure, missing init).
pub async fn close_socket(socket: WebSocket, code: u16, reason: &str) {
    let mut socket = socket;
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame { code, reason: reason.to_owned().into() })))
        .await;
}

/// Send one envelope directly on a raw socket (pre-registration errors).
pub async fn send_direct(socket: &mut WebSocket, envelope: &Envelope) {
    if let Ok(json) = envelope.encode() {
        let _ = socket.send(WsMessage::Text(json.into())).await;
    }
}
