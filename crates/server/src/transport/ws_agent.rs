// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `GET /ws/agent` — agent connections.
//!
//! An agent authenticates on upgrade, declares itself with `AGENT_CONNECT`
//! within the init deadline, and then streams heartbeats, acks, output, and
//! traces. A reconnect for the same agent id evicts the previous socket.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::StreamExt;

use crate::audit::event;
use crate::dispatch::DispatchEvent;
use crate::error::{close, ErrorCode};
use crate::protocol::{
    self, AgentConnect, AgentStatusUpdate, Envelope, Message, OutputStream, TokenRefresh,
};
use crate::registry::Connection;
use crate::state::ServerState;
use crate::store::{AgentRecord, AgentStatus, AuditEntry};

use super::ws::{close_socket, extract_token, raw_message_id, run_writer, send_error, WsQuery};

pub async fn ws_agent_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some(token) = extract_token(&query, &headers) else {
        return agent_unauthorized("missing token");
    };
    let claims = match state.auth.verify(&token) {
        Ok(claims) => claims,
        Err(e) => {
            state.audit.record(AuditEntry::now(
                event::AUTH_FAILURE,
                query.agent_id.as_deref().unwrap_or("unknown"),
                uuid::Uuid::new_v4().to_string(),
                serde_json::json!({ "surface": "ws_agent", "error": e.to_string() }),
            ));
            return agent_unauthorized(&e.to_string());
        }
    };

    let query_agent_id = query.agent_id.clone();
    ws.on_upgrade(move |socket| handle_agent(state, claims, query_agent_id, socket))
        .into_response()
}

fn agent_unauthorized(reason: &str) -> axum::response::Response {
    axum::http::Response::builder()
        .status(401)
        .body(axum::body::Body::from(reason.to_owned()))
        .unwrap_or_default()
        .into_response()
}

async fn handle_agent(
    state: Arc<ServerState>,
    claims: crate::auth::token::Claims,
    query_agent_id: Option<String>,
    mut socket: WebSocket,
) {
    let connect = tokio::time::timeout(
        state.config.init_deadline(),
        read_connect(&mut socket, &state),
    )
    .await
    .ok()
    .flatten();
    let Some(connect) = connect else {
        close_socket(socket, close::POLICY, "AGENT_CONNECT required").await;
        return;
    };
    if query_agent_id.as_deref().is_some_and(|q| q != connect.agent_id) {
        close_socket(socket, close::POLICY, "agentId mismatch").await;
        return;
    }
    let agent_id = connect.agent_id.clone();

    // Register; a prior socket for this agent is evicted and cancelled.
    let (connection, evicted) = match state.registry.add_agent(&agent_id) {
        Ok(pair) => pair,
        Err(_) => {
            close_socket(socket, close::POLICY, "connection cap").await;
            return;
        }
    };
    if let Some(old) = evicted {
        tracing::info!(agent_id = %agent_id, old_conn = %old.id, "agent reconnect evicted prior socket");
    }

    upsert_agent_record(&state, &connect).await;
    state.audit.record(AuditEntry::now(
        event::AUTH_SUCCESS,
        agent_id.clone(),
        connection.id.clone(),
        serde_json::json!({ "surface": "ws_agent", "version": connect.version }),
    ));
    state.broadcaster.broadcast(Message::AgentStatus(AgentStatusUpdate {
        agent_id: agent_id.clone(),
        status: AgentStatus::Online,
        last_ping: Some(crate::epoch_ms()),
    }));
    state.dispatcher.send(DispatchEvent::AgentConnected { agent_id: agent_id.clone() });

    if let Some((token, expires_at)) = state.auth.maybe_rotate(&claims) {
        connection.send(&Envelope::new(Message::TokenRefresh(TokenRefresh {
            token,
            expires_at,
        })));
    }

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(run_writer(Arc::clone(&connection), sink));

    // Per-(command, stream) sequence watermark; regressions are dropped so
    // downstream observers only ever see strictly increasing sequences.
    let mut sequences: HashMap<(String, OutputStream), u64> = HashMap::new();
    let mut clean_close = false;

    loop {
        let frame = tokio::select! {
            _ = connection.cancel.cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                connection.touch();
                handle_frame(&state, &agent_id, &connection, &mut sequences, &text).await;
            }
            Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Ping(_))) => connection.touch(),
            Some(Ok(WsMessage::Close(_))) => {
                clean_close = true;
                break;
            }
            None => break,
            Some(Ok(_)) => {}
            Some(Err(_)) => break,
        }
    }

    // If a replacement connection already took the agent index, this socket
    // was evicted: skip status writes that would clobber the newcomer.
    let evicted_by_replacement = state
        .registry
        .agent_connection(&agent_id)
        .is_some_and(|current| current.id != connection.id);
    state.registry.remove(&connection.id);
    let _ = writer.await;

    if !evicted_by_replacement {
        // Clean disconnects null the heartbeat so the liveness sweep skips
        // them; unclean ones keep it for diagnosis.
        let last_ping = if clean_close { None } else { Some(crate::epoch_ms()) };
        let _ = state.store.set_agent_status(&agent_id, AgentStatus::Offline, last_ping).await;
        state.dispatcher.send(DispatchEvent::AgentDisconnected { agent_id: agent_id.clone() });
        state.broadcaster.broadcast(Message::AgentStatus(AgentStatusUpdate {
            agent_id: agent_id.clone(),
            status: AgentStatus::Offline,
            last_ping,
        }));
    }
    tracing::debug!(agent_id = %agent_id, clean = clean_close, "agent disconnected");
}

async fn read_connect(socket: &mut WebSocket, state: &ServerState) -> Option<AgentConnect> {
    loop {
        let frame = socket.recv().await?;
        match frame {
            Ok(WsMessage::Text(text)) => {
                let envelope = protocol::decode(
                    &text,
                    state.config.max_message_bytes,
                    state.config.timestamp_skew_ms,
                )
                .ok()?;
                return match envelope.message {
                    Message::AgentConnect(connect) if !connect.agent_id.is_empty() => {
                        Some(connect)
                    }
                    _ => None,
                };
            }
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => continue,
            _ => return None,
        }
    }
}

/// Create the agent record on first connect, update it afterwards.
async fn upsert_agent_record(state: &ServerState, connect: &AgentConnect) {
    let now = crate::epoch_ms();
    let existing = state.store.get_agent(&connect.agent_id).await.ok().flatten();
    let record = match existing {
        Some(mut record) => {
            record.status = AgentStatus::Online;
            record.last_ping = Some(now);
            record.capabilities = connect.capabilities.clone();
            record.version = connect.version.clone();
            record.updated_at = now;
            record
        }
        None => AgentRecord {
            id: connect.agent_id.clone(),
            name: connect.name.clone().unwrap_or_else(|| connect.agent_id.clone()),
            agent_type: connect.agent_type.clone().unwrap_or_else(|| "unknown".to_owned()),
            status: AgentStatus::Online,
            last_ping: Some(now),
            capabilities: connect.capabilities.clone(),
            version: connect.version.clone(),
            created_at: now,
            updated_at: now,
        },
    };
    if let Err(e) = state.store.upsert_agent(record).await {
        tracing::warn!(agent_id = %connect.agent_id, err = %e, "agent upsert failed");
    }
}

async fn handle_frame(
    state: &ServerState,
    agent_id: &str,
    connection: &Arc<Connection>,
    sequences: &mut HashMap<(String, OutputStream), u64>,
    text: &str,
) {
    let envelope = match protocol::decode(
        text,
        state.config.max_message_bytes,
        state.config.timestamp_skew_ms,
    ) {
        Ok(envelope) => envelope,
        Err(e) => {
            send_error(connection, ErrorCode::ValidationFailed, e.to_string(), raw_message_id(text));
            return;
        }
    };

    match envelope.message {
        Message::AgentHeartbeat(heartbeat) => {
            if heartbeat.agent_id != agent_id {
                send_error(
                    connection,
                    ErrorCode::ValidationFailed,
                    "heartbeat for another agent",
                    Some(envelope.id),
                );
                return;
            }
            let _ = state
                .store
                .set_agent_status(agent_id, AgentStatus::Online, Some(crate::epoch_ms()))
                .await;
        }
        Message::CommandAck(ack) => {
            state.dispatcher.send(DispatchEvent::Ack {
                command_id: ack.command_id,
                agent_id: agent_id.to_owned(),
                status: ack.status,
            });
        }
        Message::TerminalOutput(chunk) => {
            let key = (chunk.command_id.clone(), chunk.stream);
            if sequences.get(&key).is_some_and(|&last| chunk.sequence <= last) {
                tracing::warn!(
                    command_id = %chunk.command_id,
                    sequence = chunk.sequence,
                    "out-of-order output chunk dropped"
                );
                return;
            }
            sequences.insert(key, chunk.sequence);
            state.broadcaster.broadcast(Message::TerminalStream(chunk));
        }
        Message::TraceEvent(trace) => {
            state.broadcaster.broadcast(Message::TraceUpdate(trace));
        }
        Message::CommandComplete(complete) => {
            state.dispatcher.send(DispatchEvent::Complete {
                command_id: complete.command_id,
                agent_id: agent_id.to_owned(),
                status: complete.status,
                exit_code: complete.exit_code,
                error: complete.error,
            });
        }
        Message::InvestigationReport(report) => {
            // Pass-through to the audit trail; the durable store owns the
            // report table itself.
            state.audit.record(AuditEntry::now(
                "investigation_report",
                agent_id.to_owned(),
                report.command_id.clone().unwrap_or_default(),
                serde_json::json!({ "title": report.title, "content": report.content }),
            ));
        }
        Message::AgentError(report) => {
            tracing::warn!(agent_id = %agent_id, message = %report.message, "agent error");
            let status = if report.fatal { AgentStatus::Error } else { AgentStatus::Online };
            let _ = state
                .store
                .set_agent_status(agent_id, status, Some(crate::epoch_ms()))
                .await;
            if report.fatal {
                state.broadcaster.broadcast(Message::AgentStatus(AgentStatusUpdate {
                    agent_id: agent_id.to_owned(),
                    status: AgentStatus::Error,
                    last_ping: Some(crate::epoch_ms()),
                }));
            }
        }
        other => {
            send_error(
                connection,
                ErrorCode::ValidationFailed,
                format!("unexpected {} from agent", other.type_name()),
                Some(envelope.id),
            );
        }
    }
}
