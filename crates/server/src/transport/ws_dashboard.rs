// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `GET /ws/dashboard` — dashboard connections.
//!
//! The peer must authenticate on upgrade and send `DASHBOARD_INIT` within
//! the init deadline, or the socket closes with 1008.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::StreamExt;

use crate::audit::event;
use crate::auth::permission::{allowed, Action};
use crate::auth::rate_limit::RateDecision;
use crate::auth::session::{fingerprint, Session};
use crate::auth::token::Claims;
use crate::dispatch::{DispatchEvent, Submission};
use crate::error::{close, ErrorCode};
use crate::protocol::{self, Ack, DashboardInit, Envelope, Message, TokenRefresh};
use crate::registry::{Connection, Outbound};
use crate::state::ServerState;
use crate::store::AuditEntry;

use super::ws::{
    close_socket, extract_token, raw_message_id, run_writer, send_direct, send_error, WsQuery,
};

pub async fn ws_dashboard_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some(token) = extract_token(&query, &headers) else {
        return unauthorized_response("missing token");
    };
    let claims = match state.auth.verify(&token) {
        Ok(claims) => claims,
        Err(e) => {
            state.audit.record(AuditEntry::now(
                event::AUTH_FAILURE,
                "unknown",
                uuid::Uuid::new_v4().to_string(),
                serde_json::json!({ "surface": "ws_dashboard", "error": e.to_string() }),
            ));
            return unauthorized_response(&e.to_string());
        }
    };

    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_owned();
    let print = fingerprint(&addr.ip().to_string(), &user_agent);

    ws.on_upgrade(move |socket| handle_dashboard(state, claims, print, socket))
        .into_response()
}

fn unauthorized_response(reason: &str) -> axum::response::Response {
    axum::http::Response::builder()
        .status(401)
        .body(axum::body::Body::from(reason.to_owned()))
        .unwrap_or_default()
        .into_response()
}

async fn handle_dashboard(
    state: Arc<ServerState>,
    claims: Claims,
    print: String,
    mut socket: WebSocket,
) {
    // The client has the init deadline to declare itself.
    let init = tokio::time::timeout(state.config.init_deadline(), read_init(&mut socket, &state))
        .await
        .ok()
        .flatten();
    let Some((init, init_envelope_id)) = init else {
        close_socket(socket, close::POLICY, "DASHBOARD_INIT required").await;
        return;
    };
    if init.user_id != claims.sub {
        close_socket(socket, close::POLICY, "user mismatch").await;
        return;
    }

    // Session registration; exceeding the cap revokes the oldest.
    let session_id =
        claims.session_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    if state.auth.sessions.fingerprint_changed(&claims.sub, &session_id, &print) {
        state.audit.record(AuditEntry::now(
            event::SESSION_ANOMALY,
            claims.sub.clone(),
            session_id.clone(),
            serde_json::json!({ "fingerprint": print }),
        ));
    }
    let evicted = state.auth.sessions.register(Session {
        user_id: claims.sub.clone(),
        session_id: session_id.clone(),
        token_id: claims.jti.clone(),
        issued_at: claims.iat,
        expires_at: claims.exp,
        fingerprint: print,
    });
    if let Some(evicted) = evicted {
        state.auth.blacklist.insert(&evicted.token_id, evicted.expires_at);
        state.audit.record(AuditEntry::now(
            event::SESSION_INVALIDATED,
            evicted.user_id.clone(),
            evicted.session_id.clone(),
            serde_json::json!({ "reason": "session_cap" }),
        ));
    }

    let connection = match state.registry.add_dashboard(&claims.sub) {
        Ok(connection) => connection,
        Err(_) => {
            send_direct(
                &mut socket,
                &Envelope::new(Message::Error(protocol::ErrorPayload {
                    code: ErrorCode::ResourceExhausted.as_str().to_owned(),
                    message: "connection cap reached".to_owned(),
                    recoverable: true,
                    original_message_id: None,
                })),
            )
            .await;
            close_socket(socket, close::POLICY, "connection cap").await;
            state.auth.sessions.remove(&claims.sub, &session_id);
            return;
        }
    };
    *connection.filter.lock() = init.subscriptions.clone().into();

    state.audit.record(AuditEntry::now(
        event::AUTH_SUCCESS,
        claims.sub.clone(),
        connection.id.clone(),
        serde_json::json!({ "surface": "ws_dashboard", "sessionId": session_id }),
    ));

    // Confirm the init, then rotate the token in-band if it is near expiry.
    connection.send(&Envelope::new(Message::Ack(Ack {
        original_message_id: init_envelope_id,
    })));
    if let Some((token, expires_at)) = state.auth.maybe_rotate(&claims) {
        connection.send(&Envelope::new(Message::TokenRefresh(TokenRefresh {
            token,
            expires_at,
        })));
        state.audit.record(AuditEntry::now(
            event::TOKEN_ROTATED,
            claims.sub.clone(),
            connection.id.clone(),
            serde_json::json!({ "surface": "ws_dashboard" }),
        ));
    }

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(run_writer(Arc::clone(&connection), sink));

    // Reader loop.
    loop {
        let frame = tokio::select! {
            _ = connection.cancel.cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                connection.touch();
                handle_frame(&state, &claims, &connection, &text).await;
            }
            Some(Ok(WsMessage::Pong(_))) => connection.touch(),
            Some(Ok(WsMessage::Ping(_))) => connection.touch(),
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(_)) => break,
        }
    }

    // Cleanup. Removal is idempotent; the sweeper may have beaten us here.
    state.registry.remove(&connection.id);
    state.auth.sessions.remove(&claims.sub, &session_id);
    let _ = writer.await;
    tracing::debug!(conn_id = %connection.id, user_id = %claims.sub, "dashboard disconnected");
}

/// Read frames until a valid `DASHBOARD_INIT` arrives. Returns the payload
/// and the envelope id to acknowledge. Non-init frames are a protocol
/// violation at this stage.
async fn read_init(
    socket: &mut WebSocket,
    state: &ServerState,
) -> Option<(DashboardInit, String)> {
    loop {
        let frame = socket.recv().await?;
        match frame {
            Ok(WsMessage::Text(text)) => {
                let envelope = match protocol::decode(
                    &text,
                    state.config.max_message_bytes,
                    state.config.timestamp_skew_ms,
                ) {
                    Ok(envelope) => envelope,
                    Err(_) => return None,
                };
                return match envelope.message {
                    Message::DashboardInit(init) => Some((init, envelope.id)),
                    _ => None,
                };
            }
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => continue,
            _ => return None,
        }
    }
}

async fn handle_frame(
    state: &ServerState,
    claims: &Claims,
    connection: &Arc<Connection>,
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

    // Count everything except heartbeats against the rate limit.
    if !envelope.message.is_heartbeat() {
        if let RateDecision::Blocked { until } = state.auth.rate_limiter.check(&claims.sub) {
            state.audit.record(AuditEntry::now(
                event::RATE_LIMIT,
                claims.sub.clone(),
                envelope.id.clone(),
                serde_json::json!({ "blockedUntil": until }),
            ));
            send_error(
                connection,
                ErrorCode::RateLimit,
                "rate limit exceeded",
                Some(envelope.id),
            );
            return;
        }
    }

    match envelope.message {
        Message::Ping(_) => {
            connection.send(&Envelope::new(Message::Ack(Ack {
                original_message_id: envelope.id,
            })));
        }
        Message::CommandRequest(request) => {
            if !permitted(state, claims, connection, Action::CommandExecute, &envelope.id) {
                return;
            }
            let submission = Submission {
                command: request.command,
                args: request.args,
                agent_id: request.agent_id,
                priority: request.priority,
                constraints: request.constraints,
                user_id: claims.sub.clone(),
                connection_id: Some(connection.id.clone()),
            };
            match state.dispatcher.submit(submission).await {
                Ok(_) => {
                    connection.send(&Envelope::new(Message::Ack(Ack {
                        original_message_id: envelope.id,
                    })));
                }
                Err(code) => {
                    send_error(connection, code, "submission failed", Some(envelope.id));
                }
            }
        }
        Message::CommandCancel(cancel) => {
            if !permitted(state, claims, connection, Action::AgentControl, &envelope.id) {
                return;
            }
            state.dispatcher.send(DispatchEvent::Interrupt {
                command_id: cancel.command_id,
                reason: cancel.reason,
            });
            connection.send(&Envelope::new(Message::Ack(Ack {
                original_message_id: envelope.id,
            })));
        }
        Message::EmergencyStop(stop) => {
            if !permitted(state, claims, connection, Action::EmergencyStop, &envelope.id) {
                return;
            }
            let summary =
                state.dispatcher.emergency_stop(stop.reason, claims.sub.clone()).await;
            tracing::warn!(
                user_id = %claims.sub,
                agents = summary.agents_stopped,
                commands = summary.commands_cancelled,
                "emergency stop triggered from dashboard"
            );
            connection.send(&Envelope::new(Message::Ack(Ack {
                original_message_id: envelope.id,
            })));
        }
        other => {
            send_error(
                connection,
                ErrorCode::ValidationFailed,
                format!("unexpected {} from dashboard", other.type_name()),
                Some(envelope.id),
            );
        }
    }
}

fn permitted(
    state: &ServerState,
    claims: &Claims,
    connection: &Connection,
    action: Action,
    envelope_id: &str,
) -> bool {
    if allowed(&claims.role, action) {
        return true;
    }
    state.audit.record(AuditEntry::now(
        event::PERMISSION_DENIED,
        claims.sub.clone(),
        envelope_id.to_owned(),
        serde_json::json!({ "action": action.as_str(), "role": claims.role }),
    ));
    send_error(
        connection,
        ErrorCode::PermissionDenied,
        format!("role {} may not {}", claims.role, action.as_str()),
        Some(envelope_id.to_owned()),
    );
    // Permission denials terminate the connection per the auth taxonomy.
    connection.outbound.push(Outbound::Close(close::POLICY));
    connection.cancel.cancel();
    false
}
