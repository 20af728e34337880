// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! REST surface adjacent to the WebSocket hub.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::auth::permission::{allowed, Action};
use crate::auth::token::Claims;
use crate::command::ExecutionConstraints;
use crate::dispatch::Submission;
use crate::error::ErrorCode;
use crate::state::ServerState;
use crate::store::AuditEntry;

/// `GET /agents` — all known agents.
pub async fn list_agents(State(state): State<Arc<ServerState>>) -> Response {
    match state.store.list_agents().await {
        Ok(agents) => Json(agents).into_response(),
        Err(e) => ErrorCode::Internal.to_http_response(e.to_string()).into_response(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentStatusResponse {
    id: String,
    status: String,
    last_ping: Option<u64>,
}

/// `GET /agents/{id}/status`.
pub async fn agent_status(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.get_agent(&id).await {
        Ok(Some(agent)) => Json(AgentStatusResponse {
            id: agent.id,
            status: agent.status.as_str().to_owned(),
            last_ping: agent.last_ping,
        })
        .into_response(),
        Ok(None) => ErrorCode::AgentNotFound.to_http_response("unknown agent").into_response(),
        Err(e) => ErrorCode::Internal.to_http_response(e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub constraints: ExecutionConstraints,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    command_id: String,
    agent_id: String,
    queue_position: usize,
}

/// `POST /agents/{id}/execute` — server-initiated enqueue path.
pub async fn execute_command(
    State(state): State<Arc<ServerState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(body): Json<ExecuteRequest>,
) -> Response {
    if !allowed(&claims.role, Action::CommandExecute) {
        state.audit.record(AuditEntry::now(
            crate::audit::event::PERMISSION_DENIED,
            claims.sub.clone(),
            uuid::Uuid::new_v4().to_string(),
            serde_json::json!({ "action": Action::CommandExecute.as_str(), "surface": "rest" }),
        ));
        return ErrorCode::PermissionDenied
            .to_http_response("command:execute required")
            .into_response();
    }

    let submission = Submission {
        command: body.command,
        args: body.args,
        agent_id: Some(id),
        priority: body.priority,
        constraints: body.constraints,
        user_id: claims.sub.clone(),
        connection_id: None,
    };
    match state.dispatcher.submit(submission).await {
        Ok(outcome) => Json(ExecuteResponse {
            command_id: outcome.command_id,
            agent_id: outcome.agent_id,
            queue_position: outcome.position,
        })
        .into_response(),
        Err(code) => code.to_http_response("submission failed").into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub token: String,
}

/// `POST /auth/verify` — token introspection for adjacent services.
pub async fn verify_token(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<VerifyRequest>,
) -> Json<serde_json::Value> {
    match state.auth.verify(&body.token) {
        Ok(claims) => Json(serde_json::json!({
            "valid": true,
            "user_id": claims.sub,
            "expires_at": claims.exp,
        })),
        Err(e) => Json(serde_json::json!({
            "valid": false,
            "error": e.error_code().as_str(),
        })),
    }
}

/// `GET /health/live`.
pub async fn health_live() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `GET /health/ready` — service-by-service readiness.
pub async fn health_ready(State(state): State<Arc<ServerState>>) -> Response {
    let store_ok = state.store.list_agents().await.is_ok();
    let registry = state.registry.stats();
    let body = serde_json::json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "services": {
            "store": if store_ok { "ok" } else { "unavailable" },
            "registry": { "connections": registry.total },
            "queue": { "depth": state.queue.total_len() },
        },
    });
    let status = if store_ok {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// `GET /stats` — operator counters.
pub async fn stats(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "registry": state.registry.stats(),
        "queueDepth": state.queue.total_len(),
        "broadcast": state.broadcaster.stats(),
    }))
}
