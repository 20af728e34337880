// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP/WebSocket transport: router assembly and REST bearer auth.

pub mod http;
pub mod ws;
pub mod ws_agent;
pub mod ws_dashboard;

use std::sync::Arc;

use axum::extract::State;
use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::ServerState;

/// Build the axum router for the control plane.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/ws/dashboard", get(ws_dashboard::ws_dashboard_handler))
        .route("/ws/agent", get(ws_agent::ws_agent_handler))
        .route("/auth/verify", post(http::verify_token))
        .route("/agents", get(http::list_agents))
        .route("/agents/{id}/status", get(http::agent_status))
        .route("/agents/{id}/execute", post(http::execute_command))
        .route("/health/live", get(http::health_live))
        .route("/health/ready", get(http::health_ready))
        .route("/stats", get(http::stats))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), auth_layer))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bearer auth for the REST surface.
///
/// Health probes and WebSocket upgrades are exempt; WS auth happens in the
/// upgrade handlers against the same verifier.
pub async fn auth_layer(
    State(state): State<Arc<ServerState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    // /auth/verify checks the token in its own body.
    if path.starts_with("/health/") || path.starts_with("/ws/") || path == "/auth/verify" {
        return next.run(req).await;
    }

    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return crate::error::ErrorCode::AuthFailed
            .to_http_response("missing bearer token")
            .into_response();
    };

    match state.auth.verify(token) {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(e) => {
            state.audit.record(crate::store::AuditEntry::now(
                crate::audit::event::AUTH_FAILURE,
                "unknown",
                uuid::Uuid::new_v4().to_string(),
                serde_json::json!({ "surface": "rest", "error": e.to_string() }),
            ));
            e.error_code().to_http_response(e.to_string()).into_response()
        }
    }
}
