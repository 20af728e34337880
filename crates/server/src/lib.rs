// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Switchboard: real-time control plane for a fleet of AI coding agents.
//!
//! Dashboards and agents connect over WebSockets; commands flow through a
//! per-agent priority queue and a single dispatcher loop; output and status
//! fan out to subscribed dashboards.

pub mod audit;
pub mod auth;
pub mod broadcast;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod estop;
pub mod events;
pub mod liveness;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod state;
pub mod store;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::state::ServerState;
use crate::store::{MemoryStore, Store};

/// Run the control plane until shutdown, with the default in-memory store.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    run_with(config, listener, store, CancellationToken::new()).await
}

/// Run against a caller-provided listener, store, and shutdown token.
/// This is the entry point the specs harness uses.
pub async fn run_with(
    config: ServerConfig,
    listener: TcpListener,
    store: Arc<dyn Store>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let state = ServerState::new(config, store, shutdown.clone());

    liveness::spawn_socket_sweeper(Arc::clone(&state));
    liveness::spawn_agent_sweeper(Arc::clone(&state));
    spawn_compactor(Arc::clone(&state));

    let addr = listener.local_addr()?;
    tracing::info!("switchboard listening on {addr}");

    let router = transport::build_router(Arc::clone(&state));
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    state.registry.close_all();
    Ok(())
}

/// Periodic compaction of the blacklist and rate-limit maps.
fn spawn_compactor(state: Arc<ServerState>) {
    let interval = state.config.compaction_interval();
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            let blacklist = state.auth.blacklist.compact();
            let rate = state.auth.rate_limiter.compact();
            if blacklist + rate > 0 {
                tracing::debug!(blacklist, rate, "compacted auth maps");
            }
        }
    });
}

/// Current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
