// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Two-level liveness: socket ping/idle sweeper and the application-level
//! agent heartbeat scan.
//!
//! One timer task per level covers every connection; there are no
//! per-connection timers. The application scan exists for agents whose
//! socket looks alive while the process behind it has hung.

use std::sync::Arc;

use crate::audit::event;
use crate::dispatch::DispatchEvent;
use crate::protocol::{AgentStatusUpdate, Message};
use crate::registry::Outbound;
use crate::state::ServerState;
use crate::store::{AgentStatus, AuditEntry};

/// Spawn the socket-level sweeper: ping live connections on each tick and
/// remove those idle past the connection timeout.
pub fn spawn_socket_sweeper(state: Arc<ServerState>) {
    let interval = state.config.heartbeat_interval();
    let timeout_ms = state.config.connection_timeout_ms;

    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }

            let now = crate::epoch_ms();
            for connection in state.registry.all(None) {
                let idle = now.saturating_sub(connection.last_activity());
                if idle > timeout_ms {
                    tracing::warn!(
                        conn_id = %connection.id,
                        principal = %connection.principal,
                        idle_ms = idle,
                        "connection timed out"
                    );
                    state.registry.remove(&connection.id);
                    state.audit.record(AuditEntry::now(
                        event::CONNECTION_TIMEOUT,
                        connection.principal.clone(),
                        connection.id.clone(),
                        serde_json::json!({ "idleMs": idle }),
                    ));
                    // The reader task observes the cancelled token and runs
                    // its own disconnect cleanup.
                } else {
                    connection.outbound.push(Outbound::Ping);
                }
            }
        }
    });
}

/// Spawn the application-level heartbeat scan over the agent table.
pub fn spawn_agent_sweeper(state: Arc<ServerState>) {
    let interval = state.config.liveness_sweep_interval();
    let timeout_ms = state.config.agent_heartbeat_timeout_ms;

    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            sweep_agents(&state, timeout_ms).await;
        }
    });
}

/// One scan pass. Agents with a null `last_ping` disconnected cleanly and
/// are skipped.
pub async fn sweep_agents(state: &ServerState, timeout_ms: u64) {
    let agents = match state.store.list_agents().await {
        Ok(agents) => agents,
        Err(e) => {
            tracing::warn!(err = %e, "agent sweep: store unavailable");
            return;
        }
    };

    let now = crate::epoch_ms();
    for agent in agents {
        if agent.status != AgentStatus::Online {
            continue;
        }
        let Some(last_ping) = agent.last_ping else {
            continue;
        };
        let age = now.saturating_sub(last_ping);
        if age <= timeout_ms {
            continue;
        }

        tracing::warn!(agent_id = %agent.id, age_ms = age, "marking stale agent offline");
        if let Err(e) = state
            .store
            .set_agent_status(&agent.id, AgentStatus::Offline, Some(last_ping))
            .await
        {
            tracing::warn!(agent_id = %agent.id, err = %e, "failed to mark agent offline");
            continue;
        }

        // Fail whatever was executing, then disconnect any lingering socket.
        // The stale event must reach the dispatcher before the socket
        // cleanup's disconnect event, or the command would requeue instead.
        state.dispatcher.send(DispatchEvent::AgentStale { agent_id: agent.id.clone() });
        if let Some(connection) = state.registry.agent_connection(&agent.id) {
            state.registry.remove(&connection.id);
        }

        state.broadcaster.broadcast(Message::AgentStatus(AgentStatusUpdate {
            agent_id: agent.id.clone(),
            status: AgentStatus::Offline,
            last_ping: Some(last_ping),
        }));
        state.audit.record(AuditEntry::now(
            event::AGENT_MARKED_OFFLINE,
            agent.id.clone(),
            uuid::Uuid::new_v4().to_string(),
            serde_json::json!({ "lastPing": last_ping, "ageMs": age }),
        ));
    }
}

#[cfg(test)]
#[path = "liveness_tests.rs"]
mod tests;
