// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Switchboard agent runtime: credentials, reconnection, and the WebSocket
//! session against the control plane.

pub mod breaker;
pub mod client;
pub mod config;
pub mod credential;
pub mod identity;
pub mod reconnect;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::client::{agent_ws_url, AgentSession, SessionEnd, WsConnector};
use crate::config::AgentConfig;
use crate::reconnect::Connector;
use crate::credential::CredentialBackend;
use crate::reconnect::{ReconnectEvent, ReconnectionEngine};

/// Run the agent until shutdown: connect, serve the session, reconnect with
/// backoff when the link drops.
pub async fn run(
    config: AgentConfig,
    session: AgentSession,
    credentials: Arc<dyn CredentialBackend>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let token = match config.token.clone() {
        Some(token) => token,
        None => credentials
            .retrieve()?
            .map(|c| c.access_token)
            .ok_or_else(|| anyhow::anyhow!("no token configured and none stored"))?,
    };

    let url = agent_ws_url(&config.server_url, &token, &session.identity.id);
    let connector = Arc::new(WsConnector::new(url));
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
    let engine = ReconnectionEngine::new(
        config.reconnect_config(),
        Arc::clone(&breaker),
        Arc::clone(&connector) as Arc<dyn reconnect::Connector>,
    );

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        // First try directly; fall back to the backoff engine.
        let stream = match connector.connect().await {
            Ok(()) => {
                breaker.record_success();
                connector.take()
            }
            Err(e) => {
                tracing::warn!(err = %e, "connect failed, entering reconnection");
                breaker.record_failure();
                let mut events = engine.subscribe();
                engine.start_reconnection();
                loop {
                    match events.recv().await {
                        Ok(ReconnectEvent::ReconnectionSuccessful { .. }) => {
                            break connector.take();
                        }
                        Ok(ReconnectEvent::MaxAttemptsReached { attempts }) => {
                            anyhow::bail!("reconnection exhausted after {attempts} attempts");
                        }
                        Ok(_) => continue,
                        Err(_) => anyhow::bail!("reconnection engine stopped"),
                    }
                }
            }
        };
        let Some(stream) = stream else {
            continue;
        };

        tracing::info!(agent_id = %session.identity.id, "connected to control plane");
        match session.run(stream).await {
            Ok(SessionEnd::Shutdown) => return Ok(()),
            Ok(SessionEnd::Disconnected) => {
                tracing::warn!("session ended, will reconnect");
            }
            Err(e) => {
                tracing::warn!(err = %e, "session error, will reconnect");
            }
        }
    }
}
