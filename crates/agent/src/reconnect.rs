// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reconnection engine: exponential backoff with jitter, guarded by the
//! circuit breaker.
//!
//! The engine drives a [`Connector`] until one attempt succeeds, attempts
//! are exhausted, or it is stopped. Lifecycle transitions are emitted as
//! typed events over a broadcast channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreaker;

/// Backoff parameters. Defaults follow the connection contract: 1 s base,
/// doubling, 30 s cap.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
        }
    }
}

/// Delay before `attempt` (0-based): `min(base * multiplier^attempt, max)`
/// with ±10% uniform jitter and a 1 s floor.
pub fn delay_for_attempt(
    config: &ReconnectConfig,
    attempt: u32,
    rng: &mut impl Rng,
) -> Duration {
    let base = config.base_delay.as_secs_f64();
    let raw = (base * config.multiplier.powi(attempt.min(1_000) as i32))
        .min(config.max_delay.as_secs_f64());
    let jittered = raw * rng.random_range(0.9..=1.1);
    Duration::from_secs_f64(jittered.max(1.0))
}

/// Typed lifecycle events.
#[derive(Debug, Clone)]
pub enum ReconnectEvent {
    AttemptScheduled { attempt: u32, delay_ms: u64 },
    AttemptStarted { attempt: u32 },
    AttemptFailed { attempt: u32, error: String },
    ReconnectionSuccessful { attempt: u32 },
    MaxAttemptsReached { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Scheduled { attempt: u32 },
    Attempting { attempt: u32 },
    Stopped,
    Exhausted,
}

/// One reconnect attempt. Returning `Ok` means a connection was
/// established; the engine then goes idle until restarted.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<()>;
}

pub struct ReconnectionEngine {
    config: ReconnectConfig,
    breaker: Arc<CircuitBreaker>,
    connector: Arc<dyn Connector>,
    events: broadcast::Sender<ReconnectEvent>,
    state: Arc<Mutex<EngineState>>,
    cancel: Mutex<Option<CancellationToken>>,
    force: Arc<Notify>,
}

impl ReconnectionEngine {
    pub fn new(
        config: ReconnectConfig,
        breaker: Arc<CircuitBreaker>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            breaker,
            connector,
            events,
            state: Arc::new(Mutex::new(EngineState::Idle)),
            cancel: Mutex::new(None),
            force: Arc::new(Notify::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Begin reconnecting. A no-op while a run is already in progress.
    pub fn start_reconnection(&self) {
        let mut cancel_slot = self.cancel.lock();
        if cancel_slot.as_ref().is_some_and(|c| !c.is_cancelled()) {
            return;
        }
        let cancel = CancellationToken::new();
        *cancel_slot = Some(cancel.clone());
        drop(cancel_slot);

        let config = self.config.clone();
        let breaker = Arc::clone(&self.breaker);
        let connector = Arc::clone(&self.connector);
        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        let force = Arc::clone(&self.force);
        tokio::spawn(async move {
            run_loop(config, breaker, connector, events, state, force, cancel.clone()).await;
            // Mark the run finished so a later start can begin a new one.
            cancel.cancel();
        });
    }

    /// Stop any in-progress run.
    pub fn stop_reconnection(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        *self.state.lock() = EngineState::Stopped;
    }

    /// Skip the current backoff wait and attempt immediately.
    pub fn force_reconnect(&self) {
        self.force.notify_one();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    config: ReconnectConfig,
    breaker: Arc<CircuitBreaker>,
    connector: Arc<dyn Connector>,
    events: broadcast::Sender<ReconnectEvent>,
    state: Arc<Mutex<EngineState>>,
    force: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            *state.lock() = EngineState::Stopped;
            return;
        }
        if config.max_attempts.is_some_and(|max| attempt >= max) {
            let _ = events.send(ReconnectEvent::MaxAttemptsReached { attempts: attempt });
            *state.lock() = EngineState::Exhausted;
            return;
        }

        // The breaker suspends scheduling while open.
        if !breaker.can_attempt() {
            tokio::select! {
                _ = cancel.cancelled() => continue,
                _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
            }
        }

        let delay = delay_for_attempt(&config, attempt, &mut rand::rng());
        let _ = events.send(ReconnectEvent::AttemptScheduled {
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
        *state.lock() = EngineState::Scheduled { attempt };
        tokio::select! {
            _ = cancel.cancelled() => continue,
            _ = tokio::time::sleep(delay) => {}
            _ = force.notified() => {
                tracing::debug!(attempt, "forced reconnect, skipping backoff");
            }
        }

        let _ = events.send(ReconnectEvent::AttemptStarted { attempt });
        *state.lock() = EngineState::Attempting { attempt };
        match connector.connect().await {
            Ok(()) => {
                breaker.record_success();
                let _ = events.send(ReconnectEvent::ReconnectionSuccessful { attempt });
                *state.lock() = EngineState::Idle;
                return;
            }
            Err(e) => {
                breaker.record_failure();
                tracing::debug!(attempt, err = %e, "reconnect attempt failed");
                let _ = events.send(ReconnectEvent::AttemptFailed {
                    attempt,
                    error: e.to_string(),
                });
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
#[path = "reconnect_tests.rs"]
mod tests;
