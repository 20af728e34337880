// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Circuit breaker guarding the reconnection engine.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures within the window that trip the breaker.
    pub failure_threshold: u32,
    /// Failures further apart than this do not accumulate.
    pub failure_window: Duration,
    /// Time in `Open` before a single probe attempt is allowed.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Whether an attempt may proceed now. While open, flips to half-open
    /// once the recovery timeout has elapsed since the last failure.
    pub fn can_attempt(&self) -> bool {
        self.can_attempt_at(Instant::now())
    }

    pub(crate) fn can_attempt_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let recovered = inner
                    .last_failure_at
                    .is_some_and(|at| now.duration_since(at) >= self.config.recovery_timeout);
                if recovered {
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure_at = None;
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub(crate) fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();

        // A failure in half-open re-opens immediately.
        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Open;
            inner.last_failure_at = Some(now);
            return;
        }

        // Stale failures outside the window do not accumulate.
        let within_window = inner
            .last_failure_at
            .is_some_and(|at| now.duration_since(at) <= self.config.failure_window);
        inner.consecutive_failures = if within_window {
            inner.consecutive_failures + 1
        } else {
            1
        };
        inner.last_failure_at = Some(now);

        if inner.state == BreakerState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            inner.state = BreakerState::Open;
        }
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
