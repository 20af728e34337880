// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only audit sink.
//!
//! Entries are buffered in-process and flushed to the store on a timer.
//! Flush failures re-buffer up to a cap with oldest-first eviction; audit is
//! best-effort and must never stall the hot path.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::store::{AuditEntry, AuditStore};

/// Audit event names. One entry per security-relevant event and per command
/// lifecycle transition.
pub mod event {
    pub const AUTH_SUCCESS: &str = "auth_success";
    pub const AUTH_FAILURE: &str = "auth_failure";
    pub const TOKEN_BLACKLISTED: &str = "token_blacklisted";
    pub const TOKEN_ROTATED: &str = "token_rotated";
    pub const RATE_LIMIT: &str = "rate_limit_exceeded";
    pub const PERMISSION_DENIED: &str = "permission_denied";
    pub const SESSION_INVALIDATED: &str = "session_invalidated";
    pub const SESSION_ANOMALY: &str = "session_fingerprint_changed";
    pub const COMMAND_STATUS: &str = "command_status";
    pub const EMERGENCY_STOP: &str = "emergency_stop";
    pub const AGENT_MARKED_OFFLINE: &str = "agent_marked_offline";
    pub const CONNECTION_TIMEOUT: &str = "connection_timeout";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

impl AuditEntry {
    pub fn now(
        event_type: &str,
        subject_id: impl Into<String>,
        correlation_id: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.to_owned(),
            subject_id: subject_id.into(),
            timestamp: crate::epoch_ms(),
            correlation_id: correlation_id.into(),
            details,
        }
    }
}

/// Cheap cloneable handle; dropping entries is preferable to blocking.
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::UnboundedSender<AuditEntry>,
}

impl AuditHandle {
    pub fn record(&self, entry: AuditEntry) {
        let _ = self.tx.send(entry);
    }
}

/// Spawn the flush task. Returns the handle producers use.
pub fn spawn_audit_sink(
    store: Arc<dyn AuditStore>,
    buffer_cap: usize,
    flush_interval: std::time::Duration,
    shutdown: CancellationToken,
) -> AuditHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_sink(store, rx, buffer_cap, flush_interval, shutdown));
    AuditHandle { tx }
}

async fn run_sink(
    store: Arc<dyn AuditStore>,
    mut rx: mpsc::UnboundedReceiver<AuditEntry>,
    buffer_cap: usize,
    flush_interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut buffer: VecDeque<AuditEntry> = VecDeque::new();
    let mut timer = tokio::time::interval(flush_interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            entry = rx.recv() => {
                match entry {
                    Some(entry) => push_capped(&mut buffer, entry, buffer_cap),
                    None => break,
                }
            }
            _ = timer.tick() => {
                flush(&store, &mut buffer, buffer_cap).await;
            }
            _ = shutdown.cancelled() => break,
        }
    }

    // Drain whatever arrived before shutdown, then flush once.
    while let Ok(entry) = rx.try_recv() {
        push_capped(&mut buffer, entry, buffer_cap);
    }
    flush(&store, &mut buffer, buffer_cap).await;
}

fn push_capped(buffer: &mut VecDeque<AuditEntry>, entry: AuditEntry, cap: usize) {
    if buffer.len() >= cap {
        buffer.pop_front();
    }
    buffer.push_back(entry);
}

async fn flush(store: &Arc<dyn AuditStore>, buffer: &mut VecDeque<AuditEntry>, cap: usize) {
    if buffer.is_empty() {
        return;
    }
    let entries: Vec<AuditEntry> = buffer.drain(..).collect();
    if let Err(e) = store.append_audit(entries.clone()).await {
        tracing::warn!(err = %e, count = entries.len(), "audit flush failed, re-buffering");
        for entry in entries {
            push_capped(buffer, entry, cap);
        }
    }
}

#[cfg(test)]
#[path = "audit_tests.rs"]
mod tests;
