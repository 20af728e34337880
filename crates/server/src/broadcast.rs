// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fan-out of typed events to subscribed dashboards.
//!
//! The frame is serialized (and optionally compressed) once, then pushed to
//! each destination's bounded outbound queue. A slow or closed socket only
//! affects its own queue; per-destination order is the submission order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::protocol::compress::{maybe_compress, Algorithm};
use crate::protocol::{Envelope, Message};
use crate::registry::{ConnectionKind, ConnectionRegistry, Outbound};

/// Result of one broadcast call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub matched: usize,
    pub delivered: usize,
    /// Frames evicted from full outbound queues to admit this one.
    pub dropped: usize,
}

/// Cumulative counters for the stats endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BroadcastStats {
    pub events: u64,
    pub delivered: u64,
    pub dropped: u64,
}

pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    compression: Option<Algorithm>,
    compression_min_bytes: usize,
    events: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Broadcaster {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        compression: Option<Algorithm>,
        compression_min_bytes: usize,
    ) -> Self {
        Self {
            registry,
            compression,
            compression_min_bytes,
            events: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Fan a message out to every dashboard whose filter accepts it.
    pub fn broadcast(&self, message: Message) -> BroadcastOutcome {
        self.events.fetch_add(1, Ordering::Relaxed);

        let envelope = Envelope::new(message);
        let Ok(json) = envelope.encode() else {
            return BroadcastOutcome::default();
        };
        let frame = self.wire_frame(json, envelope.message.type_name());

        let mut outcome = BroadcastOutcome::default();
        // Snapshot under the registry lock, send without it.
        for connection in self.registry.all(Some(ConnectionKind::Dashboard)) {
            if !connection.filter.lock().wants(&envelope.message) {
                continue;
            }
            outcome.matched += 1;
            if connection.outbound.push(Outbound::Frame(Arc::clone(&frame))) {
                outcome.dropped += 1;
                tracing::warn!(
                    conn_id = %connection.id,
                    kind = envelope.message.type_name(),
                    "broadcast frame dropped from full outbound queue"
                );
            }
            outcome.delivered += 1;
        }

        self.delivered.fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        self.dropped.fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        outcome
    }

    /// Send a message to every connected agent. Used for emergency stop.
    pub fn send_to_agents(&self, message: Message) -> usize {
        let envelope = Envelope::new(message);
        let Ok(json) = envelope.encode() else {
            return 0;
        };
        let frame: Arc<str> = Arc::from(json.as_str());
        let agents = self.registry.all(Some(ConnectionKind::Agent));
        for connection in &agents {
            connection.outbound.push(Outbound::Frame(Arc::clone(&frame)));
        }
        agents.len()
    }

    fn wire_frame(&self, json: String, type_name: &str) -> Arc<str> {
        if let Some(algorithm) = self.compression {
            match maybe_compress(&json, type_name, algorithm, self.compression_min_bytes) {
                Ok(Some(compressed)) => return Arc::from(compressed.as_str()),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(err = %e, "compression failed, sending original");
                }
            }
        }
        Arc::from(json.as_str())
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events: self.events.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[path = "broadcast_tests.rs"]
mod tests;
