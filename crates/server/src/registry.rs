// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection registry: the single owner of live socket handles.
//!
//! Three indices under one mutex. Other components refer to connections by
//! id and look them up here; nothing else holds a strong reference beyond
//! the moment of use.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::events::SubscriptionFilter;

/// What kind of peer a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Dashboard,
    Agent,
}

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Pre-serialized JSON frame.
    Frame(Arc<str>),
    /// WebSocket-level ping.
    Ping,
    /// Close with the given code, then stop the writer.
    Close(u16),
}

/// Bounded outbound queue. Overflow drops the oldest frame so a slow
/// consumer sees recent data rather than an ever-growing backlog.
#[derive(Debug)]
pub struct OutboundQueue {
    inner: Mutex<VecDeque<Outbound>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame. Returns `true` if an older frame was dropped to
    /// make room.
    pub fn push(&self, item: Outbound) -> bool {
        let dropped = {
            let mut queue = self.inner.lock();
            let dropped = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(item);
            dropped
        };
        if dropped {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    /// Await the next frame, FIFO.
    pub async fn pop(&self) -> Outbound {
        loop {
            if let Some(item) = self.inner.lock().pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Drain whatever is queued right now, without waiting.
    pub fn drain_now(&self) -> Vec<Outbound> {
        self.inner.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A live, authenticated connection.
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub kind: ConnectionKind,
    /// Owning user id (dashboards) or agent id (agents).
    pub principal: String,
    pub outbound: OutboundQueue,
    pub connected_at: u64,
    last_activity: AtomicU64,
    pub cancel: CancellationToken,
    /// Broadcast filter; only meaningful for dashboards.
    pub filter: Mutex<SubscriptionFilter>,
}

impl Connection {
    fn new(kind: ConnectionKind, principal: String, outbound_depth: usize) -> Self {
        let now = crate::epoch_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            principal,
            outbound: OutboundQueue::new(outbound_depth),
            connected_at: now,
            last_activity: AtomicU64::new(now),
            cancel: CancellationToken::new(),
            filter: Mutex::new(SubscriptionFilter::default()),
        }
    }

    pub fn touch(&self) {
        self.last_activity.store(crate::epoch_ms(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Serialize an envelope and queue it for this connection.
    pub fn send(&self, envelope: &crate::protocol::Envelope) {
        if let Ok(json) = envelope.encode() {
            self.outbound.push(Outbound::Frame(Arc::from(json.as_str())));
        }
    }
}

/// Registry error surfaced as `RESOURCE_EXHAUSTED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    CapacityReached,
}

/// Counters exposed on the stats endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub dashboards: usize,
    pub agents: usize,
}

#[derive(Default)]
struct Indices {
    by_id: HashMap<String, Arc<Connection>>,
    by_user: HashMap<String, HashSet<String>>,
    by_agent: HashMap<String, String>,
}

/// In-memory connection registry. All mutations are short and synchronous.
pub struct ConnectionRegistry {
    inner: Mutex<Indices>,
    max_connections: usize,
    outbound_depth: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize, outbound_depth: usize) -> Self {
        Self { inner: Mutex::new(Indices::default()), max_connections, outbound_depth }
    }

    /// Register a dashboard connection for `user_id`.
    pub fn add_dashboard(&self, user_id: &str) -> Result<Arc<Connection>, RegistryError> {
        let connection = Arc::new(Connection::new(
            ConnectionKind::Dashboard,
            user_id.to_owned(),
            self.outbound_depth,
        ));
        let mut inner = self.inner.lock();
        if inner.by_id.len() >= self.max_connections {
            return Err(RegistryError::CapacityReached);
        }
        inner.by_id.insert(connection.id.clone(), Arc::clone(&connection));
        inner.by_user.entry(user_id.to_owned()).or_default().insert(connection.id.clone());
        Ok(connection)
    }

    /// Register an agent connection. The agent index is uniquely held: a
    /// second connect for the same agent evicts the prior connection, which
    /// is returned for the caller to close.
    pub fn add_agent(
        &self,
        agent_id: &str,
    ) -> Result<(Arc<Connection>, Option<Arc<Connection>>), RegistryError> {
        let connection = Arc::new(Connection::new(
            ConnectionKind::Agent,
            agent_id.to_owned(),
            self.outbound_depth,
        ));
        let evicted = {
            let mut inner = self.inner.lock();
            let evicted = inner
                .by_agent
                .get(agent_id)
                .cloned()
                .and_then(|old_id| Self::remove_locked(&mut inner, &old_id));
            if inner.by_id.len() >= self.max_connections {
                // Eviction freed a slot first; only then enforce the cap.
                if let Some(ref old) = evicted {
                    old.cancel.cancel();
                }
                return Err(RegistryError::CapacityReached);
            }
            inner.by_id.insert(connection.id.clone(), Arc::clone(&connection));
            inner.by_agent.insert(agent_id.to_owned(), connection.id.clone());
            evicted
        };
        if let Some(ref old) = evicted {
            old.cancel.cancel();
        }
        Ok((connection, evicted))
    }

    fn remove_locked(inner: &mut Indices, connection_id: &str) -> Option<Arc<Connection>> {
        let connection = inner.by_id.remove(connection_id)?;
        match connection.kind {
            ConnectionKind::Dashboard => {
                if let Some(set) = inner.by_user.get_mut(&connection.principal) {
                    set.remove(connection_id);
                    if set.is_empty() {
                        inner.by_user.remove(&connection.principal);
                    }
                }
            }
            ConnectionKind::Agent => {
                // Only drop the agent index if it still points at us; a
                // replacement connect may already own it.
                if inner.by_agent.get(&connection.principal).map(String::as_str)
                    == Some(connection_id)
                {
                    inner.by_agent.remove(&connection.principal);
                }
            }
        }
        Some(connection)
    }

    /// Remove a connection from all indices. Idempotent; the removed
    /// connection's cancel token is triggered.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<Connection>> {
        let removed = {
            let mut inner = self.inner.lock();
            Self::remove_locked(&mut inner, connection_id)
        };
        if let Some(ref connection) = removed {
            connection.cancel.cancel();
        }
        removed
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.inner.lock().by_id.get(connection_id).cloned()
    }

    pub fn dashboards_for_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock();
        inner
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().filter_map(|id| inner.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn agent_connection(&self, agent_id: &str) -> Option<Arc<Connection>> {
        let inner = self.inner.lock();
        inner.by_agent.get(agent_id).and_then(|id| inner.by_id.get(id).cloned())
    }

    /// Snapshot of all connections, optionally filtered by kind.
    pub fn all(&self, kind: Option<ConnectionKind>) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock();
        inner
            .by_id
            .values()
            .filter(|c| kind.is_none_or(|k| c.kind == k))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock();
        let agents = inner.by_agent.len();
        RegistryStats {
            total: inner.by_id.len(),
            dashboards: inner.by_id.values().filter(|c| c.kind == ConnectionKind::Dashboard).count(),
            agents,
        }
    }

    /// Cancel and drop every connection. Used on shutdown and after an
    /// emergency eviction.
    pub fn close_all(&self) -> usize {
        let connections: Vec<Arc<Connection>> = {
            let mut inner = self.inner.lock();
            inner.by_user.clear();
            inner.by_agent.clear();
            inner.by_id.drain().map(|(_, c)| c).collect()
        };
        for connection in &connections {
            connection.outbound.push(Outbound::Close(crate::error::close::NORMAL));
            connection.cancel.cancel();
        }
        connections.len()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
