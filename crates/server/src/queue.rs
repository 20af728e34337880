// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-agent priority command queue.
//!
//! Ordering key is `(priority DESC, enqueued_at ASC, seq ASC)`; `seq` makes
//! dispatch order stable when two entries share a millisecond. Positions are
//! a derived view recomputed on read, never stored.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::Serialize;

use crate::command::clamp_priority;

/// A pending command awaiting dispatch to a specific agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub command_id: String,
    pub agent_id: String,
    pub priority: u8,
    pub enqueued_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub est_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Queue for the target agent is at its cap.
    Full,
    /// Priority outside [0, 100] on an explicit update.
    PriorityOutOfRange,
    NotFound,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => f.write_str("queue full"),
            Self::PriorityOutOfRange => f.write_str("priority out of range"),
            Self::NotFound => f.write_str("entry not found"),
        }
    }
}

impl std::error::Error for QueueError {}

/// BTreeMap key ordered so that iteration yields dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    /// Inverted so higher priorities sort first.
    priority_inv: u8,
    enqueued_at: u64,
    seq: u64,
}

impl EntryKey {
    fn new(priority: u8, enqueued_at: u64, seq: u64) -> Self {
        Self { priority_inv: 100 - priority, enqueued_at, seq }
    }
}

#[derive(Default)]
struct QueueInner {
    queues: HashMap<String, BTreeMap<EntryKey, QueueEntry>>,
    /// command-id -> (agent-id, key) for O(log n) lookups and removals.
    index: HashMap<String, (String, EntryKey)>,
    seq: u64,
}

/// The queue engine, one logical queue per target agent.
pub struct CommandQueue {
    inner: Mutex<QueueInner>,
    max_length: usize,
}

impl CommandQueue {
    pub fn new(max_length: usize) -> Self {
        Self { inner: Mutex::new(QueueInner::default()), max_length }
    }

    /// Admit a command. Requested priorities are clamped into [0, 100].
    /// Re-enqueueing a command id already queued for the same agent is a
    /// no-op returning the existing entry.
    pub fn enqueue(
        &self,
        command_id: &str,
        agent_id: &str,
        priority: i64,
        est_duration_ms: Option<u64>,
    ) -> Result<(QueueEntry, usize), QueueError> {
        let mut inner = self.inner.lock();

        // A command id can only ever occupy one queue entry.
        if let Some((existing_agent, key)) = inner.index.get(command_id).cloned() {
            let entry = inner.queues[&existing_agent][&key].clone();
            let position =
                Self::position_locked(&inner, command_id).ok_or(QueueError::NotFound)?;
            return Ok((entry, position));
        }

        let queue = inner.queues.entry(agent_id.to_owned()).or_default();
        if queue.len() >= self.max_length {
            return Err(QueueError::Full);
        }

        inner.seq += 1;
        let seq = inner.seq;
        let entry = QueueEntry {
            command_id: command_id.to_owned(),
            agent_id: agent_id.to_owned(),
            priority: clamp_priority(priority),
            enqueued_at: crate::epoch_ms(),
            est_duration_ms,
        };
        let key = EntryKey::new(entry.priority, entry.enqueued_at, seq);
        inner
            .queues
            .entry(agent_id.to_owned())
            .or_default()
            .insert(key, entry.clone());
        inner.index.insert(command_id.to_owned(), (agent_id.to_owned(), key));

        let position =
            Self::position_locked(&inner, command_id).ok_or(QueueError::NotFound)?;
        Ok((entry, position))
    }

    /// Highest-priority entry without removing it.
    pub fn peek(&self, agent_id: &str) -> Option<QueueEntry> {
        let inner = self.inner.lock();
        inner.queues.get(agent_id).and_then(|q| q.values().next().cloned())
    }

    /// Atomically pop the highest-priority entry.
    pub fn dequeue(&self, agent_id: &str) -> Option<QueueEntry> {
        let mut inner = self.inner.lock();
        let queue = inner.queues.get_mut(agent_id)?;
        let key = *queue.keys().next()?;
        let entry = queue.remove(&key)?;
        inner.index.remove(&entry.command_id);
        Some(entry)
    }

    /// 1-based position of a queued command, or `None`.
    pub fn position(&self, command_id: &str) -> Option<usize> {
        let inner = self.inner.lock();
        Self::position_locked(&inner, command_id)
    }

    fn position_locked(inner: &QueueInner, command_id: &str) -> Option<usize> {
        let (agent_id, key) = inner.index.get(command_id)?;
        let queue = inner.queues.get(agent_id)?;
        Some(queue.range(..key).count() + 1)
    }

    /// Re-order an entry under a new priority. Out-of-range values are
    /// rejected rather than clamped.
    pub fn update_priority(
        &self,
        command_id: &str,
        new_priority: i64,
    ) -> Result<usize, QueueError> {
        if !(0..=100).contains(&new_priority) {
            return Err(QueueError::PriorityOutOfRange);
        }
        let mut inner = self.inner.lock();
        let (agent_id, key) = inner.index.get(command_id).cloned().ok_or(QueueError::NotFound)?;
        let queue = inner.queues.get_mut(&agent_id).ok_or(QueueError::NotFound)?;
        let mut entry = queue.remove(&key).ok_or(QueueError::NotFound)?;

        entry.priority = new_priority as u8;
        inner.seq += 1;
        let new_key = EntryKey::new(entry.priority, entry.enqueued_at, inner.seq);
        inner.queues.entry(agent_id.clone()).or_default().insert(new_key, entry);
        inner.index.insert(command_id.to_owned(), (agent_id, new_key));

        Self::position_locked(&inner, command_id).ok_or(QueueError::NotFound)
    }

    /// Remove a queued entry, for cancellation.
    pub fn remove(&self, command_id: &str) -> Option<QueueEntry> {
        let mut inner = self.inner.lock();
        let (agent_id, key) = inner.index.remove(command_id)?;
        let queue = inner.queues.get_mut(&agent_id)?;
        let entry = queue.remove(&key);
        if queue.is_empty() {
            inner.queues.remove(&agent_id);
        }
        entry
    }

    /// Drain every queue, for emergency stop. Entries come back in dispatch
    /// order per agent.
    pub fn drain_all(&self) -> Vec<QueueEntry> {
        let mut inner = self.inner.lock();
        inner.index.clear();
        let mut drained = Vec::new();
        for (_, queue) in inner.queues.drain() {
            drained.extend(queue.into_values());
        }
        drained
    }

    pub fn len(&self, agent_id: &str) -> usize {
        self.inner.lock().queues.get(agent_id).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, agent_id: &str) -> bool {
        self.len(agent_id) == 0
    }

    pub fn total_len(&self) -> usize {
        self.inner.lock().index.len()
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
