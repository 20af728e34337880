// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Thin interfaces over the durable store.
//!
//! The control plane consumes the external store through these traits and
//! never assumes a schema. The in-memory implementation backs the default
//! single-process deployment and every test.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::command::{Command, CommandStatus};

/// Agent liveness status as persisted in the agent table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Offline,
    Connecting,
    Online,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Connecting => "connecting",
            Self::Online => "online",
            Self::Error => "error",
        }
    }
}

/// Durable record for a known agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    /// Agent flavor: "claude", "gemini", "codex", ...
    pub agent_type: String,
    pub status: AgentStatus,
    /// Epoch millis of the last application heartbeat. `None` after a clean
    /// disconnect; the liveness sweep skips those.
    pub last_ping: Option<u64>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub event_type: String,
    pub subject_id: String,
    pub timestamp: u64,
    pub correlation_id: String,
    pub details: serde_json::Value,
}

/// CRUD surface over the agent table.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn upsert_agent(&self, record: AgentRecord) -> anyhow::Result<()>;
    async fn get_agent(&self, id: &str) -> anyhow::Result<Option<AgentRecord>>;
    async fn list_agents(&self) -> anyhow::Result<Vec<AgentRecord>>;
    /// Update status and heartbeat in one write.
    async fn set_agent_status(
        &self,
        id: &str,
        status: AgentStatus,
        last_ping: Option<u64>,
    ) -> anyhow::Result<()>;
}

/// CRUD surface over the command table.
#[async_trait]
pub trait CommandStore: Send + Sync {
    async fn upsert_command(&self, command: Command) -> anyhow::Result<()>;
    async fn get_command(&self, id: &str) -> anyhow::Result<Option<Command>>;
    async fn list_commands_by_status(
        &self,
        status: CommandStatus,
    ) -> anyhow::Result<Vec<Command>>;
}

/// Append-only surface over the audit table.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_audit(&self, entries: Vec<AuditEntry>) -> anyhow::Result<()>;
}

/// The full store contract the control plane depends on.
pub trait Store: AgentStore + CommandStore + AuditStore {}
impl<T: AgentStore + CommandStore + AuditStore> Store for T {}

// -- In-memory implementation --------------------------------------------------

/// In-memory store used by the default deployment and tests.
#[derive(Default)]
pub struct MemoryStore {
    agents: RwLock<HashMap<String, AgentRecord>>,
    commands: RwLock<HashMap<String, Command>>,
    audit: RwLock<Vec<AuditEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all audit entries, for tests and the stats endpoint.
    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.read().await.clone()
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn upsert_agent(&self, record: AgentRecord) -> anyhow::Result<()> {
        self.agents.write().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> anyhow::Result<Option<AgentRecord>> {
        Ok(self.agents.read().await.get(id).cloned())
    }

    async fn list_agents(&self) -> anyhow::Result<Vec<AgentRecord>> {
        let mut agents: Vec<_> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    async fn set_agent_status(
        &self,
        id: &str,
        status: AgentStatus,
        last_ping: Option<u64>,
    ) -> anyhow::Result<()> {
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(id) {
            agent.status = status;
            agent.last_ping = last_ping;
            agent.updated_at = crate::epoch_ms();
        }
        Ok(())
    }
}

#[async_trait]
impl CommandStore for MemoryStore {
    async fn upsert_command(&self, command: Command) -> anyhow::Result<()> {
        self.commands.write().await.insert(command.id.clone(), command);
        Ok(())
    }

    async fn get_command(&self, id: &str) -> anyhow::Result<Option<Command>> {
        Ok(self.commands.read().await.get(id).cloned())
    }

    async fn list_commands_by_status(
        &self,
        status: CommandStatus,
    ) -> anyhow::Result<Vec<Command>> {
        let commands = self.commands.read().await;
        Ok(commands.values().filter(|c| c.status == status).cloned().collect())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append_audit(&self, entries: Vec<AuditEntry>) -> anyhow::Result<()> {
        self.audit.write().await.extend(entries);
        Ok(())
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
