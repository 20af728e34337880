// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent identity file: stable ids across restarts, per user config.

use std::collections::HashMap;
use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};

const IDENTITY_VERSION: u32 = 1;

/// Metadata recorded alongside each identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityMetadata {
    #[serde(default)]
    pub host_machine: String,
    #[serde(default)]
    pub platform: String,
}

/// One stable agent identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    /// Epoch millis.
    pub created_at: u64,
    #[serde(default)]
    pub last_used: u64,
    #[serde(default)]
    pub metadata: IdentityMetadata,
}

/// The on-disk identity file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityFile {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_agent: Option<String>,
    #[serde(default)]
    pub agents: HashMap<String, AgentIdentity>,
}

impl IdentityFile {
    pub fn new() -> Self {
        Self { version: IDENTITY_VERSION, default_agent: None, agents: HashMap::new() }
    }

    /// Fetch the default identity for `agent_type`, minting one if absent.
    pub fn identity_for(&mut self, agent_type: &str, name: &str) -> AgentIdentity {
        if let Some(id) = self.default_agent.clone() {
            if let Some(identity) = self.agents.get_mut(&id) {
                if identity.agent_type == agent_type {
                    identity.last_used = now_ms();
                    return identity.clone();
                }
            }
        }

        let identity = AgentIdentity {
            id: generate_agent_id(agent_type),
            name: name.to_owned(),
            agent_type: agent_type.to_owned(),
            created_at: now_ms(),
            last_used: now_ms(),
            metadata: IdentityMetadata {
                host_machine: hostname(),
                platform: std::env::consts::OS.to_owned(),
            },
        };
        self.default_agent = Some(identity.id.clone());
        self.agents.insert(identity.id.clone(), identity.clone());
        identity
    }
}

/// Load the identity file, returning an empty one when absent.
pub fn load(path: &Path) -> anyhow::Result<IdentityFile> {
    if !path.exists() {
        return Ok(IdentityFile::new());
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Save atomically (tmp + rename).
pub fn save(path: &Path, file: &IdentityFile) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(file)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Stable ids look like `<type>-<base36-timestamp>-<9-char-random>`.
pub fn generate_agent_id(agent_type: &str) -> String {
    let timestamp = to_base36(now_ms());
    let mut rng = rand::rng();
    let suffix: String = (0..9)
        .map(|_| {
            const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
            ALPHABET[rng.random_range(0..ALPHABET.len())] as char
        })
        .collect();
    format!("{agent_type}-{timestamp}-{suffix}")
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_owned();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_owned())
}

#[cfg(test)]
#[path = "identity_tests.rs"]
mod tests;
