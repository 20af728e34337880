// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential persistence for the agent's access and refresh tokens.
//!
//! Backends are pluggable: the OS keychain is preferred, with an encrypted
//! file under the user's state directory as fallback. The composite backend
//! reads from the first that answers and writes to the first that accepts.

pub mod composite;
pub mod file;
pub mod keychain;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tokens the agent holds for the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiry as epoch seconds.
    #[serde(default)]
    pub expires_at: u64,
}

/// A credential persistence backend.
pub trait CredentialBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn store(&self, credentials: &StoredCredentials) -> anyhow::Result<()>;
    fn retrieve(&self) -> anyhow::Result<Option<StoredCredentials>>;
    fn delete(&self) -> anyhow::Result<()>;
    fn exists(&self) -> bool;
}

/// Resolve the state directory for agent data (credentials, identity).
///
/// Checks `SWITCHBOARD_AGENT_STATE_DIR`, then `$XDG_STATE_HOME/switchboard/agent`,
/// then `$HOME/.local/state/switchboard/agent`.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SWITCHBOARD_AGENT_STATE_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("switchboard").join("agent");
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_owned());
    PathBuf::from(home).join(".local").join("state").join("switchboard").join("agent")
}

/// Default backend stack: keychain first, encrypted file as fallback.
pub fn default_backends(service: &str, agent_id: &str) -> composite::CompositeBackend {
    composite::CompositeBackend::new(vec![
        Box::new(keychain::KeychainBackend::new(service, agent_id)),
        Box::new(file::EncryptedFileBackend::new(state_dir())),
    ])
}
