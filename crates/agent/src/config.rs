// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for the agent runtime.
#[derive(Debug, Clone, clap::Args)]
pub struct AgentConfig {
    /// Control-plane base URL.
    #[arg(long, default_value = "http://127.0.0.1:9600", env = "SWITCHBOARD_URL")]
    pub server_url: String,

    /// Bearer token for the control plane. Falls back to the credential
    /// store when unset.
    #[arg(long, env = "SWITCHBOARD_AGENT_TOKEN")]
    pub token: Option<String>,

    /// Agent flavor: claude, gemini, codex, ...
    #[arg(long, default_value = "claude", env = "SWITCHBOARD_AGENT_TYPE")]
    pub agent_type: String,

    /// Human-readable agent name.
    #[arg(long, default_value = "agent", env = "SWITCHBOARD_AGENT_NAME")]
    pub name: String,

    /// Capabilities advertised on connect.
    #[arg(long, value_delimiter = ',', env = "SWITCHBOARD_AGENT_CAPABILITIES")]
    pub capabilities: Vec<String>,

    /// Application heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "SWITCHBOARD_AGENT_HEARTBEAT_MS")]
    pub heartbeat_ms: u64,

    /// Reconnect backoff base delay in milliseconds.
    #[arg(long, default_value_t = 1_000, env = "SWITCHBOARD_RECONNECT_BASE_MS")]
    pub reconnect_base_ms: u64,

    /// Reconnect backoff multiplier.
    #[arg(long, default_value_t = 2.0, env = "SWITCHBOARD_RECONNECT_MULTIPLIER")]
    pub reconnect_multiplier: f64,

    /// Reconnect backoff cap in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "SWITCHBOARD_RECONNECT_MAX_MS")]
    pub reconnect_max_ms: u64,

    /// Reconnect attempts before giving up. 0 retries forever.
    #[arg(long, default_value_t = 10, env = "SWITCHBOARD_RECONNECT_MAX_ATTEMPTS")]
    pub reconnect_max_attempts: u32,

    /// Keychain service name for stored credentials.
    #[arg(long, default_value = "switchboard-agent", env = "SWITCHBOARD_KEYCHAIN_SERVICE")]
    pub keychain_service: String,
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn reconnect_config(&self) -> crate::reconnect::ReconnectConfig {
        crate::reconnect::ReconnectConfig {
            base_delay: Duration::from_millis(self.reconnect_base_ms),
            multiplier: self.reconnect_multiplier,
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            max_attempts: (self.reconnect_max_attempts > 0)
                .then_some(self.reconnect_max_attempts),
        }
    }
}
