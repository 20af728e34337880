// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for the switchboard control plane.
#[derive(Debug, Clone, clap::Args)]
pub struct ServerConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "SWITCHBOARD_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9600, env = "SWITCHBOARD_PORT")]
    pub port: u16,

    /// Shared HMAC secret for token verification and issuance.
    #[arg(long, env = "SWITCHBOARD_AUTH_SECRET")]
    pub auth_secret: String,

    /// Global cap on concurrent connections (dashboards + agents).
    #[arg(long, default_value_t = 100, env = "SWITCHBOARD_MAX_CONNECTIONS")]
    pub max_connections: usize,

    /// Maximum accepted message size in bytes.
    #[arg(long, default_value_t = 1024 * 1024, env = "SWITCHBOARD_MAX_MESSAGE_BYTES")]
    pub max_message_bytes: usize,

    /// Tolerated clock skew on envelope timestamps, in milliseconds.
    #[arg(long, default_value_t = 300_000, env = "SWITCHBOARD_TIMESTAMP_SKEW_MS")]
    pub timestamp_skew_ms: u64,

    /// Interval between server-initiated socket pings, in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "SWITCHBOARD_HEARTBEAT_INTERVAL_MS")]
    pub heartbeat_interval_ms: u64,

    /// Idle time after which a silent socket is removed, in milliseconds.
    #[arg(long, default_value_t = 60_000, env = "SWITCHBOARD_CONNECTION_TIMEOUT_MS")]
    pub connection_timeout_ms: u64,

    /// Interval between application-level liveness sweeps, in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "SWITCHBOARD_LIVENESS_SWEEP_MS")]
    pub liveness_sweep_ms: u64,

    /// Age of an agent heartbeat beyond which the agent is marked offline,
    /// in milliseconds.
    #[arg(long, default_value_t = 90_000, env = "SWITCHBOARD_AGENT_HEARTBEAT_TIMEOUT_MS")]
    pub agent_heartbeat_timeout_ms: u64,

    /// Deadline for `DASHBOARD_INIT` / `AGENT_CONNECT` after upgrade,
    /// in milliseconds.
    #[arg(long, default_value_t = 5_000, env = "SWITCHBOARD_INIT_DEADLINE_MS")]
    pub init_deadline_ms: u64,

    /// Maximum queued commands per agent.
    #[arg(long, default_value_t = 100, env = "SWITCHBOARD_MAX_QUEUE_LENGTH")]
    pub max_queue_length: usize,

    /// Depth of each connection's outbound queue.
    #[arg(long, default_value_t = 256, env = "SWITCHBOARD_OUTBOUND_QUEUE_DEPTH")]
    pub outbound_queue_depth: usize,

    /// Maximum concurrent sessions per user; the oldest is evicted beyond it.
    #[arg(long, default_value_t = 5, env = "SWITCHBOARD_MAX_SESSIONS_PER_USER")]
    pub max_sessions_per_user: usize,

    /// Requests allowed per subject within the rate-limit window.
    #[arg(long, default_value_t = 1_000, env = "SWITCHBOARD_RATE_LIMIT_MAX")]
    pub rate_limit_max: usize,

    /// Rate-limit window length, in milliseconds.
    #[arg(long, default_value_t = 60_000, env = "SWITCHBOARD_RATE_LIMIT_WINDOW_MS")]
    pub rate_limit_window_ms: u64,

    /// How long a subject stays blocked after exceeding the limit,
    /// in milliseconds.
    #[arg(long, default_value_t = 300_000, env = "SWITCHBOARD_RATE_LIMIT_BLOCK_MS")]
    pub rate_limit_block_ms: u64,

    /// Dispatch attempts per command before it is failed.
    #[arg(long, default_value_t = 3, env = "SWITCHBOARD_DISPATCH_MAX_ATTEMPTS")]
    pub dispatch_max_attempts: u32,

    /// Grace given to an agent to confirm a cancel before the command is
    /// forcibly marked cancelled, in milliseconds.
    #[arg(long, default_value_t = 5_000, env = "SWITCHBOARD_CANCEL_DEADLINE_MS")]
    pub cancel_deadline_ms: u64,

    /// Remaining token lifetime below which a rotated token is issued
    /// in-band, in seconds.
    #[arg(long, default_value_t = 300, env = "SWITCHBOARD_ROTATION_THRESHOLD_SECS")]
    pub rotation_threshold_secs: u64,

    /// Lifetime of tokens issued by rotation, in seconds.
    #[arg(long, default_value_t = 3_600, env = "SWITCHBOARD_TOKEN_TTL_SECS")]
    pub token_ttl_secs: u64,

    /// Minimum serialized size before broadcast payloads are compressed,
    /// in bytes.
    #[arg(long, default_value_t = 1_024, env = "SWITCHBOARD_COMPRESSION_MIN_BYTES")]
    pub compression_min_bytes: usize,

    /// Compression algorithm for large broadcast payloads: gzip, deflate,
    /// brotli, or off.
    #[arg(long, default_value = "off", env = "SWITCHBOARD_COMPRESSION")]
    pub compression: String,

    /// In-memory audit buffer cap; oldest entries are evicted beyond it.
    #[arg(long, default_value_t = 10_000, env = "SWITCHBOARD_AUDIT_BUFFER_CAP")]
    pub audit_buffer_cap: usize,

    /// Interval between audit flushes, in milliseconds.
    #[arg(long, default_value_t = 2_000, env = "SWITCHBOARD_AUDIT_FLUSH_MS")]
    pub audit_flush_ms: u64,

    /// Interval between blacklist/rate-limit compaction passes,
    /// in milliseconds.
    #[arg(long, default_value_t = 60_000, env = "SWITCHBOARD_COMPACTION_MS")]
    pub compaction_ms: u64,
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn liveness_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_sweep_ms)
    }

    pub fn init_deadline(&self) -> Duration {
        Duration::from_millis(self.init_deadline_ms)
    }

    pub fn cancel_deadline(&self) -> Duration {
        Duration::from_millis(self.cancel_deadline_ms)
    }

    pub fn audit_flush_interval(&self) -> Duration {
        Duration::from_millis(self.audit_flush_ms)
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_millis(self.compaction_ms)
    }
}

#[cfg(test)]
impl ServerConfig {
    /// Config with spec defaults and a fixed secret, for unit tests.
    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 0,
            auth_secret: "test-secret".to_owned(),
            max_connections: 100,
            max_message_bytes: 1024 * 1024,
            timestamp_skew_ms: 300_000,
            heartbeat_interval_ms: 30_000,
            connection_timeout_ms: 60_000,
            liveness_sweep_ms: 30_000,
            agent_heartbeat_timeout_ms: 90_000,
            init_deadline_ms: 5_000,
            max_queue_length: 100,
            outbound_queue_depth: 256,
            max_sessions_per_user: 5,
            rate_limit_max: 1_000,
            rate_limit_window_ms: 60_000,
            rate_limit_block_ms: 300_000,
            dispatch_max_attempts: 3,
            cancel_deadline_ms: 5_000,
            rotation_threshold_secs: 300,
            token_ttl_secs: 3_600,
            compression_min_bytes: 1_024,
            compression: "off".to_owned(),
            audit_buffer_cap: 10_000,
            audit_flush_ms: 2_000,
            compaction_ms: 60_000,
        }
    }
}
