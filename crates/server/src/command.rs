// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command model and lifecycle state machine.
//!
//! Transitions are applied through [`CommandStatus::can_transition`] so every
//! caller goes through the same guard table; terminal states are absorbing.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandStatus {
    Pending,
    Queued,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// Cancellation is reachable from every non-terminal state; the rest of
    /// the machine is strictly forward.
    pub fn can_transition(&self, next: CommandStatus) -> bool {
        use CommandStatus::*;
        match (self, next) {
            (Pending, Queued) => true,
            (Queued, Executing) => true,
            (Executing, Completed) | (Executing, Failed) => true,
            // Requeue after a mid-execution disconnect.
            (Executing, Queued) => true,
            (Pending, Cancelled) | (Queued, Cancelled) | (Executing, Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Executing => "EXECUTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// Execution constraints carried by a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConstraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<u64>,
}

/// A unit of work targeted at one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub priority: u8,
    pub status: CommandStatus,
    /// Target agent; `None` until agent selection has run.
    pub agent_id: Option<String>,
    pub user_id: String,
    /// Connection the command originated from; used for direct replies.
    pub connection_id: Option<String>,
    #[serde(default)]
    pub constraints: ExecutionConstraints,
    pub attempt_count: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Clamp a requested priority into the accepted range.
pub fn clamp_priority(priority: i64) -> u8 {
    priority.clamp(0, 100) as u8
}

#[cfg(test)]
#[path = "command_tests.rs"]
mod tests;
