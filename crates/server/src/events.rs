// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subscription filtering for dashboard fan-out.
//!
//! A dashboard declares its interests once in `DASHBOARD_INIT`; the
//! broadcaster evaluates the resulting [`SubscriptionFilter`] against each
//! event at broadcast time.

use std::collections::HashSet;

use crate::protocol::{Message, SubscriptionSpec};

/// Parsed subscription preferences for one dashboard connection.
#[derive(Debug, Clone)]
pub struct SubscriptionFilter {
    all_agents: bool,
    agents: HashSet<String>,
    all_commands: bool,
    commands: HashSet<String>,
    pub traces: bool,
    pub terminals: bool,
}

impl Default for SubscriptionFilter {
    /// Everything on; used until `DASHBOARD_INIT` narrows it.
    fn default() -> Self {
        Self {
            all_agents: true,
            agents: HashSet::new(),
            all_commands: true,
            commands: HashSet::new(),
            traces: true,
            terminals: true,
        }
    }
}

impl From<SubscriptionSpec> for SubscriptionFilter {
    fn from(spec: SubscriptionSpec) -> Self {
        let all_agents = spec.agents.is_empty() || spec.agents.iter().any(|a| a == "all");
        let all_commands = spec.commands.is_empty() || spec.commands.iter().any(|c| c == "all");
        Self {
            all_agents,
            agents: if all_agents { HashSet::new() } else { spec.agents.into_iter().collect() },
            all_commands,
            commands: if all_commands {
                HashSet::new()
            } else {
                spec.commands.into_iter().collect()
            },
            traces: spec.traces,
            terminals: spec.terminals,
        }
    }
}

impl SubscriptionFilter {
    pub fn wants_agent(&self, agent_id: &str) -> bool {
        self.all_agents || self.agents.contains(agent_id)
    }

    pub fn wants_command(&self, command_id: &str) -> bool {
        self.all_commands || self.commands.contains(command_id)
    }

    /// Whether this filter accepts a broadcast message. Non-broadcast types
    /// are always accepted; they only reach a connection via direct sends.
    pub fn wants(&self, message: &Message) -> bool {
        match message {
            Message::AgentStatus(s) => self.wants_agent(&s.agent_id),
            Message::CommandStatus(s) => {
                self.wants_command(&s.command_id)
                    && s.agent_id.as_deref().is_none_or(|a| self.wants_agent(a))
            }
            Message::TerminalStream(c) => {
                self.terminals && self.wants_agent(&c.agent_id) && self.wants_command(&c.command_id)
            }
            Message::TraceUpdate(t) => {
                self.traces && self.wants_agent(&t.agent_id) && self.wants_command(&t.command_id)
            }
            Message::EmergencyStop(_) => true,
            _ => true,
        }
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
