// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Capability tags per role, checked at the point of use.

/// The closed set of privileged actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CommandExecute,
    AgentControl,
    EmergencyStop,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommandExecute => "command:execute",
            Self::AgentControl => "agent:control",
            Self::EmergencyStop => "system:emergency-stop",
        }
    }
}

/// Capabilities granted to a role. Unknown roles get nothing.
pub fn capabilities(role: &str) -> &'static [Action] {
    match role {
        "admin" => &[Action::CommandExecute, Action::AgentControl, Action::EmergencyStop],
        "operator" => &[Action::CommandExecute, Action::AgentControl],
        "viewer" | "agent" => &[],
        _ => &[],
    }
}

/// Whether `role` may perform `action`. Denials are reported by the caller
/// as `permission_denied` security events.
pub fn allowed(role: &str, action: Action) -> bool {
    capabilities(role).contains(&action)
}
