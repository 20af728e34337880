// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

#[parameterized(
    pending_to_queued = { CommandStatus::Pending, CommandStatus::Queued },
    queued_to_executing = { CommandStatus::Queued, CommandStatus::Executing },
    executing_to_completed = { CommandStatus::Executing, CommandStatus::Completed },
    executing_to_failed = { CommandStatus::Executing, CommandStatus::Failed },
    executing_requeued = { CommandStatus::Executing, CommandStatus::Queued },
    pending_cancelled = { CommandStatus::Pending, CommandStatus::Cancelled },
    queued_cancelled = { CommandStatus::Queued, CommandStatus::Cancelled },
    executing_cancelled = { CommandStatus::Executing, CommandStatus::Cancelled },
)]
fn legal_transitions(from: CommandStatus, to: CommandStatus) {
    assert!(from.can_transition(to), "{from:?} -> {to:?} should be legal");
}

#[parameterized(
    pending_to_executing = { CommandStatus::Pending, CommandStatus::Executing },
    queued_to_completed = { CommandStatus::Queued, CommandStatus::Completed },
    completed_to_anything = { CommandStatus::Completed, CommandStatus::Queued },
    failed_is_absorbing = { CommandStatus::Failed, CommandStatus::Executing },
    cancelled_is_absorbing = { CommandStatus::Cancelled, CommandStatus::Queued },
    no_self_loop = { CommandStatus::Executing, CommandStatus::Executing },
)]
fn illegal_transitions(from: CommandStatus, to: CommandStatus) {
    assert!(!from.can_transition(to), "{from:?} -> {to:?} should be rejected");
}

#[test]
fn terminal_states_are_absorbing() {
    use CommandStatus::*;
    for terminal in [Completed, Failed, Cancelled] {
        for next in [Pending, Queued, Executing, Completed, Failed, Cancelled] {
            assert!(!terminal.can_transition(next));
        }
    }
}

#[test]
fn priority_clamps_at_bounds() {
    assert_eq!(clamp_priority(-5), 0);
    assert_eq!(clamp_priority(0), 0);
    assert_eq!(clamp_priority(50), 50);
    assert_eq!(clamp_priority(100), 100);
    assert_eq!(clamp_priority(101), 100);
    assert_eq!(clamp_priority(i64::MAX), 100);
}

#[test]
fn status_serializes_uppercase() {
    let json = serde_json::to_string(&CommandStatus::Executing).unwrap();
    assert_eq!(json, "\"EXECUTING\"");
}
