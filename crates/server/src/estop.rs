// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Emergency stop: a system-wide halt.
//!
//! Runs inside the dispatcher loop so queue and in-flight state cannot
//! change mid-stop. The stop is not reversible; commands submitted
//! afterwards follow normal rules.

use crate::audit::event;
use crate::command::CommandStatus;
use crate::dispatch::{DispatchEvent, Dispatcher, StopSummary};
use crate::protocol::{EmergencyStop, Message};
use crate::store::AuditEntry;

/// Execute an emergency stop.
///
/// Order matters: agents are told first so subprocess teardown starts
/// while the queues drain; dashboards hear exactly once at the end.
pub(crate) async fn execute(
    dispatcher: &mut Dispatcher,
    reason: &str,
    triggered_by: &str,
) -> StopSummary {
    // 1. Snapshot everything in motion.
    let executing: Vec<(String, String)> = dispatcher
        .in_flight
        .iter()
        .map(|(agent_id, flight)| (agent_id.clone(), flight.command_id.clone()))
        .collect();
    let queued = dispatcher.queue.drain_all();

    let summary = StopSummary {
        agents_stopped: executing.len(),
        commands_cancelled: executing.len() + queued.len(),
    };

    // 2. Tell every agent. Agents terminate their subprocess (SIGTERM, then
    // SIGKILL) on receipt.
    dispatcher.broadcaster.send_to_agents(Message::EmergencyStop(EmergencyStop {
        reason: reason.to_owned(),
        triggered_by: Some(triggered_by.to_owned()),
    }));

    // 3. Cancel all queued entries.
    for entry in &queued {
        if let Ok(Some(mut command)) = dispatcher.store.get_command(&entry.command_id).await {
            dispatcher
                .transition(&mut command, CommandStatus::Cancelled, None, Some(reason.to_owned()))
                .await;
        }
    }

    // Executing commands stay in flight until the agent confirms with
    // `COMMAND_COMPLETE(cancelled)` or the deadline forces the cancel.
    for (agent_id, command_id) in &executing {
        if let Some(flight) = dispatcher.in_flight.get_mut(agent_id) {
            flight.cancel_requested = true;
        }
        let handle = dispatcher.handle.clone();
        let deadline = dispatcher.cancel_deadline;
        let command_id = command_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            handle.send(DispatchEvent::CancelDeadline { command_id });
        });
    }

    // 4. Tell every dashboard, exactly once each.
    dispatcher.broadcaster.broadcast(Message::EmergencyStop(EmergencyStop {
        reason: reason.to_owned(),
        triggered_by: Some(triggered_by.to_owned()),
    }));

    // 5. One audit record with the affected counts.
    dispatcher.audit.record(AuditEntry::now(
        event::EMERGENCY_STOP,
        triggered_by,
        uuid::Uuid::new_v4().to_string(),
        serde_json::json!({
            "reason": reason,
            "agentsStopped": summary.agents_stopped,
            "commandsCancelled": summary.commands_cancelled,
        }),
    ));

    tracing::warn!(
        reason,
        triggered_by,
        agents = summary.agents_stopped,
        commands = summary.commands_cancelled,
        "emergency stop executed"
    );
    summary
}
