// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command dispatcher: a single event loop that owns all lifecycle state.
//!
//! Every mutation of per-agent availability and in-flight commands flows
//! through [`DispatchEvent`], so transitions are applied in one place with
//! the guards of [`CommandStatus::can_transition`]. Timers (cancel deadline,
//! time limit) are spawned sleeps that send events back into the loop;
//! stale timer events are no-ops once a command is terminal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::audit::{event, AuditHandle};
use crate::broadcast::Broadcaster;
use crate::command::{Command, CommandStatus, ExecutionConstraints};
use crate::config::ServerConfig;
use crate::error::ErrorCode;
use crate::estop;
use crate::protocol::{
    AckStatus, CommandCancel, CommandRequest, CommandStatusUpdate, CompletionStatus, Envelope,
    Message,
};
use crate::queue::{CommandQueue, QueueError};
use crate::registry::ConnectionRegistry;
use crate::store::Store;

/// Health score bounds for agent selection.
const HEALTH_MAX: i32 = 100;
const HEALTH_PENALTY: i32 = 10;

/// A command submission from a dashboard or the REST surface.
#[derive(Debug, Clone)]
pub struct Submission {
    pub command: String,
    pub args: Vec<String>,
    pub agent_id: Option<String>,
    pub priority: Option<i64>,
    pub constraints: ExecutionConstraints,
    pub user_id: String,
    pub connection_id: Option<String>,
}

/// Reply to a successful submission.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub command_id: String,
    pub agent_id: String,
    pub position: usize,
}

/// Summary returned by an emergency stop.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopSummary {
    pub agents_stopped: usize,
    pub commands_cancelled: usize,
}

/// Events consumed by the dispatcher loop.
pub enum DispatchEvent {
    Submit { submission: Submission, reply: oneshot::Sender<Result<SubmitOutcome, ErrorCode>> },
    AgentConnected { agent_id: String },
    AgentDisconnected { agent_id: String },
    /// Liveness sweep found the agent hung: fail its command outright
    /// instead of requeueing to a dead peer.
    AgentStale { agent_id: String },
    Ack { command_id: String, agent_id: String, status: AckStatus },
    Complete {
        command_id: String,
        agent_id: String,
        status: CompletionStatus,
        exit_code: Option<i32>,
        error: Option<String>,
    },
    Interrupt { command_id: String, reason: String },
    EmergencyStop {
        reason: String,
        triggered_by: String,
        reply: oneshot::Sender<StopSummary>,
    },
    CancelDeadline { command_id: String },
    TimeLimit { command_id: String },
}

/// Cloneable sender into the dispatcher loop.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DispatchEvent>,
}

impl DispatcherHandle {
    pub fn send(&self, event: DispatchEvent) {
        let _ = self.tx.send(event);
    }

    pub async fn submit(&self, submission: Submission) -> Result<SubmitOutcome, ErrorCode> {
        let (reply, rx) = oneshot::channel();
        self.send(DispatchEvent::Submit { submission, reply });
        rx.await.map_err(|_| ErrorCode::Internal)?
    }

    pub async fn emergency_stop(&self, reason: String, triggered_by: String) -> StopSummary {
        let (reply, rx) = oneshot::channel();
        self.send(DispatchEvent::EmergencyStop { reason, triggered_by, reply });
        rx.await.unwrap_or_default()
    }
}

/// A command handed to an agent and not yet terminal.
pub(crate) struct InFlight {
    pub(crate) command_id: String,
    pub(crate) agent_id: String,
    /// Set once a cancel was sent; the deadline timer is running.
    pub(crate) cancel_requested: bool,
}

pub(crate) struct Dispatcher {
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) queue: Arc<CommandQueue>,
    pub(crate) broadcaster: Arc<Broadcaster>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) audit: AuditHandle,
    pub(crate) handle: DispatcherHandle,
    max_attempts: u32,
    pub(crate) cancel_deadline: std::time::Duration,

    pub(crate) online: HashSet<String>,
    /// agent-id -> in-flight command. At most one per agent.
    pub(crate) in_flight: HashMap<String, InFlight>,
    health: HashMap<String, i32>,
}

/// Spawn the dispatcher loop and return its handle.
pub fn spawn_dispatcher(
    config: &ServerConfig,
    registry: Arc<ConnectionRegistry>,
    queue: Arc<CommandQueue>,
    broadcaster: Arc<Broadcaster>,
    store: Arc<dyn Store>,
    audit: AuditHandle,
    shutdown: CancellationToken,
) -> DispatcherHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = DispatcherHandle { tx };
    let dispatcher = Dispatcher {
        registry,
        queue,
        broadcaster,
        store,
        audit,
        handle: handle.clone(),
        max_attempts: config.dispatch_max_attempts,
        cancel_deadline: config.cancel_deadline(),
        online: HashSet::new(),
        in_flight: HashMap::new(),
        health: HashMap::new(),
    };
    tokio::spawn(dispatcher.run(rx, shutdown));
    handle
}

impl Dispatcher {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<DispatchEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&mut self, event: DispatchEvent) {
        match event {
            DispatchEvent::Submit { submission, reply } => {
                let _ = reply.send(self.submit(submission).await);
            }
            DispatchEvent::AgentConnected { agent_id } => {
                self.online.insert(agent_id.clone());
                self.health.entry(agent_id.clone()).or_insert(HEALTH_MAX);
                self.try_dispatch(&agent_id).await;
            }
            DispatchEvent::AgentDisconnected { agent_id } => {
                self.online.remove(&agent_id);
                self.on_agent_lost(&agent_id).await;
            }
            DispatchEvent::AgentStale { agent_id } => {
                self.online.remove(&agent_id);
                self.mark_health(&agent_id, false);
                if let Some(flight) = self.in_flight.remove(&agent_id) {
                    if let Ok(Some(mut command)) =
                        self.store.get_command(&flight.command_id).await
                    {
                        self.transition(
                            &mut command,
                            CommandStatus::Failed,
                            None,
                            Some("agent_disconnected".to_owned()),
                        )
                        .await;
                    }
                }
            }
            DispatchEvent::Ack { command_id, agent_id, status } => {
                self.on_ack(&command_id, &agent_id, status).await;
            }
            DispatchEvent::Complete { command_id, agent_id, status, exit_code, error } => {
                self.on_complete(&command_id, &agent_id, status, exit_code, error).await;
            }
            DispatchEvent::Interrupt { command_id, reason } => {
                self.interrupt(&command_id, &reason).await;
            }
            DispatchEvent::EmergencyStop { reason, triggered_by, reply } => {
                let summary = estop::execute(self, &reason, &triggered_by).await;
                let _ = reply.send(summary);
            }
            DispatchEvent::CancelDeadline { command_id } => {
                self.on_cancel_deadline(&command_id).await;
            }
            DispatchEvent::TimeLimit { command_id } => {
                self.on_time_limit(&command_id).await;
            }
        }
    }

    // -- Submission ------------------------------------------------------------

    async fn submit(&mut self, submission: Submission) -> Result<SubmitOutcome, ErrorCode> {
        let agent_id = match submission.agent_id {
            Some(ref id) => id.clone(),
            None => self.select_agent().ok_or(ErrorCode::AgentNotFound)?,
        };

        let now = crate::epoch_ms();
        let command = Command {
            id: uuid::Uuid::new_v4().to_string(),
            content: submission.command,
            args: submission.args,
            priority: crate::command::clamp_priority(submission.priority.unwrap_or(50)),
            status: CommandStatus::Pending,
            agent_id: Some(agent_id.clone()),
            user_id: submission.user_id,
            connection_id: submission.connection_id,
            constraints: submission.constraints,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
        };

        let position = match self.queue.enqueue(
            &command.id,
            &agent_id,
            command.priority as i64,
            None,
        ) {
            Ok((_, position)) => position,
            Err(QueueError::Full) => {
                tracing::warn!(agent_id = %agent_id, "queue full, rejecting submission");
                return Err(ErrorCode::ResourceExhausted);
            }
            Err(_) => return Err(ErrorCode::Internal),
        };

        let mut command = command;
        self.transition(&mut command, CommandStatus::Queued, Some(position), None).await;

        let outcome = SubmitOutcome { command_id: command.id.clone(), agent_id, position };
        self.try_dispatch(&outcome.agent_id).await;
        Ok(outcome)
    }

    /// Choose an agent for an unpinned command by
    /// `(health DESC, queue length ASC)`.
    fn select_agent(&self) -> Option<String> {
        self.online
            .iter()
            .map(|id| {
                let health = self.health.get(id).copied().unwrap_or(HEALTH_MAX);
                let busy = usize::from(self.in_flight.contains_key(id));
                (std::cmp::Reverse(health), busy, self.queue.len(id), id.clone())
            })
            .min()
            .map(|(_, _, _, id)| id)
    }

    // -- Dispatch --------------------------------------------------------------

    /// Pop and send the next queued command if the agent is idle.
    async fn try_dispatch(&mut self, agent_id: &str) {
        if !self.online.contains(agent_id) || self.in_flight.contains_key(agent_id) {
            return;
        }
        let Some(entry) = self.queue.dequeue(agent_id) else {
            return;
        };
        let Ok(Some(mut command)) = self.store.get_command(&entry.command_id).await else {
            tracing::warn!(command_id = %entry.command_id, "queued command missing from store");
            return;
        };

        command.attempt_count += 1;
        command.updated_at = crate::epoch_ms();
        let _ = self.store.upsert_command(command.clone()).await;

        let Some(connection) = self.registry.agent_connection(agent_id) else {
            // Socket vanished between the availability check and now.
            self.online.remove(agent_id);
            self.requeue_or_fail(command).await;
            return;
        };

        connection.send(&Envelope::new(Message::CommandRequest(CommandRequest {
            command_id: Some(command.id.clone()),
            agent_id: Some(agent_id.to_owned()),
            command: command.content.clone(),
            args: command.args.clone(),
            priority: Some(command.priority as i64),
            constraints: command.constraints.clone(),
        })));

        self.in_flight.insert(
            agent_id.to_owned(),
            InFlight {
                command_id: command.id.clone(),
                agent_id: agent_id.to_owned(),
                cancel_requested: false,
            },
        );
        tracing::debug!(command_id = %command.id, agent_id, "command dispatched");
    }

    async fn on_ack(&mut self, command_id: &str, agent_id: &str, status: AckStatus) {
        let matches = self
            .in_flight
            .get(agent_id)
            .is_some_and(|f| f.command_id == command_id);
        if !matches {
            tracing::debug!(command_id, agent_id, "stale ack ignored");
            return;
        }

        match status {
            AckStatus::Executing => {
                let Ok(Some(mut command)) = self.store.get_command(command_id).await else {
                    return;
                };
                let time_limit = command.constraints.time_limit_ms;
                self.transition(&mut command, CommandStatus::Executing, None, None).await;
                if let Some(limit_ms) = time_limit {
                    self.spawn_time_limit(command_id.to_owned(), limit_ms);
                }
                self.mark_health(agent_id, true);
            }
            AckStatus::Rejected => {
                // Structural failure: the agent refused the command.
                self.in_flight.remove(agent_id);
                if let Ok(Some(mut command)) = self.store.get_command(command_id).await {
                    self.transition(
                        &mut command,
                        CommandStatus::Failed,
                        None,
                        Some("rejected_by_agent".to_owned()),
                    )
                    .await;
                }
                self.try_dispatch(agent_id).await;
            }
        }
    }

    async fn on_complete(
        &mut self,
        command_id: &str,
        agent_id: &str,
        status: CompletionStatus,
        exit_code: Option<i32>,
        error: Option<String>,
    ) {
        let matches = self
            .in_flight
            .get(agent_id)
            .is_some_and(|f| f.command_id == command_id);
        if !matches {
            tracing::debug!(command_id, agent_id, "completion for unknown flight ignored");
            return;
        }
        self.in_flight.remove(agent_id);

        let Ok(Some(mut command)) = self.store.get_command(command_id).await else {
            return;
        };
        // A completion can beat the ack; bridge through EXECUTING so the
        // state machine stays legal.
        if command.status == CommandStatus::Queued {
            self.transition(&mut command, CommandStatus::Executing, None, None).await;
        }
        let (next, reason) = match status {
            CompletionStatus::Completed if exit_code.unwrap_or(0) == 0 => {
                (CommandStatus::Completed, None)
            }
            CompletionStatus::Completed => {
                (CommandStatus::Failed, Some(format!("exit_code_{}", exit_code.unwrap_or(-1))))
            }
            CompletionStatus::Failed => {
                (CommandStatus::Failed, error.or_else(|| Some("failed".to_owned())))
            }
            CompletionStatus::Cancelled => (CommandStatus::Cancelled, Some("cancelled".to_owned())),
        };
        self.mark_health(agent_id, next == CommandStatus::Completed);
        self.transition(&mut command, next, None, reason).await;
        self.try_dispatch(agent_id).await;
    }

    // -- Interruption and timers -------------------------------------------------

    async fn interrupt(&mut self, command_id: &str, reason: &str) {
        // Executing (or awaiting ack): ask the agent, arm the deadline.
        if let Some(flight) =
            self.in_flight.values_mut().find(|f| f.command_id == command_id)
        {
            if flight.cancel_requested {
                return;
            }
            flight.cancel_requested = true;
            let agent_id = flight.agent_id.clone();
            if let Some(connection) = self.registry.agent_connection(&agent_id) {
                connection.send(&Envelope::new(Message::CommandCancel(CommandCancel {
                    command_id: command_id.to_owned(),
                    reason: reason.to_owned(),
                })));
            }
            let deadline = self.cancel_deadline;
            let handle = self.handle.clone();
            let command_id = command_id.to_owned();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                handle.send(DispatchEvent::CancelDeadline { command_id });
            });
            return;
        }

        // Still queued: remove and cancel immediately.
        if self.queue.remove(command_id).is_some() {
            if let Ok(Some(mut command)) = self.store.get_command(command_id).await {
                self.transition(
                    &mut command,
                    CommandStatus::Cancelled,
                    None,
                    Some(reason.to_owned()),
                )
                .await;
            }
            return;
        }

        tracing::debug!(command_id, "interrupt for unknown command ignored");
    }

    async fn on_cancel_deadline(&mut self, command_id: &str) {
        let Some(agent_id) = self
            .in_flight
            .values()
            .find(|f| f.command_id == command_id && f.cancel_requested)
            .map(|f| f.agent_id.clone())
        else {
            return; // completed in time
        };
        self.in_flight.remove(&agent_id);

        if let Ok(Some(mut command)) = self.store.get_command(command_id).await {
            self.transition(
                &mut command,
                CommandStatus::Cancelled,
                None,
                Some("cancel_deadline_elapsed".to_owned()),
            )
            .await;
        }
        self.try_dispatch(&agent_id).await;
    }

    async fn on_time_limit(&mut self, command_id: &str) {
        let still_running = self
            .in_flight
            .values()
            .any(|f| f.command_id == command_id && !f.cancel_requested);
        if still_running {
            self.interrupt(command_id, "timeout").await;
        }
    }

    fn spawn_time_limit(&self, command_id: String, delay_ms: u64) {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            handle.send(DispatchEvent::TimeLimit { command_id });
        });
    }

    // -- Disconnect handling -----------------------------------------------------

    async fn on_agent_lost(&mut self, agent_id: &str) {
        let Some(flight) = self.in_flight.remove(agent_id) else {
            return;
        };
        self.mark_health(agent_id, false);
        let Ok(Some(command)) = self.store.get_command(&flight.command_id).await else {
            return;
        };
        self.requeue_or_fail(command).await;
    }

    /// Requeue at the original priority while attempts remain, else fail.
    async fn requeue_or_fail(&mut self, mut command: Command) {
        let agent_id = command.agent_id.clone().unwrap_or_default();
        if command.attempt_count < self.max_attempts {
            match self.queue.enqueue(&command.id, &agent_id, command.priority as i64, None) {
                Ok((_, position)) => {
                    if command.status != CommandStatus::Queued {
                        self.transition(&mut command, CommandStatus::Queued, Some(position), None)
                            .await;
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(command_id = %command.id, err = %e, "requeue failed");
                }
            }
        }
        self.transition(
            &mut command,
            CommandStatus::Failed,
            None,
            Some("agent_disconnected".to_owned()),
        )
        .await;
    }

    fn mark_health(&mut self, agent_id: &str, success: bool) {
        let health = self.health.entry(agent_id.to_owned()).or_insert(HEALTH_MAX);
        if success {
            *health = HEALTH_MAX;
        } else {
            *health = (*health - HEALTH_PENALTY).max(0);
        }
    }

    // -- Transitions ---------------------------------------------------------------

    /// Apply a guarded transition, persist it, broadcast it, and audit it.
    pub(crate) async fn transition(
        &self,
        command: &mut Command,
        next: CommandStatus,
        position: Option<usize>,
        reason: Option<String>,
    ) {
        if !command.status.can_transition(next) {
            tracing::warn!(
                command_id = %command.id,
                from = command.status.as_str(),
                to = next.as_str(),
                "illegal transition suppressed"
            );
            return;
        }
        command.status = next;
        command.updated_at = crate::epoch_ms();
        let _ = self.store.upsert_command(command.clone()).await;

        self.broadcaster.broadcast(Message::CommandStatus(CommandStatusUpdate {
            command_id: command.id.clone(),
            agent_id: command.agent_id.clone(),
            status: next,
            queue_position: position,
            reason: reason.clone(),
        }));

        self.audit.record(crate::store::AuditEntry::now(
            event::COMMAND_STATUS,
            command.user_id.clone(),
            command.id.clone(),
            serde_json::json!({
                "status": next.as_str(),
                "agentId": command.agent_id,
                "reason": reason,
                "attempt": command.attempt_count,
            }),
        ));
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
