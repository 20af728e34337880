// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios over real sockets: dispatch, priority, interrupt,
//! stale agents, and emergency stop.

use switchboard::command::CommandStatus;
use switchboard::protocol::{
    AckStatus, AgentHeartbeat, CommandAck, CommandComplete, CommandRequest, CompletionStatus,
    EmergencyStop, Message, OutputStream, TerminalChunk,
};
use switchboard::store::{AgentStatus, AgentStore, CommandStore};

use switchboard_specs::{connect_agent, connect_dashboard, subscribe_all, TestServer, WsPeer};

fn command_request(agent_id: &str, command: &str, priority: i64) -> Message {
    Message::CommandRequest(CommandRequest {
        command_id: None,
        agent_id: Some(agent_id.to_owned()),
        command: command.to_owned(),
        args: vec![],
        priority: Some(priority),
        constraints: Default::default(),
    })
}

/// Wait for a COMMAND_STATUS with the given status; returns the command id.
async fn await_status(
    dash: &mut WsPeer,
    status: CommandStatus,
    command_id: Option<&str>,
) -> anyhow::Result<String> {
    let wanted = command_id.map(str::to_owned);
    dash.recv_until(move |envelope| match envelope.message {
        Message::CommandStatus(update)
            if update.status == status
                && wanted.as_deref().is_none_or(|id| id == update.command_id) =>
        {
            Some(update.command_id)
        }
        _ => None,
    })
    .await
}

/// Wait for the COMMAND_REQUEST handed to an agent; returns the command id.
async fn await_request(agent: &mut WsPeer) -> anyhow::Result<String> {
    agent
        .recv_until(|envelope| match envelope.message {
            Message::CommandRequest(request) => request.command_id,
            _ => None,
        })
        .await
}

async fn ack_executing(agent: &mut WsPeer, agent_id: &str, command_id: &str) -> anyhow::Result<()> {
    agent
        .send(Message::CommandAck(CommandAck {
            command_id: command_id.to_owned(),
            agent_id: agent_id.to_owned(),
            status: AckStatus::Executing,
        }))
        .await?;
    Ok(())
}

async fn complete(
    agent: &mut WsPeer,
    agent_id: &str,
    command_id: &str,
    status: CompletionStatus,
    exit_code: Option<i32>,
) -> anyhow::Result<()> {
    agent
        .send(Message::CommandComplete(CommandComplete {
            command_id: command_id.to_owned(),
            agent_id: agent_id.to_owned(),
            status,
            exit_code,
            error: None,
        }))
        .await?;
    Ok(())
}

// -- Scenario 1: happy path ----------------------------------------------------

#[tokio::test]
async fn happy_path_dispatch_streams_output_and_completes() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut agent = connect_agent(&server, "agent-x").await?;
    let mut dash = connect_dashboard(&server, "dash-1", "operator", subscribe_all()).await?;

    // Agent shows up online for the dashboard's world view.
    let record = server.store.get_agent("agent-x").await?;
    assert!(record.is_some_and(|r| r.status == AgentStatus::Online));

    dash.send(command_request("agent-x", "echo hi", 50)).await?;
    let command_id = await_status(&mut dash, CommandStatus::Queued, None).await?;

    let dispatched = await_request(&mut agent).await?;
    assert_eq!(dispatched, command_id);

    ack_executing(&mut agent, "agent-x", &command_id).await?;
    await_status(&mut dash, CommandStatus::Executing, Some(&command_id)).await?;

    agent
        .send(Message::TerminalOutput(TerminalChunk {
            command_id: command_id.clone(),
            agent_id: "agent-x".to_owned(),
            stream: OutputStream::Stdout,
            content: "hi\n".to_owned(),
            sequence: 1,
        }))
        .await?;
    let chunk = dash
        .recv_until(|envelope| match envelope.message {
            Message::TerminalStream(chunk) => Some(chunk),
            _ => None,
        })
        .await?;
    assert_eq!(chunk.content, "hi\n");
    assert_eq!(chunk.command_id, command_id);

    complete(&mut agent, "agent-x", &command_id, CompletionStatus::Completed, Some(0)).await?;
    await_status(&mut dash, CommandStatus::Completed, Some(&command_id)).await?;

    let stored = server.store.get_command(&command_id).await?;
    assert!(stored.is_some_and(|c| c.status == CommandStatus::Completed));
    Ok(())
}

// -- Scenario 2: priority overtake ---------------------------------------------

#[tokio::test]
async fn priority_overtake_dispatches_high_priority_first() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut agent = connect_agent(&server, "agent-y").await?;
    let mut dash = connect_dashboard(&server, "dash-1", "operator", subscribe_all()).await?;

    // Hold the agent busy so C1..C3 queue up behind.
    dash.send(command_request("agent-y", "busy", 99)).await?;
    let busy = await_request(&mut agent).await?;
    ack_executing(&mut agent, "agent-y", &busy).await?;

    dash.send(command_request("agent-y", "c1", 25)).await?;
    let c1 = await_status(&mut dash, CommandStatus::Queued, None).await?;
    dash.send(command_request("agent-y", "c2", 25)).await?;
    let c2 = await_status(&mut dash, CommandStatus::Queued, None).await?;
    dash.send(command_request("agent-y", "c3", 90)).await?;
    let c3 = await_status(&mut dash, CommandStatus::Queued, None).await?;

    let mut order = Vec::new();
    let mut previous = busy;
    for _ in 0..3 {
        complete(&mut agent, "agent-y", &previous, CompletionStatus::Completed, Some(0)).await?;
        let next = await_request(&mut agent).await?;
        ack_executing(&mut agent, "agent-y", &next).await?;
        order.push(next.clone());
        previous = next;
    }
    complete(&mut agent, "agent-y", &previous, CompletionStatus::Completed, Some(0)).await?;

    assert_eq!(order, vec![c3, c1, c2]);
    Ok(())
}

// -- Scenario 3: interrupt ------------------------------------------------------

#[tokio::test]
async fn interrupt_cancels_cooperatively_within_deadline() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut agent = connect_agent(&server, "agent-z").await?;
    let mut dash = connect_dashboard(&server, "dash-1", "operator", subscribe_all()).await?;

    dash.send(command_request("agent-z", "sleep 600", 50)).await?;
    let command_id = await_request(&mut agent).await?;
    ack_executing(&mut agent, "agent-z", &command_id).await?;
    await_status(&mut dash, CommandStatus::Executing, Some(&command_id)).await?;

    dash.send(Message::CommandCancel(switchboard::protocol::CommandCancel {
        command_id: command_id.clone(),
        reason: "user".to_owned(),
    }))
    .await?;

    // The agent is asked to cancel and confirms.
    let cancel = agent
        .recv_until(|envelope| match envelope.message {
            Message::CommandCancel(cancel) => Some(cancel),
            _ => None,
        })
        .await?;
    assert_eq!(cancel.command_id, command_id);
    assert_eq!(cancel.reason, "user");
    complete(&mut agent, "agent-z", &command_id, CompletionStatus::Cancelled, None).await?;

    await_status(&mut dash, CommandStatus::Cancelled, Some(&command_id)).await?;
    Ok(())
}

#[tokio::test]
async fn unconfirmed_interrupt_is_forced_after_the_deadline() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut agent = connect_agent(&server, "agent-z").await?;
    let mut dash = connect_dashboard(&server, "dash-1", "operator", subscribe_all()).await?;

    dash.send(command_request("agent-z", "stuck", 50)).await?;
    let command_id = await_request(&mut agent).await?;
    ack_executing(&mut agent, "agent-z", &command_id).await?;
    await_status(&mut dash, CommandStatus::Executing, Some(&command_id)).await?;

    dash.send(Message::CommandCancel(switchboard::protocol::CommandCancel {
        command_id: command_id.clone(),
        reason: "user".to_owned(),
    }))
    .await?;

    // Agent never confirms; the cancel deadline forces the terminal state.
    await_status(&mut dash, CommandStatus::Cancelled, Some(&command_id)).await?;
    Ok(())
}

// -- Scenario 4: stale agent ----------------------------------------------------

#[tokio::test]
async fn stale_agent_is_swept_offline_and_its_command_fails() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut agent = connect_agent(&server, "agent-stale").await?;
    let mut dash = connect_dashboard(&server, "dash-1", "operator", subscribe_all()).await?;

    dash.send(command_request("agent-stale", "hang", 50)).await?;
    let command_id = await_request(&mut agent).await?;
    ack_executing(&mut agent, "agent-stale", &command_id).await?;
    await_status(&mut dash, CommandStatus::Executing, Some(&command_id)).await?;

    // Simulate a hung process: heartbeat 91s in the past while the socket
    // stays open.
    let stale = switchboard::epoch_ms() - 91_000;
    server.store.set_agent_status("agent-stale", AgentStatus::Online, Some(stale)).await?;

    // Next sweep (every 200ms here) marks it offline.
    let update = dash
        .recv_until(|envelope| match envelope.message {
            Message::AgentStatus(update) if update.status == AgentStatus::Offline => Some(update),
            _ => None,
        })
        .await?;
    assert_eq!(update.agent_id, "agent-stale");

    await_status(&mut dash, CommandStatus::Failed, Some(&command_id)).await?;
    let stored = server.store.get_command(&command_id).await?;
    assert!(stored.is_some_and(|c| c.status == CommandStatus::Failed));

    let record = server.store.get_agent("agent-stale").await?;
    assert!(record.is_some_and(|r| r.status == AgentStatus::Offline));
    Ok(())
}

// -- Scenario 6: emergency stop -------------------------------------------------

#[tokio::test]
async fn emergency_stop_halts_the_fleet_and_audits_once() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut agent_1 = connect_agent(&server, "agent-1").await?;
    let mut agent_2 = connect_agent(&server, "agent-2").await?;
    let mut admin = connect_dashboard(&server, "boss", "admin", subscribe_all()).await?;
    let mut watcher = connect_dashboard(&server, "watcher", "operator", subscribe_all()).await?;

    // One executing and one queued command per agent.
    let mut executing = Vec::new();
    for (agent_id, peer) in [("agent-1", &mut agent_1), ("agent-2", &mut agent_2)] {
        admin.send(command_request(agent_id, "run", 50)).await?;
        let command_id = await_request(peer).await?;
        ack_executing(peer, agent_id, &command_id).await?;
        await_status(&mut admin, CommandStatus::Executing, Some(&command_id)).await?;
        executing.push(command_id);

        admin.send(command_request(agent_id, "later", 10)).await?;
    }

    admin
        .send(Message::EmergencyStop(EmergencyStop {
            reason: "drill".to_owned(),
            triggered_by: None,
        }))
        .await?;

    // Both agents hear the stop and kill their work.
    for (agent_id, peer, command_id) in [
        ("agent-1", &mut agent_1, executing[0].clone()),
        ("agent-2", &mut agent_2, executing[1].clone()),
    ] {
        let stop = peer
            .recv_until(|envelope| match envelope.message {
                Message::EmergencyStop(stop) => Some(stop),
                _ => None,
            })
            .await?;
        assert_eq!(stop.reason, "drill");
        complete(peer, agent_id, &command_id, CompletionStatus::Cancelled, None).await?;
    }

    // Every dashboard hears exactly one EMERGENCY_STOP.
    for dash in [&mut admin, &mut watcher] {
        let stop = dash
            .recv_until(|envelope| match envelope.message {
                Message::EmergencyStop(stop) => Some(stop),
                _ => None,
            })
            .await?;
        assert_eq!(stop.reason, "drill");
    }

    // All four commands end CANCELLED.
    for command_id in &executing {
        await_status(&mut watcher, CommandStatus::Cancelled, Some(command_id)).await?;
    }
    let cancelled = server.store.list_commands_by_status(CommandStatus::Cancelled).await?;
    assert_eq!(cancelled.len(), 4);

    // Exactly one audit record with the affected counts.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let audit = server.store.audit_entries().await;
    let stops: Vec<_> =
        audit.iter().filter(|e| e.event_type == "emergency_stop").collect();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].details["agentsStopped"], 2);
    assert_eq!(stops[0].details["commandsCancelled"], 4);
    assert_eq!(stops[0].subject_id, "boss");
    Ok(())
}

// -- Heartbeats keep agents fresh ----------------------------------------------

#[tokio::test]
async fn heartbeats_refresh_the_agent_record() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut agent = connect_agent(&server, "agent-hb").await?;

    let before = server
        .store
        .get_agent("agent-hb")
        .await?
        .and_then(|r| r.last_ping)
        .unwrap_or_default();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    agent
        .send(Message::AgentHeartbeat(AgentHeartbeat { agent_id: "agent-hb".to_owned() }))
        .await?;

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    loop {
        let after = server
            .store
            .get_agent("agent-hb")
            .await?
            .and_then(|r| r.last_ping)
            .unwrap_or_default();
        if after > before {
            break;
        }
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "heartbeat never landed");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    Ok(())
}
