// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Protocol, auth, and resource boundary behavior over real sockets, plus
//! the REST surface.

use switchboard::command::CommandStatus;
use switchboard::protocol::{
    CommandRequest, DashboardInit, EmergencyStop, Envelope, Message, Ping,
};
use switchboard_specs::{
    connect_agent, connect_dashboard, subscribe_all, test_config, TestServer, WsPeer,
};

// -- Auth ----------------------------------------------------------------------

#[tokio::test]
async fn bad_token_is_rejected_before_upgrade() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let result = WsPeer::connect(&server.ws_url("/ws/dashboard", "not-a-token")).await;
    assert!(result.is_err(), "upgrade should be refused");
    Ok(())
}

#[tokio::test]
async fn missing_init_closes_with_policy_violation() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let token = server.token("dash-1", "operator");
    let mut peer = WsPeer::connect(&server.ws_url("/ws/dashboard", &token)).await?;

    // Say nothing; the init deadline (500ms here) closes us with 1008.
    let code = peer.expect_close().await?;
    assert_eq!(code, Some(1008));
    Ok(())
}

#[tokio::test]
async fn expired_token_is_rejected() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let token = server.token_with_ttl("dash-1", "operator", 0);
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    let result = WsPeer::connect(&server.ws_url("/ws/dashboard", &token)).await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn viewer_cannot_execute_commands() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    connect_agent(&server, "agent-x").await?;
    let mut dash = connect_dashboard(&server, "viewer-1", "viewer", subscribe_all()).await?;

    dash.send(Message::CommandRequest(CommandRequest {
        command_id: None,
        agent_id: Some("agent-x".to_owned()),
        command: "rm -rf /".to_owned(),
        args: vec![],
        priority: None,
        constraints: Default::default(),
    }))
    .await?;

    let error = dash
        .recv_until(|envelope| match envelope.message {
            Message::Error(error) => Some(error),
            _ => None,
        })
        .await?;
    assert_eq!(error.code, "PERMISSION_DENIED");
    assert!(!error.recoverable);
    // Permission denials terminate the connection.
    assert_eq!(peer_close(&mut dash).await, Some(1008));
    Ok(())
}

#[tokio::test]
async fn operator_cannot_trigger_emergency_stop() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut dash = connect_dashboard(&server, "op-1", "operator", subscribe_all()).await?;

    dash.send(Message::EmergencyStop(EmergencyStop {
        reason: "oops".to_owned(),
        triggered_by: None,
    }))
    .await?;

    let error = dash
        .recv_until(|envelope| match envelope.message {
            Message::Error(error) => Some(error),
            _ => None,
        })
        .await?;
    assert_eq!(error.code, "PERMISSION_DENIED");
    Ok(())
}

async fn peer_close(peer: &mut WsPeer) -> Option<u16> {
    peer.expect_close().await.ok().flatten()
}

#[tokio::test]
async fn session_cap_evicts_and_blacklists_the_oldest() -> anyhow::Result<()> {
    let mut config = test_config();
    config.max_sessions_per_user = 2;
    let server = TestServer::start_with(config).await?;

    let _first = connect_dashboard(&server, "dash-1", "operator", subscribe_all()).await?;
    let _second = connect_dashboard(&server, "dash-1", "operator", subscribe_all()).await?;
    let _third = connect_dashboard(&server, "dash-1", "operator", subscribe_all()).await?;

    // The eviction is recorded as a security event.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let audit = server.store.audit_entries().await;
    assert!(
        audit.iter().any(|e| e.event_type == "session_invalidated"),
        "expected session_invalidated audit entry"
    );
    Ok(())
}

// -- Validation ----------------------------------------------------------------

#[tokio::test]
async fn malformed_frame_yields_validation_error_and_keeps_the_socket() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut dash = connect_dashboard(&server, "dash-1", "operator", subscribe_all()).await?;

    dash.send_raw("{\"this\": \"is not an envelope\"}".to_owned()).await?;
    let error = dash
        .recv_until(|envelope| match envelope.message {
            Message::Error(error) => Some(error),
            _ => None,
        })
        .await?;
    assert_eq!(error.code, "VALIDATION_FAILED");
    assert!(error.recoverable);

    // The connection survives: ping still works.
    let ping_id = dash.send(Message::Ping(Ping {})).await?;
    dash.recv_until(|envelope| match envelope.message {
        Message::Ack(ack) if ack.original_message_id == ping_id => Some(()),
        _ => None,
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn stale_timestamp_is_rejected_with_original_id() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut dash = connect_dashboard(&server, "dash-1", "operator", subscribe_all()).await?;

    let mut envelope = Envelope::new(Message::Ping(Ping {}));
    envelope.timestamp -= 6 * 60 * 1000; // 6 minutes: past the 5-minute skew
    let stale_id = envelope.id.clone();
    dash.send_raw(envelope.encode()?).await?;

    let error = dash
        .recv_until(|envelope| match envelope.message {
            Message::Error(error) => Some(error),
            _ => None,
        })
        .await?;
    assert_eq!(error.code, "VALIDATION_FAILED");
    assert_eq!(error.original_message_id.as_deref(), Some(stale_id.as_str()));
    Ok(())
}

#[tokio::test]
async fn oversized_frame_is_rejected() -> anyhow::Result<()> {
    let mut config = test_config();
    config.max_message_bytes = 4 * 1024;
    let server = TestServer::start_with(config).await?;
    let mut dash = connect_dashboard(&server, "dash-1", "operator", subscribe_all()).await?;

    let mut envelope = Envelope::new(Message::CommandRequest(CommandRequest {
        command_id: None,
        agent_id: Some("agent-x".to_owned()),
        command: "x".repeat(8 * 1024),
        args: vec![],
        priority: Some(50),
        constraints: Default::default(),
    }));
    envelope.timestamp = switchboard::epoch_ms();
    dash.send_raw(envelope.encode()?).await?;

    let error = dash
        .recv_until(|envelope| match envelope.message {
            Message::Error(error) => Some(error),
            _ => None,
        })
        .await?;
    assert_eq!(error.code, "VALIDATION_FAILED");
    Ok(())
}

// -- Rate limiting --------------------------------------------------------------

#[tokio::test]
async fn rate_limit_blocks_after_the_window_fills() -> anyhow::Result<()> {
    let mut config = test_config();
    config.rate_limit_max = 5;
    let server = TestServer::start_with(config).await?;
    let mut dash = connect_dashboard(&server, "dash-1", "operator", subscribe_all()).await?;

    // The limiter counted DASHBOARD_INIT? No: init happens before the rate
    // limiter sees traffic, and pings are exempt, so only these count.
    for _ in 0..5 {
        let id = dash
            .send(Message::CommandRequest(CommandRequest {
                command_id: None,
                agent_id: Some("agent-missing".to_owned()),
                command: "noop".to_owned(),
                args: vec![],
                priority: None,
                constraints: Default::default(),
            }))
            .await?;
        // Each is answered (with an error, since the agent is unknown, but
        // answered): it was admitted past the limiter.
        dash.recv_until(|envelope| match envelope.message {
            Message::Error(error) if error.original_message_id.as_deref() == Some(&id) => {
                Some(())
            }
            Message::Ack(ack) if ack.original_message_id == id => Some(()),
            _ => None,
        })
        .await?;
    }

    let id = dash
        .send(Message::CommandRequest(CommandRequest {
            command_id: None,
            agent_id: Some("agent-missing".to_owned()),
            command: "noop".to_owned(),
            args: vec![],
            priority: None,
            constraints: Default::default(),
        }))
        .await?;
    let error = dash
        .recv_until(|envelope| match envelope.message {
            Message::Error(error) if error.original_message_id.as_deref() == Some(&id) => {
                Some(error)
            }
            _ => None,
        })
        .await?;
    assert_eq!(error.code, "RATE_LIMIT");

    // Pings remain exempt even while blocked.
    let ping_id = dash.send(Message::Ping(Ping {})).await?;
    dash.recv_until(|envelope| match envelope.message {
        Message::Ack(ack) if ack.original_message_id == ping_id => Some(()),
        _ => None,
    })
    .await?;
    Ok(())
}

// -- Agent reconnect takes over -------------------------------------------------

#[tokio::test]
async fn agent_reconnect_evicts_the_prior_socket() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut first = connect_agent(&server, "agent-x").await?;
    let _second = connect_agent(&server, "agent-x").await?;

    // The first socket is closed by the server.
    let closed = first.expect_close().await;
    assert!(closed.is_ok());

    // Only one connection remains.
    let client = reqwest::Client::new();
    let stats: serde_json::Value = client
        .get(format!("{}/stats", server.base_url()))
        .bearer_auth(server.token("ops", "admin"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(stats["registry"]["agents"], 1);
    Ok(())
}

// -- Dashboard init narrows subscriptions ---------------------------------------

#[tokio::test]
async fn subscription_filter_excludes_other_agents() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut agent_a = connect_agent(&server, "agent-a").await?;
    connect_agent(&server, "agent-b").await?;

    let mut narrow = connect_dashboard(
        &server,
        "dash-1",
        "operator",
        switchboard::protocol::SubscriptionSpec {
            agents: vec!["agent-a".to_owned()],
            commands: vec![],
            traces: true,
            terminals: true,
        },
    )
    .await?;
    let mut wide = connect_dashboard(&server, "dash-2", "operator", subscribe_all()).await?;

    // A command for agent-a is visible to both dashboards.
    wide.send(Message::CommandRequest(CommandRequest {
        command_id: None,
        agent_id: Some("agent-a".to_owned()),
        command: "visible".to_owned(),
        args: vec![],
        priority: Some(50),
        constraints: Default::default(),
    }))
    .await?;
    let command_id = await_request(&mut agent_a).await?;

    narrow
        .recv_until(|envelope| match envelope.message {
            Message::CommandStatus(update) if update.command_id == command_id => Some(()),
            _ => None,
        })
        .await?;

    // A command for agent-b never reaches the narrow dashboard, but its
    // queued status does reach the wide one.
    wide.send(Message::CommandRequest(CommandRequest {
        command_id: None,
        agent_id: Some("agent-b".to_owned()),
        command: "invisible".to_owned(),
        args: vec![],
        priority: Some(50),
        constraints: Default::default(),
    }))
    .await?;
    let b_command = wide
        .recv_until(|envelope| match envelope.message {
            Message::CommandStatus(update) if update.status == CommandStatus::Queued => {
                Some(update.command_id)
            }
            _ => None,
        })
        .await?;

    // Narrow sees nothing for agent-b; prove it by pinging and seeing the
    // ack arrive with no interleaved agent-b status.
    let ping_id = narrow.send(Message::Ping(Ping {})).await?;
    let leaked = narrow
        .recv_until(move |envelope| match envelope.message {
            Message::CommandStatus(update) if update.command_id == b_command => Some(true),
            Message::Ack(ack) if ack.original_message_id == ping_id => Some(false),
            _ => None,
        })
        .await?;
    assert!(!leaked, "agent-b status leaked past the filter");
    Ok(())
}

async fn await_request(agent: &mut WsPeer) -> anyhow::Result<String> {
    agent
        .recv_until(|envelope| match envelope.message {
            Message::CommandRequest(request) => request.command_id,
            _ => None,
        })
        .await
}

// -- REST surface ---------------------------------------------------------------

#[tokio::test]
async fn health_probes_answer_without_auth() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let client = reqwest::Client::new();

    let live: serde_json::Value =
        client.get(format!("{}/health/live", server.base_url())).send().await?.json().await?;
    assert_eq!(live["status"], "ok");

    let ready: serde_json::Value =
        client.get(format!("{}/health/ready", server.base_url())).send().await?.json().await?;
    assert_eq!(ready["status"], "ok");
    assert_eq!(ready["services"]["store"], "ok");
    Ok(())
}

#[tokio::test]
async fn auth_verify_introspects_tokens() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let client = reqwest::Client::new();

    let good: serde_json::Value = client
        .post(format!("{}/auth/verify", server.base_url()))
        .json(&serde_json::json!({ "token": server.token("user-1", "operator") }))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(good["valid"], true);
    assert_eq!(good["user_id"], "user-1");

    let bad: serde_json::Value = client
        .post(format!("{}/auth/verify", server.base_url()))
        .json(&serde_json::json!({ "token": "garbage" }))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(bad["valid"], false);
    assert_eq!(bad["error"], "AUTH_FAILED");
    Ok(())
}

#[tokio::test]
async fn rest_requires_a_bearer_token() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let client = reqwest::Client::new();

    let response = client.get(format!("{}/agents", server.base_url())).send().await?;
    assert_eq!(response.status(), 401);

    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["error"]["code"], "AUTH_FAILED");
    Ok(())
}

#[tokio::test]
async fn rest_execute_enqueues_and_reports_position() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let mut agent = connect_agent(&server, "agent-x").await?;
    let client = reqwest::Client::new();

    let response: serde_json::Value = client
        .post(format!("{}/agents/agent-x/execute", server.base_url()))
        .bearer_auth(server.token("ops", "operator"))
        .json(&serde_json::json!({ "command": "echo rest", "priority": 70 }))
        .send()
        .await?
        .json()
        .await?;

    assert_eq!(response["agentId"], "agent-x");
    assert_eq!(response["queuePosition"], 1);
    let command_id = await_request(&mut agent).await?;
    assert_eq!(response["commandId"], command_id);

    // Status endpoint reflects the connected agent.
    let status: serde_json::Value = client
        .get(format!("{}/agents/agent-x/status", server.base_url()))
        .bearer_auth(server.token("ops", "operator"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(status["status"], "online");
    Ok(())
}

// -- Reconnection backoff (scenario 5, agent side) ------------------------------

#[tokio::test]
async fn backoff_delays_double_with_floor_and_cap() -> anyhow::Result<()> {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use switchboard_agent::reconnect::{delay_for_attempt, ReconnectConfig};

    let config = ReconnectConfig::default();
    for seed in 0..20 {
        let mut rng = StdRng::seed_from_u64(seed);
        let delays: Vec<f64> =
            (0..10).map(|a| delay_for_attempt(&config, a, &mut rng).as_secs_f64()).collect();

        for &delay in &delays {
            anyhow::ensure!(delay >= 1.0, "delay below 1s floor");
            anyhow::ensure!(delay <= 33.0, "delay above jittered cap");
        }
        for pair in delays.windows(2) {
            let capped = pair[0] >= 30.0 * 0.9;
            if !capped {
                let ratio = pair[1] / pair[0];
                anyhow::ensure!(
                    (1.6..=2.5).contains(&ratio),
                    "ratio {ratio} outside the doubling band"
                );
            }
        }
    }
    Ok(())
}

// -- Dashboard init narrows to an unknown user ----------------------------------

#[tokio::test]
async fn init_user_must_match_the_token_subject() -> anyhow::Result<()> {
    let server = TestServer::start().await?;
    let token = server.token("dash-1", "operator");
    let mut peer = WsPeer::connect(&server.ws_url("/ws/dashboard", &token)).await?;

    peer.send(Message::DashboardInit(DashboardInit {
        user_id: "someone-else".to_owned(),
        subscriptions: subscribe_all(),
    }))
    .await?;
    assert_eq!(peer.expect_close().await?, Some(1008));
    Ok(())
}
