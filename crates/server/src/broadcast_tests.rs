// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::events::SubscriptionFilter;
use crate::protocol::{decode, OutputStream, SubscriptionSpec, TerminalChunk};
use crate::registry::OutboundQueue;

fn chunk(agent: &str, command: &str, seq: u64) -> Message {
    Message::TerminalStream(TerminalChunk {
        command_id: command.to_owned(),
        agent_id: agent.to_owned(),
        stream: OutputStream::Stdout,
        content: format!("line {seq}\n"),
        sequence: seq,
    })
}

fn pop_frame(queue: &OutboundQueue) -> Option<String> {
    queue.drain_now().into_iter().find_map(|o| match o {
        Outbound::Frame(f) => Some(f.to_string()),
        _ => None,
    })
}

#[test]
fn fans_out_to_matching_dashboards_only() {
    let registry = Arc::new(ConnectionRegistry::new(10, 8));
    let broadcaster = Broadcaster::new(Arc::clone(&registry), None, 1024);

    let wide = registry.add_dashboard("user-1").unwrap();
    let narrow = registry.add_dashboard("user-2").unwrap();
    *narrow.filter.lock() = SubscriptionFilter::from(SubscriptionSpec {
        agents: vec!["agent-other".to_owned()],
        commands: vec![],
        traces: true,
        terminals: true,
    });

    let outcome = broadcaster.broadcast(chunk("agent-x", "cmd-1", 1));
    assert_eq!(outcome.matched, 1);
    assert_eq!(outcome.delivered, 1);
    assert_eq!(outcome.dropped, 0);

    assert!(pop_frame(&wide.outbound).is_some());
    assert!(pop_frame(&narrow.outbound).is_none());
}

#[test]
fn agents_never_receive_dashboard_broadcasts() {
    let registry = Arc::new(ConnectionRegistry::new(10, 8));
    let broadcaster = Broadcaster::new(Arc::clone(&registry), None, 1024);
    let (agent, _) = registry.add_agent("agent-x").unwrap();
    registry.add_dashboard("user-1").unwrap();

    broadcaster.broadcast(chunk("agent-x", "cmd-1", 1));
    assert!(agent.outbound.is_empty());
}

#[test]
fn per_destination_order_is_submission_order() {
    let registry = Arc::new(ConnectionRegistry::new(10, 64));
    let broadcaster = Broadcaster::new(Arc::clone(&registry), None, 1024);
    let dash = registry.add_dashboard("user-1").unwrap();

    for seq in 1..=5 {
        broadcaster.broadcast(chunk("agent-x", "cmd-1", seq));
    }

    let sequences: Vec<u64> = dash
        .outbound
        .drain_now()
        .into_iter()
        .filter_map(|o| match o {
            Outbound::Frame(f) => decode(&f, 1024 * 1024, 300_000).ok(),
            _ => None,
        })
        .filter_map(|env| match env.message {
            Message::TerminalStream(c) => Some(c.sequence),
            _ => None,
        })
        .collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
}

#[test]
fn overflow_drops_oldest_and_counts_it() {
    let registry = Arc::new(ConnectionRegistry::new(10, 2));
    let broadcaster = Broadcaster::new(Arc::clone(&registry), None, 1024);
    let dash = registry.add_dashboard("user-1").unwrap();

    for seq in 1..=3 {
        broadcaster.broadcast(chunk("agent-x", "cmd-1", seq));
    }

    assert_eq!(broadcaster.stats().dropped, 1);
    assert_eq!(dash.outbound.len(), 2);
    // Oldest (seq 1) was evicted; the survivors keep their order.
    let first = pop_frame(&dash.outbound).unwrap();
    assert!(first.contains("line 2"));
}

#[test]
fn one_full_queue_does_not_block_others() {
    let registry = Arc::new(ConnectionRegistry::new(10, 1));
    let broadcaster = Broadcaster::new(Arc::clone(&registry), None, 1024);
    let slow = registry.add_dashboard("user-slow").unwrap();
    let fast = registry.add_dashboard("user-fast").unwrap();

    // Fill slow's queue, then keep broadcasting.
    broadcaster.broadcast(chunk("agent-x", "cmd-1", 1));
    fast.outbound.drain_now();
    broadcaster.broadcast(chunk("agent-x", "cmd-1", 2));

    // Fast still got the latest frame; slow holds exactly one (the newest).
    assert!(pop_frame(&fast.outbound).unwrap().contains("line 2"));
    assert!(pop_frame(&slow.outbound).unwrap().contains("line 2"));
}

#[test]
fn compressed_broadcast_round_trips() {
    let registry = Arc::new(ConnectionRegistry::new(10, 8));
    let broadcaster = Broadcaster::new(Arc::clone(&registry), Some(Algorithm::Gzip), 256);
    let dash = registry.add_dashboard("user-1").unwrap();

    let big = Message::TerminalStream(TerminalChunk {
        command_id: "cmd-1".to_owned(),
        agent_id: "agent-x".to_owned(),
        stream: OutputStream::Stdout,
        content: "repetitive payload ".repeat(100),
        sequence: 9,
    });
    broadcaster.broadcast(big);

    let frame = pop_frame(&dash.outbound).unwrap();
    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(value["type"], "compressed");

    let decoded = decode(&frame, 1024 * 1024, 300_000).unwrap();
    match decoded.message {
        Message::TerminalStream(c) => assert_eq!(c.sequence, 9),
        other => panic!("wrong variant: {other:?}"),
    }
}

#[test]
fn send_to_agents_reaches_every_agent() {
    let registry = Arc::new(ConnectionRegistry::new(10, 8));
    let broadcaster = Broadcaster::new(Arc::clone(&registry), None, 1024);
    let (a1, _) = registry.add_agent("agent-x").unwrap();
    let (a2, _) = registry.add_agent("agent-y").unwrap();
    let dash = registry.add_dashboard("user-1").unwrap();

    let sent = broadcaster.send_to_agents(Message::EmergencyStop(
        crate::protocol::EmergencyStop { reason: "drill".to_owned(), triggered_by: None },
    ));
    assert_eq!(sent, 2);
    assert!(pop_frame(&a1.outbound).is_some());
    assert!(pop_frame(&a2.outbound).is_some());
    assert!(dash.outbound.is_empty());
}
