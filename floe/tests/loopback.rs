// Copyright (C) 2024 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Two agents on the same machine negotiating a host-candidate path over
//! real sockets.

use std::sync::mpsc;
use std::time::Duration;

use floe::{Agent, AgentConfig, ConnectionState};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;

fn init() -> tracing::subscriber::DefaultGuard {
    let level_filter = std::env::var("FLOE_LOG")
        .or(std::env::var("RUST_LOG"))
        .ok()
        .and_then(|var| var.parse::<tracing_subscriber::filter::Targets>().ok())
        .unwrap_or(tracing_subscriber::filter::Targets::new().with_default(tracing::Level::INFO));
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_filter(level_filter),
    );
    tracing::subscriber::set_default(registry)
}

struct TestAgent {
    agent: Agent,
    states: mpsc::Receiver<ConnectionState>,
    gathered: mpsc::Receiver<()>,
    received: mpsc::Receiver<Vec<u8>>,
}

fn test_agent(controlling: bool) -> TestAgent {
    let agent = Agent::new(AgentConfig {
        controlling: Some(controlling),
        ..Default::default()
    })
    .unwrap();
    let (state_tx, states) = mpsc::channel();
    let (gathered_tx, gathered) = mpsc::channel();
    let (recv_tx, received) = mpsc::channel();
    agent.on_state_change(move |state| {
        let _ = state_tx.send(state);
    });
    agent.on_gathering_done(move || {
        let _ = gathered_tx.send(());
    });
    agent.on_recv(move |data| {
        let _ = recv_tx.send(data.to_vec());
    });
    TestAgent {
        agent,
        states,
        gathered,
        received,
    }
}

fn wait_for_state(test: &TestAgent, wanted: ConnectionState, timeout: Duration) {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(std::time::Instant::now())
            .expect("timed out waiting for state");
        match test.states.recv_timeout(remaining) {
            Ok(state) if state == wanted => return,
            Ok(_) => {}
            Err(e) => panic!("timed out waiting for {wanted:?}: {e}"),
        }
    }
}

fn exchange(local: &TestAgent, remote: &TestAgent) {
    let description = remote.agent.local_description();
    local.agent.set_remote_description(&description).unwrap();
    local.agent.set_remote_gathering_done();
}

#[test]
fn host_to_host_connection() {
    let _log = init();
    let controlling = test_agent(true);
    let controlled = test_agent(false);

    controlling.agent.gather_candidates().unwrap();
    controlled.agent.gather_candidates().unwrap();
    controlling
        .gathered
        .recv_timeout(Duration::from_secs(2))
        .expect("controlling agent did not finish gathering");
    controlled
        .gathered
        .recv_timeout(Duration::from_secs(2))
        .expect("controlled agent did not finish gathering");

    exchange(&controlling, &controlled);
    exchange(&controlled, &controlling);

    // both sides converge within a few seconds, passing through
    // connected on the way to completed
    wait_for_state(&controlling, ConnectionState::Connected, Duration::from_secs(5));
    wait_for_state(&controlling, ConnectionState::Completed, Duration::from_secs(5));
    wait_for_state(&controlled, ConnectionState::Completed, Duration::from_secs(5));

    let pair = controlling.agent.selected_candidate_pair();
    assert!(pair.is_some());

    // datagrams flow in both directions over the selected pair
    controlling.agent.send(b"ping from controlling").unwrap();
    let data = controlled
        .received
        .recv_timeout(Duration::from_secs(2))
        .expect("controlled agent received nothing");
    assert_eq!(data, b"ping from controlling");

    controlled.agent.send(b"pong from controlled").unwrap();
    let data = controlling
        .received
        .recv_timeout(Duration::from_secs(2))
        .expect("controlling agent received nothing");
    assert_eq!(data, b"pong from controlled");

    controlling.agent.close();
    controlled.agent.close();
}
