// Copyright (C) 2024 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! An ICE agent (RFC 8445) with STUN (RFC 8489) and TURN (RFC 8656)
//! client support for establishing peer-to-peer UDP datagram paths across
//! NATs.
//!
//! This crate pairs the sans-IO protocol engine from `floe-proto` with a
//! single UDP socket and a per-agent worker thread.  Each [`Agent`]
//! gathers host, server reflexive and relayed candidates, runs
//! connectivity checks against the candidates of the remote peer, and
//! once a pair is nominated relays application datagrams over it, either
//! directly or through a TURN relay.
//!
//! ```no_run
//! use floe::{Agent, AgentConfig};
//!
//! let config = AgentConfig {
//!     stun_server: Some("stun.example.org:3478".into()),
//!     ..Default::default()
//! };
//! let agent = Agent::new(config).unwrap();
//! agent.on_candidate(|line| println!("local candidate: {line}"));
//! agent.gather_candidates().unwrap();
//! ```

pub mod agent;
mod socket;

pub use agent::{Agent, AgentConfig, AgentError, TurnServer};
pub use floe_proto::agent::ConnectionState;
pub use floe_proto::candidate::{Candidate, CandidateType};
