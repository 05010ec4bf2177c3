// Copyright (C) 2024 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A sans-IO implementation of an ICE agent (RFC 8445) with STUN (RFC 8489)
//! and TURN (RFC 8656) client support.
//!
//! Nothing in this crate performs any I/O or reads the clock.  The
//! [`Agent`](agent::Agent) is driven by feeding it received datagrams and
//! polling it with a caller-provided [`Instant`](std::time::Instant); it
//! hands back datagrams to transmit and a deadline to wake up at.  An I/O
//! layer that connects the agent to a UDP socket and a worker thread lives
//! in the `floe` crate.

pub mod agent;
pub mod candidate;
mod rand;
pub mod stun;
pub mod turn;
