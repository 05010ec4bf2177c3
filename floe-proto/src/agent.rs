// Copyright (C) 2024 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! ICE Agent
//!
//! The agent state machine of RFC 8445: candidate gathering over STUN and
//! TURN servers, prioritized connectivity checks with pacing and
//! retransmission, role negotiation and nomination, and the TURN
//! allocation lifecycle, all multiplexed over one UDP socket.
//!
//! The agent is sans-IO.  Feed received datagrams in with
//! [`Agent::handle_incoming`], drive timers with [`Agent::poll`] using a
//! caller-provided [`Instant`], and transmit whatever
//! [`Agent::poll_transmit`] returns.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::candidate::{
    pair_priority, Candidate, CandidatePair, CandidatePairState, CandidateType,
};
use crate::rand::{generate_random_ice_string, rand_u64, ICE_ALPHABET};
use crate::stun::attribute::{
    ErrorCode, IceControlled, IceControlling, Nonce, PasswordAlgorithms, Priority, Realm,
    UseCandidate, Username, XorMappedAddress, ERROR_CODE, FINGERPRINT, ICE_CONTROLLED,
    ICE_CONTROLLING, MESSAGE_INTEGRITY, MESSAGE_INTEGRITY_SHA256, NONCE, PASSWORD_ALGORITHMS,
    PRIORITY, REALM, USERNAME, USE_CANDIDATE, XOR_MAPPED_ADDRESS,
};
use crate::stun::message::{
    IntegrityAlgorithm, Message, MessageClass, MessageIntegrityCredentials, ShortTermCredentials,
    TransactionId, BINDING,
};
use crate::turn::attribute::{
    ChannelNumber, Data as DataAttribute, DontFragment, Lifetime, RequestedTransport,
    XorPeerAddress, XorRelayedAddress, DATA as DATA_ATTRIBUTE, LIFETIME, XOR_PEER_ADDRESS,
    XOR_RELAYED_ADDRESS,
};
use crate::turn::message::{ALLOCATE, CHANNEL_BIND, CREATE_PERMISSION, DATA, REFRESH, SEND};
use crate::turn::{
    channel_data_encode, is_channel_data, TurnCredentials, TurnState, PERMISSION_LIFETIME,
    TURN_LIFETIME,
};

/// Keepalive period for nominated pairs and server reflexive bindings.
pub const STUN_KEEPALIVE_PERIOD: Duration = Duration::from_secs(15);
/// Minimum spacing between initial transmissions of distinct entries.
pub const STUN_PACING_TIME: Duration = Duration::from_millis(50);
/// Initial STUN retransmission timeout.
pub const MIN_STUN_RETRANSMISSION_TIMEOUT: Duration = Duration::from_millis(500);
/// Upper bound on the exponentially growing retransmission timeout.
pub const MAX_STUN_RETRANSMISSION_TIMEOUT: Duration = Duration::from_secs(8);
/// Number of retransmissions after the initial request.
pub const MAX_STUN_RETRANSMISSION_COUNT: i32 = 7;
/// How long after all checks have ended without success before the session
/// is failed.
pub const ICE_FAIL_TIMEOUT: Duration = Duration::from_secs(30);
/// How often a TURN allocation is refreshed.
pub const TURN_REFRESH_PERIOD: Duration = Duration::from_secs(300);

pub const MAX_HOST_CANDIDATES_COUNT: usize = 8;
pub const MAX_PEER_REFLEXIVE_CANDIDATES_COUNT: usize = 8;
pub const ICE_MAX_CANDIDATES_COUNT: usize = 32;
pub const MAX_CANDIDATE_PAIRS_COUNT: usize = 64;
pub const MAX_STUN_ENTRIES_COUNT: usize = 72;
pub const MAX_SERVER_ENTRIES_COUNT: usize = 2;
pub const MAX_RELAY_ENTRIES_COUNT: usize = 2;

/// Ceiling on the delay between two bookkeeping passes.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Pseudo error code recorded when a response fails local integrity
/// verification.  Outside the wire-valid range and never serialized; it
/// marks the entry failed without the warning a real error response logs.
const ERROR_INTERNAL_VALIDATION_FAILED: u16 = 700;

/// The ICE role of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    Unknown,
    Controlling,
    Controlled,
}

/// The coarse connection state of an [`Agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Gathering,
    Connecting,
    Connected,
    Completed,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&format!("{self:?}"))
    }
}

/// ICE credentials: a username fragment and a password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// The username fragment
    pub ufrag: String,
    /// The password
    pub pwd: String,
}

impl Credentials {
    pub fn new(ufrag: String, pwd: String) -> Self {
        Self { ufrag, pwd }
    }

    fn generate() -> Self {
        Self {
            ufrag: generate_random_ice_string(ICE_ALPHABET, 4),
            pwd: generate_random_ice_string(ICE_ALPHABET, 22),
        }
    }
}

/// A datagram to be sent over the agent's socket.
#[derive(Debug, Clone)]
pub struct Transmit {
    /// The payload
    pub data: Vec<u8>,
    /// The destination address
    pub to: SocketAddr,
}

/// Events produced while the agent makes progress.
#[derive(Debug)]
pub enum AgentEvent {
    /// The coarse connection state changed
    StateChange(ConnectionState),
    /// A local candidate is ready to be signalled to the peer
    LocalCandidate(Candidate),
    /// Local candidate gathering has finished
    GatheringDone,
    /// A pair has been selected for data transfer
    SelectedPair {
        local: Option<Candidate>,
        remote: Candidate,
    },
}

/// Return value of [`Agent::poll`].
#[derive(Debug)]
pub enum AgentPoll {
    /// Call [`Agent::poll`] again at the provided time (or earlier if a
    /// datagram arrives)
    WaitUntil(Instant),
    /// An event to act on.  Poll again immediately.
    Event(AgentEvent),
}

/// Errors returned by agent operations.
#[derive(Debug, PartialEq, Eq)]
pub enum AgentError {
    /// No candidate pair has been selected yet
    NotConnected,
    /// The operation is not valid in the current state
    InvalidState,
    /// The remote description was already marked complete
    RemoteGatheringDone,
    /// A bound on candidates, pairs or entries was reached
    TooMany,
    /// A STUN message could not be produced
    Stun(crate::stun::message::StunError),
}

impl std::error::Error for AgentError {}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<crate::stun::message::StunError> for AgentError {
    fn from(e: crate::stun::message::StunError) -> Self {
        AgentError::Stun(e)
    }
}

impl From<crate::stun::attribute::StunParseError> for AgentError {
    fn from(e: crate::stun::attribute::StunParseError) -> Self {
        AgentError::Stun(e.into())
    }
}

/// Configuration for one TURN server.
#[derive(Debug, Clone)]
pub struct TurnServerConfig {
    /// The resolved transport address of the server
    pub addr: SocketAddr,
    /// The long-term credentials for the server
    pub credentials: TurnCredentials,
}

/// A snapshot of the selected transmission route, for I/O layers that
/// want to send without consulting the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedRoute {
    /// The remote peer address
    pub peer: SocketAddr,
    /// When relayed: the TURN server address and the bound channel, if any
    pub relay: Option<(SocketAddr, Option<u16>)>,
}

/// A builder for an [`Agent`].
#[derive(Debug, Default)]
pub struct AgentBuilder {
    stun_servers: Vec<SocketAddr>,
    turn_servers: Vec<TurnServerConfig>,
    controlling: Option<bool>,
    tie_breaker: Option<u64>,
}

impl AgentBuilder {
    /// Add a STUN server to gather server reflexive candidates from
    pub fn stun_server(mut self, addr: SocketAddr) -> Self {
        self.stun_servers.push(addr);
        self
    }

    /// Add a TURN server to allocate a relayed candidate on
    pub fn turn_server(mut self, config: TurnServerConfig) -> Self {
        self.turn_servers.push(config);
        self
    }

    /// Force the initial role instead of deriving it from the signalling
    /// order
    pub fn controlling(mut self, controlling: bool) -> Self {
        self.controlling = Some(controlling);
        self
    }

    /// Use a fixed tie breaker value instead of a random one
    pub fn tie_breaker(mut self, tie_breaker: u64) -> Self {
        self.tie_breaker = Some(tie_breaker);
        self
    }

    /// Build the [`Agent`]
    pub fn build(mut self) -> Agent {
        self.stun_servers.truncate(MAX_SERVER_ENTRIES_COUNT);
        self.turn_servers.truncate(MAX_RELAY_ENTRIES_COUNT);
        Agent {
            local: Description::new(Credentials::generate()),
            remote: Description::new(Credentials::new(String::new(), String::new())),
            remote_credentials_known: false,
            pairs: vec![],
            ordered_pairs: vec![],
            entries: vec![],
            role: match self.controlling {
                Some(true) => IceRole::Controlling,
                Some(false) => IceRole::Controlled,
                None => IceRole::Unknown,
            },
            tie_breaker: self.tie_breaker.unwrap_or_else(rand_u64),
            state: ConnectionState::Disconnected,
            selected_pair: None,
            selected_entry: None,
            fail_time: None,
            events: VecDeque::new(),
            transmits: VecDeque::new(),
            stun_servers: self.stun_servers,
            turn_servers: self.turn_servers,
            gathering_started: false,
        }
    }
}

#[derive(Debug)]
struct Description {
    credentials: Credentials,
    candidates: Vec<Candidate>,
    finished: bool,
}

impl Description {
    fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            candidates: vec![],
            finished: false,
        }
    }

    fn count_of(&self, ctype: CandidateType) -> usize {
        self.candidates
            .iter()
            .filter(|c| c.candidate_type == ctype)
            .count()
    }

    /// Add a candidate, deduplicating against kind and resolved address.
    /// Returns the index of the added candidate, or `None` when it was a
    /// duplicate or a bound was reached.
    fn add_candidate(&mut self, candidate: Candidate) -> Option<usize> {
        if self.candidates.iter().any(|c| c.is_duplicate(&candidate)) {
            trace!("dropping duplicate candidate {candidate}");
            return None;
        }
        let cap = match candidate.candidate_type {
            CandidateType::Host => MAX_HOST_CANDIDATES_COUNT,
            CandidateType::PeerReflexive => MAX_PEER_REFLEXIVE_CANDIDATES_COUNT,
            _ => ICE_MAX_CANDIDATES_COUNT,
        };
        if self.count_of(candidate.candidate_type) >= cap
            || self.candidates.len() >= ICE_MAX_CANDIDATES_COUNT
        {
            debug!("candidate bound reached, dropping {candidate}");
            return None;
        }
        self.candidates.push(candidate);
        Some(self.candidates.len() - 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Check,
    Server,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Idle,
    Pending,
    Cancelled,
    Failed,
    Succeeded,
    SucceededKeepalive,
}

/// One scheduled STUN transaction context.
#[derive(Debug)]
struct StunEntry {
    kind: EntryKind,
    state: EntryState,
    /// The owning pair, for check entries
    pair: Option<usize>,
    /// The relay entry a relayed check sends through
    relay: Option<usize>,
    /// The destination: the peer for checks, the server otherwise
    record: SocketAddr,
    /// The allocated relayed address, for relay entries
    relayed: Option<SocketAddr>,
    transaction_id: TransactionId,
    next_transmission: Option<Instant>,
    retransmissions: i32,
    retransmission_timeout: Duration,
    /// Debounces keepalive rearming; cleared by every application send
    armed: bool,
    /// The role attribute the last transmitted check asserted
    asserted_controlling: Option<bool>,
    /// Allocation state, for relay entries
    turn: Option<TurnState>,
}

impl StunEntry {
    fn new(kind: EntryKind, record: SocketAddr) -> Self {
        Self {
            kind,
            state: EntryState::Idle,
            pair: None,
            relay: None,
            record,
            relayed: None,
            transaction_id: TransactionId::generate(),
            next_transmission: None,
            retransmissions: 0,
            retransmission_timeout: MIN_STUN_RETRANSMISSION_TIMEOUT,
            armed: false,
            asserted_controlling: None,
            turn: None,
        }
    }

    fn is_gathering(&self) -> bool {
        matches!(self.kind, EntryKind::Server | EntryKind::Relay)
    }

    fn keepalive_period(&self) -> Duration {
        match self.kind {
            EntryKind::Relay => TURN_REFRESH_PERIOD,
            _ => STUN_KEEPALIVE_PERIOD,
        }
    }

    /// Reset the transaction for a fresh round of transmissions.
    fn restart_transaction(&mut self) {
        self.transaction_id = TransactionId::generate();
        self.retransmissions = MAX_STUN_RETRANSMISSION_COUNT;
        self.retransmission_timeout = MIN_STUN_RETRANSMISSION_TIMEOUT;
        self.state = EntryState::Pending;
        self.armed = false;
    }
}

/// An ICE agent.
///
/// The agent owns a single non-relayed local base (the one UDP socket the
/// I/O layer binds); candidate pairs that send from that base reference no
/// local candidate.
#[derive(Debug)]
pub struct Agent {
    local: Description,
    remote: Description,
    remote_credentials_known: bool,
    pairs: Vec<CandidatePair>,
    /// Indices into `pairs`, sorted by descending pair priority
    ordered_pairs: Vec<usize>,
    entries: Vec<StunEntry>,
    role: IceRole,
    tie_breaker: u64,
    state: ConnectionState,
    selected_pair: Option<usize>,
    selected_entry: Option<usize>,
    fail_time: Option<Instant>,
    events: VecDeque<AgentEvent>,
    transmits: VecDeque<Transmit>,
    stun_servers: Vec<SocketAddr>,
    turn_servers: Vec<TurnServerConfig>,
    gathering_started: bool,
}

impl Agent {
    /// Create a builder for an [`Agent`]
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    /// The local ICE credentials
    pub fn local_credentials(&self) -> &Credentials {
        &self.local.credentials
    }

    /// The current role of the agent
    pub fn role(&self) -> IceRole {
        self.role
    }

    /// The current tie breaker value
    pub fn tie_breaker(&self) -> u64 {
        self.tie_breaker
    }

    /// The coarse connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The local candidates gathered so far
    pub fn local_candidates(&self) -> &[Candidate] {
        &self.local.candidates
    }

    /// Whether local gathering has completed
    pub fn gathering_done(&self) -> bool {
        self.local.finished
    }

    /// The selected candidate pair, once one has been nominated or
    /// tentatively selected.  The local side is `None` while the pair
    /// sends from the agent's base without a matching local candidate.
    pub fn selected_candidate_pair(&self) -> Option<(Option<&Candidate>, &Candidate)> {
        let pair = &self.pairs[self.selected_pair?];
        Some((
            pair.local.map(|i| &self.local.candidates[i]),
            &self.remote.candidates[pair.remote],
        ))
    }

    /// A snapshot of the currently selected route, if any.
    pub fn selected_route(&self) -> Option<SelectedRoute> {
        let entry = &self.entries[self.selected_entry?];
        let relay = entry.relay.map(|relay_idx| {
            let relay_entry = &self.entries[relay_idx];
            let channel = relay_entry.turn.as_ref().and_then(|turn| {
                turn.map
                    .get_bound_channel(entry.record)
                    .filter(|(_c, bound)| *bound)
                    .map(|(c, _bound)| c)
            });
            (relay_entry.record, channel)
        });
        Some(SelectedRoute {
            peer: entry.record,
            relay,
        })
    }

    /// Start gathering candidates.  `host_addrs` are the local socket
    /// addresses to advertise as host candidates; server and relay entries
    /// are scheduled against the configured servers with their initial
    /// transmissions paced apart.
    ///
    /// An agent that gathers before seeing the remote description assumes
    /// the controlling role.
    pub fn gather_candidates(
        &mut self,
        host_addrs: &[SocketAddr],
        now: Instant,
    ) -> Result<(), AgentError> {
        if self.gathering_started {
            return Err(AgentError::InvalidState);
        }
        self.gathering_started = true;
        if self.role == IceRole::Unknown {
            self.role = IceRole::Controlling;
        }
        self.set_state(ConnectionState::Gathering);

        for addr in host_addrs.iter().take(MAX_HOST_CANDIDATES_COUNT - 1) {
            let candidate = Candidate::builder(CandidateType::Host, *addr).build();
            if let Some(idx) = self.local.add_candidate(candidate) {
                let candidate = self.local.candidates[idx].clone();
                info!("new local candidate {candidate}");
                self.events.push_back(AgentEvent::LocalCandidate(candidate));
            }
        }

        let mut delay = Duration::ZERO;
        let turn_servers = self.turn_servers.clone();
        for server in &turn_servers {
            let mut entry = StunEntry::new(EntryKind::Relay, server.addr);
            entry.turn = Some(TurnState::new(server.credentials.clone()));
            entry.restart_transaction();
            let idx = self.push_entry(entry)?;
            self.arm_transmission(idx, delay, now);
            delay += STUN_PACING_TIME;
        }
        let stun_servers = self.stun_servers.clone();
        for server in &stun_servers {
            let mut entry = StunEntry::new(EntryKind::Server, *server);
            entry.restart_transaction();
            let idx = self.push_entry(entry)?;
            self.arm_transmission(idx, delay, now);
            delay += STUN_PACING_TIME;
        }

        self.update_gathering_done();
        Ok(())
    }

    /// Set the remote ICE credentials.  An agent that learns the remote
    /// description before gathering assumes the controlled role.  Pairs
    /// waiting on the remote password are unfrozen.
    pub fn set_remote_credentials(&mut self, credentials: Credentials, now: Instant) {
        if self.role == IceRole::Unknown {
            self.role = IceRole::Controlled;
        }
        self.remote.credentials = credentials;
        self.remote_credentials_known = true;
        self.unfreeze_pairs(now);
    }

    /// Add a remote candidate, synthesizing candidate pairs against the
    /// local base and every relayed local candidate of a matching family.
    pub fn add_remote_candidate(
        &mut self,
        candidate: Candidate,
        now: Instant,
    ) -> Result<(), AgentError> {
        if self.remote.finished {
            return Err(AgentError::RemoteGatheringDone);
        }
        self.add_remote_candidate_internal(candidate, now);
        Ok(())
    }

    /// Mark the remote description as complete.  The failure watchdog
    /// re-arms with the shorter deadline.
    pub fn set_remote_gathering_done(&mut self) {
        self.remote.finished = true;
        self.fail_time = None;
    }

    /// Send an application datagram over the selected pair.  Fails until a
    /// check has succeeded and a pair has been selected.
    pub fn send(&mut self, data: &[u8], now: Instant) -> Result<Transmit, AgentError> {
        let entry_idx = self.selected_entry.ok_or(AgentError::NotConnected)?;
        self.entries[entry_idx].armed = false;
        let peer = self.entries[entry_idx].record;
        match self.entries[entry_idx].relay {
            Some(relay_idx) => self.relay_send(relay_idx, peer, data, now),
            None => Ok(Transmit {
                data: data.to_vec(),
                to: peer,
            }),
        }
    }

    /// Record that the caller transmitted application data over the
    /// selected route itself.  Clears the keepalive arming so the next
    /// bookkeeping pass pushes the keepalive out again.
    pub fn note_application_send(&mut self) {
        if let Some(entry_idx) = self.selected_entry {
            self.entries[entry_idx].armed = false;
        }
    }

    /// Poll the agent for events and the next wakeup time.
    pub fn poll(&mut self, now: Instant) -> AgentPoll {
        if let Some(event) = self.events.pop_front() {
            return AgentPoll::Event(event);
        }
        let next = self.bookkeeping(now);
        if let Some(event) = self.events.pop_front() {
            return AgentPoll::Event(event);
        }
        AgentPoll::WaitUntil(next)
    }

    /// The next datagram waiting to be transmitted.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Process a datagram received on the agent's socket.  Returns
    /// application data to deliver, if the datagram carried any.
    pub fn handle_incoming(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, AgentError> {
        if data.is_empty() {
            // interrupt datagram
            return Ok(None);
        }
        self.input(data, from, None, now)
    }

    fn input(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        via_relay: Option<usize>,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, AgentError> {
        if via_relay.is_none() && is_channel_data(data) {
            let Some(relay_idx) = self.find_relay_entry(from) else {
                trace!("dropping ChannelData from non-relay source {from}");
                return Ok(None);
            };
            let Ok((channel, payload)) = crate::turn::channel_data_decode(data) else {
                debug!("dropping malformed ChannelData from {from}");
                return Ok(None);
            };
            let turn = self.entries[relay_idx].turn.as_ref().unwrap();
            let Some(peer) = turn.map.find_channel(channel) else {
                debug!("no channel {channel:#x} bound on relay {from}");
                return Ok(None);
            };
            let payload = payload.to_vec();
            return self.input(&payload, peer, Some(relay_idx), now);
        }
        if Message::is_stun(data) {
            let msg = match Message::from_bytes(data) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("dropping invalid STUN datagram from {from}: {e}");
                    return Ok(None);
                }
            };
            return self.dispatch_stun(msg, data, from, via_relay, now);
        }
        // application data from a known peer
        let known = self.entries.iter().any(|e| {
            e.kind == EntryKind::Check && e.record == from && e.relay == via_relay
        });
        if known {
            Ok(Some(data.to_vec()))
        } else {
            trace!("dropping non-STUN datagram from unknown source {from}");
            Ok(None)
        }
    }

    fn dispatch_stun(
        &mut self,
        msg: Message,
        raw: &[u8],
        from: SocketAddr,
        via_relay: Option<usize>,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, AgentError> {
        if msg.is_response() {
            if let Some(idx) = self
                .entries
                .iter()
                .position(|e| e.transaction_id == msg.transaction_id())
            {
                if self.entries[idx].record != from {
                    warn!(
                        "response for entry {idx} from unexpected address {from}, dropping"
                    );
                    return Ok(None);
                }
                match self.entries[idx].kind {
                    EntryKind::Check => self.handle_check_response(idx, &msg, raw, now),
                    EntryKind::Server => self.handle_server_response(idx, &msg, raw, now),
                    EntryKind::Relay => self.handle_relay_response(idx, &msg, raw, now),
                }
                return Ok(None);
            }
            // TURN per-peer operations are matched through the relay map
            if let Some(relay_idx) = self.entries.iter().position(|e| {
                e.kind == EntryKind::Relay
                    && e.record == from
                    && e.turn
                        .as_ref()
                        .map_or(false, |turn| turn.map.owns_transaction(msg.transaction_id()))
            }) {
                self.handle_relay_operation_response(relay_idx, &msg, raw, now);
                return Ok(None);
            }
            debug!(
                "dropping response with unknown transaction {} from {from}",
                msg.transaction_id()
            );
            return Ok(None);
        }

        if msg.has_class(MessageClass::Request) {
            if !msg.has_method(BINDING) {
                trace!("dropping non-binding request from {from}");
                return Ok(None);
            }
            self.handle_binding_request(&msg, raw, from, via_relay, now);
            return Ok(None);
        }

        // indications
        if msg.has_method(DATA) {
            let Some(relay_idx) = via_relay.or_else(|| self.find_relay_entry(from)) else {
                trace!("dropping Data indication from non-relay source {from}");
                return Ok(None);
            };
            let (Some(peer_attr), Some(data_attr)) = (
                msg.attribute::<XorPeerAddress>(XOR_PEER_ADDRESS),
                msg.attribute::<DataAttribute>(DATA_ATTRIBUTE),
            ) else {
                debug!("dropping Data indication without peer or data");
                return Ok(None);
            };
            let peer = peer_attr.addr(msg.transaction_id());
            let payload = data_attr.data().to_vec();
            return self.input(&payload, peer, Some(relay_idx), now);
        }
        if msg.has_method(BINDING) {
            trace!("binding indication from {from}");
            return Ok(None);
        }
        trace!("dropping indication with method {:#x}", msg.method());
        Ok(None)
    }

    // ----- gathering -----

    fn find_relay_entry(&self, server: SocketAddr) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.kind == EntryKind::Relay && e.record == server)
    }

    fn push_entry(&mut self, entry: StunEntry) -> Result<usize, AgentError> {
        if self.entries.len() >= MAX_STUN_ENTRIES_COUNT {
            warn!("entry bound reached");
            return Err(AgentError::TooMany);
        }
        self.entries.push(entry);
        Ok(self.entries.len() - 1)
    }

    /// Schedule the entry's next transmission, pushing it forward until it
    /// is at least [`STUN_PACING_TIME`] away from every other scheduled
    /// transmission.
    fn arm_transmission(&mut self, idx: usize, delay: Duration, now: Instant) {
        let mut at = now + delay;
        loop {
            let conflict = self.entries.iter().enumerate().find_map(|(i, e)| {
                if i == idx {
                    return None;
                }
                let other = e.next_transmission?;
                let distance = if other > at { other - at } else { at - other };
                (distance < STUN_PACING_TIME).then_some(other)
            });
            match conflict {
                Some(other) => at = other + STUN_PACING_TIME,
                None => break,
            }
        }
        self.entries[idx].next_transmission = Some(at);
    }

    fn update_gathering_done(&mut self) {
        if self.local.finished {
            return;
        }
        let still_pending = self.entries.iter().any(|e| {
            e.is_gathering()
                && matches!(e.state, EntryState::Idle | EntryState::Pending)
        });
        if !still_pending {
            info!("candidate gathering done");
            self.local.finished = true;
            self.events.push_back(AgentEvent::GatheringDone);
        }
    }

    // ----- candidates and pairs -----

    fn base_address(&self, family_of: SocketAddr) -> Option<SocketAddr> {
        self.local
            .candidates
            .iter()
            .find(|c| {
                c.candidate_type == CandidateType::Host
                    && c.address.is_ipv4() == family_of.is_ipv4()
            })
            .map(|c| c.address)
    }

    fn add_local_candidate(&mut self, candidate: Candidate) -> Option<usize> {
        let idx = self.local.add_candidate(candidate)?;
        let candidate = self.local.candidates[idx].clone();
        info!("new local candidate {candidate}");
        self.events.push_back(AgentEvent::LocalCandidate(candidate));
        Some(idx)
    }

    fn add_remote_candidate_internal(&mut self, candidate: Candidate, now: Instant) {
        let Some(remote_idx) = self.remote.add_candidate(candidate) else {
            return;
        };
        debug!(
            "new remote candidate {}",
            self.remote.candidates[remote_idx]
        );
        // pair with the local base
        self.add_pair(None, remote_idx, now);
        // and with every relayed local candidate of a matching family
        let remote_is_v4 = self.remote.candidates[remote_idx].address.is_ipv4();
        let relayed: Vec<usize> = self
            .local
            .candidates
            .iter()
            .enumerate()
            .filter(|(_i, c)| {
                c.candidate_type == CandidateType::Relayed
                    && c.address.is_ipv4() == remote_is_v4
            })
            .map(|(i, _c)| i)
            .collect();
        for local_idx in relayed {
            self.add_pair(Some(local_idx), remote_idx, now);
        }
    }

    fn compute_pair_priority(&self, local: Option<usize>, remote_idx: usize) -> u64 {
        let remote = &self.remote.candidates[remote_idx];
        let local_priority = local
            .map(|i| self.local.candidates[i].priority)
            .unwrap_or_else(|| Candidate::peer_reflexive_priority(remote.address));
        let (g, d) = if self.role == IceRole::Controlled {
            (remote.priority, local_priority)
        } else {
            (local_priority, remote.priority)
        };
        pair_priority(g, d)
    }

    fn add_pair(&mut self, local: Option<usize>, remote_idx: usize, now: Instant) {
        if self.pairs.len() >= MAX_CANDIDATE_PAIRS_COUNT {
            warn!("pair bound reached");
            return;
        }
        if self
            .pairs
            .iter()
            .any(|p| p.local == local && p.remote == remote_idx)
        {
            return;
        }
        let priority = self.compute_pair_priority(local, remote_idx);
        let pair = CandidatePair::new(local, remote_idx, priority);
        let pair_idx = self.pairs.len();
        self.pairs.push(pair);
        self.insert_ordered_pair(pair_idx);

        let mut entry = StunEntry::new(EntryKind::Check, self.remote.candidates[remote_idx].address);
        entry.pair = Some(pair_idx);
        if let Some(local_idx) = local {
            let local_addr = self.local.candidates[local_idx].address;
            entry.relay = self
                .entries
                .iter()
                .position(|e| e.kind == EntryKind::Relay && e.relayed == Some(local_addr));
        }
        let Ok(_entry_idx) = self.push_entry(entry) else {
            self.pairs[pair_idx].state = CandidatePairState::Failed;
            return;
        };
        if self.remote_credentials_known {
            self.unfreeze_pairs(now);
        }
    }

    fn insert_ordered_pair(&mut self, pair_idx: usize) {
        self.ordered_pairs.push(pair_idx);
        self.sort_ordered_pairs();
    }

    fn sort_ordered_pairs(&mut self) {
        let pairs = &self.pairs;
        let remote = &self.remote.candidates;
        self.ordered_pairs.sort_by(|&a, &b| {
            pairs[b]
                .priority
                .cmp(&pairs[a].priority)
                .then_with(|| remote[pairs[b].remote].priority.cmp(&remote[pairs[a].remote].priority))
        });
    }

    fn recompute_pair_priorities(&mut self) {
        for i in 0..self.pairs.len() {
            self.pairs[i].priority = self.compute_pair_priority(self.pairs[i].local, self.pairs[i].remote);
        }
        self.sort_ordered_pairs();
    }

    /// Move frozen pairs whose checks can now run into the pending state
    /// and schedule their entries with pacing.
    fn unfreeze_pairs(&mut self, now: Instant) {
        if !self.remote_credentials_known {
            return;
        }
        let mut scheduled_any = false;
        for idx in 0..self.entries.len() {
            let Some(pair_idx) = self.entries[idx].pair else {
                continue;
            };
            if self.entries[idx].state != EntryState::Idle {
                continue;
            }
            if self.pairs[pair_idx].state != CandidatePairState::Frozen {
                continue;
            }
            self.pairs[pair_idx].state = CandidatePairState::Pending;
            self.entries[idx].restart_transaction();
            self.arm_transmission(idx, Duration::ZERO, now);
            scheduled_any = true;
        }
        if scheduled_any
            && matches!(
                self.state,
                ConnectionState::Disconnected | ConnectionState::Gathering
            )
        {
            self.set_state(ConnectionState::Connecting);
        }
    }

    // ----- message construction -----

    fn short_term_remote(&self) -> MessageIntegrityCredentials {
        MessageIntegrityCredentials::ShortTerm(ShortTermCredentials {
            password: self.remote.credentials.pwd.clone(),
        })
    }

    fn short_term_local(&self) -> MessageIntegrityCredentials {
        MessageIntegrityCredentials::ShortTerm(ShortTermCredentials {
            password: self.local.credentials.pwd.clone(),
        })
    }

    fn build_check_request(&self, entry_idx: usize) -> Result<Message, AgentError> {
        let entry = &self.entries[entry_idx];
        let pair = &self.pairs[entry.pair.unwrap()];
        let mut msg = Message::new(
            crate::stun::message::MessageType::from_class_method(MessageClass::Request, BINDING),
            entry.transaction_id,
        );
        let username = format!(
            "{}:{}",
            self.remote.credentials.ufrag, self.local.credentials.ufrag
        );
        msg.add_attribute(Username::new(&username)?)?;
        msg.add_attribute(Priority::new(Candidate::peer_reflexive_priority(
            entry.record,
        )))?;
        match self.role {
            IceRole::Controlled => {
                msg.add_attribute(IceControlled::new(self.tie_breaker))?;
            }
            _ => {
                msg.add_attribute(IceControlling::new(self.tie_breaker))?;
                if pair.nomination_requested {
                    msg.add_attribute(UseCandidate::new())?;
                }
            }
        }
        msg.add_message_integrity(&self.short_term_remote(), IntegrityAlgorithm::Sha1)?;
        msg.add_fingerprint()?;
        Ok(msg)
    }

    fn build_server_request(&self, entry_idx: usize) -> Result<Message, AgentError> {
        let mut msg = Message::new(
            crate::stun::message::MessageType::from_class_method(MessageClass::Request, BINDING),
            self.entries[entry_idx].transaction_id,
        );
        msg.add_fingerprint()?;
        Ok(msg)
    }

    fn build_allocate_request(&self, entry_idx: usize) -> Result<Message, AgentError> {
        let entry = &self.entries[entry_idx];
        let turn = entry.turn.as_ref().unwrap();
        let method = if entry.relayed.is_some() {
            REFRESH
        } else {
            ALLOCATE
        };
        let mut msg = Message::new(
            crate::stun::message::MessageType::from_class_method(MessageClass::Request, method),
            entry.transaction_id,
        );
        msg.add_attribute(Lifetime::new(TURN_LIFETIME.as_secs() as u32))?;
        if method == ALLOCATE {
            msg.add_attribute(RequestedTransport::new(RequestedTransport::UDP))?;
            msg.add_attribute(DontFragment::new())?;
        }
        if turn.add_auth_attributes(&mut msg)? {
            let credentials = turn.long_term_credentials().unwrap();
            msg.add_message_integrity(&credentials, IntegrityAlgorithm::Sha1)?;
        }
        msg.add_fingerprint()?;
        Ok(msg)
    }

    fn build_keepalive(&self, entry_idx: usize) -> Result<Message, AgentError> {
        // binding indications carry no attributes besides the fingerprint
        let mut msg = Message::new(
            crate::stun::message::MessageType::from_class_method(
                MessageClass::Indication,
                BINDING,
            ),
            self.entries[entry_idx].transaction_id,
        );
        msg.add_fingerprint()?;
        Ok(msg)
    }

    fn queue_create_permission(&mut self, relay_idx: usize, peer: SocketAddr) {
        let turn = self.entries[relay_idx].turn.as_mut().unwrap();
        let transaction_id = turn.map.set_random_permission_transaction_id(peer);
        let result: Result<Message, AgentError> = (|| {
            let turn = self.entries[relay_idx].turn.as_ref().unwrap();
            let mut msg = Message::new(
                crate::stun::message::MessageType::from_class_method(
                    MessageClass::Request,
                    CREATE_PERMISSION,
                ),
                transaction_id,
            );
            msg.add_attribute(XorPeerAddress::new(peer, transaction_id))?;
            if turn.add_auth_attributes(&mut msg)? {
                let credentials = turn.long_term_credentials().unwrap();
                msg.add_message_integrity(&credentials, IntegrityAlgorithm::Sha1)?;
            }
            msg.add_fingerprint()?;
            Ok(msg)
        })();
        match result {
            Ok(msg) => {
                debug!("requesting permission for {peer}");
                let to = self.entries[relay_idx].record;
                self.transmits.push_back(Transmit {
                    data: msg.to_bytes(),
                    to,
                });
            }
            Err(e) => warn!("failed to build CreatePermission: {e}"),
        }
    }

    fn queue_channel_bind(&mut self, relay_idx: usize, peer: SocketAddr, now: Instant) {
        let turn = self.entries[relay_idx].turn.as_mut().unwrap();
        let channel = match turn.map.get_channel(peer) {
            Some(channel) => channel,
            None => turn.map.bind_random_channel(peer, now),
        };
        let transaction_id = turn.map.set_random_bind_transaction_id(peer);
        let result: Result<Message, AgentError> = (|| {
            let turn = self.entries[relay_idx].turn.as_ref().unwrap();
            let mut msg = Message::new(
                crate::stun::message::MessageType::from_class_method(
                    MessageClass::Request,
                    CHANNEL_BIND,
                ),
                transaction_id,
            );
            msg.add_attribute(ChannelNumber::new(channel))?;
            msg.add_attribute(XorPeerAddress::new(peer, transaction_id))?;
            if turn.add_auth_attributes(&mut msg)? {
                let credentials = turn.long_term_credentials().unwrap();
                msg.add_message_integrity(&credentials, IntegrityAlgorithm::Sha1)?;
            }
            msg.add_fingerprint()?;
            Ok(msg)
        })();
        match result {
            Ok(msg) => {
                debug!("binding channel {channel:#x} to {peer}");
                let to = self.entries[relay_idx].record;
                self.transmits.push_back(Transmit {
                    data: msg.to_bytes(),
                    to,
                });
            }
            Err(e) => warn!("failed to build ChannelBind: {e}"),
        }
    }

    /// Wrap an outgoing datagram for transmission through a relay: framed
    /// as ChannelData when a channel is bound, as a Send indication
    /// otherwise.  Permissions and channel bindings are requested lazily.
    fn relay_send(
        &mut self,
        relay_idx: usize,
        peer: SocketAddr,
        payload: &[u8],
        now: Instant,
    ) -> Result<Transmit, AgentError> {
        let server = self.entries[relay_idx].record;
        let turn = self.entries[relay_idx].turn.as_ref().unwrap();
        if let Some((channel, true)) = turn.map.get_bound_channel(peer) {
            return Ok(Transmit {
                data: channel_data_encode(channel, payload),
                to: server,
            });
        }
        if !turn.map.has_permission(peer, now) && !turn.map.has_pending_permission(peer) {
            self.queue_create_permission(relay_idx, peer);
        }
        let turn = self.entries[relay_idx].turn.as_ref().unwrap();
        if turn.map.get_channel(peer).is_none() {
            self.queue_channel_bind(relay_idx, peer, now);
        }
        let mut msg = Message::new_indication(SEND);
        msg.add_attribute(XorPeerAddress::new(peer, msg.transaction_id()))?;
        msg.add_attribute(DataAttribute::new(payload))?;
        msg.add_fingerprint()?;
        Ok(Transmit {
            data: msg.to_bytes(),
            to: server,
        })
    }

    /// Queue a datagram, wrapping it for the relay path when the entry
    /// sends through one.
    fn queue_entry_transmit(&mut self, entry_idx: usize, data: Vec<u8>, now: Instant) {
        let to = self.entries[entry_idx].record;
        match self.entries[entry_idx].relay {
            Some(relay_idx) => match self.relay_send(relay_idx, to, &data, now) {
                Ok(transmit) => self.transmits.push_back(transmit),
                Err(e) => warn!("failed to wrap relayed transmit: {e}"),
            },
            None => self.transmits.push_back(Transmit { data, to }),
        }
    }

    fn transmit_entry(&mut self, entry_idx: usize, now: Instant) {
        if self.entries[entry_idx].kind == EntryKind::Check {
            self.entries[entry_idx].asserted_controlling =
                Some(self.role != IceRole::Controlled);
        }
        let built = match self.entries[entry_idx].kind {
            EntryKind::Check => self.build_check_request(entry_idx),
            EntryKind::Server => self.build_server_request(entry_idx),
            EntryKind::Relay => self.build_allocate_request(entry_idx),
        };
        match built {
            Ok(msg) => {
                trace!(
                    "transmitting {} for entry {entry_idx}",
                    msg.transaction_id()
                );
                self.queue_entry_transmit(entry_idx, msg.to_bytes(), now);
            }
            Err(e) => warn!("failed to build request for entry {entry_idx}: {e}"),
        }
    }

    fn transmit_keepalive(&mut self, entry_idx: usize, now: Instant) {
        match self.entries[entry_idx].kind {
            EntryKind::Relay => {
                // a Refresh with a fresh transaction id per round
                self.entries[entry_idx].transaction_id = TransactionId::generate();
                match self.build_allocate_request(entry_idx) {
                    Ok(msg) => {
                        let to = self.entries[entry_idx].record;
                        self.transmits.push_back(Transmit {
                            data: msg.to_bytes(),
                            to,
                        });
                    }
                    Err(e) => warn!("failed to build Refresh: {e}"),
                }
            }
            _ => match self.build_keepalive(entry_idx) {
                Ok(msg) => self.queue_entry_transmit(entry_idx, msg.to_bytes(), now),
                Err(e) => warn!("failed to build keepalive: {e}"),
            },
        }
    }

    // ----- bookkeeping -----

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        // never jump from connecting straight to completed
        if self.state == ConnectionState::Connecting && state == ConnectionState::Completed {
            self.set_state(ConnectionState::Connected);
        }
        info!("state change: {} -> {}", self.state, state);
        self.state = state;
        self.events.push_back(AgentEvent::StateChange(state));
    }

    fn fail_entry(&mut self, entry_idx: usize) {
        let entry = &mut self.entries[entry_idx];
        entry.state = EntryState::Failed;
        entry.next_transmission = None;
        if let Some(pair_idx) = entry.pair {
            debug!("pair {pair_idx} failed");
            self.pairs[pair_idx].state = CandidatePairState::Failed;
            if self.selected_pair == Some(pair_idx) {
                self.selected_pair = None;
                self.selected_entry = None;
            }
        }
        if self.entries[entry_idx].is_gathering() {
            info!("gathering entry {entry_idx} failed");
            self.update_gathering_done();
        }
    }

    fn bookkeeping(&mut self, now: Instant) -> Instant {
        // drive entry transmissions and retransmissions
        for idx in 0..self.entries.len() {
            match self.entries[idx].state {
                EntryState::Pending => {
                    let Some(next) = self.entries[idx].next_transmission else {
                        continue;
                    };
                    if next > now {
                        continue;
                    }
                    if self.entries[idx].retransmissions < 0 {
                        debug!("entry {idx} exhausted its transaction");
                        self.fail_entry(idx);
                        continue;
                    }
                    self.transmit_entry(idx, now);
                    let entry = &mut self.entries[idx];
                    entry.retransmissions -= 1;
                    entry.next_transmission = Some(now + entry.retransmission_timeout);
                    entry.retransmission_timeout = (entry.retransmission_timeout * 2)
                        .min(MAX_STUN_RETRANSMISSION_TIMEOUT);
                }
                EntryState::SucceededKeepalive => {
                    let due = self.entries[idx]
                        .next_transmission
                        .map_or(false, |next| next <= now);
                    if due {
                        self.transmit_keepalive(idx, now);
                        let period = self.entries[idx].keepalive_period();
                        self.entries[idx].next_transmission = Some(now + period);
                    }
                }
                EntryState::Cancelled => {
                    self.entries[idx].next_transmission = None;
                }
                _ => {}
            }
            // relay entries refresh their permissions and channels
            let (permissions, channels) = match self.entries[idx].turn.as_ref() {
                Some(turn) => (
                    turn.map.permissions_needing_refresh(now),
                    turn.map.channels_needing_refresh(now),
                ),
                None => (vec![], vec![]),
            };
            for peer in permissions {
                self.queue_create_permission(idx, peer);
            }
            for peer in channels {
                self.queue_channel_bind(idx, peer, now);
            }
        }

        self.update_selection(now);

        // compute the next wakeup
        let mut next = now + MAX_POLL_INTERVAL;
        for entry in &self.entries {
            if let Some(at) = entry.next_transmission {
                next = next.min(at);
            }
            if let Some(turn) = entry.turn.as_ref() {
                if let Some(at) = turn.map.next_refresh_time() {
                    next = next.min(at);
                }
            }
        }
        if let Some(at) = self.fail_time {
            next = next.min(at);
        }
        next.max(now)
    }

    /// Scan pairs in priority order: pick the selected pair, nominate on
    /// the controlling side, freeze out-prioritized pending checks and arm
    /// the failure watchdog.
    fn update_selection(&mut self, now: Instant) {
        if matches!(self.state, ConnectionState::Failed) {
            return;
        }

        let ordered = self.ordered_pairs.clone();
        let nominated = ordered.iter().copied().find(|&i| {
            self.pairs[i].nominated && self.pairs[i].state == CandidatePairState::Succeeded
        });
        let best_succeeded = ordered
            .iter()
            .copied()
            .find(|&i| self.pairs[i].state == CandidatePairState::Succeeded);

        if let Some(pair_idx) = nominated.or(best_succeeded) {
            self.select_pair(pair_idx);
            if nominated.is_some() {
                self.set_state(ConnectionState::Completed);
            } else {
                self.set_state(ConnectionState::Connected);
                if self.role == IceRole::Controlling
                    && !self.pairs[pair_idx].nomination_requested
                {
                    // request nomination by re-sending the check with
                    // USE-CANDIDATE
                    info!("requesting nomination of pair {pair_idx}");
                    self.pairs[pair_idx].nomination_requested = true;
                    if let Some(entry_idx) = self.entry_for_pair(pair_idx) {
                        self.entries[entry_idx].restart_transaction();
                        self.arm_transmission(entry_idx, Duration::ZERO, now);
                    }
                }
            }

            // the controlling side freezes lower-priority pending checks
            if self.role == IceRole::Controlling {
                let succeeded_priority = self.pairs[pair_idx].priority;
                for idx in 0..self.entries.len() {
                    let Some(other_pair) = self.entries[idx].pair else {
                        continue;
                    };
                    if other_pair == pair_idx {
                        continue;
                    }
                    if self.pairs[other_pair].state == CandidatePairState::Pending
                        && self.pairs[other_pair].priority < succeeded_priority
                    {
                        trace!("freezing out-prioritized pair {other_pair}");
                        self.pairs[other_pair].state = CandidatePairState::Frozen;
                        self.entries[idx].state = EntryState::Cancelled;
                        self.entries[idx].next_transmission = None;
                    }
                }
            }

            self.rearm_selected_keepalive(now);
            self.fail_time = None;
            return;
        }

        // failure watchdog: all checks have ended without a success
        if !self.remote_credentials_known {
            return;
        }
        let any_pending = self
            .pairs
            .iter()
            .any(|p| p.state == CandidatePairState::Pending);
        if any_pending {
            self.fail_time = None;
            return;
        }
        let deadline = match self.fail_time {
            Some(deadline) => deadline,
            None => {
                let deadline = if self.remote.finished {
                    now
                } else {
                    now + ICE_FAIL_TIMEOUT
                };
                self.fail_time = Some(deadline);
                deadline
            }
        };
        if now >= deadline && !matches!(self.state, ConnectionState::Failed) {
            warn!("connectivity checks failed");
            self.set_state(ConnectionState::Failed);
        }
    }

    fn entry_for_pair(&self, pair_idx: usize) -> Option<usize> {
        self.entries.iter().position(|e| e.pair == Some(pair_idx))
    }

    fn select_pair(&mut self, pair_idx: usize) {
        if self.selected_pair == Some(pair_idx) {
            return;
        }
        let Some(entry_idx) = self.entry_for_pair(pair_idx) else {
            return;
        };
        info!("selected pair {pair_idx}");
        self.selected_pair = Some(pair_idx);
        self.selected_entry = Some(entry_idx);
        let pair = &self.pairs[pair_idx];
        self.events.push_back(AgentEvent::SelectedPair {
            local: pair.local.map(|i| self.local.candidates[i].clone()),
            remote: self.remote.candidates[pair.remote].clone(),
        });
    }

    /// Keep a keepalive stream armed on the selected entry.  Application
    /// sends clear the armed flag so the next pass pushes the keepalive
    /// out again.
    fn rearm_selected_keepalive(&mut self, now: Instant) {
        let Some(entry_idx) = self.selected_entry else {
            return;
        };
        let entry = &mut self.entries[entry_idx];
        if matches!(
            entry.state,
            EntryState::Succeeded | EntryState::SucceededKeepalive
        ) && !entry.armed
        {
            entry.armed = true;
            entry.state = EntryState::SucceededKeepalive;
            entry.next_transmission = Some(now + entry.keepalive_period());
        }
    }

    // ----- response handling -----

    fn handle_check_response(&mut self, entry_idx: usize, msg: &Message, raw: &[u8], now: Instant) {
        if self.entries[entry_idx].state != EntryState::Pending
            && self.entries[entry_idx].state != EntryState::SucceededKeepalive
            && self.entries[entry_idx].state != EntryState::Succeeded
        {
            trace!("response for inactive entry {entry_idx}, dropping");
            return;
        }
        if !msg.has_integrity()
            || msg
                .validate_integrity(raw, &self.short_term_remote())
                .is_err()
        {
            // an internal validation failure fails the entry without the
            // noise of a protocol-level error
            debug!(
                "check response failed integrity validation (error {})",
                ERROR_INTERNAL_VALIDATION_FAILED
            );
            self.fail_entry(entry_idx);
            return;
        }

        if msg.has_class(MessageClass::Error) {
            let code = msg
                .attribute::<ErrorCode>(ERROR_CODE)
                .map(|e| e.code())
                .unwrap_or(0);
            if code == ErrorCode::ROLE_CONFLICT {
                self.handle_role_conflict_response(entry_idx, now);
            } else {
                warn!("check error response {code}");
                self.fail_entry(entry_idx);
            }
            return;
        }

        let Some(mapped) = msg
            .attribute::<XorMappedAddress>(XOR_MAPPED_ADDRESS)
            .map(|attr| attr.addr(msg.transaction_id()))
        else {
            warn!("check success response without XOR-MAPPED-ADDRESS");
            self.fail_entry(entry_idx);
            return;
        };

        let pair_idx = self.entries[entry_idx].pair.unwrap();
        // discover the concrete local candidate from the mapped address
        let local_idx = match self
            .local
            .candidates
            .iter()
            .position(|c| c.address == mapped)
        {
            Some(idx) => Some(idx),
            None => {
                let base = self.base_address(mapped).unwrap_or(mapped);
                let candidate = Candidate::builder(CandidateType::PeerReflexive, mapped)
                    .base_address(base)
                    .build();
                debug!("new local peer-reflexive candidate {candidate}");
                self.add_local_candidate(candidate)
            }
        };
        if self.pairs[pair_idx].local.is_none() {
            if let Some(local_idx) = local_idx {
                if self.local.candidates[local_idx].candidate_type != CandidateType::Relayed {
                    self.pairs[pair_idx].local = Some(local_idx);
                }
            }
        }

        debug!("pair {pair_idx} succeeded (mapped {mapped})");
        let entry = &mut self.entries[entry_idx];
        if entry.state == EntryState::Pending {
            entry.state = EntryState::Succeeded;
            entry.next_transmission = None;
        }
        self.pairs[pair_idx].state = CandidatePairState::Succeeded;
        if self.pairs[pair_idx].nomination_requested {
            self.pairs[pair_idx].nominated = true;
        }
        self.update_selection(now);
    }

    /// A 487 makes the requester switch to the role dictated by the
    /// attribute it sent, regenerate its tiebreaker and retry immediately.
    fn handle_role_conflict_response(&mut self, entry_idx: usize, now: Instant) {
        let asserted_controlling = self.entries[entry_idx]
            .asserted_controlling
            .unwrap_or(self.role != IceRole::Controlled);
        let new_role = if asserted_controlling {
            IceRole::Controlled
        } else {
            IceRole::Controlling
        };
        if self.role != new_role {
            info!("role conflict response: switching role to {new_role:?}");
            self.role = new_role;
            self.tie_breaker = rand_u64();
            self.clear_nomination_requests();
            self.recompute_pair_priorities();
        }
        self.entries[entry_idx].restart_transaction();
        self.arm_transmission(entry_idx, Duration::ZERO, now);
        if let Some(pair_idx) = self.entries[entry_idx].pair {
            self.pairs[pair_idx].state = CandidatePairState::Pending;
        }
    }

    /// Outstanding nomination requests no longer apply after a role switch.
    fn clear_nomination_requests(&mut self) {
        for pair in &mut self.pairs {
            if !pair.nominated {
                pair.nomination_requested = false;
            }
        }
    }

    fn handle_server_response(&mut self, entry_idx: usize, msg: &Message, _raw: &[u8], now: Instant) {
        if self.entries[entry_idx].state != EntryState::Pending {
            return;
        }
        if msg.has_class(MessageClass::Error) {
            let code = msg
                .attribute::<ErrorCode>(ERROR_CODE)
                .map(|e| e.code())
                .unwrap_or(0);
            info!("server binding failed with {code}");
            self.fail_entry(entry_idx);
            return;
        }
        let Some(mapped) = msg
            .attribute::<XorMappedAddress>(XOR_MAPPED_ADDRESS)
            .map(|attr| attr.addr(msg.transaction_id()))
        else {
            info!("server binding response without XOR-MAPPED-ADDRESS");
            self.fail_entry(entry_idx);
            return;
        };

        let server = self.entries[entry_idx].record;
        let base = self.base_address(mapped).unwrap_or(mapped);
        let candidate = Candidate::builder(CandidateType::ServerReflexive, mapped)
            .base_address(base)
            .related_address(server)
            .build();
        let _ = self.add_local_candidate(candidate);

        let entry = &mut self.entries[entry_idx];
        entry.state = EntryState::SucceededKeepalive;
        entry.next_transmission = Some(now + entry.keepalive_period());
        self.update_gathering_done();
    }

    fn handle_relay_response(&mut self, entry_idx: usize, msg: &Message, raw: &[u8], now: Instant) {
        let entry_state = self.entries[entry_idx].state;
        if entry_state != EntryState::Pending && entry_state != EntryState::SucceededKeepalive {
            return;
        }
        if msg.has_class(MessageClass::Error) {
            let code = msg
                .attribute::<ErrorCode>(ERROR_CODE)
                .map(|e| e.code())
                .unwrap_or(0);
            match code {
                ErrorCode::UNAUTHORIZED => {
                    let turn = self.entries[entry_idx].turn.as_ref().unwrap();
                    if turn.has_realm() {
                        warn!("TURN credentials rejected");
                        self.fail_entry(entry_idx);
                        return;
                    }
                    let (Some(realm), Some(nonce)) = (
                        msg.attribute::<Realm>(REALM),
                        msg.attribute::<Nonce>(NONCE),
                    ) else {
                        warn!("401 without REALM/NONCE");
                        self.fail_entry(entry_idx);
                        return;
                    };
                    let algorithms = msg
                        .attribute::<PasswordAlgorithms>(PASSWORD_ALGORITHMS)
                        .map(|a| a.algorithms().to_vec())
                        .unwrap_or_default();
                    debug!("adopting TURN realm '{}'", realm.realm());
                    let turn = self.entries[entry_idx].turn.as_mut().unwrap();
                    turn.adopt_challenge(realm.realm(), nonce.nonce(), &algorithms);
                    // retry immediately with credentials
                    self.entries[entry_idx].restart_transaction();
                    self.arm_transmission(entry_idx, Duration::ZERO, now);
                }
                ErrorCode::STALE_NONCE => {
                    let Some(nonce) = msg.attribute::<Nonce>(NONCE) else {
                        warn!("438 without NONCE");
                        self.fail_entry(entry_idx);
                        return;
                    };
                    debug!("adopting fresh TURN nonce");
                    let turn = self.entries[entry_idx].turn.as_mut().unwrap();
                    turn.adopt_nonce(nonce.nonce());
                    // retry once with the fresh nonce; keepalive entries
                    // re-run their refresh promptly
                    self.entries[entry_idx].transaction_id = TransactionId::generate();
                    self.arm_transmission(entry_idx, Duration::ZERO, now);
                }
                _ => {
                    warn!("TURN allocation failed with {code}, abandoning");
                    self.fail_entry(entry_idx);
                }
            }
            return;
        }

        // success responses must verify against the long-term credentials
        let turn = self.entries[entry_idx].turn.as_ref().unwrap();
        let Some(credentials) = turn.long_term_credentials() else {
            debug!("TURN success response before challenge, dropping");
            return;
        };
        if msg.validate_integrity(raw, &credentials).is_err() {
            debug!(
                "TURN response failed integrity validation (error {})",
                ERROR_INTERNAL_VALIDATION_FAILED
            );
            self.fail_entry(entry_idx);
            return;
        }

        if self.entries[entry_idx].relayed.is_none() {
            // allocation success
            let Some(relayed) = msg
                .attribute::<XorRelayedAddress>(XOR_RELAYED_ADDRESS)
                .map(|attr| attr.addr(msg.transaction_id()))
            else {
                warn!("Allocate success without XOR-RELAYED-ADDRESS");
                self.fail_entry(entry_idx);
                return;
            };
            let mapped = msg
                .attribute::<XorMappedAddress>(XOR_MAPPED_ADDRESS)
                .map(|attr| attr.addr(msg.transaction_id()));
            let lifetime = msg
                .attribute::<Lifetime>(LIFETIME)
                .map(|l| Duration::from_secs(l.seconds() as u64))
                .unwrap_or(TURN_LIFETIME);
            info!("TURN allocation granted: relayed {relayed}, lifetime {lifetime:?}");

            let server = self.entries[entry_idx].record;
            self.entries[entry_idx].relayed = Some(relayed);
            let relayed_candidate = Candidate::builder(CandidateType::Relayed, relayed)
                .related_address(server)
                .build();
            let relayed_idx = self.add_local_candidate(relayed_candidate);
            if let Some(mapped) = mapped {
                if !self.local.candidates.iter().any(|c| c.address == mapped) {
                    let base = self.base_address(mapped).unwrap_or(mapped);
                    let candidate = Candidate::builder(CandidateType::ServerReflexive, mapped)
                        .base_address(base)
                        .related_address(server)
                        .build();
                    let _ = self.add_local_candidate(candidate);
                }
            }

            // pair the relayed candidate with the remotes we know
            if let Some(local_idx) = relayed_idx {
                let relayed_is_v4 = relayed.is_ipv4();
                let remotes: Vec<usize> = self
                    .remote
                    .candidates
                    .iter()
                    .enumerate()
                    .filter(|(_i, c)| c.address.is_ipv4() == relayed_is_v4)
                    .map(|(i, _c)| i)
                    .collect();
                for remote_idx in remotes {
                    self.add_pair(Some(local_idx), remote_idx, now);
                }
            }

            let entry = &mut self.entries[entry_idx];
            entry.state = EntryState::SucceededKeepalive;
            entry.next_transmission = Some(now + entry.keepalive_period());
            self.update_gathering_done();
        } else {
            // refresh success: the allocation lifetime was reset
            trace!("TURN refresh succeeded");
        }
    }

    fn handle_relay_operation_response(
        &mut self,
        relay_idx: usize,
        msg: &Message,
        raw: &[u8],
        now: Instant,
    ) {
        let transaction_id = msg.transaction_id();
        let turn = self.entries[relay_idx].turn.as_ref().unwrap();
        let Some(credentials) = turn.long_term_credentials() else {
            return;
        };

        if msg.has_class(MessageClass::Error) {
            let code = msg
                .attribute::<ErrorCode>(ERROR_CODE)
                .map(|e| e.code())
                .unwrap_or(0);
            if code == ErrorCode::STALE_NONCE {
                let Some(nonce) = msg.attribute::<Nonce>(NONCE) else {
                    return;
                };
                let peer_permission = turn.map.match_permission_transaction(transaction_id);
                let peer_bind = turn.map.match_bind_transaction(transaction_id);
                let turn = self.entries[relay_idx].turn.as_mut().unwrap();
                turn.adopt_nonce(nonce.nonce());
                turn.map.abandon_transaction(transaction_id);
                if let Some(peer) = peer_permission {
                    self.queue_create_permission(relay_idx, peer);
                } else if let Some(peer) = peer_bind {
                    self.queue_channel_bind(relay_idx, peer, now);
                }
            } else {
                warn!("TURN peer operation failed with {code}");
                let turn = self.entries[relay_idx].turn.as_mut().unwrap();
                turn.map.abandon_transaction(transaction_id);
            }
            return;
        }

        if msg.validate_integrity(raw, &credentials).is_err() {
            debug!("TURN operation response failed integrity validation");
            return;
        }
        let turn = self.entries[relay_idx].turn.as_mut().unwrap();
        if let Some(peer) = turn.map.set_permission(transaction_id, None, PERMISSION_LIFETIME, now)
        {
            debug!("permission granted for {peer}");
        } else if let Some((peer, channel)) = turn.map.bind_current_channel(transaction_id, now) {
            info!("channel {channel:#x} bound to {peer}");
        }
    }

    // ----- request handling -----

    fn queue_response(
        &mut self,
        mut msg: Message,
        to: SocketAddr,
        via_relay: Option<usize>,
        with_integrity: bool,
        now: Instant,
    ) {
        let result: Result<(), AgentError> = (|| {
            if with_integrity {
                msg.add_message_integrity(&self.short_term_local(), IntegrityAlgorithm::Sha1)?;
            }
            msg.add_fingerprint()?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!("failed to finish response: {e}");
            return;
        }
        let data = msg.to_bytes();
        match via_relay {
            Some(relay_idx) => match self.relay_send(relay_idx, to, &data, now) {
                Ok(transmit) => self.transmits.push_back(transmit),
                Err(e) => warn!("failed to wrap relayed response: {e}"),
            },
            None => self.transmits.push_back(Transmit { data, to }),
        }
    }

    fn handle_binding_request(
        &mut self,
        msg: &Message,
        raw: &[u8],
        from: SocketAddr,
        via_relay: Option<usize>,
        now: Instant,
    ) {
        trace!("binding request from {from}");
        if let Some(error) = Message::check_attribute_types(
            msg,
            &[
                USERNAME,
                MESSAGE_INTEGRITY,
                MESSAGE_INTEGRITY_SHA256,
                FINGERPRINT,
                PRIORITY,
                USE_CANDIDATE,
                ICE_CONTROLLED,
                ICE_CONTROLLING,
            ],
            &[USERNAME, PRIORITY],
        ) {
            self.queue_response(error, from, via_relay, false, now);
            return;
        }
        if !msg.has_integrity() {
            let response = Message::bad_request(msg).unwrap_or_else(|_| Message::new_error(msg));
            self.queue_response(response, from, via_relay, false, now);
            return;
        }

        // username: "local-ufrag:remote-ufrag" from our perspective
        let username_valid = msg
            .attribute::<Username>(USERNAME)
            .map_or(false, |username| {
                let expected_prefix = format!("{}:", self.local.credentials.ufrag);
                if !self.remote_credentials_known {
                    username.username().starts_with(&expected_prefix)
                } else {
                    username.username()
                        == format!("{expected_prefix}{}", self.remote.credentials.ufrag)
                }
            });
        if !username_valid {
            debug!("binding request failed username validation");
            let mut response = Message::new_error(msg);
            let _ = response.add_attribute(ErrorCode::from_code(ErrorCode::UNAUTHORIZED).unwrap());
            self.queue_response(response, from, via_relay, true, now);
            return;
        }
        if msg.validate_integrity(raw, &self.short_term_local()).is_err() {
            debug!("binding request failed integrity validation, dropping");
            let mut response = Message::new_error(msg);
            let _ = response.add_attribute(ErrorCode::from_code(ErrorCode::UNAUTHORIZED).unwrap());
            self.queue_response(response, from, via_relay, true, now);
            return;
        }

        let ice_controlling = msg.attribute::<IceControlling>(ICE_CONTROLLING);
        let ice_controlled = msg.attribute::<IceControlled>(ICE_CONTROLLED);
        let use_candidate = msg.has_attribute(USE_CANDIDATE);

        // exactly one role attribute, and USE-CANDIDATE only from the
        // controlling peer
        if ice_controlling.is_some() == ice_controlled.is_some()
            || (use_candidate && ice_controlling.is_none())
        {
            let response = Message::bad_request(msg).unwrap_or_else(|_| Message::new_error(msg));
            self.queue_response(response, from, via_relay, true, now);
            return;
        }

        // RFC 8445 7.3.1.1: role conflict repair
        if let Some(ref controlling) = ice_controlling {
            if self.role == IceRole::Controlling {
                if self.tie_breaker >= controlling.tie_breaker() {
                    debug!("role conflict (both controlling): keeping role");
                    let mut response = Message::new_error(msg);
                    let _ = response
                        .add_attribute(ErrorCode::from_code(ErrorCode::ROLE_CONFLICT).unwrap());
                    self.queue_response(response, from, via_relay, true, now);
                    return;
                }
                info!("role conflict: switching to controlled");
                self.role = IceRole::Controlled;
                self.clear_nomination_requests();
                self.recompute_pair_priorities();
            }
        }
        if let Some(ref controlled) = ice_controlled {
            if self.role == IceRole::Controlled {
                if self.tie_breaker >= controlled.tie_breaker() {
                    info!("role conflict: switching to controlling");
                    self.role = IceRole::Controlling;
                    self.clear_nomination_requests();
                    self.recompute_pair_priorities();
                } else {
                    debug!("role conflict (both controlled): keeping role");
                    let mut response = Message::new_error(msg);
                    let _ = response
                        .add_attribute(ErrorCode::from_code(ErrorCode::ROLE_CONFLICT).unwrap());
                    self.queue_response(response, from, via_relay, true, now);
                    return;
                }
            }
        }
        if self.role == IceRole::Unknown {
            // adopt the role complementing the peer's claim
            self.role = if ice_controlling.is_some() {
                IceRole::Controlled
            } else {
                IceRole::Controlling
            };
        }

        // peer-reflexive discovery of the remote candidate
        let remote_idx = match self
            .remote
            .candidates
            .iter()
            .position(|c| c.address == from)
        {
            Some(idx) => Some(idx),
            None => {
                let priority = msg
                    .attribute::<Priority>(PRIORITY)
                    .map(|p| p.priority())
                    .unwrap_or_else(|| Candidate::peer_reflexive_priority(from));
                let candidate = Candidate::builder(CandidateType::PeerReflexive, from)
                    .priority(priority)
                    .build();
                debug!("new remote peer-reflexive candidate {candidate}");
                let added = self.remote.add_candidate(candidate);
                if let Some(idx) = added {
                    // pair it like any other remote candidate
                    self.add_pair(None, idx, now);
                    let remote_is_v4 = from.is_ipv4();
                    let relayed: Vec<usize> = self
                        .local
                        .candidates
                        .iter()
                        .enumerate()
                        .filter(|(_i, c)| {
                            c.candidate_type == CandidateType::Relayed
                                && c.address.is_ipv4() == remote_is_v4
                        })
                        .map(|(i, _c)| i)
                        .collect();
                    for local_idx in relayed {
                        self.add_pair(Some(local_idx), idx, now);
                    }
                }
                added
            }
        };

        // triggered check handling on the matching pair
        if let Some(remote_idx) = remote_idx {
            let local = via_relay.and_then(|relay_idx| {
                let relayed = self.entries[relay_idx].relayed?;
                self.local
                    .candidates
                    .iter()
                    .position(|c| c.address == relayed)
            });
            let pair_idx = self
                .pairs
                .iter()
                .position(|p| p.local == local && p.remote == remote_idx);
            if let Some(pair_idx) = pair_idx {
                if use_candidate {
                    if self.pairs[pair_idx].state == CandidatePairState::Succeeded {
                        debug!("pair {pair_idx} nominated by peer");
                        self.pairs[pair_idx].nominated = true;
                    } else {
                        debug!("nomination of pair {pair_idx} requested");
                        self.pairs[pair_idx].nomination_requested = true;
                    }
                }
                match self.pairs[pair_idx].state {
                    CandidatePairState::Frozen | CandidatePairState::Failed => {
                        // triggered check
                        if self.remote_credentials_known {
                            self.pairs[pair_idx].state = CandidatePairState::Pending;
                            if let Some(entry_idx) = self.entry_for_pair(pair_idx) {
                                self.entries[entry_idx].restart_transaction();
                                self.arm_transmission(entry_idx, Duration::ZERO, now);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut response = Message::new_success(msg);
        let _ = response.add_attribute(XorMappedAddress::new(from, msg.transaction_id()));
        self.queue_response(response, from, via_relay, true, now);
        self.update_selection(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::attribute::{Userhash, USERHASH};
    use crate::stun::message::LongTermCredentials;

    fn init() -> tracing::subscriber::DefaultGuard {
        crate::tests::test_init_log()
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn drive(agent: &mut Agent, now: Instant, events: &mut Vec<AgentEvent>) -> Instant {
        loop {
            match agent.poll(now) {
                AgentPoll::Event(event) => events.push(event),
                AgentPoll::WaitUntil(at) => return at,
            }
        }
    }

    fn states(events: &[AgentEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::StateChange(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    /// Two agents joined by a lossless in-memory link with synthetic time.
    struct Pipe {
        a: Agent,
        b: Agent,
        a_addr: SocketAddr,
        b_addr: SocketAddr,
        a_events: Vec<AgentEvent>,
        b_events: Vec<AgentEvent>,
        a_data: Vec<Vec<u8>>,
        b_data: Vec<Vec<u8>>,
        now: Instant,
    }

    impl Pipe {
        fn new(a: Agent, b: Agent) -> Self {
            Self {
                a,
                b,
                a_addr: addr("198.51.100.1:40000"),
                b_addr: addr("198.51.100.2:41000"),
                a_events: vec![],
                b_events: vec![],
                a_data: vec![],
                b_data: vec![],
                now: Instant::now(),
            }
        }

        fn exchange_descriptions(&mut self) {
            let (a_addr, b_addr, now) = (self.a_addr, self.b_addr, self.now);
            self.a.gather_candidates(&[a_addr], now).unwrap();
            self.b.gather_candidates(&[b_addr], now).unwrap();
            let a_creds = self.a.local_credentials().clone();
            let b_creds = self.b.local_credentials().clone();
            self.a.set_remote_credentials(b_creds, now);
            self.b.set_remote_credentials(a_creds, now);
            for candidate in self.b.local_candidates().to_vec() {
                self.a.add_remote_candidate(candidate, now).unwrap();
            }
            for candidate in self.a.local_candidates().to_vec() {
                self.b.add_remote_candidate(candidate, now).unwrap();
            }
            self.a.set_remote_gathering_done();
            self.b.set_remote_gathering_done();
        }

        /// Run one round: poll both agents, deliver all queued transmits,
        /// and advance time when the link goes quiet.
        fn step(&mut self) {
            let wait_a = drive(&mut self.a, self.now, &mut self.a_events);
            let wait_b = drive(&mut self.b, self.now, &mut self.b_events);

            let mut delivered = false;
            while let Some(transmit) = self.a.poll_transmit() {
                delivered = true;
                assert_eq!(transmit.to, self.b_addr);
                if let Some(data) = self
                    .b
                    .handle_incoming(&transmit.data, self.a_addr, self.now)
                    .unwrap()
                {
                    self.b_data.push(data);
                }
            }
            while let Some(transmit) = self.b.poll_transmit() {
                delivered = true;
                assert_eq!(transmit.to, self.a_addr);
                if let Some(data) = self
                    .a
                    .handle_incoming(&transmit.data, self.b_addr, self.now)
                    .unwrap()
                {
                    self.a_data.push(data);
                }
            }
            if !delivered {
                self.now = wait_a.min(wait_b).max(self.now);
            }
        }

        fn run_until<F: Fn(&Pipe) -> bool>(&mut self, cond: F, limit: Duration) {
            let start = self.now;
            while !cond(self) {
                assert!(
                    self.now - start < limit,
                    "condition not reached within {limit:?}"
                );
                self.step();
            }
        }
    }

    #[test]
    fn connect_host_host() {
        let _log = init();
        let a = Agent::builder().controlling(true).build();
        let b = Agent::builder().controlling(false).build();
        let mut pipe = Pipe::new(a, b);
        let start = pipe.now;
        pipe.exchange_descriptions();
        pipe.run_until(
            |p| {
                p.a.state() == ConnectionState::Completed
                    && p.b.state() == ConnectionState::Completed
            },
            Duration::from_secs(5),
        );
        assert!(pipe.now - start <= Duration::from_secs(5));

        // both sides pass through connected before completing
        for events in [&pipe.a_events, &pipe.b_events] {
            let states = states(events);
            let connected = states
                .iter()
                .position(|s| *s == ConnectionState::Connected)
                .unwrap();
            let completed = states
                .iter()
                .position(|s| *s == ConnectionState::Completed)
                .unwrap();
            assert!(connected < completed);
        }

        // exactly one nominated pair per side
        for agent in [&pipe.a, &pipe.b] {
            assert_eq!(agent.pairs.iter().filter(|p| p.nominated).count(), 1);
            assert!(agent.selected_candidate_pair().is_some());
        }

        // application data flows over the selected pair
        let now = pipe.now;
        let transmit = pipe.a.send(b"hello", now).unwrap();
        assert_eq!(transmit.to, pipe.b_addr);
        let delivered = pipe
            .b
            .handle_incoming(&transmit.data, pipe.a_addr, now)
            .unwrap();
        assert_eq!(delivered.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn send_fails_before_selection() {
        let _log = init();
        let mut agent = Agent::builder().controlling(true).build();
        let now = Instant::now();
        agent.gather_candidates(&[addr("198.51.100.1:40000")], now).unwrap();
        assert!(matches!(
            agent.send(b"too early", now),
            Err(AgentError::NotConnected)
        ));
    }

    #[test]
    fn all_checks_fail_watchdog() {
        let _log = init();
        let mut agent = Agent::builder().controlling(true).build();
        let start = Instant::now();
        let mut now = start;
        agent.gather_candidates(&[addr("198.51.100.1:40000")], now).unwrap();
        agent.set_remote_credentials(
            Credentials::new("WXYZ".into(), "passwordpasswordpassw".into()),
            now,
        );
        agent
            .add_remote_candidate(
                Candidate::builder(CandidateType::Host, addr("203.0.113.9:9999")).build(),
                now,
            )
            .unwrap();
        agent.set_remote_gathering_done();

        let mut events = vec![];
        let mut transmissions = vec![];
        while agent.state() != ConnectionState::Failed {
            assert!(
                now - start < Duration::from_secs(120),
                "agent did not fail in time"
            );
            let wait = drive(&mut agent, now, &mut events);
            while let Some(transmit) = agent.poll_transmit() {
                transmissions.push((now, transmit));
            }
            now = wait.max(now + Duration::from_millis(1));
        }

        // 1 initial transmission plus the full retransmission budget
        assert_eq!(
            transmissions.len(),
            1 + MAX_STUN_RETRANSMISSION_COUNT as usize
        );
        // backoff doubles and is capped
        let mut expected = MIN_STUN_RETRANSMISSION_TIMEOUT;
        for pair in transmissions.windows(2) {
            let gap = pair[1].0 - pair[0].0;
            assert_eq!(gap, expected);
            expected = (expected * 2).min(MAX_STUN_RETRANSMISSION_TIMEOUT);
        }
        // the remote had finished gathering, so failure follows transaction
        // exhaustion without the extra grace period
        assert!(now - start >= ICE_FAIL_TIMEOUT);
        assert!(now - start < Duration::from_secs(60));
        // failed entries never transmit again
        assert!(agent
            .entries
            .iter()
            .all(|e| e.state != EntryState::Failed || e.next_transmission.is_none()));
    }

    #[test]
    fn role_conflict_resolution() {
        let _log = init();
        // both agents start out controlling; the larger tiebreaker wins
        let a = Agent::builder().controlling(true).tie_breaker(0x10).build();
        let b = Agent::builder().controlling(true).tie_breaker(0x20).build();
        let mut pipe = Pipe::new(a, b);
        pipe.exchange_descriptions();

        // deliver only A's first check so the conflict resolves through
        // the 487 path
        let now = pipe.now;
        drive(&mut pipe.a, now, &mut pipe.a_events);
        let request = pipe.a.poll_transmit().expect("no check transmitted");
        let old_transaction = Message::from_bytes(&request.data).unwrap().transaction_id();
        pipe.b
            .handle_incoming(&request.data, pipe.a_addr, now)
            .unwrap();
        let response = pipe.b.poll_transmit().expect("no response transmitted");
        let response_msg = Message::from_bytes(&response.data).unwrap();
        assert_eq!(
            response_msg
                .attribute::<ErrorCode>(ERROR_CODE)
                .unwrap()
                .code(),
            ErrorCode::ROLE_CONFLICT
        );
        pipe.a
            .handle_incoming(&response.data, pipe.b_addr, now)
            .unwrap();

        // A switched role, regenerated its tiebreaker and rescheduled the
        // entry for immediate retransmission
        assert_eq!(pipe.a.role(), IceRole::Controlled);
        assert_ne!(pipe.a.tie_breaker(), 0x10);
        assert_eq!(pipe.b.role(), IceRole::Controlling);
        assert_eq!(pipe.b.tie_breaker(), 0x20);
        let entry = pipe
            .a
            .entries
            .iter()
            .find(|e| e.kind == EntryKind::Check)
            .unwrap();
        assert_eq!(entry.state, EntryState::Pending);
        assert_ne!(entry.transaction_id, old_transaction);
        assert_eq!(entry.next_transmission, Some(now));

        // and with the roles sorted the agents still converge
        pipe.run_until(
            |p| {
                p.a.state() == ConnectionState::Completed
                    && p.b.state() == ConnectionState::Completed
            },
            Duration::from_secs(5),
        );
    }

    #[test]
    fn tiebreaker_stable_without_conflict() {
        let _log = init();
        let a = Agent::builder().controlling(true).tie_breaker(0x1234).build();
        let b = Agent::builder().controlling(false).build();
        let mut pipe = Pipe::new(a, b);
        pipe.exchange_descriptions();
        pipe.run_until(
            |p| p.a.state() == ConnectionState::Completed,
            Duration::from_secs(5),
        );
        assert_eq!(pipe.a.tie_breaker(), 0x1234);
    }

    #[test]
    fn peer_reflexive_discovery() {
        let _log = init();
        let mut agent = Agent::builder().controlling(false).build();
        let now = Instant::now();
        let local_addr = addr("198.51.100.2:41000");
        agent.gather_candidates(&[local_addr], now).unwrap();
        agent.set_remote_credentials(
            Credentials::new("ABCD".into(), "remotepasswordremotep".into()),
            now,
        );

        // an unsolicited binding request from an address we know nothing
        // about
        let source = addr("203.0.113.77:7777");
        let mut request = Message::new_request(BINDING);
        let username = format!("{}:ABCD", agent.local_credentials().ufrag);
        request.add_attribute(Username::new(&username).unwrap()).unwrap();
        request.add_attribute(Priority::new(0x6e0001ff)).unwrap();
        request
            .add_attribute(IceControlling::new(0x932f_f9b1_5126_3b36))
            .unwrap();
        let local_pwd = agent.local_credentials().pwd.clone();
        request
            .add_message_integrity(
                &MessageIntegrityCredentials::ShortTerm(ShortTermCredentials {
                    password: local_pwd,
                }),
                IntegrityAlgorithm::Sha1,
            )
            .unwrap();
        request.add_fingerprint().unwrap();

        agent
            .handle_incoming(&request.to_bytes(), source, now)
            .unwrap();

        // a peer-reflexive remote candidate with the signalled priority
        let prflx = agent
            .remote
            .candidates
            .iter()
            .find(|c| c.candidate_type == CandidateType::PeerReflexive)
            .expect("no peer reflexive candidate");
        assert_eq!(prflx.address, source);
        assert_eq!(prflx.priority, 0x6e0001ff);
        assert!(!agent.pairs.is_empty());

        // the response carries the mapped source address
        let response = agent.poll_transmit().expect("no response transmitted");
        assert_eq!(response.to, source);
        let response = Message::from_bytes(&response.data).unwrap();
        assert!(response.has_class(MessageClass::Success));
        let mapped = response
            .attribute::<XorMappedAddress>(XOR_MAPPED_ADDRESS)
            .unwrap();
        assert_eq!(mapped.addr(response.transaction_id()), source);
    }

    #[test]
    fn pacing_between_initial_transmissions() {
        let _log = init();
        let mut agent = Agent::builder().controlling(true).build();
        let now = Instant::now();
        agent.gather_candidates(&[addr("198.51.100.1:40000")], now).unwrap();
        agent.set_remote_credentials(
            Credentials::new("WXYZ".into(), "passwordpasswordpassw".into()),
            now,
        );
        for port in [5000, 5001, 5002] {
            agent
                .add_remote_candidate(
                    Candidate::builder(
                        CandidateType::Host,
                        addr(&format!("203.0.113.9:{port}")),
                    )
                    .build(),
                    now,
                )
                .unwrap();
        }
        let scheduled: Vec<Instant> = agent
            .entries
            .iter()
            .filter_map(|e| e.next_transmission)
            .collect();
        assert_eq!(scheduled.len(), 3);
        for (i, a) in scheduled.iter().enumerate() {
            for b in scheduled.iter().skip(i + 1) {
                let distance = if a > b { *a - *b } else { *b - *a };
                assert!(distance >= STUN_PACING_TIME);
            }
        }
    }

    #[test]
    fn keepalives_on_selected_pair() {
        let _log = init();
        let a = Agent::builder().controlling(true).build();
        let b = Agent::builder().controlling(false).build();
        let mut pipe = Pipe::new(a, b);
        pipe.exchange_descriptions();
        pipe.run_until(
            |p| p.a.state() == ConnectionState::Completed,
            Duration::from_secs(5),
        );

        let entry_idx = pipe.a.selected_entry.unwrap();
        let next = pipe.a.entries[entry_idx].next_transmission.unwrap();
        assert!(next - pipe.now <= STUN_KEEPALIVE_PERIOD);

        // advance to the keepalive and observe a binding indication
        pipe.now = next;
        let mut events = vec![];
        drive(&mut pipe.a, pipe.now, &mut events);
        let transmit = pipe.a.poll_transmit().expect("no keepalive sent");
        let msg = Message::from_bytes(&transmit.data).unwrap();
        assert!(msg.has_class(MessageClass::Indication));
        assert!(msg.has_method(BINDING));
        // and the next one is a full period out
        let rearmed = pipe.a.entries[entry_idx].next_transmission.unwrap();
        assert_eq!(rearmed - pipe.now, STUN_KEEPALIVE_PERIOD);
    }

    #[test]
    fn higher_priority_pair_selected() {
        let _log = init();
        let mut agent = Agent::builder().controlling(true).build();
        let mut now = Instant::now();
        let local_addr = addr("198.51.100.1:40000");
        agent.gather_candidates(&[local_addr], now).unwrap();
        let remote_pwd = "passwordpasswordpassw".to_string();
        agent.set_remote_credentials(Credentials::new("WXYZ".into(), remote_pwd.clone()), now);

        let high = addr("203.0.113.9:5000");
        let low = addr("203.0.113.9:5001");
        agent
            .add_remote_candidate(Candidate::builder(CandidateType::Host, high).build(), now)
            .unwrap();
        agent
            .add_remote_candidate(
                Candidate::builder(CandidateType::Relayed, low).build(),
                now,
            )
            .unwrap();

        // collect the two checks
        let mut events = vec![];
        let mut requests = vec![];
        for _ in 0..20 {
            let wait = drive(&mut agent, now, &mut events);
            while let Some(t) = agent.poll_transmit() {
                requests.push(t);
            }
            if requests.len() >= 2 {
                break;
            }
            now = wait.max(now);
        }
        let respond = |request: &Transmit| {
            let msg = Message::from_bytes(&request.data).unwrap();
            let mut response = Message::new_success(&msg);
            response
                .add_attribute(XorMappedAddress::new(local_addr, msg.transaction_id()))
                .unwrap();
            response
                .add_message_integrity(
                    &MessageIntegrityCredentials::ShortTerm(ShortTermCredentials {
                        password: remote_pwd.clone(),
                    }),
                    IntegrityAlgorithm::Sha1,
                )
                .unwrap();
            response.add_fingerprint().unwrap();
            (response.to_bytes(), request.to)
        };

        // answer the lower-priority pair first; the higher-priority pair
        // must win the selection regardless
        let mut ordered: Vec<&Transmit> = requests.iter().collect();
        ordered.sort_by_key(|t| if t.to == low { 0 } else { 1 });
        for request in ordered {
            let (data, from) = respond(request);
            agent.handle_incoming(&data, from, now).unwrap();
        }
        drive(&mut agent, now, &mut events);

        let (_, remote) = agent.selected_candidate_pair().unwrap();
        assert_eq!(remote.address, high);
    }

    // ----- TURN -----

    struct FakeTurnServer {
        addr: SocketAddr,
        relayed: SocketAddr,
        mapped: SocketAddr,
        realm: String,
        nonce: String,
        credentials: TurnCredentials,
        advertise_algorithms: bool,
    }

    impl FakeTurnServer {
        fn new() -> Self {
            Self {
                addr: addr("192.0.2.10:3478"),
                relayed: addr("192.0.2.10:49300"),
                mapped: addr("203.0.113.50:40000"),
                realm: "example.org".into(),
                nonce: "mr+v0Gem".into(),
                credentials: TurnCredentials::new("turnuser", "turnpass"),
                advertise_algorithms: false,
            }
        }

        fn long_term(&self) -> MessageIntegrityCredentials {
            MessageIntegrityCredentials::LongTerm(LongTermCredentials {
                username: self.credentials.username().to_string(),
                realm: self.realm.clone(),
                password: self.credentials.password().to_string(),
            })
        }

        fn authenticated(&self, msg: &Message, raw: &[u8]) -> bool {
            (msg.has_attribute(USERNAME) || msg.has_attribute(USERHASH))
                && msg.has_attribute(REALM)
                && msg.has_attribute(NONCE)
                && msg.validate_integrity(raw, &self.long_term()).is_ok()
        }

        fn unauthorized(&self, msg: &Message) -> Vec<u8> {
            let mut response = Message::new_error(msg);
            response
                .add_attribute(ErrorCode::from_code(ErrorCode::UNAUTHORIZED).unwrap())
                .unwrap();
            response
                .add_attribute(Realm::new(&self.realm).unwrap())
                .unwrap();
            response
                .add_attribute(Nonce::new(&self.nonce).unwrap())
                .unwrap();
            if self.advertise_algorithms {
                response
                    .add_attribute(PasswordAlgorithms::new(&[
                        crate::stun::attribute::PasswordAlgorithmValue::Sha256,
                    ]))
                    .unwrap();
            }
            response.add_fingerprint().unwrap();
            response.to_bytes()
        }

        fn success(&self, msg: &Message, extra: impl FnOnce(&mut Message)) -> Vec<u8> {
            let mut response = Message::new_success(msg);
            extra(&mut response);
            response
                .add_message_integrity(&self.long_term(), IntegrityAlgorithm::Sha1)
                .unwrap();
            response.add_fingerprint().unwrap();
            response.to_bytes()
        }

        fn handle(&self, data: &[u8]) -> Option<Vec<u8>> {
            if !Message::is_stun(data) {
                return None;
            }
            let msg = Message::from_bytes(data).unwrap();
            if !msg.has_class(MessageClass::Request) {
                return None;
            }
            if !self.authenticated(&msg, data) {
                return Some(self.unauthorized(&msg));
            }
            let transaction_id = msg.transaction_id();
            match msg.method() {
                ALLOCATE => Some(self.success(&msg, |response| {
                    response
                        .add_attribute(XorRelayedAddress::new(self.relayed, transaction_id))
                        .unwrap();
                    response
                        .add_attribute(XorMappedAddress::new(self.mapped, transaction_id))
                        .unwrap();
                    response
                        .add_attribute(Lifetime::new(TURN_LIFETIME.as_secs() as u32))
                        .unwrap();
                })),
                REFRESH => Some(self.success(&msg, |response| {
                    response
                        .add_attribute(Lifetime::new(TURN_LIFETIME.as_secs() as u32))
                        .unwrap();
                })),
                CREATE_PERMISSION | CHANNEL_BIND => Some(self.success(&msg, |_| {})),
                _ => None,
            }
        }
    }

    fn turn_agent(server: &FakeTurnServer) -> Agent {
        Agent::builder()
            .controlling(true)
            .turn_server(TurnServerConfig {
                addr: server.addr,
                credentials: server.credentials.clone(),
            })
            .build()
    }

    /// Poll the agent, answering every datagram addressed to the TURN
    /// server.  Returns the transmits that were not for the server.
    fn drive_with_server(
        agent: &mut Agent,
        server: &FakeTurnServer,
        now: Instant,
        events: &mut Vec<AgentEvent>,
    ) -> (Instant, Vec<Transmit>) {
        let mut other = vec![];
        let mut wait;
        loop {
            wait = drive(agent, now, events);
            let mut responded = false;
            while let Some(transmit) = agent.poll_transmit() {
                if transmit.to == server.addr {
                    match server.handle(&transmit.data) {
                        Some(response) => {
                            agent.handle_incoming(&response, server.addr, now).unwrap();
                            responded = true;
                        }
                        None => other.push(transmit),
                    }
                } else {
                    other.push(transmit);
                }
            }
            if !responded {
                break;
            }
        }
        (wait, other)
    }

    #[test]
    fn turn_allocation_and_refresh() {
        let _log = init();
        let server = FakeTurnServer::new();
        let mut agent = turn_agent(&server);
        let mut now = Instant::now();
        let mut events = vec![];

        agent.gather_candidates(&[addr("198.51.100.1:40000")], now).unwrap();
        let start = now;
        loop {
            let (wait, _other) = drive_with_server(&mut agent, &server, now, &mut events);
            if agent.gathering_done() {
                break;
            }
            assert!(now - start < Duration::from_secs(2), "allocation too slow");
            now = wait.max(now + Duration::from_millis(1));
        }

        // the relayed and server reflexive candidates surfaced
        let relayed = agent
            .local_candidates()
            .iter()
            .find(|c| c.candidate_type == CandidateType::Relayed)
            .expect("no relayed candidate");
        assert_eq!(relayed.address, server.relayed);
        assert_eq!(relayed.related_address, Some(server.addr));
        assert!(agent
            .local_candidates()
            .iter()
            .any(|c| c.candidate_type == CandidateType::ServerReflexive
                && c.address == server.mapped));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::GatheringDone)));

        // the allocation is refreshed at half its lifetime with a fresh
        // transaction
        let relay_idx = agent.find_relay_entry(server.addr).unwrap();
        let allocate_id = agent.entries[relay_idx].transaction_id;
        let refresh_at = agent.entries[relay_idx].next_transmission.unwrap();
        assert_eq!(refresh_at - now, TURN_REFRESH_PERIOD);

        now = refresh_at;
        drive(&mut agent, now, &mut events);
        let refresh = agent.poll_transmit().expect("no refresh transmitted");
        assert_eq!(refresh.to, server.addr);
        let refresh_msg = Message::from_bytes(&refresh.data).unwrap();
        assert!(refresh_msg.has_method(REFRESH));
        assert_ne!(refresh_msg.transaction_id(), allocate_id);
        let response = server.handle(&refresh.data).unwrap();
        agent.handle_incoming(&response, server.addr, now).unwrap();
        // and the next refresh is scheduled another period out
        let next_refresh = agent.entries[relay_idx].next_transmission.unwrap();
        assert_eq!(next_refresh - now, TURN_REFRESH_PERIOD);
    }

    #[test]
    fn stale_nonce_is_transparent() {
        let _log = init();
        let mut server = FakeTurnServer::new();
        let mut agent = turn_agent(&server);
        let mut now = Instant::now();
        let mut events = vec![];

        agent.gather_candidates(&[addr("198.51.100.1:40000")], now).unwrap();
        loop {
            let (wait, _other) = drive_with_server(&mut agent, &server, now, &mut events);
            if agent.gathering_done() {
                break;
            }
            now = wait.max(now + Duration::from_millis(1));
        }

        // the server rotates its nonce; the next refresh gets 438 and the
        // client retries with the fresh nonce without failing
        let relay_idx = agent.find_relay_entry(server.addr).unwrap();
        now = agent.entries[relay_idx].next_transmission.unwrap();
        drive(&mut agent, now, &mut events);
        let refresh = agent.poll_transmit().unwrap();
        let refresh_msg = Message::from_bytes(&refresh.data).unwrap();
        let mut stale = Message::new_error(&refresh_msg);
        stale
            .add_attribute(ErrorCode::from_code(ErrorCode::STALE_NONCE).unwrap())
            .unwrap();
        server.nonce = "fresh-nonce".into();
        stale
            .add_attribute(Nonce::new(&server.nonce).unwrap())
            .unwrap();
        stale.add_fingerprint().unwrap();
        agent.handle_incoming(&stale.to_bytes(), server.addr, now).unwrap();

        drive(&mut agent, now, &mut events);
        let retry = agent.poll_transmit().expect("no retry after 438");
        let retry_msg = Message::from_bytes(&retry.data).unwrap();
        assert!(retry_msg.has_method(REFRESH));
        let nonce = retry_msg.attribute::<Nonce>(NONCE).unwrap();
        assert_eq!(nonce.nonce(), "fresh-nonce");
        let response = server.handle(&retry.data).unwrap();
        agent.handle_incoming(&response, server.addr, now).unwrap();
        assert_ne!(agent.state(), ConnectionState::Failed);
    }

    #[test]
    fn channel_data_after_bind() {
        let _log = init();
        let server = FakeTurnServer::new();
        let mut agent = turn_agent(&server);
        let mut now = Instant::now();
        let mut events = vec![];

        agent.gather_candidates(&[addr("198.51.100.1:40000")], now).unwrap();
        loop {
            let (wait, _other) = drive_with_server(&mut agent, &server, now, &mut events);
            if agent.gathering_done() {
                break;
            }
            now = wait.max(now + Duration::from_millis(1));
        }

        // a remote peer reachable only through the relay
        let peer = addr("203.0.113.9:5000");
        agent.set_remote_credentials(
            Credentials::new("WXYZ".into(), "passwordpasswordpassw".into()),
            now,
        );
        agent
            .add_remote_candidate(
                Candidate::builder(CandidateType::Relayed, peer).build(),
                now,
            )
            .unwrap();

        // the first relayed check goes out as a Send indication and
        // lazily requests a permission and a channel binding; the server
        // answers both while driving
        let relay_idx = agent.find_relay_entry(server.addr).unwrap();
        let mut transmits = vec![];
        for _ in 0..10 {
            let (wait, other) = drive_with_server(&mut agent, &server, now, &mut events);
            transmits.extend(other);
            let turn = agent.entries[relay_idx].turn.as_ref().unwrap();
            if matches!(turn.map.get_bound_channel(peer), Some((_c, true))) {
                break;
            }
            now = wait.max(now + Duration::from_millis(1));
        }
        let saw_send_indication = transmits.iter().any(|transmit| {
            transmit.to == server.addr
                && Message::is_stun(&transmit.data)
                && Message::from_bytes(&transmit.data)
                    .map(|msg| msg.has_method(SEND) && msg.has_class(MessageClass::Indication))
                    .unwrap_or(false)
        });
        assert!(saw_send_indication);
        let turn = agent.entries[relay_idx].turn.as_ref().unwrap();
        let (channel, bound) = turn.map.get_bound_channel(peer).unwrap();
        assert!(bound);
        assert!((0x4000..=0x7fff).contains(&channel));

        // subsequent transmissions to that peer are ChannelData framed
        let check_idx = agent
            .entries
            .iter()
            .position(|e| e.kind == EntryKind::Check && e.record == peer && e.relay.is_some())
            .unwrap();
        now = agent.entries[check_idx].next_transmission.unwrap();
        drive(&mut agent, now, &mut events);
        let mut channel_framed = None;
        while let Some(transmit) = agent.poll_transmit() {
            if transmit.to == server.addr && is_channel_data(&transmit.data) {
                channel_framed = Some(transmit);
            }
        }
        let transmit = channel_framed.expect("no ChannelData retransmission");
        assert!((0x40..=0x7f).contains(&transmit.data[0]));

        // the framing carries the paced check inside
        let (framed_channel, payload) =
            crate::turn::channel_data_decode(&transmit.data).unwrap();
        assert_eq!(framed_channel, channel);
        let inner = Message::from_bytes(payload).unwrap();
        assert!(inner.has_method(BINDING));
    }

    #[test]
    fn userhash_after_password_algorithms() {
        let _log = init();
        let mut server = FakeTurnServer::new();
        server.advertise_algorithms = true;
        let mut agent = turn_agent(&server);
        let mut now = Instant::now();
        let mut events = vec![];

        agent.gather_candidates(&[addr("198.51.100.1:40000")], now).unwrap();
        // first allocate is unauthenticated
        drive(&mut agent, now, &mut events);
        let allocate = agent.poll_transmit().unwrap();
        let challenge = server.handle(&allocate.data).unwrap();
        agent.handle_incoming(&challenge, server.addr, now).unwrap();
        drive(&mut agent, now, &mut events);
        // the authenticated retry identifies the user with USERHASH
        let retry = agent.poll_transmit().unwrap();
        let retry_msg = Message::from_bytes(&retry.data).unwrap();
        assert!(!retry_msg.has_attribute(USERNAME));
        let userhash = retry_msg.attribute::<Userhash>(USERHASH).unwrap();
        assert_eq!(
            userhash.userhash(),
            &Userhash::hash(server.credentials.username(), &server.realm)
        );
        now += Duration::from_millis(1);
        let response = server.handle(&retry.data).unwrap();
        agent.handle_incoming(&response, server.addr, now).unwrap();
        assert!(agent
            .local_candidates()
            .iter()
            .any(|c| c.candidate_type == CandidateType::Relayed));
    }
}
