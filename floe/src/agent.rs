// Copyright (C) 2024 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The threaded ICE agent.
//!
//! Each [`Agent`] owns one UDP socket and one worker thread.  The worker
//! alternates between a timeout-bounded socket read and a pass over the
//! protocol engine; other threads wake it by sending a zero-length
//! datagram to the socket's own address.  Application sends take a fast
//! path that reads the published route snapshot and transmits under a
//! dedicated send lock, without contending with the worker.
//!
//! Callbacks are invoked with no agent lock held, so they may call back
//! into the [`Agent`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tracing::{debug, info, trace, warn};

use floe_proto::agent::{
    Agent as ProtoAgent, AgentError as ProtoAgentError, AgentEvent, AgentPoll, ConnectionState,
    Credentials, SelectedRoute, TurnServerConfig,
};
use floe_proto::candidate::Candidate;
use floe_proto::turn::{channel_data_encode, TurnCredentials};

use crate::socket::{bind_udp, local_host_addresses, map_for_socket, unmap_source};

const RECV_BUFFER_SIZE: usize = 1500 * 2;
const MAX_HOST_ADDRESSES: usize = 7;

/// Errors that can be returned as a result of agent operations.
#[derive(Debug)]
pub enum AgentError {
    /// An ICE protocol error.
    Proto(ProtoAgentError),
    /// An IO error.
    IoError(std::io::Error),
    /// A server name did not resolve to a usable address.
    ResolveFailed(String),
    /// A candidate line could not be parsed.
    InvalidCandidate(String),
}

impl From<ProtoAgentError> for AgentError {
    fn from(value: ProtoAgentError) -> Self {
        Self::Proto(value)
    }
}

impl From<std::io::Error> for AgentError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(value)
    }
}

impl std::error::Error for AgentError {}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A TURN server to allocate a relayed candidate on.
#[derive(Debug, Clone, Default)]
pub struct TurnServer {
    /// "host:port" of the server
    pub server: String,
    pub username: String,
    pub password: String,
}

/// Configuration for an [`Agent`].  All strings are copied at agent
/// creation.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    /// "host:port" of a STUN server for server reflexive candidates
    pub stun_server: Option<String>,
    /// TURN servers for relayed candidates
    pub turn_servers: Vec<TurnServer>,
    /// Local ports to try binding, inclusive
    pub port_range: Option<(u16, u16)>,
    /// Force the initial ICE role instead of deriving it from the
    /// signalling order
    pub controlling: Option<bool>,
}

type StateChangeHandler = Box<dyn FnMut(ConnectionState) + Send>;
type CandidateHandler = Box<dyn FnMut(&str) + Send>;
type GatheringDoneHandler = Box<dyn FnMut() + Send>;
type RecvHandler = Box<dyn FnMut(&[u8]) + Send>;

#[derive(Default)]
struct Handlers {
    on_state_change: ArcSwapOption<Mutex<StateChangeHandler>>,
    on_candidate: ArcSwapOption<Mutex<CandidateHandler>>,
    on_gathering_done: ArcSwapOption<Mutex<GatheringDoneHandler>>,
    on_recv: ArcSwapOption<Mutex<RecvHandler>>,
}

struct AgentInner {
    proto: Mutex<ProtoAgent>,
    socket: UdpSocket,
    socket_is_v6: bool,
    local_port: u16,
    /// Serializes socket writes separately from the protocol lock so a
    /// slow send never blocks ingress.
    send_lock: Mutex<()>,
    /// Route snapshot published by the worker after every pass.
    route: ArcSwapOption<SelectedRoute>,
    /// Observed by the fast path; folded into the engine by the worker.
    sent_since_poll: AtomicBool,
    stopped: AtomicBool,
    handlers: Handlers,
}

/// An ICE agent connected to one UDP socket and driven by a dedicated
/// worker thread.
pub struct Agent {
    inner: Arc<AgentInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    /// Create a new [`Agent`].  The UDP socket is bound and the configured
    /// server names are resolved here; gathering starts with
    /// [`Agent::gather_candidates`].
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let socket = bind_udp(config.port_range)?;
        let local_addr = socket.local_addr()?;

        let mut builder = ProtoAgent::builder();
        if let Some(controlling) = config.controlling {
            builder = builder.controlling(controlling);
        }
        if let Some(stun_server) = &config.stun_server {
            let addr = resolve_server(stun_server)
                .ok_or_else(|| AgentError::ResolveFailed(stun_server.clone()))?;
            builder = builder.stun_server(addr);
        }
        for turn in &config.turn_servers {
            let addr = resolve_server(&turn.server)
                .ok_or_else(|| AgentError::ResolveFailed(turn.server.clone()))?;
            builder = builder.turn_server(TurnServerConfig {
                addr,
                credentials: TurnCredentials::new(&turn.username, &turn.password),
            });
        }

        Ok(Self {
            inner: Arc::new(AgentInner {
                proto: Mutex::new(builder.build()),
                socket_is_v6: local_addr.is_ipv6(),
                local_port: local_addr.port(),
                socket,
                send_lock: Mutex::new(()),
                route: ArcSwapOption::empty(),
                sent_since_poll: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                handlers: Handlers::default(),
            }),
            worker: Mutex::new(None),
        })
    }

    /// The local ICE username fragment and password, for the signalling
    /// channel.
    pub fn local_credentials(&self) -> (String, String) {
        let proto = self.inner.proto.lock().unwrap();
        let credentials = proto.local_credentials();
        (credentials.ufrag.clone(), credentials.pwd.clone())
    }

    /// The SDP attribute lines describing the local side gathered so far.
    pub fn local_description(&self) -> String {
        let proto = self.inner.proto.lock().unwrap();
        let credentials = proto.local_credentials();
        let mut out = format!(
            "a=ice-ufrag:{}\r\na=ice-pwd:{}\r\n",
            credentials.ufrag, credentials.pwd
        );
        for candidate in proto.local_candidates() {
            out.push_str(&candidate.to_sdp_string());
            out.push_str("\r\n");
        }
        out
    }

    /// The coarse connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.proto.lock().unwrap().state()
    }

    /// The selected candidate pair, once connectivity has been
    /// established.
    pub fn selected_candidate_pair(&self) -> Option<(Option<Candidate>, Candidate)> {
        let proto = self.inner.proto.lock().unwrap();
        proto
            .selected_candidate_pair()
            .map(|(local, remote)| (local.cloned(), remote.clone()))
    }

    /// Install the connection state change callback.
    pub fn on_state_change(&self, handler: impl FnMut(ConnectionState) + Send + 'static) {
        let handler: StateChangeHandler = Box::new(handler);
        self.inner
            .handlers
            .on_state_change
            .store(Some(Arc::new(Mutex::new(handler))));
    }

    /// Install the local candidate callback.  Invoked with an
    /// `a=candidate:` SDP attribute line for every gathered candidate.
    pub fn on_candidate(&self, handler: impl FnMut(&str) + Send + 'static) {
        let handler: CandidateHandler = Box::new(handler);
        self.inner
            .handlers
            .on_candidate
            .store(Some(Arc::new(Mutex::new(handler))));
    }

    /// Install the gathering done callback.
    pub fn on_gathering_done(&self, handler: impl FnMut() + Send + 'static) {
        let handler: GatheringDoneHandler = Box::new(handler);
        self.inner
            .handlers
            .on_gathering_done
            .store(Some(Arc::new(Mutex::new(handler))));
    }

    /// Install the received datagram callback.
    pub fn on_recv(&self, handler: impl FnMut(&[u8]) + Send + 'static) {
        let handler: RecvHandler = Box::new(handler);
        self.inner
            .handlers
            .on_recv
            .store(Some(Arc::new(Mutex::new(handler))));
    }

    /// Start gathering candidates and spin up the worker thread.
    pub fn gather_candidates(&self) -> Result<(), AgentError> {
        let host_addrs = local_host_addresses(&self.inner.socket, MAX_HOST_ADDRESSES);
        {
            let mut proto = self.inner.proto.lock().unwrap();
            proto.gather_candidates(&host_addrs, Instant::now())?;
        }

        let mut worker = self.worker.lock().unwrap();
        if worker.is_none() {
            let inner = self.inner.clone();
            *worker = Some(
                std::thread::Builder::new()
                    .name("floe-agent".into())
                    .spawn(move || worker_loop(inner))
                    .map_err(AgentError::IoError)?,
            );
        }
        self.inner.interrupt();
        Ok(())
    }

    /// Set the remote ICE credentials from the signalling channel.
    pub fn set_remote_credentials(&self, ufrag: &str, pwd: &str) {
        {
            let mut proto = self.inner.proto.lock().unwrap();
            proto.set_remote_credentials(
                Credentials::new(ufrag.to_owned(), pwd.to_owned()),
                Instant::now(),
            );
        }
        self.inner.interrupt();
    }

    /// Add a remote candidate from an `a=candidate:` SDP attribute line.
    /// Lines for transports or components this agent does not use are
    /// ignored.
    pub fn add_remote_candidate(&self, line: &str) -> Result<(), AgentError> {
        let Some(candidate) = Candidate::from_sdp_string(line).map_err(|e| {
            debug!("failed to parse candidate '{line}': {e}");
            AgentError::InvalidCandidate(line.to_owned())
        })?
        else {
            trace!("ignoring candidate '{line}'");
            return Ok(());
        };
        let candidate = self.translate_candidate(candidate);
        {
            let mut proto = self.inner.proto.lock().unwrap();
            proto.add_remote_candidate(candidate, Instant::now())?;
        }
        self.inner.interrupt();
        Ok(())
    }

    /// Consume a remote session description: `a=ice-ufrag`, `a=ice-pwd`
    /// and `a=candidate` attribute lines.
    pub fn set_remote_description(&self, sdp: &str) -> Result<(), AgentError> {
        let mut ufrag = None;
        let mut pwd = None;
        for line in sdp.lines() {
            let line = line.trim();
            if let Some(value) = line.strip_prefix("a=ice-ufrag:") {
                ufrag = Some(value.to_owned());
            } else if let Some(value) = line.strip_prefix("a=ice-pwd:") {
                pwd = Some(value.to_owned());
            }
        }
        if let (Some(ufrag), Some(pwd)) = (ufrag, pwd) {
            self.set_remote_credentials(&ufrag, &pwd);
        }
        for line in sdp.lines() {
            let line = line.trim();
            if line.starts_with("a=candidate:") {
                self.add_remote_candidate(line)?;
            }
        }
        Ok(())
    }

    /// Signal that no further remote candidates will arrive.
    pub fn set_remote_gathering_done(&self) {
        self.inner.proto.lock().unwrap().set_remote_gathering_done();
        self.inner.interrupt();
    }

    /// Send an application datagram over the selected pair.
    ///
    /// The fast path reads the published route snapshot and writes to the
    /// socket under the send lock only; it falls back to the protocol
    /// engine when the route needs relay bookkeeping.  Fails with
    /// [`ProtoAgentError::NotConnected`] until a pair has been selected.
    pub fn send(&self, data: &[u8]) -> Result<(), AgentError> {
        let route = self.inner.route.load_full();
        match route.as_deref() {
            Some(SelectedRoute { peer, relay: None }) => {
                self.inner.send_datagram(data, *peer)?;
                self.inner.sent_since_poll.store(true, Ordering::Release);
                Ok(())
            }
            Some(SelectedRoute {
                relay: Some((server, Some(channel))),
                ..
            }) => {
                let framed = channel_data_encode(*channel, data);
                self.inner.send_datagram(&framed, *server)?;
                self.inner.sent_since_poll.store(true, Ordering::Release);
                Ok(())
            }
            _ => {
                // relayed without a bound channel yet, or nothing selected:
                // let the engine wrap the datagram and update its state
                let transmit = {
                    let mut proto = self.inner.proto.lock().unwrap();
                    proto.send(data, Instant::now())?
                };
                self.inner.send_datagram(&transmit.data, transmit.to)?;
                self.inner.interrupt();
                Ok(())
            }
        }
    }

    /// Stop the worker thread and close the socket.  Called automatically
    /// on drop.  Must not be called from within one of the agent's own
    /// callbacks.
    pub fn close(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.interrupt();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            if let Err(e) = worker.join() {
                warn!("worker thread panicked: {e:?}");
            }
        }
    }

    #[cfg(feature = "loopback-translation")]
    fn translate_candidate(&self, mut candidate: Candidate) -> Candidate {
        // intra-host peers advertise the machine's own address; many
        // routers drop such hairpinned traffic, the loopback path does not
        let proto = self.inner.proto.lock().unwrap();
        let is_local = proto.local_candidates().iter().any(|local| {
            local.address.ip() == candidate.address.ip()
        });
        if is_local {
            let loopback = match candidate.address {
                SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            info!(
                "translating intra-host candidate {} to loopback",
                candidate.address
            );
            candidate.address = SocketAddr::new(loopback, candidate.address.port());
            candidate.base_address = candidate.address;
        }
        candidate
    }

    #[cfg(not(feature = "loopback-translation"))]
    fn translate_candidate(&self, candidate: Candidate) -> Candidate {
        candidate
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.close();
    }
}

impl AgentInner {
    /// Write a datagram to the shared socket under the send lock.
    /// Transient send failures are swallowed; the retransmission schedule
    /// covers them.
    fn send_datagram(&self, data: &[u8], to: SocketAddr) -> Result<(), AgentError> {
        let to = map_for_socket(self.socket_is_v6, to);
        let _guard = self.send_lock.lock().unwrap();
        match self.socket.send_to(data, to) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                trace!("transient send failure to {to}");
                Ok(())
            }
            Err(e) => {
                debug!("send to {to} failed: {e}");
                Err(AgentError::IoError(e))
            }
        }
    }

    /// Wake the worker out of its socket read with a zero-length datagram
    /// to our own address.
    fn interrupt(&self) {
        let loopback = if self.socket_is_v6 {
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        let target = SocketAddr::new(loopback, self.local_port);
        let _guard = self.send_lock.lock().unwrap();
        if let Err(e) = self.socket.send_to(&[], target) {
            trace!("interrupt failed: {e}");
        }
    }

    fn dispatch_event(&self, event: AgentEvent) {
        match event {
            AgentEvent::StateChange(state) => {
                if let Some(handler) = self.handlers.on_state_change.load_full() {
                    let mut handler = handler.lock().unwrap();
                    handler(state);
                }
            }
            AgentEvent::LocalCandidate(candidate) => {
                if let Some(handler) = self.handlers.on_candidate.load_full() {
                    let mut handler = handler.lock().unwrap();
                    handler(&candidate.to_sdp_string());
                }
            }
            AgentEvent::GatheringDone => {
                if let Some(handler) = self.handlers.on_gathering_done.load_full() {
                    let mut handler = handler.lock().unwrap();
                    handler();
                }
            }
            AgentEvent::SelectedPair { local, remote } => {
                debug!(
                    "selected pair: {} -> {}",
                    local.map(|c| c.to_string()).unwrap_or_else(|| "base".into()),
                    remote
                );
            }
        }
    }
}

fn resolve_server(server: &str) -> Option<SocketAddr> {
    use std::net::ToSocketAddrs;
    let addrs: Vec<SocketAddr> = server.to_socket_addrs().ok()?.take(8).collect();
    // prefer the first IPv4 record, fall back to the first IPv6
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

/// The per-agent event loop: a timeout-bounded socket read alternating
/// with a pass over the protocol engine.
fn worker_loop(inner: Arc<AgentInner>) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];
    info!("agent worker started");
    loop {
        if inner.stopped.load(Ordering::Acquire) {
            break;
        }

        // bookkeeping pass: drive timers, collect transmits and events
        let now = Instant::now();
        let (deadline, events, transmits, route) = {
            let mut proto = inner.proto.lock().unwrap();
            if inner.sent_since_poll.swap(false, Ordering::AcqRel) {
                proto.note_application_send();
            }
            let mut events = vec![];
            let deadline = loop {
                match proto.poll(now) {
                    AgentPoll::Event(event) => events.push(event),
                    AgentPoll::WaitUntil(at) => break at,
                }
            };
            let mut transmits = vec![];
            while let Some(transmit) = proto.poll_transmit() {
                transmits.push(transmit);
            }
            (deadline, events, transmits, proto.selected_route())
        };
        inner.route.store(route.map(Arc::new));
        for transmit in transmits {
            let _ = inner.send_datagram(&transmit.data, transmit.to);
        }
        // callbacks run with no lock held and may re-enter the agent
        for event in events {
            inner.dispatch_event(event);
        }

        // blocking read until the next deadline
        let timeout = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));
        if let Err(e) = inner.socket.set_read_timeout(Some(timeout)) {
            warn!("failed to set socket timeout: {e}");
        }
        match inner.socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                if inner.stopped.load(Ordering::Acquire) {
                    break;
                }
                let from = unmap_source(from);
                let delivered = {
                    let mut proto = inner.proto.lock().unwrap();
                    proto.handle_incoming(&buf[..len], from, Instant::now())
                };
                match delivered {
                    Ok(Some(data)) => {
                        if let Some(handler) = inner.handlers.on_recv.load_full() {
                            let mut handler = handler.lock().unwrap();
                            handler(&data);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => debug!("error handling datagram from {from}: {e}"),
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                // ICMP unreachable surfaces as ConnectionReset on some
                // platforms; ignore and keep the loop alive
                trace!("socket read error: {e}");
            }
        }
    }
    info!("agent worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() -> tracing::subscriber::DefaultGuard {
        crate::tests::test_init_log()
    }

    #[test]
    fn resolve_prefers_ipv4() {
        let _log = init();
        let addr = resolve_server("127.0.0.1:3478").unwrap();
        assert_eq!(addr, "127.0.0.1:3478".parse().unwrap());
        assert!(resolve_server("definitely-not-a-host.invalid:3478").is_none());
    }

    #[test]
    fn create_and_close() {
        let _log = init();
        let agent = Agent::new(AgentConfig::default()).unwrap();
        let (ufrag, pwd) = agent.local_credentials();
        assert!(ufrag.len() >= 4);
        assert!(pwd.len() >= 22);
        agent.close();
    }

    #[test]
    fn send_before_connected_fails() {
        let _log = init();
        let agent = Agent::new(AgentConfig::default()).unwrap();
        agent.gather_candidates().unwrap();
        assert!(matches!(
            agent.send(b"nope"),
            Err(AgentError::Proto(ProtoAgentError::NotConnected))
        ));
        agent.close();
    }

    #[test]
    fn gather_is_idempotent_by_error() {
        let _log = init();
        let agent = Agent::new(AgentConfig::default()).unwrap();
        agent.gather_candidates().unwrap();
        assert!(matches!(
            agent.gather_candidates(),
            Err(AgentError::Proto(ProtoAgentError::InvalidState))
        ));
        agent.close();
    }

    #[test]
    fn local_description_contains_credentials() {
        let _log = init();
        let agent = Agent::new(AgentConfig::default()).unwrap();
        agent.gather_candidates().unwrap();
        let description = agent.local_description();
        assert!(description.contains("a=ice-ufrag:"));
        assert!(description.contains("a=ice-pwd:"));
        assert!(description.contains("a=candidate:"));
        agent.close();
    }
}
