// Copyright (C) 2024 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! TURN client session state
//!
//! Per-allocation credential state and the per-peer map of permissions and
//! channel bindings, as specified in [RFC8656].
//!
//! [RFC8656]: https://tools.ietf.org/html/rfc8656

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use tracing::trace;

use crate::stun::attribute::PasswordAlgorithmValue;
use crate::stun::message::{
    LongTermCredentials, Message, MessageIntegrityCredentials, StunError, TransactionId,
};

pub mod attribute;
pub mod message;

/// The lifetime requested for and granted to TURN permissions.
pub const PERMISSION_LIFETIME: Duration = Duration::from_secs(300);
/// The lifetime of a channel binding.
pub const BIND_LIFETIME: Duration = Duration::from_secs(600);
/// The allocation lifetime requested from the server.
pub const TURN_LIFETIME: Duration = Duration::from_secs(600);

/// The lowest valid channel number.
pub const CHANNEL_MIN: u16 = 0x4000;
/// The highest valid channel number.
pub const CHANNEL_MAX: u16 = 0x7FFF;

/// Returns whether a datagram is TURN ChannelData framing: the first byte
/// carries the top bits of a channel number in the 0x4000-0x7FFF range.
pub fn is_channel_data(data: &[u8]) -> bool {
    !data.is_empty() && (0x40..=0x7f).contains(&data[0])
}

/// Frame a datagram as ChannelData: a 4-byte header of channel number and
/// payload length, with the payload padded to a multiple of 4 bytes.
pub fn channel_data_encode(channel: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + ((payload.len() + 3) & !3));
    out.resize(4, 0);
    BigEndian::write_u16(&mut out[0..2], channel);
    BigEndian::write_u16(&mut out[2..4], payload.len() as u16);
    out.extend_from_slice(payload);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out
}

/// Strip ChannelData framing, returning the channel number and the payload.
pub fn channel_data_decode(data: &[u8]) -> Result<(u16, &[u8]), StunError> {
    if data.len() < 4 {
        return Err(StunError::NotEnoughData);
    }
    let channel = BigEndian::read_u16(&data[0..2]);
    if !(CHANNEL_MIN..=CHANNEL_MAX).contains(&channel) {
        return Err(StunError::Malformed);
    }
    let length = BigEndian::read_u16(&data[2..4]) as usize;
    if data.len() < 4 + length {
        return Err(StunError::NotEnoughData);
    }
    Ok((channel, &data[4..4 + length]))
}

/// The username and password configured for a TURN server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCredentials {
    username: String,
    password: String,
}

impl TurnCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_owned(),
            password: password.to_owned(),
        }
    }

    /// The configured username
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The configured password
    pub fn password(&self) -> &str {
        &self.password
    }

    fn into_long_term_credentials(self, realm: &str) -> LongTermCredentials {
        LongTermCredentials {
            username: self.username,
            password: self.password,
            realm: realm.to_string(),
        }
    }
}

/// Per-peer state of a TURN allocation.
#[derive(Debug, Default)]
struct PeerEntry {
    channel: Option<u16>,
    channel_bound: bool,
    channel_expiry: Option<Instant>,
    permission_expiry: Option<Instant>,
    permission_transaction: Option<TransactionId>,
    bind_transaction: Option<TransactionId>,
}

/// The set of peers a TURN allocation has state for, keyed by the peer's
/// transport address.
///
/// Permissions are tracked against the full address but authorize the
/// peer's IP for any port, matching the server-side behaviour of
/// CreatePermission.  Channels are bound to the full transport address.
#[derive(Debug, Default)]
pub struct TurnMap {
    peers: HashMap<SocketAddr, PeerEntry>,
}

impl TurnMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live permission covers the peer address.
    pub fn has_permission(&self, peer: SocketAddr, now: Instant) -> bool {
        self.peers.iter().any(|(addr, entry)| {
            addr.ip() == peer.ip()
                && entry.permission_expiry.map_or(false, |expiry| expiry >= now)
        })
    }

    /// Record a granted permission.  The peer is resolved through the
    /// outstanding transaction id when not provided directly.
    pub fn set_permission(
        &mut self,
        transaction_id: TransactionId,
        peer: Option<SocketAddr>,
        lifetime: Duration,
        now: Instant,
    ) -> Option<SocketAddr> {
        let peer = peer.or_else(|| self.match_permission_transaction(transaction_id))?;
        let entry = self.peers.entry(peer).or_default();
        if entry.permission_transaction == Some(transaction_id) {
            entry.permission_transaction = None;
        }
        entry.permission_expiry = Some(now + lifetime);
        trace!("permission installed for {peer} for {lifetime:?}");
        Some(peer)
    }

    /// The channel number reserved for a peer, bound or not.
    pub fn get_channel(&self, peer: SocketAddr) -> Option<u16> {
        self.peers.get(&peer).and_then(|e| e.channel)
    }

    /// The channel number reserved for a peer together with whether the
    /// binding has been confirmed by the server.
    pub fn get_bound_channel(&self, peer: SocketAddr) -> Option<(u16, bool)> {
        self.peers
            .get(&peer)
            .and_then(|e| e.channel.map(|c| (c, e.channel_bound)))
    }

    /// Reserve an unused channel number for the peer, chosen uniformly at
    /// random from the valid range.  The binding is not active until
    /// [`TurnMap::bind_current_channel`] confirms it.
    pub fn bind_random_channel(&mut self, peer: SocketAddr, now: Instant) -> u16 {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let channel = loop {
            let candidate = rng.gen_range(CHANNEL_MIN..=CHANNEL_MAX);
            if !self
                .peers
                .values()
                .any(|entry| entry.channel == Some(candidate))
            {
                break candidate;
            }
        };
        let entry = self.peers.entry(peer).or_default();
        entry.channel = Some(channel);
        entry.channel_bound = false;
        entry.channel_expiry = Some(now + BIND_LIFETIME);
        channel
    }

    /// Promote a pending channel binding into an active one, resolved
    /// through the outstanding ChannelBind transaction id.
    pub fn bind_current_channel(
        &mut self,
        transaction_id: TransactionId,
        now: Instant,
    ) -> Option<(SocketAddr, u16)> {
        let peer = self.match_bind_transaction(transaction_id)?;
        let entry = self.peers.get_mut(&peer)?;
        entry.bind_transaction = None;
        entry.channel_bound = true;
        entry.channel_expiry = Some(now + BIND_LIFETIME);
        // a ChannelBind also installs a permission for the peer
        entry.permission_expiry = Some(now + PERMISSION_LIFETIME);
        entry.channel.map(|channel| (peer, channel))
    }

    /// Find the peer a bound channel number refers to, for ChannelData
    /// ingress.
    pub fn find_channel(&self, channel: u16) -> Option<SocketAddr> {
        self.peers.iter().find_map(|(addr, entry)| {
            if entry.channel == Some(channel) && entry.channel_bound {
                Some(*addr)
            } else {
                None
            }
        })
    }

    /// Generate and register a fresh transaction id for a CreatePermission
    /// request towards the peer.
    pub fn set_random_permission_transaction_id(&mut self, peer: SocketAddr) -> TransactionId {
        let id = TransactionId::generate();
        self.peers.entry(peer).or_default().permission_transaction = Some(id);
        id
    }

    /// Generate and register a fresh transaction id for a ChannelBind
    /// request towards the peer.
    pub fn set_random_bind_transaction_id(&mut self, peer: SocketAddr) -> TransactionId {
        let id = TransactionId::generate();
        self.peers.entry(peer).or_default().bind_transaction = Some(id);
        id
    }

    /// Whether a CreatePermission request is outstanding for the peer.
    pub fn has_pending_permission(&self, peer: SocketAddr) -> bool {
        self.peers
            .get(&peer)
            .map_or(false, |e| e.permission_transaction.is_some())
    }

    /// The peer an outstanding CreatePermission transaction belongs to.
    pub fn match_permission_transaction(&self, transaction_id: TransactionId) -> Option<SocketAddr> {
        self.peers.iter().find_map(|(addr, entry)| {
            if entry.permission_transaction == Some(transaction_id) {
                Some(*addr)
            } else {
                None
            }
        })
    }

    /// The peer an outstanding ChannelBind transaction belongs to.
    pub fn match_bind_transaction(&self, transaction_id: TransactionId) -> Option<SocketAddr> {
        self.peers.iter().find_map(|(addr, entry)| {
            if entry.bind_transaction == Some(transaction_id) {
                Some(*addr)
            } else {
                None
            }
        })
    }

    /// Whether the transaction id belongs to any outstanding per-peer
    /// operation of this allocation.
    pub fn owns_transaction(&self, transaction_id: TransactionId) -> bool {
        self.match_permission_transaction(transaction_id).is_some()
            || self.match_bind_transaction(transaction_id).is_some()
    }

    /// Drop the outstanding operation state for a failed transaction.
    pub fn abandon_transaction(&mut self, transaction_id: TransactionId) {
        for entry in self.peers.values_mut() {
            if entry.permission_transaction == Some(transaction_id) {
                entry.permission_transaction = None;
                entry.permission_expiry = None;
            }
            if entry.bind_transaction == Some(transaction_id) {
                entry.bind_transaction = None;
                entry.channel = None;
                entry.channel_bound = false;
                entry.channel_expiry = None;
            }
        }
    }

    /// Peers whose permission is past its half-lifetime and has no refresh
    /// in flight.
    pub fn permissions_needing_refresh(&self, now: Instant) -> Vec<SocketAddr> {
        self.peers
            .iter()
            .filter_map(|(addr, entry)| {
                let expiry = entry.permission_expiry?;
                if entry.permission_transaction.is_none()
                    && now + PERMISSION_LIFETIME / 2 >= expiry
                    && expiry >= now
                {
                    Some(*addr)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Peers whose channel binding is past its half-lifetime and has no
    /// refresh in flight.
    pub fn channels_needing_refresh(&self, now: Instant) -> Vec<SocketAddr> {
        self.peers
            .iter()
            .filter_map(|(addr, entry)| {
                let expiry = entry.channel_expiry?;
                if entry.channel_bound
                    && entry.bind_transaction.is_none()
                    && now + BIND_LIFETIME / 2 >= expiry
                    && expiry >= now
                {
                    Some(*addr)
                } else {
                    None
                }
            })
            .collect()
    }

    /// The earliest instant at which a permission or channel refresh
    /// becomes due.
    pub fn next_refresh_time(&self) -> Option<Instant> {
        self.peers
            .values()
            .flat_map(|entry| {
                let permission = entry
                    .permission_expiry
                    .filter(|_| entry.permission_transaction.is_none())
                    .map(|expiry| expiry - PERMISSION_LIFETIME / 2);
                let channel = entry
                    .channel_expiry
                    .filter(|_| entry.channel_bound && entry.bind_transaction.is_none())
                    .map(|expiry| expiry - BIND_LIFETIME / 2);
                [permission, channel].into_iter().flatten()
            })
            .min()
    }
}

/// Credential and per-peer state for one TURN allocation.
#[derive(Debug)]
pub struct TurnState {
    credentials: TurnCredentials,
    realm: Option<String>,
    nonce: Option<String>,
    userhash: Option<[u8; 32]>,
    /// The per-peer permission/channel map.
    pub map: TurnMap,
}

impl TurnState {
    pub fn new(credentials: TurnCredentials) -> Self {
        Self {
            credentials,
            realm: None,
            nonce: None,
            userhash: None,
            map: TurnMap::new(),
        }
    }

    /// The username configured for this allocation
    pub fn username(&self) -> &str {
        self.credentials.username()
    }

    /// Whether the 401 challenge has been received and long-term
    /// credentials are available.
    pub fn has_realm(&self) -> bool {
        self.realm.is_some()
    }

    /// Adopt the realm and nonce from a 401 challenge.  When the server
    /// advertises RFC 8489 password algorithms, subsequent requests
    /// identify the user with USERHASH instead of USERNAME.
    pub fn adopt_challenge(
        &mut self,
        realm: &str,
        nonce: &str,
        algorithms: &[PasswordAlgorithmValue],
    ) {
        if !algorithms.is_empty() {
            self.userhash = Some(crate::stun::attribute::Userhash::hash(
                self.credentials.username(),
                realm,
            ));
        }
        self.realm = Some(realm.to_owned());
        self.nonce = Some(nonce.to_owned());
    }

    /// Adopt a fresh nonce from a 438 Stale Nonce response.
    pub fn adopt_nonce(&mut self, nonce: &str) {
        self.nonce = Some(nonce.to_owned());
    }

    /// The long-term credentials for integrity computation, present once
    /// the 401 challenge has been adopted.
    pub fn long_term_credentials(&self) -> Option<MessageIntegrityCredentials> {
        let realm = self.realm.as_ref()?;
        Some(MessageIntegrityCredentials::LongTerm(
            self.credentials.clone().into_long_term_credentials(realm),
        ))
    }

    /// Add the long-term authentication attributes (USERNAME or USERHASH,
    /// REALM, NONCE) to a request.  Returns false when no challenge has
    /// been adopted yet, in which case the request goes out unauthenticated
    /// to elicit one.
    pub fn add_auth_attributes(&self, msg: &mut Message) -> Result<bool, StunError> {
        let (Some(realm), Some(nonce)) = (self.realm.as_ref(), self.nonce.as_ref()) else {
            return Ok(false);
        };
        use crate::stun::attribute::{Nonce, Realm, Userhash, Username};
        if let Some(userhash) = self.userhash {
            msg.add_attribute(Userhash::new(userhash))?;
        } else {
            msg.add_attribute(Username::new(self.credentials.username())?)?;
        }
        msg.add_attribute(Realm::new(realm)?)?;
        msg.add_attribute(Nonce::new(nonce)?)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() -> tracing::subscriber::DefaultGuard {
        crate::tests::test_init_log()
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn channel_data_roundtrip() {
        let _log = init();
        let framed = channel_data_encode(0x4abc, &[1, 2, 3, 4, 5]);
        assert!(is_channel_data(&framed));
        assert_eq!(framed.len(), 12);
        let (channel, payload) = channel_data_decode(&framed).unwrap();
        assert_eq!(channel, 0x4abc);
        assert_eq!(payload, &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn channel_data_bad_frames() {
        let _log = init();
        assert!(!is_channel_data(&[]));
        assert!(!is_channel_data(&[0x20, 0, 0, 0]));
        assert!(!is_channel_data(&[0x80, 0, 0, 0]));
        // truncated payload
        assert_eq!(
            channel_data_decode(&[0x40, 0x00, 0x00, 0x08, 1, 2]),
            Err(StunError::NotEnoughData)
        );
        // channel number out of range
        assert_eq!(
            channel_data_decode(&[0x30, 0x00, 0x00, 0x00]),
            Err(StunError::Malformed)
        );
    }

    #[test]
    fn permission_lifetime_honored() {
        let _log = init();
        let mut map = TurnMap::new();
        let peer = addr("198.51.100.1:7000");
        let now = Instant::now();
        assert!(!map.has_permission(peer, now));

        let id = map.set_random_permission_transaction_id(peer);
        assert_eq!(map.match_permission_transaction(id), Some(peer));
        assert_eq!(map.set_permission(id, None, PERMISSION_LIFETIME, now), Some(peer));
        assert!(map.has_permission(peer, now));
        // a permission covers every port of the peer ip
        assert!(map.has_permission(addr("198.51.100.1:9999"), now));
        assert!(!map.has_permission(addr("198.51.100.2:7000"), now));
        // expired
        assert!(!map.has_permission(peer, now + PERMISSION_LIFETIME + Duration::from_millis(1)));
    }

    #[test]
    fn permission_refresh_at_half_lifetime() {
        let _log = init();
        let mut map = TurnMap::new();
        let peer = addr("198.51.100.1:7000");
        let now = Instant::now();
        let id = map.set_random_permission_transaction_id(peer);
        let _ = map.set_permission(id, None, PERMISSION_LIFETIME, now);

        assert!(map.permissions_needing_refresh(now).is_empty());
        let half = now + PERMISSION_LIFETIME / 2;
        assert_eq!(map.permissions_needing_refresh(half), vec![peer]);
        assert_eq!(map.next_refresh_time(), Some(half));
    }

    #[test]
    fn channel_binding() {
        let _log = init();
        let mut map = TurnMap::new();
        let peer = addr("198.51.100.1:7000");
        let now = Instant::now();

        let channel = map.bind_random_channel(peer, now);
        assert!((CHANNEL_MIN..=CHANNEL_MAX).contains(&channel));
        assert_eq!(map.get_bound_channel(peer), Some((channel, false)));
        // unbound channels do not resolve for ingress
        assert_eq!(map.find_channel(channel), None);

        let id = map.set_random_bind_transaction_id(peer);
        assert_eq!(map.bind_current_channel(id, now), Some((peer, channel)));
        assert_eq!(map.get_bound_channel(peer), Some((channel, true)));
        assert_eq!(map.find_channel(channel), Some(peer));
        // binding a channel also installs a permission
        assert!(map.has_permission(peer, now));
    }

    #[test]
    fn random_channels_do_not_collide() {
        let _log = init();
        let mut map = TurnMap::new();
        let now = Instant::now();
        let mut seen = std::collections::HashSet::new();
        for i in 0..64 {
            let peer = addr(&format!("198.51.100.1:{}", 7000 + i));
            let channel = map.bind_random_channel(peer, now);
            assert!(seen.insert(channel), "channel {channel:#x} repeated");
        }
    }

    #[test]
    fn challenge_adoption() {
        let _log = init();
        let mut state = TurnState::new(TurnCredentials::new("user", "pass"));
        assert!(state.long_term_credentials().is_none());

        state.adopt_challenge("example.org", "nonce1", &[]);
        let Some(MessageIntegrityCredentials::LongTerm(long)) = state.long_term_credentials()
        else {
            panic!("expected long term credentials");
        };
        assert_eq!(long.realm, "example.org");

        state.adopt_nonce("nonce2");
        assert_eq!(state.nonce.as_deref(), Some("nonce2"));
        // userhash only in use once the server advertised algorithms
        assert!(state.userhash.is_none());
        state.adopt_challenge("example.org", "nonce3", &[PasswordAlgorithmValue::Sha256]);
        assert!(state.userhash.is_some());
    }
}
