// Copyright (C) 2024 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! ICE Candidates
//!
//! The candidate and candidate-pair data model of RFC 8445 for a
//! single-component, UDP-only agent.

pub use parse::ParseCandidateError;

use std::error::Error;
use std::net::SocketAddr;
use std::str::FromStr;

/// The component every candidate of this agent belongs to.  A single data
/// component is assumed throughout.
pub const COMPONENT_ID: usize = 1;

/// An ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// The type of the candidate
    pub candidate_type: CandidateType,
    /// The (unique per kind and base) foundation
    pub foundation: String,
    /// The priority
    pub priority: u32,
    /// The transport address to send to
    pub address: SocketAddr,
    /// The address the candidate was derived from.  Equal to `address` for
    /// host candidates.
    pub base_address: SocketAddr,
    /// The server address that produced this candidate, for srflx/relayed
    /// candidates
    pub related_address: Option<SocketAddr>,
}

/// The type of a [`Candidate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    /// A local network interface address
    Host,
    /// An address discovered from an incoming connectivity check
    PeerReflexive,
    /// An address discovered by asking an external STUN/TURN server
    ServerReflexive,
    /// An address that relays all data through a TURN server
    Relayed,
}

impl CandidateType {
    fn type_preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relayed => 0,
        }
    }

    fn foundation_tag(self) -> u8 {
        match self {
            CandidateType::Host => b'H',
            CandidateType::PeerReflexive => b'P',
            CandidateType::ServerReflexive => b'S',
            CandidateType::Relayed => b'R',
        }
    }
}

/// Errors when parsing a [`CandidateType`]
#[derive(Debug)]
pub enum ParseCandidateTypeError {
    /// The value provided is not recognised
    UnknownCandidateType,
}

impl Error for ParseCandidateTypeError {}

impl std::fmt::Display for ParseCandidateTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl FromStr for CandidateType {
    type Err = ParseCandidateTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(CandidateType::Host),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "relay" => Ok(CandidateType::Relayed),
            _ => Err(ParseCandidateTypeError::UnknownCandidateType),
        }
    }
}

impl std::fmt::Display for CandidateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match &self {
            CandidateType::Host => "host",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::Relayed => "relay",
        })
    }
}

/// A builder for a [`Candidate`]
pub struct CandidateBuilder {
    ctype: CandidateType,
    foundation: Option<String>,
    address: SocketAddr,
    priority: Option<u32>,
    base_address: Option<SocketAddr>,
    related_address: Option<SocketAddr>,
}

impl CandidateBuilder {
    /// Specify the priority of the to-be-built candidate
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Specify the foundation of the to-be-built candidate
    pub fn foundation(mut self, foundation: &str) -> Self {
        self.foundation = Some(foundation.to_owned());
        self
    }

    /// Specify the base address of the to-be-built candidate
    pub fn base_address(mut self, base_address: SocketAddr) -> Self {
        self.base_address = Some(base_address);
        self
    }

    /// Specify the related address of the to-be-built candidate
    pub fn related_address(mut self, related_address: SocketAddr) -> Self {
        self.related_address = Some(related_address);
        self
    }

    /// Build the candidate
    pub fn build(self) -> Candidate {
        let base_address = self.base_address.unwrap_or(self.address);
        Candidate {
            candidate_type: self.ctype,
            foundation: self
                .foundation
                .unwrap_or_else(|| Candidate::compute_foundation(self.ctype, base_address)),
            priority: self
                .priority
                .unwrap_or_else(|| Candidate::calculate_priority(self.ctype, self.address)),
            address: self.address,
            base_address,
            related_address: self.related_address,
        }
    }
}

impl Candidate {
    /// Construct a builder for a new candidate
    ///
    /// # Examples
    /// ```
    /// # use floe_proto::candidate::*;
    /// # use std::net::SocketAddr;
    /// let addr: SocketAddr = "127.0.0.1:2345".parse().unwrap();
    /// let candidate = Candidate::builder(CandidateType::Host, addr)
    ///     .foundation("oneoff")
    ///     .priority(1234)
    ///     .build();
    /// assert_eq!(
    ///     candidate.to_sdp_string(),
    ///     "a=candidate:oneoff 1 UDP 1234 127.0.0.1 2345 typ host"
    /// );
    /// ```
    pub fn builder(ctype: CandidateType, address: SocketAddr) -> CandidateBuilder {
        CandidateBuilder {
            ctype,
            foundation: None,
            address,
            priority: None,
            base_address: None,
            related_address: None,
        }
    }

    /// Serialize this candidate to an SDP attribute line (without trailing
    /// newline)
    pub fn to_sdp_string(&self) -> String {
        let mut ret = String::from("a=candidate:")
            + &self.foundation
            + " "
            + &COMPONENT_ID.to_string()
            + " UDP "
            + &self.priority.to_string()
            + " "
            + &self.address.ip().to_string()
            + " "
            + &self.address.port().to_string()
            + " typ "
            + &self.candidate_type.to_string();

        if let Some(related_address) = self.related_address {
            ret = ret
                + " raddr "
                + &related_address.ip().to_string()
                + " rport "
                + &related_address.port().to_string();
        }
        ret
    }

    /// Parse an `a=candidate:` SDP attribute line.  Returns `None` for
    /// well-formed lines this agent ignores (non-UDP transports and
    /// components other than 1).
    pub fn from_sdp_string(line: &str) -> Result<Option<Candidate>, ParseCandidateError> {
        parse::parse_candidate(line)
    }

    /// Calculate the priority of a candidate as specified in RFC 8445
    /// Section 5.1.2.  IPv6 addresses are preferred over IPv4.
    pub fn calculate_priority(ctype: CandidateType, address: SocketAddr) -> u32 {
        let local_preference: u32 = if address.is_ipv6() { 65535 } else { 32767 };
        (1 << 24) * ctype.type_preference() + (1 << 8) * local_preference + 256
            - COMPONENT_ID as u32
    }

    /// The priority this agent's base would have as a peer-reflexive
    /// candidate, advertised in the PRIORITY attribute of every check.
    pub fn peer_reflexive_priority(address: SocketAddr) -> u32 {
        Self::calculate_priority(CandidateType::PeerReflexive, address)
    }

    /// Compute the foundation for a candidate: an ice-char token derived
    /// from the candidate type and the base address, so that candidates
    /// sharing both also share a foundation.
    pub fn compute_foundation(ctype: CandidateType, base_address: SocketAddr) -> String {
        const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
        let mut digest = CRC.digest();
        digest.update(&[ctype.foundation_tag()]);
        match base_address.ip() {
            std::net::IpAddr::V4(ip) => digest.update(&ip.octets()),
            std::net::IpAddr::V6(ip) => digest.update(&ip.octets()),
        }
        format!("{}{:08x}", ctype.foundation_tag() as char, digest.finalize())
    }

    /// Whether two candidates are duplicates for the purpose of adding to
    /// a description: same kind and same resolved transport address.
    pub fn is_duplicate(&self, other: &Candidate) -> bool {
        self.candidate_type == other.candidate_type && self.address == other.address
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Candidate({} {} prio {})",
            self.candidate_type, self.address, self.priority
        )
    }
}

/// Candidate parsing
mod parse {
    use std::net::SocketAddr;
    use std::str::FromStr;

    use nom::bytes::complete::{tag, take_while1, take_while_m_n};
    use nom::combinator::map_res;

    use super::{Candidate, CandidateType, ParseCandidateTypeError, COMPONENT_ID};

    /// Errors produced when parsing a candidate
    #[derive(Debug)]
    pub enum ParseCandidateError {
        NotCandidate,
        BadFoundation,
        BadComponentId,
        BadTransportType,
        BadPriority,
        BadAddress,
        BadCandidateType,
        BadExtension,
        Malformed,
    }

    impl std::error::Error for ParseCandidateError {}

    impl std::fmt::Display for ParseCandidateError {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl From<ParseCandidateTypeError> for ParseCandidateError {
        fn from(_: ParseCandidateTypeError) -> Self {
            ParseCandidateError::BadCandidateType
        }
    }

    fn is_alphabetic(c: char) -> bool {
        c.is_alphabetic()
    }

    fn is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    fn is_ice_char(c: char) -> bool {
        c.is_alphanumeric() || c == '+' || c == '/'
    }

    fn is_part_of_socket_addr(c: char) -> bool {
        c.is_ascii_hexdigit() || c == '.' || c == ':'
    }

    fn is_part_of_byte_string(c: char) -> bool {
        // not nul, cr or lf (or SP which is the separator)
        c != '\0' && c != '\x0a' && c != '\x0d' && c != ' '
    }

    fn skip_spaces(s: &str) -> Result<&str, ParseCandidateError> {
        let (s, _) = take_while1::<_, _, nom::error::Error<_>>(|c| c == ' ')(s)
            .map_err(|_| ParseCandidateError::Malformed)?;
        Ok(s)
    }

    // https://datatracker.ietf.org/doc/html/rfc8839#section-5.1
    pub(super) fn parse_candidate(
        s: &str,
    ) -> Result<Option<Candidate>, ParseCandidateError> {
        use nom::Parser;
        let s = s.trim_end();
        let (s, _) = tag::<_, _, nom::error::Error<_>>("a=candidate:")(s)
            .or_else(|_| {
                tag::<_, _, nom::error::Error<_>>("candidate:")(s)
                    .map_err(|_| ParseCandidateError::NotCandidate)
            })?;
        let (s, foundation) = take_while_m_n::<_, _, nom::error::Error<_>>(1, 32, is_ice_char)(s)
            .map_err(|_| ParseCandidateError::BadFoundation)?;
        let s = skip_spaces(s)?;
        let (s, component_id): (_, usize) = map_res(
            take_while_m_n::<_, _, nom::error::Error<_>>(1, 3, is_digit),
            str::parse,
        )
        .parse(s)
        .map_err(|_| ParseCandidateError::BadComponentId)?;
        let s = skip_spaces(s)?;
        let (s, transport) = take_while1::<_, _, nom::error::Error<_>>(is_alphabetic)(s)
            .map_err(|_| ParseCandidateError::BadTransportType)?;
        let s = skip_spaces(s)?;
        let (s, priority) = map_res(
            take_while1::<_, _, nom::error::Error<_>>(is_digit),
            str::parse,
        )
        .parse(s)
        .map_err(|_| ParseCandidateError::BadPriority)?;
        let s = skip_spaces(s)?;
        let (s, connection_address) = map_res(
            take_while1::<_, _, nom::error::Error<_>>(is_part_of_socket_addr),
            |s: &str| s.parse(),
        )
        .parse(s)
        .map_err(|_| ParseCandidateError::BadAddress)?;
        let s = skip_spaces(s)?;
        let (s, port) = map_res(
            take_while1::<_, _, nom::error::Error<_>>(is_digit),
            str::parse,
        )
        .parse(s)
        .map_err(|_| ParseCandidateError::BadAddress)?;
        let address = SocketAddr::new(connection_address, port);
        let s = skip_spaces(s)?;
        let (s, _) = tag::<_, _, nom::error::Error<_>>("typ")(s)
            .map_err(|_| ParseCandidateError::BadCandidateType)?;
        let s = skip_spaces(s)?;
        let (s, candidate_type) = map_res(
            take_while1::<_, _, nom::error::Error<_>>(is_alphabetic),
            CandidateType::from_str,
        )
        .parse(s)
        .map_err(|_| ParseCandidateError::BadCandidateType)?;

        let mut builder = Candidate::builder(candidate_type, address)
            .foundation(foundation)
            .priority(priority)
            .base_address(address);

        let mut iter_s = s;
        let mut expected_next = None;
        let mut raddr = None;
        while !iter_s.is_empty() {
            let s = skip_spaces(iter_s)?;
            let (s, ext_key) = take_while1::<_, _, nom::error::Error<_>>(is_part_of_byte_string)(s)
                .map_err(|_| ParseCandidateError::BadExtension)?;
            let s = skip_spaces(s)?;
            let (s, ext_value) =
                take_while1::<_, _, nom::error::Error<_>>(is_part_of_byte_string)(s)
                    .map_err(|_| ParseCandidateError::BadExtension)?;

            if let Some(expected) = expected_next.take() {
                if ext_key != expected {
                    return Err(ParseCandidateError::BadExtension);
                }
                // only "rport" is ever expected here
                let raddr = raddr.take().ok_or(ParseCandidateError::BadAddress)?;
                let port = str::parse(ext_value).map_err(|_| ParseCandidateError::BadAddress)?;
                builder = builder.related_address(SocketAddr::new(raddr, port));
            } else if ext_key == "raddr" {
                raddr = Some(
                    ext_value
                        .parse()
                        .map_err(|_| ParseCandidateError::BadAddress)?,
                );
                expected_next = Some("rport");
            }
            // unknown extension key/value pairs are skipped

            iter_s = s;
        }

        // a well-formed candidate this agent has no use for
        if transport.to_ascii_uppercase() != "UDP" || component_id != COMPONENT_ID {
            return Ok(None);
        }

        Ok(Some(builder.build()))
    }
}

/// The connectivity state of a [`CandidatePair`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePairState {
    /// Waiting for the remote credentials before any check may be sent
    Frozen,
    /// A check is scheduled or in progress
    Pending,
    /// A check has succeeded on this pair
    Succeeded,
    /// The check transaction was exhausted without a response
    Failed,
}

impl std::fmt::Display for CandidatePairState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&format!("{self:?}"))
    }
}

/// A pairing of a local and a remote candidate.  Candidates are referenced
/// by index into the owning agent's candidate lists; `local` is `None` for
/// pairs that send from the agent's single non-relayed base.
#[derive(Debug, Clone)]
pub struct CandidatePair {
    /// Index of the local candidate, or `None` for the local base
    pub local: Option<usize>,
    /// Index of the remote candidate
    pub remote: usize,
    /// The pair priority, dependent on the agent role
    pub priority: u64,
    /// The connectivity state
    pub state: CandidatePairState,
    /// Whether the pair has been nominated
    pub nominated: bool,
    /// Whether the peer requested nomination before the pair succeeded
    pub nomination_requested: bool,
}

impl CandidatePair {
    pub fn new(local: Option<usize>, remote: usize, priority: u64) -> Self {
        Self {
            local,
            remote,
            priority,
            state: CandidatePairState::Frozen,
            nominated: false,
            nomination_requested: false,
        }
    }
}

/// Compute the pair priority from the controlling-side priority `g` and
/// the controlled-side priority `d` as specified in RFC 8445 Section
/// 6.1.2.3.
pub fn pair_priority(g: u32, d: u32) -> u64 {
    let (g, d) = (g as u64, d as u64);
    (1u64 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
}
