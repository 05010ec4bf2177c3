// Copyright (C) 2024 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! STUN Attributes
//!
//! Generating, parsing and manipulating the STUN attributes used by ICE
//! connectivity checks and the TURN client, as specified in [RFC8489],
//! [RFC8445] and [RFC8656].
//!
//! [RFC8489]: https://tools.ietf.org/html/rfc8489
//! [RFC8445]: https://tools.ietf.org/html/rfc8445
//! [RFC8656]: https://tools.ietf.org/html/rfc8656

use std::convert::TryFrom;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use byteorder::{BigEndian, ByteOrder};

use crate::stun::message::{TransactionId, MAGIC_COOKIE};

pub const MAPPED_ADDRESS: AttributeType = AttributeType(0x0001);
pub const USERNAME: AttributeType = AttributeType(0x0006);
pub const MESSAGE_INTEGRITY: AttributeType = AttributeType(0x0008);
pub const ERROR_CODE: AttributeType = AttributeType(0x0009);
pub const UNKNOWN_ATTRIBUTES: AttributeType = AttributeType(0x000A);
pub const REALM: AttributeType = AttributeType(0x0014);
pub const NONCE: AttributeType = AttributeType(0x0015);
pub const MESSAGE_INTEGRITY_SHA256: AttributeType = AttributeType(0x001C);
pub const PASSWORD_ALGORITHM: AttributeType = AttributeType(0x001D);
pub const USERHASH: AttributeType = AttributeType(0x001E);
pub const XOR_MAPPED_ADDRESS: AttributeType = AttributeType(0x0020);

// RFC 8445
pub const PRIORITY: AttributeType = AttributeType(0x0024);
pub const USE_CANDIDATE: AttributeType = AttributeType(0x0025);

/// The largest USERNAME value allowed in a STUN message, in bytes.
pub const STUN_MAX_USERNAME_LEN: usize = 513;

pub const PASSWORD_ALGORITHMS: AttributeType = AttributeType(0x8002);
pub const SOFTWARE: AttributeType = AttributeType(0x8022);
pub const ALTERNATE_SERVER: AttributeType = AttributeType(0x8023);
pub const FINGERPRINT: AttributeType = AttributeType(0x8028);
pub const ICE_CONTROLLED: AttributeType = AttributeType(0x8029);
pub const ICE_CONTROLLING: AttributeType = AttributeType(0x802A);

/// Errors produced when parsing a STUN attribute
#[derive(Debug, PartialEq, Eq)]
pub enum StunParseError {
    /// Not enough data available to parse the attribute
    NotEnoughData,
    /// The attribute contains more data than allowed
    TooBig,
    /// The raw attribute is of a different type than requested
    WrongAttributeType,
    /// The attribute contents are invalid
    InvalidData,
    /// A value was outside the allowed range
    OutOfRange,
}

impl std::error::Error for StunParseError {}

impl std::fmt::Display for StunParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The type of an [`Attribute`] in a STUN [`Message`](crate::stun::message::Message)
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttributeType(pub u16);

impl std::fmt::Display for AttributeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#x}: {})", self.0, self.0, self.name())
    }
}

impl AttributeType {
    /// Create a new [`AttributeType`] from an existing value
    pub fn new(val: u16) -> Self {
        Self(val)
    }

    /// The integer value of this [`AttributeType`]
    pub fn value(&self) -> u16 {
        self.0
    }

    /// A human readable name of this [`AttributeType`] or "unknown"
    ///
    /// # Examples
    /// ```
    /// # use floe_proto::stun::attribute::XOR_MAPPED_ADDRESS;
    /// assert_eq!(XOR_MAPPED_ADDRESS.name(), "XOR-MAPPED-ADDRESS");
    /// ```
    pub fn name(self) -> &'static str {
        match self {
            MAPPED_ADDRESS => "MAPPED-ADDRESS",
            USERNAME => "USERNAME",
            MESSAGE_INTEGRITY => "MESSAGE-INTEGRITY",
            ERROR_CODE => "ERROR-CODE",
            UNKNOWN_ATTRIBUTES => "UNKNOWN-ATTRIBUTES",
            REALM => "REALM",
            NONCE => "NONCE",
            MESSAGE_INTEGRITY_SHA256 => "MESSAGE-INTEGRITY-SHA256",
            PASSWORD_ALGORITHM => "PASSWORD-ALGORITHM",
            USERHASH => "USERHASH",
            XOR_MAPPED_ADDRESS => "XOR-MAPPED-ADDRESS",
            PRIORITY => "PRIORITY",
            USE_CANDIDATE => "USE-CANDIDATE",
            PASSWORD_ALGORITHMS => "PASSWORD-ALGORITHMS",
            SOFTWARE => "SOFTWARE",
            ALTERNATE_SERVER => "ALTERNATE-SERVER",
            FINGERPRINT => "FINGERPRINT",
            ICE_CONTROLLED => "ICE-CONTROLLED",
            ICE_CONTROLLING => "ICE-CONTROLLING",
            crate::turn::attribute::CHANNEL_NUMBER => "CHANNEL-NUMBER",
            crate::turn::attribute::LIFETIME => "LIFETIME",
            crate::turn::attribute::XOR_PEER_ADDRESS => "XOR-PEER-ADDRESS",
            crate::turn::attribute::DATA => "DATA",
            crate::turn::attribute::XOR_RELAYED_ADDRESS => "XOR-RELAYED-ADDRESS",
            crate::turn::attribute::REQUESTED_TRANSPORT => "REQUESTED-TRANSPORT",
            crate::turn::attribute::DONT_FRAGMENT => "DONT-FRAGMENT",
            _ => "unknown",
        }
    }

    /// Whether comprehension is required for an [`AttributeType`].  All
    /// attribute values < 0x8000 require comprehension.
    ///
    /// # Examples
    /// ```
    /// # use floe_proto::stun::attribute::AttributeType;
    /// assert!(AttributeType::new(0x0).comprehension_required());
    /// assert!(!AttributeType::new(0x8000).comprehension_required());
    /// ```
    pub fn comprehension_required(self) -> bool {
        self.0 < 0x8000
    }
}

impl From<u16> for AttributeType {
    fn from(f: u16) -> Self {
        Self::new(f)
    }
}

impl From<AttributeType> for u16 {
    fn from(f: AttributeType) -> Self {
        f.0
    }
}

/// The header of a STUN attribute.  Contains the type and the length
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AttributeHeader {
    pub atype: AttributeType,
    pub length: u16,
}

impl AttributeHeader {
    fn parse(data: &[u8]) -> Result<Self, StunParseError> {
        if data.len() < 4 {
            return Err(StunParseError::NotEnoughData);
        }
        Ok(Self {
            atype: BigEndian::read_u16(&data[0..2]).into(),
            length: BigEndian::read_u16(&data[2..4]),
        })
    }

    fn to_bytes(self) -> Vec<u8> {
        let mut ret = vec![0; 4];
        BigEndian::write_u16(&mut ret[0..2], self.atype.into());
        BigEndian::write_u16(&mut ret[2..4], self.length);
        ret
    }
}

/// A STUN attribute for use in a [`Message`](crate::stun::message::Message)
pub trait Attribute: std::fmt::Debug {
    /// Retrieve the [`AttributeType`] of an [`Attribute`]
    fn get_type(&self) -> AttributeType;

    /// Retrieve the length of an [`Attribute`].  This is not the padded
    /// length as stored in a message.
    fn length(&self) -> u16;
}

fn padded_attr_len(len: usize) -> usize {
    if len % 4 == 0 {
        len
    } else {
        len + 4 - len % 4
    }
}

pub(crate) fn padded_attr_size(attr: &RawAttribute) -> usize {
    4 + padded_attr_len(attr.length() as usize)
}

/// The header and raw bytes of an unparsed [`Attribute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    /// The [`AttributeHeader`] of this [`RawAttribute`]
    pub header: AttributeHeader,
    /// The raw bytes of this [`RawAttribute`]
    pub value: Vec<u8>,
}

macro_rules! attr_from {
    ($CamelType:ty) => {
        impl std::convert::From<$CamelType> for RawAttribute {
            fn from(f: $CamelType) -> Self {
                f.to_raw()
            }
        }
    };
}

impl Attribute for RawAttribute {
    fn get_type(&self) -> AttributeType {
        self.header.atype
    }

    fn length(&self) -> u16 {
        self.header.length
    }
}

impl std::fmt::Display for RawAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RawAttribute (type: {}, len: {})",
            self.header.atype, self.header.length
        )
    }
}

impl RawAttribute {
    pub fn new(atype: AttributeType, data: &[u8]) -> Self {
        Self {
            header: AttributeHeader {
                atype,
                length: data.len() as u16,
            },
            value: data.to_vec(),
        }
    }

    /// Deserialize a [`RawAttribute`] from bytes.
    ///
    /// # Examples
    /// ```
    /// # use floe_proto::stun::attribute::{RawAttribute, Attribute, AttributeType};
    /// let data = &[0, 1, 0, 2, 5, 6, 0, 0];
    /// let attr = RawAttribute::from_bytes(data).unwrap();
    /// assert_eq!(attr.get_type(), AttributeType::new(1));
    /// assert_eq!(attr.length(), 2);
    /// ```
    pub fn from_bytes(data: &[u8]) -> Result<Self, StunParseError> {
        let header = AttributeHeader::parse(data)?;
        if header.length as usize > data.len() - 4 {
            return Err(StunParseError::NotEnoughData);
        }
        let mut value = data[4..].to_vec();
        value.truncate(header.length as usize);
        Ok(Self { header, value })
    }

    /// Serialize a [`RawAttribute`] to bytes, including the padding.
    ///
    /// # Examples
    /// ```
    /// # use floe_proto::stun::attribute::{RawAttribute, Attribute, AttributeType};
    /// let attr = RawAttribute::new(AttributeType::new(1), &[5, 6]);
    /// assert_eq!(attr.to_bytes(), &[0, 1, 0, 2, 5, 6, 0, 0]);
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ret: Vec<u8> = self.header.to_bytes();
        ret.extend(&self.value);
        let len = ret.len();
        if len % 4 != 0 {
            ret.resize(len + 4 - (len % 4), 0);
        }
        ret
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    fn to_byte(self) -> u8 {
        match self {
            AddressFamily::V4 => 0x1,
            AddressFamily::V6 => 0x2,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, StunParseError> {
        match byte {
            0x1 => Ok(AddressFamily::V4),
            0x2 => Ok(AddressFamily::V6),
            _ => Err(StunParseError::InvalidData),
        }
    }
}

macro_rules! bytewise_xor {
    ($size:literal, $a:expr, $b:expr, $default:literal) => {{
        let mut arr = [$default; $size];
        for (i, item) in arr.iter_mut().enumerate() {
            *item = $a[i] ^ $b[i];
        }
        arr
    }};
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MappedSocketAddr {
    pub(crate) addr: SocketAddr,
}

impl MappedSocketAddr {
    pub(crate) fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub(crate) fn length(&self) -> u16 {
        match self.addr {
            SocketAddr::V4(_) => 8,
            SocketAddr::V6(_) => 20,
        }
    }

    pub(crate) fn to_raw(&self, atype: AttributeType) -> RawAttribute {
        match self.addr {
            SocketAddr::V4(addr) => {
                let mut buf = [0; 8];
                buf[1] = AddressFamily::V4.to_byte();
                BigEndian::write_u16(&mut buf[2..4], addr.port());
                BigEndian::write_u32(&mut buf[4..8], u32::from(*addr.ip()));
                RawAttribute::new(atype, &buf)
            }
            SocketAddr::V6(addr) => {
                let mut buf = [0; 20];
                buf[1] = AddressFamily::V6.to_byte();
                BigEndian::write_u16(&mut buf[2..4], addr.port());
                BigEndian::write_u128(&mut buf[4..20], u128::from(*addr.ip()));
                RawAttribute::new(atype, &buf)
            }
        }
    }

    pub(crate) fn from_raw(raw: &RawAttribute) -> Result<Self, StunParseError> {
        if raw.value.len() < 4 {
            return Err(StunParseError::NotEnoughData);
        }
        let port = BigEndian::read_u16(&raw.value[2..4]);
        let family = AddressFamily::from_byte(raw.value[1])?;
        let addr = match family {
            AddressFamily::V4 => {
                if raw.value.len() < 8 {
                    return Err(StunParseError::NotEnoughData);
                }
                if raw.value.len() > 8 {
                    return Err(StunParseError::TooBig);
                }
                IpAddr::V4(Ipv4Addr::from(BigEndian::read_u32(&raw.value[4..8])))
            }
            AddressFamily::V6 => {
                if raw.value.len() < 20 {
                    return Err(StunParseError::NotEnoughData);
                }
                if raw.value.len() > 20 {
                    return Err(StunParseError::TooBig);
                }
                let mut octets = [0; 16];
                octets.clone_from_slice(&raw.value[4..]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };
        Ok(Self {
            addr: SocketAddr::new(addr, port),
        })
    }
}

impl std::fmt::Display for MappedSocketAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.addr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct XorSocketAddr {
    pub(crate) addr: MappedSocketAddr,
}

impl XorSocketAddr {
    pub(crate) fn new(addr: SocketAddr, transaction: TransactionId) -> Self {
        Self {
            addr: MappedSocketAddr::new(XorSocketAddr::xor_addr(addr, transaction)),
        }
    }

    pub(crate) fn length(&self) -> u16 {
        self.addr.length()
    }

    pub(crate) fn to_raw(&self, atype: AttributeType) -> RawAttribute {
        self.addr.to_raw(atype)
    }

    pub(crate) fn from_raw(raw: &RawAttribute) -> Result<Self, StunParseError> {
        let addr = MappedSocketAddr::from_raw(raw)?;
        Ok(Self { addr })
    }

    pub(crate) fn xor_addr(addr: SocketAddr, transaction: TransactionId) -> SocketAddr {
        match addr {
            SocketAddr::V4(addr) => {
                let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
                let const_octets = MAGIC_COOKIE.to_be_bytes();
                let addr_octets = addr.ip().octets();
                let octets = bytewise_xor!(4, const_octets, addr_octets, 0);
                SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)
            }
            SocketAddr::V6(addr) => {
                let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
                let transaction: u128 = transaction.into();
                let const_octets = ((MAGIC_COOKIE as u128) << 96
                    | (transaction & 0x0000_0000_ffff_ffff_ffff_ffff_ffff_ffff))
                    .to_be_bytes();
                let addr_octets = addr.ip().octets();
                let octets = bytewise_xor!(16, const_octets, addr_octets, 0);
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
            }
        }
    }

    pub(crate) fn addr(&self, transaction: TransactionId) -> SocketAddr {
        XorSocketAddr::xor_addr(self.addr.addr, transaction)
    }
}

/// The MappedAddress [`Attribute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedAddress {
    addr: MappedSocketAddr,
}

impl Attribute for MappedAddress {
    fn get_type(&self) -> AttributeType {
        MAPPED_ADDRESS
    }

    fn length(&self) -> u16 {
        self.addr.length()
    }
}
attr_from!(MappedAddress);

impl TryFrom<&RawAttribute> for MappedAddress {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != MAPPED_ADDRESS {
            return Err(StunParseError::WrongAttributeType);
        }
        Ok(Self {
            addr: MappedSocketAddr::from_raw(raw)?,
        })
    }
}

impl MappedAddress {
    /// Create a new MappedAddress [`Attribute`]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr: MappedSocketAddr::new(addr),
        }
    }

    /// Retrieve the address stored in a MappedAddress
    pub fn addr(&self) -> SocketAddr {
        self.addr.addr
    }

    fn to_raw(&self) -> RawAttribute {
        self.addr.to_raw(MAPPED_ADDRESS)
    }
}

impl std::fmt::Display for MappedAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.get_type(), self.addr)
    }
}

/// The AlternateServer [`Attribute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternateServer {
    addr: MappedSocketAddr,
}

impl Attribute for AlternateServer {
    fn get_type(&self) -> AttributeType {
        ALTERNATE_SERVER
    }

    fn length(&self) -> u16 {
        self.addr.length()
    }
}
attr_from!(AlternateServer);

impl TryFrom<&RawAttribute> for AlternateServer {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != ALTERNATE_SERVER {
            return Err(StunParseError::WrongAttributeType);
        }
        Ok(Self {
            addr: MappedSocketAddr::from_raw(raw)?,
        })
    }
}

impl AlternateServer {
    /// Create a new AlternateServer [`Attribute`]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr: MappedSocketAddr::new(addr),
        }
    }

    /// The server address to retry the request against
    pub fn addr(&self) -> SocketAddr {
        self.addr.addr
    }

    fn to_raw(&self) -> RawAttribute {
        self.addr.to_raw(ALTERNATE_SERVER)
    }
}

impl std::fmt::Display for AlternateServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.get_type(), self.addr)
    }
}

/// The XorMappedAddress [`Attribute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XorMappedAddress {
    // stored XOR-ed as we need the transaction id to get the original value
    addr: XorSocketAddr,
}

impl Attribute for XorMappedAddress {
    fn get_type(&self) -> AttributeType {
        XOR_MAPPED_ADDRESS
    }

    fn length(&self) -> u16 {
        self.addr.length()
    }
}
attr_from!(XorMappedAddress);

impl TryFrom<&RawAttribute> for XorMappedAddress {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != XOR_MAPPED_ADDRESS {
            return Err(StunParseError::WrongAttributeType);
        }
        Ok(Self {
            addr: XorSocketAddr::from_raw(raw)?,
        })
    }
}

impl XorMappedAddress {
    /// Create a new XorMappedAddress [`Attribute`]
    ///
    /// # Examples
    /// ```
    /// # use floe_proto::stun::attribute::*;
    /// # use std::net::SocketAddr;
    /// let addr = "127.0.0.1:1234".parse().unwrap();
    /// let mapped_addr = XorMappedAddress::new(addr, 0x5678.into());
    /// assert_eq!(mapped_addr.addr(0x5678.into()), addr);
    /// ```
    pub fn new(addr: SocketAddr, transaction: TransactionId) -> Self {
        Self {
            addr: XorSocketAddr::new(addr, transaction),
        }
    }

    /// Retrieve the address stored in a XorMappedAddress
    pub fn addr(&self, transaction: TransactionId) -> SocketAddr {
        self.addr.addr(transaction)
    }

    fn to_raw(&self) -> RawAttribute {
        self.addr.to_raw(XOR_MAPPED_ADDRESS)
    }
}

impl std::fmt::Display for XorMappedAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: XOR({})", self.get_type(), self.addr.addr)
    }
}

/// The Username [`Attribute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Username {
    user: String,
}

impl Attribute for Username {
    fn get_type(&self) -> AttributeType {
        USERNAME
    }

    fn length(&self) -> u16 {
        self.user.len() as u16
    }
}
attr_from!(Username);

impl TryFrom<&RawAttribute> for Username {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != USERNAME {
            return Err(StunParseError::WrongAttributeType);
        }
        if raw.value.len() > STUN_MAX_USERNAME_LEN {
            return Err(StunParseError::TooBig);
        }
        Ok(Self {
            user: std::str::from_utf8(&raw.value)
                .map_err(|_| StunParseError::InvalidData)?
                .to_owned(),
        })
    }
}

impl Username {
    /// Create a new [`Username`] [`Attribute`].  The value must already have
    /// been processed through OpaqueString where required.
    ///
    /// # Errors
    ///
    /// - When the username is longer than allowed in a STUN message
    ///
    /// # Examples
    /// ```
    /// # use floe_proto::stun::attribute::*;
    /// let username = Username::new("user").unwrap();
    /// assert_eq!(username.username(), "user");
    /// ```
    pub fn new(user: &str) -> Result<Self, StunParseError> {
        if user.len() > STUN_MAX_USERNAME_LEN {
            return Err(StunParseError::TooBig);
        }
        Ok(Self {
            user: user.to_owned(),
        })
    }

    /// The username stored in a [`Username`] [`Attribute`]
    pub fn username(&self) -> &str {
        &self.user
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(USERNAME, self.user.as_bytes())
    }
}

impl std::fmt::Display for Username {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: '{}'", self.get_type(), self.user)
    }
}

macro_rules! string_attr {
    ($(#[$outer:meta])* $CamelType:ident, $atype:ident, $max:literal) => {
        $(#[$outer])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $CamelType {
            value: String,
        }

        impl Attribute for $CamelType {
            fn get_type(&self) -> AttributeType {
                $atype
            }

            fn length(&self) -> u16 {
                self.value.len() as u16
            }
        }
        attr_from!($CamelType);

        impl TryFrom<&RawAttribute> for $CamelType {
            type Error = StunParseError;

            fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
                if raw.header.atype != $atype {
                    return Err(StunParseError::WrongAttributeType);
                }
                if raw.value.len() > $max {
                    return Err(StunParseError::TooBig);
                }
                Ok(Self {
                    value: std::str::from_utf8(&raw.value)
                        .map_err(|_| StunParseError::InvalidData)?
                        .to_owned(),
                })
            }
        }

        impl $CamelType {
            #[doc = concat!("Create a new ", stringify!($CamelType), " [`Attribute`]")]
            pub fn new(value: &str) -> Result<Self, StunParseError> {
                if value.len() > $max {
                    return Err(StunParseError::TooBig);
                }
                Ok(Self {
                    value: value.to_owned(),
                })
            }

            fn to_raw(&self) -> RawAttribute {
                RawAttribute::new($atype, self.value.as_bytes())
            }
        }

        impl std::fmt::Display for $CamelType {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}: '{}'", self.get_type(), self.value)
            }
        }
    };
}

string_attr!(
    /// The Realm [`Attribute`]
    Realm,
    REALM,
    763
);

impl Realm {
    /// The realm stored in a [`Realm`] [`Attribute`]
    pub fn realm(&self) -> &str {
        &self.value
    }
}

string_attr!(
    /// The Nonce [`Attribute`]
    Nonce,
    NONCE,
    763
);

impl Nonce {
    /// The nonce stored in a [`Nonce`] [`Attribute`]
    pub fn nonce(&self) -> &str {
        &self.value
    }
}

string_attr!(
    /// The Software [`Attribute`]
    Software,
    SOFTWARE,
    763
);

impl Software {
    /// The software description stored in a [`Software`] [`Attribute`]
    pub fn software(&self) -> &str {
        &self.value
    }
}

/// The Userhash [`Attribute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Userhash {
    hash: [u8; 32],
}

impl Attribute for Userhash {
    fn get_type(&self) -> AttributeType {
        USERHASH
    }

    fn length(&self) -> u16 {
        32
    }
}
attr_from!(Userhash);

impl TryFrom<&RawAttribute> for Userhash {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != USERHASH {
            return Err(StunParseError::WrongAttributeType);
        }
        if raw.value.len() != 32 {
            return Err(StunParseError::InvalidData);
        }
        let mut hash = [0; 32];
        hash.clone_from_slice(&raw.value);
        Ok(Self { hash })
    }
}

impl Userhash {
    /// Create a new [`Userhash`] [`Attribute`] from a precomputed hash value
    pub fn new(hash: [u8; 32]) -> Self {
        Self { hash }
    }

    /// Compute the userhash of a username and realm as specified in RFC 8489
    /// Section 9.3: SHA-256 of "username:realm".
    pub fn hash(username: &str, realm: &str) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(username.as_bytes());
        hasher.update(b":");
        hasher.update(realm.as_bytes());
        hasher.finalize().into()
    }

    /// The hash value stored in a [`Userhash`] [`Attribute`]
    pub fn userhash(&self) -> &[u8; 32] {
        &self.hash
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(USERHASH, &self.hash)
    }
}

impl std::fmt::Display for Userhash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:x?}", self.get_type(), self.hash)
    }
}

/// The MessageIntegrity [`Attribute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIntegrity {
    hmac: [u8; 20],
}

impl Attribute for MessageIntegrity {
    fn get_type(&self) -> AttributeType {
        MESSAGE_INTEGRITY
    }

    fn length(&self) -> u16 {
        20
    }
}
attr_from!(MessageIntegrity);

impl TryFrom<&RawAttribute> for MessageIntegrity {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != MESSAGE_INTEGRITY {
            return Err(StunParseError::WrongAttributeType);
        }
        if raw.value.len() != 20 {
            return Err(StunParseError::InvalidData);
        }
        let mut hmac = [0; 20];
        hmac.clone_from_slice(&raw.value);
        Ok(Self { hmac })
    }
}

impl MessageIntegrity {
    /// Create a new [`MessageIntegrity`] [`Attribute`] from a computed
    /// HMAC-SHA1 value
    pub fn new(hmac: [u8; 20]) -> Self {
        Self { hmac }
    }

    /// The HMAC value stored in a [`MessageIntegrity`] [`Attribute`]
    pub fn hmac(&self) -> &[u8; 20] {
        &self.hmac
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(MESSAGE_INTEGRITY, &self.hmac)
    }
}

impl std::fmt::Display for MessageIntegrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:x?}", self.get_type(), self.hmac)
    }
}

/// The MessageIntegritySha256 [`Attribute`].  The HMAC value may be
/// truncated to any multiple of 4 bytes between 16 and 32 inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIntegritySha256 {
    hmac: Vec<u8>,
}

impl Attribute for MessageIntegritySha256 {
    fn get_type(&self) -> AttributeType {
        MESSAGE_INTEGRITY_SHA256
    }

    fn length(&self) -> u16 {
        self.hmac.len() as u16
    }
}
attr_from!(MessageIntegritySha256);

impl TryFrom<&RawAttribute> for MessageIntegritySha256 {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != MESSAGE_INTEGRITY_SHA256 {
            return Err(StunParseError::WrongAttributeType);
        }
        Self::new(&raw.value)
    }
}

impl MessageIntegritySha256 {
    /// Create a new [`MessageIntegritySha256`] [`Attribute`] from a computed
    /// (possibly truncated) HMAC-SHA256 value
    pub fn new(hmac: &[u8]) -> Result<Self, StunParseError> {
        if hmac.len() < 16 {
            return Err(StunParseError::NotEnoughData);
        }
        if hmac.len() > 32 {
            return Err(StunParseError::TooBig);
        }
        if hmac.len() % 4 != 0 {
            return Err(StunParseError::InvalidData);
        }
        Ok(Self {
            hmac: hmac.to_vec(),
        })
    }

    /// The HMAC value stored in a [`MessageIntegritySha256`] [`Attribute`]
    pub fn hmac(&self) -> &[u8] {
        &self.hmac
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(MESSAGE_INTEGRITY_SHA256, &self.hmac)
    }
}

impl std::fmt::Display for MessageIntegritySha256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:x?}", self.get_type(), self.hmac)
    }
}

/// The Fingerprint [`Attribute`].  The value stored is the raw CRC-32;
/// serialization applies the 0x5354554e mask specified in RFC 8489.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    crc: u32,
}

/// The XOR value applied to the CRC-32 of a message to produce the
/// FINGERPRINT value ("STUN" in ASCII).
pub const FINGERPRINT_XOR_VALUE: u32 = 0x5354554e;

impl Attribute for Fingerprint {
    fn get_type(&self) -> AttributeType {
        FINGERPRINT
    }

    fn length(&self) -> u16 {
        4
    }
}
attr_from!(Fingerprint);

impl TryFrom<&RawAttribute> for Fingerprint {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != FINGERPRINT {
            return Err(StunParseError::WrongAttributeType);
        }
        if raw.value.len() != 4 {
            return Err(StunParseError::InvalidData);
        }
        Ok(Self {
            crc: BigEndian::read_u32(&raw.value) ^ FINGERPRINT_XOR_VALUE,
        })
    }
}

impl Fingerprint {
    /// Create a new [`Fingerprint`] [`Attribute`] from the CRC-32 of the
    /// preceding message content
    pub fn new(crc: u32) -> Self {
        Self { crc }
    }

    /// The CRC-32 value stored in a [`Fingerprint`] [`Attribute`]
    pub fn crc(&self) -> u32 {
        self.crc
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(FINGERPRINT, &(self.crc ^ FINGERPRINT_XOR_VALUE).to_be_bytes())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:#010x}", self.get_type(), self.crc)
    }
}

/// The ErrorCode [`Attribute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode {
    code: u16,
    reason: String,
}

impl Attribute for ErrorCode {
    fn get_type(&self) -> AttributeType {
        ERROR_CODE
    }

    fn length(&self) -> u16 {
        self.reason.len() as u16 + 4
    }
}
attr_from!(ErrorCode);

impl TryFrom<&RawAttribute> for ErrorCode {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != ERROR_CODE {
            return Err(StunParseError::WrongAttributeType);
        }
        if raw.value.len() < 4 {
            return Err(StunParseError::NotEnoughData);
        }
        if raw.value.len() > 763 + 4 {
            return Err(StunParseError::TooBig);
        }
        let code_h = (raw.value[2] & 0x7) as u16;
        let code_tens = raw.value[3] as u16;
        if !(3..7).contains(&code_h) || code_tens > 99 {
            return Err(StunParseError::OutOfRange);
        }
        let code = code_h * 100 + code_tens;
        Ok(Self {
            code,
            reason: std::str::from_utf8(&raw.value[4..])
                .map_err(|_| StunParseError::InvalidData)?
                .to_owned(),
        })
    }
}

impl ErrorCode {
    pub const TRY_ALTERNATE: u16 = 301;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const UNKNOWN_ATTRIBUTE: u16 = 420;
    pub const ALLOCATION_MISMATCH: u16 = 437;
    pub const STALE_NONCE: u16 = 438;
    pub const ADDRESS_FAMILY_NOT_SUPPORTED: u16 = 440;
    pub const WRONG_CREDENTIALS: u16 = 441;
    pub const UNSUPPORTED_TRANSPORT_PROTOCOL: u16 = 442;
    pub const PEER_ADDRESS_FAMILY_MISMATCH: u16 = 443;
    pub const ALLOCATION_QUOTA_REACHED: u16 = 486;
    pub const ROLE_CONFLICT: u16 = 487;
    pub const SERVER_ERROR: u16 = 500;
    pub const INSUFFICIENT_CAPACITY: u16 = 508;

    /// Create a new [`ErrorCode`] [`Attribute`]
    ///
    /// # Errors
    ///
    /// - When the code value is out of range [300, 699]
    ///
    /// # Examples
    /// ```
    /// # use floe_proto::stun::attribute::*;
    /// let error = ErrorCode::new(400, "Bad Request").unwrap();
    /// assert_eq!(error.code(), 400);
    /// assert_eq!(error.reason(), "Bad Request");
    /// ```
    pub fn new(code: u16, reason: &str) -> Result<Self, StunParseError> {
        if !(300..700).contains(&code) {
            return Err(StunParseError::OutOfRange);
        }
        Ok(Self {
            code,
            reason: reason.to_owned(),
        })
    }

    /// Create a new [`ErrorCode`] [`Attribute`] with the default reason
    /// phrase for the code
    pub fn from_code(code: u16) -> Result<Self, StunParseError> {
        Self::new(code, Self::default_reason_for_code(code))
    }

    /// The error code value
    pub fn code(&self) -> u16 {
        self.code
    }

    /// The error code reason string
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// The default reason string for an error code value
    pub fn default_reason_for_code(code: u16) -> &'static str {
        match code {
            Self::TRY_ALTERNATE => "Try Alternate",
            Self::BAD_REQUEST => "Bad Request",
            Self::UNAUTHORIZED => "Unauthorized",
            Self::FORBIDDEN => "Forbidden",
            Self::UNKNOWN_ATTRIBUTE => "Unknown Attribute",
            Self::ALLOCATION_MISMATCH => "Allocation Mismatch",
            Self::STALE_NONCE => "Stale Nonce",
            Self::ADDRESS_FAMILY_NOT_SUPPORTED => "Address Family Not Supported",
            Self::WRONG_CREDENTIALS => "Wrong Credentials",
            Self::UNSUPPORTED_TRANSPORT_PROTOCOL => "Unsupported Transport Protocol",
            Self::PEER_ADDRESS_FAMILY_MISMATCH => "Peer Address Family Mismatch",
            Self::ALLOCATION_QUOTA_REACHED => "Allocation Quota Reached",
            Self::ROLE_CONFLICT => "Role Conflict",
            Self::SERVER_ERROR => "Server Error",
            Self::INSUFFICIENT_CAPACITY => "Insufficient Capacity",
            _ => "Unknown",
        }
    }

    fn to_raw(&self) -> RawAttribute {
        let mut data = Vec::with_capacity(self.length() as usize);
        data.push(0u8);
        data.push(0u8);
        data.push((self.code / 100) as u8);
        data.push((self.code % 100) as u8);
        data.extend(self.reason.as_bytes());
        RawAttribute::new(ERROR_CODE, &data)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} '{}'", self.get_type(), self.code, self.reason)
    }
}

/// The UnknownAttributes [`Attribute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAttributes {
    attributes: Vec<AttributeType>,
}

impl Attribute for UnknownAttributes {
    fn get_type(&self) -> AttributeType {
        UNKNOWN_ATTRIBUTES
    }

    fn length(&self) -> u16 {
        (self.attributes.len() as u16) * 2
    }
}
attr_from!(UnknownAttributes);

impl TryFrom<&RawAttribute> for UnknownAttributes {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != UNKNOWN_ATTRIBUTES {
            return Err(StunParseError::WrongAttributeType);
        }
        if raw.value.len() % 2 != 0 {
            /* all attribute types are 16-bits */
            return Err(StunParseError::InvalidData);
        }
        let mut attrs = vec![];
        for attr in raw.value.chunks_exact(2) {
            attrs.push(BigEndian::read_u16(attr).into());
        }
        Ok(Self { attributes: attrs })
    }
}

impl UnknownAttributes {
    /// Create a new UnknownAttributes [`Attribute`]
    ///
    /// # Examples
    /// ```
    /// # use floe_proto::stun::attribute::*;
    /// let unknown = UnknownAttributes::new(&[USERNAME]);
    /// assert!(unknown.has_attribute(USERNAME));
    /// ```
    pub fn new(attrs: &[AttributeType]) -> Self {
        Self {
            attributes: attrs.to_vec(),
        }
    }

    /// Whether the [`AttributeType`] is listed
    pub fn has_attribute(&self, attr: AttributeType) -> bool {
        self.attributes.contains(&attr)
    }

    fn to_raw(&self) -> RawAttribute {
        let mut data = Vec::with_capacity(self.length() as usize);
        for attr in &self.attributes {
            let mut encoded = vec![0; 2];
            BigEndian::write_u16(&mut encoded, (*attr).into());
            data.extend(encoded);
        }
        RawAttribute::new(UNKNOWN_ATTRIBUTES, &data)
    }
}

impl std::fmt::Display for UnknownAttributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}", self.get_type(), self.attributes)
    }
}

/// The Priority [`Attribute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Priority {
    priority: u32,
}

impl Attribute for Priority {
    fn get_type(&self) -> AttributeType {
        PRIORITY
    }

    fn length(&self) -> u16 {
        4
    }
}
attr_from!(Priority);

impl TryFrom<&RawAttribute> for Priority {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != PRIORITY {
            return Err(StunParseError::WrongAttributeType);
        }
        if raw.value.len() != 4 {
            return Err(StunParseError::InvalidData);
        }
        Ok(Self {
            priority: BigEndian::read_u32(&raw.value),
        })
    }
}

impl Priority {
    /// Create a new Priority [`Attribute`]
    pub fn new(priority: u32) -> Self {
        Self { priority }
    }

    /// The priority value
    pub fn priority(&self) -> u32 {
        self.priority
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(PRIORITY, &self.priority.to_be_bytes())
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.get_type(), self.priority)
    }
}

macro_rules! tiebreaker_attr {
    ($(#[$outer:meta])* $CamelType:ident, $atype:ident) => {
        $(#[$outer])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $CamelType {
            tie_breaker: u64,
        }

        impl Attribute for $CamelType {
            fn get_type(&self) -> AttributeType {
                $atype
            }

            fn length(&self) -> u16 {
                8
            }
        }
        attr_from!($CamelType);

        impl TryFrom<&RawAttribute> for $CamelType {
            type Error = StunParseError;

            fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
                if raw.header.atype != $atype {
                    return Err(StunParseError::WrongAttributeType);
                }
                if raw.value.len() != 8 {
                    return Err(StunParseError::InvalidData);
                }
                Ok(Self {
                    tie_breaker: BigEndian::read_u64(&raw.value),
                })
            }
        }

        impl $CamelType {
            #[doc = concat!("Create a new ", stringify!($CamelType), " [`Attribute`]")]
            pub fn new(tie_breaker: u64) -> Self {
                Self { tie_breaker }
            }

            /// The tie breaker value
            pub fn tie_breaker(&self) -> u64 {
                self.tie_breaker
            }

            fn to_raw(&self) -> RawAttribute {
                RawAttribute::new($atype, &self.tie_breaker.to_be_bytes())
            }
        }

        impl std::fmt::Display for $CamelType {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}: {:#x}", self.get_type(), self.tie_breaker)
            }
        }
    };
}

tiebreaker_attr!(
    /// The IceControlled [`Attribute`]
    IceControlled,
    ICE_CONTROLLED
);
tiebreaker_attr!(
    /// The IceControlling [`Attribute`]
    IceControlling,
    ICE_CONTROLLING
);

/// The UseCandidate [`Attribute`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UseCandidate {}

impl Attribute for UseCandidate {
    fn get_type(&self) -> AttributeType {
        USE_CANDIDATE
    }

    fn length(&self) -> u16 {
        0
    }
}
attr_from!(UseCandidate);

impl TryFrom<&RawAttribute> for UseCandidate {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != USE_CANDIDATE {
            return Err(StunParseError::WrongAttributeType);
        }
        if !raw.value.is_empty() {
            return Err(StunParseError::TooBig);
        }
        Ok(Self {})
    }
}

impl UseCandidate {
    /// Create a new UseCandidate [`Attribute`]
    pub fn new() -> Self {
        Self {}
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(USE_CANDIDATE, &[])
    }
}

impl std::fmt::Display for UseCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get_type())
    }
}

/// A password algorithm value from RFC 8489
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PasswordAlgorithmValue {
    Md5,
    Sha256,
}

impl PasswordAlgorithmValue {
    fn value(self) -> u16 {
        match self {
            Self::Md5 => 0x1,
            Self::Sha256 => 0x2,
        }
    }

    fn from_value(val: u16) -> Result<Self, StunParseError> {
        match val {
            0x1 => Ok(Self::Md5),
            0x2 => Ok(Self::Sha256),
            _ => Err(StunParseError::InvalidData),
        }
    }
}

impl std::fmt::Display for PasswordAlgorithmValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Md5 => write!(f, "MD5"),
            Self::Sha256 => write!(f, "SHA256"),
        }
    }
}

fn write_password_algorithm_values(values: &[PasswordAlgorithmValue]) -> Vec<u8> {
    // no current algorithm has parameters, the parameter length is always 0
    let mut data = Vec::with_capacity(values.len() * 4);
    for value in values {
        let mut encoded = vec![0; 4];
        BigEndian::write_u16(&mut encoded[0..2], value.value());
        data.extend(encoded);
    }
    data
}

fn read_password_algorithm_values(
    data: &[u8],
) -> Result<Vec<PasswordAlgorithmValue>, StunParseError> {
    let mut values = vec![];
    let mut data = data;
    while !data.is_empty() {
        if data.len() < 4 {
            return Err(StunParseError::NotEnoughData);
        }
        let algorithm = BigEndian::read_u16(&data[0..2]);
        let params_len = padded_attr_len(BigEndian::read_u16(&data[2..4]) as usize);
        if data.len() < 4 + params_len {
            return Err(StunParseError::NotEnoughData);
        }
        // skip over any unknown algorithm rather than failing the parse
        if let Ok(value) = PasswordAlgorithmValue::from_value(algorithm) {
            values.push(value);
        }
        data = &data[4 + params_len..];
    }
    Ok(values)
}

/// The PasswordAlgorithms [`Attribute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordAlgorithms {
    algorithms: Vec<PasswordAlgorithmValue>,
}

impl Attribute for PasswordAlgorithms {
    fn get_type(&self) -> AttributeType {
        PASSWORD_ALGORITHMS
    }

    fn length(&self) -> u16 {
        (self.algorithms.len() * 4) as u16
    }
}
attr_from!(PasswordAlgorithms);

impl TryFrom<&RawAttribute> for PasswordAlgorithms {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != PASSWORD_ALGORITHMS {
            return Err(StunParseError::WrongAttributeType);
        }
        Ok(Self {
            algorithms: read_password_algorithm_values(&raw.value)?,
        })
    }
}

impl PasswordAlgorithms {
    /// Create a new PasswordAlgorithms [`Attribute`]
    pub fn new(algorithms: &[PasswordAlgorithmValue]) -> Self {
        Self {
            algorithms: algorithms.to_vec(),
        }
    }

    /// The list of algorithms advertised
    pub fn algorithms(&self) -> &[PasswordAlgorithmValue] {
        &self.algorithms
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(
            PASSWORD_ALGORITHMS,
            &write_password_algorithm_values(&self.algorithms),
        )
    }
}

impl std::fmt::Display for PasswordAlgorithms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}", self.get_type(), self.algorithms)
    }
}

/// The PasswordAlgorithm [`Attribute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordAlgorithm {
    algorithm: PasswordAlgorithmValue,
}

impl Attribute for PasswordAlgorithm {
    fn get_type(&self) -> AttributeType {
        PASSWORD_ALGORITHM
    }

    fn length(&self) -> u16 {
        4
    }
}
attr_from!(PasswordAlgorithm);

impl TryFrom<&RawAttribute> for PasswordAlgorithm {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != PASSWORD_ALGORITHM {
            return Err(StunParseError::WrongAttributeType);
        }
        let values = read_password_algorithm_values(&raw.value)?;
        if values.len() != 1 {
            return Err(StunParseError::InvalidData);
        }
        Ok(Self {
            algorithm: values[0],
        })
    }
}

impl PasswordAlgorithm {
    /// Create a new PasswordAlgorithm [`Attribute`]
    pub fn new(algorithm: PasswordAlgorithmValue) -> Self {
        Self { algorithm }
    }

    /// The algorithm value
    pub fn algorithm(&self) -> PasswordAlgorithmValue {
        self.algorithm
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(
            PASSWORD_ALGORITHM,
            &write_password_algorithm_values(&[self.algorithm]),
        )
    }
}

impl std::fmt::Display for PasswordAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.get_type(), self.algorithm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() -> tracing::subscriber::DefaultGuard {
        crate::tests::test_init_log()
    }

    #[test]
    fn mapped_address_roundtrip() {
        let _log = init();
        for addr in [
            "192.168.10.200:9876".parse().unwrap(),
            "[fd12:3456:789a:1::1]:543".parse::<SocketAddr>().unwrap(),
        ] {
            let mapped = MappedAddress::new(addr);
            let raw = RawAttribute::from(mapped);
            let parsed = MappedAddress::try_from(&raw).unwrap();
            assert_eq!(parsed.addr(), addr);
        }
    }

    #[test]
    fn xor_mapped_address_roundtrip() {
        let _log = init();
        let transaction_id = 0x9876_5432_1098_7654_3210_9876.into();
        for addr in [
            "192.168.10.200:9876".parse().unwrap(),
            "[fd12:3456:789a:1::1]:543".parse::<SocketAddr>().unwrap(),
        ] {
            let mapped = XorMappedAddress::new(addr, transaction_id);
            let raw = RawAttribute::from(mapped);
            let parsed = XorMappedAddress::try_from(&raw).unwrap();
            assert_eq!(parsed.addr(transaction_id), addr);
            // without the transaction id, a v6 address does not de-XOR back
            if addr.is_ipv6() {
                assert_ne!(parsed.addr(0x0.into()), addr);
            }
        }
    }

    #[test]
    fn wrong_attribute_type_rejected() {
        let _log = init();
        let raw = RawAttribute::new(PRIORITY, &[0, 0, 0, 1]);
        assert_eq!(
            Username::try_from(&raw),
            Err(StunParseError::WrongAttributeType)
        );
    }

    #[test]
    fn username_too_long() {
        let _log = init();
        let long = "a".repeat(514);
        assert_eq!(Username::new(&long), Err(StunParseError::TooBig));
    }

    #[test]
    fn error_code_roundtrip() {
        let _log = init();
        let error = ErrorCode::from_code(ErrorCode::ROLE_CONFLICT).unwrap();
        assert_eq!(error.reason(), "Role Conflict");
        let raw = RawAttribute::from(error);
        let parsed = ErrorCode::try_from(&raw).unwrap();
        assert_eq!(parsed.code(), 487);
        assert!(ErrorCode::new(299, "").is_err());
        assert!(ErrorCode::new(700, "").is_err());
    }

    #[test]
    fn unknown_attributes_roundtrip() {
        let _log = init();
        let unknown = UnknownAttributes::new(&[USERNAME, PRIORITY]);
        let raw = RawAttribute::from(unknown);
        let parsed = UnknownAttributes::try_from(&raw).unwrap();
        assert!(parsed.has_attribute(USERNAME));
        assert!(parsed.has_attribute(PRIORITY));
        assert!(!parsed.has_attribute(SOFTWARE));
    }

    #[test]
    fn fingerprint_xor_applied_on_wire() {
        let _log = init();
        let fingerprint = Fingerprint::new(0x0123_4567);
        let raw = RawAttribute::from(fingerprint.clone());
        assert_eq!(
            BigEndian::read_u32(&raw.value),
            0x0123_4567 ^ FINGERPRINT_XOR_VALUE
        );
        assert_eq!(Fingerprint::try_from(&raw).unwrap(), fingerprint);
    }

    #[test]
    fn tiebreaker_attributes() {
        let _log = init();
        let controlled = IceControlled::new(0x932f_f9b1_5126_3b36);
        let raw = RawAttribute::from(controlled);
        assert_eq!(raw.header.atype, ICE_CONTROLLED);
        assert_eq!(
            IceControlled::try_from(&raw).unwrap().tie_breaker(),
            0x932f_f9b1_5126_3b36
        );
        let controlling = IceControlling::new(42);
        let raw = RawAttribute::from(controlling);
        assert_eq!(IceControlling::try_from(&raw).unwrap().tie_breaker(), 42);
    }

    #[test]
    fn password_algorithms_roundtrip() {
        let _log = init();
        let algos =
            PasswordAlgorithms::new(&[PasswordAlgorithmValue::Md5, PasswordAlgorithmValue::Sha256]);
        let raw = RawAttribute::from(algos);
        let parsed = PasswordAlgorithms::try_from(&raw).unwrap();
        assert_eq!(
            parsed.algorithms(),
            &[PasswordAlgorithmValue::Md5, PasswordAlgorithmValue::Sha256]
        );
    }

    #[test]
    fn userhash_value() {
        let _log = init();
        let hash = Userhash::hash("user", "realm");
        let attr = Userhash::new(hash);
        let raw = RawAttribute::from(attr);
        assert_eq!(raw.length(), 32);
        assert_eq!(Userhash::try_from(&raw).unwrap().userhash(), &hash);
    }

    #[test]
    fn truncated_attribute_rejected() {
        let _log = init();
        // header advertises 8 bytes but only 4 are present
        let data = &[0x80, 0x22, 0, 8, 1, 2, 3, 4];
        assert_eq!(
            RawAttribute::from_bytes(data),
            Err(StunParseError::NotEnoughData)
        );
    }
}
