// Copyright (C) 2024 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! TURN Attributes
//!
//! The additional STUN attributes used by the TURN client, as specified in
//! [RFC8656].
//!
//! [RFC8656]: https://tools.ietf.org/html/rfc8656

use std::convert::TryFrom;
use std::net::SocketAddr;

use byteorder::{BigEndian, ByteOrder};

use crate::stun::attribute::{
    Attribute, AttributeType, RawAttribute, StunParseError, XorSocketAddr,
};
use crate::stun::message::TransactionId;

pub const CHANNEL_NUMBER: AttributeType = AttributeType(0x000C);
pub const LIFETIME: AttributeType = AttributeType(0x000D);
pub const XOR_PEER_ADDRESS: AttributeType = AttributeType(0x0012);
pub const DATA: AttributeType = AttributeType(0x0013);
pub const XOR_RELAYED_ADDRESS: AttributeType = AttributeType(0x0016);
pub const REQUESTED_TRANSPORT: AttributeType = AttributeType(0x0019);
pub const DONT_FRAGMENT: AttributeType = AttributeType(0x001A);

macro_rules! attr_from {
    ($CamelType:ty) => {
        impl std::convert::From<$CamelType> for RawAttribute {
            fn from(f: $CamelType) -> Self {
                f.to_raw()
            }
        }
    };
}

macro_rules! xor_addr_attr {
    ($(#[$outer:meta])* $CamelType:ident, $atype:ident) => {
        $(#[$outer])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $CamelType {
            addr: XorSocketAddr,
        }

        impl Attribute for $CamelType {
            fn get_type(&self) -> AttributeType {
                $atype
            }

            fn length(&self) -> u16 {
                self.addr.length()
            }
        }
        attr_from!($CamelType);

        impl TryFrom<&RawAttribute> for $CamelType {
            type Error = StunParseError;

            fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
                if raw.header.atype != $atype {
                    return Err(StunParseError::WrongAttributeType);
                }
                Ok(Self {
                    addr: XorSocketAddr::from_raw(raw)?,
                })
            }
        }

        impl $CamelType {
            #[doc = concat!("Create a new ", stringify!($CamelType), " [`Attribute`]")]
            pub fn new(addr: SocketAddr, transaction: TransactionId) -> Self {
                Self {
                    addr: XorSocketAddr::new(addr, transaction),
                }
            }

            /// Retrieve the address stored in the attribute
            pub fn addr(&self, transaction: TransactionId) -> SocketAddr {
                self.addr.addr(transaction)
            }

            fn to_raw(&self) -> RawAttribute {
                self.addr.to_raw($atype)
            }
        }

        impl std::fmt::Display for $CamelType {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}: XOR({})", self.get_type(), self.addr.addr)
            }
        }
    };
}

xor_addr_attr!(
    /// The XorPeerAddress [`Attribute`]
    XorPeerAddress,
    XOR_PEER_ADDRESS
);
xor_addr_attr!(
    /// The XorRelayedAddress [`Attribute`]
    XorRelayedAddress,
    XOR_RELAYED_ADDRESS
);

/// The ChannelNumber [`Attribute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNumber {
    channel: u16,
}

impl Attribute for ChannelNumber {
    fn get_type(&self) -> AttributeType {
        CHANNEL_NUMBER
    }

    fn length(&self) -> u16 {
        4
    }
}
attr_from!(ChannelNumber);

impl TryFrom<&RawAttribute> for ChannelNumber {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != CHANNEL_NUMBER {
            return Err(StunParseError::WrongAttributeType);
        }
        if raw.value.len() != 4 {
            return Err(StunParseError::InvalidData);
        }
        Ok(Self {
            channel: BigEndian::read_u16(&raw.value[0..2]),
        })
    }
}

impl ChannelNumber {
    /// Create a new ChannelNumber [`Attribute`]
    pub fn new(channel: u16) -> Self {
        Self { channel }
    }

    /// The channel number
    pub fn channel(&self) -> u16 {
        self.channel
    }

    fn to_raw(&self) -> RawAttribute {
        let mut data = [0; 4];
        BigEndian::write_u16(&mut data[0..2], self.channel);
        RawAttribute::new(CHANNEL_NUMBER, &data)
    }
}

impl std::fmt::Display for ChannelNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:#x}", self.get_type(), self.channel)
    }
}

/// The Lifetime [`Attribute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifetime {
    seconds: u32,
}

impl Attribute for Lifetime {
    fn get_type(&self) -> AttributeType {
        LIFETIME
    }

    fn length(&self) -> u16 {
        4
    }
}
attr_from!(Lifetime);

impl TryFrom<&RawAttribute> for Lifetime {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != LIFETIME {
            return Err(StunParseError::WrongAttributeType);
        }
        if raw.value.len() != 4 {
            return Err(StunParseError::InvalidData);
        }
        Ok(Self {
            seconds: BigEndian::read_u32(&raw.value),
        })
    }
}

impl Lifetime {
    /// Create a new Lifetime [`Attribute`]
    pub fn new(seconds: u32) -> Self {
        Self { seconds }
    }

    /// The lifetime in seconds
    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(LIFETIME, &self.seconds.to_be_bytes())
    }
}

impl std::fmt::Display for Lifetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}s", self.get_type(), self.seconds)
    }
}

/// The RequestedTransport [`Attribute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedTransport {
    protocol: u8,
}

impl Attribute for RequestedTransport {
    fn get_type(&self) -> AttributeType {
        REQUESTED_TRANSPORT
    }

    fn length(&self) -> u16 {
        4
    }
}
attr_from!(RequestedTransport);

impl TryFrom<&RawAttribute> for RequestedTransport {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != REQUESTED_TRANSPORT {
            return Err(StunParseError::WrongAttributeType);
        }
        if raw.value.len() != 4 {
            return Err(StunParseError::InvalidData);
        }
        Ok(Self {
            protocol: raw.value[0],
        })
    }
}

impl RequestedTransport {
    /// The UDP protocol number
    pub const UDP: u8 = 17;

    /// Create a new RequestedTransport [`Attribute`]
    pub fn new(protocol: u8) -> Self {
        Self { protocol }
    }

    /// The requested transport protocol number
    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(REQUESTED_TRANSPORT, &[self.protocol, 0, 0, 0])
    }
}

impl std::fmt::Display for RequestedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.get_type(), self.protocol)
    }
}

/// The DontFragment [`Attribute`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DontFragment {}

impl Attribute for DontFragment {
    fn get_type(&self) -> AttributeType {
        DONT_FRAGMENT
    }

    fn length(&self) -> u16 {
        0
    }
}
attr_from!(DontFragment);

impl TryFrom<&RawAttribute> for DontFragment {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != DONT_FRAGMENT {
            return Err(StunParseError::WrongAttributeType);
        }
        if !raw.value.is_empty() {
            return Err(StunParseError::TooBig);
        }
        Ok(Self {})
    }
}

impl DontFragment {
    /// Create a new DontFragment [`Attribute`]
    pub fn new() -> Self {
        Self {}
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(DONT_FRAGMENT, &[])
    }
}

impl std::fmt::Display for DontFragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get_type())
    }
}

/// The Data [`Attribute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    data: Vec<u8>,
}

impl Attribute for Data {
    fn get_type(&self) -> AttributeType {
        DATA
    }

    fn length(&self) -> u16 {
        self.data.len() as u16
    }
}
attr_from!(Data);

impl TryFrom<&RawAttribute> for Data {
    type Error = StunParseError;

    fn try_from(raw: &RawAttribute) -> Result<Self, Self::Error> {
        if raw.header.atype != DATA {
            return Err(StunParseError::WrongAttributeType);
        }
        Ok(Self {
            data: raw.value.clone(),
        })
    }
}

impl Data {
    /// Create a new Data [`Attribute`]
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }

    /// The application data carried in the attribute
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(DATA, &self.data)
    }
}

impl std::fmt::Display for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} bytes", self.get_type(), self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() -> tracing::subscriber::DefaultGuard {
        crate::tests::test_init_log()
    }

    #[test]
    fn xor_peer_address_roundtrip() {
        let _log = init();
        let transaction_id = TransactionId::generate();
        let addr: SocketAddr = "198.51.100.17:4242".parse().unwrap();
        let peer = XorPeerAddress::new(addr, transaction_id);
        let raw = RawAttribute::from(peer);
        assert_eq!(raw.header.atype, XOR_PEER_ADDRESS);
        assert_eq!(
            XorPeerAddress::try_from(&raw).unwrap().addr(transaction_id),
            addr
        );
    }

    #[test]
    fn channel_number_roundtrip() {
        let _log = init();
        let attr = ChannelNumber::new(0x4001);
        let raw = RawAttribute::from(attr);
        assert_eq!(ChannelNumber::try_from(&raw).unwrap().channel(), 0x4001);
    }

    #[test]
    fn requested_transport_udp() {
        let _log = init();
        let attr = RequestedTransport::new(RequestedTransport::UDP);
        let raw = RawAttribute::from(attr);
        assert_eq!(raw.value, &[17, 0, 0, 0]);
        assert_eq!(RequestedTransport::try_from(&raw).unwrap().protocol(), 17);
    }

    #[test]
    fn data_roundtrip() {
        let _log = init();
        let attr = Data::new(&[1, 2, 3, 4, 5]);
        let raw = RawAttribute::from(attr);
        assert_eq!(Data::try_from(&raw).unwrap().data(), &[1, 2, 3, 4, 5]);
    }
}
