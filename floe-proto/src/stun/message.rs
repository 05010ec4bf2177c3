// Copyright (C) 2024 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! STUN Messages
//!
//! Generating, parsing, signing and verifying STUN messages as specified in
//! [RFC8489] and [RFC5389].
//!
//! [RFC8489]: https://tools.ietf.org/html/rfc8489
//! [RFC5389]: https://tools.ietf.org/html/rfc5389

use std::convert::TryFrom;

use byteorder::{BigEndian, ByteOrder};
use hmac::{Hmac, Mac};
use tracing::{debug, warn};

use crate::stun::attribute::*;

/// The value of the magic cookie (in network byte order) as specified in
/// RFC5389 and RFC8489.
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// The value of the binding message type.  Can be used in a request, an
/// indication, or a response.
pub const BINDING: u16 = 0x0001;

/// The size in bytes of a STUN transaction ID on the wire.
pub const STUN_TRANSACTION_ID_SIZE: usize = 12;

const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// A STUN transaction identifier.  96 bits are valid.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TransactionId(u128);

impl TransactionId {
    /// Generate a new random [`TransactionId`]
    pub fn generate() -> Self {
        use rand::{thread_rng, Rng};
        Self(thread_rng().gen::<u128>() & 0x0000_0000_ffff_ffff_ffff_ffff_ffff_ffff)
    }
}

impl From<u128> for TransactionId {
    fn from(v: u128) -> Self {
        Self(v & 0x0000_0000_ffff_ffff_ffff_ffff_ffff_ffff)
    }
}

impl From<TransactionId> for u128 {
    fn from(v: TransactionId) -> Self {
        v.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Errors produced when handling a STUN [`Message`]
#[derive(Debug, PartialEq, Eq)]
pub enum StunError {
    /// The data is malformed and cannot be interpreted as a STUN message
    Malformed,
    /// Not enough data for a complete STUN message
    NotEnoughData,
    /// The FINGERPRINT attribute does not match the message contents
    BadFingerprint,
    /// The integrity check failed with the provided credentials
    IntegrityCheckFailed,
    /// An attribute of this type already exists in the message
    AlreadyExists,
    /// A requested attribute was not found
    ResourceNotFound,
    /// A parsing failure in an attribute
    Parse(StunParseError),
}

impl std::error::Error for StunError {}

impl std::fmt::Display for StunError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<StunParseError> for StunError {
    fn from(e: StunParseError) -> Self {
        StunError::Parse(e)
    }
}

/// Structure for holding short-term STUN credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortTermCredentials {
    /// The password.  Must already be OpaqueString processed where required.
    pub password: String,
}

/// Structure for holding long-term STUN credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongTermCredentials {
    pub username: String,
    pub realm: String,
    pub password: String,
}

/// The credentials used to sign or verify a [`Message`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageIntegrityCredentials {
    ShortTerm(ShortTermCredentials),
    LongTerm(LongTermCredentials),
}

/// The algorithm used for the message integrity HMAC
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IntegrityAlgorithm {
    Sha1,
    Sha256,
}

impl MessageIntegrityCredentials {
    /// Derive the HMAC key for these credentials.  Short-term credentials
    /// use the password directly; long-term credentials hash
    /// "username:realm:password" with MD5 for SHA-1 integrity and with
    /// SHA-256 for SHA-256 integrity (RFC 8489 Section 18.5.1).
    fn make_hmac_key(&self, algorithm: IntegrityAlgorithm) -> Vec<u8> {
        match self {
            MessageIntegrityCredentials::ShortTerm(short) => short.password.clone().into(),
            MessageIntegrityCredentials::LongTerm(long) => {
                let data = format!("{}:{}:{}", long.username, long.realm, long.password);
                match algorithm {
                    IntegrityAlgorithm::Sha1 => {
                        use md5::{Digest, Md5};
                        let mut digest = Md5::new();
                        digest.update(data.as_bytes());
                        digest.finalize().to_vec()
                    }
                    IntegrityAlgorithm::Sha256 => {
                        use sha2::{Digest, Sha256};
                        let mut digest = Sha256::new();
                        digest.update(data.as_bytes());
                        digest.finalize().to_vec()
                    }
                }
            }
        }
    }
}

/// The class of a [`Message`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    Success,
    Error,
}

impl MessageClass {
    /// Whether this [`MessageClass`] is of a response type, i.e. either
    /// [`MessageClass::Success`] or [`MessageClass::Error`].
    pub fn is_response(self) -> bool {
        matches!(self, MessageClass::Success | MessageClass::Error)
    }

    fn to_bits(self) -> u16 {
        match self {
            MessageClass::Request => 0x000,
            MessageClass::Indication => 0x010,
            MessageClass::Success => 0x100,
            MessageClass::Error => 0x110,
        }
    }
}

/// The type of a [`Message`]: a combination of a [`MessageClass`] and a
/// STUN method
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MessageType(u16);

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MessageType(class: {:?}, method: {:#x})",
            self.class(),
            self.method()
        )
    }
}

impl MessageType {
    /// Create a new [`MessageType`] from the provided [`MessageClass`] and method
    ///
    /// # Examples
    /// ```
    /// # use floe_proto::stun::message::{MessageType, MessageClass, BINDING};
    /// let mtype = MessageType::from_class_method(MessageClass::Indication, BINDING);
    /// assert_eq!(mtype.class(), MessageClass::Indication);
    /// assert_eq!(mtype.method(), BINDING);
    /// ```
    pub fn from_class_method(class: MessageClass, method: u16) -> Self {
        let class_bits = MessageClass::to_bits(class);
        let method_bits = method & 0xf | (method & 0x70) << 1 | (method & 0xf80) << 2;
        Self(class_bits | method_bits)
    }

    /// The [`MessageClass`] of this [`MessageType`]
    pub fn class(self) -> MessageClass {
        let class = (self.0 & 0x10) >> 4 | (self.0 & 0x100) >> 7;
        match class {
            0x0 => MessageClass::Request,
            0x1 => MessageClass::Indication,
            0x2 => MessageClass::Success,
            0x3 => MessageClass::Error,
            _ => unreachable!(),
        }
    }

    /// Whether this [`MessageType`] indicates a response
    pub fn is_response(self) -> bool {
        self.class().is_response()
    }

    /// The method of this [`MessageType`]
    pub fn method(self) -> u16 {
        self.0 & 0xf | (self.0 & 0xe0) >> 1 | (self.0 & 0x3e00) >> 2
    }

    fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    fn from_bytes(data: &[u8]) -> Result<Self, StunError> {
        let data = BigEndian::read_u16(data);
        if data & 0xc000 != 0x0 {
            /* not a stun packet */
            return Err(StunError::Malformed);
        }
        Ok(Self(data))
    }
}

/// The structure that encapsulates the entirety of a STUN message
///
/// Contains the [`MessageType`], a [`TransactionId`], and a list of
/// [`RawAttribute`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    msg_type: MessageType,
    transaction: TransactionId,
    attributes: Vec<RawAttribute>,
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Message(class: {:?}, method: {:#x}, transaction: {}, attributes: [",
            self.class(),
            self.method(),
            self.transaction_id()
        )?;
        for (i, a) in self.attributes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", a.get_type().name())?;
        }
        write!(f, "])")
    }
}

impl Message {
    /// Create a new [`Message`] with the provided [`MessageType`] and
    /// transaction ID
    pub fn new(mtype: MessageType, transaction: TransactionId) -> Self {
        Self {
            msg_type: mtype,
            transaction,
            attributes: vec![],
        }
    }

    /// Create a new request [`Message`] of the provided method with a
    /// random transaction ID
    pub fn new_request(method: u16) -> Self {
        Message::new(
            MessageType::from_class_method(MessageClass::Request, method),
            TransactionId::generate(),
        )
    }

    /// Create a new indication [`Message`] of the provided method with a
    /// random transaction ID
    pub fn new_indication(method: u16) -> Self {
        Message::new(
            MessageType::from_class_method(MessageClass::Indication, method),
            TransactionId::generate(),
        )
    }

    /// Create a new success response [`Message`] matching the provided
    /// request
    pub fn new_success(orig: &Message) -> Self {
        debug_assert!(orig.has_class(MessageClass::Request));
        Message::new(
            MessageType::from_class_method(MessageClass::Success, orig.method()),
            orig.transaction_id(),
        )
    }

    /// Create a new error response [`Message`] matching the provided request
    pub fn new_error(orig: &Message) -> Self {
        Message::new(
            MessageType::from_class_method(MessageClass::Error, orig.method()),
            orig.transaction_id(),
        )
    }

    /// The [`MessageType`] of this [`Message`]
    pub fn get_type(&self) -> MessageType {
        self.msg_type
    }

    /// The [`MessageClass`] of this [`Message`]
    pub fn class(&self) -> MessageClass {
        self.get_type().class()
    }

    /// Whether this [`Message`] is of the specified [`MessageClass`]
    pub fn has_class(&self, cls: MessageClass) -> bool {
        self.class() == cls
    }

    /// Whether this [`Message`] is a response
    pub fn is_response(&self) -> bool {
        self.class().is_response()
    }

    /// The method of this [`Message`]
    pub fn method(&self) -> u16 {
        self.get_type().method()
    }

    /// Whether this [`Message`] is of the specified method
    pub fn has_method(&self, method: u16) -> bool {
        self.method() == method
    }

    /// The [`TransactionId`] of this [`Message`]
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction
    }

    /// Whether the provided datagram looks like a STUN message: at least a
    /// header's worth of data, the two topmost bits zero, and the magic
    /// cookie in place.
    ///
    /// # Examples
    /// ```
    /// # use floe_proto::stun::message::{Message, BINDING};
    /// let msg = Message::new_request(BINDING);
    /// assert!(Message::is_stun(&msg.to_bytes()));
    /// assert!(!Message::is_stun(&[0x41, 0, 1, 2]));
    /// ```
    pub fn is_stun(data: &[u8]) -> bool {
        if data.len() < 20 {
            return false;
        }
        if data[0] & 0xc0 != 0x0 {
            return false;
        }
        BigEndian::read_u32(&data[4..8]) == MAGIC_COOKIE
    }

    /// Serialize this [`Message`] to network bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut attr_size = 0;
        for attr in &self.attributes {
            attr_size += padded_attr_size(attr);
        }
        let mut ret = Vec::with_capacity(20 + attr_size);
        ret.extend(self.msg_type.to_bytes());
        ret.resize(20, 0);
        let tid = (MAGIC_COOKIE as u128) << 96 | u128::from(self.transaction);
        BigEndian::write_u128(&mut ret[4..20], tid);
        BigEndian::write_u16(&mut ret[2..4], attr_size as u16);
        for attr in &self.attributes {
            ret.extend(attr.to_bytes());
        }
        ret
    }

    /// Deserialize a [`Message`] from the provided datagram.
    ///
    /// The datagram length must exactly match the advertised message
    /// length.  A FINGERPRINT attribute, when present, is validated and a
    /// mismatch rejects the message.  Attributes other than the integrity
    /// pair and FINGERPRINT appearing after MESSAGE-INTEGRITY(-SHA256) are
    /// rejected.
    pub fn from_bytes(data: &[u8]) -> Result<Self, StunError> {
        let orig_data = data;

        if data.len() < 20 {
            return Err(StunError::NotEnoughData);
        }
        let mtype = MessageType::from_bytes(data)?;
        let mlength = BigEndian::read_u16(&data[2..]) as usize;
        if mlength + 20 != data.len() {
            warn!(
                "advertised size {} does not match data size {}",
                mlength + 20,
                data.len()
            );
            return Err(StunError::Malformed);
        }
        let tid = BigEndian::read_u128(&data[4..]);
        let cookie = (tid >> 96) as u32;
        if cookie != MAGIC_COOKIE {
            warn!("wrong magic cookie {cookie:#x}");
            return Err(StunError::Malformed);
        }
        let mut ret = Self::new(mtype, TransactionId::from(tid));

        let mut data_offset = 20;
        let mut data = &data[20..];
        let mut seen_message_integrity = false;
        let mut seen_fingerprint = false;
        while !data.is_empty() {
            let attr = RawAttribute::from_bytes(data)?;
            let padded_len = padded_attr_size(&attr);
            if padded_len > data.len() {
                return Err(StunError::NotEnoughData);
            }

            if seen_fingerprint {
                // FINGERPRINT must be the last attribute
                warn!("attribute {} after FINGERPRINT", attr.get_type());
                return Err(StunError::Malformed);
            }
            if seen_message_integrity
                && attr.get_type() != FINGERPRINT
                && attr.get_type() != MESSAGE_INTEGRITY_SHA256
            {
                warn!(
                    "unexpected attribute {} after MESSAGE-INTEGRITY",
                    attr.get_type()
                );
                return Err(StunError::Malformed);
            }

            if attr.get_type() == MESSAGE_INTEGRITY || attr.get_type() == MESSAGE_INTEGRITY_SHA256 {
                seen_message_integrity = true;
            }
            if attr.get_type() == FINGERPRINT {
                seen_fingerprint = true;
                let f = Fingerprint::try_from(&attr)?;
                let mut fingerprint_data = orig_data[..data_offset].to_vec();
                BigEndian::write_u16(
                    &mut fingerprint_data[2..4],
                    (data_offset + padded_len - 20) as u16,
                );
                let calculated = CRC.checksum(&fingerprint_data);
                if calculated != f.crc() {
                    warn!(
                        "fingerprint mismatch: calculated {:#x}, message has {:#x}",
                        calculated,
                        f.crc()
                    );
                    return Err(StunError::BadFingerprint);
                }
            }
            ret.attributes.push(attr);
            data = &data[padded_len..];
            data_offset += padded_len;
        }
        Ok(ret)
    }

    /// Whether this [`Message`] carries a MESSAGE-INTEGRITY or
    /// MESSAGE-INTEGRITY-SHA256 attribute.  Presence does not imply the
    /// integrity has been verified; see [`Message::validate_integrity`].
    pub fn has_integrity(&self) -> bool {
        self.has_attribute(MESSAGE_INTEGRITY) || self.has_attribute(MESSAGE_INTEGRITY_SHA256)
    }

    /// Validate the integrity attribute against the provided credentials.
    ///
    /// The original datagram this [`Message`] was parsed from must be
    /// provided.  MESSAGE-INTEGRITY-SHA256 is preferred when both integrity
    /// attributes are present; a truncated SHA-256 HMAC is compared over
    /// the length the message specifies.  Comparison is constant time.
    pub fn validate_integrity(
        &self,
        orig_data: &[u8],
        credentials: &MessageIntegrityCredentials,
    ) -> Result<(), StunError> {
        let (atype, algorithm) = if self.has_attribute(MESSAGE_INTEGRITY_SHA256) {
            (MESSAGE_INTEGRITY_SHA256, IntegrityAlgorithm::Sha256)
        } else if self.has_attribute(MESSAGE_INTEGRITY) {
            (MESSAGE_INTEGRITY, IntegrityAlgorithm::Sha1)
        } else {
            return Err(StunError::ResourceNotFound);
        };

        // find the offset of the integrity attribute within the original
        // data; the HMAC covers everything before it with the length field
        // rewritten to include the integrity attribute itself
        if orig_data.len() < 20 {
            return Err(StunError::NotEnoughData);
        }
        let mut data = &orig_data[20..];
        let mut data_offset = 20;
        while !data.is_empty() {
            let attr = RawAttribute::from_bytes(data)?;
            let padded_len = padded_attr_size(&attr);
            if attr.get_type() == atype {
                let key = credentials.make_hmac_key(algorithm);
                let mut hmac_data = orig_data[..data_offset].to_vec();
                BigEndian::write_u16(
                    &mut hmac_data[2..4],
                    (data_offset - 20 + 4 + attr.length() as usize) as u16,
                );
                return match algorithm {
                    IntegrityAlgorithm::Sha1 => {
                        let mut hmac = Hmac::<sha1::Sha1>::new_from_slice(&key)
                            .map_err(|_| StunError::Malformed)?;
                        hmac.update(&hmac_data);
                        hmac.verify_slice(&attr.value)
                            .map_err(|_| StunError::IntegrityCheckFailed)
                    }
                    IntegrityAlgorithm::Sha256 => {
                        let mut hmac = Hmac::<sha2::Sha256>::new_from_slice(&key)
                            .map_err(|_| StunError::Malformed)?;
                        hmac.update(&hmac_data);
                        hmac.verify_truncated_left(&attr.value)
                            .map_err(|_| StunError::IntegrityCheckFailed)
                    }
                };
            }
            data = &data[padded_len..];
            data_offset += padded_len;
        }
        // the message has an integrity attribute but the data doesn't:
        // wrong data for this message
        Err(StunError::Malformed)
    }

    /// Add a MESSAGE-INTEGRITY or MESSAGE-INTEGRITY-SHA256 attribute signed
    /// with the provided credentials.
    ///
    /// # Errors
    ///
    /// - If an integrity attribute of the same algorithm is already present
    /// - If a FINGERPRINT attribute is already present
    ///
    /// # Examples
    /// ```
    /// # use floe_proto::stun::message::*;
    /// let mut message = Message::new_request(BINDING);
    /// let credentials = MessageIntegrityCredentials::ShortTerm(ShortTermCredentials {
    ///     password: "pass".to_owned(),
    /// });
    /// message.add_message_integrity(&credentials, IntegrityAlgorithm::Sha1).unwrap();
    /// let data = message.to_bytes();
    /// assert!(message.validate_integrity(&data, &credentials).is_ok());
    /// ```
    pub fn add_message_integrity(
        &mut self,
        credentials: &MessageIntegrityCredentials,
        algorithm: IntegrityAlgorithm,
    ) -> Result<(), StunError> {
        let atype = match algorithm {
            IntegrityAlgorithm::Sha1 => MESSAGE_INTEGRITY,
            IntegrityAlgorithm::Sha256 => MESSAGE_INTEGRITY_SHA256,
        };
        if self.has_attribute(atype) {
            return Err(StunError::AlreadyExists);
        }
        if self.has_attribute(FINGERPRINT) {
            return Err(StunError::AlreadyExists);
        }
        // SHA-1 integrity must precede SHA-256 on the wire
        if algorithm == IntegrityAlgorithm::Sha1 && self.has_attribute(MESSAGE_INTEGRITY_SHA256) {
            return Err(StunError::AlreadyExists);
        }

        // the HMAC is computed over all the data up to (exclusive of) the
        // integrity attribute but with a length field that includes it
        let integrity_len = match algorithm {
            IntegrityAlgorithm::Sha1 => 24,
            IntegrityAlgorithm::Sha256 => 36,
        };
        let mut bytes = self.to_bytes();
        let existing_len = BigEndian::read_u16(&bytes[2..4]);
        BigEndian::write_u16(&mut bytes[2..4], existing_len + integrity_len);
        let key = credentials.make_hmac_key(algorithm);
        match algorithm {
            IntegrityAlgorithm::Sha1 => {
                let mut hmac =
                    Hmac::<sha1::Sha1>::new_from_slice(&key).map_err(|_| StunError::Malformed)?;
                hmac.update(&bytes);
                let integrity = hmac.finalize().into_bytes();
                self.attributes
                    .push(MessageIntegrity::new(integrity.into()).into());
            }
            IntegrityAlgorithm::Sha256 => {
                let mut hmac =
                    Hmac::<sha2::Sha256>::new_from_slice(&key).map_err(|_| StunError::Malformed)?;
                hmac.update(&bytes);
                let integrity = hmac.finalize().into_bytes();
                self.attributes
                    .push(MessageIntegritySha256::new(&integrity)?.into());
            }
        }
        Ok(())
    }

    /// Add a FINGERPRINT attribute to this [`Message`]
    ///
    /// # Errors
    ///
    /// - If a FINGERPRINT attribute is already present
    pub fn add_fingerprint(&mut self) -> Result<(), StunError> {
        if self.has_attribute(FINGERPRINT) {
            return Err(StunError::AlreadyExists);
        }
        // the fingerprint is computed over all the data up to (exclusive
        // of) the FINGERPRINT attribute but with a length field that
        // includes it
        let mut bytes = self.to_bytes();
        let existing_len = BigEndian::read_u16(&bytes[2..4]);
        BigEndian::write_u16(&mut bytes[2..4], existing_len + 8);
        let fingerprint = CRC.checksum(&bytes);
        self.attributes.push(Fingerprint::new(fingerprint).into());
        Ok(())
    }

    /// Add an [`Attribute`] to this [`Message`].  Only one attribute of
    /// each [`AttributeType`] may exist in a message.
    ///
    /// # Errors
    ///
    /// - If attempting to add an integrity or FINGERPRINT attribute; use
    ///   [`Message::add_message_integrity`] or [`Message::add_fingerprint`]
    /// - If an attribute of the same type already exists
    /// - If an integrity or FINGERPRINT attribute has already been added
    pub fn add_attribute(&mut self, attr: impl Into<RawAttribute>) -> Result<(), StunError> {
        let attr: RawAttribute = attr.into();
        if matches!(
            attr.get_type(),
            MESSAGE_INTEGRITY | MESSAGE_INTEGRITY_SHA256 | FINGERPRINT
        ) {
            return Err(StunError::Malformed);
        }
        if self.has_attribute(attr.get_type()) {
            return Err(StunError::AlreadyExists);
        }
        if self.has_integrity() || self.has_attribute(FINGERPRINT) {
            return Err(StunError::AlreadyExists);
        }
        self.attributes.push(attr);
        Ok(())
    }

    /// Retrieve a [`RawAttribute`] from this [`Message`]
    pub fn get_attribute(&self, atype: AttributeType) -> Option<&RawAttribute> {
        self.attributes.iter().find(|attr| attr.get_type() == atype)
    }

    /// Retrieve a typed attribute from this [`Message`]
    pub fn attribute<A>(&self, atype: AttributeType) -> Option<A>
    where
        A: for<'a> TryFrom<&'a RawAttribute>,
    {
        self.get_attribute(atype).and_then(|raw| A::try_from(raw).ok())
    }

    /// Returns an iterator over the attributes in the [`Message`]
    pub fn iter_attributes(&self) -> impl Iterator<Item = &RawAttribute> {
        self.attributes.iter()
    }

    /// Whether this [`Message`] contains an attribute of the specified type
    pub fn has_attribute(&self, atype: AttributeType) -> bool {
        self.get_attribute(atype).is_some()
    }

    /// Check that a [`Message`] contains only comprehension-required
    /// attributes that are supported, and all of a set of required
    /// attributes.  Returns an appropriate error response message on
    /// failure to meet these requirements.
    pub fn check_attribute_types(
        msg: &Message,
        supported: &[AttributeType],
        required_in_msg: &[AttributeType],
    ) -> Option<Message> {
        let unsupported: Vec<AttributeType> = msg
            .iter_attributes()
            .map(|a| a.get_type())
            .filter(|&at| at.comprehension_required() && !supported.contains(&at))
            .collect();
        if !unsupported.is_empty() {
            debug!("unknown comprehension-required attributes {unsupported:?}");
            return Message::unknown_attributes(msg, &unsupported).ok();
        }
        let missing = required_in_msg
            .iter()
            .any(|&at| !msg.iter_attributes().any(|a| a.get_type() == at));
        if missing {
            debug!("message is missing required attributes");
            return Message::bad_request(msg).ok();
        }
        None
    }

    /// Generate an error response with a 420 ERROR-CODE and an
    /// UNKNOWN-ATTRIBUTES attribute listing the offending types.
    pub fn unknown_attributes(
        src: &Message,
        attributes: &[AttributeType],
    ) -> Result<Message, StunError> {
        let mut out = Message::new_error(src);
        out.add_attribute(ErrorCode::from_code(ErrorCode::UNKNOWN_ATTRIBUTE)?)?;
        if !attributes.is_empty() {
            out.add_attribute(UnknownAttributes::new(attributes))?;
        }
        Ok(out)
    }

    /// Generate an error response with a 400 ERROR-CODE.
    pub fn bad_request(src: &Message) -> Result<Message, StunError> {
        let mut out = Message::new_error(src);
        out.add_attribute(ErrorCode::from_code(ErrorCode::BAD_REQUEST)?)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() -> tracing::subscriber::DefaultGuard {
        crate::tests::test_init_log()
    }

    #[test]
    fn msg_type_roundtrip() {
        let _log = init();
        /* validate that all methods/classes survive a roundtrip */
        for m in 0..0xfff {
            for c in [
                MessageClass::Request,
                MessageClass::Indication,
                MessageClass::Success,
                MessageClass::Error,
            ] {
                let mtype = MessageType::from_class_method(c, m);
                assert_eq!(mtype.class(), c);
                assert_eq!(mtype.method(), m);
            }
        }
    }

    #[test]
    fn msg_roundtrip() {
        let _log = init();
        for m in (0x009..0x4ff).step_by(0x123) {
            for c in [
                MessageClass::Request,
                MessageClass::Indication,
                MessageClass::Success,
                MessageClass::Error,
            ] {
                let mtype = MessageType::from_class_method(c, m);
                let tid = TransactionId::generate();
                let mut msg = Message::new(mtype, tid);
                msg.add_attribute(Priority::new(100)).unwrap();
                let data = msg.to_bytes();

                let msg = Message::from_bytes(&data).unwrap();
                assert_eq!(msg.get_type(), mtype);
                assert_eq!(msg.transaction_id(), tid);
                assert_eq!(
                    msg.attribute::<Priority>(PRIORITY).unwrap().priority(),
                    100
                );
            }
        }
    }

    #[test]
    fn attribute_ordering_enforced() {
        let _log = init();
        let credentials = MessageIntegrityCredentials::ShortTerm(ShortTermCredentials {
            password: "pass".to_owned(),
        });
        let mut msg = Message::new_request(BINDING);
        msg.add_attribute(Priority::new(100)).unwrap();
        msg.add_message_integrity(&credentials, IntegrityAlgorithm::Sha1)
            .unwrap();
        // no generic attribute may follow the integrity attribute
        assert_eq!(
            msg.add_attribute(Username::new("user").unwrap()),
            Err(StunError::AlreadyExists)
        );
        // duplicate integrity is an error
        assert_eq!(
            msg.add_message_integrity(&credentials, IntegrityAlgorithm::Sha1),
            Err(StunError::AlreadyExists)
        );
        msg.add_fingerprint().unwrap();
        assert_eq!(msg.add_fingerprint(), Err(StunError::AlreadyExists));

        // on the wire, FINGERPRINT is last and integrity precedes it
        let data = msg.to_bytes();
        let parsed = Message::from_bytes(&data).unwrap();
        let types: Vec<_> = parsed.iter_attributes().map(|a| a.get_type()).collect();
        assert_eq!(types, &[PRIORITY, MESSAGE_INTEGRITY, FINGERPRINT]);
    }

    #[test]
    fn wrong_length_rejected() {
        let _log = init();
        let msg = Message::new_request(BINDING);
        let mut data = msg.to_bytes();
        data.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(Message::from_bytes(&data), Err(StunError::Malformed));
    }

    #[test]
    fn integrity_roundtrip_short_term() {
        let _log = init();
        let credentials = MessageIntegrityCredentials::ShortTerm(ShortTermCredentials {
            password: "secret".to_owned(),
        });
        for algorithm in [IntegrityAlgorithm::Sha1, IntegrityAlgorithm::Sha256] {
            let mut msg = Message::new_request(BINDING);
            msg.add_attribute(Software::new("floe").unwrap()).unwrap();
            msg.add_message_integrity(&credentials, algorithm).unwrap();
            msg.add_fingerprint().unwrap();
            let bytes = msg.to_bytes();
            let parsed = Message::from_bytes(&bytes).unwrap();
            assert!(parsed.has_integrity());
            parsed.validate_integrity(&bytes, &credentials).unwrap();
        }
    }

    #[test]
    fn tampered_username_fails_integrity() {
        let _log = init();
        let credentials = MessageIntegrityCredentials::ShortTerm(ShortTermCredentials {
            password: "VOkJxbRl1RmTxUk/WvJxBt".to_owned(),
        });
        let mut msg = Message::new_request(BINDING);
        msg.add_attribute(Username::new("evtj:h6vY").unwrap())
            .unwrap();
        msg.add_message_integrity(&credentials, IntegrityAlgorithm::Sha1)
            .unwrap();
        let mut bytes = msg.to_bytes();
        // flip one byte inside the USERNAME value
        bytes[24] ^= 0x1;
        let parsed = Message::from_bytes(&bytes).unwrap();
        assert!(parsed.has_integrity());
        assert_eq!(
            parsed.validate_integrity(&bytes, &credentials),
            Err(StunError::IntegrityCheckFailed)
        );
    }

    #[test]
    fn long_term_sha256_userhash_roundtrip() {
        let _log = init();
        // RFC 8489 sample long-term credentials (already OpaqueString
        // prepared)
        let username = "\u{30DE}\u{30C8}\u{30EA}\u{30C3}\u{30AF}\u{30B9}";
        let realm = "example.org";
        let nonce = "obMatJos2AAACf//499k954d6OL34oL9FSTvy64sA";
        let credentials = MessageIntegrityCredentials::LongTerm(LongTermCredentials {
            username: username.to_owned(),
            realm: realm.to_owned(),
            password: "TheMatrIX".to_owned(),
        });

        let mut msg = Message::new_request(BINDING);
        msg.add_attribute(Userhash::new(Userhash::hash(username, realm)))
            .unwrap();
        msg.add_attribute(Nonce::new(nonce).unwrap()).unwrap();
        msg.add_attribute(Realm::new(realm).unwrap()).unwrap();
        msg.add_message_integrity(&credentials, IntegrityAlgorithm::Sha256)
            .unwrap();

        let bytes = msg.to_bytes();
        let parsed = Message::from_bytes(&bytes).unwrap();
        assert!(parsed.has_integrity());
        parsed.validate_integrity(&bytes, &credentials).unwrap();
        assert_eq!(
            parsed.attribute::<Userhash>(USERHASH).unwrap().userhash(),
            &Userhash::hash(username, realm)
        );
        // wrong password fails
        let bad = MessageIntegrityCredentials::LongTerm(LongTermCredentials {
            username: username.to_owned(),
            realm: realm.to_owned(),
            password: "TheMatrIy".to_owned(),
        });
        assert_eq!(
            parsed.validate_integrity(&bytes, &bad),
            Err(StunError::IntegrityCheckFailed)
        );
    }

    #[test]
    fn rfc5769_vector1() {
        let _log = init();
        // https://tools.ietf.org/html/rfc5769#section-2.1
        let data = vec![
            0x00, 0x01, 0x00, 0x58, // Request type message length
            0x21, 0x12, 0xa4, 0x42, // Magic cookie
            0xb7, 0xe7, 0xa7, 0x01, // }
            0xbc, 0x34, 0xd6, 0x86, // } Transaction ID
            0xfa, 0x87, 0xdf, 0xae, // }
            0x80, 0x22, 0x00, 0x10, // SOFTWARE header
            0x53, 0x54, 0x55, 0x4e, //   }
            0x20, 0x74, 0x65, 0x73, //   }  User-agent...
            0x74, 0x20, 0x63, 0x6c, //   }  ...name
            0x69, 0x65, 0x6e, 0x74, //   }
            0x00, 0x24, 0x00, 0x04, // PRIORITY header
            0x6e, 0x00, 0x01, 0xff, //   PRIORITY value
            0x80, 0x29, 0x00, 0x08, // ICE-CONTROLLED header
            0x93, 0x2f, 0xf9, 0xb1, //   Pseudo random number
            0x51, 0x26, 0x3b, 0x36, //   ... for tie breaker
            0x00, 0x06, 0x00, 0x09, // USERNAME header
            0x65, 0x76, 0x74, 0x6a, //   Username value
            0x3a, 0x68, 0x36, 0x76, //   (9 bytes)
            0x59, 0x20, 0x20, 0x20, //   (3 bytes padding)
            0x00, 0x08, 0x00, 0x14, // MESSAGE-INTEGRITY header
            0x9a, 0xea, 0xa7, 0x0c, //   }
            0xbf, 0xd8, 0xcb, 0x56, //   }
            0x78, 0x1e, 0xf2, 0xb5, //   } HMAC-SHA1 fingerprint
            0xb2, 0xd3, 0xf2, 0x49, //   }
            0xc1, 0xb5, 0x71, 0xa2, //   }
            0x80, 0x28, 0x00, 0x04, // FINGERPRINT header
            0xe5, 0x7a, 0x3b, 0xcf, //   CRC32 fingerprint
        ];

        let msg = Message::from_bytes(&data).unwrap();
        assert!(msg.has_class(MessageClass::Request));
        assert!(msg.has_method(BINDING));
        assert_eq!(
            msg.transaction_id(),
            0xb7e7_a701_bc34_d686_fa87_dfae.into()
        );

        let software = msg.attribute::<Software>(SOFTWARE).unwrap();
        assert_eq!(software.software(), "STUN test client");

        let priority = msg.attribute::<Priority>(PRIORITY).unwrap();
        assert_eq!(priority.priority(), 0x6e0001ff);

        let ice_controlled = msg.attribute::<IceControlled>(ICE_CONTROLLED).unwrap();
        assert_eq!(ice_controlled.tie_breaker(), 0x932f_f9b1_5126_3b36);

        let username = msg.attribute::<Username>(USERNAME).unwrap();
        assert_eq!(username.username(), "evtj:h6vY");

        assert!(msg.has_integrity());
        let credentials = MessageIntegrityCredentials::ShortTerm(ShortTermCredentials {
            password: "VOkJxbRl1RmTxUk/WvJxBt".to_owned(),
        });
        msg.validate_integrity(&data, &credentials).unwrap();

        // FINGERPRINT is validated by Message::from_bytes() when present
        assert!(msg.has_attribute(FINGERPRINT));
    }

    #[test]
    fn rfc5769_vector2() {
        let _log = init();
        // https://tools.ietf.org/html/rfc5769#section-2.2
        let data = vec![
            0x01, 0x01, 0x00, 0x3c, // Response type message length
            0x21, 0x12, 0xa4, 0x42, // Magic cookie
            0xb7, 0xe7, 0xa7, 0x01, // }
            0xbc, 0x34, 0xd6, 0x86, // }  Transaction ID
            0xfa, 0x87, 0xdf, 0xae, // }
            0x80, 0x22, 0x00, 0x0b, // SOFTWARE attribute header
            0x74, 0x65, 0x73, 0x74, //   }
            0x20, 0x76, 0x65, 0x63, //   }  UTF-8 server name
            0x74, 0x6f, 0x72, 0x20, //   }
            0x00, 0x20, 0x00, 0x08, // XOR-MAPPED-ADDRESS attribute header
            0x00, 0x01, 0xa1, 0x47, //   Address family (IPv4) and xor'd mapped port number
            0xe1, 0x12, 0xa6, 0x43, //   Xor'd mapped IPv4 address
            0x00, 0x08, 0x00, 0x14, //   MESSAGE-INTEGRITY attribute header
            0x2b, 0x91, 0xf5, 0x99, // }
            0xfd, 0x9e, 0x90, 0xc3, // }
            0x8c, 0x74, 0x89, 0xf9, // }  HMAC-SHA1 fingerprint
            0x2a, 0xf9, 0xba, 0x53, // }
            0xf0, 0x6b, 0xe7, 0xd7, // }
            0x80, 0x28, 0x00, 0x04, //  FINGERPRINT attribute header
            0xc0, 0x7d, 0x4c, 0x96, //  CRC32 fingerprint
        ];

        let msg = Message::from_bytes(&data).unwrap();
        assert!(msg.has_class(MessageClass::Success));
        assert!(msg.has_method(BINDING));

        let xor_mapped = msg.attribute::<XorMappedAddress>(XOR_MAPPED_ADDRESS).unwrap();
        assert_eq!(
            xor_mapped.addr(msg.transaction_id()),
            "192.0.2.1:32853".parse().unwrap()
        );

        let credentials = MessageIntegrityCredentials::ShortTerm(ShortTermCredentials {
            password: "VOkJxbRl1RmTxUk/WvJxBt".to_owned(),
        });
        msg.validate_integrity(&data, &credentials).unwrap();
    }

    #[test]
    fn rfc5769_vector3() {
        let _log = init();
        // https://tools.ietf.org/html/rfc5769#section-2.3
        let data = vec![
            0x01, 0x01, 0x00, 0x48, // Response type and message length
            0x21, 0x12, 0xa4, 0x42, // Magic cookie
            0xb7, 0xe7, 0xa7, 0x01, // }
            0xbc, 0x34, 0xd6, 0x86, // }  Transaction ID
            0xfa, 0x87, 0xdf, 0xae, // }
            0x80, 0x22, 0x00, 0x0b, //    SOFTWARE attribute header
            0x74, 0x65, 0x73, 0x74, // }
            0x20, 0x76, 0x65, 0x63, // }  UTF-8 server name
            0x74, 0x6f, 0x72, 0x20, // }
            0x00, 0x20, 0x00, 0x14, //    XOR-MAPPED-ADDRESS attribute header
            0x00, 0x02, 0xa1, 0x47, //    Address family (IPv6) and xor'd mapped port number
            0x01, 0x13, 0xa9, 0xfa, // }
            0xa5, 0xd3, 0xf1, 0x79, // }  Xor'd mapped IPv6 address
            0xbc, 0x25, 0xf4, 0xb5, // }
            0xbe, 0xd2, 0xb9, 0xd9, // }
            0x00, 0x08, 0x00, 0x14, //    MESSAGE-INTEGRITY attribute header
            0xa3, 0x82, 0x95, 0x4e, // }
            0x4b, 0xe6, 0x7b, 0xf1, // }
            0x17, 0x84, 0xc9, 0x7c, // }  HMAC-SHA1 fingerprint
            0x82, 0x92, 0xc2, 0x75, // }
            0xbf, 0xe3, 0xed, 0x41, // }
            0x80, 0x28, 0x00, 0x04, //    FINGERPRINT attribute header
            0xc8, 0xfb, 0x0b, 0x4c, //    CRC32 fingerprint
        ];

        let msg = Message::from_bytes(&data).unwrap();
        assert!(msg.has_class(MessageClass::Success));
        assert!(msg.has_method(BINDING));

        let xor_mapped = msg.attribute::<XorMappedAddress>(XOR_MAPPED_ADDRESS).unwrap();
        assert_eq!(
            xor_mapped.addr(msg.transaction_id()),
            "[2001:db8:1234:5678:11:2233:4455:6677]:32853"
                .parse()
                .unwrap()
        );

        let credentials = MessageIntegrityCredentials::ShortTerm(ShortTermCredentials {
            password: "VOkJxbRl1RmTxUk/WvJxBt".to_owned(),
        });
        msg.validate_integrity(&data, &credentials).unwrap();
    }

    #[test]
    fn corrupted_fingerprint_rejected() {
        let _log = init();
        let mut msg = Message::new_request(BINDING);
        msg.add_attribute(Software::new("floe").unwrap()).unwrap();
        msg.add_fingerprint().unwrap();
        let mut data = msg.to_bytes();
        let len = data.len();
        data[len - 1] ^= 0x1;
        assert_eq!(Message::from_bytes(&data), Err(StunError::BadFingerprint));
    }

    #[test]
    fn attribute_after_fingerprint_rejected() {
        let _log = init();
        let mut msg = Message::new_request(BINDING);
        msg.add_fingerprint().unwrap();
        let mut data = msg.to_bytes();
        // append a SOFTWARE attribute after the FINGERPRINT
        let trailing = RawAttribute::new(SOFTWARE, b"oops").to_bytes();
        data.extend(&trailing);
        let len = (data.len() - 20) as u16;
        BigEndian::write_u16(&mut data[2..4], len);
        assert_eq!(Message::from_bytes(&data), Err(StunError::Malformed));
    }

    #[test]
    fn check_attribute_types() {
        let _log = init();
        let mut msg = Message::new_request(BINDING);
        msg.add_attribute(Username::new("user").unwrap()).unwrap();
        msg.add_attribute(Priority::new(123)).unwrap();

        assert!(Message::check_attribute_types(&msg, &[USERNAME, PRIORITY], &[USERNAME]).is_none());

        // username required but not advertised as supported
        let resp = Message::check_attribute_types(&msg, &[PRIORITY], &[]).unwrap();
        assert!(resp.has_class(MessageClass::Error));
        let err = resp.attribute::<ErrorCode>(ERROR_CODE).unwrap();
        assert_eq!(err.code(), 420);
        let unknown = resp
            .attribute::<UnknownAttributes>(UNKNOWN_ATTRIBUTES)
            .unwrap();
        assert!(unknown.has_attribute(USERNAME));

        // missing required attribute
        let resp =
            Message::check_attribute_types(&msg, &[USERNAME, PRIORITY], &[FINGERPRINT]).unwrap();
        let err = resp.attribute::<ErrorCode>(ERROR_CODE).unwrap();
        assert_eq!(err.code(), 400);
    }
}
