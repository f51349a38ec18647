//! Collective Protocol -- packet envelopes, message catalog, wire codec.
//!
//! Every payload on the wire is an [`Envelope`]: a [`PacketTypeId`] tag plus a
//! JSON body. Turning an envelope back into a concrete message is an explicit,
//! checked step ([`Envelope::decode`]), never a blind cast.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub mod catalog;
pub mod codec;
pub mod messages;
pub mod roster;

pub use catalog::MessageCatalog;
pub use codec::PacketCodec;
pub use messages::*;
pub use roster::{Roster, ServerIdentity};

/// Maximum encoded packet size: 16 MB.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message type {0} is not registered")]
    UnknownMessageType(PacketTypeId),
    #[error("type id {id} already registered as {existing}, cannot register {name}")]
    DuplicateType {
        id: PacketTypeId,
        existing: &'static str,
        name: &'static str,
    },
    #[error("expected {expected} ({expected_id}), got {got}")]
    TypeMismatch {
        expected: &'static str,
        expected_id: PacketTypeId,
        got: PacketTypeId,
    },
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable identifier of a payload shape: the first 8 bytes of SHA-256 over
/// the message name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PacketTypeId(pub u64);

impl PacketTypeId {
    pub fn of_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        Self(u64::from_be_bytes(head))
    }
}

impl fmt::Display for PacketTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for PacketTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketTypeId({:016x})", self.0)
    }
}

/// A payload shape that can travel inside an [`Envelope`].
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Canonical name; the type id is derived from it.
    const NAME: &'static str;

    fn packet_type() -> PacketTypeId {
        PacketTypeId::of_name(Self::NAME)
    }
}

/// Implement [`Message`] for a list of types with their canonical names.
#[macro_export]
macro_rules! message_types {
    ($($ty:ty => $name:literal),+ $(,)?) => {
        $(
            impl $crate::Message for $ty {
                const NAME: &'static str = $name;
            }
        )+
    };
}

/// Tagged payload: type id plus JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_type: PacketTypeId,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Message>(msg: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: T::packet_type(),
            payload: serde_json::to_value(msg)?,
        })
    }

    pub fn is<T: Message>(&self) -> bool {
        self.msg_type == T::packet_type()
    }

    /// Checked cast to `T`: the tag must match before the body is parsed.
    pub fn decode<T: Message>(&self) -> Result<T, ProtocolError> {
        decode_payload(self.msg_type, &self.payload)
    }
}

/// A received message together with the identity of its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub sender: ServerIdentity,
    pub msg_type: PacketTypeId,
    pub payload: serde_json::Value,
}

impl Packet {
    pub fn new(sender: ServerIdentity, envelope: Envelope) -> Self {
        Self {
            sender,
            msg_type: envelope.msg_type,
            payload: envelope.payload,
        }
    }

    pub fn from_message<T: Message>(
        sender: ServerIdentity,
        msg: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(sender, Envelope::new(msg)?))
    }

    pub fn is<T: Message>(&self) -> bool {
        self.msg_type == T::packet_type()
    }

    pub fn decode<T: Message>(&self) -> Result<T, ProtocolError> {
        decode_payload(self.msg_type, &self.payload)
    }

    pub fn into_envelope(self) -> Envelope {
        Envelope {
            msg_type: self.msg_type,
            payload: self.payload,
        }
    }
}

fn decode_payload<T: Message>(
    msg_type: PacketTypeId,
    payload: &serde_json::Value,
) -> Result<T, ProtocolError> {
    if msg_type != T::packet_type() {
        return Err(ProtocolError::TypeMismatch {
            expected: T::NAME,
            expected_id: T::packet_type(),
            got: msg_type,
        });
    }
    Ok(T::deserialize(payload)?)
}
