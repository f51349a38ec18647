//! Message catalog -- which payload shapes this process understands.
//!
//! One catalog is built at startup and shared by reference. Each crate that
//! defines wire types exposes a `register_messages(&MessageCatalog)`.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::{Envelope, Message, PacketTypeId, ProtocolError};

#[derive(Default)]
pub struct MessageCatalog {
    types: RwLock<HashMap<PacketTypeId, &'static str>>,
}

impl MessageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T`. Registering the same type twice is a no-op; a different
    /// name hashing to the same id is rejected.
    pub fn register<T: Message>(&self) -> Result<(), ProtocolError> {
        let id = T::packet_type();
        let mut types = self.types.write().unwrap_or_else(|e| e.into_inner());
        match types.get(&id).copied() {
            Some(existing) if existing != T::NAME => Err(ProtocolError::DuplicateType {
                id,
                existing,
                name: T::NAME,
            }),
            Some(_) => Ok(()),
            None => {
                types.insert(id, T::NAME);
                tracing::trace!(%id, name = T::NAME, "catalog: registered message type");
                Ok(())
            }
        }
    }

    pub fn is_registered(&self, id: PacketTypeId) -> bool {
        self.types
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
    }

    pub fn name_of(&self, id: PacketTypeId) -> Option<&'static str> {
        self.types
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.types.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode `msg` as self-describing envelope bytes.
    pub fn encode<T: Message>(&self, msg: &T) -> Result<Vec<u8>, ProtocolError> {
        if !self.is_registered(T::packet_type()) {
            return Err(ProtocolError::UnknownMessageType(T::packet_type()));
        }
        Ok(serde_json::to_vec(&Envelope::new(msg)?)?)
    }

    /// Parse envelope bytes, rejecting tags this catalog does not know.
    pub fn decode_envelope(&self, bytes: &[u8]) -> Result<Envelope, ProtocolError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        if !self.is_registered(envelope.msg_type) {
            return Err(ProtocolError::UnknownMessageType(envelope.msg_type));
        }
        Ok(envelope)
    }

    pub fn decode<T: Message>(&self, bytes: &[u8]) -> Result<T, ProtocolError> {
        self.decode_envelope(bytes)?.decode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ProposeFetch, ServiceError};
    use crate::IdentityId;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Probe;

    // Claims ServiceError's id under a different name.
    #[derive(Debug, Serialize, Deserialize)]
    struct Impostor;

    crate::message_types!(Probe => "test.Probe");

    impl Message for Impostor {
        const NAME: &'static str = "test.Impostor";
        fn packet_type() -> PacketTypeId {
            ServiceError::packet_type()
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let catalog = MessageCatalog::new();
        catalog.register::<Probe>().unwrap();
        catalog.register::<Probe>().unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.name_of(Probe::packet_type()), Some("test.Probe"));
    }

    #[test]
    fn test_id_collision_rejected() {
        let catalog = MessageCatalog::new();
        catalog.register::<ServiceError>().unwrap();
        assert!(matches!(
            catalog.register::<Impostor>(),
            Err(ProtocolError::DuplicateType { .. })
        ));
    }

    #[test]
    fn test_encode_requires_registration() {
        let catalog = MessageCatalog::new();
        let msg = ServiceError {
            message: "nope".into(),
        };
        assert!(matches!(
            catalog.encode(&msg),
            Err(ProtocolError::UnknownMessageType(_))
        ));

        catalog.register::<ServiceError>().unwrap();
        let bytes = catalog.encode(&msg).unwrap();
        let back: ServiceError = catalog.decode(&bytes).unwrap();
        assert_eq!(back.message, "nope");
    }

    #[test]
    fn test_decode_unknown_tag() {
        let writer = MessageCatalog::new();
        writer.register::<ProposeFetch>().unwrap();
        let bytes = writer
            .encode(&ProposeFetch {
                id: IdentityId(vec![9]),
                config: None,
            })
            .unwrap();

        let reader = MessageCatalog::new();
        reader.register::<ServiceError>().unwrap();
        assert!(matches!(
            reader.decode::<ProposeFetch>(&bytes),
            Err(ProtocolError::UnknownMessageType(id)) if id == ProposeFetch::packet_type()
        ));
    }

    #[test]
    fn test_decode_wrong_shape() {
        let catalog = MessageCatalog::new();
        catalog.register::<ProposeFetch>().unwrap();
        catalog.register::<ServiceError>().unwrap();
        let bytes = catalog
            .encode(&ServiceError {
                message: "x".into(),
            })
            .unwrap();
        assert!(matches!(
            catalog.decode::<ProposeFetch>(&bytes),
            Err(ProtocolError::TypeMismatch { .. })
        ));
    }
}
