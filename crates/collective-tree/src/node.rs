//! Per-instance execution handle passed to protocol constructors.

use collective_network::OutboundMessage;
use collective_protocol::{Envelope, Message, ServerIdentity};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use crate::messages::ProtocolMessage;
use crate::{RegistryError, Tree};

/// Identifies one run of a protocol. Shared by every node taking part.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl InstanceId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({:016x})", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    server: ServerIdentity,
    instance: InstanceId,
    protocol: String,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
}

impl Node {
    pub fn new(
        server: ServerIdentity,
        instance: InstanceId,
        protocol: impl Into<String>,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Self {
        Self {
            server,
            instance,
            protocol: protocol.into(),
            outbound,
        }
    }

    /// This node's own identity.
    pub fn server(&self) -> &ServerIdentity {
        &self.server
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Queue `msg` for `to`, addressed to this instance on the remote side.
    /// `to` must be part of `tree`.
    pub fn send<T: Message>(
        &self,
        tree: &Tree,
        to: &ServerIdentity,
        msg: &T,
    ) -> Result<(), RegistryError> {
        if !tree.contains(&to.address) {
            return Err(RegistryError::NotInTree {
                address: to.address.clone(),
                tree: tree.id,
            });
        }
        let wrapped = ProtocolMessage {
            instance: self.instance,
            protocol: self.protocol.clone(),
            tree: tree.clone(),
            inner: Envelope::new(msg)?,
        };
        self.outbound
            .send(OutboundMessage {
                to: to.clone(),
                envelope: Envelope::new(&wrapped)?,
            })
            .map_err(|_| RegistryError::Outbound)?;
        tracing::trace!(
            instance = %self.instance,
            protocol = %self.protocol,
            to = %to,
            msg = T::NAME,
            "node: message queued"
        );
        Ok(())
    }
}
