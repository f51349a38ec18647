//! Wire messages for tree protocols.

use collective_crypto::base64_bytes;
use collective_protocol::{Envelope, MessageCatalog, ProtocolError};
use serde::{Deserialize, Serialize};

use crate::{InstanceId, Tree};

/// Carrier for every tree-protocol message. The receiving host uses
/// `instance` to find (or create) the local instance and hands it `inner`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub instance: InstanceId,
    pub protocol: String,
    pub tree: Tree,
    pub inner: Envelope,
}

/// Broadcast payload travelling down the tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announce {
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// Sent up the tree once a whole subtree holds the payload. `count` is the
/// number of nodes in the sender's subtree, sender included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceAck {
    pub count: u32,
}

collective_protocol::message_types! {
    ProtocolMessage => "tree.ProtocolMessage",
    Announce => "tree.Announce",
    AnnounceAck => "tree.AnnounceAck",
}

pub fn register_messages(catalog: &MessageCatalog) -> Result<(), ProtocolError> {
    catalog.register::<ProtocolMessage>()?;
    catalog.register::<Announce>()?;
    catalog.register::<AnnounceAck>()?;
    Ok(())
}
