//! Collective Tree -- protocol registry and tree-structured protocols.
//!
//! A protocol is a named constructor `(Node, Tree) -> ProtocolInstance`
//! registered with a [`ProtocolRegistry`]. The [`ProtocolHost`] turns
//! incoming `ProtocolMessage` packets into running instances on demand;
//! instances talk to their tree neighbours through their [`Node`] handle.

use collective_protocol::ProtocolError;

pub mod broadcast;
pub mod host;
pub mod messages;
pub mod node;
pub mod registry;
pub mod tree;

pub use broadcast::{BroadcastProtocol, Broadcaster, Delivery, BROADCAST};
pub use host::ProtocolHost;
pub use messages::register_messages;
pub use node::{InstanceId, Node};
pub use registry::{Constructor, ProtocolInstance, ProtocolRegistry};
pub use tree::{Tree, TreeId, TreeNode};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("protocol {0:?} is not registered")]
    UnknownProtocol(String),
    #[error("{address} is not part of tree {tree}")]
    NotInTree { address: String, tree: TreeId },
    #[error("{address} is not the root of tree {tree}")]
    NotRoot { address: String, tree: TreeId },
    #[error("no running root instance {0}")]
    UnknownInstance(InstanceId),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("outbound queue closed")]
    Outbound,
}
