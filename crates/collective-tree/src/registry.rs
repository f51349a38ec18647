//! Protocol registry: protocol name -> constructor.
//!
//! The registry only builds instances; it keeps no protocol state. Running
//! instances are owned by whoever asked for them (normally the
//! [`ProtocolHost`](crate::ProtocolHost)).

use collective_protocol::Packet;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::{Node, RegistryError, Tree};

/// A running tree protocol on one node.
pub trait ProtocolInstance: Send {
    /// Called once on the node that initiates the protocol.
    fn start(&mut self) -> Result<(), RegistryError> {
        Ok(())
    }

    /// Handle one message addressed to this instance.
    fn dispatch(&mut self, packet: &Packet) -> Result<(), RegistryError>;

    /// Whether this node's part of the protocol is over.
    fn is_done(&self) -> bool {
        false
    }
}

pub type Constructor =
    Arc<dyn Fn(Node, Tree) -> Result<Box<dyn ProtocolInstance>, RegistryError> + Send + Sync>;

#[derive(Default)]
pub struct ProtocolRegistry {
    constructors: RwLock<HashMap<String, Constructor>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `constructor` under `name`. A later registration under the same
    /// name replaces the earlier one.
    pub fn register<F>(&self, name: impl Into<String>, constructor: F)
    where
        F: Fn(Node, Tree) -> Result<Box<dyn ProtocolInstance>, RegistryError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        let mut constructors = self.constructors.write().unwrap_or_else(|e| e.into_inner());
        if constructors.insert(name.clone(), Arc::new(constructor)).is_some() {
            tracing::debug!(protocol = %name, "registry: constructor replaced");
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.constructors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Build a fresh instance of `name` for `node` on `tree`.
    pub fn instantiate(
        &self,
        name: &str,
        node: Node,
        tree: Tree,
    ) -> Result<Box<dyn ProtocolInstance>, RegistryError> {
        // Clone the constructor out so it runs without the lock held.
        let constructor = self
            .constructors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownProtocol(name.to_string()))?;
        constructor(node, tree)
    }

    /// Registered protocol names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .constructors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
