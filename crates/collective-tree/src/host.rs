//! Runs protocol instances on one node.
//!
//! The host is the [`Processor`] for `ProtocolMessage`. Instances are created
//! on demand from the registry the first time a message for them arrives and
//! dropped once they report `is_done()`. The root of a tree only runs the
//! instances it started itself.

use collective_network::{Dispatcher, OutboundMessage, Processor};
use collective_protocol::{Message, Packet, ServerIdentity};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::messages::ProtocolMessage;
use crate::{InstanceId, Node, ProtocolInstance, ProtocolRegistry, RegistryError, Tree};

pub struct ProtocolHost {
    local: ServerIdentity,
    registry: Arc<ProtocolRegistry>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    instances: Mutex<HashMap<InstanceId, Box<dyn ProtocolInstance>>>,
}

impl ProtocolHost {
    pub fn new(
        local: ServerIdentity,
        registry: Arc<ProtocolRegistry>,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Self {
        Self {
            local,
            registry,
            outbound,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Route every `ProtocolMessage` arriving at `dispatcher` to this host.
    pub fn attach(self: &Arc<Self>, dispatcher: &dyn Dispatcher) {
        dispatcher.register_processor(self.clone(), &[ProtocolMessage::packet_type()]);
    }

    /// Create an instance of `name` rooted at this node and start it.
    pub fn start(&self, name: &str, tree: Tree) -> Result<InstanceId, RegistryError> {
        let id = InstanceId::random();
        self.start_instance(id, name, tree)?;
        Ok(id)
    }

    /// Like [`ProtocolHost::start`], under a caller-chosen instance id.
    pub fn start_instance(
        &self,
        id: InstanceId,
        name: &str,
        tree: Tree,
    ) -> Result<(), RegistryError> {
        if !tree.contains(&self.local.address) {
            return Err(RegistryError::NotInTree {
                address: self.local.address.clone(),
                tree: tree.id,
            });
        }
        if !tree.is_root(&self.local.address) {
            return Err(RegistryError::NotRoot {
                address: self.local.address.clone(),
                tree: tree.id,
            });
        }
        let mut instance = self.registry.instantiate(name, self.node(id, name), tree)?;
        // Held across start so replies cannot reach a missing instance.
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        instance.start()?;
        tracing::info!(protocol = name, instance = %id, "host: protocol started");
        if !instance.is_done() {
            instances.insert(id, instance);
        }
        Ok(())
    }

    /// Number of instances still running here.
    pub fn running(&self) -> usize {
        self.instances.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn node(&self, id: InstanceId, name: &str) -> Node {
        Node::new(self.local.clone(), id, name, self.outbound.clone())
    }

    fn handle(&self, packet: Packet) -> Result<(), RegistryError> {
        let msg: ProtocolMessage = packet.decode()?;
        let id = msg.instance;
        let inner = Packet::new(packet.sender, msg.inner);

        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        let instance = match instances.entry(id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                if !msg.tree.contains(&self.local.address) {
                    return Err(RegistryError::NotInTree {
                        address: self.local.address.clone(),
                        tree: msg.tree.id,
                    });
                }
                // Root instances exist only through start.
                if msg.tree.is_root(&self.local.address) {
                    return Err(RegistryError::UnknownInstance(id));
                }
                let node = self.node(id, &msg.protocol);
                let instance = self.registry.instantiate(&msg.protocol, node, msg.tree)?;
                tracing::debug!(protocol = %msg.protocol, instance = %id, "host: joined protocol");
                e.insert(instance)
            }
        };

        instance.dispatch(&inner)?;
        if instance.is_done() {
            instances.remove(&id);
            tracing::debug!(protocol = %msg.protocol, instance = %id, "host: protocol finished");
        }
        Ok(())
    }
}

impl Processor for ProtocolHost {
    fn process(&self, packet: Packet) {
        let sender = packet.sender.address.clone();
        if let Err(e) = self.handle(packet) {
            tracing::warn!(sender = %sender, error = %e, "host: protocol message rejected");
        }
    }
}
