//! Tree broadcast.
//!
//! The root announces a payload to its children; every node hands the
//! payload to the local application and forwards it to its own children.
//! Leaves acknowledge straight away, inner nodes once all children have, so
//! acks aggregate up the tree. The root reports how many nodes acknowledged.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use collective_protocol::{Message, Packet};
use tokio::sync::{mpsc, oneshot};

use crate::messages::{Announce, AnnounceAck};
use crate::{
    InstanceId, Node, ProtocolHost, ProtocolInstance, ProtocolRegistry, RegistryError, Tree,
};

pub const BROADCAST: &str = "Broadcast";

type Pending = HashMap<InstanceId, (Vec<u8>, oneshot::Sender<u32>)>;

/// A payload delivered on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from_root: String,
    pub payload: Vec<u8>,
}

/// Shared state behind the "Broadcast" constructor: payloads waiting for the
/// root instance they were started under, and the channel local deliveries
/// go to.
pub struct Broadcaster {
    pending: Mutex<Pending>,
    delivered: mpsc::UnboundedSender<Delivery>,
}

impl Broadcaster {
    /// Register the protocol with `registry`. The receiver yields every
    /// payload this node sees, its own broadcasts included.
    pub fn install(registry: &ProtocolRegistry) -> (Arc<Self>, mpsc::UnboundedReceiver<Delivery>) {
        let (delivered, rx) = mpsc::unbounded_channel();
        let this = Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            delivered,
        });
        let shared = this.clone();
        registry.register(BROADCAST, move |node, tree| {
            Ok(Box::new(shared.build(node, tree)) as Box<dyn ProtocolInstance>)
        });
        (this, rx)
    }

    /// Broadcast `payload` over `tree` from `host`, which must be the tree's
    /// root. The receiver resolves with the number of nodes that
    /// acknowledged.
    pub fn broadcast(
        &self,
        host: &ProtocolHost,
        tree: Tree,
        payload: Vec<u8>,
    ) -> Result<oneshot::Receiver<u32>, RegistryError> {
        let id = InstanceId::random();
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, (payload, tx));
        if let Err(e) = host.start_instance(id, BROADCAST, tree) {
            self.lock_pending().remove(&id);
            return Err(e);
        }
        Ok(rx)
    }

    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn build(&self, node: Node, tree: Tree) -> BroadcastProtocol {
        let is_root = tree.is_root(&node.server().address);
        // A root started without `broadcast` sends an empty payload.
        let (payload, done) = if is_root {
            match self.lock_pending().remove(&node.instance()) {
                Some((payload, done)) => (Some(payload), Some(done)),
                None => (Some(Vec::new()), None),
            }
        } else {
            (None, None)
        };
        let pending = tree
            .children_of(&node.server().address)
            .into_iter()
            .map(|c| c.address.clone())
            .collect();
        BroadcastProtocol {
            node,
            tree,
            is_root,
            payload,
            pending,
            count: 1,
            acked_parent: false,
            done,
            delivered: self.delivered.clone(),
        }
    }
}

pub struct BroadcastProtocol {
    node: Node,
    tree: Tree,
    is_root: bool,
    payload: Option<Vec<u8>>,
    /// Children that have not acknowledged yet.
    pending: HashSet<String>,
    /// Nodes acknowledged in this subtree, self included.
    count: u32,
    acked_parent: bool,
    done: Option<oneshot::Sender<u32>>,
    delivered: mpsc::UnboundedSender<Delivery>,
}

impl BroadcastProtocol {
    fn deliver_and_forward(&mut self, payload: Vec<u8>) -> Result<(), RegistryError> {
        let _ = self.delivered.send(Delivery {
            from_root: self.tree.root_identity().address.clone(),
            payload: payload.clone(),
        });
        let announce = Announce { payload };
        for child in self.tree.children_of(&self.node.server().address) {
            self.node.send(&self.tree, child, &announce)?;
        }
        self.payload = Some(announce.payload);
        self.maybe_finish()
    }

    fn maybe_finish(&mut self) -> Result<(), RegistryError> {
        if !self.pending.is_empty() || self.payload.is_none() {
            return Ok(());
        }
        if self.is_root {
            if let Some(done) = self.done.take() {
                let _ = done.send(self.count);
            }
            tracing::info!(
                instance = %self.node.instance(),
                nodes = self.count,
                "broadcast: complete"
            );
        } else if !self.acked_parent {
            let me = &self.node.server().address;
            let parent = self
                .tree
                .parent_of(me)
                .ok_or_else(|| RegistryError::NotInTree {
                    address: me.clone(),
                    tree: self.tree.id,
                })?
                .clone();
            self.node.send(&self.tree, &parent, &AnnounceAck { count: self.count })?;
            self.acked_parent = true;
        }
        Ok(())
    }
}

impl ProtocolInstance for BroadcastProtocol {
    fn start(&mut self) -> Result<(), RegistryError> {
        let payload = self.payload.take().unwrap_or_default();
        self.deliver_and_forward(payload)
    }

    fn dispatch(&mut self, packet: &Packet) -> Result<(), RegistryError> {
        if packet.is::<Announce>() {
            if self.payload.is_some() {
                tracing::debug!(sender = %packet.sender, "broadcast: duplicate announce ignored");
                return Ok(());
            }
            let announce: Announce = packet.decode()?;
            return self.deliver_and_forward(announce.payload);
        }

        let ack: AnnounceAck = packet.decode()?;
        if self.pending.remove(&packet.sender.address) {
            self.count += ack.count;
            self.maybe_finish()
        } else {
            tracing::debug!(
                sender = %packet.sender,
                msg = AnnounceAck::NAME,
                "broadcast: ack from non-child ignored"
            );
            Ok(())
        }
    }

    fn is_done(&self) -> bool {
        self.payload.is_some() && self.pending.is_empty() && (self.is_root || self.acked_parent)
    }
}
