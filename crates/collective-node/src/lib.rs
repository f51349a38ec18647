//! Collective Node library -- wiring shared by the binary and its tests.
//!
//! A node owns one message catalog, one protocol registry and one
//! dispatcher. Inbound TCP packets go through the dispatcher; tree protocol
//! messages land in the [`ProtocolHost`], which talks back out through the
//! transport's outbound queue.

pub mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use collective_crypto::{write_private, PublicKey};
use collective_identity::Identity;
use collective_network::{
    build_dispatcher, Dispatcher, OutboundMessage, RequestClient, TcpClient, TcpTransport,
};
use collective_protocol::{MessageCatalog, ServerIdentity};
use collective_tree::{Broadcaster, Delivery, ProtocolHost, ProtocolRegistry, Tree};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};

use config::NodeConfig;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Catalog holding every message this node can send or receive.
pub fn build_catalog() -> anyhow::Result<Arc<MessageCatalog>> {
    let catalog = MessageCatalog::new();
    collective_identity::register_messages(&catalog)?;
    collective_tree::register_messages(&catalog)?;
    Ok(Arc::new(catalog))
}

/// Persist `identity`, private key included, readable by the owner only.
pub fn save_identity<C: RequestClient>(
    identity: &Identity<C>,
    catalog: &MessageCatalog,
    path: &Path,
) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    identity.save_to_stream(&mut buf, catalog)?;
    write_private(path, &buf)?;
    tracing::info!(path = %path.display(), "identity saved");
    Ok(())
}

/// Restore an identity written by [`save_identity`].
pub fn load_identity<C: RequestClient>(
    catalog: &MessageCatalog,
    path: &Path,
    client: Arc<C>,
) -> anyhow::Result<Identity<C>> {
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("no identity at {}: {e}", path.display()))?;
    Ok(Identity::from_stream(file, catalog, client)?)
}

/// Everything a running node is made of.
pub struct CollectiveNode {
    pub local: ServerIdentity,
    pub catalog: Arc<MessageCatalog>,
    pub registry: Arc<ProtocolRegistry>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub host: Arc<ProtocolHost>,
    pub broadcaster: Arc<Broadcaster>,
    branching: usize,
    transport: Arc<TcpTransport>,
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
}

impl CollectiveNode {
    /// Build the node's components. Must run inside a tokio runtime when the
    /// routine dispatcher is configured.
    pub fn build(cfg: &NodeConfig, public_key: PublicKey) -> anyhow::Result<Self> {
        let local = ServerIdentity::new(cfg.local_address(), public_key);
        let catalog = build_catalog()?;
        let registry = Arc::new(ProtocolRegistry::new());
        let (broadcaster, deliveries) = Broadcaster::install(&registry);

        let dispatcher = build_dispatcher(cfg.network.dispatcher)?;
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let host = Arc::new(ProtocolHost::new(local.clone(), registry.clone(), outbound_tx));
        host.attach(dispatcher.as_ref());

        let transport = Arc::new(TcpTransport::new(
            local.clone(),
            dispatcher.clone(),
            catalog.clone(),
        ));

        tracing::info!(
            address = %local,
            dispatcher = ?cfg.network.dispatcher,
            protocols = ?registry.names(),
            messages = catalog.len(),
            "node assembled"
        );

        Ok(Self {
            local,
            catalog,
            registry,
            dispatcher,
            host,
            broadcaster,
            branching: cfg.network.branching_factor,
            transport,
            outbound,
            deliveries,
        })
    }

    /// Request/reply client sending as this node.
    pub fn client(&self, cfg: &NodeConfig) -> TcpClient {
        TcpClient::new(self.local.clone(), cfg.request_timeout())
    }

    /// Broadcast `payload` over a fresh tree rooted here. Fails unless
    /// `roster` lists this node first.
    pub fn broadcast(
        &self,
        roster: &collective_protocol::Roster,
        payload: Vec<u8>,
    ) -> anyhow::Result<oneshot::Receiver<u32>> {
        let tree = Tree::nary(roster, self.branching)
            .ok_or_else(|| anyhow::anyhow!("cannot broadcast over an empty roster"))?;
        Ok(self.broadcaster.broadcast(&self.host, tree, payload)?)
    }

    /// Serve until `shutdown` fires. Payloads delivered by broadcasts are
    /// logged.
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown: broadcast::Sender<()>,
    ) -> anyhow::Result<()> {
        let CollectiveNode {
            local,
            transport,
            outbound,
            mut deliveries,
            ..
        } = self;

        let outbound_handle = tokio::spawn(transport.clone().run_outbound(outbound));

        let mut stop = shutdown.subscribe();
        let delivery_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    delivery = deliveries.recv() => match delivery {
                        Some(d) => tracing::info!(
                            root = %d.from_root,
                            bytes = d.payload.len(),
                            "broadcast delivered"
                        ),
                        None => break,
                    },
                    _ = stop.recv() => break,
                }
            }
        });

        let result = transport.serve(listener, shutdown.subscribe()).await;
        outbound_handle.abort();
        let _ = delivery_handle.await;
        tracing::info!(address = %local, "node stopped");
        result?;
        Ok(())
    }
}
