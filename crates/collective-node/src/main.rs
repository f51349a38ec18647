//! Collective Node -- single binary collective-authority node.
//!
//! Usage:
//!   collective-node                        # Run with default config
//!   collective-node --config path.toml     # Run with custom config
//!   collective-node identity key           # Show (or generate) the device key
//!   collective-node identity create 2      # Create an identity, majority 2
//!   collective-node identity attach <id>   # Propose this device to an identity
//!   collective-node identity update        # Fetch accepted and proposed config
//!   collective-node identity vote          # Accept the pending proposal

use collective_node::config::NodeConfig;
use collective_node::{build_catalog, expand_tilde, load_identity, save_identity, CollectiveNode};

use clap::{Parser, Subcommand};
use std::sync::Arc;

use collective_crypto::KeyPair;
use collective_identity::Identity;
use collective_network::TcpClient;
use collective_protocol::{IdentityId, ServerIdentity};

#[derive(Parser)]
#[command(name = "collective-node", about = "Collective authority node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.collective/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Manage this device's identity
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Show the device key, generating it if missing
    Key,
    /// Create a new identity owned by this device
    Create {
        /// Votes needed to accept a config change
        majority: u32,
    },
    /// Propose adding this device to an existing identity
    Attach {
        /// Identity id (hex)
        id: String,
    },
    /// Refresh the accepted config and any pending proposal
    Update,
    /// Vote on the pending proposal
    Vote {
        /// Reject instead of accept
        #[arg(long)]
        reject: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collective_node=info,collective_network=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Run) | None => run_node(cfg).await?,
        Some(Commands::Identity { action }) => identity_command(cfg, action).await?,
    }

    Ok(())
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    let key_path = expand_tilde(&cfg.node.identity_key);
    let keypair = KeyPair::load_or_create(&key_path)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        public_key = %keypair.public_key(),
        listen = %cfg.network.listen_addr,
        "starting collective-node"
    );

    let node = CollectiveNode::build(&cfg, keypair.public_key())?;
    let listener = tokio::net::TcpListener::bind(&cfg.network.listen_addr).await?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = signal_tx.send(());
        }
    });

    node.run(listener, shutdown_tx).await
}

async fn identity_command(cfg: NodeConfig, action: IdentityAction) -> anyhow::Result<()> {
    let key_path = expand_tilde(&cfg.node.identity_key);
    let keypair = KeyPair::load_or_create(&key_path)?;

    let catalog = build_catalog()?;
    let client = Arc::new(TcpClient::new(
        ServerIdentity::new(cfg.local_address(), keypair.public_key()),
        cfg.request_timeout(),
    ));
    let roster = cfg.roster()?;
    let identity_file = expand_tilde(&cfg.node.identity_file);

    let identity = match action {
        IdentityAction::Key => {
            println!("Public key: {}", keypair.public_key());
            println!("Key file: {}", key_path.display());
            return Ok(());
        }
        IdentityAction::Create { majority } => {
            let mut identity =
                Identity::with_key(client, roster, majority, cfg.node.account.clone(), keypair);
            identity.create_identity().await?;
            identity
        }
        IdentityAction::Attach { id } => {
            let id = IdentityId(hex::decode(&id)?);
            let mut identity =
                Identity::with_key(client, roster, 1, cfg.node.account.clone(), keypair);
            identity.attach_to_identity(id).await?;
            identity
        }
        IdentityAction::Update => {
            let mut identity = load_identity(&catalog, &identity_file, client)?;
            identity.config_update().await?;
            identity.propose_fetch().await?;
            identity
        }
        IdentityAction::Vote { reject } => {
            let mut identity = load_identity(&catalog, &identity_file, client)?;
            if identity.propose_vote(!reject).await? {
                println!("Proposal accepted");
            }
            identity
        }
    };

    if let Some(id) = identity.id() {
        println!("Identity: {id}");
    }
    println!("State: {:?}", identity.state());
    println!("Devices: {:?}", identity.config().devices.keys().collect::<Vec<_>>());
    if let Some(proposed) = identity.proposed() {
        println!("Proposed: {:?}", proposed.devices.keys().collect::<Vec<_>>());
    }

    save_identity(&identity, &catalog, &identity_file)
}
