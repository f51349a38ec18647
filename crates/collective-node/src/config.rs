//! Configuration types for collective-node.
//! Parsed from ~/.collective/config.toml.

use collective_crypto::{CryptoError, PublicKey};
use collective_network::DispatcherKind;
use collective_protocol::{Roster, ServerIdentity};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub roster: RosterSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_identity_key")]
    pub identity_key: String,
    /// Address other nodes reach us at. Defaults to `network.listen_addr`.
    pub address: Option<String>,
    #[serde(default = "default_account")]
    pub account: String,
    #[serde(default = "default_identity_file")]
    pub identity_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub dispatcher: DispatcherKind,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_branching")]
    pub branching_factor: usize,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            dispatcher: DispatcherKind::default(),
            request_timeout_secs: default_request_timeout(),
            branching_factor: default_branching(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RosterSection {
    #[serde(default)]
    pub servers: Vec<RosterEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    pub address: String,
    /// Base64 Ed25519 public key.
    pub public_key: String,
}

// Default value functions
fn default_identity_key() -> String {
    "~/.collective/node.key".into()
}
fn default_account() -> String {
    "default".into()
}
fn default_identity_file() -> String {
    "~/.collective/identity.json".into()
}
fn default_listen_addr() -> String {
    "0.0.0.0:7770".into()
}
fn default_request_timeout() -> u64 {
    10
}
fn default_branching() -> usize {
    2
}

impl NodeConfig {
    /// Load config from file, or create default if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn local_address(&self) -> &str {
        self.node
            .address
            .as_deref()
            .unwrap_or(&self.network.listen_addr)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.network.request_timeout_secs)
    }

    /// Parse `[[roster.servers]]` into a roster, in file order.
    pub fn roster(&self) -> Result<Roster, CryptoError> {
        let list = self
            .roster
            .servers
            .iter()
            .map(|s| {
                let key = PublicKey::from_base64(&s.public_key)?;
                Ok(ServerIdentity::new(s.address.clone(), key))
            })
            .collect::<Result<Vec<_>, CryptoError>>()?;
        Ok(Roster::new(list))
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection {
                identity_key: default_identity_key(),
                address: None,
                account: default_account(),
                identity_file: default_identity_file(),
            },
            network: NetworkSection::default(),
            roster: RosterSection::default(),
        }
    }
}
