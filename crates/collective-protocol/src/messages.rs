//! Wire message types for the identity service and the skip-chain ledger.
//!
//! Requests that the service answers with the same shape (ProposeFetch,
//! ConfigUpdate) carry an optional `config` that is `None` on the way out and
//! filled in on the way back.

use collective_crypto::{base64_bytes, ContentHasher, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{MessageCatalog, ProtocolError, Roster};

// ============================================================================
// Identity data model
// ============================================================================

/// Logical identity id: the hash of the data block returned at creation.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IdentityId(#[serde(with = "hex_bytes")] pub Vec<u8>);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityId({})", hex::encode(&self.0))
    }
}

/// One authorized device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub public: PublicKey,
}

/// An identity configuration: who may vote and how many votes are needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub majority: u32,
    /// Account name -> device. Sorted, so hashing is order independent.
    pub devices: BTreeMap<String, Device>,
    pub owner: String,
}

impl Config {
    /// A config holding a single device registered under `owner`.
    pub fn new(majority: u32, public: PublicKey, owner: impl Into<String>) -> Self {
        let owner = owner.into();
        let mut devices = BTreeMap::new();
        devices.insert(owner.clone(), Device { public });
        Self {
            majority,
            devices,
            owner,
        }
    }

    pub fn contains_account(&self, account: &str) -> bool {
        self.devices.contains_key(account)
    }

    /// Copy of this config with one more device.
    pub fn with_device(&self, account: impl Into<String>, public: PublicKey) -> Self {
        let mut next = self.clone();
        next.devices.insert(account.into(), Device { public });
        next
    }

    /// Whether enough devices exist for `majority` votes to be cast at all.
    pub fn is_reachable(&self) -> bool {
        self.majority as usize <= self.devices.len()
    }

    /// Content hash: the bytes every device signs when voting.
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = ContentHasher::new();
        hasher
            .part(&self.majority.to_be_bytes())
            .part(self.owner.as_bytes());
        for (account, device) in &self.devices {
            hasher.part(account.as_bytes()).part(device.public.as_bytes());
        }
        hasher.finish()
    }
}

/// A ledger block. Opaque to clients except for its hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipBlock {
    pub index: u64,
    #[serde(with = "hex_bytes")]
    pub hash: Vec<u8>,
    /// Hash of the preceding block; empty for a genesis block.
    #[serde(with = "hex_bytes")]
    pub previous: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub signers: Vec<PublicKey>,
}

impl SkipBlock {
    pub fn new(index: u64, previous: Vec<u8>, data: Vec<u8>, signers: Vec<PublicKey>) -> Self {
        let mut hasher = ContentHasher::new();
        hasher
            .part(&index.to_be_bytes())
            .part(&previous)
            .part(&data);
        for signer in &signers {
            hasher.part(signer.as_bytes());
        }
        Self {
            index,
            hash: hasher.finish().to_vec(),
            previous,
            data,
            signers,
        }
    }
}

// ============================================================================
// Identity service requests / replies
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddIdentity {
    pub config: Config,
    pub roster: Roster,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddIdentityReply {
    pub root: SkipBlock,
    pub data: SkipBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeSend {
    pub id: IdentityId,
    pub config: Config,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeFetch {
    pub id: IdentityId,
    pub config: Option<Config>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeVote {
    pub id: IdentityId,
    pub signer: String,
    pub signature: Signature,
}

/// `block` is `None` while the vote threshold is not yet reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeVoteReply {
    pub block: Option<SkipBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub id: IdentityId,
    pub config: Option<Config>,
}

/// Returned by a service instead of the expected reply when it fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceError {
    pub message: String,
}

// Service-to-service propagation. Registered so nodes can route them; the
// client never sends these.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagateIdentity {
    pub id: IdentityId,
    pub config: Config,
    pub proposed: Option<Config>,
    pub data: Option<SkipBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSkipBlock {
    pub id: IdentityId,
    pub latest: SkipBlock,
}

// ============================================================================
// Skip-chain ledger
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLatestBlock {
    #[serde(with = "hex_bytes")]
    pub id: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLatestBlockReply {
    pub latest: SkipBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSkipBlock {
    #[serde(with = "hex_bytes")]
    pub latest_id: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub signers: Vec<PublicKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSkipBlockReply {
    pub block: SkipBlock,
}

crate::message_types! {
    AddIdentity => "identity.AddIdentity",
    AddIdentityReply => "identity.AddIdentityReply",
    ProposeSend => "identity.ProposeSend",
    ProposeFetch => "identity.ProposeFetch",
    ProposeVote => "identity.ProposeVote",
    ProposeVoteReply => "identity.ProposeVoteReply",
    ConfigUpdate => "identity.ConfigUpdate",
    ServiceError => "service.Error",
    PropagateIdentity => "identity.PropagateIdentity",
    UpdateSkipBlock => "identity.UpdateSkipBlock",
    GetLatestBlock => "skipchain.GetLatestBlock",
    GetLatestBlockReply => "skipchain.GetLatestBlockReply",
    StoreSkipBlock => "skipchain.StoreSkipBlock",
    StoreSkipBlockReply => "skipchain.StoreSkipBlockReply",
}

/// Register every identity and ledger message with `catalog`.
pub fn register_messages(catalog: &MessageCatalog) -> Result<(), ProtocolError> {
    catalog.register::<AddIdentity>()?;
    catalog.register::<AddIdentityReply>()?;
    catalog.register::<ProposeSend>()?;
    catalog.register::<ProposeFetch>()?;
    catalog.register::<ProposeVote>()?;
    catalog.register::<ProposeVoteReply>()?;
    catalog.register::<ConfigUpdate>()?;
    catalog.register::<ServiceError>()?;
    catalog.register::<PropagateIdentity>()?;
    catalog.register::<UpdateSkipBlock>()?;
    catalog.register::<GetLatestBlock>()?;
    catalog.register::<GetLatestBlockReply>()?;
    catalog.register::<StoreSkipBlock>()?;
    catalog.register::<StoreSkipBlockReply>()?;
    Ok(())
}

// ============================================================================
// Serde helpers
// ============================================================================

/// Serialize/deserialize Vec<u8> as hex string.
mod hex_bytes {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
