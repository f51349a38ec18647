//! Client handle for one identity.
//!
//! A handle moves through three states:
//!   - Uninitialized: a fresh handle, no identity id yet.
//!   - Active: attached to an identity, nothing proposed.
//!   - ProposalPending: attached, with a proposed config awaiting votes.
//!
//! The accepted config only changes when the service says so: either a vote
//! reply carrying the finalized block, or a `config_update` fetch. Replies
//! from the service are trusted as-is; blocks and configs are not verified
//! here. A request that fails leaves config and proposal untouched.

use std::io::{Read, Write};
use std::sync::Arc;

use collective_crypto::{base64_bytes, KeyPair, PublicKey};
use collective_network::RequestClient;
use collective_protocol::messages::{
    AddIdentity, AddIdentityReply, Config, ConfigUpdate, IdentityId, ProposeFetch, ProposeSend,
    ProposeVote, ProposeVoteReply, SkipBlock,
};
use collective_protocol::{MessageCatalog, Roster};
use serde::{Deserialize, Serialize};

use crate::rpc::call;
use crate::{IdentityError, SkipchainClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    Uninitialized,
    Active,
    ProposalPending,
}

pub struct Identity<C> {
    client: Arc<C>,
    skipchain: SkipchainClient<C>,
    keypair: KeyPair,
    id: Option<IdentityId>,
    config: Config,
    proposed: Option<Config>,
    account: String,
    roster: Roster,
    root: Option<SkipBlock>,
    data: Option<SkipBlock>,
}

impl<C: RequestClient> Identity<C> {
    /// A new, not yet created identity owned by `owner` with a fresh device
    /// key.
    pub fn new(
        client: Arc<C>,
        roster: Roster,
        majority: u32,
        owner: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        Ok(Self::with_key(client, roster, majority, owner, KeyPair::generate()?))
    }

    /// Like [`Identity::new`], with an existing device key.
    pub fn with_key(
        client: Arc<C>,
        roster: Roster,
        majority: u32,
        owner: impl Into<String>,
        keypair: KeyPair,
    ) -> Self {
        let owner = owner.into();
        let config = Config::new(majority, keypair.public_key(), owner.clone());
        Self {
            skipchain: SkipchainClient::new(client.clone()),
            client,
            keypair,
            id: None,
            config,
            proposed: None,
            account: owner,
            roster,
            root: None,
            data: None,
        }
    }

    /// Follow an existing identity. The handle gets a device key of its own
    /// but is not part of the identity's config.
    pub async fn from_roster(
        client: Arc<C>,
        roster: Roster,
        id: IdentityId,
        account: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let config = fetch_config(client.as_ref(), &roster, &id).await?;
        let keypair = KeyPair::generate()?;
        tracing::debug!(%id, devices = config.devices.len(), "identity: following");
        Ok(Self {
            skipchain: SkipchainClient::new(client.clone()),
            client,
            keypair,
            id: Some(id),
            config,
            proposed: None,
            account: account.into(),
            roster,
            root: None,
            data: None,
        })
    }

    pub fn state(&self) -> IdentityState {
        match (&self.id, &self.proposed) {
            (None, _) => IdentityState::Uninitialized,
            (Some(_), None) => IdentityState::Active,
            (Some(_), Some(_)) => IdentityState::ProposalPending,
        }
    }

    pub fn id(&self) -> Option<&IdentityId> {
        self.id.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn proposed(&self) -> Option<&Config> {
        self.proposed.as_ref()
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn root_block(&self) -> Option<&SkipBlock> {
        self.root.as_ref()
    }

    pub fn data_block(&self) -> Option<&SkipBlock> {
        self.data.as_ref()
    }

    pub fn skipchain(&self) -> &SkipchainClient<C> {
        &self.skipchain
    }

    /// The pending proposal, or a copy of the accepted config.
    pub fn proposed_or_current(&self) -> Config {
        self.proposed.clone().unwrap_or_else(|| self.config.clone())
    }

    /// Ask the service to create this identity. The id becomes the hash of
    /// the returned data block.
    pub async fn create_identity(&mut self) -> Result<(), IdentityError> {
        let reply: AddIdentityReply = call(
            self.client.as_ref(),
            &self.roster,
            &AddIdentity {
                config: self.config.clone(),
                roster: self.roster.clone(),
            },
        )
        .await?;

        let id = IdentityId(reply.data.hash.clone());
        tracing::info!(%id, account = %self.account, "identity: created");
        self.root = Some(reply.root);
        self.data = Some(reply.data);
        self.id = Some(id);
        Ok(())
    }

    /// Join an existing identity by proposing its current config plus this
    /// device.
    pub async fn attach_to_identity(&mut self, id: IdentityId) -> Result<(), IdentityError> {
        let config = fetch_config(self.client.as_ref(), &self.roster, &id).await?;
        self.id = Some(id);
        self.config = config;

        if self.config.contains_account(&self.account) {
            return Err(IdentityError::DuplicateAccount(self.account.clone()));
        }
        let proposal = self
            .config
            .with_device(self.account.clone(), self.keypair.public_key());
        self.propose_send(proposal).await
    }

    /// Submit `config` as the next proposal. Recorded locally only once the
    /// service accepted it.
    pub async fn propose_send(&mut self, config: Config) -> Result<(), IdentityError> {
        let id = self.attached()?.clone();
        // The service echoes the proposal back as acknowledgement.
        let _ack: ProposeSend = call(
            self.client.as_ref(),
            &self.roster,
            &ProposeSend {
                id: id.clone(),
                config: config.clone(),
            },
        )
        .await?;

        tracing::debug!(%id, devices = config.devices.len(), "identity: proposal sent");
        self.proposed = Some(config);
        Ok(())
    }

    /// Poll the service for the pending proposal. Replaces the local one,
    /// clearing it when the service has none.
    pub async fn propose_fetch(&mut self) -> Result<(), IdentityError> {
        let id = self.attached()?.clone();
        let reply: ProposeFetch = call(
            self.client.as_ref(),
            &self.roster,
            &ProposeFetch { id, config: None },
        )
        .await?;
        self.proposed = reply.config;
        Ok(())
    }

    /// Vote on the pending proposal. Rejecting sends nothing: the service
    /// only counts acceptances. Returns `true` when this vote finalized the
    /// proposal and it became the accepted config.
    pub async fn propose_vote(&mut self, accept: bool) -> Result<bool, IdentityError> {
        let proposed = self.proposed.as_ref().ok_or(IdentityError::NoPendingProposal)?;
        let id = self.attached()?.clone();
        if !accept {
            tracing::debug!(%id, "identity: proposal not accepted, no vote sent");
            return Ok(false);
        }

        let signature = self.keypair.sign(&proposed.hash());
        let reply: ProposeVoteReply = call(
            self.client.as_ref(),
            &self.roster,
            &ProposeVote {
                id: id.clone(),
                signer: self.account.clone(),
                signature,
            },
        )
        .await?;

        match reply.block {
            Some(block) => {
                tracing::info!(
                    %id,
                    index = block.index,
                    "identity: threshold reached, config accepted"
                );
                self.data = Some(block);
                if let Some(proposed) = self.proposed.take() {
                    self.config = proposed;
                }
                Ok(true)
            }
            None => {
                tracing::debug!(%id, "identity: vote recorded, threshold not reached");
                Ok(false)
            }
        }
    }

    /// Replace the accepted config with the service's current one.
    pub async fn config_update(&mut self) -> Result<(), IdentityError> {
        if self.roster.is_empty() {
            return Err(IdentityError::EmptyRoster);
        }
        let id = self.attached()?;
        self.config = fetch_config(self.client.as_ref(), &self.roster, id).await?;
        Ok(())
    }

    /// Move the data anchor to the newest block of the identity's chain.
    pub async fn refresh_latest_block(&mut self) -> Result<(), IdentityError> {
        let id = self.attached()?;
        let anchor = match &self.data {
            Some(block) => block.hash.clone(),
            None => id.0.clone(),
        };
        let latest = self.skipchain.latest_block(&self.roster, &anchor).await?;
        self.data = Some(latest);
        Ok(())
    }

    /// Write the whole handle, private key included, as one catalog envelope.
    pub fn save_to_stream<W: Write>(
        &self,
        mut writer: W,
        catalog: &MessageCatalog,
    ) -> Result<(), IdentityError> {
        let record = IdentityRecord {
            private_key: self.keypair.pkcs8_der().to_vec(),
            id: self.id.clone(),
            config: self.config.clone(),
            proposed: self.proposed.clone(),
            account: self.account.clone(),
            roster: self.roster.clone(),
            root: self.root.clone(),
            data: self.data.clone(),
        };
        writer.write_all(&catalog.encode(&record)?)?;
        writer.flush()?;
        Ok(())
    }

    /// Restore a handle written by [`Identity::save_to_stream`]. Reads the
    /// stream to its end.
    pub fn from_stream<R: Read>(
        mut reader: R,
        catalog: &MessageCatalog,
        client: Arc<C>,
    ) -> Result<Self, IdentityError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let record: IdentityRecord = catalog.decode(&bytes)?;
        Ok(Self {
            skipchain: SkipchainClient::new(client.clone()),
            client,
            keypair: KeyPair::from_pkcs8(record.private_key)?,
            id: record.id,
            config: record.config,
            proposed: record.proposed,
            account: record.account,
            roster: record.roster,
            root: record.root,
            data: record.data,
        })
    }

    fn attached(&self) -> Result<&IdentityId, IdentityError> {
        self.id.as_ref().ok_or(IdentityError::NotAttached)
    }
}

impl<C> std::fmt::Debug for Identity<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("account", &self.account)
            .field("config", &self.config)
            .field("proposed", &self.proposed)
            .field("roster", &self.roster.len())
            .finish_non_exhaustive()
    }
}

async fn fetch_config<C: RequestClient>(
    client: &C,
    roster: &Roster,
    id: &IdentityId,
) -> Result<Config, IdentityError> {
    let reply: ConfigUpdate = call(
        client,
        roster,
        &ConfigUpdate {
            id: id.clone(),
            config: None,
        },
    )
    .await?;
    reply
        .config
        .ok_or_else(|| IdentityError::Remote(format!("no config known for identity {id}")))
}

/// Persisted form of an [`Identity`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    #[serde(with = "base64_bytes")]
    pub private_key: Vec<u8>,
    pub id: Option<IdentityId>,
    pub config: Config,
    pub proposed: Option<Config>,
    pub account: String,
    pub roster: Roster,
    pub root: Option<SkipBlock>,
    pub data: Option<SkipBlock>,
}

collective_protocol::message_types! {
    IdentityRecord => "identity.IdentityRecord",
}
