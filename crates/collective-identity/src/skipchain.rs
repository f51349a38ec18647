//! Client for the skip-chain ledger service.

use std::sync::Arc;

use collective_crypto::PublicKey;
use collective_network::RequestClient;
use collective_protocol::messages::{
    GetLatestBlock, GetLatestBlockReply, SkipBlock, StoreSkipBlock, StoreSkipBlockReply,
};
use collective_protocol::Roster;

use crate::rpc::call;
use crate::IdentityError;

/// Shares its transport with the identity handle that owns it.
pub struct SkipchainClient<C> {
    client: Arc<C>,
}

impl<C: RequestClient> SkipchainClient<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// Latest block of the chain that contains `block_id`.
    pub async fn latest_block(
        &self,
        roster: &Roster,
        block_id: &[u8],
    ) -> Result<SkipBlock, IdentityError> {
        let reply: GetLatestBlockReply = call(
            self.client.as_ref(),
            roster,
            &GetLatestBlock {
                id: block_id.to_vec(),
            },
        )
        .await?;
        tracing::debug!(
            index = reply.latest.index,
            hash = %hex::encode(&reply.latest.hash),
            "skipchain: latest block"
        );
        Ok(reply.latest)
    }

    /// Append `data` after `latest_id`.
    pub async fn store_block(
        &self,
        roster: &Roster,
        latest_id: &[u8],
        data: Vec<u8>,
        signers: Vec<PublicKey>,
    ) -> Result<SkipBlock, IdentityError> {
        let reply: StoreSkipBlockReply = call(
            self.client.as_ref(),
            roster,
            &StoreSkipBlock {
                latest_id: latest_id.to_vec(),
                data,
                signers,
            },
        )
        .await?;
        Ok(reply.block)
    }
}
