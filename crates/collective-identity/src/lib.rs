//! Collective Identity -- client for the identity consensus service.
//!
//! An identity is a set of devices that agree, by majority vote, on changes
//! to their own membership. Each change goes through propose -> vote ->
//! finalize; the service decides when the threshold is met and anchors the
//! accepted config in a skip-chain block.

use collective_protocol::{MessageCatalog, ProtocolError};

pub mod error;
pub mod identity;
mod rpc;
pub mod skipchain;

pub use error::IdentityError;
pub use identity::{Identity, IdentityRecord, IdentityState};
pub use skipchain::SkipchainClient;

/// Register the service messages plus the persisted identity record.
pub fn register_messages(catalog: &MessageCatalog) -> Result<(), ProtocolError> {
    collective_protocol::messages::register_messages(catalog)?;
    catalog.register::<IdentityRecord>()?;
    Ok(())
}
