use collective_crypto::CryptoError;
use collective_network::TransportError;
use collective_protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("roster is empty")]
    EmptyRoster,
    #[error("no proposed config to vote on")]
    NoPendingProposal,
    #[error("account {0:?} already exists in the identity")]
    DuplicateAccount(String),
    #[error("identity handle is not attached to an identity")]
    NotAttached,
    #[error("remote failure: {0}")]
    Remote(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for IdentityError {
    fn from(e: TransportError) -> Self {
        Self::Remote(e.to_string())
    }
}
