//! Request/reply seam between clients and the transport.

use collective_protocol::{Envelope, Message, Packet, ProtocolError, ServerIdentity};
use std::future::Future;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("connection to {0} closed before a reply arrived")]
    Closed(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Deliver one request to one server and wait for its reply.
///
/// Timeouts are the implementation's business; callers only see
/// [`TransportError::Timeout`].
pub trait RequestClient: Send + Sync + 'static {
    fn send(
        &self,
        to: &ServerIdentity,
        request: Envelope,
    ) -> impl Future<Output = Result<Packet, TransportError>> + Send;
}

/// Typed convenience over [`RequestClient::send`].
pub async fn request<C, T>(
    client: &C,
    to: &ServerIdentity,
    msg: &T,
) -> Result<Packet, TransportError>
where
    C: RequestClient,
    T: Message,
{
    client.send(to, Envelope::new(msg)?).await
}

/// A one-way message queued for the transport.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub to: ServerIdentity,
    pub envelope: Envelope,
}
