//! One request to a random roster member, one typed reply back.

use collective_network::{request, RequestClient};
use collective_protocol::messages::ServiceError;
use collective_protocol::{Message, Packet, Roster};

use crate::IdentityError;

/// Send `msg` to a random member of `roster` and decode the reply as `R`.
/// A `ServiceError` reply, a transport failure or a reply of any other shape
/// all come back as [`IdentityError::Remote`].
pub(crate) async fn call<C, T, R>(
    client: &C,
    roster: &Roster,
    msg: &T,
) -> Result<R, IdentityError>
where
    C: RequestClient,
    T: Message,
    R: Message,
{
    let to = roster.random().ok_or(IdentityError::EmptyRoster)?;
    let reply = request(client, to, msg).await?;
    expect_reply(reply)
}

/// Turn a `ServiceError` reply into [`IdentityError::Remote`].
fn check_service_error(reply: &Packet) -> Result<(), IdentityError> {
    if !reply.is::<ServiceError>() {
        return Ok(());
    }
    let err: ServiceError = reply
        .decode()
        .map_err(|e| IdentityError::Remote(format!("unreadable service error: {e}")))?;
    Err(IdentityError::Remote(err.message))
}

fn expect_reply<R: Message>(reply: Packet) -> Result<R, IdentityError> {
    check_service_error(&reply)?;
    reply
        .decode()
        .map_err(|e| IdentityError::Remote(format!("unexpected reply from {}: {e}", reply.sender)))
}
