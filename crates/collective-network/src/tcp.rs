//! TCP transport: length-prefixed packets over plain TCP streams.
//!
//! Inbound: one task per connection reads packets and hands each to the
//! dispatcher. Outbound: a single task drains the outbound queue, keeping
//! one connection per peer. Request/reply: [`TcpClient`] opens a connection,
//! writes one packet and waits for one packet back.

use bytes::BytesMut;
use collective_protocol::{
    Envelope, MessageCatalog, Packet, PacketCodec, ProtocolError, ServerIdentity,
    MAX_MESSAGE_BYTES,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Encoder;

use crate::client::{OutboundMessage, RequestClient, TransportError};
use crate::dispatch::Dispatcher;

// ============================================================================
// Codec helpers -- read/write a single Packet on a stream
// ============================================================================

/// Read one packet. `Ok(None)` when the peer closed the stream cleanly.
pub async fn read_packet<R>(recv: &mut R) -> Result<Option<Packet>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match recv.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_BYTES,
        }
        .into());
    }

    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf).await?;

    let packet: Packet = serde_json::from_slice(&buf).map_err(ProtocolError::from)?;
    Ok(Some(packet))
}

pub async fn write_packet<W>(send: &mut W, packet: Packet) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut codec = PacketCodec;
    let mut buf = BytesMut::new();
    codec.encode(packet, &mut buf)?;
    send.write_all(&buf).await?;
    send.flush().await?;
    Ok(())
}

// ============================================================================
// Request/reply client
// ============================================================================

/// Request/reply over a fresh TCP connection per request.
#[derive(Debug, Clone)]
pub struct TcpClient {
    local: ServerIdentity,
    timeout: Duration,
}

impl TcpClient {
    /// `local` is stamped as the sender of every request.
    pub fn new(local: ServerIdentity, timeout: Duration) -> Self {
        Self { local, timeout }
    }

    async fn exchange(
        &self,
        to: &ServerIdentity,
        request: Envelope,
    ) -> Result<Packet, TransportError> {
        let mut stream = TcpStream::connect(&to.address).await?;
        write_packet(&mut stream, Packet::new(self.local.clone(), request)).await?;
        read_packet(&mut stream)
            .await?
            .ok_or_else(|| TransportError::Closed(to.address.clone()))
    }
}

impl RequestClient for TcpClient {
    async fn send(&self, to: &ServerIdentity, request: Envelope) -> Result<Packet, TransportError> {
        let msg_type = request.msg_type;
        match tokio::time::timeout(self.timeout, self.exchange(to, request)).await {
            Ok(Ok(reply)) => {
                tracing::debug!(
                    peer = %to,
                    %msg_type,
                    reply_type = %reply.msg_type,
                    "tcp: request answered"
                );
                Ok(reply)
            }
            Ok(Err(e)) => {
                tracing::warn!(peer = %to, %msg_type, error = %e, "tcp: request failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(peer = %to, %msg_type, "tcp: request timed out");
                Err(TransportError::Timeout(to.address.clone()))
            }
        }
    }
}

// ============================================================================
// Inbound listener + outbound queue
// ============================================================================

/// Feeds packets from TCP connections into a dispatcher.
pub struct TcpTransport {
    local: ServerIdentity,
    dispatcher: Arc<dyn Dispatcher>,
    catalog: Arc<MessageCatalog>,
}

impl TcpTransport {
    pub fn new(
        local: ServerIdentity,
        dispatcher: Arc<dyn Dispatcher>,
        catalog: Arc<MessageCatalog>,
    ) -> Self {
        Self {
            local,
            dispatcher,
            catalog,
        }
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), TransportError> {
        tracing::info!(
            local = %self.local,
            listen = %listener.local_addr()?,
            "tcp: listening"
        );
        loop {
            let (stream, remote) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.recv() => {
                    tracing::info!(local = %self.local, "tcp: listener shut down");
                    return Ok(());
                }
            };
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream).await {
                    tracing::warn!(%remote, error = %e, "tcp: connection dropped");
                }
            });
        }
    }

    /// Packets of one connection are dispatched one at a time, in order.
    async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), TransportError> {
        while let Some(packet) = read_packet(&mut stream).await? {
            let msg_type = packet.msg_type;
            let sender = packet.sender.address.clone();
            let msg_name = self.catalog.name_of(msg_type).unwrap_or("unregistered");
            if let Err(e) = self.dispatcher.dispatch(packet) {
                tracing::warn!(
                    %msg_type,
                    msg_name,
                    sender = %sender,
                    error = %e,
                    "tcp: packet not dispatched"
                );
            } else {
                tracing::trace!(%msg_type, msg_name, sender = %sender, "tcp: packet dispatched");
            }
        }
        Ok(())
    }

    /// Drain `outbound`, writing each message to its recipient. One cached
    /// connection per peer; a failed write drops the connection and the
    /// message.
    pub async fn run_outbound(
        self: Arc<Self>,
        mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    ) {
        let mut conns: HashMap<String, TcpStream> = HashMap::new();
        while let Some(OutboundMessage { to, envelope }) = outbound.recv().await {
            let packet = Packet::new(self.local.clone(), envelope);
            if let Err(e) = self.write_to(&mut conns, &to, packet).await {
                conns.remove(&to.address);
                tracing::warn!(peer = %to, error = %e, "tcp: outbound message dropped");
            }
        }
        tracing::debug!(local = %self.local, "tcp: outbound queue closed");
    }

    async fn write_to(
        &self,
        conns: &mut HashMap<String, TcpStream>,
        to: &ServerIdentity,
        packet: Packet,
    ) -> Result<(), TransportError> {
        if !conns.contains_key(&to.address) {
            let stream = TcpStream::connect(&to.address).await?;
            conns.insert(to.address.clone(), stream);
        }
        match conns.get_mut(&to.address) {
            Some(stream) => write_packet(stream, packet).await,
            None => Err(TransportError::Closed(to.address.clone())),
        }
    }
}
