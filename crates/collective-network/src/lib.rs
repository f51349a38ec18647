//! Collective Network -- packet dispatch and transport.
//!
//! Inbound packets flow transport -> [`Dispatcher`] -> [`Processor`]. The
//! dispatcher strategy (blocking or one task per packet) is chosen at start
//! via [`DispatcherKind`]. Outbound traffic is either one-way
//! ([`OutboundMessage`] on a queue) or request/reply through a
//! [`RequestClient`].

pub mod client;
pub mod dispatch;
pub mod tcp;

pub use client::{request, OutboundMessage, RequestClient, TransportError};
pub use dispatch::{
    build_dispatcher, BlockingDispatcher, DispatchError, Dispatcher, DispatcherKind, FnProcessor,
    Processor, RoutineDispatcher,
};
pub use tcp::{TcpClient, TcpTransport};
