//! The byte-moving layer underneath the protocol.

use std::{io, net::SocketAddr};

use bytes::Bytes;

mod tcp;

pub use tcp::TcpTransport;

/// Identifies one connection of the transport.
pub type SessionId = u32;

/// What the transport reports back to the network core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An outbound connection to `net_id` is up.
    Connected { net_id: u64, session: SessionId },
    /// A remote node connected to us from `addr`.
    Accepted {
        net_id: u64,
        session: SessionId,
        addr: SocketAddr,
    },
    Disconnected {
        net_id: u64,
        session: SessionId,
        reason: String,
    },
    /// Everything queued for the session was written out.
    SendQueueDrained { net_id: u64, session: SessionId },
    DataReceived {
        net_id: u64,
        session: SessionId,
        data: Bytes,
    },
    /// The NAT check completed, `public_addr` is how others reach us.
    NatTypeChecked { nat_type: u32, public_addr: SocketAddr },
}

/// Connection management and raw byte delivery.
///
/// Calls don't block: results come back as [`TransportEvent`]s.
pub trait Transport: Send + Sync + 'static {
    /// Starts accepting connections, returns the bound address.
    fn listen(&self, addr: SocketAddr) -> io::Result<SocketAddr>;

    /// Routes every connection through a NAT traversal server.
    fn proxy(&self, addr: SocketAddr) -> io::Result<()>;

    /// Opens a connection to the node with the given network identifier.
    fn connect(&self, net_id: u64, addr: SocketAddr);

    fn send(&self, session: SessionId, data: Bytes);

    /// Closes one connection.
    fn shutdown(&self, session: SessionId);

    /// Closes every connection and stops listening.
    fn close(&self);
}
