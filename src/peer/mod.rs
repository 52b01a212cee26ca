//! Connection state of remote nodes.

use std::{
    collections::{HashSet, VecDeque},
    net::SocketAddr,
    time::Instant,
};

use bytes::{Bytes, BytesMut};
use ed25519_dalek::SigningKey;
use tokio_util::codec::Decoder;

use crate::{
    codec::{PacketCodec, RawPacket},
    core::{buffer_pool::BufferPool, id::NodeId, message::AuthProof},
    error::NetworkError,
    transport::SessionId,
};

pub mod auth;
mod manager;
pub mod send_queue;

pub use manager::{
    PeerManager, WriteOutcome, AUTH_TIMEOUT, CONNECT_TIMEOUT, DEFAULT_MAX_PEERS, RELAY_TEST_TIMEOUT,
};
use send_queue::SendQueue;

/// A remote node we are, were, or will be connected to.
///
/// A peer is usable for data once it holds a session, both sides verified each other's proof of
/// identity and it runs on our chain.
#[derive(Debug)]
pub struct Peer {
    /// Invalid until the peer proves its identity on an accepted connection.
    pub id: NodeId,
    pub net_id: u64,
    pub session: Option<SessionId>,
    pub addr: Option<SocketAddr>,
    pub chain_id: u16,

    pub(crate) send_queue: SendQueue,
    recv_list: VecDeque<BytesMut>,
    pub(crate) connecting: bool,
    pub(crate) connect_deadline: Option<Instant>,
    pub(crate) connect_time: Option<Instant>,
    pub(crate) last_ping: Option<Instant>,
    pub(crate) groups: HashSet<String>,

    pub ping_count: u32,
    pub bytes_received: usize,
    pub bytes_sent: usize,
    pub send_wait_count: u32,
    pub disconnect_count: u32,

    auth_context: Option<AuthProof>,
    remote_auth_context: Option<AuthProof>,
    pub(crate) verify_result: bool,
    pub(crate) remote_verify_result: bool,
    auth_succeeded: bool,

    pub(crate) relay_id: Option<NodeId>,
    pub(crate) relay_test_time: Option<Instant>,
}

impl Peer {
    pub fn new(id: NodeId, net_id: u64) -> Self {
        Self {
            id,
            net_id,
            session: None,
            addr: None,
            chain_id: 0,
            send_queue: SendQueue::new(),
            recv_list: VecDeque::new(),
            connecting: false,
            connect_deadline: None,
            connect_time: None,
            last_ping: None,
            groups: HashSet::new(),
            ping_count: 0,
            bytes_received: 0,
            bytes_sent: 0,
            send_wait_count: 0,
            disconnect_count: 0,
            auth_context: None,
            remote_auth_context: None,
            verify_result: false,
            remote_verify_result: false,
            auth_succeeded: false,
            relay_id: None,
            relay_test_time: None,
        }
    }

    /// Authenticated both ways and connected.
    pub fn is_authenticated(&self) -> bool {
        self.auth_succeeded && self.session.is_some()
    }

    pub fn auth_succeeded(&self) -> bool {
        self.auth_succeeded
    }

    pub fn is_compatible(&self, chain_id: u16) -> bool {
        self.chain_id == chain_id
    }

    /// Connected, authenticated and on the given chain.
    pub fn is_available(&self, chain_id: u16) -> bool {
        self.is_authenticated() && self.is_compatible(chain_id)
    }

    /// Appends received bytes to the receive list.
    pub fn add_recv_data(&mut self, data: &[u8], pool: &BufferPool) {
        if data.is_empty() {
            return;
        }

        let mut buf = pool.get(data.len());
        buf.extend_from_slice(data);
        self.recv_list.push_back(buf);
        self.bytes_received += data.len();
    }

    /// Whether no received bytes are waiting to be decoded.
    pub fn is_empty(&self) -> bool {
        self.recv_list.is_empty()
    }

    /// Bytes waiting to be decoded.
    pub fn data_size(&self) -> usize {
        self.recv_list.iter().map(|buf| buf.len()).sum()
    }

    /// Reassembles the next packet from the receive list.
    ///
    /// Returns [`NetworkError::PacketTooSmall`] if the packet isn't complete yet, the bytes are
    /// kept for the next attempt. A malformed header discards the whole receive list.
    pub fn decode_packet(&mut self, pool: &BufferPool) -> Result<RawPacket, NetworkError> {
        let mut buf = self
            .recv_list
            .pop_front()
            .ok_or(NetworkError::PacketTooSmall)?;
        let mut codec = PacketCodec::new();

        loop {
            match codec.decode(&mut buf) {
                Ok(Some(packet)) => {
                    if buf.is_empty() {
                        pool.free(buf);
                    } else {
                        self.recv_list.push_front(buf);
                    }

                    return Ok(packet);
                }
                Ok(None) => match self.recv_list.pop_front() {
                    Some(next) => {
                        buf.extend_from_slice(&next);
                        pool.free(next);
                    }
                    None => {
                        self.recv_list.push_front(buf);
                        return Err(NetworkError::PacketTooSmall);
                    }
                },
                Err(e) => {
                    self.reset_data();
                    return Err(e);
                }
            }
        }
    }

    /// Drops received and queued bytes.
    pub fn reset_data(&mut self) {
        self.recv_list.clear();
        self.send_queue.clear();
    }

    /// Queues an encoded data packet. Returns `false` if its lane is full.
    pub fn write(&mut self, packet: Bytes, code: u32) -> bool {
        let len = packet.len();
        let queued = self.send_queue.push(packet, code);
        if queued {
            self.bytes_sent += len;
        }

        queued
    }

    /// Queues an encoded protocol packet. Returns `false` if the control list is full.
    pub fn write_control(&mut self, packet: Bytes) -> bool {
        let len = packet.len();
        let queued = self.send_queue.push_control(packet);
        if queued {
            self.bytes_sent += len;
        }

        queued
    }

    /// Takes the packets that may go out now, as far as the flow control allows: protocol packets
    /// once there is a session, data packets once the peer is also authenticated.
    pub fn take_sendable(&mut self) -> Vec<Bytes> {
        if self.session.is_none() {
            return Vec::new();
        }

        let mut packets = self.send_queue.drain_control();
        if self.auth_succeeded {
            packets.extend(self.send_queue.drain());
        }

        packets
    }

    pub fn add_group(&mut self, group_id: &str) {
        if !self.groups.contains(group_id) {
            self.groups.insert(group_id.to_owned());
        }
    }

    pub fn remove_group(&mut self, group_id: &str) {
        self.groups.remove(group_id);
    }

    /// Nothing ties the peer to the table: no session, no connect in flight and no group.
    pub(crate) fn is_idle(&self) -> bool {
        self.session.is_none() && !self.connecting && self.groups.is_empty()
    }

    pub fn is_group_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Our proof for this peer, signed on first use.
    pub fn auth_context(&mut self, key: &SigningKey) -> Option<AuthProof> {
        if !self.id.is_valid() {
            return None;
        }

        let id = self.id;
        Some(
            self.auth_context
                .get_or_insert_with(|| auth::sign_proof(key, &id, auth::unix_now()))
                .clone(),
        )
    }

    /// Checks the peer's proof. On success the peer takes the proven identifier.
    pub fn verify(&mut self, proof: AuthProof, local_id: &NodeId) -> bool {
        if self.auth_succeeded {
            return true;
        }

        let proven = auth::verify_proof(&proof, local_id, auth::unix_now())
            .filter(|id| id.net_id() == self.net_id);
        self.remote_auth_context = Some(proof);
        self.verify_result = proven.is_some();

        if let Some(id) = proven {
            self.id = id;
        }

        self.verify_update();
        self.verify_result
    }

    /// Records the peer's opinion of our proof.
    pub fn set_remote_verify_result(&mut self, result: bool) {
        self.remote_verify_result = result;
        self.verify_update();
    }

    fn verify_update(&mut self) {
        if !self.auth_succeeded && self.verify_result && self.remote_verify_result {
            self.auth_succeeded = true;
        }
    }

    fn reset_auth_context(&mut self) {
        self.auth_succeeded = false;
        self.auth_context = None;
        self.remote_auth_context = None;
        self.remote_verify_result = false;
        self.verify_result = false;
    }

    /// Forgets the peer's verdict on our proof, a fresh proof is signed for the next PING.
    pub fn reset_remote_verify_context(&mut self) {
        self.auth_context = None;
        self.remote_auth_context = None;
        self.remote_verify_result = false;
        self.auth_succeeded = false;
    }

    /// A session was established: buffers and authentication start over.
    pub fn on_connect(&mut self, session: SessionId, addr: Option<SocketAddr>) {
        self.recv_list.clear();
        self.reset_auth_context();
        self.connecting = false;
        self.connect_deadline = None;
        self.session = Some(session);
        if addr.is_some() {
            self.addr = addr;
        }
        self.connect_time = Some(Instant::now());
        self.send_queue.reset_pending();
    }

    /// The session closed. Returns `false` if it wasn't the current one.
    pub fn on_disconnect(&mut self, session: SessionId) -> bool {
        self.connecting = false;
        self.disconnect_count += 1;

        if self.session != Some(session) {
            return false;
        }

        self.reset_data();
        self.session = None;
        self.send_queue.reset_pending();
        true
    }

    /// The transport emptied its buffers for this peer.
    pub fn on_send_waited(&mut self) {
        self.send_queue.on_send_waited();
        self.send_wait_count += 1;
    }
}
