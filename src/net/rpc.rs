//! Protocol RPCs and the matching of their replies.

use std::{collections::VecDeque, net::SocketAddr, sync::Arc, time::Duration};

use ed25519_dalek::SigningKey;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{trace, warn};

use super::expiration;
use crate::{
    codec::encode_packet,
    core::{
        id::NodeId,
        message::{FindNode, MessageType, Packet, Ping},
        node::Node,
    },
    error::NetworkError,
    kad::KadNetwork,
    peer::{auth, PeerManager},
};

/// How long a request waits for its reply.
pub const RESP_TIMEOUT: Duration = Duration::from_millis(500);
/// A peer is pinged at most this often.
pub const PING_INTERVAL: Duration = Duration::from_secs(3);
/// Version carried in PING and PONG.
pub const PROTOCOL_VERSION: u32 = 1;
// NEIGHBORS entries on privileged ports are ignored.
const MIN_NEIGHBOR_PORT: u16 = 1024;

/// Called with each matching reply, returns `true` once the request is complete.
pub(crate) type Callback = Box<dyn FnMut(&Packet) -> bool + Send>;

pub(crate) struct Pending {
    from: NodeId,
    kind: MessageType,
    deadline: Instant,
    callback: Callback,
    errc: oneshot::Sender<Result<(), NetworkError>>,
}

pub(crate) struct Reply {
    from: NodeId,
    kind: MessageType,
    packet: Packet,
    matched: oneshot::Sender<bool>,
}

pub(crate) enum PendingOp {
    Add(Pending),
    Reply(Reply),
}

/// The requests waiting for a reply, oldest first.
#[derive(Default)]
pub(crate) struct PendingList {
    entries: VecDeque<Pending>,
}

impl PendingList {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn apply(&mut self, op: PendingOp) {
        match op {
            PendingOp::Add(pending) => self.entries.push_back(pending),
            PendingOp::Reply(reply) => self.got_reply(reply),
        }
    }

    // Every request from the same node for the same type sees the reply.
    fn got_reply(&mut self, reply: Reply) {
        let mut matched = false;
        let mut i = 0;

        while i < self.entries.len() {
            let pending = &mut self.entries[i];
            if pending.from == reply.from && pending.kind == reply.kind {
                matched = true;
                if (pending.callback)(&reply.packet) {
                    if let Some(done) = self.entries.remove(i) {
                        let _ = done.errc.send(Ok(()));
                    }
                    continue;
                }
            }

            i += 1;
        }

        let _ = reply.matched.send(matched);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|pending| pending.deadline).min()
    }

    /// Fails the requests past their deadline, and those whose deadline is so far ahead the
    /// clock must have jumped.
    pub fn expire(&mut self, now: Instant) {
        let mut kept = VecDeque::with_capacity(self.entries.len());

        for pending in self.entries.drain(..) {
            let err = if now >= pending.deadline {
                NetworkError::Timeout
            } else if pending.deadline - now > 2 * RESP_TIMEOUT {
                NetworkError::ClockWarp
            } else {
                kept.push_back(pending);
                continue;
            };

            trace!(peer = %pending.from, kind = pending.kind.as_str(), "{err}");
            let _ = pending.errc.send(Err(err));
        }

        self.entries = kept;
    }

    /// Fails every request.
    pub fn close(&mut self) {
        for pending in self.entries.drain(..) {
            let _ = pending.errc.send(Err(NetworkError::Closed));
        }
    }
}

/// Sends PING and FIND_NODE and routes replies to the requests awaiting them.
pub(crate) struct Rpc {
    local_id: NodeId,
    key: SigningKey,
    chain_id: u16,
    local_addr: RwLock<SocketAddr>,
    peers: Arc<PeerManager>,
    pending: mpsc::UnboundedSender<PendingOp>,
}

impl Rpc {
    pub fn new(
        key: SigningKey,
        chain_id: u16,
        local_addr: SocketAddr,
        peers: Arc<PeerManager>,
        pending: mpsc::UnboundedSender<PendingOp>,
    ) -> Self {
        Self {
            local_id: auth::node_id_of(&key),
            key,
            chain_id,
            local_addr: RwLock::new(local_addr),
            peers,
            pending,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        *self.local_addr.read()
    }

    pub fn set_local_addr(&self, addr: SocketAddr) {
        *self.local_addr.write() = addr;
    }

    /// Registers a request; the receiver resolves once the callback reports completion, or with
    /// the error that ended the wait.
    pub fn add_pending(
        &self,
        from: NodeId,
        kind: MessageType,
        callback: Callback,
    ) -> oneshot::Receiver<Result<(), NetworkError>> {
        let (errc, rx) = oneshot::channel();
        let pending = Pending {
            from,
            kind,
            deadline: Instant::now() + RESP_TIMEOUT,
            callback,
            errc,
        };

        // The loop is gone, dropping the sender reports the request as closed.
        let _ = self.pending.send(PendingOp::Add(pending));

        rx
    }

    /// Hands a reply to the requests awaiting it, returns whether any did.
    pub async fn got_reply(&self, from: NodeId, kind: MessageType, packet: Packet) -> bool {
        let (matched, rx) = oneshot::channel();
        let reply = Reply {
            from,
            kind,
            packet,
            matched,
        };

        if self.pending.send(PendingOp::Reply(reply)).is_err() {
            return false;
        }

        rx.await.unwrap_or(false)
    }

    /// Sends a protocol packet, connecting first if needed.
    pub fn write_control(&self, id: NodeId, addr: Option<SocketAddr>, packet: &Packet) {
        match encode_packet(packet) {
            Ok(bytes) => {
                self.peers
                    .write_control(id, addr, bytes, packet.message_type().code());
            }
            Err(e) => warn!(peer = %id, "failed to encode {}: {e}", packet.message_type().as_str()),
        }
    }

    /// Pings the node unless it's already available or was pinged recently. Until the peer is
    /// authenticated, the PING carries our proof of identity.
    pub fn ping(&self, id: NodeId, addr: Option<SocketAddr>) {
        if !id.is_valid() || id == self.local_id {
            return;
        }

        let peer = self.peers.peer(&id);
        let auth = match &peer {
            Some(peer) => {
                let mut p = peer.lock();
                if p.is_available(self.chain_id)
                    || p.last_ping.map_or(false, |at| at.elapsed() < PING_INTERVAL)
                {
                    return;
                }

                p.ping_count += 1;
                p.last_ping = Some(std::time::Instant::now());
                match p.auth_succeeded() {
                    true => None,
                    false => p.auth_context(&self.key),
                }
            }
            None => Some(auth::sign_proof(&self.key, &id, auth::unix_now())),
        };

        let ping = Packet::Ping(Ping {
            version: PROTOCOL_VERSION,
            from: Some(self.local_addr()),
            to: addr,
            chain_id: self.chain_id,
            expiration: expiration(),
            auth,
        });
        trace!(peer = %id, "ping");
        self.write_control(id, addr, &ping);

        if peer.is_none() {
            if let Some(peer) = self.peers.peer(&id) {
                let mut p = peer.lock();
                p.ping_count += 1;
                p.last_ping = Some(std::time::Instant::now());
            }
        }
    }
}

impl KadNetwork for Rpc {
    fn ping(&self, id: NodeId, addr: Option<SocketAddr>) {
        Rpc::ping(self, id, addr)
    }

    fn find_node(
        &self,
        id: NodeId,
        addr: SocketAddr,
        target: NodeId,
    ) -> BoxFuture<'static, Result<Vec<Node>, NetworkError>> {
        let nodes = Arc::new(Mutex::new(Vec::new()));
        let found = Arc::clone(&nodes);

        let done = self.add_pending(
            id,
            MessageType::Neighbors,
            Box::new(move |packet| {
                if let Packet::Neighbors(neighbors) = packet {
                    let mut found = found.lock();
                    for rn in &neighbors.nodes {
                        if rn.addr.port() <= MIN_NEIGHBOR_PORT {
                            trace!(node = %rn.id, addr = %rn.addr, "neighbor on a privileged port");
                            continue;
                        }

                        let mut node = Node::new(rn.id, rn.addr);
                        node.nat_type = rn.nat_type;
                        found.push(node);
                    }
                }

                true
            }),
        );

        self.write_control(
            id,
            Some(addr),
            &Packet::FindNode(FindNode {
                target,
                expiration: expiration(),
            }),
        );

        Box::pin(async move {
            match done.await {
                Ok(Ok(())) => Ok(std::mem::take(&mut *nodes.lock())),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(NetworkError::Closed),
            }
        })
    }
}
