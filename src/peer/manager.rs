use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::{seq::SliceRandom, thread_rng};
use tracing::{debug, info, trace, warn};

use super::Peer;
use crate::{
    api::Conn,
    core::{buffer_pool::BufferPool, id::NodeId},
    error::NetworkError,
    flow_meter::FlowMeter,
    transport::{SessionId, Transport},
};

/// A connect attempt is considered failed after this long.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// Connected peers that haven't authenticated within this long are disconnected.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(60);
/// Minimum time between two relay tests for the same peer.
pub const RELAY_TEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// The default capacity of the peer table.
pub const DEFAULT_MAX_PEERS: usize = 512;

/// Where a packet went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Queued on a live session.
    Sent,
    /// Handed to the peer relaying for the destination.
    Relayed(NodeId),
    /// Queued until the peer is connected.
    Pending,
    Dropped,
}

/// Owns every [`Peer`], keyed by network identifier, and moves their packets to the transport.
pub struct PeerManager {
    local_id: NodeId,
    chain_id: u16,
    max_peers: usize,
    // All connections go through the NAT server when set.
    nat_addr: Option<SocketAddr>,
    peers: RwLock<HashMap<u64, Arc<Mutex<Peer>>>>,
    transport: Arc<dyn Transport>,
    pool: Arc<BufferPool>,
    flow_meter: Arc<FlowMeter>,
}

impl PeerManager {
    pub fn new(
        local_id: NodeId,
        chain_id: u16,
        max_peers: usize,
        nat_addr: Option<SocketAddr>,
        transport: Arc<dyn Transport>,
        pool: Arc<BufferPool>,
        flow_meter: Arc<FlowMeter>,
    ) -> Self {
        Self {
            local_id,
            chain_id,
            max_peers,
            nat_addr,
            peers: RwLock::new(HashMap::new()),
            transport,
            pool,
            flow_meter,
        }
    }

    pub fn chain_id(&self) -> u16 {
        self.chain_id
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peer(&self, id: &NodeId) -> Option<Arc<Mutex<Peer>>> {
        self.peer_by_net_id(id.net_id())
    }

    pub fn peer_by_net_id(&self, net_id: u64) -> Option<Arc<Mutex<Peer>>> {
        self.peers.read().get(&net_id).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<Mutex<Peer>>> {
        self.peers.read().values().cloned().collect()
    }

    fn get_or_insert(&self, id: NodeId, net_id: u64) -> Result<Arc<Mutex<Peer>>, NetworkError> {
        let mut peers = self.peers.write();
        if let Some(peer) = peers.get(&net_id) {
            return Ok(Arc::clone(peer));
        }

        if peers.len() >= self.max_peers {
            // Make room by forgetting a peer nothing depends on.
            let idle = peers
                .iter()
                .find(|(_, peer)| peer.try_lock().map_or(false, |p| p.is_idle()))
                .map(|(&idle, _)| idle);

            match idle {
                Some(idle) => {
                    debug!(evicted = idle, net_id, "peer table full, idle peer evicted");
                    peers.remove(&idle);
                }
                None => return Err(NetworkError::PeerTableFull),
            }
        }

        let peer = Arc::new(Mutex::new(Peer::new(id, net_id)));
        peers.insert(net_id, Arc::clone(&peer));

        Ok(peer)
    }

    /// Sends a data packet, connecting to the peer first if needed.
    ///
    /// With `relay` set, a packet for a peer we can't reach directly goes through the peer known
    /// to be connected to it.
    pub fn write(
        &self,
        id: NodeId,
        addr: Option<SocketAddr>,
        packet: Bytes,
        code: u32,
        relay: bool,
    ) -> WriteOutcome {
        self.enqueue(id, addr, packet, code, false, relay)
    }

    /// Sends a protocol packet, connecting to the peer first if needed. Protocol packets don't
    /// wait for authentication.
    pub fn write_control(
        &self,
        id: NodeId,
        addr: Option<SocketAddr>,
        packet: Bytes,
        code: u32,
    ) -> WriteOutcome {
        self.enqueue(id, addr, packet, code, true, false)
    }

    /// Answers on the connection a packet came in on, the peer may not have proven its identity
    /// yet.
    pub fn reply(&self, net_id: u64, packet: Bytes, code: u32) {
        if let Some(peer) = self.peer_by_net_id(net_id) {
            self.queue(&mut peer.lock(), packet, code, true);
        }
    }

    fn enqueue(
        &self,
        id: NodeId,
        addr: Option<SocketAddr>,
        packet: Bytes,
        code: u32,
        control: bool,
        relay: bool,
    ) -> WriteOutcome {
        if !id.is_valid() || id == self.local_id {
            return WriteOutcome::Dropped;
        }

        let peer = match self.get_or_insert(id, id.net_id()) {
            Ok(peer) => peer,
            Err(e) => {
                warn!(peer = %id, code, "{e}, packet dropped");
                return WriteOutcome::Dropped;
            }
        };

        let relay_id = {
            let mut p = peer.lock();
            if p.session.is_some() {
                return match self.queue(&mut p, packet, code, control) {
                    true => WriteOutcome::Sent,
                    false => WriteOutcome::Dropped,
                };
            }

            p.relay_id.filter(|_| relay)
        };

        if let Some(relay_id) = relay_id {
            if let Some(relay_peer) = self.peer(&relay_id) {
                let mut rp = relay_peer.lock();
                if rp.session.is_some() {
                    trace!(peer = %id, relay = %relay_id, code, "relaying");
                    return match self.queue(&mut rp, packet, code, control) {
                        true => WriteOutcome::Relayed(relay_id),
                        false => WriteOutcome::Dropped,
                    };
                }
            }
        }

        let mut p = peer.lock();
        if !p.id.is_valid() {
            p.id = id;
        }
        if addr.is_some() {
            p.addr = addr;
        }
        self.connect(&mut p);

        match self.queue(&mut p, packet, code, control) {
            true if p.session.is_some() => WriteOutcome::Sent,
            true => WriteOutcome::Pending,
            false => WriteOutcome::Dropped,
        }
    }

    // Issues a connect unless one is in flight or the peer can't be located.
    fn connect(&self, p: &mut Peer) {
        if p.session.is_some() {
            return;
        }

        let now = Instant::now();
        if p.connecting && p.connect_deadline.map_or(false, |deadline| now < deadline) {
            return;
        }

        let Some(target) = self.nat_addr.or(p.addr) else {
            p.connecting = false;
            return;
        };

        debug!(peer = %p.id, %target, "connecting");
        p.connecting = true;
        p.connect_deadline = Some(now + CONNECT_TIMEOUT);
        self.transport.connect(p.net_id, target);
    }

    fn queue(&self, p: &mut Peer, packet: Bytes, code: u32, control: bool) -> bool {
        let len = packet.len();
        let queued = match control {
            true => p.write_control(packet),
            false => p.write(packet, code),
        };

        if !queued {
            warn!(peer = %p.id, code, "send list full, packet dropped");
            return false;
        }

        self.flow_meter.send(code, len);
        self.flush_peer(p);
        true
    }

    fn flush_peer(&self, p: &mut Peer) {
        let Some(session) = p.session else {
            return;
        };

        for packet in p.take_sendable() {
            self.transport.send(session, packet);
        }
    }

    /// Records the address of a known peer and connects to it if it has no session.
    pub fn dial(&self, id: &NodeId, addr: SocketAddr) {
        if let Some(peer) = self.peer(id) {
            let mut p = peer.lock();
            p.addr = Some(addr);
            self.connect(&mut p);
        }
    }

    /// Sends whatever the peer's queues let through.
    pub fn flush(&self, net_id: u64) {
        if let Some(peer) = self.peer_by_net_id(net_id) {
            self.flush_peer(&mut peer.lock());
        }
    }

    /// Whether a relay test should be run for the peer: it dropped more than once, never sent us
    /// anything and has no relay yet. Starts the test period if so.
    pub fn take_relay_test(&self, id: &NodeId) -> bool {
        let Some(peer) = self.peer(id) else {
            return false;
        };

        let mut p = peer.lock();
        let due = p
            .relay_test_time
            .map_or(true, |at| at.elapsed() >= RELAY_TEST_TIMEOUT);

        if p.session.is_none()
            && p.relay_id.is_none()
            && p.disconnect_count > 1
            && p.bytes_received == 0
            && due
        {
            p.relay_test_time = Some(Instant::now());
            return true;
        }

        false
    }

    /// Records `relay` as connected to `target`.
    pub fn set_relay(&self, target: &NodeId, relay: NodeId) {
        if let Some(peer) = self.peer(target) {
            let mut p = peer.lock();
            if p.relay_id != Some(relay) {
                info!(peer = %target, %relay, "relay found");
                p.relay_id = Some(relay);
            }
        }
    }

    /// A session came up, outbound or accepted. Returns the peer's identifier, invalid for an
    /// accepted connection until the peer proves it.
    ///
    /// An authenticated session is never displaced: a second connection claiming the same network
    /// identifier is closed and the peer keeps talking on the first one.
    pub fn on_connected(
        &self,
        net_id: u64,
        session: SessionId,
        addr: Option<SocketAddr>,
    ) -> Option<NodeId> {
        let peer = match self.get_or_insert(NodeId::default(), net_id) {
            Ok(peer) => peer,
            Err(e) => {
                warn!(net_id, session, "{e}, closing the connection");
                self.transport.shutdown(session);
                return None;
            }
        };

        let mut p = peer.lock();
        if let Some(current) = p.session {
            if current != session && p.auth_succeeded() {
                warn!(
                    peer = %p.id,
                    net_id,
                    session,
                    current,
                    "already authenticated, closing the new connection"
                );
                drop(p);
                self.transport.shutdown(session);
                return None;
            }
        }

        p.on_connect(session, addr);
        info!(peer = %p.id, net_id, session, "connected");
        self.flush_peer(&mut p);

        Some(p.id)
    }

    pub fn on_disconnected(&self, net_id: u64, session: SessionId, reason: &str) {
        let Some(peer) = self.peer_by_net_id(net_id) else {
            return;
        };

        let mut p = peer.lock();
        if p.on_disconnect(session) {
            info!(peer = %p.id, net_id, session, reason, "disconnected");
        } else {
            debug!(peer = %p.id, net_id, session, reason, "connection closed");
        }
    }

    /// The transport wrote out everything queued for the session.
    pub fn on_send_waited(&self, net_id: u64) {
        if let Some(peer) = self.peer_by_net_id(net_id) {
            let mut p = peer.lock();
            p.on_send_waited();
            self.flush_peer(&mut p);
        }
    }

    /// Buffers received bytes, returns the peer to decode them from. Bytes arriving on any session
    /// other than the peer's current one are dropped.
    pub fn on_data(
        &self,
        net_id: u64,
        session: SessionId,
        data: &[u8],
    ) -> Option<Arc<Mutex<Peer>>> {
        let peer = self.peer_by_net_id(net_id)?;

        {
            let mut p = peer.lock();
            if p.session != Some(session) {
                trace!(peer = %p.id, net_id, session, "data on a stale session dropped");
                return None;
            }
            p.add_recv_data(data, &self.pool);
        }

        Some(peer)
    }

    /// Closes the connection to the peer.
    pub fn disconnect(&self, id: &NodeId) {
        if let Some(peer) = self.peer(id) {
            if let Some(session) = peer.lock().session {
                debug!(peer = %id, session, "disconnecting");
                self.transport.shutdown(session);
            }
        }
    }

    /// Drops connections that didn't authenticate in time and returns the peers to ping again.
    pub fn check_peers(&self) -> Vec<NodeId> {
        let now = Instant::now();
        let mut to_ping = Vec::new();

        for peer in self.snapshot() {
            let mut p = peer.lock();
            if p.connecting && p.connect_deadline.map_or(true, |deadline| now >= deadline) {
                p.connecting = false;
            }

            let Some(session) = p.session else {
                continue;
            };
            if p.auth_succeeded() {
                continue;
            }

            if p
                .connect_time
                .map_or(false, |at| now.duration_since(at) > AUTH_TIMEOUT)
            {
                info!(peer = %p.id, session, "authentication timed out");
                self.transport.shutdown(session);
            } else if !p.remote_verify_result && p.id.is_valid() {
                to_ping.push(p.id);
            }
        }

        to_ping
    }

    /// Sends the packet to every available peer.
    pub fn broadcast(&self, packet: Bytes, code: u32) {
        for peer in self.available() {
            self.queue(&mut peer.lock(), packet.clone(), code, false);
        }
    }

    /// Sends the packet to `max(sqrt(n), 2)` random available peers out of `n`.
    pub fn broadcast_random(&self, packet: Bytes, code: u32) {
        let mut peers = self.available();
        let count = ((peers.len() as f64).sqrt() as usize).max(2);

        if peers.len() > count {
            peers.shuffle(&mut thread_rng());
            peers.truncate(count);
        }

        for peer in peers {
            self.queue(&mut peer.lock(), packet.clone(), code, false);
        }
    }

    /// Sends the packet to every available peer whose identifier isn't in `skip`.
    pub fn broadcast_except(&self, packet: Bytes, code: u32, skip: &[NodeId]) {
        for peer in self.available() {
            let mut p = peer.lock();
            if !skip.contains(&p.id) {
                self.queue(&mut p, packet.clone(), code, false);
            }
        }
    }

    fn available(&self) -> Vec<Arc<Mutex<Peer>>> {
        let mut peers = self.snapshot();
        peers.retain(|peer| peer.lock().is_available(self.chain_id));

        peers
    }

    /// The identifiers of the connected, authenticated peers on our chain.
    pub fn available_peers(&self) -> Vec<NodeId> {
        self.available().iter().map(|peer| peer.lock().id).collect()
    }

    pub fn is_available(&self, id: &NodeId) -> bool {
        self.peer(id)
            .map_or(false, |peer| peer.lock().is_available(self.chain_id))
    }

    pub fn is_authenticated(&self, id: &NodeId) -> bool {
        self.peer(id)
            .map_or(false, |peer| peer.lock().is_authenticated())
    }

    /// The address of the peer, if we know one.
    pub fn peer_addr(&self, id: &NodeId) -> Option<SocketAddr> {
        self.peer(id).and_then(|peer| peer.lock().addr)
    }

    /// Tags the peer with the group, returns `false` if there is no such peer.
    pub fn add_group(&self, id: &NodeId, group_id: &str) -> bool {
        match self.peer(id) {
            Some(peer) => {
                peer.lock().add_group(group_id);
                true
            }
            None => false,
        }
    }

    /// Untags the peer, returns whether it's left without any group.
    pub fn remove_group(&self, id: &NodeId, group_id: &str) -> bool {
        match self.peer(id) {
            Some(peer) => {
                let mut p = peer.lock();
                p.remove_group(group_id);
                p.is_group_empty()
            }
            None => false,
        }
    }

    /// The connected peers with a known identifier and address.
    pub fn conn_info(&self) -> Vec<Conn> {
        self.snapshot()
            .iter()
            .filter_map(|peer| {
                let p = peer.lock();
                match (p.session, p.addr) {
                    (Some(_), Some(addr)) if p.id.is_valid() => Some(Conn {
                        id: p.id,
                        ip: addr.ip(),
                        port: addr.port(),
                    }),
                    _ => None,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Connect(u64, SocketAddr),
        Send(SessionId, Bytes),
        Shutdown(SessionId),
    }

    #[derive(Default)]
    struct MockTransport {
        calls: Mutex<Vec<Call>>,
    }

    impl MockTransport {
        fn take(&self) -> Vec<Call> {
            std::mem::take(&mut *self.calls.lock())
        }
    }

    impl Transport for MockTransport {
        fn listen(&self, addr: SocketAddr) -> io::Result<SocketAddr> {
            Ok(addr)
        }

        fn proxy(&self, _addr: SocketAddr) -> io::Result<()> {
            Ok(())
        }

        fn connect(&self, net_id: u64, addr: SocketAddr) {
            self.calls.lock().push(Call::Connect(net_id, addr));
        }

        fn send(&self, session: SessionId, data: Bytes) {
            self.calls.lock().push(Call::Send(session, data));
        }

        fn shutdown(&self, session: SessionId) {
            self.calls.lock().push(Call::Shutdown(session));
        }

        fn close(&self) {}
    }

    fn manager(max_peers: usize) -> (PeerManager, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::default());
        let manager = PeerManager::new(
            NodeId::rand(),
            0,
            max_peers,
            None,
            transport.clone(),
            Arc::new(BufferPool::new()),
            Arc::new(FlowMeter::new("test")),
        );

        (manager, transport)
    }

    fn authenticate(manager: &PeerManager, id: &NodeId) {
        let peer = manager.peer(id).unwrap();
        let mut p = peer.lock();
        p.verify_result = true;
        p.set_remote_verify_result(true);
    }

    const ADDR: &str = "127.0.0.1:1122";

    #[test]
    fn write_connects_then_flushes() {
        let (manager, transport) = manager(DEFAULT_MAX_PEERS);
        let id = NodeId::rand();
        let addr: SocketAddr = ADDR.parse().unwrap();

        let outcome = manager.write(id, Some(addr), Bytes::from_static(b"data"), 1, false);
        assert_eq!(outcome, WriteOutcome::Pending);
        assert_eq!(transport.take(), vec![Call::Connect(id.net_id(), addr)]);

        // A connect is in flight, no second one.
        manager.write(id, Some(addr), Bytes::from_static(b"more"), 1, false);
        assert!(transport.take().is_empty());

        assert_eq!(manager.on_connected(id.net_id(), 7, None), Some(id));
        manager.write_control(id, None, Bytes::from_static(b"ping"), 10001);
        assert_eq!(
            transport.take(),
            vec![Call::Send(7, Bytes::from_static(b"ping"))]
        );

        authenticate(&manager, &id);
        manager.flush(id.net_id());
        assert_eq!(
            transport.take(),
            vec![
                Call::Send(7, Bytes::from_static(b"data")),
                Call::Send(7, Bytes::from_static(b"more"))
            ]
        );
    }

    #[test]
    fn table_capacity() {
        let (manager, transport) = manager(2);

        let busy: Vec<_> = (0..2).map(|_| NodeId::rand()).collect();
        for (session, id) in busy.iter().enumerate() {
            manager.write(*id, None, Bytes::from_static(b"x"), 1, false);
            manager.on_connected(id.net_id(), session as SessionId + 1, None);
        }
        assert_eq!(manager.len(), 2);

        // Every peer holds a session, nothing can be evicted.
        let outcome = manager.write(NodeId::rand(), None, Bytes::from_static(b"x"), 1, false);
        assert_eq!(outcome, WriteOutcome::Dropped);
        assert_eq!(manager.on_connected(NodeId::rand().net_id(), 3, None), None);
        assert_eq!(transport.take(), vec![Call::Shutdown(3)]);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn idle_peers_make_room() {
        let (manager, _) = manager(2);
        let addr: SocketAddr = ADDR.parse().unwrap();

        // Unreachable, so neither connected nor connecting.
        let idle = NodeId::rand();
        manager.write(idle, None, Bytes::from_static(b"x"), 1, false);
        // A connect is in flight.
        let dialed = NodeId::rand();
        manager.write(dialed, Some(addr), Bytes::from_static(b"x"), 1, false);
        assert_eq!(manager.len(), 2);

        let newcomer = NodeId::rand();
        assert_eq!(manager.on_connected(newcomer.net_id(), 1, None), Some(NodeId::default()));
        assert_eq!(manager.len(), 2);
        assert!(manager.peer(&idle).is_none());
        assert!(manager.peer(&dialed).is_some());

        // Group members stay put as well.
        let (single, _) = self::manager(1);
        single.write(idle, None, Bytes::from_static(b"x"), 1, false);
        assert!(single.add_group(&idle, "g"));
        let outcome = single.write(newcomer, None, Bytes::from_static(b"x"), 1, false);
        assert_eq!(outcome, WriteOutcome::Dropped);
        assert!(single.peer(&idle).is_some());
    }

    #[test]
    fn authenticated_session_is_not_displaced() {
        let (manager, transport) = manager(DEFAULT_MAX_PEERS);
        let id = NodeId::rand();

        manager.write(id, None, Bytes::from_static(b"x"), 1, false);
        manager.on_connected(id.net_id(), 1, None);
        authenticate(&manager, &id);
        manager.flush(id.net_id());
        transport.take();

        // A second connection claiming the same network identifier.
        let addr = Some(ADDR.parse().unwrap());
        assert_eq!(manager.on_connected(id.net_id(), 2, addr), None);
        assert_eq!(transport.take(), vec![Call::Shutdown(2)]);

        let peer = manager.peer(&id).unwrap();
        assert_eq!(peer.lock().session, Some(1));
        assert!(manager.is_authenticated(&id));

        manager.write(id, None, Bytes::from_static(b"after"), 1, false);
        assert_eq!(
            transport.take(),
            vec![Call::Send(1, Bytes::from_static(b"after"))]
        );
    }

    #[test]
    fn unauthenticated_session_is_replaced() {
        let (manager, _) = manager(DEFAULT_MAX_PEERS);
        let id = NodeId::rand();

        manager.write(id, None, Bytes::from_static(b"x"), 1, false);
        manager.on_connected(id.net_id(), 1, None);
        assert_eq!(manager.on_connected(id.net_id(), 2, None), Some(id));
        assert_eq!(manager.peer(&id).unwrap().lock().session, Some(2));
    }

    #[test]
    fn data_is_read_from_the_current_session_only() {
        let (manager, _) = manager(DEFAULT_MAX_PEERS);
        let id = NodeId::rand();
        let frame = [0, 0, 0, 1, 0, 0, 0, 1, 0];

        assert!(manager.on_data(id.net_id(), 1, &frame).is_none());

        manager.write(id, None, Bytes::from_static(b"x"), 1, false);
        manager.on_connected(id.net_id(), 2, None);

        // Bytes from a session the peer no longer uses never reach its buffer.
        assert!(manager.on_data(id.net_id(), 1, &frame).is_none());
        let peer = manager.peer(&id).unwrap();
        assert!(matches!(
            peer.lock().decode_packet(manager.pool()),
            Err(NetworkError::PacketTooSmall)
        ));

        let peer = manager.on_data(id.net_id(), 2, &frame).unwrap();
        let raw = peer.lock().decode_packet(manager.pool()).unwrap();
        assert_eq!(raw.kind, 1);
    }

    #[test]
    fn invalid_and_self_are_dropped() {
        let (manager, transport) = manager(DEFAULT_MAX_PEERS);
        let addr = Some(ADDR.parse().unwrap());

        let packet = Bytes::from_static(b"x");
        assert_eq!(
            manager.write(NodeId::default(), addr, packet.clone(), 1, false),
            WriteOutcome::Dropped
        );
        assert_eq!(
            manager.write(manager.local_id, addr, packet, 1, false),
            WriteOutcome::Dropped
        );
        assert!(manager.is_empty());
        assert!(transport.take().is_empty());
    }

    #[test]
    fn relay_through_connected_peer() {
        let (manager, transport) = manager(DEFAULT_MAX_PEERS);
        let target = NodeId::rand();
        let relay = NodeId::rand();

        manager.write(relay, None, Bytes::from_static(b"hi"), 1, false);
        manager.on_connected(relay.net_id(), 3, None);
        authenticate(&manager, &relay);
        manager.flush(relay.net_id());
        transport.take();

        manager.write(target, None, Bytes::from_static(b"x"), 1, false);
        manager.set_relay(&target, relay);

        let outcome = manager.write(target, None, Bytes::from_static(b"via"), 1, true);
        assert_eq!(outcome, WriteOutcome::Relayed(relay));
        assert_eq!(
            transport.take(),
            vec![Call::Send(3, Bytes::from_static(b"via"))]
        );

        // Without the flag the packet waits for a direct connection.
        let outcome = manager.write(target, None, Bytes::from_static(b"direct"), 1, false);
        assert_eq!(outcome, WriteOutcome::Pending);
    }

    #[test]
    fn relay_test_conditions() {
        let (manager, _) = manager(DEFAULT_MAX_PEERS);
        let id = NodeId::rand();

        manager.write(id, None, Bytes::from_static(b"x"), 1, false);
        assert!(!manager.take_relay_test(&id));

        for session in 1..=2 {
            manager.on_connected(id.net_id(), session, None);
            manager.on_disconnected(id.net_id(), session, "test");
        }
        assert!(manager.take_relay_test(&id));
        // Not again within the test period.
        assert!(!manager.take_relay_test(&id));
    }

    #[test]
    fn accepted_peer_is_pinged_then_dropped() {
        let (manager, transport) = manager(DEFAULT_MAX_PEERS);
        let id = NodeId::rand();

        // Unknown identifier: nothing to ping yet.
        assert_eq!(
            manager.on_connected(id.net_id(), 1, Some(ADDR.parse().unwrap())),
            Some(NodeId::default())
        );
        assert!(manager.check_peers().is_empty());

        {
            let peer = manager.peer_by_net_id(id.net_id()).unwrap();
            let mut p = peer.lock();
            p.id = id;
        }
        assert_eq!(manager.check_peers(), vec![id]);

        {
            let peer = manager.peer(&id).unwrap();
            let mut p = peer.lock();
            p.connect_time = Some(Instant::now() - AUTH_TIMEOUT - Duration::from_secs(1));
        }
        assert!(manager.check_peers().is_empty());
        assert_eq!(transport.take(), vec![Call::Shutdown(1)]);
    }

    #[test]
    fn broadcast_reaches_available_peers_only() {
        let (manager, transport) = manager(DEFAULT_MAX_PEERS);
        let ids: Vec<_> = (0..4).map(|_| NodeId::rand()).collect();

        for (session, id) in ids.iter().enumerate() {
            manager.write_control(*id, None, Bytes::from_static(b"ping"), 10001);
            manager.on_connected(id.net_id(), session as SessionId + 1, None);
        }
        for id in &ids[..3] {
            authenticate(&manager, id);
        }
        transport.take();

        manager.broadcast(Bytes::from_static(b"all"), 10004);
        assert_eq!(transport.take().len(), 3);

        manager.broadcast_except(Bytes::from_static(b"some"), 10004, &ids[..1]);
        assert_eq!(transport.take().len(), 2);

        // sqrt(3) rounds down to 1, at least 2 are picked.
        manager.broadcast_random(Bytes::from_static(b"random"), 10004);
        assert_eq!(transport.take().len(), 2);

        let mut available = manager.available_peers();
        available.sort();
        let mut expected = ids[..3].to_vec();
        expected.sort();
        assert_eq!(available, expected);
    }

    #[test]
    fn groups_and_conn_info() {
        let (manager, _) = manager(DEFAULT_MAX_PEERS);
        let id = NodeId::rand();
        let addr: SocketAddr = ADDR.parse().unwrap();

        assert!(!manager.add_group(&id, "g"));
        manager.write(id, Some(addr), Bytes::from_static(b"x"), 1, false);
        assert!(manager.add_group(&id, "g"));
        assert!(manager.add_group(&id, "h"));
        assert!(!manager.remove_group(&id, "g"));
        assert!(manager.remove_group(&id, "h"));

        assert!(manager.conn_info().is_empty());
        manager.on_connected(id.net_id(), 1, None);
        assert_eq!(
            manager.conn_info(),
            vec![Conn {
                id,
                ip: addr.ip(),
                port: addr.port()
            }]
        );
    }
}
