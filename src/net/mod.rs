//! The network core: wires the transport, the peers, the routing table and the group overlays
//! together and exposes the messaging API.

use std::{
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::{atomic::AtomicUsize, Arc},
    time::Duration,
};

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use futures::FutureExt;
use parking_lot::RwLock;
use rand::{seq::SliceRandom, thread_rng};
use tokio::{
    runtime::Handle,
    sync::mpsc,
    time::{interval_at, sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    api::{Conn, Message, MessageHandler},
    codec::encode_packet,
    config::NetworkConfig,
    core::{
        buffer_pool::BufferPool,
        dedup::{BizMessageId, MessageManager},
        id::NodeId,
        message::{
            biz_message_id, encode_message_info, DataMessage, DataType, Packet, RelayTest,
        },
    },
    error::NetworkError,
    flow_meter::FlowMeter,
    group::{
        proposer::{GroupOp, Proposer, ProposerManager},
        GroupManager, GroupNetwork,
    },
    kad::Kad,
    peer::{auth, PeerManager, WriteOutcome},
    transport::{Transport, TransportEvent},
};

mod handler;
mod rpc;

use rpc::{PendingList, PendingOp, Rpc};
pub use rpc::{PING_INTERVAL, PROTOCOL_VERSION, RESP_TIMEOUT};

/// Packets expire this long after they're sent.
pub const EXPIRATION: Duration = Duration::from_secs(60);
/// Application deliveries in flight beyond this are dropped.
pub const MAX_UNHANDLED: usize = 10_000;

const CACHE_CLEAR_INTERVAL: Duration = Duration::from_secs(60);
const PEER_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const GROUP_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
const FLOW_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// The expiration timestamp for a packet sent now.
pub(crate) fn expiration() -> u64 {
    auth::unix_now() + EXPIRATION.as_secs()
}

pub(crate) fn expired(ts: u64) -> bool {
    auth::unix_now() > ts
}

/// A running network node.
pub struct NetCore {
    local_id: NodeId,
    chain_id: u16,
    protocol_version: u16,
    has_public_addr: bool,

    peers: Arc<PeerManager>,
    rpc: Arc<Rpc>,
    kad: Arc<Kad>,
    groups: GroupManager,
    proposers: RwLock<ProposerManager>,
    messages: MessageManager,
    flow_meter: Arc<FlowMeter>,

    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
    unhandled: Arc<AtomicUsize>,
    runtime: Handle,
    token: CancellationToken,
}

impl NetCore {
    /// Starts listening, loads the seeds and spawns the node's tasks. Must be called from within
    /// a tokio runtime.
    pub fn start(
        config: &NetworkConfig,
        key: SigningKey,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<Self>, NetworkError> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| NetworkError::Config(format!("no tokio runtime: {e}")))?;

        let local_id = auth::node_id_of(&key);
        let seeds = config.seeds()?;

        let bound = transport.listen(config.listen_addr)?;
        if let Some(nat_addr) = config.nat_addr {
            if let Err(e) = transport.proxy(nat_addr) {
                transport.close();
                return Err(e.into());
            }
        }
        let local_addr = config.public_addr.unwrap_or(bound);

        let flow_meter = Arc::new(FlowMeter::new("p2p"));
        let peers = Arc::new(PeerManager::new(
            local_id,
            config.chain_id,
            config.max_peers,
            config.nat_addr,
            Arc::clone(&transport),
            Arc::new(BufferPool::new()),
            Arc::clone(&flow_meter),
        ));

        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let rpc = Arc::new(Rpc::new(
            key,
            config.chain_id,
            local_addr,
            Arc::clone(&peers),
            pending_tx,
        ));

        let kad = match Kad::new(rpc.clone(), local_id, local_addr, seeds) {
            Ok(kad) => kad,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };

        let net = Arc::new(Self {
            local_id,
            chain_id: config.chain_id,
            protocol_version: config.protocol_version,
            has_public_addr: config.public_addr.is_some(),
            peers,
            rpc,
            kad,
            groups: GroupManager::new(local_id),
            proposers: RwLock::new(ProposerManager::new()),
            messages: MessageManager::new(local_id),
            flow_meter,
            transport,
            handler,
            unhandled: Arc::new(AtomicUsize::new(0)),
            runtime,
            token: CancellationToken::new(),
        });

        let (readable_tx, readable_rx) = mpsc::unbounded_channel();
        net.runtime
            .spawn(Arc::clone(&net).pump_events(events, readable_tx));
        net.runtime.spawn(Arc::clone(&net).decode_loop(readable_rx));
        net.runtime.spawn(Arc::clone(&net).run_loop(pending_rx));
        net.kad.spawn_maintenance(net.token.child_token());

        info!(id = %local_id, addr = %local_addr, chain_id = net.chain_id, "network started");
        Ok(net)
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// The address advertised to other nodes.
    pub fn local_addr(&self) -> SocketAddr {
        self.rpc.local_addr()
    }

    pub fn kad(&self) -> &Kad {
        &self.kad
    }

    pub fn flow_meter(&self) -> &FlowMeter {
        &self.flow_meter
    }

    /// Whether the node is connected, authenticated and on our chain.
    pub fn is_available(&self, id: &NodeId) -> bool {
        self.peers.is_available(id)
    }

    pub fn available_peers(&self) -> Vec<NodeId> {
        self.peers.available_peers()
    }

    /// The live connections.
    pub fn conn_info(&self) -> Vec<Conn> {
        self.peers.conn_info()
    }

    /// Stops every task and closes the transport.
    pub fn shutdown(&self) {
        info!(id = %self.local_id, "network shutting down");
        self.token.cancel();
        self.transport.close();
    }

    // Tasks.

    async fn pump_events(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        readable: mpsc::UnboundedSender<u64>,
    ) {
        loop {
            let event = tokio::select! {
                _ = self.token.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            self.on_event(event, &readable);
        }

        debug!("transport event pump stopped");
    }

    fn on_event(&self, event: TransportEvent, readable: &mpsc::UnboundedSender<u64>) {
        match event {
            TransportEvent::Connected { net_id, session } => {
                if let Some(id) = self.peers.on_connected(net_id, session, None) {
                    self.rpc.ping(id, None);
                }
            }
            TransportEvent::Accepted {
                net_id,
                session,
                addr,
            } => {
                // The identifier of an unknown peer comes with its first PING.
                if let Some(id) = self.peers.on_connected(net_id, session, Some(addr)) {
                    self.rpc.ping(id, None);
                }
            }
            TransportEvent::Disconnected {
                net_id,
                session,
                reason,
            } => self.peers.on_disconnected(net_id, session, &reason),
            TransportEvent::SendQueueDrained { net_id, .. } => self.peers.on_send_waited(net_id),
            TransportEvent::DataReceived {
                net_id,
                session,
                data,
            } => {
                if self.peers.on_data(net_id, session, &data).is_some() {
                    let _ = readable.send(net_id);
                }
            }
            TransportEvent::NatTypeChecked {
                nat_type,
                public_addr,
            } => {
                info!(nat_type, %public_addr, "NAT type checked");
                if !self.has_public_addr {
                    self.rpc.set_local_addr(public_addr);
                }
            }
        }
    }

    async fn decode_loop(self: Arc<Self>, mut readable: mpsc::UnboundedReceiver<u64>) {
        loop {
            let net_id = tokio::select! {
                _ = self.token.cancelled() => break,
                net_id = readable.recv() => match net_id {
                    Some(net_id) => net_id,
                    None => break,
                },
            };

            let Some(peer) = self.peers.peer_by_net_id(net_id) else {
                continue;
            };

            loop {
                let raw = peer.lock().decode_packet(self.peers.pool());
                match raw {
                    Ok(raw) => {
                        // A single packet never takes the loop down for every other peer.
                        match AssertUnwindSafe(self.handle_packet(net_id, raw))
                            .catch_unwind()
                            .await
                        {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => debug!(net_id, "packet dropped: {e}"),
                            Err(_) => warn!(net_id, "packet handler panicked, packet dropped"),
                        }
                    }
                    Err(NetworkError::PacketTooSmall) => break,
                    Err(e) => {
                        warn!(net_id, "{e}, receive buffer reset");
                        break;
                    }
                }
            }
        }

        debug!("decode loop stopped");
    }

    /// Matches replies to pending requests and drives the periodic housekeeping.
    async fn run_loop(self: Arc<Self>, mut ops: mpsc::UnboundedReceiver<PendingOp>) {
        let mut pending = PendingList::default();

        let start = Instant::now();
        let mut cache_clear = interval_at(start + CACHE_CLEAR_INTERVAL, CACHE_CLEAR_INTERVAL);
        let mut peer_check = interval_at(start + PEER_CHECK_INTERVAL, PEER_CHECK_INTERVAL);
        let mut group_refresh = interval_at(start + GROUP_REFRESH_INTERVAL, GROUP_REFRESH_INTERVAL);
        let mut flow_report = interval_at(start + FLOW_REPORT_INTERVAL, FLOW_REPORT_INTERVAL);

        loop {
            let next_deadline = pending.next_deadline();
            let timeout = async move {
                match next_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.token.cancelled() => break,
                Some(op) = ops.recv() => pending.apply(op),
                _ = timeout => pending.expire(Instant::now()),
                _ = cache_clear.tick() => self.messages.clear(),
                _ = peer_check.tick() => self.check_peers(),
                _ = group_refresh.tick() => self.groups.do_refresh(&*self),
                _ = flow_report.tick() => {
                    self.flow_meter.print();
                    self.flow_meter.reset();
                }
            }
        }

        pending.close();
        debug!("rpc loop stopped");
    }

    fn check_peers(&self) {
        for id in self.peers.check_peers() {
            self.rpc.ping(id, None);
        }
    }

    // Sending.

    fn locate(&self, id: &NodeId) -> Option<SocketAddr> {
        self.peers
            .peer_addr(id)
            .or_else(|| self.kad.find(id).map(|node| node.addr))
    }

    /// Looks the node up in the DHT and dials it once found.
    fn resolve_node(&self, id: NodeId) {
        let kad = Arc::clone(&self.kad);
        let rpc = Arc::clone(&self.rpc);
        let peers = Arc::clone(&self.peers);

        self.runtime.spawn(async move {
            match kad.resolve(id).await {
                Some(node) => {
                    debug!(peer = %id, addr = %node.addr, "resolved");
                    peers.dial(&id, node.addr);
                    rpc.ping(id, Some(node.addr));
                }
                None => debug!(peer = %id, "couldn't resolve"),
            }
        });
    }

    // Sends a data packet, through a relay if the node can't be reached directly.
    fn write_data(&self, id: NodeId, addr: Option<SocketAddr>, packet: Bytes, code: u32) {
        let addr = addr.or_else(|| self.locate(&id));

        match self.peers.write(id, addr, packet, code, true) {
            WriteOutcome::Pending => {
                if addr.is_none() {
                    self.resolve_node(id);
                }
                if self.peers.take_relay_test(&id) {
                    self.relay_test(id);
                }
            }
            WriteOutcome::Dropped => debug!(peer = %id, code, "data dropped"),
            WriteOutcome::Sent | WriteOutcome::Relayed(_) => {}
        }
    }

    /// Asks every available peer whether it's connected to `target`.
    fn relay_test(&self, target: NodeId) {
        debug!(peer = %target, "relay test");
        let packet = Packet::RelayTest(RelayTest {
            target,
            expiration: expiration(),
        });

        for id in self.peers.available_peers() {
            self.rpc.write_control(id, None, &packet);
        }
    }

    fn new_data(
        &self,
        msg: &Message,
        data_type: DataType,
        group_id: &str,
        dest_node_id: Option<NodeId>,
        biz_message_id: Option<BizMessageId>,
        relay_count: i32,
    ) -> Result<DataMessage, NetworkError> {
        Ok(DataMessage {
            data: msg.encode()?,
            data_type,
            group_id: group_id.to_owned(),
            message_id: self.messages.gen_message_id(),
            message_code: msg.code,
            dest_node_id,
            src_node_id: self.local_id,
            biz_message_id,
            relay_count,
            message_info: encode_message_info(self.chain_id, self.protocol_version),
            expiration: expiration(),
        })
    }

    fn encode_data(data: DataMessage) -> Result<Bytes, NetworkError> {
        encode_packet(&Packet::Data(data))
    }

    /// Sends the message to one node. Messages to ourselves are delivered locally.
    pub fn send(&self, id: NodeId, msg: Message) -> Result<(), NetworkError> {
        if !id.is_valid() {
            return Err(NetworkError::InvalidNodeId(id.to_hex()));
        }

        let data = self.new_data(&msg, DataType::Normal, "", Some(id), None, 0)?;
        if id == self.local_id {
            self.deliver(self.local_id, &data);
            return Ok(());
        }

        trace!(peer = %id, code = msg.code, "send");
        self.write_data(id, None, Self::encode_data(data)?, msg.code);

        Ok(())
    }

    /// Sends directly if the node is available, otherwise floods the message through the group
    /// so that it reaches the node over the overlay.
    pub fn send_with_group_relay(
        &self,
        id: NodeId,
        group_id: &str,
        msg: Message,
    ) -> Result<(), NetworkError> {
        if id == self.local_id || self.peers.is_available(&id) {
            return self.send(id, msg);
        }

        debug!(peer = %id, group = group_id, code = msg.code, "sending through the group");
        let data = self.new_data(&msg, DataType::Group, group_id, Some(id), None, -1)?;
        let members = self.groups.members(group_id).unwrap_or_default();
        self.groups
            .broadcast(self, group_id, Self::encode_data(data)?, msg.code, &members);

        Ok(())
    }

    /// Sends the message to random members of a group we're part of, who pass it on the same way.
    pub fn random_spread_in_group(&self, group_id: &str, msg: Message) -> Result<(), NetworkError> {
        let data = self.new_data(&msg, DataType::GroupRandom, group_id, None, None, -1)?;
        self.groups
            .broadcast_random(self, group_id, Self::encode_data(data)?, msg.code)
    }

    /// Floods the message along the overlay of a group we're part of.
    pub fn spread_among_group(&self, group_id: &str, msg: Message) -> Result<(), NetworkError> {
        if !self.groups.contains(group_id) {
            return Err(NetworkError::NotGroupMember(group_id.to_owned()));
        }

        let data = self.new_data(&msg, DataType::Group, group_id, None, None, -1)?;
        self.groups
            .broadcast(self, group_id, Self::encode_data(data)?, msg.code, &[]);

        Ok(())
    }

    /// Sends the message to one random member, preferring one we're connected to.
    pub fn spread_to_random_group_member(
        &self,
        group_id: &str,
        members: &[NodeId],
        msg: Message,
    ) -> Result<(), NetworkError> {
        let candidates: Vec<_> = members
            .iter()
            .filter(|id| id.is_valid() && **id != self.local_id)
            .copied()
            .collect();

        let mut rng = thread_rng();
        let available: Vec<_> = candidates
            .iter()
            .filter(|id| self.peers.is_available(id))
            .copied()
            .collect();

        let Some(id) = available
            .choose(&mut rng)
            .or_else(|| candidates.choose(&mut rng))
            .copied()
        else {
            debug!(group = group_id, "no member to send to");
            return Ok(());
        };

        trace!(peer = %id, group = group_id, "spread to random member");
        self.send(id, msg)
    }

    /// Floods the message through the group, entering it via a few members if we're not part of
    /// it. Copies with the same digest are delivered once.
    pub fn spread_to_group(
        &self,
        group_id: &str,
        members: &[NodeId],
        msg: Message,
        digest: &[u8],
    ) -> Result<(), NetworkError> {
        let biz_id = biz_message_id(digest);
        self.messages.handle_biz(biz_id);
        self.messages.forward_biz(biz_id);

        let data = self.new_data(&msg, DataType::Group, group_id, None, Some(biz_id), -1)?;
        self.groups
            .broadcast(self, group_id, Self::encode_data(data)?, msg.code, members);

        Ok(())
    }

    /// Sends the message to every available peer outside the blacklist, without relaying.
    pub fn transmit_to_neighbor(
        &self,
        msg: Message,
        blacklist: &[NodeId],
    ) -> Result<(), NetworkError> {
        let data = self.new_data(&msg, DataType::Normal, "", None, None, 0)?;
        self.peers
            .broadcast_except(Self::encode_data(data)?, msg.code, blacklist);

        Ok(())
    }

    /// Floods the message for `relay_count` hops, without limit when negative.
    pub fn relay(&self, msg: Message, relay_count: i32) -> Result<(), NetworkError> {
        let data = self.new_data(&msg, DataType::Global, "", None, None, relay_count)?;
        self.peers.broadcast(Self::encode_data(data)?, msg.code);

        Ok(())
    }

    /// Floods the message to the whole network.
    pub fn broadcast(&self, msg: Message) -> Result<(), NetworkError> {
        self.relay(msg, -1)
    }

    // Groups.

    /// Builds, or rebuilds, the overlay of a group we're part of.
    pub fn build_group_net(&self, group_id: &str, members: Vec<NodeId>) -> Result<(), NetworkError> {
        self.groups.build_group(self, group_id, members)
    }

    /// Tears down the overlay of a group, returns whether it existed.
    pub fn dissolve_group_net(&self, group_id: &str) -> bool {
        self.groups.remove_group(self, group_id)
    }

    pub fn group_members(&self, group_id: &str) -> Option<Vec<NodeId>> {
        self.groups.members(group_id)
    }

    /// Splits the proposers by stake and builds the overlays of the proposer groups.
    pub fn build_proposer_group_net(&self, proposers: Vec<Proposer>) {
        let ops = self.proposers.write().build(proposers);
        self.apply_group_ops(ops);
    }

    /// Adds proposers to the existing proposer groups.
    pub fn add_proposers(&self, proposers: Vec<Proposer>) {
        let ops = self.proposers.write().add_proposers(proposers);
        self.apply_group_ops(ops);
    }

    fn apply_group_ops(&self, ops: Vec<GroupOp>) {
        for op in ops {
            match op {
                GroupOp::Build { id, members } => {
                    match self.groups.build_group(self, &id, members) {
                        Ok(()) => {}
                        // We dropped out of the group.
                        Err(NetworkError::NotGroupMember(_)) => {
                            if self.groups.contains(&id) {
                                self.groups.remove_group(self, &id);
                            }
                        }
                        Err(e) => warn!(group = %id, "failed to build group: {e}"),
                    }
                }
                GroupOp::Remove(id) => {
                    self.groups.remove_group(self, &id);
                }
            }
        }
    }

    /// Tops up the connections to fast proposers: if fewer than `min_connected` are available,
    /// the message goes to random unconnected ones to make up the difference.
    pub fn send_to_unconnected_proposers(
        &self,
        msg: Message,
        min_connected: usize,
    ) -> Result<(), NetworkError> {
        let fast: Vec<_> = self
            .proposers
            .read()
            .fast()
            .proposers()
            .iter()
            .map(|p| p.id)
            .filter(|id| *id != self.local_id)
            .collect();

        let (connected, mut unconnected): (Vec<_>, Vec<_>) =
            fast.into_iter().partition(|id| self.peers.is_available(id));
        if connected.len() >= min_connected {
            return Ok(());
        }

        unconnected.shuffle(&mut thread_rng());
        unconnected.truncate(min_connected - connected.len());
        debug!(
            connected = connected.len(),
            sending = unconnected.len(),
            "sending to unconnected proposers"
        );

        for id in unconnected {
            self.send(id, msg.clone())?;
        }

        Ok(())
    }
}

impl GroupNetwork for NetCore {
    fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn is_available(&self, id: &NodeId) -> bool {
        self.peers.is_available(id)
    }

    fn is_authenticated(&self, id: &NodeId) -> bool {
        self.peers.is_authenticated(id)
    }

    fn add_peer_group(&self, id: &NodeId, group_id: &str) {
        self.peers.add_group(id, group_id);
    }

    fn remove_peer_group(&self, id: &NodeId, group_id: &str) -> bool {
        self.peers.remove_group(id, group_id)
    }

    fn peer_addr(&self, id: &NodeId) -> Option<SocketAddr> {
        self.peers.peer_addr(id)
    }

    fn kad_addr(&self, id: &NodeId) -> Option<SocketAddr> {
        self.kad.find(id).map(|node| node.addr)
    }

    fn ping(&self, id: NodeId, addr: Option<SocketAddr>) {
        self.rpc.ping(id, addr);
    }

    fn resolve(&self, id: NodeId) {
        self.resolve_node(id);
    }

    fn write(&self, id: NodeId, addr: Option<SocketAddr>, packet: Bytes, code: u32) {
        self.write_data(id, addr, packet, code);
    }

    fn broadcast_to_proposers(&self, packet: Bytes, code: u32) {
        let groups = self.proposers.read().groups();
        for (group_id, members) in groups {
            self.groups
                .broadcast(self, &group_id, packet.clone(), code, &members);
        }
    }
}
