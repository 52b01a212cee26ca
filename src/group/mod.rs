//! Overlay networks for group broadcast.
//!
//! The members of a group form a ring ordered by identifier. Each member links to its successor,
//! and in larger groups to the member after that plus a few accelerate nodes spread around the
//! ring, so a flood along the links reaches every member in few hops.

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::Bytes;
use rand::{
    seq::{IteratorRandom, SliceRandom},
    thread_rng,
};
use tracing::{debug, trace};

use crate::core::id::NodeId;

mod manager;
pub mod proposer;

pub use manager::{GroupManager, FULL_NODE_VIRTUAL_GROUP_ID};

/// A member missing from the routing table is looked up at most this often.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(3 * 60);
/// Share of `sqrt(N)` used as the number of long links.
const ACCELERATE_RATIO: f64 = 0.8;
/// Groups smaller than this only link to their successor.
const MIN_ACCELERATED_SIZE: usize = 5;

/// What the overlay needs from the rest of the network.
pub trait GroupNetwork {
    fn local_id(&self) -> NodeId;

    /// Connected, authenticated and on our chain.
    fn is_available(&self, id: &NodeId) -> bool;

    /// Connected and authenticated.
    fn is_authenticated(&self, id: &NodeId) -> bool;

    /// Tags the peer with the group.
    fn add_peer_group(&self, id: &NodeId, group_id: &str);

    /// Untags the peer, returns whether it's left without any group.
    fn remove_peer_group(&self, id: &NodeId, group_id: &str) -> bool;

    /// The address of the peer, if connected or connecting.
    fn peer_addr(&self, id: &NodeId) -> Option<SocketAddr>;

    /// The address of the node in the routing table.
    fn kad_addr(&self, id: &NodeId) -> Option<SocketAddr>;

    fn ping(&self, id: NodeId, addr: Option<SocketAddr>);

    /// Starts a DHT lookup for the node.
    fn resolve(&self, id: NodeId);

    /// Sends an encoded data packet.
    fn write(&self, id: NodeId, addr: Option<SocketAddr>, packet: Bytes, code: u32);

    /// Floods the packet through every proposer group.
    fn broadcast_to_proposers(&self, packet: Bytes, code: u32);
}

/// Sends the packet to each node through its peer address, its routing table address or,
/// lacking both, by identifier alone.
pub fn send_to(net: &dyn GroupNetwork, nodes: &[NodeId], packet: &Bytes, code: u32) {
    let local_id = net.local_id();

    for id in nodes.iter().filter(|id| **id != local_id) {
        let addr = net.peer_addr(id).or_else(|| net.kad_addr(id));
        if addr.is_none() {
            trace!(peer = %id, "sending without a known address");
        }

        net.write(*id, addr, packet.clone(), code);
    }
}

/// Picks the members that receive a message for a group we aren't part of: an available member
/// if there is one, topped up with random members to `max(ceil(ceil(sqrt(N)) / 2), 1)`.
pub fn entrance_nodes(net: &dyn GroupNetwork, members: &[NodeId]) -> Vec<NodeId> {
    let local_id = net.local_id();
    let mut candidates: Vec<_> = members
        .iter()
        .filter(|id| id.is_valid() && **id != local_id)
        .copied()
        .collect();
    candidates.sort();
    candidates.dedup();

    let max = (((members.len() as f64).sqrt().ceil() / 2.0).ceil() as usize).max(1);
    let mut rng = thread_rng();
    let mut nodes = Vec::with_capacity(max);

    if let Some(id) = candidates
        .iter()
        .filter(|id| net.is_available(id))
        .choose(&mut rng)
    {
        nodes.push(*id);
    }

    candidates.shuffle(&mut rng);
    for id in candidates {
        if nodes.len() >= max {
            break;
        }

        if !nodes.contains(&id) {
            nodes.push(id);
        }
    }

    nodes
}

/// The local node's view of one group.
#[derive(Debug)]
pub struct Group {
    id: String,
    // Sorted, without duplicates.
    members: Vec<NodeId>,
    need_connect: Vec<NodeId>,
    cur_index: usize,
    resolving: HashMap<NodeId, Instant>,
}

impl Group {
    pub fn new(id: impl Into<String>, members: Vec<NodeId>, local_id: &NodeId) -> Self {
        let mut group = Self {
            id: id.into(),
            members: Vec::new(),
            need_connect: Vec::new(),
            cur_index: 0,
            resolving: HashMap::new(),
        };
        group.rebuild(members, local_id);

        group
    }

    /// Replaces the membership and recomputes the links.
    pub fn rebuild(&mut self, mut members: Vec<NodeId>, local_id: &NodeId) {
        members.sort();
        members.dedup();
        self.members = members;
        self.gen_connect_nodes(local_id);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// The members the local node keeps links to.
    pub fn need_connect_nodes(&self) -> &[NodeId] {
        &self.need_connect
    }

    /// The position of the local node in the ring.
    pub fn cur_index(&self) -> usize {
        self.cur_index
    }

    pub fn is_member(&self, id: &NodeId) -> bool {
        self.members.binary_search(id).is_ok()
    }

    fn gen_connect_nodes(&mut self, local_id: &NodeId) {
        self.need_connect.clear();

        let n = self.members.len();
        if n == 0 {
            return;
        }

        self.cur_index = self.members.binary_search(local_id).unwrap_or(0);
        let cur = self.cur_index;

        self.link(cur + 1, local_id);
        if n < MIN_ACCELERATED_SIZE {
            return;
        }

        self.link(cur + 2, local_id);

        let long_links = ((n as f64).sqrt() * ACCELERATE_RATIO).floor() as usize;
        let step = n / long_links.max(1);
        for i in 1..=long_links.saturating_sub(2) {
            self.link(cur + i * step, local_id);
        }

        debug!(
            group = %self.id,
            members = n,
            links = self.need_connect.len(),
            "group links generated"
        );
    }

    fn link(&mut self, index: usize, local_id: &NodeId) {
        let id = self.members[index % self.members.len()];
        if id != *local_id && !self.need_connect.contains(&id) {
            self.need_connect.push(id);
        }
    }

    /// Makes sure every link is up: connected ones are tagged with the group, the others are
    /// pinged, located through the routing table or the DHT.
    pub fn do_refresh(&mut self, net: &dyn GroupNetwork) {
        let local_id = net.local_id();

        for id in self.need_connect.clone() {
            if id == local_id {
                continue;
            }

            if net.is_authenticated(&id) {
                net.add_peer_group(&id, &self.id);
                continue;
            }

            match net.kad_addr(&id) {
                Some(addr) => net.ping(id, Some(addr)),
                None => {
                    net.ping(id, None);
                    self.resolve(net, id);
                }
            }
        }
    }

    fn resolve(&mut self, net: &dyn GroupNetwork, id: NodeId) {
        let now = Instant::now();
        if let Some(at) = self.resolving.get(&id) {
            if now.duration_since(*at) < RESOLVE_TIMEOUT {
                return;
            }
        }

        debug!(group = %self.id, peer = %id, "resolving group member");
        self.resolving.insert(id, now);
        net.resolve(id);
    }

    /// Detaches the group from the linked peers. Returns the peers left without any group.
    pub fn on_remove(&self, net: &dyn GroupNetwork) -> Vec<NodeId> {
        let local_id = net.local_id();

        self.need_connect
            .iter()
            .filter(|id| **id != local_id)
            .filter(|id| net.remove_peer_group(id, &self.id))
            .copied()
            .collect()
    }

    /// Sends the packet along the local node's links.
    pub fn broadcast(&self, net: &dyn GroupNetwork, packet: &Bytes, code: u32) {
        trace!(group = %self.id, links = self.need_connect.len(), code, "group broadcast");
        send_to(net, &self.need_connect, packet, code);
    }

    /// Sends the packet to `max(sqrt(N), 2)` random members.
    pub fn broadcast_random(&self, net: &dyn GroupNetwork, packet: &Bytes, code: u32) {
        let local_id = net.local_id();
        let count = ((self.members.len() as f64).sqrt() as usize).max(2);

        let nodes: Vec<_> = self
            .members
            .iter()
            .filter(|id| **id != local_id)
            .copied()
            .choose_multiple(&mut thread_rng(), count);

        trace!(group = %self.id, nodes = nodes.len(), code, "random group broadcast");
        send_to(net, &nodes, packet, code);
    }
}
