use std::net::SocketAddr;

use time::OffsetDateTime;

use crate::core::{
    id::{KeyHash, NodeId},
    node::Node,
};

/// Concurrency limit of a lookup.
pub const ALPHA: usize = 3;
/// The maximum number of active entries in a bucket.
pub const BUCKET_SIZE: usize = 16;
/// The maximum number of replacement entries in a bucket.
pub const MAX_REPLACEMENTS: usize = 10;
/// Consecutive failed queries after which an entry is dropped from its bucket.
pub const MAX_FAILS: u32 = 5;

const HASH_BITS: u32 = 256;
/// The number of buckets.
pub const N_BUCKETS: usize = (HASH_BITS / 15) as usize;
// Log distances up to this value all share bucket 0.
const BUCKET_MIN_DISTANCE: u32 = HASH_BITS - N_BUCKETS as u32;

#[derive(Debug, Clone, Default)]
pub(crate) struct Bucket {
    // Most recently seen first.
    pub(crate) entries: Vec<Node>,
    // Most recently seen first.
    pub(crate) replacements: Vec<Node>,
}

impl Bucket {
    // Moves an existing entry to the front, refreshing its address.
    fn bump(&mut self, node: &Node) -> bool {
        match self.entries.iter().position(|e| e.id == node.id) {
            Some(i) => {
                let mut entry = self.entries.remove(i);
                entry.addr = node.addr;
                self.entries.insert(0, entry);
                true
            }
            None => false,
        }
    }
}

// Pushes to the front, the last element falls off when the list is full.
fn push_node(list: &mut Vec<Node>, node: Node, max: usize) -> Option<Node> {
    list.insert(0, node);
    if list.len() > max {
        list.pop()
    } else {
        None
    }
}

fn delete_node(list: &mut Vec<Node>, id: &NodeId) -> Option<Node> {
    list.iter()
        .position(|e| &e.id == id)
        .map(|i| list.remove(i))
}

/// Entries sorted by distance to a target, capped at a maximum length.
#[derive(Debug, Clone)]
pub struct NodesByDistance {
    pub entries: Vec<Node>,
    target: KeyHash,
}

impl NodesByDistance {
    pub fn new(target: KeyHash) -> Self {
        Self {
            entries: Vec::new(),
            target,
        }
    }

    /// Inserts the node at its distance rank, after any entries at the same distance. The
    /// furthest entry falls off when the list already holds `max` entries.
    pub fn push(&mut self, node: Node, max: usize) {
        let ix = self
            .entries
            .partition_point(|e| self.target.distance_cmp(&e.sha, &node.sha).is_le());

        if ix < max {
            self.entries.insert(ix, node);
            self.entries.truncate(max);
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }
}

/// The core routing table data structure.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    // The local node, never stored in a bucket.
    local: Node,
    // Indexed by log distance range, see `bucket_index`.
    pub(crate) buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, local_addr: SocketAddr) -> Self {
        Self {
            local: Node::new(local_id, local_addr),
            buckets: vec![Bucket::default(); N_BUCKETS],
        }
    }

    /// Returns this table's local identifier.
    pub fn local_id(&self) -> NodeId {
        self.local.id
    }

    pub fn local(&self) -> &Node {
        &self.local
    }

    fn bucket_index(&self, sha: &KeyHash) -> usize {
        let d = self.local.sha.log_distance(sha);
        if d <= BUCKET_MIN_DISTANCE {
            0
        } else {
            (d - BUCKET_MIN_DISTANCE - 1) as usize
        }
    }

    /// Records a sighting of the node: bumps it if active, inserts it if its bucket has room,
    /// otherwise keeps it as a replacement. Returns `true` if the node is active afterwards.
    pub fn add(&mut self, node: Node) -> bool {
        if node.id == self.local.id || !node.id.is_valid() {
            return false;
        }

        let i = self.bucket_index(&node.sha);
        let bucket = &mut self.buckets[i];

        if bucket.bump(&node) {
            return true;
        }

        if bucket.entries.len() < BUCKET_SIZE {
            delete_node(&mut bucket.replacements, &node.id);
            let mut node = node;
            node.added_at = Some(OffsetDateTime::now_utc());
            push_node(&mut bucket.entries, node, BUCKET_SIZE);
            return true;
        }

        // Active entries are never evicted to make room, the sighting goes to the replacements.
        if !bucket.replacements.iter().any(|e| e.id == node.id) {
            push_node(&mut bucket.replacements, node, MAX_REPLACEMENTS);
        }

        false
    }

    /// Removes the node from its bucket, promoting the most recently seen replacement.
    pub fn delete(&mut self, id: &NodeId) -> Option<Node> {
        let i = self.bucket_index(&id.sha());
        let bucket = &mut self.buckets[i];

        let removed = delete_node(&mut bucket.entries, id);
        if removed.is_some() && !bucket.replacements.is_empty() {
            let mut promoted = bucket.replacements.remove(0);
            promoted.added_at = Some(OffsetDateTime::now_utc());
            bucket.entries.push(promoted);
        }

        removed
    }

    /// Returns the `n` active entries closest to the target.
    pub fn closest(&self, target: KeyHash, n: usize) -> NodesByDistance {
        let mut closest = NodesByDistance::new(target);
        for bucket in &self.buckets {
            for node in &bucket.entries {
                closest.push(node.clone(), n);
            }
        }

        closest
    }

    /// Returns the active entry for the identifier, if there is one.
    pub fn find(&self, id: &NodeId) -> Option<&Node> {
        let i = self.bucket_index(&id.sha());
        self.buckets[i].entries.iter().find(|e| &e.id == id)
    }

    pub(crate) fn find_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        let i = self.bucket_index(&id.sha());
        self.buckets[i].entries.iter_mut().find(|e| &e.id == id)
    }

    /// Counts a failed query against the node, dropping it after [`MAX_FAILS`] in a row.
    /// Returns `true` if the node was dropped.
    pub fn record_failure(&mut self, id: &NodeId) -> bool {
        let fails = match self.find_mut(id) {
            Some(node) => {
                node.fails += 1;
                node.fails
            }
            None => return false,
        };

        if fails >= MAX_FAILS {
            self.delete(id);
            return true;
        }

        false
    }

    /// Resets the failure count after a successful query.
    pub fn record_success(&mut self, id: &NodeId) {
        if let Some(node) = self.find_mut(id) {
            node.fails = 0;
        }
    }

    /// The number of active entries.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every active entry, nearest buckets first.
    pub fn nodes(&self) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Produces a local address from the supplied port.
    fn localhost_with_port(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn table() -> RoutingTable {
        RoutingTable::new(NodeId::rand(), localhost_with_port(1))
    }

    // Random nodes that all land in the same bucket of `table`.
    fn nodes_in_bucket(table: &RoutingTable, bucket: usize, n: usize) -> Vec<Node> {
        let mut nodes = vec![];
        while nodes.len() < n {
            let node = Node::new(NodeId::rand(), localhost_with_port(2000));
            if table.bucket_index(&node.sha) == bucket {
                nodes.push(node);
            }
        }

        nodes
    }

    #[test]
    fn bucket_index_range() {
        let table = table();
        // Half of all random hashes differ in the first bit.
        let mut seen_top = false;
        for _ in 0..100 {
            let i = table.bucket_index(&NodeId::rand().sha());
            assert!(i < N_BUCKETS);
            seen_top |= i == N_BUCKETS - 1;
        }
        assert!(seen_top);

        assert_eq!(table.bucket_index(&table.local.sha), 0);
    }

    #[test]
    fn add_rejects_self_and_invalid() {
        let mut table = table();
        let local = table.local.clone();

        assert!(!table.add(local));
        assert!(!table.add(Node::new(NodeId::default(), localhost_with_port(2))));
        assert!(table.is_empty());
    }

    #[test]
    fn add_bumps_to_front() {
        let mut table = table();
        let nodes = nodes_in_bucket(&table, N_BUCKETS - 1, 3);

        for node in &nodes {
            assert!(table.add(node.clone()));
        }
        assert_eq!(table.buckets[N_BUCKETS - 1].entries[0].id, nodes[2].id);

        assert!(table.add(nodes[0].clone()));
        let entries = &table.buckets[N_BUCKETS - 1].entries;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].id, nodes[0].id);
        assert_eq!(entries[1].id, nodes[2].id);
        assert_eq!(entries[2].id, nodes[1].id);
    }

    #[test]
    fn bucket_capacity() {
        let mut table = table();
        let nodes = nodes_in_bucket(&table, N_BUCKETS - 1, BUCKET_SIZE + MAX_REPLACEMENTS + 5);

        for (i, node) in nodes.iter().enumerate() {
            assert_eq!(table.add(node.clone()), i < BUCKET_SIZE);
        }

        let bucket = &table.buckets[N_BUCKETS - 1];
        assert_eq!(bucket.entries.len(), BUCKET_SIZE);
        assert_eq!(bucket.replacements.len(), MAX_REPLACEMENTS);
        // The first nodes stay active, the newest replacements are kept.
        assert!(bucket.entries.iter().any(|e| e.id == nodes[0].id));
        assert_eq!(bucket.replacements[0].id, nodes.last().unwrap().id);
        assert!(!bucket
            .replacements
            .iter()
            .any(|e| e.id == nodes[BUCKET_SIZE].id));
    }

    #[test]
    fn replacements_are_not_duplicated() {
        let mut table = table();
        let nodes = nodes_in_bucket(&table, N_BUCKETS - 1, BUCKET_SIZE + 1);

        for node in &nodes {
            table.add(node.clone());
        }
        table.add(nodes[BUCKET_SIZE].clone());

        assert_eq!(table.buckets[N_BUCKETS - 1].replacements.len(), 1);
    }

    #[test]
    fn entries_and_replacements_are_exclusive() {
        let mut table = table();
        let nodes = nodes_in_bucket(&table, N_BUCKETS - 1, BUCKET_SIZE + 1);

        for node in &nodes {
            table.add(node.clone());
        }
        let spare = nodes[BUCKET_SIZE].id;
        assert!(table.find(&spare).is_none());

        // Deleting an active entry promotes the replacement.
        assert!(table.delete(&nodes[0].id).is_some());
        let bucket = &table.buckets[N_BUCKETS - 1];
        assert!(bucket.replacements.is_empty());
        assert!(table.find(&spare).is_some());
    }

    #[test]
    fn record_failure_drops_after_max_fails() {
        let mut table = table();
        let node = Node::new(NodeId::rand(), localhost_with_port(2));
        let id = node.id;
        table.add(node);

        for _ in 0..MAX_FAILS - 1 {
            assert!(!table.record_failure(&id));
        }
        table.record_success(&id);
        assert_eq!(table.find(&id).unwrap().fails, 0);

        for _ in 0..MAX_FAILS - 1 {
            assert!(!table.record_failure(&id));
        }
        assert!(table.record_failure(&id));
        assert!(table.find(&id).is_none());
    }

    #[test]
    fn closest_is_sorted() {
        let mut table = table();
        for i in 0..50 {
            table.add(Node::new(NodeId::rand(), localhost_with_port(2000 + i)));
        }

        let target = NodeId::rand().sha();
        let closest = table.closest(target, BUCKET_SIZE);
        assert_eq!(closest.entries.len(), BUCKET_SIZE.min(table.len()));

        for pair in closest.entries.windows(2) {
            assert!(target.distance_cmp(&pair[0].sha, &pair[1].sha).is_le());
        }
    }

    #[test]
    fn push_keeps_insertion_order_for_ties() {
        // Distances [3, 1, 4, 1, 5] from the target.
        let target = KeyHash::of(b"target");
        let at_distance = |d: u8, tag: u16| {
            let mut node = Node::new(NodeId::from_u16(tag), localhost_with_port(tag));
            let mut sha = *target.as_bytes();
            sha[31] ^= d;
            node.sha = KeyHash::from_bytes(sha);
            node
        };

        let mut closest = NodesByDistance::new(target);
        for (tag, d) in [3u8, 1, 4, 1, 5].into_iter().enumerate() {
            closest.push(at_distance(d, tag as u16 + 1), 3);
        }

        let ids: Vec<_> = closest.entries.iter().map(|e| e.id).collect();
        assert_eq!(
            ids,
            vec![NodeId::from_u16(2), NodeId::from_u16(4), NodeId::from_u16(1)]
        );
    }

    #[test]
    fn find_returns_exact_match_only() {
        let mut table = table();
        let node = Node::new(NodeId::rand(), localhost_with_port(2));
        let id = node.id;
        table.add(node);

        assert!(table.find(&id).is_some());
        assert!(table.find(&NodeId::rand()).is_none());
    }
}
