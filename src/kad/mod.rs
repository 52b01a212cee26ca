//! Kademlia node discovery: the routing table, iterative lookups and the maintenance loop.

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{interval_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    core::{id::NodeId, node::Node},
    error::NetworkError,
};

mod table;

pub use table::{NodesByDistance, RoutingTable, ALPHA, BUCKET_SIZE, MAX_REPLACEMENTS, N_BUCKETS};

/// How often the table is refreshed with random lookups.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// How often the table size is checked.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(12);
/// A node pinged more recently than this isn't pinged again.
pub const NODE_BOND_EXPIRATION: Duration = Duration::from_secs(5);
// Number of checks during which every check triggers a refresh.
const MAX_SETUP_CHECK_COUNT: u32 = 12;
// Random targets looked up on each refresh, on top of the local identifier.
const REFRESH_RANDOM_TARGETS: usize = 3;

/// The RPCs the routing table needs from the network.
pub trait KadNetwork: Send + Sync + 'static {
    /// Sends a PING, without waiting for an answer.
    fn ping(&self, id: NodeId, addr: Option<SocketAddr>);

    /// Sends FIND_NODE and collects the NEIGHBORS answer.
    fn find_node(
        &self,
        id: NodeId,
        addr: SocketAddr,
        target: NodeId,
    ) -> BoxFuture<'static, Result<Vec<Node>, NetworkError>>;
}

/// The routing table along with the lookup and maintenance logic driving it.
pub struct Kad {
    local_id: NodeId,
    table: Mutex<RoutingTable>,
    seeds: Vec<Node>,
    net: Arc<dyn KadNetwork>,
    refresh_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    refresh_rx: Mutex<Option<mpsc::UnboundedReceiver<oneshot::Sender<()>>>>,
    setup_check_count: AtomicU32,
}

impl Kad {
    /// Creates the table and loads the seeds. Fails if a seed can't be dialled.
    pub fn new(
        net: Arc<dyn KadNetwork>,
        local_id: NodeId,
        local_addr: SocketAddr,
        seeds: Vec<Node>,
    ) -> Result<Arc<Self>, NetworkError> {
        for seed in &seeds {
            seed.validate_complete()?;
        }

        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let kad = Arc::new(Self {
            local_id,
            table: Mutex::new(RoutingTable::new(local_id, local_addr)),
            seeds: seeds.into_iter().filter(|s| s.id != local_id).collect(),
            net,
            refresh_tx,
            refresh_rx: Mutex::new(Some(refresh_rx)),
            setup_check_count: AtomicU32::new(0),
        });
        kad.load_seeds();

        Ok(kad)
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn seeds(&self) -> &[Node] {
        &self.seeds
    }

    /// The number of active entries in the table.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&self, node: Node) -> bool {
        self.table.lock().add(node)
    }

    pub fn find(&self, id: &NodeId) -> Option<Node> {
        self.table.lock().find(id).cloned()
    }

    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<Node> {
        self.table.lock().closest(target.sha(), n).entries
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.table.lock().nodes()
    }

    fn load_seeds(&self) {
        let mut table = self.table.lock();
        for seed in &self.seeds {
            table.add(seed.clone());
        }
    }

    /// Returns the node if it's in the table, otherwise looks it up in the network.
    pub async fn resolve(&self, id: NodeId) -> Option<Node> {
        if let Some(node) = self.find(&id) {
            return Some(node);
        }

        self.lookup(id, true)
            .await
            .into_iter()
            .find(|node| node.id == id)
    }

    /// Iteratively queries the closest known nodes for the target, `ALPHA` at a time, until no
    /// query is left pending. Returns at most `BUCKET_SIZE` nodes sorted by distance.
    pub async fn lookup(&self, target: NodeId, mut refresh_if_empty: bool) -> Vec<Node> {
        let target_sha = target.sha();
        let mut asked = HashSet::from([self.local_id]);

        let mut result = loop {
            let result = self.table.lock().closest(target_sha, BUCKET_SIZE);
            if !result.entries.is_empty() || !refresh_if_empty {
                break result;
            }

            // The table is empty, wait for the seeds to be bonded with.
            let _ = self.refresh().await;
            refresh_if_empty = false;
        };
        let mut seen: HashSet<_> = result.entries.iter().map(|node| node.id).collect();

        let mut pending = FuturesUnordered::new();
        loop {
            for node in &result.entries {
                if pending.len() >= ALPHA {
                    break;
                }

                if asked.insert(node.id) {
                    let (id, addr) = (node.id, node.addr);
                    let query = self.net.find_node(id, addr, target);
                    pending.push(async move { (id, query.await) });
                }
            }

            let Some((id, reply)) = pending.next().await else {
                break;
            };

            let nodes = match reply {
                Ok(nodes) => {
                    self.table.lock().record_success(&id);
                    nodes
                }
                Err(e) => {
                    trace!(peer = %id, "find_node failed: {e}");
                    if self.table.lock().record_failure(&id) {
                        debug!(peer = %id, "dropped unresponsive node");
                    }
                    continue;
                }
            };

            for node in self.ping_all(nodes) {
                if seen.insert(node.id) {
                    result.push(node, BUCKET_SIZE);
                }
            }
        }

        result.entries
    }

    /// Pings every node that needs it and returns the ones already in the table.
    pub fn ping_all(&self, nodes: Vec<Node>) -> Vec<Node> {
        nodes
            .into_iter()
            .filter_map(|node| self.ping_node(node.id, Some(node.addr)).ok().flatten())
            .collect()
    }

    /// Pings the node unless it pinged us or was pinged recently, and returns its table entry.
    pub fn ping_node(
        &self,
        id: NodeId,
        addr: Option<SocketAddr>,
    ) -> Result<Option<Node>, NetworkError> {
        if id == self.local_id {
            return Err(NetworkError::IsSelf);
        }

        let now = OffsetDateTime::now_utc();
        let (node, should_ping) = {
            let mut table = self.table.lock();
            match table.find_mut(&id) {
                Some(node) => {
                    let age = node.ping_at.map(|at| now - at);
                    let expired = age.map_or(true, |age| age >= NODE_BOND_EXPIRATION);
                    let should_ping = !node.pinged && (node.fails > 0 || expired);
                    node.ping_at = Some(now);

                    (Some(node.clone()), should_ping)
                }
                None => (None, true),
            }
        };

        if should_ping {
            self.net.ping(id, addr);
        }

        Ok(node)
    }

    /// Records an inbound PING, adding the node if it's unknown.
    pub fn on_ping_node(&self, id: NodeId, addr: SocketAddr) -> Result<Node, NetworkError> {
        if id == self.local_id {
            return Err(NetworkError::IsSelf);
        }

        let mut table = self.table.lock();
        if table.find(&id).is_none() {
            table.add(Node::new(id, addr));
        }

        match table.find_mut(&id) {
            Some(node) => {
                node.pinged = true;
                Ok(node.clone())
            }
            // The bucket is full, the node was kept as a replacement.
            None => {
                let mut node = Node::new(id, addr);
                node.pinged = true;
                Ok(node)
            }
        }
    }

    /// Requests a refresh; the returned receiver resolves once it has completed.
    pub fn refresh(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.refresh_tx.send(tx).is_err() {
            warn!("refresh requested after shutdown");
        }

        rx
    }

    /// Pings the seeds, then looks up the local identifier and a few random ones.
    async fn do_refresh(self: Arc<Self>) {
        self.ping_all(self.seeds.clone());
        self.load_seeds();

        self.lookup(self.local_id, false).await;
        for _ in 0..REFRESH_RANDOM_TARGETS {
            self.lookup(NodeId::rand(), false).await;
        }

        debug!(len = self.len(), "kad refreshed");
    }

    fn do_check(&self) {
        let len = self.len();
        debug!(len, "kad check");

        let count = self.setup_check_count.load(Ordering::Relaxed);
        if len <= self.seeds.len() || count < MAX_SETUP_CHECK_COUNT {
            // Nobody waits on this one.
            let _ = self.refresh();
        }
    }

    /// Spawns the maintenance loop: an immediate refresh, a periodic one and the setup checks.
    /// Refreshes never overlap, requests made while one runs are answered when it completes.
    pub fn spawn_maintenance(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let kad = Arc::clone(self);
        let refresh_rx = self.refresh_rx.lock().take();

        tokio::spawn(async move {
            let Some(mut refresh_rx) = refresh_rx else {
                warn!("kad maintenance is already running");
                return;
            };

            let mut refresh = interval_at(Instant::now() + REFRESH_INTERVAL, REFRESH_INTERVAL);
            let mut check = interval_at(Instant::now() + CHECK_INTERVAL, CHECK_INTERVAL);
            let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
            let mut waiting: Vec<oneshot::Sender<()>> = Vec::new();

            let start_refresh = |kad: &Arc<Kad>| {
                let kad = Arc::clone(kad);
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    kad.do_refresh().await;
                    let _ = done_tx.send(()).await;
                });
            };

            start_refresh(&kad);
            let mut refreshing = true;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = refresh.tick() => {
                        if !refreshing {
                            start_refresh(&kad);
                            refreshing = true;
                        }
                    }
                    Some(req) = refresh_rx.recv() => {
                        waiting.push(req);
                        if !refreshing {
                            start_refresh(&kad);
                            refreshing = true;
                        }
                    }
                    _ = check.tick() => {
                        kad.setup_check_count.fetch_add(1, Ordering::Relaxed);
                        kad.do_check();
                    }
                    Some(()) = done_rx.recv() => {
                        for waiter in waiting.drain(..) {
                            let _ = waiter.send(());
                        }
                        refreshing = false;
                    }
                }
            }

            // Dropping the senders wakes the remaining waiters.
            waiting.clear();
            debug!("kad maintenance stopped");
        })
    }
}
