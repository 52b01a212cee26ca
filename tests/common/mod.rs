use std::{net::SocketAddr, sync::Arc};

use ed25519_dalek::SigningKey;
use kadmesh::{
    config::SeedConfig,
    peer::{auth::node_id_of, DEFAULT_MAX_PEERS}, Message, MessageHandler, NetCore, NetworkConfig,
    NetworkError, NodeId, TcpTransport,
};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use tracing_subscriber::{fmt, EnvFilter};

#[allow(dead_code)]
pub fn enable_tracing() {
    fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

/// Records everything the network hands to the application.
#[derive(Default)]
pub struct Inbox {
    pub handled: Mutex<Vec<(NodeId, Message)>>,
    pub published: Mutex<Vec<(&'static str, NodeId, Message)>>,
}

impl MessageHandler for Inbox {
    fn handle(&self, from: NodeId, msg: Message) -> Result<(), NetworkError> {
        self.handled.lock().push((from, msg));
        Ok(())
    }

    fn publish(&self, topic: &'static str, from: NodeId, msg: Message) {
        self.published.lock().push((topic, from, msg));
    }
}

#[allow(dead_code)]
impl Inbox {
    pub fn handled_count(&self, code: u32) -> usize {
        self.handled
            .lock()
            .iter()
            .filter(|(_, msg)| msg.code == code)
            .count()
    }

    pub fn received_from(&self, from: &NodeId, code: u32) -> bool {
        self.handled
            .lock()
            .iter()
            .any(|(id, msg)| id == from && msg.code == code)
    }
}

pub struct TestNode {
    pub net: Arc<NetCore>,
    pub inbox: Arc<Inbox>,
}

#[allow(dead_code)]
impl TestNode {
    /// Starts a node on a random local port, bootstrapping from `seeds`.
    pub async fn new(seeds: &[&TestNode]) -> Self {
        Self::with_chain(seeds, 0).await
    }

    pub async fn with_chain(seeds: &[&TestNode], chain_id: u16) -> Self {
        Self::start(seeds, chain_id, DEFAULT_MAX_PEERS).await
    }

    /// A node whose peer table holds at most `max_peers` peers.
    pub async fn with_max_peers(seeds: &[&TestNode], max_peers: usize) -> Self {
        Self::start(seeds, 0, max_peers).await
    }

    async fn start(seeds: &[&TestNode], chain_id: u16, max_peers: usize) -> Self {
        let key = SigningKey::generate(&mut OsRng);
        let (transport, events) = TcpTransport::new(node_id_of(&key).net_id());

        let config = NetworkConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            seeds: seeds
                .iter()
                .map(|seed| SeedConfig {
                    id: seed.id().to_hex(),
                    addr: seed.addr(),
                })
                .collect(),
            chain_id,
            max_peers,
            ..Default::default()
        };

        let inbox = Arc::new(Inbox::default());
        let net = NetCore::start(&config, key, Arc::new(transport), events, inbox.clone()).unwrap();

        Self { net, inbox }
    }

    pub fn id(&self) -> NodeId {
        self.net.local_id()
    }

    pub fn addr(&self) -> SocketAddr {
        self.net.local_addr()
    }

    pub fn is_available(&self, other: &TestNode) -> bool {
        self.net.is_available(&other.id())
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.net.shutdown();
    }
}

/// Starts `n` nodes that all bootstrap from the first one.
#[allow(dead_code)]
pub async fn create_n_nodes(n: usize) -> Vec<TestNode> {
    let seed = TestNode::new(&[]).await;
    let mut nodes = Vec::with_capacity(n);
    for _ in 1..n {
        nodes.push(TestNode::new(&[&seed]).await);
    }
    nodes.insert(0, seed);

    nodes
}
