//! Routing table entries.

use std::net::SocketAddr;

use time::OffsetDateTime;

use crate::{
    core::id::{KeyHash, NodeId},
    error::NetworkError,
};

/// A node known to the routing table, with its bookkeeping.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub nat_type: u32,

    // The position of the node in the routing key space.
    pub(crate) sha: KeyHash,
    // When the node entered the active set of its bucket.
    pub(crate) added_at: Option<OffsetDateTime>,
    // Consecutive failed queries.
    pub(crate) fails: u32,
    // When the node was last pinged by us.
    pub(crate) ping_at: Option<OffsetDateTime>,
    // Whether the node has pinged us.
    pub(crate) pinged: bool,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        // Normalise v4-mapped addresses so the same host compares equal.
        let addr = match addr {
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => SocketAddr::new(v4.into(), v6.port()),
                None => addr,
            },
            SocketAddr::V4(_) => addr,
        };

        Self {
            id,
            addr,
            nat_type: 0,
            sha: id.sha(),
            added_at: None,
            fails: 0,
            ping_at: None,
            pinged: false,
        }
    }

    pub fn sha(&self) -> &KeyHash {
        &self.sha
    }

    /// Checks the node can be dialled, used for seed nodes.
    pub fn validate_complete(&self) -> Result<(), NetworkError> {
        if self.addr.port() == 0 {
            return Err(NetworkError::BadSeed {
                id: self.id,
                reason: "missing port",
            });
        }

        let ip = self.addr.ip();
        if ip.is_multicast() || ip.is_unspecified() {
            return Err(NetworkError::BadSeed {
                id: self.id,
                reason: "invalid IP (multicast/unspecified)",
            });
        }

        Ok(())
    }

    /// Whether the node's address is usable in a NEIGHBORS answer.
    pub fn has_endpoint(&self) -> bool {
        self.addr.port() > 0 && !self.addr.ip().is_unspecified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_complete() {
        let id = NodeId::from_u16(1);

        assert!(Node::new(id, "127.0.0.1:1122".parse().unwrap())
            .validate_complete()
            .is_ok());
        assert!(Node::new(id, "127.0.0.1:0".parse().unwrap())
            .validate_complete()
            .is_err());
        assert!(Node::new(id, "0.0.0.0:1122".parse().unwrap())
            .validate_complete()
            .is_err());
        assert!(Node::new(id, "224.0.0.1:1122".parse().unwrap())
            .validate_complete()
            .is_err());
    }

    #[test]
    fn mapped_addresses_are_normalised() {
        let node = Node::new(NodeId::from_u16(1), "[::ffff:10.0.0.1]:1122".parse().unwrap());
        assert_eq!(node.addr, "10.0.0.1:1122".parse::<SocketAddr>().unwrap());
    }
}
