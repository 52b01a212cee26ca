//! A peer-to-peer network layer for blockchain nodes.
//!
//! Nodes discover each other through a Kademlia routing table, prove their identity with an
//! ed25519 signature when connecting and exchange framed packets over a pluggable transport.
//!
//! ## Messaging
//!
//! Application messages travel point-to-point or are flooded, with deduplication bounding the
//! flood:
//!
//! 1. to every connected peer, or a random subset of them;
//! 2. along the overlay of a group, a ring ordered by node identifier with a few long links so
//!    every member is reached in few hops;
//! 3. into a group the node isn't part of, through a handful of entrance members.
//!
//! ## Proposer groups
//!
//! Proposers are split by stake into a fast tier, the few holding most of the stake, and a normal
//! tier. Each tier is cut into fixed-size groups with their own overlays.

pub mod api;
pub mod codec;
pub mod config;
pub mod core;
pub mod error;
pub mod flow_meter;
pub mod group;
pub mod kad;
pub mod net;
pub mod peer;
pub mod transport;

pub use crate::{
    api::{Conn, Message, MessageHandler},
    config::NetworkConfig,
    core::id::NodeId,
    error::NetworkError,
    group::proposer::Proposer,
    net::NetCore,
    transport::{TcpTransport, Transport, TransportEvent},
};
