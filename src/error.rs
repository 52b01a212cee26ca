use std::io;

use thiserror::Error;

use crate::core::id::NodeId;

/// Errors surfaced by the network layer.
#[derive(Debug, Error)]
pub enum NetworkError {
    // Protocol errors, the offending unit is dropped.
    #[error("packet too small")]
    PacketTooSmall,
    #[error("bad packet, declared length {0}")]
    BadPacket(u32),
    #[error("packet of {0} bytes exceeds the frame limit")]
    PacketTooLarge(usize),
    #[error("unknown message type {0}")]
    UnknownMessage(u32),
    #[error("expired")]
    Expired,
    #[error("failed to decode packet: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("failed to encode packet: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    // RPC errors, surfaced to the caller awaiting the reply.
    #[error("RPC timeout")]
    Timeout,
    #[error("RPC timeout (clock warp)")]
    ClockWarp,
    #[error("socket closed")]
    Closed,
    #[error("unsolicited reply")]
    UnsolicitedReply,

    // Capacity errors.
    #[error("peer table is full")]
    PeerTableFull,

    #[error("is self")]
    IsSelf,
    #[error("invalid node id {0:?}")]
    InvalidNodeId(String),
    #[error("bad bootstrap node {id} ({reason})")]
    BadSeed { id: NodeId, reason: &'static str },
    #[error("not a member of group {0}")]
    NotGroupMember(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("consensus handler failed: {0}")]
    Handler(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}
