//! Protocol message types.

use std::net::SocketAddr;

use bincode::{config::Config, Decode, Encode};

use crate::{codec::MAX_PACKET_SIZE, core::id::NodeId};

/// Protocol codes for the packet types start here, so the flow meter and the send priority table
/// can share one code space with the application messages.
pub const P2P_MESSAGE_CODE_BASE: u32 = 10000;

/// Length of a business message identifier (a digest chosen by the application).
pub const BIZ_MESSAGE_ID_LENGTH: usize = 32;

/// The bincode configuration of every wire body. Length prefixes claiming more than a frame can
/// hold fail to decode instead of allocating.
pub(crate) fn wire_config() -> impl Config {
    bincode::config::standard().with_limit::<{ MAX_PACKET_SIZE }>()
}

/// The packet type carried in the first four bytes of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Ping = 1,
    Pong = 2,
    FindNode = 3,
    Neighbors = 4,
    RelayTest = 5,
    RelayNode = 6,
    Data = 7,
}

impl MessageType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Ping),
            2 => Some(Self::Pong),
            3 => Some(Self::FindNode),
            4 => Some(Self::Neighbors),
            5 => Some(Self::RelayTest),
            6 => Some(Self::RelayNode),
            7 => Some(Self::Data),
            _ => None,
        }
    }

    /// The code used to account and prioritise the packet.
    pub fn code(&self) -> u32 {
        P2P_MESSAGE_CODE_BASE + *self as u32
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::FindNode => "find_node",
            Self::Neighbors => "neighbors",
            Self::RelayTest => "relay_test",
            Self::RelayNode => "relay_node",
            Self::Data => "data",
        }
    }
}

/// Kadmesh message variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// PING announces the sender's endpoint and, until the peer is authenticated, its proof of
    /// key ownership.
    Ping(Ping),
    /// PONG reports whether the sender could verify the PING's proof.
    Pong(Pong),

    /// FIND_NODE asks for the closest nodes to a target identifier.
    FindNode(FindNode),
    /// NEIGHBORS is the answer to FIND_NODE.
    Neighbors(Neighbors),

    /// RELAY_TEST asks whether the recipient is connected to the target.
    RelayTest(RelayTest),
    /// RELAY_NODE is the positive answer to RELAY_TEST.
    RelayNode(RelayNode),

    /// DATA carries application payloads, point-to-point or flooded.
    Data(DataMessage),
}

impl Packet {
    pub fn message_type(&self) -> MessageType {
        match self {
            Packet::Ping(_) => MessageType::Ping,
            Packet::Pong(_) => MessageType::Pong,
            Packet::FindNode(_) => MessageType::FindNode,
            Packet::Neighbors(_) => MessageType::Neighbors,
            Packet::RelayTest(_) => MessageType::RelayTest,
            Packet::RelayNode(_) => MessageType::RelayNode,
            Packet::Data(_) => MessageType::Data,
        }
    }

    /// Seconds-since-epoch after which the packet is dropped.
    pub fn expiration(&self) -> u64 {
        match self {
            Packet::Ping(ping) => ping.expiration,
            Packet::Pong(pong) => pong.expiration,
            Packet::FindNode(find_node) => find_node.expiration,
            Packet::Neighbors(neighbors) => neighbors.expiration,
            Packet::RelayTest(relay_test) => relay_test.expiration,
            Packet::RelayNode(relay_node) => relay_node.expiration,
            Packet::Data(data) => data.expiration,
        }
    }

    /// Encodes the packet body, without the framing header.
    pub fn encode_body(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        let config = wire_config();
        match self {
            Packet::Ping(ping) => bincode::encode_to_vec(ping, config),
            Packet::Pong(pong) => bincode::encode_to_vec(pong, config),
            Packet::FindNode(find_node) => bincode::encode_to_vec(find_node, config),
            Packet::Neighbors(neighbors) => bincode::encode_to_vec(neighbors, config),
            Packet::RelayTest(relay_test) => bincode::encode_to_vec(relay_test, config),
            Packet::RelayNode(relay_node) => bincode::encode_to_vec(relay_node, config),
            Packet::Data(data) => bincode::encode_to_vec(data, config),
        }
    }

    /// Decodes a packet body of the given type.
    pub fn decode_body(
        message_type: MessageType,
        body: &[u8],
    ) -> Result<Self, bincode::error::DecodeError> {
        let config = wire_config();
        let packet = match message_type {
            MessageType::Ping => Packet::Ping(bincode::decode_from_slice(body, config)?.0),
            MessageType::Pong => Packet::Pong(bincode::decode_from_slice(body, config)?.0),
            MessageType::FindNode => {
                Packet::FindNode(bincode::decode_from_slice(body, config)?.0)
            }
            MessageType::Neighbors => {
                Packet::Neighbors(bincode::decode_from_slice(body, config)?.0)
            }
            MessageType::RelayTest => {
                Packet::RelayTest(bincode::decode_from_slice(body, config)?.0)
            }
            MessageType::RelayNode => {
                Packet::RelayNode(bincode::decode_from_slice(body, config)?.0)
            }
            MessageType::Data => Packet::Data(bincode::decode_from_slice(body, config)?.0),
        };

        Ok(packet)
    }
}

/// Proof that the sender holds the secret key of its node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct AuthProof {
    pub pk: [u8; 32],
    pub cur_time: u64,
    pub sign: Vec<u8>,
}

/// The data making up a PING message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Ping {
    pub version: u32,
    pub from: Option<SocketAddr>,
    pub to: Option<SocketAddr>,
    pub chain_id: u16,
    pub expiration: u64,
    pub auth: Option<AuthProof>,
}

/// The data making up a PONG message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Pong {
    pub version: u32,
    pub verify_result: bool,
    pub expiration: u64,
}

/// The data making up a FIND_NODE message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FindNode {
    pub target: NodeId,
    pub expiration: u64,
}

/// A routing table entry as shared in NEIGHBORS.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct RpcNode {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub nat_type: u32,
}

/// The data making up a NEIGHBORS message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Neighbors {
    pub nodes: Vec<RpcNode>,
    pub expiration: u64,
}

/// The data making up a RELAY_TEST message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct RelayTest {
    pub target: NodeId,
    pub expiration: u64,
}

/// The data making up a RELAY_NODE message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct RelayNode {
    pub target: NodeId,
    pub expiration: u64,
}

/// How a DATA message propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum DataType {
    /// Point-to-point, never relayed.
    Normal,
    /// Flooded to every connected peer.
    Global,
    /// Flooded to a random subset of connected peers.
    GlobalRandom,
    /// Flooded along the overlay links of a group.
    Group,
    /// Flooded to random members of a group.
    GroupRandom,
}

/// The data making up a DATA message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct DataMessage {
    pub data: Vec<u8>,
    pub data_type: DataType,
    pub group_id: String,
    pub message_id: u64,
    pub message_code: u32,
    pub dest_node_id: Option<NodeId>,
    pub src_node_id: NodeId,
    pub biz_message_id: Option<[u8; BIZ_MESSAGE_ID_LENGTH]>,
    // Negative values relay without a hop limit, dedup bounds the flood.
    pub relay_count: i32,
    pub message_info: u32,
    pub expiration: u64,
}

/// Packs the chain identifier and protocol version into one word.
pub fn encode_message_info(chain_id: u16, protocol_version: u16) -> u32 {
    (chain_id as u32) << 16 | protocol_version as u32
}

/// Splits a message info word into `(chain_id, protocol_version)`.
pub fn decode_message_info(info: u32) -> (u16, u16) {
    ((info >> 16) as u16, info as u16)
}

/// Pads or truncates an application digest into a business message identifier.
pub fn biz_message_id(digest: &[u8]) -> [u8; BIZ_MESSAGE_ID_LENGTH] {
    let mut id = [0u8; BIZ_MESSAGE_ID_LENGTH];
    let len = digest.len().min(BIZ_MESSAGE_ID_LENGTH);
    id[..len].copy_from_slice(&digest[..len]);

    id
}
