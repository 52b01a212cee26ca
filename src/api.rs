//! What the network exchanges with the rest of the node.

use std::net::IpAddr;

use crate::{
    core::{id::NodeId, message::wire_config},
    error::NetworkError,
};

/// Application message codes.
///
/// Consensus codes sit below [`P2P_MESSAGE_CODE_BASE`](crate::core::message::P2P_MESSAGE_CODE_BASE)
/// and are handed to [`MessageHandler::handle`], chain codes above it are published on a topic.
pub mod codes {
    // Block casting.
    pub const CAST_VERIFY: u32 = 1;
    pub const VERIFIED_CAST: u32 = 2;
    pub const CAST_REWARD_SIGN_REQ: u32 = 3;
    pub const CAST_REWARD_SIGN_GOT: u32 = 4;
    pub const REQ_PROPOSAL_BLOCK: u32 = 5;
    pub const RESPONSE_PROPOSAL_BLOCK: u32 = 6;

    // Block sync.
    pub const BLOCK_INFO_NOTIFY: u32 = 10001;
    pub const REQ_BLOCK: u32 = 10002;
    pub const BLOCK_RESPONSE: u32 = 10003;
    pub const NEW_BLOCK: u32 = 10004;

    // Fork handling.
    pub const FORK_FIND_ANCESTOR_RESPONSE: u32 = 10008;
    pub const FORK_FIND_ANCESTOR_REQ: u32 = 10009;
    pub const FORK_CHAIN_SLICE_REQ: u32 = 10013;
    pub const FORK_CHAIN_SLICE_RESPONSE: u32 = 10014;

    // Transaction sync.
    pub const TX_SYNC_NOTIFY: u32 = 10010;
    pub const TX_SYNC_REQ: u32 = 10011;
    pub const TX_SYNC_RESPONSE: u32 = 10012;
}

/// The topic chain messages with the given code are published on.
pub fn topic(code: u32) -> Option<&'static str> {
    let topic = match code {
        codes::BLOCK_INFO_NOTIFY => "block_info_notify",
        codes::REQ_BLOCK => "block_req",
        codes::BLOCK_RESPONSE => "block_response",
        codes::NEW_BLOCK => "new_block",
        codes::FORK_FIND_ANCESTOR_RESPONSE => "fork_find_ancestor_response",
        codes::FORK_FIND_ANCESTOR_REQ => "fork_find_ancestor_req",
        codes::FORK_CHAIN_SLICE_REQ => "fork_block_req",
        codes::FORK_CHAIN_SLICE_RESPONSE => "fork_block_response",
        codes::TX_SYNC_NOTIFY => "tx_sync_notify",
        codes::TX_SYNC_REQ => "tx_sync_req",
        codes::TX_SYNC_RESPONSE => "tx_sync_response",
        _ => return None,
    };

    Some(topic)
}

/// An application message.
///
/// Only the code and body travel in the payload; the chain identifier and protocol version are
/// carried in the packet's message info and filled in on receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub chain_id: u16,
    pub protocol_version: u16,
    pub code: u32,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(code: u32, body: impl Into<Vec<u8>>) -> Self {
        Self {
            chain_id: 0,
            protocol_version: 0,
            code,
            body: body.into(),
        }
    }

    /// Encodes `(code, body)`.
    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        Ok(bincode::encode_to_vec((self.code, &self.body), wire_config())?)
    }

    pub fn decode(
        data: &[u8],
        chain_id: u16,
        protocol_version: u16,
    ) -> Result<Self, NetworkError> {
        let ((code, body), _): ((u32, Vec<u8>), _) =
            bincode::decode_from_slice(data, wire_config())?;

        Ok(Self {
            chain_id,
            protocol_version,
            code,
            body,
        })
    }
}

/// A live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conn {
    pub id: NodeId,
    pub ip: IpAddr,
    pub port: u16,
}

/// Receives the application messages delivered by the network.
///
/// Calls happen on blocking worker threads, one per message.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handles a consensus message.
    fn handle(&self, from: NodeId, msg: Message) -> Result<(), NetworkError>;

    /// Publishes a chain message on its topic. Chain messages are dropped by default.
    fn publish(&self, topic: &'static str, from: NodeId, msg: Message) {
        let _ = (topic, from, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::P2P_MESSAGE_CODE_BASE;

    #[test]
    fn message_encoding() {
        let msg = Message::new(codes::NEW_BLOCK, b"block".to_vec());
        let data = msg.encode().unwrap();

        let decoded = Message::decode(&data, 3, 1).unwrap();
        assert_eq!(decoded.code, codes::NEW_BLOCK);
        assert_eq!(decoded.body, b"block");
        assert_eq!((decoded.chain_id, decoded.protocol_version), (3, 1));

        assert!(Message::decode(&data[..2], 3, 1).is_err());

        // The body length claims u64::MAX bytes.
        let forged = [0x01, 0xfd, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        assert!(Message::decode(&forged, 3, 1).is_err());
    }

    #[test]
    fn only_chain_codes_have_topics() {
        for code in [
            codes::CAST_VERIFY,
            codes::VERIFIED_CAST,
            codes::CAST_REWARD_SIGN_REQ,
            codes::CAST_REWARD_SIGN_GOT,
            codes::REQ_PROPOSAL_BLOCK,
            codes::RESPONSE_PROPOSAL_BLOCK,
        ] {
            assert!(code < P2P_MESSAGE_CODE_BASE);
            assert!(topic(code).is_none());
        }

        assert_eq!(topic(codes::REQ_BLOCK), Some("block_req"));
        assert_eq!(topic(codes::FORK_CHAIN_SLICE_REQ), Some("fork_block_req"));
        assert_eq!(topic(codes::TX_SYNC_RESPONSE), Some("tx_sync_response"));
        assert!(topic(10005).is_none());
    }
}
