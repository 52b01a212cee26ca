//! Inbound packet handling.

use std::sync::{atomic::Ordering, Arc};

use tracing::{debug, trace, warn};

use super::{expiration, expired, NetCore, MAX_UNHANDLED, PROTOCOL_VERSION};
use crate::{
    api::{topic, Message},
    codec::{encode_packet, RawPacket},
    core::{
        id::NodeId,
        message::{
            decode_message_info, DataMessage, DataType, FindNode, MessageType, Neighbors,
            Packet, Ping, Pong, RelayNode, RelayTest, RpcNode, P2P_MESSAGE_CODE_BASE,
        },
    },
    error::NetworkError,
    kad::BUCKET_SIZE,
};

// Packets past their expiration are dropped before dispatch.
fn ensure_fresh(packet: &Packet) -> Result<(), NetworkError> {
    match expired(packet.expiration()) {
        true => Err(NetworkError::Expired),
        false => Ok(()),
    }
}

impl NetCore {
    pub(super) async fn handle_packet(
        &self,
        net_id: u64,
        raw: RawPacket,
    ) -> Result<(), NetworkError> {
        let kind = MessageType::from_u32(raw.kind).ok_or(NetworkError::UnknownMessage(raw.kind))?;
        let size = raw.size();
        let packet = Packet::decode_body(kind, &raw.body)?;
        self.peers.pool().free(raw.body);

        let code = match &packet {
            Packet::Data(data) => data.message_code,
            _ => kind.code(),
        };
        self.flow_meter.recv(code, size);

        ensure_fresh(&packet)?;

        trace!(net_id, kind = kind.as_str(), "received");
        match packet {
            Packet::Ping(ping) => self.handle_ping(net_id, ping),
            Packet::Pong(pong) => self.handle_pong(net_id, pong),
            Packet::FindNode(find_node) => self.handle_find_node(net_id, find_node),
            Packet::Neighbors(neighbors) => self.handle_neighbors(net_id, neighbors).await,
            Packet::RelayTest(relay_test) => self.handle_relay_test(net_id, relay_test),
            Packet::RelayNode(relay_node) => self.handle_relay_node(net_id, relay_node),
            Packet::Data(data) => self.handle_data(net_id, data),
        }
    }

    fn reply(&self, net_id: u64, packet: &Packet) -> Result<(), NetworkError> {
        let bytes = encode_packet(packet)?;
        self.peers
            .reply(net_id, bytes, packet.message_type().code());

        Ok(())
    }

    fn handle_ping(&self, net_id: u64, ping: Ping) -> Result<(), NetworkError> {
        let Some(peer) = self.peers.peer_by_net_id(net_id) else {
            return Ok(());
        };

        let (id, verify_result, remote_verified, from) = {
            let mut p = peer.lock();
            p.chain_id = ping.chain_id;
            if let Some(proof) = ping.auth {
                if !p.verify(proof, &self.local_id) {
                    debug!(net_id, "peer failed to prove its identity");
                }
            }

            // A node listening on every interface is reached at the address it connected from.
            let from = ping.from.map(|mut addr| {
                if addr.ip().is_unspecified() {
                    if let Some(conn) = p.addr {
                        addr.set_ip(conn.ip());
                    }
                }
                addr
            });
            if let Some(addr) = from.filter(|_| p.id.is_valid()) {
                p.addr = Some(addr);
            }

            (p.id, p.verify_result, p.remote_verify_result, from)
        };

        if let Some(addr) = from.filter(|_| id.is_valid() && verify_result) {
            if let Err(e) = self.kad.on_ping_node(id, addr) {
                trace!(peer = %id, "not added to the routing table: {e}");
            }
        }

        self.reply(
            net_id,
            &Packet::Pong(Pong {
                version: PROTOCOL_VERSION,
                verify_result,
                expiration: expiration(),
            }),
        )?;

        if !remote_verified {
            self.rpc.ping(id, None);
        }
        self.peers.flush(net_id);

        Ok(())
    }

    fn handle_pong(&self, net_id: u64, pong: Pong) -> Result<(), NetworkError> {
        let Some(peer) = self.peers.peer_by_net_id(net_id) else {
            return Ok(());
        };

        let id = {
            let mut p = peer.lock();
            p.set_remote_verify_result(pong.verify_result);
            if !pong.verify_result {
                p.reset_remote_verify_context();
            }
            if p.auth_succeeded() {
                debug!(peer = %p.id, "authenticated");
            }

            p.id
        };

        if !pong.verify_result {
            debug!(peer = %id, "our proof was rejected, pinging again");
            self.rpc.ping(id, None);
        }
        self.peers.flush(net_id);

        Ok(())
    }

    fn handle_find_node(&self, net_id: u64, find_node: FindNode) -> Result<(), NetworkError> {
        let nodes = self
            .kad
            .closest(&find_node.target, BUCKET_SIZE)
            .into_iter()
            .filter(|node| node.has_endpoint())
            .map(|node| RpcNode {
                id: node.id,
                addr: node.addr,
                nat_type: node.nat_type,
            })
            .collect();

        self.reply(
            net_id,
            &Packet::Neighbors(Neighbors {
                nodes,
                expiration: expiration(),
            }),
        )
    }

    async fn handle_neighbors(
        &self,
        net_id: u64,
        neighbors: Neighbors,
    ) -> Result<(), NetworkError> {
        let Some(id) = self.peer_id(net_id) else {
            return Err(NetworkError::UnsolicitedReply);
        };

        match self
            .rpc
            .got_reply(id, MessageType::Neighbors, Packet::Neighbors(neighbors))
            .await
        {
            true => Ok(()),
            false => Err(NetworkError::UnsolicitedReply),
        }
    }

    fn handle_relay_test(&self, net_id: u64, relay_test: RelayTest) -> Result<(), NetworkError> {
        if !self.peers.is_authenticated(&relay_test.target) {
            return Ok(());
        }

        self.reply(
            net_id,
            &Packet::RelayNode(RelayNode {
                target: relay_test.target,
                expiration: expiration(),
            }),
        )
    }

    fn handle_relay_node(&self, net_id: u64, relay_node: RelayNode) -> Result<(), NetworkError> {
        if let Some(relay) = self.peer_id(net_id) {
            self.peers.set_relay(&relay_node.target, relay);
        }

        Ok(())
    }

    // The identifier the peer has proven, if any.
    fn peer_id(&self, net_id: u64) -> Option<NodeId> {
        let peer = self.peers.peer_by_net_id(net_id)?;
        let id = peer.lock().id;

        id.is_valid().then_some(id)
    }

    fn handle_data(&self, net_id: u64, data: DataMessage) -> Result<(), NetworkError> {
        let Some(peer) = self.peers.peer_by_net_id(net_id) else {
            return Ok(());
        };

        let (chain_id, _) = decode_message_info(data.message_info);
        let available = {
            let mut p = peer.lock();
            p.chain_id = chain_id;
            p.is_available(self.chain_id)
        };
        if !available {
            debug!(net_id, chain_id, "data from an unavailable peer dropped");
            return Ok(());
        }

        match data.data_type {
            DataType::Normal => match data.dest_node_id {
                Some(dest) if dest != self.local_id => {
                    trace!(peer = %dest, code = data.message_code, "forwarding relayed data");
                    let code = data.message_code;
                    let addr = self.locate(&dest);
                    self.peers
                        .write(dest, addr, encode_packet(&Packet::Data(data))?, code, false);
                    Ok(())
                }
                _ => {
                    self.deliver(data.src_node_id, &data);
                    Ok(())
                }
            },
            _ => self.handle_flood(data),
        }
    }

    /// Delivers a flooded message once and passes it on once.
    fn handle_flood(&self, mut data: DataMessage) -> Result<(), NetworkError> {
        let flood = self.messages.on_flood(&data);
        if flood.deliver {
            self.deliver(data.src_node_id, &data);
        }

        let Some(relay_count) = flood.relay else {
            return Ok(());
        };
        data.relay_count = relay_count;

        let code = data.message_code;
        let data_type = data.data_type;
        let group_id = data.group_id.clone();
        let packet = encode_packet(&Packet::Data(data))?;

        match data_type {
            DataType::Group => self.groups.on_broadcast(self, &group_id, packet, code),
            DataType::GroupRandom => {
                if let Err(e) = self.groups.broadcast_random(self, &group_id, packet, code) {
                    debug!(group = %group_id, "random group broadcast not forwarded: {e}");
                }
            }
            DataType::Global => self.peers.broadcast(packet, code),
            DataType::GlobalRandom => self.peers.broadcast_random(packet, code),
            DataType::Normal => {}
        }

        Ok(())
    }

    /// Hands the message to the application on a blocking worker. Consensus codes go to
    /// [`handle`](crate::api::MessageHandler::handle), chain codes are published on their topic.
    pub(super) fn deliver(&self, from: NodeId, data: &DataMessage) {
        let (chain_id, protocol_version) = decode_message_info(data.message_info);
        let msg = match Message::decode(&data.data, chain_id, protocol_version) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = %from, "undecodable message: {e}");
                return;
            }
        };

        let topic = match msg.code {
            code if code < P2P_MESSAGE_CODE_BASE => None,
            code => match topic(code) {
                Some(topic) => Some(topic),
                None => {
                    debug!(peer = %from, code, "message with an unknown code dropped");
                    return;
                }
            },
        };

        if self.unhandled.fetch_add(1, Ordering::AcqRel) >= MAX_UNHANDLED {
            self.unhandled.fetch_sub(1, Ordering::AcqRel);
            warn!(peer = %from, code = msg.code, "too many messages in flight, dropped");
            return;
        }

        let handler = Arc::clone(&self.handler);
        let unhandled = Arc::clone(&self.unhandled);
        self.runtime.spawn_blocking(move || {
            let code = msg.code;
            match topic {
                Some(topic) => handler.publish(topic, from, msg),
                None => {
                    if let Err(e) = handler.handle(from, msg) {
                        warn!(peer = %from, code, "{e}");
                    }
                }
            }

            unhandled.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::auth;

    #[test]
    fn expired_packets_are_dropped() {
        let target = NodeId::rand();
        let find_node = |expiration| Packet::FindNode(FindNode { target, expiration });

        assert!(ensure_fresh(&find_node(expiration())).is_ok());
        assert!(matches!(
            ensure_fresh(&find_node(auth::unix_now() - 1)),
            Err(NetworkError::Expired)
        ));
        assert!(ensure_fresh(&find_node(1)).is_err());

        let relay_node = Packet::RelayNode(RelayNode {
            target,
            expiration: 0,
        });
        assert!(matches!(
            ensure_fresh(&relay_node),
            Err(NetworkError::Expired)
        ));
    }
}
