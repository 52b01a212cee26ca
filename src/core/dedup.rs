//! Flood message identifiers and the dedup cache.

use std::{collections::HashMap, hash::Hash};

use parking_lot::Mutex;
use time::{Duration, OffsetDateTime};

use crate::core::{
    id::NodeId,
    message::{DataMessage, BIZ_MESSAGE_ID_LENGTH},
};

/// How long a message identifier is remembered.
pub const MESSAGE_CACHE_TIME: Duration = Duration::minutes(5);

pub type BizMessageId = [u8; BIZ_MESSAGE_ID_LENGTH];

struct Seen<K> {
    forwarded: HashMap<K, OffsetDateTime>,
    handled: HashMap<K, OffsetDateTime>,
}

impl<K: Eq + Hash> Seen<K> {
    fn new() -> Self {
        Self {
            forwarded: HashMap::new(),
            handled: HashMap::new(),
        }
    }

    fn clear_before(&mut self, cutoff: OffsetDateTime) {
        self.forwarded.retain(|_, &mut t| t >= cutoff);
        self.handled.retain(|_, &mut t| t >= cutoff);
    }
}

struct Inner {
    index: u32,
    messages: Seen<u64>,
    biz_messages: Seen<BizMessageId>,
}

/// The fate of an inbound flooded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flood {
    /// Hand it to the application.
    pub deliver: bool,
    /// Pass it on, carrying this relay count.
    pub relay: Option<i32>,
}

/// The relay count a forwarded copy carries: none left at 0, one hop less when positive,
/// negative counts never run out.
pub fn next_relay_count(relay_count: i32) -> Option<i32> {
    match relay_count {
        0 => None,
        n if n > 0 => Some(n - 1),
        n => Some(n),
    }
}

/// Generates flood message identifiers and remembers which were handled and forwarded.
///
/// A message identifier is the forward id of the local node in the high 32 bits and a counter in
/// the low 32 bits, so identifiers from different nodes don't collide.
pub struct MessageManager {
    local_id: NodeId,
    forward_node_id: u32,
    inner: Mutex<Inner>,
}

impl MessageManager {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            forward_node_id: local_id.forward_id(),
            inner: Mutex::new(Inner {
                index: 0,
                messages: Seen::new(),
                biz_messages: Seen::new(),
            }),
        }
    }

    /// Returns a fresh identifier, already marked as handled and forwarded so our own flood
    /// doesn't come back to us.
    pub fn gen_message_id(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.index = inner.index.wrapping_add(1);

        let message_id = (self.forward_node_id as u64) << 32 | inner.index as u64;
        let now = OffsetDateTime::now_utc();
        inner.messages.forwarded.insert(message_id, now);
        inner.messages.handled.insert(message_id, now);

        message_id
    }

    pub fn forward(&self, message_id: u64) {
        self.inner
            .lock()
            .messages
            .forwarded
            .insert(message_id, OffsetDateTime::now_utc());
    }

    pub fn is_forwarded(&self, message_id: u64) -> bool {
        self.inner.lock().messages.forwarded.contains_key(&message_id)
    }

    pub fn handle(&self, message_id: u64) {
        self.inner
            .lock()
            .messages
            .handled
            .insert(message_id, OffsetDateTime::now_utc());
    }

    pub fn is_handled(&self, message_id: u64) -> bool {
        self.inner.lock().messages.handled.contains_key(&message_id)
    }

    pub fn forward_biz(&self, biz_id: BizMessageId) {
        self.inner
            .lock()
            .biz_messages
            .forwarded
            .insert(biz_id, OffsetDateTime::now_utc());
    }

    pub fn is_forwarded_biz(&self, biz_id: &BizMessageId) -> bool {
        self.inner.lock().biz_messages.forwarded.contains_key(biz_id)
    }

    pub fn handle_biz(&self, biz_id: BizMessageId) {
        self.inner
            .lock()
            .biz_messages
            .handled
            .insert(biz_id, OffsetDateTime::now_utc());
    }

    pub fn is_handled_biz(&self, biz_id: &BizMessageId) -> bool {
        self.inner.lock().biz_messages.handled.contains_key(biz_id)
    }

    /// Records a flooded message and decides its fate.
    ///
    /// The business identifier, when set, stands in for the message identifier. The first copy
    /// seen is delivered unless addressed to another node, and relayed once unless addressed to
    /// us or out of hops.
    pub fn on_flood(&self, data: &DataMessage) -> Flood {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.lock();
        let mut flood = Flood {
            deliver: false,
            relay: None,
        };

        let handled = match &data.biz_message_id {
            Some(biz_id) => inner.biz_messages.handled.contains_key(biz_id),
            None => inner.messages.handled.contains_key(&data.message_id),
        };
        if !handled {
            inner.messages.handled.insert(data.message_id, now);
            if let Some(biz_id) = data.biz_message_id {
                inner.biz_messages.handled.insert(biz_id, now);
            }
            flood.deliver = data.dest_node_id.map_or(true, |dest| dest == self.local_id);
        }

        let forwarded = match &data.biz_message_id {
            Some(biz_id) => inner.biz_messages.forwarded.contains_key(biz_id),
            None => inner.messages.forwarded.contains_key(&data.message_id),
        };
        if forwarded || data.dest_node_id == Some(self.local_id) {
            return flood;
        }

        inner.messages.forwarded.insert(data.message_id, now);
        if let Some(biz_id) = data.biz_message_id {
            inner.biz_messages.forwarded.insert(biz_id, now);
        }
        flood.relay = next_relay_count(data.relay_count);

        flood
    }

    /// Forgets identifiers older than [`MESSAGE_CACHE_TIME`].
    pub fn clear(&self) {
        self.clear_before(OffsetDateTime::now_utc() - MESSAGE_CACHE_TIME);
    }

    fn clear_before(&self, cutoff: OffsetDateTime) {
        let mut inner = self.inner.lock();
        inner.messages.clear_before(cutoff);
        inner.biz_messages.clear_before(cutoff);
    }

    /// The number of remembered identifiers, message and business ones combined.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.messages.forwarded.len()
            + inner.messages.handled.len()
            + inner.biz_messages.forwarded.len()
            + inner.biz_messages.handled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::DataType;

    fn flooded(message_id: u64, relay_count: i32) -> DataMessage {
        DataMessage {
            data: b"flood".to_vec(),
            data_type: DataType::Global,
            group_id: String::new(),
            message_id,
            message_code: 1,
            dest_node_id: None,
            src_node_id: NodeId::rand(),
            biz_message_id: None,
            relay_count,
            message_info: 0,
            expiration: u64::MAX,
        }
    }

    #[test]
    fn relay_counts() {
        assert_eq!(next_relay_count(0), None);
        assert_eq!(next_relay_count(1), Some(0));
        assert_eq!(next_relay_count(3), Some(2));
        assert_eq!(next_relay_count(-1), Some(-1));
    }

    #[test]
    fn flood_is_delivered_and_relayed_once() {
        let manager = MessageManager::new(NodeId::rand());
        let data = flooded(42, 3);

        assert_eq!(
            manager.on_flood(&data),
            Flood {
                deliver: true,
                relay: Some(2)
            }
        );
        assert_eq!(
            manager.on_flood(&data),
            Flood {
                deliver: false,
                relay: None
            }
        );
    }

    #[test]
    fn relay_count_bounds_the_flood() {
        let manager = MessageManager::new(NodeId::rand());

        // Out of hops: delivered here, not passed on.
        let last_hop = manager.on_flood(&flooded(1, 0));
        assert!(last_hop.deliver);
        assert_eq!(last_hop.relay, None);

        let unbounded = manager.on_flood(&flooded(2, -1));
        assert_eq!(unbounded.relay, Some(-1));
    }

    #[test]
    fn biz_id_dedups_across_message_ids() {
        let manager = MessageManager::new(NodeId::rand());
        let biz_id = [9u8; BIZ_MESSAGE_ID_LENGTH];

        let mut first = flooded(1, -1);
        first.biz_message_id = Some(biz_id);
        let mut second = flooded(2, -1);
        second.biz_message_id = Some(biz_id);

        assert!(manager.on_flood(&first).deliver);
        assert_eq!(
            manager.on_flood(&second),
            Flood {
                deliver: false,
                relay: None
            }
        );
        assert!(manager.is_handled(1));
        assert!(!manager.is_handled(2));
    }

    #[test]
    fn own_floods_come_back_ignored() {
        let manager = MessageManager::new(NodeId::rand());
        let data = flooded(manager.gen_message_id(), -1);

        assert_eq!(
            manager.on_flood(&data),
            Flood {
                deliver: false,
                relay: None
            }
        );
    }

    #[test]
    fn destination_decides_delivery_and_relay() {
        let local_id = NodeId::rand();
        let manager = MessageManager::new(local_id);

        // Addressed to us: delivered, the flood stops here.
        let mut to_us = flooded(1, -1);
        to_us.dest_node_id = Some(local_id);
        assert_eq!(
            manager.on_flood(&to_us),
            Flood {
                deliver: true,
                relay: None
            }
        );

        // Addressed elsewhere: only passed on.
        let mut to_other = flooded(2, -1);
        to_other.dest_node_id = Some(NodeId::rand());
        assert_eq!(
            manager.on_flood(&to_other),
            Flood {
                deliver: false,
                relay: Some(-1)
            }
        );
    }

    #[test]
    fn message_ids_carry_the_node_prefix() {
        let id = NodeId::rand();
        let manager = MessageManager::new(id);

        let first = manager.gen_message_id();
        let second = manager.gen_message_id();

        assert_eq!((first >> 32) as u32, id.forward_id());
        assert_eq!(first as u32, 1);
        assert_eq!(second as u32, 2);
    }

    #[test]
    fn generated_ids_are_already_seen() {
        let manager = MessageManager::new(NodeId::rand());
        let message_id = manager.gen_message_id();

        assert!(manager.is_forwarded(message_id));
        assert!(manager.is_handled(message_id));
    }

    #[test]
    fn handled_and_forwarded_are_tracked_apart() {
        let manager = MessageManager::new(NodeId::rand());

        manager.handle(7);
        assert!(manager.is_handled(7));
        assert!(!manager.is_forwarded(7));

        manager.forward(8);
        assert!(manager.is_forwarded(8));
        assert!(!manager.is_handled(8));
    }

    #[test]
    fn biz_ids() {
        let manager = MessageManager::new(NodeId::rand());
        let biz_id = [3u8; BIZ_MESSAGE_ID_LENGTH];

        assert!(!manager.is_handled_biz(&biz_id));
        manager.handle_biz(biz_id);
        manager.forward_biz(biz_id);
        assert!(manager.is_handled_biz(&biz_id));
        assert!(manager.is_forwarded_biz(&biz_id));
    }

    #[test]
    fn clear_keeps_recent_entries() {
        let manager = MessageManager::new(NodeId::rand());
        manager.forward(1);
        manager.handle_biz([1u8; BIZ_MESSAGE_ID_LENGTH]);

        manager.clear();
        assert_eq!(manager.len(), 2);

        // Everything is older than a cutoff in the future.
        manager.clear_before(OffsetDateTime::now_utc() + Duration::seconds(1));
        assert!(manager.is_empty());
    }
}
