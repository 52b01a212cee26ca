use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::{entrance_nodes, send_to, Group, GroupNetwork};
use crate::{core::id::NodeId, error::NetworkError};

/// Messages for this group go to every proposer group.
pub const FULL_NODE_VIRTUAL_GROUP_ID: &str = "full_node_virtual_group_id";

/// The groups the local node is a member of.
pub struct GroupManager {
    local_id: NodeId,
    groups: RwLock<HashMap<String, Arc<Mutex<Group>>>>,
}

impl GroupManager {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            groups: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn group(&self, id: &str) -> Option<Arc<Mutex<Group>>> {
        self.groups.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.groups.read().contains_key(id)
    }

    /// Creates the group, or rebuilds it if it exists, then brings up its links.
    ///
    /// Fails if the local node isn't among the members.
    pub fn build_group(
        &self,
        net: &dyn GroupNetwork,
        id: &str,
        members: Vec<NodeId>,
    ) -> Result<(), NetworkError> {
        if !members.contains(&self.local_id) {
            debug!(group = id, members = members.len(), "not a member, group not built");
            return Err(NetworkError::NotGroupMember(id.to_owned()));
        }

        let group = {
            let mut groups = self.groups.write();
            match groups.get(id) {
                Some(group) => {
                    debug!(group = id, members = members.len(), "rebuilding group");
                    group.lock().rebuild(members, &self.local_id);
                    Arc::clone(group)
                }
                None => {
                    info!(group = id, members = members.len(), "building group");
                    let group = Arc::new(Mutex::new(Group::new(id, members, &self.local_id)));
                    groups.insert(id.to_owned(), Arc::clone(&group));
                    group
                }
            }
        };

        group.lock().do_refresh(net);
        Ok(())
    }

    /// Removes the group. Peers left in no group and absent from the routing table are reported
    /// as disconnect candidates.
    pub fn remove_group(&self, net: &dyn GroupNetwork, id: &str) -> bool {
        let Some(group) = self.groups.write().remove(id) else {
            debug!(group = id, "group to remove not found");
            return false;
        };

        info!(group = id, "removing group");
        for peer in group.lock().on_remove(net) {
            if net.kad_addr(&peer).is_none() {
                debug!(group = id, %peer, "peer left without a group");
            }
        }

        true
    }

    /// Refreshes the links of every group.
    pub fn do_refresh(&self, net: &dyn GroupNetwork) {
        let groups: Vec<_> = self.groups.read().values().cloned().collect();
        for group in groups {
            group.lock().do_refresh(net);
        }
    }

    /// Sends a group packet: along our links if we're a member, otherwise into the group through
    /// entrance nodes picked from `members`.
    pub fn broadcast(
        &self,
        net: &dyn GroupNetwork,
        id: &str,
        packet: Bytes,
        code: u32,
        members: &[NodeId],
    ) {
        if id == FULL_NODE_VIRTUAL_GROUP_ID {
            net.broadcast_to_proposers(packet, code);
            return;
        }

        if let Some(group) = self.group(id) {
            group.lock().broadcast(net, &packet, code);
            return;
        }

        let nodes = entrance_nodes(net, members);
        debug!(group = id, code, entrances = nodes.len(), "external group broadcast");
        send_to(net, &nodes, &packet, code);
    }

    /// Forwards a received group packet along our links.
    pub fn on_broadcast(&self, net: &dyn GroupNetwork, id: &str, packet: Bytes, code: u32) {
        if id == FULL_NODE_VIRTUAL_GROUP_ID {
            net.broadcast_to_proposers(packet, code);
            return;
        }

        match self.group(id) {
            Some(group) => group.lock().broadcast(net, &packet, code),
            None => debug!(group = id, code, "broadcast for an unknown group"),
        }
    }

    /// Sends the packet to random members of the group.
    pub fn broadcast_random(
        &self,
        net: &dyn GroupNetwork,
        id: &str,
        packet: Bytes,
        code: u32,
    ) -> Result<(), NetworkError> {
        let group = self
            .group(id)
            .ok_or_else(|| NetworkError::NotGroupMember(id.to_owned()))?;
        group.lock().broadcast_random(net, &packet, code);

        Ok(())
    }

    /// The members of the group, if we're part of it.
    pub fn members(&self, id: &str) -> Option<Vec<NodeId>> {
        self.group(id).map(|group| group.lock().members().to_vec())
    }
}
