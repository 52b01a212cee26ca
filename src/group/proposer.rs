//! Stake-weighted proposer groups.
//!
//! Proposers are split into a fast bucket, the few holding most of the stake, and a normal bucket
//! with everyone else. Each bucket is cut into fixed-size groups whose overlays carry the
//! messages addressed to all proposers.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::core::id::NodeId;

pub const FAST_GROUP_NAME: &str = "FastProposerGroup";
pub const FAST_GROUP_SIZE: usize = 100;
pub const NORMAL_GROUP_NAME: &str = "NormalProposerGroup";
pub const NORMAL_GROUP_SIZE: usize = 500;
/// The fast bucket never holds more proposers than this.
pub const MAX_FAST_SIZE: usize = 500;

// At most this share of the proposers is fast.
const FAST_SIZE_RATIO: f64 = 0.3;
// The fast bucket holds the proposers needed to exceed this share of the total stake.
const FAST_STAKE_NUMERATOR: u128 = 4;
const FAST_STAKE_DENOMINATOR: u128 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposer {
    pub id: NodeId,
    pub stake: u64,
}

/// A change the group manager has to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOp {
    Build { id: String, members: Vec<NodeId> },
    Remove(String),
}

/// A set of proposers cut into groups of `group_size`.
#[derive(Debug)]
pub struct ProposerBucket {
    name: &'static str,
    group_size: usize,
    proposers: Vec<Proposer>,
    group_count: usize,
}

impl ProposerBucket {
    pub fn new(name: &'static str, group_size: usize) -> Self {
        Self {
            name,
            group_size: group_size.max(1),
            proposers: Vec::new(),
            group_count: 0,
        }
    }

    pub fn group_name(&self, index: usize) -> String {
        format!("{}_{index}", self.name)
    }

    pub fn proposers(&self) -> &[Proposer] {
        &self.proposers
    }

    pub fn len(&self) -> usize {
        self.proposers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposers.is_empty()
    }

    pub fn group_count(&self) -> usize {
        self.group_count
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.proposers.iter().any(|p| p.id == *id)
    }

    fn count_groups(&self) -> usize {
        self.proposers.len().div_ceil(self.group_size)
    }

    /// The members of the group at `index`.
    pub fn members(&self, index: usize) -> Vec<NodeId> {
        let start = (index * self.group_size).min(self.proposers.len());
        let end = (start + self.group_size).min(self.proposers.len());

        self.proposers[start..end].iter().map(|p| p.id).collect()
    }

    fn build_op(&self, index: usize) -> GroupOp {
        GroupOp::Build {
            id: self.group_name(index),
            members: self.members(index),
        }
    }

    /// Replaces the proposers, ordered by identifier, and rebuilds every group. Groups past the
    /// new count are removed.
    pub fn build(&mut self, mut proposers: Vec<Proposer>) -> Vec<GroupOp> {
        proposers.sort_by(|a, b| a.id.cmp(&b.id));
        let old_count = self.group_count;
        self.proposers = proposers;
        self.group_count = self.count_groups();

        let mut ops: Vec<_> = (self.group_count..old_count)
            .map(|i| GroupOp::Remove(self.group_name(i)))
            .collect();
        ops.extend((0..self.group_count).map(|i| self.build_op(i)));

        ops
    }

    /// Appends proposers and rebuilds the groups whose membership changed: the last group and
    /// any new ones.
    pub fn add_proposers(&mut self, proposers: Vec<Proposer>) -> Vec<GroupOp> {
        if proposers.is_empty() {
            return Vec::new();
        }

        let first = self.group_count.saturating_sub(1);
        self.proposers.extend(proposers);
        self.group_count = self.count_groups();

        (first..self.group_count).map(|i| self.build_op(i)).collect()
    }

    /// Every group with its members.
    pub fn groups(&self) -> Vec<(String, Vec<NodeId>)> {
        (0..self.group_count)
            .map(|i| (self.group_name(i), self.members(i)))
            .collect()
    }
}

/// Splits the proposers between the fast and the normal bucket.
#[derive(Debug)]
pub struct ProposerManager {
    fast: ProposerBucket,
    normal: ProposerBucket,
    fast_stake_threshold: u64,
}

impl Default for ProposerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProposerManager {
    pub fn new() -> Self {
        Self {
            fast: ProposerBucket::new(FAST_GROUP_NAME, FAST_GROUP_SIZE),
            normal: ProposerBucket::new(NORMAL_GROUP_NAME, NORMAL_GROUP_SIZE),
            fast_stake_threshold: u64::MAX,
        }
    }

    pub fn fast(&self) -> &ProposerBucket {
        &self.fast
    }

    pub fn normal(&self) -> &ProposerBucket {
        &self.normal
    }

    /// Proposers added later join the fast bucket if their stake reaches this.
    pub fn fast_stake_threshold(&self) -> u64 {
        self.fast_stake_threshold
    }

    /// Splits the proposers and builds both buckets.
    ///
    /// Ranked by stake, the fast bucket takes the top proposers until their stake exceeds 80% of
    /// the total, searching no further than `min(ceil(0.3 * n), 500)` entries. If the search ends
    /// first, the fast bucket is the whole search window.
    pub fn build(&mut self, mut proposers: Vec<Proposer>) -> Vec<GroupOp> {
        let mut seen = HashSet::new();
        proposers.retain(|p| seen.insert(p.id));
        proposers.sort_by(|a, b| b.stake.cmp(&a.stake));

        let total: u128 = proposers.iter().map(|p| p.stake as u128).sum();
        let window = ((proposers.len() as f64 * FAST_SIZE_RATIO).ceil() as usize)
            .min(MAX_FAST_SIZE)
            .min(proposers.len());

        let mut fast_size = window;
        let mut stake: u128 = 0;
        for (i, p) in proposers.iter().take(window).enumerate() {
            stake += p.stake as u128;
            if stake * FAST_STAKE_DENOMINATOR > total * FAST_STAKE_NUMERATOR {
                fast_size = i + 1;
                break;
            }
        }

        self.fast_stake_threshold = match fast_size {
            0 => u64::MAX,
            n => proposers[n - 1].stake,
        };

        let normal = proposers.split_off(fast_size);
        info!(
            fast = proposers.len(),
            normal = normal.len(),
            threshold = self.fast_stake_threshold,
            "building proposer groups"
        );

        let mut ops = self.fast.build(proposers);
        ops.extend(self.normal.build(normal));

        ops
    }

    /// Adds proposers not yet known: the ones staking at least the fast threshold join the fast
    /// bucket, the others the normal one.
    pub fn add_proposers(&mut self, proposers: Vec<Proposer>) -> Vec<GroupOp> {
        let mut seen = HashSet::new();
        let (fast, normal): (Vec<_>, Vec<_>) = proposers
            .into_iter()
            .filter(|p| !self.fast.contains(&p.id) && !self.normal.contains(&p.id))
            .filter(|p| seen.insert(p.id))
            .partition(|p| p.stake >= self.fast_stake_threshold);

        debug!(fast = fast.len(), normal = normal.len(), "adding proposers");

        let mut ops = self.fast.add_proposers(fast);
        ops.extend(self.normal.add_proposers(normal));

        ops
    }

    /// Every proposer group of both buckets with its members.
    pub fn groups(&self) -> Vec<(String, Vec<NodeId>)> {
        let mut groups = self.fast.groups();
        groups.extend(self.normal.groups());

        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposers(n: usize, stake: u64) -> Vec<Proposer> {
        (0..n)
            .map(|_| Proposer {
                id: NodeId::rand(),
                stake,
            })
            .collect()
    }

    fn built(ops: &[GroupOp]) -> Vec<&str> {
        ops.iter()
            .filter_map(|op| match op {
                GroupOp::Build { id, .. } => Some(id.as_str()),
                GroupOp::Remove(_) => None,
            })
            .collect()
    }

    #[test]
    fn fast_bucket_split_by_stake() {
        let mut manager = ProposerManager::new();
        let mut all = proposers(5, 1000);
        all.extend(proposers(95, 10));

        // 5000 of 5950 exceeds 80% at the fifth proposer.
        let ops = manager.build(all);
        assert_eq!(manager.fast().len(), 5);
        assert_eq!(manager.normal().len(), 95);
        assert_eq!(manager.fast_stake_threshold(), 1000);
        assert!(manager.fast().proposers().iter().all(|p| p.stake == 1000));
        assert_eq!(built(&ops), vec!["FastProposerGroup_0", "NormalProposerGroup_0"]);

        let mut more = proposers(3, 1000);
        more.extend(proposers(3, 10));
        manager.add_proposers(more);
        assert_eq!(manager.fast().len(), 8);
        assert_eq!(manager.normal().len(), 98);
    }

    #[test]
    fn fast_bucket_capped_by_window() {
        let mut manager = ProposerManager::new();
        // Equal stakes: 80% is only exceeded after the 30% window.
        manager.build(proposers(10, 7));

        assert_eq!(manager.fast().len(), 3);
        assert_eq!(manager.normal().len(), 7);
        assert_eq!(manager.fast_stake_threshold(), 7);
    }

    #[test]
    fn empty_build() {
        let mut manager = ProposerManager::new();
        assert!(manager.build(Vec::new()).is_empty());
        assert_eq!(manager.fast_stake_threshold(), u64::MAX);

        // Everything added lands in the normal bucket.
        manager.add_proposers(proposers(2, u64::MAX - 1));
        assert!(manager.fast().is_empty());
        assert_eq!(manager.normal().len(), 2);
    }

    #[test]
    fn bucket_groups_and_rebuild() {
        let mut bucket = ProposerBucket::new("B", 4);
        let members = proposers(10, 1);

        let ops = bucket.build(members.clone());
        assert_eq!(bucket.group_count(), 3);
        assert_eq!(built(&ops), vec!["B_0", "B_1", "B_2"]);
        assert_eq!(bucket.members(2).len(), 2);

        // Identifiers are ordered, so rebuilding the same set yields the same groups.
        let mut shuffled = members.clone();
        shuffled.reverse();
        assert_eq!(bucket.build(shuffled), ops);

        let ops = bucket.build(members[..5].to_vec());
        assert_eq!(ops[0], GroupOp::Remove("B_2".into()));
        assert_eq!(built(&ops), vec!["B_0", "B_1"]);
    }

    #[test]
    fn add_rebuilds_trailing_groups_only() {
        let mut bucket = ProposerBucket::new("B", 4);
        bucket.build(proposers(6, 1));

        // The second group has room for two, the rest opens a third.
        let ops = bucket.add_proposers(proposers(3, 1));
        assert_eq!(built(&ops), vec!["B_1", "B_2"]);
        assert_eq!(bucket.members(1).len(), 4);
        assert_eq!(bucket.members(2).len(), 1);

        assert!(bucket.add_proposers(Vec::new()).is_empty());
    }

    #[test]
    fn known_proposers_are_skipped() {
        let mut manager = ProposerManager::new();
        let all = proposers(10, 5);
        manager.build(all.clone());

        assert!(manager.add_proposers(all).is_empty());
        assert_eq!(manager.groups().len(), 2);
    }
}
