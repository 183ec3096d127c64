//! Consistent-hash ring with virtual nodes.
//!
//! Each physical node is represented by [`VIRTUAL_TOKENS_PER_NODE`]
//! entries whose tokens are derived deterministically from
//! `(node_id, virtual_index)`. Manager, storage nodes, and clients all
//! compute the same tokens from the same table, so there is no
//! per-process salt anywhere in the hash.

use crate::types::{NodeAddress, VIRTUAL_TOKENS_PER_NODE};
use std::collections::BTreeMap;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Hash raw bytes with the cluster-wide 64-bit hash.
pub fn hash_key(bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes);
    hasher.finish()
}

/// Token for one virtual slot of a physical node.
pub fn token_for(node_id: &str, virtual_index: usize) -> u64 {
    hash_key(format!("{node_id}:{virtual_index}").as_bytes())
}

/// One virtual slot on the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingEntry {
    /// Owning physical node.
    pub node_id: String,

    /// The physical node's advertised address.
    pub address: NodeAddress,

    /// Position on the ring.
    pub token: u64,
}

/// The routing table: a sorted token ring plus the replication factor.
///
/// Entries are always sorted ascending by `(token, node_id)`; the
/// node_id tiebreak keeps successor walks deterministic even on token
/// collisions. A physical node is either fully present (all its virtual
/// tokens) or fully absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    entries: Vec<RingEntry>,
    replication_factor: usize,
}

impl RoutingTable {
    /// Create an empty table.
    pub fn new(replication_factor: usize) -> Self {
        Self {
            entries: Vec::new(),
            replication_factor: replication_factor.max(1),
        }
    }

    /// Build a table from parsed entries, restoring the sort invariant.
    pub fn from_entries(mut entries: Vec<RingEntry>, replication_factor: usize) -> Self {
        entries.sort_by(|a, b| (a.token, &a.node_id).cmp(&(b.token, &b.node_id)));
        Self {
            entries,
            replication_factor: replication_factor.max(1),
        }
    }

    /// The replication factor K.
    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// All ring entries in token order.
    pub fn entries(&self) -> &[RingEntry] {
        &self.entries
    }

    /// Number of ring entries (virtual, not physical).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ring has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a physical node is on the ring.
    pub fn contains_node(&self, node_id: &str) -> bool {
        self.entries.iter().any(|e| e.node_id == node_id)
    }

    /// Distinct physical nodes, keyed by id.
    pub fn physical_nodes(&self) -> BTreeMap<String, NodeAddress> {
        self.entries
            .iter()
            .map(|e| (e.node_id.clone(), e.address.clone()))
            .collect()
    }

    /// Number of distinct physical nodes.
    pub fn physical_node_count(&self) -> usize {
        self.physical_nodes().len()
    }

    /// Advertised address of a physical node, if present.
    pub fn address_of(&self, node_id: &str) -> Option<NodeAddress> {
        self.entries
            .iter()
            .find(|e| e.node_id == node_id)
            .map(|e| e.address.clone())
    }

    /// Insert (or re-insert) a physical node with all its virtual tokens.
    ///
    /// Any existing entries for the id are replaced, so a re-registration
    /// cannot leave a node partially present.
    pub fn insert_node(&mut self, node_id: &str, address: NodeAddress) {
        self.entries.retain(|e| e.node_id != node_id);
        for v in 0..VIRTUAL_TOKENS_PER_NODE {
            self.entries.push(RingEntry {
                node_id: node_id.to_string(),
                address: address.clone(),
                token: token_for(node_id, v),
            });
        }
        self.entries
            .sort_by(|a, b| (a.token, &a.node_id).cmp(&(b.token, &b.node_id)));
    }

    /// Remove every virtual token of a physical node.
    pub fn remove_node(&mut self, node_id: &str) {
        self.entries.retain(|e| e.node_id != node_id);
    }

    /// A copy of this table without the given physical node.
    pub fn without_node(&self, node_id: &str) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|e| e.node_id != node_id)
            .cloned()
            .collect();
        Self {
            entries,
            replication_factor: self.replication_factor,
        }
    }

    /// Index of the first entry whose token is `>= hash`, wrapping to 0
    /// past the top of the ring.
    fn successor_index(&self, hash: u64) -> usize {
        let idx = self.entries.partition_point(|e| e.token < hash);
        if idx == self.entries.len() {
            0
        } else {
            idx
        }
    }

    /// The primary entry for a key.
    pub fn primary_for(&self, key: &str) -> Option<&RingEntry> {
        if self.entries.is_empty() {
            return None;
        }
        Some(&self.entries[self.successor_index(hash_key(key.as_bytes()))])
    }

    /// The ordered replica set for a key: the first K distinct physical
    /// nodes walking the ring forward from the key's hash. With fewer
    /// than K physical nodes, the set is all of them.
    pub fn replica_set(&self, key: &str) -> Vec<&RingEntry> {
        self.replica_set_for_hash(hash_key(key.as_bytes()))
    }

    /// Replica set for a precomputed hash position.
    pub fn replica_set_for_hash(&self, hash: u64) -> Vec<&RingEntry> {
        if self.entries.is_empty() {
            return Vec::new();
        }
        let start = self.successor_index(hash);
        let mut replicas: Vec<&RingEntry> = Vec::with_capacity(self.replication_factor);
        for offset in 0..self.entries.len() {
            let entry = &self.entries[(start + offset) % self.entries.len()];
            if replicas.iter().any(|r| r.node_id == entry.node_id) {
                continue;
            }
            replicas.push(entry);
            if replicas.len() == self.replication_factor {
                break;
            }
        }
        replicas
    }

    /// The first distinct physical node encountered walking forward from
    /// (strictly after) `token`, skipping entries owned by `skip_id`.
    pub fn physical_successor_after(&self, token: u64, skip_id: &str) -> Option<&RingEntry> {
        self.neighbor_of(token, skip_id, true)
    }

    /// The first distinct physical node encountered walking backward from
    /// (strictly before) `token`, skipping entries owned by `skip_id`.
    pub fn physical_predecessor_of(&self, token: u64, skip_id: &str) -> Option<&RingEntry> {
        self.neighbor_of(token, skip_id, false)
    }

    fn neighbor_of(&self, token: u64, skip_id: &str, forward: bool) -> Option<&RingEntry> {
        if self.entries.is_empty() {
            return None;
        }
        let len = self.entries.len();
        let anchor = self.entries.partition_point(|e| e.token < token);
        for offset in 1..=len {
            let idx = if forward {
                (anchor + offset) % len
            } else {
                (anchor + len - offset) % len
            };
            let entry = &self.entries[idx];
            if entry.node_id != skip_id {
                return Some(entry);
            }
        }
        None
    }

    /// Virtual tokens owned by one physical node.
    pub fn tokens_of(&self, node_id: &str) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|e| e.node_id == node_id)
            .map(|e| e.token)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn table_with(ids: &[&str], factor: usize) -> RoutingTable {
        let mut table = RoutingTable::new(factor);
        for (i, id) in ids.iter().enumerate() {
            table.insert_node(id, NodeAddress::new("127.0.0.1", 6001 + i as u16));
        }
        table
    }

    #[test]
    fn empty_ring() {
        let table = RoutingTable::new(2);
        assert!(table.primary_for("key").is_none());
        assert!(table.replica_set("key").is_empty());
    }

    #[test]
    fn virtual_token_count() {
        let table = table_with(&["node1"], 1);
        assert_eq!(table.len(), VIRTUAL_TOKENS_PER_NODE);
        assert_eq!(table.physical_node_count(), 1);
    }

    #[test]
    fn sorted_and_unique() {
        let table = table_with(&["node1", "node2", "node3"], 2);
        let entries = table.entries();
        for pair in entries.windows(2) {
            assert!(
                (pair[0].token, &pair[0].node_id) < (pair[1].token, &pair[1].node_id),
                "ring must be strictly sorted by (token, node_id)"
            );
        }
    }

    #[test]
    fn insert_is_idempotent() {
        let mut table = table_with(&["node1", "node2"], 2);
        let before = table.entries().to_vec();
        table.insert_node("node1", NodeAddress::new("127.0.0.1", 6001));
        assert_eq!(table.entries(), &before[..]);
    }

    #[test]
    fn remove_is_all_or_nothing() {
        let mut table = table_with(&["node1", "node2"], 2);
        table.remove_node("node1");
        assert!(!table.contains_node("node1"));
        assert_eq!(table.len(), VIRTUAL_TOKENS_PER_NODE);
    }

    #[test]
    fn replica_set_distinct_physicals() {
        let table = table_with(&["node1", "node2", "node3", "node4", "node5"], 3);
        for i in 0..200 {
            let key = format!("key{i}");
            let replicas = table.replica_set(&key);
            assert_eq!(replicas.len(), 3);
            let ids: Vec<&str> = replicas.iter().map(|r| r.node_id.as_str()).collect();
            let mut dedup = ids.clone();
            dedup.dedup();
            assert_eq!(ids.len(), dedup.len(), "replica set repeated a node for {key}");
            assert_eq!(replicas[0].node_id, table.primary_for(&key).unwrap().node_id);
        }
    }

    #[test]
    fn replica_walk_is_deterministic() {
        let a = table_with(&["node1", "node2", "node3", "node4"], 3);
        let b = table_with(&["node4", "node3", "node2", "node1"], 3);
        for i in 0..100 {
            let key = format!("key{i}");
            let ids_a: Vec<_> = a.replica_set(&key).iter().map(|r| r.node_id.clone()).collect();
            let ids_b: Vec<_> = b.replica_set(&key).iter().map(|r| r.node_id.clone()).collect();
            assert_eq!(ids_a, ids_b);
        }
    }

    #[test]
    fn k_clamps_to_cluster_size() {
        let table = table_with(&["node1", "node2"], 5);
        let replicas = table.replica_set("key1");
        assert_eq!(replicas.len(), 2);
    }

    #[test]
    fn successor_wraps_at_top() {
        let table = table_with(&["node1", "node2", "node3"], 1);
        let top = table.entries().last().unwrap().token;
        // A hash above every token must wrap to the first entry.
        if top < u64::MAX {
            let wrapped = table.replica_set_for_hash(top.wrapping_add(1));
            assert_eq!(wrapped[0].node_id, table.entries()[0].node_id);
        }
    }

    #[test]
    fn tokens_are_process_independent() {
        // Pure function of the input bytes: recomputing gives the same ring.
        assert_eq!(token_for("node1", 0), token_for("node1", 0));
        assert_ne!(token_for("node1", 0), token_for("node1", 1));
        assert_ne!(token_for("node1", 0), token_for("node2", 0));
        assert_eq!(hash_key(b"key1"), hash_key(b"key1"));
    }

    #[test]
    fn primary_share_stays_balanced() {
        let ids = ["node1", "node2", "node3", "node4", "node5"];
        let table = table_with(&ids, 1);
        let mut counts: HashMap<String, usize> = HashMap::new();
        let samples = 20_000;
        for i in 0..samples {
            let key = format!("key{i}");
            let primary = table.primary_for(&key).unwrap();
            *counts.entry(primary.node_id.clone()).or_insert(0) += 1;
        }
        let expected = samples as f64 / ids.len() as f64;
        for (id, count) in &counts {
            let deviation = (*count as f64 - expected).abs() / expected;
            assert!(
                deviation < 0.10,
                "node {id} owns {count} of {samples} keys ({:.1}% off the mean)",
                deviation * 100.0
            );
        }
    }

    #[test]
    fn ownership_spread_seven_nodes() {
        let ids: Vec<String> = (1..=7).map(|i| format!("node{i}")).collect();
        let mut table = RoutingTable::new(1);
        for (i, id) in ids.iter().enumerate() {
            table.insert_node(id, NodeAddress::new("127.0.0.1", 6001 + i as u16));
        }
        let mut counts: HashMap<String, usize> = HashMap::new();
        let samples = 100_000;
        for i in 0..samples {
            let key = format!("lb_key_{i}");
            let primary = table.primary_for(&key).unwrap();
            *counts.entry(primary.node_id.clone()).or_insert(0) += 1;
        }
        let max = *counts.values().max().unwrap() as f64;
        let min = *counts.values().min().unwrap() as f64;
        let mean = samples as f64 / ids.len() as f64;
        assert!(
            (max - min) / mean < 0.15,
            "max-min spread {:.1}% of mean",
            (max - min) / mean * 100.0
        );
    }

    #[test]
    fn neighbors_skip_the_anchor_node() {
        let table = table_with(&["node1", "node2", "node3"], 2);
        for token in table.tokens_of("node1") {
            let succ = table.physical_successor_after(token, "node1").unwrap();
            assert_ne!(succ.node_id, "node1");
            let pred = table.physical_predecessor_of(token, "node1").unwrap();
            assert_ne!(pred.node_id, "node1");
        }
    }

    #[test]
    fn without_node_preserves_factor() {
        let table = table_with(&["node1", "node2", "node3"], 2);
        let smaller = table.without_node("node2");
        assert!(!smaller.contains_node("node2"));
        assert_eq!(smaller.replication_factor(), 2);
        assert_eq!(smaller.len(), 2 * VIRTUAL_TOKENS_PER_NODE);
    }
}
