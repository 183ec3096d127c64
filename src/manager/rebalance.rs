//! Rebalancing orchestrator.
//!
//! Invoked by the manager on join and on failure. The rebalancer first
//! plans every key movement from routing-table deltas (storage nodes are
//! never asked to recompute routing), then runs the quiescence protocol:
//! pause every affected node, wait for in-flight primary writes to
//! drain, execute the movements, resume. Any individual RPC failure is
//! logged and that movement skipped; the next membership event will
//! recompute what is still out of place.

use crate::config::ManagerConfig;
use crate::routing::RoutingTable;
use crate::types::NodeAddress;
use crate::wire::{self, payload, MessageType};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Keys per manager↔storage RPC during movement execution.
const MOVE_BATCH_KEYS: usize = 128;

/// Planned key movements for one join or leave event.
#[derive(Debug, Default)]
struct RebalancePlan {
    /// Copy these keys from source to destination, batched per pair.
    copies: BTreeMap<(NodeAddress, NodeAddress), Vec<String>>,

    /// Delete these keys from a node that fell out of a replica set.
    deletes: BTreeMap<NodeAddress, Vec<String>>,

    /// Every node touched by the plan, the joining/failed node included.
    affected: BTreeSet<NodeAddress>,
}

impl RebalancePlan {
    fn is_empty(&self) -> bool {
        self.copies.is_empty() && self.deletes.is_empty()
    }

    fn add_copy(&mut self, source: NodeAddress, dest: NodeAddress, key: String) {
        self.affected.insert(source.clone());
        self.affected.insert(dest.clone());
        self.copies.entry((source, dest)).or_default().push(key);
    }

    fn add_delete(&mut self, dest: NodeAddress, key: String) {
        self.affected.insert(dest.clone());
        self.deletes.entry(dest).or_default().push(key);
    }
}

/// Orchestrates key movements on membership changes.
pub struct Rebalancer {
    rpc_timeout: Duration,
    poll_interval: Duration,
    max_poll_attempts: usize,
}

impl Rebalancer {
    /// Build from the manager configuration.
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            rpc_timeout: config.rpc_timeout,
            poll_interval: config.availability_poll_interval,
            max_poll_attempts: config.availability_max_attempts,
        }
    }

    /// Restore the replica-set invariant after `new_id` joined.
    ///
    /// `table` is the post-join ring (the new node already inserted).
    pub async fn join_rebalance(&self, table: &RoutingTable, new_id: &str) {
        if table.physical_node_count() < 2 {
            return;
        }
        let Some(new_addr) = table.address_of(new_id) else {
            warn!(node_id = new_id, "joining node missing from table");
            return;
        };
        let pre = table.without_node(new_id);

        // The keys that can possibly move all live on the physical
        // successors of the new node's virtual tokens.
        let mut successors: BTreeSet<NodeAddress> = BTreeSet::new();
        for token in table.tokens_of(new_id) {
            if let Some(entry) = table.physical_successor_after(token, new_id) {
                successors.insert(entry.address.clone());
            }
        }

        let mut plan = RebalancePlan::default();
        plan.affected.insert(new_addr.clone());
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for holder in &successors {
            for key in self.fetch_all_keys(holder).await {
                // Several successors can report the same key.
                if !seen.insert(key.clone()) {
                    continue;
                }
                let new_set = table.replica_set(&key);
                if !new_set.iter().any(|e| e.node_id == new_id) {
                    continue;
                }
                let old_set = pre.replica_set(&key);
                let Some(old_primary) = old_set.first() else {
                    continue;
                };
                plan.add_copy(old_primary.address.clone(), new_addr.clone(), key.clone());
                // The node the join pushed out of the replica set gives
                // the key up.
                for old_entry in &old_set {
                    if !new_set.iter().any(|e| e.node_id == old_entry.node_id) {
                        plan.add_delete(old_entry.address.clone(), key.clone());
                    }
                }
            }
        }

        info!(
            node_id = new_id,
            copies = plan.copies.values().map(Vec::len).sum::<usize>(),
            deletes = plan.deletes.values().map(Vec::len).sum::<usize>(),
            "join rebalance planned"
        );
        self.execute(plan).await;
    }

    /// Restore the replica-set invariant after `failed_id` expired.
    ///
    /// `pre` is the pre-removal ring (the failed node still present);
    /// the caller removes it from membership afterwards.
    pub async fn leave_rebalance(&self, pre: &RoutingTable, failed_id: &str) {
        let post = pre.without_node(failed_id);
        if post.is_empty() {
            warn!(node_id = failed_id, "no nodes remaining, skipping rebalance");
            return;
        }

        // Survivor neighbors of each vacated slot hold every key the
        // failed node replicated.
        let mut neighbors: BTreeSet<NodeAddress> = BTreeSet::new();
        for token in pre.tokens_of(failed_id) {
            if let Some(entry) = pre.physical_predecessor_of(token, failed_id) {
                neighbors.insert(entry.address.clone());
            }
            if let Some(entry) = pre.physical_successor_after(token, failed_id) {
                neighbors.insert(entry.address.clone());
            }
        }

        let mut keys: BTreeSet<String> = BTreeSet::new();
        for neighbor in &neighbors {
            keys.extend(self.fetch_all_keys(neighbor).await);
        }

        let mut plan = RebalancePlan::default();
        if let Some(failed_addr) = pre.address_of(failed_id) {
            plan.affected.insert(failed_addr);
        }
        for key in keys {
            let pre_set = pre.replica_set(&key);
            if !pre_set.iter().any(|e| e.node_id == failed_id) {
                continue;
            }
            let post_set = post.replica_set(&key);
            let Some(source) = post_set.first() else {
                continue;
            };
            // The replacement replica is the one member of the new set
            // that was not already holding the key.
            let newcomer = post_set
                .iter()
                .find(|e| !pre_set.iter().any(|p| p.node_id == e.node_id));
            let Some(newcomer) = newcomer else {
                continue;
            };
            if newcomer.node_id == source.node_id {
                // K=1 and the failed node was the only holder: nothing
                // survives to copy from.
                debug!(key = %key, "no surviving replica holds the key");
                continue;
            }
            plan.add_copy(source.address.clone(), newcomer.address.clone(), key);
        }

        info!(
            node_id = failed_id,
            copies = plan.copies.values().map(Vec::len).sum::<usize>(),
            "leave rebalance planned"
        );
        self.execute(plan).await;
    }

    /// Quiescence protocol around the planned movements.
    async fn execute(&self, plan: RebalancePlan) {
        if plan.is_empty() {
            return;
        }

        for addr in &plan.affected {
            self.pause_node(addr).await;
        }
        for addr in &plan.affected {
            self.wait_for_availability(addr).await;
        }

        for ((source, dest), keys) in &plan.copies {
            for chunk in keys.chunks(MOVE_BATCH_KEYS) {
                self.copy_keys(source, dest, chunk).await;
            }
        }
        for (dest, keys) in &plan.deletes {
            for chunk in keys.chunks(MOVE_BATCH_KEYS) {
                self.delete_keys(dest, chunk).await;
            }
        }

        for addr in &plan.affected {
            self.resume_node(addr).await;
        }
    }

    /// Snapshot a node's key set; a failed RPC yields an empty list.
    async fn fetch_all_keys(&self, addr: &NodeAddress) -> Vec<String> {
        match wire::call(addr, self.rpc_timeout, MessageType::GetAllKeys, "").await {
            Ok((MessageType::AllKeys, body)) => payload::parse_all_keys(&body),
            Ok((other, _)) => {
                warn!(addr = %addr, ?other, "unexpected reply to key snapshot");
                Vec::new()
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "key snapshot failed");
                Vec::new()
            }
        }
    }

    async fn pause_node(&self, addr: &NodeAddress) {
        match wire::call(addr, self.rpc_timeout, MessageType::PauseNode, "").await {
            Ok((MessageType::PauseAck, _)) => debug!(addr = %addr, "node paused"),
            Ok((other, _)) => warn!(addr = %addr, ?other, "unexpected pause reply"),
            Err(e) => warn!(addr = %addr, error = %e, "pause failed"),
        }
    }

    async fn resume_node(&self, addr: &NodeAddress) {
        match wire::call(addr, self.rpc_timeout, MessageType::ResumeNode, "").await {
            Ok((MessageType::ResumeAck, _)) => debug!(addr = %addr, "node resumed"),
            Ok((other, _)) => warn!(addr = %addr, ?other, "unexpected resume reply"),
            Err(e) => warn!(addr = %addr, error = %e, "resume failed"),
        }
    }

    /// Poll until the node reports an empty lock table, best effort.
    async fn wait_for_availability(&self, addr: &NodeAddress) {
        for _ in 0..self.max_poll_attempts {
            match wire::call(addr, self.rpc_timeout, MessageType::AvailabilityCheck, "").await {
                Ok((MessageType::AvailableStatus, status)) if status == "yes" => return,
                Ok((MessageType::AvailableStatus, _)) => {}
                Ok((other, _)) => {
                    warn!(addr = %addr, ?other, "unexpected availability reply");
                    return;
                }
                Err(e) => {
                    warn!(addr = %addr, error = %e, "availability check failed");
                    return;
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        warn!(addr = %addr, "node never drained, proceeding anyway");
    }

    /// Move one batch: read the pairs from the source, replicate them to
    /// the destination.
    async fn copy_keys(&self, source: &NodeAddress, dest: &NodeAddress, keys: &[String]) {
        let request = payload::encode_keys(keys.iter().map(String::as_str));
        let values = match wire::call(source, self.rpc_timeout, MessageType::ManagerGet, &request)
            .await
        {
            Ok((MessageType::GetOk, body)) => payload::parse_values(&body),
            Ok((other, body)) => {
                warn!(source = %source, ?other, reply = %body, "copy source read failed");
                return;
            }
            Err(e) => {
                warn!(source = %source, error = %e, "copy source read failed");
                return;
            }
        };
        if values.len() != keys.len() {
            warn!(
                source = %source,
                expected = keys.len(),
                got = values.len(),
                "copy source returned misaligned values"
            );
            return;
        }

        let pairs = payload::encode_pairs(
            keys.iter()
                .zip(values.iter())
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        match wire::call(dest, self.rpc_timeout, MessageType::ReplPut, &pairs).await {
            Ok((MessageType::PutOk, _)) => {
                debug!(source = %source, dest = %dest, keys = keys.len(), "batch copied")
            }
            Ok((other, _)) => warn!(dest = %dest, ?other, "unexpected copy reply"),
            Err(e) => warn!(dest = %dest, error = %e, "batch copy failed"),
        }
    }

    async fn delete_keys(&self, dest: &NodeAddress, keys: &[String]) {
        let request = payload::encode_keys(keys.iter().map(String::as_str));
        match wire::call(dest, self.rpc_timeout, MessageType::ManagerDelete, &request).await {
            Ok((MessageType::DeleteOk, _)) => {
                debug!(dest = %dest, keys = keys.len(), "batch deleted")
            }
            Ok((other, _)) => warn!(dest = %dest, ?other, "unexpected delete reply"),
            Err(e) => warn!(dest = %dest, error = %e, "batch delete failed"),
        }
    }
}
