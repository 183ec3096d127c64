//! Manager-side membership state: the routing table plus last-heartbeat
//! timestamps.
//!
//! Lock order is table before heartbeats, and neither lock is ever held
//! across network I/O; callers take snapshots and work on those.

use crate::routing::RoutingTable;
use crate::types::NodeAddress;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::info;

/// Routing table and liveness bookkeeping.
pub struct MembershipState {
    table: RwLock<RoutingTable>,
    heartbeats: Mutex<HashMap<String, Instant>>,
}

impl MembershipState {
    /// Create empty state with the cluster replication factor.
    pub fn new(replication_factor: usize) -> Self {
        Self {
            table: RwLock::new(RoutingTable::new(replication_factor)),
            heartbeats: Mutex::new(HashMap::new()),
        }
    }

    /// Current routing table.
    pub fn table_snapshot(&self) -> RoutingTable {
        self.table.read().clone()
    }

    /// Register (or re-register) a storage node: replace any existing
    /// entries for the id, insert its virtual tokens, reset liveness.
    pub fn register(&self, node_id: &str, address: NodeAddress) -> RoutingTable {
        let snapshot = {
            let mut table = self.table.write();
            table.insert_node(node_id, address);
            table.clone()
        };
        self.heartbeats
            .lock()
            .insert(node_id.to_string(), Instant::now());
        info!(
            node_id,
            nodes = snapshot.physical_node_count(),
            "storage node registered"
        );
        snapshot
    }

    /// Record a heartbeat for a node.
    pub fn record_heartbeat(&self, node_id: &str) {
        self.heartbeats
            .lock()
            .insert(node_id.to_string(), Instant::now());
    }

    /// Physical nodes whose last heartbeat is older than `timeout`.
    ///
    /// A node on the ring with no recorded heartbeat at all counts as
    /// expired. This is a pure scan; removal is a separate step so the
    /// caller can run leave-rebalancing against the pre-removal ring.
    pub fn expired_nodes(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let ids: Vec<String> = self.table.read().physical_nodes().into_keys().collect();
        let heartbeats = self.heartbeats.lock();
        ids.into_iter()
            .filter(|id| match heartbeats.get(id) {
                Some(last) => now.duration_since(*last) > timeout,
                None => true,
            })
            .collect()
    }

    /// Drop a node from the ring and forget its liveness entry.
    pub fn remove(&self, node_id: &str) -> RoutingTable {
        let snapshot = {
            let mut table = self.table.write();
            table.remove_node(node_id);
            table.clone()
        };
        self.heartbeats.lock().remove(node_id);
        info!(
            node_id,
            nodes = snapshot.physical_node_count(),
            "storage node removed"
        );
        snapshot
    }
}
