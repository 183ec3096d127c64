//! Client router.
//!
//! Clients hash keys locally against a cached routing table and talk to
//! storage nodes directly. The table is fetched from the manager on
//! first use and refreshed after every failed attempt — a stale table is
//! legitimate and is only discovered through RPC failures.

use crate::config::ClientConfig;
use crate::routing::RoutingTable;
use crate::types::{key_valid, value_valid, NodeAddress};
use crate::wire::{self, payload, ErrorKind, MessageType};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// A store client.
pub struct Client {
    config: ClientConfig,
    table: RwLock<RoutingTable>,
}

impl Client {
    /// Create a client. The routing table is fetched lazily on first
    /// use.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            table: RwLock::new(RoutingTable::new(1)),
        }
    }

    /// Fetch a fresh routing table from the manager.
    pub async fn refresh_table(&self) -> bool {
        let result = wire::call(
            &self.config.manager_addr(),
            self.config.rpc_timeout,
            MessageType::ClientHello,
            "",
        )
        .await;
        match result {
            Ok((MessageType::TablePush, body)) => match payload::parse_table(&body) {
                Ok(table) => {
                    debug!(
                        nodes = table.physical_node_count(),
                        replication = table.replication_factor(),
                        "routing table refreshed"
                    );
                    *self.table.write() = table;
                    true
                }
                Err(e) => {
                    warn!(error = %e, "manager sent unparseable table");
                    false
                }
            },
            Ok((other, _)) => {
                warn!(?other, "manager replied without table");
                false
            }
            Err(e) => {
                warn!(error = %e, "table refresh failed");
                false
            }
        }
    }

    async fn ensure_table(&self) -> bool {
        if !self.table.read().is_empty() {
            return true;
        }
        self.refresh_table().await
    }

    /// The replica for a given retry attempt, recomputed against the
    /// current table so refreshes take effect mid-loop.
    fn replica_for_attempt(&self, key: &str, attempt: usize) -> Option<(String, NodeAddress)> {
        let table = self.table.read();
        table
            .replica_set(key)
            .get(attempt)
            .map(|e| (e.node_id.clone(), e.address.clone()))
    }

    fn max_attempts(&self) -> usize {
        let table = self.table.read();
        table
            .replication_factor()
            .min(table.physical_node_count())
            .max(1)
    }

    /// Store one pair. Returns the id of the acknowledging primary, or
    /// `None` once every replica attempt is exhausted.
    pub async fn put(&self, key: &str, value: &str) -> Option<String> {
        if !key_valid(key) {
            warn!(key, "rejecting put: bad key");
            return None;
        }
        if !value_valid(value) {
            warn!(key, "rejecting put: bad value");
            return None;
        }
        if !self.ensure_table().await {
            return None;
        }

        let body = payload::encode_pairs([(key, value)]);
        for attempt in 0..self.max_attempts() {
            let Some((node_id, addr)) = self.replica_for_attempt(key, attempt) else {
                if !self.refresh_table().await {
                    break;
                }
                continue;
            };
            match wire::call(&addr, self.config.rpc_timeout, MessageType::ClientPut, &body).await {
                Ok((MessageType::PutOk, _)) => {
                    debug!(key, node_id = %node_id, attempt, "put stored");
                    return Some(node_id);
                }
                Ok((MessageType::Error, reason)) => {
                    debug!(key, node_id = %node_id, %reason, "put attempt rejected");
                    self.refresh_table().await;
                }
                Ok((other, _)) => {
                    warn!(key, ?other, "unexpected put reply");
                    self.refresh_table().await;
                }
                Err(e) => {
                    debug!(key, node_id = %node_id, error = %e, "put attempt failed");
                    self.refresh_table().await;
                }
            }
        }
        warn!(key, "put failed after retries");
        None
    }

    /// Store several pairs, batched per primary. Returns true only if
    /// every batch was acknowledged.
    pub async fn put_many(&self, pairs: &[(String, String)]) -> bool {
        for (key, value) in pairs {
            if !key_valid(key) || !value_valid(value) {
                warn!(key = %key, "rejecting batch: invalid pair");
                return false;
            }
        }
        if !self.ensure_table().await {
            return false;
        }

        // Group by primary so each batch lands on one coordinator.
        let groups: BTreeMap<String, Vec<(String, String)>> = {
            let table = self.table.read();
            let mut groups: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
            for (key, value) in pairs {
                let Some(primary) = table.primary_for(key) else {
                    return false;
                };
                groups
                    .entry(primary.node_id.clone())
                    .or_default()
                    .push((key.clone(), value.clone()));
            }
            groups
        };

        for (_, group) in groups {
            // Retry through the group's shared replica chain using the
            // first key; all keys in the group share a primary.
            let anchor = group[0].0.clone();
            let body =
                payload::encode_pairs(group.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            let mut stored = false;
            for attempt in 0..self.max_attempts() {
                let Some((node_id, addr)) = self.replica_for_attempt(&anchor, attempt) else {
                    if !self.refresh_table().await {
                        break;
                    }
                    continue;
                };
                match wire::call(&addr, self.config.rpc_timeout, MessageType::ClientPut, &body)
                    .await
                {
                    Ok((MessageType::PutOk, _)) => {
                        debug!(node_id = %node_id, keys = group.len(), "batch stored");
                        stored = true;
                        break;
                    }
                    Ok((_, _)) | Err(_) => {
                        self.refresh_table().await;
                    }
                }
            }
            if !stored {
                warn!(keys = group.len(), "batch put failed after retries");
                return false;
            }
        }
        true
    }

    /// Read one key. Returns the value and the id of the node that
    /// served it, or `None` when every replica attempt misses.
    pub async fn get(&self, key: &str) -> Option<(String, String)> {
        if !key_valid(key) {
            warn!(key, "rejecting get: bad key");
            return None;
        }
        if !self.ensure_table().await {
            return None;
        }

        for attempt in 0..self.max_attempts() {
            let Some((node_id, addr)) = self.replica_for_attempt(key, attempt) else {
                if !self.refresh_table().await {
                    break;
                }
                continue;
            };
            match wire::call(&addr, self.config.rpc_timeout, MessageType::ClientGet, key).await {
                Ok((MessageType::GetOk, value)) => {
                    debug!(key, node_id = %node_id, attempt, "get hit");
                    return Some((value, node_id));
                }
                Ok((MessageType::Error, reason)) => {
                    // node_paused and friends are retryable against the
                    // next replica; a miss still refreshes in case the
                    // table is stale.
                    let kind = ErrorKind::from_payload(&reason);
                    debug!(key, node_id = %node_id, %reason, retryable = kind.retryable(), "get attempt failed");
                    self.refresh_table().await;
                }
                Ok((other, _)) => {
                    warn!(key, ?other, "unexpected get reply");
                    self.refresh_table().await;
                }
                Err(e) => {
                    debug!(key, node_id = %node_id, error = %e, "get attempt failed");
                    self.refresh_table().await;
                }
            }
        }
        warn!(key, "get failed after retries");
        None
    }

    /// Delete a key from its replica set, best effort. Succeeds when the
    /// primary acknowledged the delete.
    pub async fn delete(&self, key: &str) -> bool {
        if !key_valid(key) {
            warn!(key, "rejecting delete: bad key");
            return false;
        }
        if !self.ensure_table().await {
            return false;
        }

        let replicas: Vec<(String, NodeAddress)> = {
            let table = self.table.read();
            table
                .replica_set(key)
                .iter()
                .map(|e| (e.node_id.clone(), e.address.clone()))
                .collect()
        };
        if replicas.is_empty() {
            return false;
        }

        let mut primary_acked = false;
        for (i, (node_id, addr)) in replicas.iter().enumerate() {
            match wire::call(addr, self.config.rpc_timeout, MessageType::ClientDelete, key).await {
                Ok((MessageType::DeleteOk, _)) => {
                    if i == 0 {
                        primary_acked = true;
                    }
                }
                Ok((_, reason)) => {
                    debug!(key, node_id = %node_id, %reason, "delete attempt rejected")
                }
                Err(e) => debug!(key, node_id = %node_id, error = %e, "delete attempt failed"),
            }
        }
        if !primary_acked {
            self.refresh_table().await;
        }
        primary_acked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_inputs_short_circuit() {
        // No manager is running; invalid inputs must fail before any
        // network traffic happens.
        let client = Client::new(ClientConfig::default().with_manager("127.0.0.1", 1));
        assert!(client.put("", "value").await.is_none());
        assert!(client.put(&"k".repeat(21), "value").await.is_none());
        assert!(client.put("key", &"v".repeat(1001)).await.is_none());
        assert!(client.put("a|b", "value").await.is_none());
        assert!(client.get("").await.is_none());
        assert!(!client.delete(&"k".repeat(21)).await);
    }
}
