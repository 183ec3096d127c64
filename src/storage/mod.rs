//! Storage node: owns a key range, serves client and manager RPCs.
//!
//! A storage node registers with the manager at startup (fatal on
//! failure), then serves one request per accepted connection. Client
//! writes land here when this node is the primary for the key: the node
//! locks the batch, applies it locally, fans `REPL_PUT` out to the other
//! replicas, and only then acknowledges the client. A dedicated task
//! emits heartbeats to the manager.

mod engine;

pub use engine::KvEngine;

use crate::config::StorageConfig;
use crate::error::{NetworkError, Result};
use crate::routing::RoutingTable;
use crate::types::{key_valid, value_valid, NodeAddress};
use crate::wire::{self, payload, ErrorKind, MessageType};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// State shared by every connection handler.
struct NodeShared {
    config: StorageConfig,
    engine: KvEngine,
    table: RwLock<RoutingTable>,
}

/// A running storage node.
pub struct StorageNode {
    shared: Arc<NodeShared>,
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl StorageNode {
    /// Bind the listen socket. Port 0 picks an OS-assigned port, which
    /// is reflected in the advertised address.
    pub async fn bind(mut config: StorageConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(NetworkError::Io)?;
        config.port = listener.local_addr().map_err(NetworkError::Io)?.port();

        Ok(Self {
            shared: Arc::new(NodeShared {
                config,
                engine: KvEngine::new(),
                table: RwLock::new(RoutingTable::new(1)),
            }),
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    /// The address this node advertises to the manager.
    pub fn advertised_addr(&self) -> NodeAddress {
        self.shared.config.advertised_addr()
    }

    /// Token for shutting the node down from outside `run`.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register with the manager, start the heartbeat emitter, and serve
    /// requests until shutdown. Registration failure is fatal.
    pub async fn run(self) -> Result<()> {
        let Self {
            shared,
            listener,
            shutdown,
        } = self;

        register_with_manager(&shared).await?;
        info!(
            node_id = %shared.config.node_id,
            addr = %shared.config.advertised_addr(),
            "storage node registered"
        );

        let heartbeat_shared = shared.clone();
        let heartbeat_shutdown = shutdown.clone();
        tokio::spawn(async move {
            heartbeat_loop(heartbeat_shared, heartbeat_shutdown).await;
        });

        serve(shared, listener, shutdown).await
    }
}

/// Send `STORAGE_REGISTER` and install the routing table from the reply.
async fn register_with_manager(shared: &Arc<NodeShared>) -> Result<()> {
    let config = &shared.config;
    let addr = config.advertised_addr();
    let request = format!("{},{},{}", config.node_id, addr.host, addr.port);
    let (reply_type, reply) = wire::call(
        &config.manager_addr(),
        config.rpc_timeout,
        MessageType::StorageRegister,
        &request,
    )
    .await?;
    if reply_type != MessageType::TablePush {
        return Err(NetworkError::UnexpectedReply(reply_type).into());
    }
    let table = payload::parse_table(&reply)?;
    info!(
        nodes = table.physical_node_count(),
        replication = table.replication_factor(),
        "received routing table from manager"
    );
    *shared.table.write() = table;
    Ok(())
}

/// Emit a heartbeat every period until shutdown.
async fn heartbeat_loop(shared: Arc<NodeShared>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let result = wire::call(
            &shared.config.manager_addr(),
            shared.config.rpc_timeout,
            MessageType::Heartbeat,
            &shared.config.node_id,
        )
        .await;
        match result {
            Ok((MessageType::HeartbeatAck, _)) => {}
            Ok((other, _)) => warn!(?other, "unexpected heartbeat reply"),
            Err(e) => debug!(error = %e, "heartbeat delivery failed"),
        }
    }
}

/// Accept loop: one task per connection, one request per connection.
async fn serve(
    shared: Arc<NodeShared>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(node_id = %shared.config.node_id, "storage node shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(shared, stream, peer.to_string()).await {
                                debug!(error = %e, "connection handler error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                }
            }
        }
    }
}

async fn handle_connection(
    shared: Arc<NodeShared>,
    mut stream: TcpStream,
    peer: String,
) -> Result<()> {
    let (msg_type, request) = wire::read_message(&mut stream).await?;
    match msg_type {
        MessageType::ClientPut => handle_client_put(&shared, &mut stream, &request, &peer).await,
        MessageType::ReplPut => handle_repl_put(&shared, &mut stream, &request).await,
        MessageType::ClientGet => handle_get(&shared, &mut stream, &request, true).await,
        MessageType::ManagerGet => handle_get(&shared, &mut stream, &request, false).await,
        MessageType::ClientDelete => handle_delete(&shared, &mut stream, &request, true).await,
        MessageType::ManagerDelete => handle_delete(&shared, &mut stream, &request, false).await,
        MessageType::GetAllKeys => {
            let keys = shared.engine.keys_snapshot();
            debug!(count = keys.len(), "returning key snapshot");
            let body = payload::encode_all_keys(keys.iter().map(String::as_str));
            wire::write_message(&mut stream, MessageType::AllKeys, &body).await
        }
        MessageType::TablePush => {
            let table = payload::parse_table(&request)?;
            debug!(
                nodes = table.physical_node_count(),
                "routing table updated by manager"
            );
            *shared.table.write() = table;
            Ok(())
        }
        MessageType::PauseNode => {
            shared.engine.pause();
            info!(node_id = %shared.config.node_id, "paused for rebalancing");
            wire::write_message(&mut stream, MessageType::PauseAck, "ok").await
        }
        MessageType::ResumeNode => {
            shared.engine.resume();
            info!(node_id = %shared.config.node_id, "resumed");
            wire::write_message(&mut stream, MessageType::ResumeAck, "ok").await
        }
        MessageType::AvailabilityCheck => {
            let status = if shared.engine.is_quiescent() { "yes" } else { "no" };
            wire::write_message(&mut stream, MessageType::AvailableStatus, status).await
        }
        other => {
            warn!(?other, "unhandled message type");
            send_error(&mut stream, ErrorKind::Unknown).await
        }
    }
}

async fn send_error(stream: &mut TcpStream, kind: ErrorKind) -> Result<()> {
    wire::write_message(stream, MessageType::Error, &kind.to_string()).await
}

/// Parse and validate a PUT payload, mapping violations to wire errors.
fn validated_pairs(request: &str) -> std::result::Result<Vec<(String, String)>, ErrorKind> {
    let pairs = payload::parse_pairs(request).map_err(|_| ErrorKind::BadKey)?;
    for (key, value) in &pairs {
        if !key_valid(key) {
            return Err(ErrorKind::BadKey);
        }
        if !value_valid(value) {
            return Err(ErrorKind::BadValue);
        }
    }
    Ok(pairs)
}

/// Primary write path: lock the batch, apply locally, fan out to the
/// other replicas, acknowledge, unlock.
async fn handle_client_put(
    shared: &Arc<NodeShared>,
    stream: &mut TcpStream,
    request: &str,
    peer: &str,
) -> Result<()> {
    if shared.engine.is_paused() {
        return send_error(stream, ErrorKind::NodePaused).await;
    }
    let pairs = match validated_pairs(request) {
        Ok(pairs) => pairs,
        Err(kind) => return send_error(stream, kind).await,
    };

    // Plan the fan-out while holding the table read lock; the lock must
    // be released before any socket I/O.
    let fanout: Option<Vec<(NodeAddress, Vec<(String, String)>)>> = {
        let table = shared.table.read();
        if table.is_empty() || !table.contains_node(&shared.config.node_id) {
            None
        } else {
            let mut by_dest: BTreeMap<NodeAddress, Vec<(String, String)>> = BTreeMap::new();
            for (key, value) in &pairs {
                for entry in table.replica_set(key) {
                    if entry.node_id != shared.config.node_id {
                        by_dest
                            .entry(entry.address.clone())
                            .or_default()
                            .push((key.clone(), value.clone()));
                    }
                }
            }
            Some(by_dest.into_iter().collect())
        }
    };
    let Some(fanout) = fanout else {
        return send_error(stream, ErrorKind::Routing).await;
    };

    let keys: Vec<String> = pairs.iter().map(|(k, _)| k.clone()).collect();
    if let Err(conflict) = shared.engine.try_lock_all(&keys, peer) {
        debug!(key = %conflict, "write rejected, key locked");
        return send_error(stream, ErrorKind::Locked(conflict)).await;
    }

    for (key, value) in &pairs {
        shared.engine.put(key, value);
    }

    // Replica failures are logged but do not fail the write: the primary
    // holding the value is what PUT success means.
    for (dest, dest_pairs) in &fanout {
        let body = payload::encode_pairs(dest_pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        match wire::call(dest, shared.config.rpc_timeout, MessageType::ReplPut, &body).await {
            Ok((MessageType::PutOk, _)) => {}
            Ok((other, _)) => warn!(dest = %dest, ?other, "unexpected replication reply"),
            Err(e) => warn!(dest = %dest, error = %e, "replication to replica failed"),
        }
    }

    debug!(
        node_id = %shared.config.node_id,
        keys = keys.len(),
        replicas = fanout.len(),
        "primary write applied"
    );
    let reply = wire::write_message(stream, MessageType::PutOk, "replicated").await;
    shared.engine.unlock_all(&keys);
    reply
}

/// Replica write path: apply without locking. Replicas trust the
/// primary's ordering, and the manager uses the same path while the
/// node is paused.
async fn handle_repl_put(
    shared: &Arc<NodeShared>,
    stream: &mut TcpStream,
    request: &str,
) -> Result<()> {
    let pairs = match validated_pairs(request) {
        Ok(pairs) => pairs,
        Err(kind) => return send_error(stream, kind).await,
    };
    for (key, value) in &pairs {
        shared.engine.put(key, value);
    }
    debug!(keys = pairs.len(), "replica write applied");
    wire::write_message(stream, MessageType::PutOk, "ok").await
}

async fn handle_get(
    shared: &Arc<NodeShared>,
    stream: &mut TcpStream,
    request: &str,
    client_facing: bool,
) -> Result<()> {
    if client_facing && shared.engine.is_paused() {
        return send_error(stream, ErrorKind::NodePaused).await;
    }
    let keys = payload::parse_keys(request);
    if keys.is_empty() || keys.iter().any(|k| !key_valid(k)) {
        return send_error(stream, ErrorKind::BadKey).await;
    }

    let mut values = Vec::with_capacity(keys.len());
    for key in &keys {
        match shared.engine.get(key) {
            Some(value) => values.push(value),
            None => {
                debug!(key = %key, "get miss");
                return send_error(stream, ErrorKind::Missing(key.clone())).await;
            }
        }
    }
    let body = payload::encode_values(values.iter().map(String::as_str));
    wire::write_message(stream, MessageType::GetOk, &body).await
}

async fn handle_delete(
    shared: &Arc<NodeShared>,
    stream: &mut TcpStream,
    request: &str,
    client_facing: bool,
) -> Result<()> {
    if client_facing && shared.engine.is_paused() {
        return send_error(stream, ErrorKind::NodePaused).await;
    }
    let keys = payload::parse_keys(request);
    if keys.is_empty() || keys.iter().any(|k| !key_valid(k)) {
        return send_error(stream, ErrorKind::BadKey).await;
    }

    let mut all_present = true;
    for key in &keys {
        if !shared.engine.remove(key) {
            all_present = false;
        }
    }
    debug!(keys = keys.len(), "delete applied");
    let body = if all_present { "ok" } else { "not_found" };
    wire::write_message(stream, MessageType::DeleteOk, body).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_bare_node(table: RoutingTable) -> (NodeAddress, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = StorageConfig::default()
            .with_listen("127.0.0.1", port)
            .with_node_id("node1");
        let shared = Arc::new(NodeShared {
            config,
            engine: KvEngine::new(),
            table: RwLock::new(table),
        });
        let shutdown = CancellationToken::new();
        let serve_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = serve(shared, listener, serve_shutdown).await;
        });
        (NodeAddress::new("127.0.0.1", port), shutdown)
    }

    fn single_node_table(addr: &NodeAddress) -> RoutingTable {
        let mut table = RoutingTable::new(1);
        table.insert_node("node1", addr.clone());
        table
    }

    async fn call(addr: &NodeAddress, ty: MessageType, body: &str) -> (MessageType, String) {
        wire::call(addr, std::time::Duration::from_secs(2), ty, body)
            .await
            .unwrap()
    }

    async fn push_table(addr: &NodeAddress, table: &RoutingTable) {
        // TABLE_PUSH carries no reply, so this cannot go through `call`.
        let mut stream = wire::connect(addr, std::time::Duration::from_secs(2))
            .await
            .unwrap();
        wire::write_message(&mut stream, MessageType::TablePush, &payload::encode_table(table))
            .await
            .unwrap();
        drop(stream);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn primary_put_then_get_round_trip() {
        let (addr, shutdown) = spawn_bare_node(RoutingTable::new(1)).await;
        push_table(&addr, &single_node_table(&addr)).await;

        let (ty, body) = call(&addr, MessageType::ClientPut, "key1|value1").await;
        assert_eq!(ty, MessageType::PutOk);
        assert_eq!(body, "replicated");

        let (ty, body) = call(&addr, MessageType::ClientGet, "key1").await;
        assert_eq!(ty, MessageType::GetOk);
        assert_eq!(body, "value1");

        // Idempotent overwrite: a second identical PUT changes nothing.
        let (ty, _) = call(&addr, MessageType::ClientPut, "key1|value1").await;
        assert_eq!(ty, MessageType::PutOk);
        let (_, body) = call(&addr, MessageType::ClientGet, "key1").await;
        assert_eq!(body, "value1");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn put_without_table_is_routing_error() {
        let (addr, shutdown) = spawn_bare_node(RoutingTable::new(1)).await;
        let (ty, body) = call(&addr, MessageType::ClientPut, "key1|value1").await;
        assert_eq!(ty, MessageType::Error);
        assert_eq!(ErrorKind::from_payload(&body), ErrorKind::Routing);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn repl_put_applies_without_locks() {
        let (addr, shutdown) = spawn_bare_node(RoutingTable::new(1)).await;
        let (ty, body) = call(&addr, MessageType::ReplPut, "key1|value1").await;
        assert_eq!(ty, MessageType::PutOk);
        assert_eq!(body, "ok");

        let (ty, body) = call(&addr, MessageType::ClientGet, "key1").await;
        assert_eq!(ty, MessageType::GetOk);
        assert_eq!(body, "value1");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn pause_rejects_client_traffic_only() {
        let (addr, shutdown) = spawn_bare_node(RoutingTable::new(1)).await;
        let (ty, _) = call(&addr, MessageType::PauseNode, "").await;
        assert_eq!(ty, MessageType::PauseAck);

        let (ty, body) = call(&addr, MessageType::ClientGet, "key1").await;
        assert_eq!(ty, MessageType::Error);
        assert_eq!(ErrorKind::from_payload(&body), ErrorKind::NodePaused);

        // Manager-initiated operations still pass the pause gate.
        let (ty, body) = call(&addr, MessageType::ReplPut, "key1|value1").await;
        assert_eq!(ty, MessageType::PutOk);
        assert_eq!(body, "ok");
        let (ty, body) = call(&addr, MessageType::ManagerGet, "key1").await;
        assert_eq!(ty, MessageType::GetOk);
        assert_eq!(body, "value1");

        let (ty, _) = call(&addr, MessageType::ResumeNode, "").await;
        assert_eq!(ty, MessageType::ResumeAck);
        let (ty, _) = call(&addr, MessageType::ClientGet, "key1").await;
        assert_eq!(ty, MessageType::GetOk);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn availability_reflects_lock_table() {
        let (addr, shutdown) = spawn_bare_node(RoutingTable::new(1)).await;
        let (ty, body) = call(&addr, MessageType::AvailabilityCheck, "").await;
        assert_eq!(ty, MessageType::AvailableStatus);
        assert_eq!(body, "yes");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn key_and_value_bounds_enforced() {
        let (addr, shutdown) = spawn_bare_node(RoutingTable::new(1)).await;

        let long_key = "k".repeat(21);
        let (ty, body) = call(&addr, MessageType::ReplPut, &format!("{long_key}|v")).await;
        assert_eq!(ty, MessageType::Error);
        assert_eq!(ErrorKind::from_payload(&body), ErrorKind::BadKey);

        let exact_key = "k".repeat(20);
        let exact_value = "v".repeat(1000);
        let (ty, _) = call(
            &addr,
            MessageType::ReplPut,
            &format!("{exact_key}|{exact_value}"),
        )
        .await;
        assert_eq!(ty, MessageType::PutOk);

        let long_value = "v".repeat(1001);
        let (ty, body) = call(&addr, MessageType::ReplPut, &format!("k|{long_value}")).await;
        assert_eq!(ty, MessageType::Error);
        assert_eq!(ErrorKind::from_payload(&body), ErrorKind::BadValue);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn all_keys_and_delete() {
        let (addr, shutdown) = spawn_bare_node(RoutingTable::new(1)).await;
        call(&addr, MessageType::ReplPut, "key1|v1;key2|v2").await;

        let (ty, body) = call(&addr, MessageType::GetAllKeys, "").await;
        assert_eq!(ty, MessageType::AllKeys);
        let mut keys = payload::parse_all_keys(&body);
        keys.sort();
        assert_eq!(keys, vec!["key1", "key2"]);

        let (ty, body) = call(&addr, MessageType::ManagerDelete, "key1").await;
        assert_eq!(ty, MessageType::DeleteOk);
        assert_eq!(body, "ok");

        let (ty, body) = call(&addr, MessageType::ClientGet, "key1").await;
        assert_eq!(ty, MessageType::Error);
        assert_eq!(ErrorKind::from_payload(&body), ErrorKind::Missing("key1".into()));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn unknown_type_gets_error() {
        let (addr, shutdown) = spawn_bare_node(RoutingTable::new(1)).await;
        let (ty, body) = call(&addr, MessageType::ReplConfirm, "key1").await;
        assert_eq!(ty, MessageType::Error);
        assert_eq!(ErrorKind::from_payload(&body), ErrorKind::Unknown);
        shutdown.cancel();
    }
}
