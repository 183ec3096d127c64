//! Manager: membership control plane and rebalance orchestration.
//!
//! The manager owns the routing ring. Storage nodes register with it and
//! heartbeat to it; clients fetch the table from it. A monitor task
//! expires silent nodes. Joins and expiries both trigger the rebalancer
//! before the updated table is broadcast to every storage node.

mod membership;
mod rebalance;

pub use membership::MembershipState;
pub use rebalance::Rebalancer;

use crate::config::ManagerConfig;
use crate::error::{NetworkError, Result};
use crate::routing::RoutingTable;
use crate::types::NodeAddress;
use crate::wire::{self, payload, ErrorKind, MessageType};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// State shared by connection handlers and the monitor task.
struct ManagerShared {
    config: ManagerConfig,
    state: MembershipState,
    rebalancer: Rebalancer,
}

/// A running manager process.
pub struct Manager {
    shared: Arc<ManagerShared>,
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl Manager {
    /// Validate the config and bind the listen socket. Bind failure is
    /// fatal at startup. Port 0 picks an OS-assigned port.
    pub async fn bind(mut config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(NetworkError::Io)?;
        config.port = listener.local_addr().map_err(NetworkError::Io)?.port();

        info!(
            addr = %config.listen_addr(),
            replication = config.replication_factor,
            "manager listening"
        );
        let rebalancer = Rebalancer::new(&config);
        let state = MembershipState::new(config.replication_factor);
        Ok(Self {
            shared: Arc::new(ManagerShared {
                config,
                state,
                rebalancer,
            }),
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> NodeAddress {
        self.shared.config.listen_addr()
    }

    /// Token for shutting the manager down from outside `run`.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve requests and monitor heartbeats until shutdown.
    pub async fn run(self) -> Result<()> {
        let Self {
            shared,
            listener,
            shutdown,
        } = self;

        let monitor_shared = shared.clone();
        let monitor_shutdown = shutdown.clone();
        tokio::spawn(async move {
            monitor_heartbeats(monitor_shared, monitor_shutdown).await;
        });

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("manager shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _peer)) => {
                            let shared = shared.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(shared, stream).await {
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
}

/// Expire nodes that stopped heartbeating, rebalance, and re-broadcast.
async fn monitor_heartbeats(shared: Arc<ManagerShared>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let expired = shared.state.expired_nodes(shared.config.liveness_timeout);
        for node_id in expired {
            let pre = shared.state.table_snapshot();
            if !pre.contains_node(&node_id) {
                continue;
            }
            warn!(node_id = %node_id, "node expired, rebalancing");
            shared.rebalancer.leave_rebalance(&pre, &node_id).await;
            let table = shared.state.remove(&node_id);
            broadcast_table(&shared, &table).await;
        }
    }
}

async fn handle_connection(shared: Arc<ManagerShared>, mut stream: TcpStream) -> Result<()> {
    let (msg_type, request) = wire::read_message(&mut stream).await?;
    match msg_type {
        MessageType::StorageRegister => handle_register(shared, stream, &request).await,
        MessageType::ClientHello => {
            debug!("client requested table");
            let table = shared.state.table_snapshot();
            wire::write_message(&mut stream, MessageType::TablePush, &payload::encode_table(&table))
                .await
        }
        MessageType::Heartbeat => {
            shared.state.record_heartbeat(&request);
            wire::write_message(&mut stream, MessageType::HeartbeatAck, "ok").await
        }
        other => {
            warn!(?other, "unhandled message type");
            wire::write_message(&mut stream, MessageType::Error, &ErrorKind::Unknown.to_string())
                .await
        }
    }
}

/// Register a storage node, reply with the table, and — after the reply
/// socket is closed — rebalance for the join and broadcast.
async fn handle_register(
    shared: Arc<ManagerShared>,
    mut stream: TcpStream,
    request: &str,
) -> Result<()> {
    let Some((node_id, address)) = parse_register(request) else {
        warn!(payload = %request, "invalid storage registration");
        return wire::write_message(
            &mut stream,
            MessageType::Error,
            &ErrorKind::Unknown.to_string(),
        )
        .await;
    };

    let table = shared.state.register(&node_id, address);
    wire::write_message(&mut stream, MessageType::TablePush, &payload::encode_table(&table))
        .await?;
    drop(stream);

    if table.physical_node_count() > 1 {
        shared.rebalancer.join_rebalance(&table, &node_id).await;
    }
    // Rebalancing may have raced with further membership changes; push
    // the freshest snapshot.
    let table = shared.state.table_snapshot();
    broadcast_table(&shared, &table).await;
    Ok(())
}

fn parse_register(request: &str) -> Option<(String, NodeAddress)> {
    let mut parts = request.split(',');
    let node_id = parts.next()?.trim();
    let host = parts.next()?.trim();
    let port: u16 = parts.next()?.trim().parse().ok()?;
    if node_id.is_empty() || host.is_empty() || parts.next().is_some() {
        return None;
    }
    Some((node_id.to_string(), NodeAddress::new(host, port)))
}

/// Push the table to every distinct physical node, best effort.
async fn broadcast_table(shared: &Arc<ManagerShared>, table: &RoutingTable) {
    let body = payload::encode_table(table);
    for (node_id, addr) in table.physical_nodes() {
        let result = async {
            let mut stream = wire::connect(&addr, shared.config.rpc_timeout).await?;
            wire::write_message(&mut stream, MessageType::TablePush, &body).await
        }
        .await;
        match result {
            Ok(()) => debug!(node_id = %node_id, "table pushed"),
            Err(e) => warn!(node_id = %node_id, addr = %addr, error = %e, "table push failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_payload_parsing() {
        let (id, addr) = parse_register("node1,127.0.0.1,6001").unwrap();
        assert_eq!(id, "node1");
        assert_eq!(addr, NodeAddress::new("127.0.0.1", 6001));

        assert!(parse_register("node1,127.0.0.1").is_none());
        assert!(parse_register("node1,127.0.0.1,notaport").is_none());
        assert!(parse_register("node1,127.0.0.1,6001,extra").is_none());
        assert!(parse_register(",127.0.0.1,6001").is_none());
    }

    #[tokio::test]
    async fn hello_returns_table() {
        let config = ManagerConfig::default()
            .with_listen("127.0.0.1", 0)
            .with_replication_factor(2);
        let manager = Manager::bind(config).await.unwrap();
        let addr = manager.local_addr();
        let shutdown = manager.shutdown_handle();
        tokio::spawn(manager.run());

        let (ty, body) = wire::call(
            &addr,
            std::time::Duration::from_secs(2),
            MessageType::ClientHello,
            "",
        )
        .await
        .unwrap();
        assert_eq!(ty, MessageType::TablePush);
        let table = payload::parse_table(&body).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.replication_factor(), 2);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn zero_replication_refuses_to_bind() {
        let config = ManagerConfig::default()
            .with_listen("127.0.0.1", 0)
            .with_replication_factor(0);
        assert!(Manager::bind(config).await.is_err());
    }

    #[tokio::test]
    async fn heartbeat_acknowledged() {
        let config = ManagerConfig::default().with_listen("127.0.0.1", 0);
        let manager = Manager::bind(config).await.unwrap();
        let addr = manager.local_addr();
        let shutdown = manager.shutdown_handle();
        tokio::spawn(manager.run());

        let (ty, _) = wire::call(
            &addr,
            std::time::Duration::from_secs(2),
            MessageType::Heartbeat,
            "node1",
        )
        .await
        .unwrap();
        assert_eq!(ty, MessageType::HeartbeatAck);
        shutdown.cancel();
    }
}
