//! In-memory replicated key/value store with consistent-hash routing.
//!
//! The cluster has three roles:
//! - a single **manager** that owns membership, the routing ring, and
//!   rebalance orchestration,
//! - **storage nodes** that hold disjoint key ranges with k-way
//!   replication and serve reads/writes directly,
//! - **clients** that hash keys locally against a cached routing table
//!   and retry across replicas on failure.
//!
//! # Example
//!
//! ```rust,no_run
//! use ringstore::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = Client::new(ClientConfig::default());
//!     if let Some(node_id) = client.put("key1", "value1").await {
//!         println!("OK, {node_id}");
//!     }
//!     if let Some((value, node_id)) = client.get("key1").await {
//!         println!("key1, {value}, {node_id}");
//!     }
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//!          ┌──────────┐  STORAGE_REGISTER / HEARTBEAT
//!          │ Manager  │◄───────────────────────────┐
//!          └────┬─────┘                            │
//!   CLIENT_HELLO│  TABLE_PUSH / PAUSE / REPL_PUT   │
//!       ┌───────┘         ▼                        │
//!  ┌────┴───┐   ┌─────────┴─────────┬──────────────┴────┐
//!  │ Client │──▶│ Storage (primary) │──▶ Storage (replicas)
//!  └────────┘   └───────────────────┴───────────────────┘
//!     CLIENT_PUT / CLIENT_GET          REPL_PUT fan-out
//! ```
//!
//! Writes are serialized per key by the primary's lock table; reads may
//! observe pre- or post-write values but never a torn one. Routing-table
//! staleness is reconciled only by client refresh on failure.

pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod routing;
pub mod storage;
pub mod types;
pub mod wire;

pub use client::Client;
pub use config::{ClientConfig, ManagerConfig, StorageConfig};
pub use error::{Error, NetworkError, Result};
pub use manager::Manager;
pub use routing::{hash_key, RingEntry, RoutingTable};
pub use storage::{KvEngine, StorageNode};
pub use types::{NodeAddress, MAX_KEY_BYTES, MAX_VALUE_BYTES, VIRTUAL_TOKENS_PER_NODE};
pub use wire::{ErrorKind, MessageType};
