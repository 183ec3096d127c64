//! Storage node entry point.
//!
//! Settings come from `RINGSTORE_STORAGE_HOST`, `RINGSTORE_STORAGE_PORT`,
//! `RINGSTORE_NODE_LABEL`, `RINGSTORE_MANAGER_HOST`, and
//! `RINGSTORE_MANAGER_PORT`; logging honors `RUST_LOG`. Failure to bind
//! or to register with the manager is fatal.

use ringstore::{StorageConfig, StorageNode};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = StorageConfig::from_env();
    let node = match StorageNode::bind(config).await {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "storage startup failed");
            std::process::exit(1);
        }
    };

    let shutdown = node.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    if let Err(e) = node.run().await {
        error!(error = %e, "storage node exited with error");
        std::process::exit(1);
    }
}
