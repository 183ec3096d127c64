//! Manager process entry point.
//!
//! Settings come from `RINGSTORE_MANAGER_HOST`, `RINGSTORE_MANAGER_PORT`,
//! and `RINGSTORE_REPLICATION`; logging honors `RUST_LOG`.

use ringstore::{Manager, ManagerConfig};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ManagerConfig::from_env();
    let manager = match Manager::bind(config).await {
        Ok(manager) => manager,
        Err(e) => {
            error!(error = %e, "manager startup failed");
            std::process::exit(1);
        }
    };

    let shutdown = manager.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    if let Err(e) = manager.run().await {
        error!(error = %e, "manager exited with error");
        std::process::exit(1);
    }
}
