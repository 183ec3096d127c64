//! Command-line client.
//!
//! Exit codes: 0 on success, 1 on usage error, 2 when the operation
//! failed against the cluster.

use clap::{Parser, Subcommand};
use ringstore::{Client, ClientConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ringstore", about = "Replicated key/value store client")]
struct Cli {
    /// Manager host.
    #[arg(long)]
    manager_host: Option<String>,

    /// Manager port.
    #[arg(long)]
    manager_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a value under a key.
    Put { key: String, value: String },

    /// Read a key.
    Get { key: String },

    /// Delete a key.
    Del { key: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help/version requests are not usage errors.
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let mut config = ClientConfig::from_env();
    if let Some(host) = cli.manager_host {
        config.manager_host = host;
    }
    if let Some(port) = cli.manager_port {
        config.manager_port = port;
    }
    let client = Client::new(config);

    let code = match cli.command {
        Command::Put { key, value } => match client.put(&key, &value).await {
            Some(node_id) => {
                println!("OK, {node_id}");
                0
            }
            None => {
                eprintln!("put failed");
                2
            }
        },
        Command::Get { key } => match client.get(&key).await {
            Some((value, node_id)) => {
                println!("{key}, {value}, {node_id}");
                0
            }
            None => {
                eprintln!("get failed");
                2
            }
        },
        Command::Del { key } => {
            if client.delete(&key).await {
                println!("OK");
                0
            } else {
                eprintln!("delete failed");
                2
            }
        }
    };
    std::process::exit(code);
}
