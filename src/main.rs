//! ledger-server: a line-protocol ledger over TCP
//!
//! Clients send one command per line and get one reply per line:
//! - `ADD_TRANSACTION|<date>|<kind>|<amount>` records income or expense
//! - `GET_TRANSACTIONS` lists every entry, newest date first
//! - `GET_BALANCE` reports income, expense and net totals
//!
//! Features:
//! - Durable SQLite storage shared by all connections
//! - Task per connection with an idle timeout
//! - Plain HTTP health checks answered on the same port
//! - Configuration via CLI arguments, `PORT`, or TOML file

mod config;
mod ledger;
mod protocol;
mod server;
mod session;

use config::Config;
use ledger::LedgerStore;
use server::{Context, Server};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        database = %config.database.display(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "Starting ledger server"
    );

    let store = LedgerStore::open(&config.database)?;
    info!(transactions = store.count()?, "Ledger ready");

    let context = Context::new(store, config.idle_timeout);
    let server = Server::bind(&config.listen_addr(), context).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for shutdown signal");
                // Keep the sender alive so the server keeps running
                std::future::pending::<()>().await;
            }
        }
    });

    server.run(shutdown_rx).await;
    info!("Server stopped");

    Ok(())
}
