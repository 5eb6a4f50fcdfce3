pub mod config;
pub mod db;
pub mod error;
pub mod list;
pub mod records;
pub mod resources;
pub mod server;
pub mod state;
pub mod store;
pub mod telemetry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the fleet API using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).await?.run().await
}
