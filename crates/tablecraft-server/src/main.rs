//! tablecraft server
//!
//! HTTP front end that accepts declarative DDL/DML batches and runs them
//! against PostgreSQL through the tablecraft engine.

mod errors;
mod health;
mod metrics;
mod response;
mod routes;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tablecraft_core::{Engine, PgConfig, PgPool};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::routes::{create_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "tablecraft-server")]
#[command(about = "Schema and data API over PostgreSQL")]
struct Args {
    /// Address to listen on
    #[arg(short, long, env = "TABLECRAFT_LISTEN", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// PostgreSQL connection string
    #[arg(
        long,
        env = "TABLECRAFT_DATABASE_URL",
        default_value = "host=localhost user=postgres dbname=database_services"
    )]
    database_url: String,

    /// Maximum number of pooled connections
    #[arg(long, env = "TABLECRAFT_MAX_CONNECTIONS", default_value = "16")]
    max_connections: usize,

    /// How long a request waits for a free connection
    #[arg(long, env = "TABLECRAFT_ACQUIRE_TIMEOUT_MS", default_value = "5000")]
    acquire_timeout_ms: u64,

    /// How long to wait when opening a new connection
    #[arg(long, env = "TABLECRAFT_CONNECT_TIMEOUT_MS", default_value = "5000")]
    connect_timeout_ms: u64,

    /// Do not create the catalog tables on start
    #[arg(long, env = "TABLECRAFT_SKIP_BOOTSTRAP")]
    skip_bootstrap: bool,
}

impl Args {
    fn pool_config(&self) -> PgConfig {
        PgConfig {
            url: self.database_url.clone(),
            max_connections: self.max_connections,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tablecraft_server=info".parse()?)
                .add_directive("tablecraft_core=info".parse()?),
        )
        .init();

    let args = Args::parse();

    info!(
        "Starting tablecraft server v{} on {}",
        env!("CARGO_PKG_VERSION"),
        args.listen
    );

    metrics::init_metrics()?;

    let pool = PgPool::new(args.pool_config());
    if args.skip_bootstrap {
        warn!("Skipping catalog bootstrap");
    } else {
        pool.bootstrap_catalog().await?;
    }

    let app = create_router(AppState::new(Engine::new(pool)));
    let listener = TcpListener::bind(args.listen).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["tablecraft-server"]);
        assert_eq!(args.listen, "127.0.0.1:3000".parse::<SocketAddr>().unwrap());
        assert!(!args.skip_bootstrap);

        let config = args.pool_config();
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_args_override() {
        let args = Args::parse_from([
            "tablecraft-server",
            "--listen",
            "0.0.0.0:8080",
            "--max-connections",
            "4",
            "--skip-bootstrap",
        ]);
        assert_eq!(args.listen.port(), 8080);
        assert_eq!(args.pool_config().max_connections, 4);
        assert!(args.skip_bootstrap);
    }
}
