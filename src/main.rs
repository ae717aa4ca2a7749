use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use identityd::{config::ServiceConfig, rest, storage::SqliteContactStore, AppContext};

#[derive(Parser)]
#[command(
    name = "identityd",
    about = "Identity reconciliation service — consolidates contact fragments into one canonical customer identity",
    version
)]
struct Args {
    /// HTTP server port
    #[arg(long, env = "IDENTITYD_PORT")]
    port: Option<u16>,

    /// Data directory for the SQLite database and config.toml
    #[arg(long, env = "IDENTITYD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "IDENTITYD_LOG")]
    log: Option<String>,

    /// Bind address (default: 127.0.0.1; use 0.0.0.0 for LAN access)
    #[arg(long, env = "IDENTITYD_BIND")]
    bind_address: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Arc::new(ServiceConfig::new(
        args.port,
        args.data_dir,
        args.log,
        args.bind_address,
    ));

    // Init once — must happen before any tracing calls.
    setup_logging(&config.log, &config.log_format);

    let store = Arc::new(SqliteContactStore::open(&config.data_dir, config.slow_query_ms).await?);
    info!(data_dir = %config.data_dir.display(), "contact store ready");

    let ctx = Arc::new(AppContext::new(config, store));
    rest::start_rest_server(ctx).await
}

fn setup_logging(level: &str, format: &str) {
    if format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(level)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(level)
            .compact()
            .init();
    }
}
