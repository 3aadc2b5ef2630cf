//! Roomcast server binary.
//!
//! # Usage
//!
//! ```bash
//! # In-memory history, self-signed certificate (development)
//! ROOMCAST_TOKEN_SECRET=dev-secret roomcast-server --bind 127.0.0.1:4433
//!
//! # Durable history, real certificate
//! roomcast-server --bind 0.0.0.0:4433 --cert cert.pem --key key.pem \
//!     --db /var/lib/roomcast/history.redb --token-secret "$SECRET"
//! ```

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use roomcast_server::{
    DriverConfig, MemoryStorage, RedbStorage, Server, ServerError, ServerRuntimeConfig, Storage,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Room-scoped message and signaling relay
#[derive(Parser, Debug)]
#[command(name = "roomcast-server")]
#[command(about = "Room-scoped message and signaling relay over QUIC")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<String>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<String>,

    /// Path to the redb history database; history is kept in memory if unset
    #[arg(long)]
    db: Option<PathBuf>,

    /// Shared secret for verifying credential tokens
    #[arg(long, env = "ROOMCAST_TOKEN_SECRET", hide_env_values = true)]
    token_secret: String,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Messages replayed to a joining connection
    #[arg(long, default_value = "50")]
    history_limit: usize,

    /// Events queued for a connection before it is dropped as too slow
    #[arg(long, default_value = "1024")]
    outbox_capacity: usize,

    /// Seconds without inbound traffic before an active connection is dropped
    #[arg(long, default_value = "60")]
    idle_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(bind = %args.bind, "roomcast server starting");

    if args.cert.is_none() || args.key.is_none() {
        tracing::warn!("no TLS certificate provided, using self-signed certificate");
    }

    let mut driver = DriverConfig {
        max_connections: args.max_connections,
        history_limit: args.history_limit,
        outbox_capacity: args.outbox_capacity,
        ..Default::default()
    };
    driver.connection.idle_timeout = Duration::from_secs(args.idle_timeout_secs);

    let db = args.db.clone();
    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        cert_path: args.cert,
        key_path: args.key,
        token_secret: args.token_secret,
        driver,
        ..Default::default()
    };

    match db {
        Some(path) => {
            tracing::info!(path = %path.display(), "using redb history");
            serve(config, RedbStorage::open(&path).map_err(ServerError::from)?).await?;
        },
        None => {
            tracing::warn!("no --db given, history will not survive a restart");
            serve(config, MemoryStorage::new()).await?;
        },
    }

    Ok(())
}

async fn serve<S: Storage>(config: ServerRuntimeConfig, storage: S) -> Result<(), ServerError> {
    let server = Server::bind(config, storage)?;
    tracing::info!(addr = %server.local_addr()?, "listening");
    server.run().await
}
