//! Process bootstrap for the trainstream trigger core.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use trainstream::config::{Config, EndpointConfig};
use trainstream::{constants, ingest, DataProcessor};
use trainstream_store::{subscribe_backend_link_changes, RedisStore};

#[derive(Parser, Debug)]
#[command(name = "trainstream", about = "Retraining trigger core")]
struct Args {
    /// Metadata store host
    #[arg(long, env = "TRAINSTREAM_STORE_HOST", default_value = "127.0.0.1")]
    store_host: String,

    /// Metadata store port
    #[arg(long, env = "TRAINSTREAM_STORE_PORT", default_value_t = constants::STORE_PORT)]
    store_port: u16,

    /// Ingest frontend port
    #[arg(long, env = "TRAINSTREAM_INGEST_PORT", default_value_t = constants::INGEST_FRONTEND_PORT)]
    ingest_port: u16,

    /// Backend RPC port
    #[arg(long, env = "TRAINSTREAM_BACKEND_PORT", default_value_t = constants::RPC_BACKEND_PORT)]
    backend_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let config = Config {
        store: EndpointConfig {
            host: args.store_host.clone(),
            port: args.store_port,
        },
        ingest: EndpointConfig {
            host: "0.0.0.0".to_string(),
            port: args.ingest_port,
        },
        backend_rpc: EndpointConfig {
            host: "0.0.0.0".to_string(),
            port: args.backend_port,
        },
    };

    info!("Starting trainstream trigger core");

    // Each component owns its own store connection.
    let checker_store = RedisStore::connect(&config.store.host, config.store.port);
    let transport_store = RedisStore::connect(&config.store.host, config.store.port);
    let frontend_store = Arc::new(RedisStore::connect(&config.store.host, config.store.port));

    if let Err(e) = frontend_store.enable_keyspace_notifications() {
        warn!("Could not enable keyspace notifications, link updates require server-side config: {e}");
    }

    let processor = Arc::new(DataProcessor::start(
        &config,
        checker_store,
        transport_store,
    )?);

    // Link updates flow from the store's notification stream into the
    // checker's mailbox.
    let checker = processor.checker();
    let _subscription =
        subscribe_backend_link_changes(&config.store.host, config.store.port, move |key, event| {
            if event == "set" {
                checker.notify_backend_link_changed(key);
            }
        });

    let app = ingest::router(frontend_store, Arc::clone(&processor));
    let listener =
        tokio::net::TcpListener::bind((config.ingest.host.as_str(), config.ingest.port)).await?;
    info!("Ingest frontend listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    processor.shutdown();
    Ok(())
}
