//! notesync server binary.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use notesync::{Args, MessageStore, Server};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notesync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.into_config();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen_addr,
        data_path = ?config.store.data_path,
        "starting notesync server"
    );

    let store = Arc::new(MessageStore::open(config.store.clone())?);
    tracing::info!(messages = store.len(), durable = store.is_durable(), "store ready");

    let server = Server::bind(&config, store)?.spawn()?;

    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })?;
    // The handler outlives main, so the sender is never dropped.
    let _ = stop_rx.recv();

    tracing::info!("shutdown signal received");
    server.shutdown();
    Ok(())
}
