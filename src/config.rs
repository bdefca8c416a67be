//! Server configuration.

use crate::messages::MessageLog;
use crate::store::StoreConfig;
use crate::subscriptions::SubscriptionConfig;
use clap::Parser;
use std::path::PathBuf;

/// Default address the server listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7070";

/// Default maximum frame size (64 KiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Default per-subscriber buffer, in snapshots.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = SubscriptionConfig::DEFAULT_BUFFER_SIZE;

/// notesync server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (e.g. "127.0.0.1:7070").
    pub listen_addr: String,

    /// Maximum size of one client frame in bytes.
    pub max_frame_bytes: usize,

    /// Settings for the message store the server fronts.
    pub store: StoreConfig,
}

impl ServerConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            store: StoreConfig::default(),
        }
    }

    /// Persist messages under `path`.
    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store.data_path = Some(path.into());
        self
    }

    /// Keep messages in memory only.
    pub fn in_memory(mut self) -> Self {
        self.store.data_path = None;
        self
    }

    pub fn with_max_frame_bytes(mut self, size: usize) -> Self {
        self.max_frame_bytes = size.max(1);
        self
    }

    pub fn with_subscriber_buffer(mut self, snapshots: usize) -> Self {
        self.store.subscription.buffer_size = snapshots.max(1);
        self
    }

    pub fn with_sync_interval(mut self, writes: u64) -> Self {
        self.store.sync_interval = writes.max(1);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_LISTEN_ADDR)
    }
}

/// Command-line arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "notesync-server")]
#[command(version, about = "Realtime append-only notes server", long_about = None)]
pub struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: String,

    /// Directory for the durable message log. Messages are kept in memory
    /// only when omitted.
    #[arg(short, long)]
    pub data_path: Option<PathBuf>,

    /// Maximum client frame size in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,

    /// Undelivered snapshots a subscriber may queue; older ones are discarded beyond this.
    #[arg(long, default_value_t = DEFAULT_SUBSCRIBER_BUFFER)]
    pub subscriber_buffer: usize,

    /// Sync the log to disk every N appends.
    #[arg(long, default_value_t = MessageLog::DEFAULT_SYNC_INTERVAL)]
    pub sync_interval: u64,
}

impl Args {
    /// Convert command-line arguments to server configuration.
    pub fn into_config(self) -> ServerConfig {
        let config = ServerConfig::new(self.listen)
            .with_max_frame_bytes(self.max_frame_bytes)
            .with_subscriber_buffer(self.subscriber_buffer)
            .with_sync_interval(self.sync_interval);

        match self.data_path {
            Some(path) => config.with_data_path(path),
            None => config.in_memory(),
        }
    }
}
