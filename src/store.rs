//! The message store: authoritative list, durable log and broadcaster.

use crate::error::{Result, SyncError, ValidationError};
use crate::ids::PushIdGenerator;
use crate::messages::MessageLog;
use crate::subscriptions::{
    Broadcaster, DropReason, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
};
use crate::types::{Message, Snapshot, Timestamp, Version};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory for the durable log. `None` keeps messages in memory only.
    pub data_path: Option<PathBuf>,

    /// Sync the log every N appends (1 = every append).
    pub sync_interval: u64,

    /// Per-subscriber delivery settings.
    pub subscription: SubscriptionConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_path: None,
            sync_interval: MessageLog::DEFAULT_SYNC_INTERVAL,
            subscription: SubscriptionConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Durable store rooted at `path`.
    pub fn durable(path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: Some(path.into()),
            ..Default::default()
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"NTS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// On-disk pieces of a durable store.
struct Durable {
    path: PathBuf,
    log: MessageLog,
    /// Held for the store's lifetime.
    _lock_file: File,
}

/// State guarded by the write lock.
struct Inner {
    messages: Vec<Message>,
    ids: PushIdGenerator,
}

/// The append-only message store.
///
/// All mutation goes through [`append`](Self::append), which holds the
/// write lock across id assignment, the log write, the in-memory push and
/// the broadcast. Registration of a new subscriber takes the same lock, so
/// its first snapshot and every later one arrive in commit order.
pub struct MessageStore {
    inner: Mutex<Inner>,
    durable: Option<Durable>,
    broadcaster: Broadcaster,
}

impl MessageStore {
    /// Open a store described by `config`.
    ///
    /// Without a data path this is an empty in-memory store. With one, the
    /// directory is created if needed, locked, and its log replayed.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let broadcaster = Broadcaster::new(config.subscription.clone());

        let Some(path) = config.data_path else {
            debug!("opened in-memory message store");
            return Ok(Self::with_state(Vec::new(), None, broadcaster));
        };

        if path.join("MANIFEST").exists() {
            Self::verify_manifest(&path)?;
        } else {
            fs::create_dir_all(&path)?;
            Self::write_manifest(&path)?;
        }

        let lock_file = Self::acquire_lock(&path)?;
        let log = MessageLog::open_with_sync_interval(path.join("messages.log"), config.sync_interval)?;
        let messages = log.replay()?;

        info!(
            path = %path.display(),
            messages = messages.len(),
            "opened message store"
        );

        let durable = Durable {
            path,
            log,
            _lock_file: lock_file,
        };
        Ok(Self::with_state(messages, Some(durable), broadcaster))
    }

    /// In-memory store with default settings.
    pub fn in_memory() -> Self {
        Self::with_state(Vec::new(), None, Broadcaster::default())
    }

    /// Ids continue after the last existing message.
    fn with_state(messages: Vec<Message>, durable: Option<Durable>, broadcaster: Broadcaster) -> Self {
        let ids = match messages.last() {
            Some(last) => PushIdGenerator::resume_after(&last.id),
            None => PushIdGenerator::new(),
        };
        Self {
            inner: Mutex::new(Inner { messages, ids }),
            durable,
            broadcaster,
        }
    }

    // --- Writes ---

    /// Append a message.
    ///
    /// The stored text is `text` trimmed. Blank text is rejected with no
    /// effect on the store and no broadcast. If the log write fails, the
    /// in-memory list is left unchanged.
    pub fn append(&self, text: &str) -> Result<Message> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::BlankText.into());
        }

        let mut inner = self.inner.lock();
        let (id, timestamp) = inner.ids.next_id(Timestamp::now());
        let message = Message {
            id,
            text: text.to_string(),
            timestamp,
        };

        if let Some(durable) = &self.durable {
            durable.log.append(&message)?;
        }
        inner.messages.push(message.clone());

        let snapshot = Self::snapshot_of(&inner);
        let delivered = self.broadcaster.broadcast(&snapshot);
        debug!(
            id = %message.id,
            version = snapshot.version.0,
            delivered,
            "message appended"
        );

        Ok(message)
    }

    // --- Reads ---

    /// Current messages, oldest first.
    pub fn snapshot(&self) -> Snapshot {
        Self::snapshot_of(&self.inner.lock())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> Version {
        Version(self.len() as u64)
    }

    fn snapshot_of(inner: &Inner) -> Snapshot {
        Snapshot::new(Version(inner.messages.len() as u64), inner.messages.clone())
    }

    // --- Subscriptions ---

    /// Register a subscriber. Its first event is the current snapshot.
    pub fn subscribe(&self) -> SubscriptionHandle {
        let inner = self.inner.lock();
        self.broadcaster.register(Self::snapshot_of(&inner))
    }

    /// Remove a subscriber. No-op if it is already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.broadcaster.unsubscribe(id);
    }

    pub fn subscription_count(&self) -> usize {
        self.broadcaster.subscription_count()
    }

    /// End every subscription. Subscribers get a `Shutdown` drop event.
    pub fn shutdown(&self) {
        let closed = self.broadcaster.close_all(DropReason::Shutdown);
        info!(subscriptions = closed, "message store shut down");
    }

    // --- Durability ---

    /// Force the log to disk. No-op for in-memory stores.
    pub fn sync(&self) -> Result<()> {
        match &self.durable {
            Some(durable) => durable.log.sync(),
            None => Ok(()),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.durable.is_some()
    }

    /// Store directory, if durable.
    pub fn path(&self) -> Option<&Path> {
        self.durable.as_ref().map(|d| d.path.as_path())
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let mut file = File::open(path.join("MANIFEST"))?;

        let mut header = [0u8; 5];
        file.read_exact(&mut header)
            .map_err(|_| SyncError::InvalidFormat("truncated store manifest".into()))?;
        if &header[..4] != STORE_MAGIC {
            return Err(SyncError::InvalidFormat("invalid store magic".into()));
        }
        if header[4] != STORE_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "unsupported store version: {}",
                header[4]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| SyncError::Locked)?;
        Ok(lock_file)
    }
}

impl Drop for MessageStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}
