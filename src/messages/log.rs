//! Append-only message log.

use crate::error::{Result, SyncError};
use crate::types::{Message, MessageId, Timestamp};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for each log record.
const LOG_MAGIC: &[u8; 4] = b"MSG\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Fixed part of a record before the id bytes: magic + version + flags + timestamp + id length.
const RECORD_HEADER_SIZE: usize = 4 + 1 + 1 + 8 + 2;

/// Result of decoding the bytes at one offset.
enum Decoded {
    Record { message: Message, len: usize },
    /// The file ends partway through a record.
    Torn,
}

struct LogFile {
    file: File,
    size: u64,
    writes_since_sync: u64,
}

/// Append-only message log.
///
/// Each record is self-delimiting and carries a CRC32 over its id and
/// text. A record cut short by a crash is dropped on [`replay`](Self::replay).
pub struct MessageLog {
    path: PathBuf,
    inner: Mutex<LogFile>,
    /// Sync every N writes (1 = every write).
    sync_interval: u64,
}

impl MessageLog {
    /// Default sync interval: every write.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 1;

    /// Open or create a log with the default sync interval.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a log that syncs every `sync_interval` writes.
    /// A zero interval is treated as one.
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path,
            inner: Mutex::new(LogFile {
                file,
                size,
                writes_since_sync: 0,
            }),
            sync_interval: sync_interval.max(1),
        })
    }

    /// Read every record, oldest first.
    ///
    /// A torn record at the end of the file is truncated away. Anything
    /// else that fails to decode is reported as corruption.
    pub fn replay(&self) -> Result<Vec<Message>> {
        let mut inner = self.inner.lock();

        inner.file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::with_capacity(inner.size as usize);
        BufReader::new(&mut inner.file).read_to_end(&mut bytes)?;

        let mut messages = Vec::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            match decode(&bytes[offset..], offset as u64)? {
                Decoded::Record { message, len } => {
                    messages.push(message);
                    offset += len;
                }
                Decoded::Torn => {
                    warn!(
                        path = %self.path.display(),
                        offset,
                        dropped_bytes = bytes.len() - offset,
                        "truncating torn record at end of message log"
                    );
                    inner.file.set_len(offset as u64)?;
                    inner.file.sync_all()?;
                    break;
                }
            }
        }

        inner.size = offset as u64;
        debug!(path = %self.path.display(), records = messages.len(), "message log replayed");
        Ok(messages)
    }

    /// Append a message. Returns the offset it was written at.
    ///
    /// On failure, including a failed sync, the file is cut back to its
    /// previous length: the record is neither replayed later nor followed
    /// by the next append.
    pub fn append(&self, message: &Message) -> Result<u64> {
        let encoded = encode(message)?;
        let mut inner = self.inner.lock();

        let offset = inner.size;
        let due = inner.writes_since_sync + 1 >= self.sync_interval;
        write_record(&mut inner.file, offset, &encoded, due)?;

        inner.size = offset + encoded.len() as u64;
        inner.writes_since_sync = if due { 0 } else { inner.writes_since_sync + 1 };
        Ok(offset)
    }

    /// Force pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.sync_all()?;
        inner.writes_since_sync = 0;
        Ok(())
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The file operations an append needs.
trait Backing: Write + Seek {
    fn sync_data(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl Backing for File {
    fn sync_data(&mut self) -> io::Result<()> {
        File::sync_data(self)
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Write one record at `offset`, syncing if asked. Any failure cuts the
/// file back to `offset`.
fn write_record<B: Backing>(file: &mut B, offset: u64, record: &[u8], sync: bool) -> io::Result<()> {
    let mut written = file
        .seek(SeekFrom::Start(offset))
        .and_then(|_| file.write_all(record));
    if written.is_ok() && sync {
        written = file.sync_data();
    }
    if written.is_err() {
        let _ = file.truncate(offset);
    }
    written
}

fn encode(message: &Message) -> Result<Vec<u8>> {
    let id = message.id.as_str().as_bytes();
    let text = message.text.as_bytes();

    let id_len = u16::try_from(id.len())
        .map_err(|_| SyncError::Serialization(format!("id too long: {} bytes", id.len())))?;
    let text_len = u32::try_from(text.len())
        .map_err(|_| SyncError::Serialization(format!("text too long: {} bytes", text.len())))?;

    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + id.len() + 4 + text.len() + 4);
    buf.extend_from_slice(LOG_MAGIC);
    buf.push(LOG_VERSION);
    buf.push(0u8); // flags (reserved)
    buf.extend_from_slice(&message.timestamp.0.to_le_bytes());
    buf.extend_from_slice(&id_len.to_le_bytes());
    buf.extend_from_slice(id);
    buf.extend_from_slice(&text_len.to_le_bytes());
    buf.extend_from_slice(text);
    buf.extend_from_slice(&checksum(id, text).to_le_bytes());

    Ok(buf)
}

fn checksum(id: &[u8], text: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(id);
    hasher.update(text);
    hasher.finalize()
}

/// Cursor over one record's bytes. `None` means the input ran out.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N).and_then(|s| s.try_into().ok())
    }
}

fn decode(bytes: &[u8], offset: u64) -> Result<Decoded> {
    let corrupt = |reason: String| SyncError::Corruption { offset, reason };
    let mut r = Reader { bytes, pos: 0 };

    macro_rules! field {
        ($e:expr) => {
            match $e {
                Some(v) => v,
                None => return Ok(Decoded::Torn),
            }
        };
    }

    let magic: [u8; 4] = field!(r.array());
    if &magic != LOG_MAGIC {
        return Err(corrupt("invalid record magic".into()));
    }

    let [version] = field!(r.array::<1>());
    if version != LOG_VERSION {
        return Err(SyncError::InvalidFormat(format!(
            "unsupported log version: {}",
            version
        )));
    }

    let _flags = field!(r.array::<1>());
    let timestamp = Timestamp(i64::from_le_bytes(field!(r.array())));

    let id_len = u16::from_le_bytes(field!(r.array())) as usize;
    let id = field!(r.take(id_len));

    let text_len = u32::from_le_bytes(field!(r.array())) as usize;
    let text = field!(r.take(text_len));

    let stored = u32::from_le_bytes(field!(r.array()));
    let computed = checksum(id, text);
    if stored != computed {
        return Err(SyncError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let id = std::str::from_utf8(id).map_err(|e| corrupt(format!("id is not UTF-8: {}", e)))?;
    let text =
        std::str::from_utf8(text).map_err(|e| corrupt(format!("text is not UTF-8: {}", e)))?;

    Ok(Decoded::Record {
        message: Message {
            id: MessageId(id.to_string()),
            text: text.to_string(),
            timestamp,
        },
        len: r.pos,
    })
}
