//! Wire protocol: newline-delimited JSON frames tagged by `type`.
//!
//! ```text
//! C→S  {"type":"SUBSCRIBE"}
//! C→S  {"type":"SEND","text":"Buy milk"}
//! C→S  {"type":"UNSUBSCRIBE"}
//! S→C  {"type":"SNAPSHOT","version":1,"messages":[{"id":"...","text":"Buy milk","timestamp":1700000000000}]}
//! S→C  {"type":"ACK","id":"...","timestamp":1700000000000}
//! S→C  {"type":"REJECT","reason":"message text is blank"}
//! S→C  {"type":"UNSUBSCRIBED"}
//! S→C  {"type":"ERROR","message":"..."}
//! ```

use crate::error::{Result, SyncError};
use crate::types::{Message, MessageId, Snapshot, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Read, Write};

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    Subscribe,
    Send { text: String },
    Unsubscribe,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    Snapshot {
        version: Version,
        messages: Vec<Message>,
    },
    Ack {
        id: MessageId,
        timestamp: Timestamp,
    },
    Reject {
        reason: String,
    },
    Unsubscribed,
    Error {
        message: String,
    },
}

impl From<&Snapshot> for ServerFrame {
    fn from(snapshot: &Snapshot) -> Self {
        ServerFrame::Snapshot {
            version: snapshot.version,
            messages: snapshot.messages().to_vec(),
        }
    }
}

impl From<&Message> for ServerFrame {
    fn from(message: &Message) -> Self {
        ServerFrame::Ack {
            id: message.id.clone(),
            timestamp: message.timestamp,
        }
    }
}

/// Write one frame followed by a newline, then flush.
pub fn write_frame<W: Write, F: Serialize>(writer: &mut W, frame: &F) -> Result<()> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

/// What [`FrameReader::next_frame`] found.
#[derive(Debug)]
pub enum Incoming<F> {
    Frame(F),
    /// A complete line that did not parse.
    Malformed(String),
    /// The peer closed the stream.
    Closed,
}

/// Reads newline-delimited frames, enforcing a maximum line length.
pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
    line: Vec<u8>,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
            line: Vec::new(),
        }
    }

    /// Read the next frame. Blank lines are skipped.
    ///
    /// A line longer than the limit is a [`SyncError::Protocol`] error; the
    /// stream cannot be resynchronised after it.
    pub fn next_frame<F: for<'de> Deserialize<'de>>(&mut self) -> Result<Incoming<F>> {
        loop {
            self.line.clear();
            let limit = self.max_frame_bytes as u64 + 1;
            let read = (&mut self.reader).take(limit).read_until(b'\n', &mut self.line)?;
            if read == 0 {
                return Ok(Incoming::Closed);
            }

            let complete = self.line.last() == Some(&b'\n');
            if !complete && self.line.len() as u64 >= limit {
                return Err(SyncError::Protocol(format!(
                    "frame exceeds {} bytes",
                    self.max_frame_bytes
                )));
            }

            let body = trim_ascii(&self.line);
            if body.is_empty() {
                if complete {
                    continue;
                }
                return Ok(Incoming::Closed);
            }

            return Ok(match serde_json::from_slice(body) {
                Ok(frame) => Incoming::Frame(frame),
                Err(e) => Incoming::Malformed(e.to_string()),
            });
        }
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}
