//! Blocking client for the frame protocol.

use crate::error::{Result, SyncError};
use crate::protocol::{write_frame, ClientFrame, FrameReader, Incoming, ServerFrame};
use crate::types::{MessageId, Snapshot, Timestamp};
use std::collections::VecDeque;
use std::io::{BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Largest server frame accepted by default. Snapshots grow with the store.
pub const DEFAULT_MAX_SNAPSHOT_BYTES: usize = 64 * 1024 * 1024;

/// Server answer to a SEND.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendReply {
    Acked { id: MessageId, timestamp: Timestamp },
    Rejected { reason: String },
}

/// A connection to a notesync server.
///
/// Frames that arrive while waiting for something else (a snapshot pushed
/// while waiting for an ACK, say) are queued and returned by later reads.
pub struct Client {
    stream: TcpStream,
    writer: BufWriter<TcpStream>,
    frames: FrameReader<BufReader<TcpStream>>,
    pending: VecDeque<ServerFrame>,
}

impl Client {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        Self::connect_with_max_frame(addr, DEFAULT_MAX_SNAPSHOT_BYTES)
    }

    /// Connect, accepting server frames up to `max_frame_bytes`.
    pub fn connect_with_max_frame(addr: impl ToSocketAddrs, max_frame_bytes: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            writer: BufWriter::new(stream.try_clone()?),
            frames: FrameReader::new(BufReader::new(stream.try_clone()?), max_frame_bytes),
            stream,
            pending: VecDeque::new(),
        })
    }

    /// Limit how long reads block. `None` blocks forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        Ok(self.stream.set_read_timeout(timeout)?)
    }

    pub fn subscribe(&mut self) -> Result<()> {
        self.write(&ClientFrame::Subscribe)
    }

    pub fn unsubscribe(&mut self) -> Result<()> {
        self.write(&ClientFrame::Unsubscribe)
    }

    /// Send raw text without waiting for the reply.
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.write(&ClientFrame::Send {
            text: text.to_string(),
        })
    }

    /// Send text and wait for its ACK or REJECT.
    ///
    /// Fails with [`SyncError::ChannelClosed`] if the server hangs up first.
    pub fn send(&mut self, text: &str) -> Result<SendReply> {
        self.send_text(text)?;
        loop {
            match self.read()? {
                ServerFrame::Ack { id, timestamp } => return Ok(SendReply::Acked { id, timestamp }),
                ServerFrame::Reject { reason } => return Ok(SendReply::Rejected { reason }),
                // Snapshots and errors about other frames keep their order.
                other => self.pending.push_back(other),
            }
        }
    }

    /// Next frame from the server, queued ones first.
    pub fn next_frame(&mut self) -> Result<ServerFrame> {
        match self.pending.pop_front() {
            Some(frame) => Ok(frame),
            None => self.read(),
        }
    }

    /// Next SNAPSHOT frame. Other frames are kept for [`next_frame`](Self::next_frame).
    pub fn next_snapshot(&mut self) -> Result<Snapshot> {
        let queued = self
            .pending
            .iter()
            .position(|f| matches!(f, ServerFrame::Snapshot { .. }));
        if let Some(ServerFrame::Snapshot { version, messages }) =
            queued.and_then(|idx| self.pending.remove(idx))
        {
            return Ok(Snapshot::new(version, messages));
        }

        loop {
            match self.read()? {
                ServerFrame::Snapshot { version, messages } => {
                    return Ok(Snapshot::new(version, messages))
                }
                other => self.pending.push_back(other),
            }
        }
    }

    fn read(&mut self) -> Result<ServerFrame> {
        match self.frames.next_frame::<ServerFrame>()? {
            Incoming::Frame(frame) => Ok(frame),
            Incoming::Malformed(reason) => Err(SyncError::Protocol(format!(
                "malformed server frame: {}",
                reason
            ))),
            Incoming::Closed => Err(SyncError::ChannelClosed),
        }
    }

    fn write(&mut self, frame: &ClientFrame) -> Result<()> {
        write_frame(&mut self.writer, frame)
    }
}
