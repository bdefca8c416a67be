//! TCP front end speaking the frame protocol.
//!
//! One thread per connection reads client frames. A subscribed connection
//! gets a second thread that forwards snapshots from its subscription to
//! the socket. Both write through the same locked writer, so frames never
//! interleave.

use crate::config::ServerConfig;
use crate::error::{Result, SyncError};
use crate::gateway::WriteGateway;
use crate::protocol::{write_frame, ClientFrame, FrameReader, Incoming, ServerFrame};
use crate::store::MessageStore;
use crate::subscriptions::{SubscriptionHandle, SubscriptionId, SyncEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufReader, BufWriter};
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

type SharedWriter = Arc<Mutex<BufWriter<TcpStream>>>;

/// State shared by the accept loop and every connection.
struct Shared {
    store: Arc<MessageStore>,
    gateway: WriteGateway,
    max_frame_bytes: usize,
    shutting_down: AtomicBool,
    /// Open sockets, so shutdown can unblock their readers.
    connections: Mutex<HashMap<u64, TcpStream>>,
    /// Connection threads, joined on shutdown.
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_connection: AtomicU64,
}

/// A bound, not yet running server.
pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Server {
    /// Bind the configured address in front of `store`.
    pub fn bind(config: &ServerConfig, store: Arc<MessageStore>) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr)?;
        let gateway = WriteGateway::new(Arc::clone(&store));

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                store,
                gateway,
                max_frame_bytes: config.max_frame_bytes,
                shutting_down: AtomicBool::new(false),
                connections: Mutex::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
                next_connection: AtomicU64::new(1),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve connections on a background thread.
    pub fn spawn(self) -> Result<ServerHandle> {
        let addr = self.local_addr()?;
        let shared = Arc::clone(&self.shared);
        let listener = self.listener;
        let accept_shared = Arc::clone(&shared);

        let accept = thread::Builder::new()
            .name("notesync-accept".into())
            .spawn(move || accept_loop(listener, accept_shared))?;

        info!(%addr, "server ready, accepting connections");
        Ok(ServerHandle {
            addr,
            shared,
            accept: Some(accept),
        })
    }
}

/// A running server. Dropping it shuts the server down.
pub struct ServerHandle {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.shared.store
    }

    /// Stop accepting, close every connection, end all subscriptions and
    /// flush the store to disk.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(accept) = self.accept.take() else {
            return;
        };

        self.shared.shutting_down.store(true, Ordering::SeqCst);
        // Wake the accept loop
        let _ = TcpStream::connect(wake_addr(self.addr));
        if accept.join().is_err() {
            error!("accept thread panicked");
        }

        let connections: Vec<_> = self.shared.connections.lock().drain().collect();
        for (_, stream) in &connections {
            let _ = stream.shutdown(Shutdown::Both);
        }

        let workers: Vec<_> = self.shared.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("connection thread panicked");
            }
        }

        self.shared.store.shutdown();
        if let Err(e) = self.shared.store.sync() {
            error!(error = %e, "failed to sync store on shutdown");
        }
        info!(closed_connections = connections.len(), "server shutdown complete");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Address to connect to in order to reach a listener bound to `addr`.
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) if v4.ip().is_unspecified() => {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), v4.port())
        }
        SocketAddr::V6(v6) if v6.ip().is_unspecified() => {
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), v6.port())
        }
        other => other,
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    for stream in listener.incoming() {
        if shared.shutting_down.load(Ordering::SeqCst) {
            break;
        }

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                continue;
            }
        };

        let id = shared.next_connection.fetch_add(1, Ordering::SeqCst);
        // Registered before the thread starts so shutdown always sees it.
        match stream.try_clone() {
            Ok(registered) => {
                shared.connections.lock().insert(id, registered);
            }
            Err(e) => {
                warn!(connection = id, error = %e, "failed to register connection");
                continue;
            }
        }

        let conn_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("notesync-conn-{}", id))
            .spawn(move || serve_connection(&conn_shared, id, stream));
        match spawned {
            Ok(worker) => {
                let mut workers = shared.workers.lock();
                workers.retain(|w| !w.is_finished());
                workers.push(worker);
            }
            Err(e) => {
                error!(connection = id, error = %e, "failed to spawn connection thread");
                shared.connections.lock().remove(&id);
            }
        }
    }
}

fn serve_connection(shared: &Shared, id: u64, stream: TcpStream) {
    let peer = stream.peer_addr().ok();
    debug!(connection = id, ?peer, "connection opened");

    let mut conn = match Connection::new(shared, id, stream) {
        Ok(conn) => conn,
        Err(e) => {
            warn!(connection = id, error = %e, "failed to set up connection");
            shared.connections.lock().remove(&id);
            return;
        }
    };

    if let Err(e) = conn.run() {
        debug!(connection = id, error = %e, "connection ended with error");
    }
    conn.end_subscription();

    shared.connections.lock().remove(&id);
    debug!(connection = id, ?peer, "connection closed");
}

/// A subscription being forwarded to a socket.
struct Forwarder {
    id: SubscriptionId,
    stopped: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct Connection<'a> {
    shared: &'a Shared,
    id: u64,
    frames: FrameReader<BufReader<TcpStream>>,
    writer: SharedWriter,
    forwarder: Option<Forwarder>,
}

impl<'a> Connection<'a> {
    fn new(shared: &'a Shared, id: u64, stream: TcpStream) -> Result<Self> {
        let writer = Arc::new(Mutex::new(BufWriter::new(stream.try_clone()?)));
        Ok(Self {
            shared,
            id,
            frames: FrameReader::new(BufReader::new(stream), shared.max_frame_bytes),
            writer,
            forwarder: None,
        })
    }

    fn run(&mut self) -> Result<()> {
        loop {
            let frame = match self.frames.next_frame::<ClientFrame>() {
                Ok(Incoming::Frame(frame)) => frame,
                Ok(Incoming::Malformed(reason)) => {
                    self.reply(&ServerFrame::Error {
                        message: format!("malformed frame: {}", reason),
                    })?;
                    continue;
                }
                Ok(Incoming::Closed) => return Ok(()),
                Err(SyncError::Protocol(message)) => {
                    // Oversized frames cannot be skipped reliably.
                    let _ = self.reply(&ServerFrame::Error {
                        message: message.clone(),
                    });
                    return Err(SyncError::Protocol(message));
                }
                Err(e) => return Err(e),
            };

            match frame {
                ClientFrame::Subscribe => self.subscribe()?,
                ClientFrame::Send { text } => self.send(&text)?,
                ClientFrame::Unsubscribe => {
                    self.end_subscription();
                    self.reply(&ServerFrame::Unsubscribed)?;
                }
            }
        }
    }

    fn subscribe(&mut self) -> Result<()> {
        // A forwarder that already exited (its subscription was closed by
        // the store) no longer counts.
        if self.forwarder.as_ref().is_some_and(|f| f.thread.is_finished()) {
            self.end_subscription();
        }
        if self.forwarder.is_some() {
            return self.reply(&ServerFrame::Error {
                message: "already subscribed".into(),
            });
        }

        let handle = self.shared.store.subscribe();
        let id = handle.id;
        let stopped = Arc::new(AtomicBool::new(false));
        let writer = Arc::clone(&self.writer);
        let thread_stopped = Arc::clone(&stopped);
        let connection = self.id;

        let thread = thread::Builder::new()
            .name(format!("notesync-push-{}", connection))
            .spawn(move || forward(connection, handle, writer, thread_stopped))?;

        debug!(connection, subscription = id.0, "subscribed");
        self.forwarder = Some(Forwarder {
            id,
            stopped,
            thread,
        });
        Ok(())
    }

    fn send(&self, text: &str) -> Result<()> {
        let frame = match self.shared.gateway.send(text) {
            Ok(message) => ServerFrame::from(&message),
            Err(SyncError::Validation(reason)) => ServerFrame::Reject {
                reason: reason.to_string(),
            },
            Err(e) => {
                error!(connection = self.id, error = %e, "append failed");
                ServerFrame::Reject {
                    reason: "internal error".into(),
                }
            }
        };
        self.reply(&frame)
    }

    /// Stop forwarding snapshots. Nothing from the old subscription is
    /// written once this returns.
    fn end_subscription(&mut self) {
        let Some(forwarder) = self.forwarder.take() else {
            return;
        };

        forwarder.stopped.store(true, Ordering::SeqCst);
        self.shared.store.unsubscribe(forwarder.id);
        if forwarder.thread.join().is_err() {
            error!(connection = self.id, "forwarder thread panicked");
        }
        debug!(connection = self.id, subscription = forwarder.id.0, "unsubscribed");
    }

    fn reply(&self, frame: &ServerFrame) -> Result<()> {
        write_frame(&mut *self.writer.lock(), frame)
    }
}

/// Push subscription events to the socket until the subscription ends.
fn forward(connection: u64, handle: SubscriptionHandle, writer: SharedWriter, stopped: Arc<AtomicBool>) {
    while let Ok(event) = handle.recv() {
        let frame = match event {
            SyncEvent::Snapshot(snapshot) => ServerFrame::from(&snapshot),
            SyncEvent::Dropped { reason } => {
                debug!(connection, ?reason, "subscription dropped by store");
                ServerFrame::Error {
                    message: format!("subscription dropped: {:?}", reason),
                }
            }
        };

        let mut out = writer.lock();
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = write_frame(&mut *out, &frame) {
            debug!(connection, error = %e, "failed to push snapshot");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddrV4;

    #[test]
    fn test_wake_addr_unspecified() {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 7070));
        assert_eq!(wake_addr(addr), "127.0.0.1:7070".parse().unwrap());
    }

    #[test]
    fn test_wake_addr_specific() {
        let addr: SocketAddr = "10.1.2.3:7070".parse().unwrap();
        assert_eq!(wake_addr(addr), addr);
    }
}
