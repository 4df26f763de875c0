//! TCP transport: listen, connect, per-connection send/receive plumbing
//!
//! The transport owns sockets and nothing else. Every observable event —
//! accepted connection, connect result, received bytes, disconnect — is
//! posted onto one mpsc channel drained by the network reactor task, so all
//! peer and chain state mutation stays serialized on that task no matter
//! which runtime worker performed the socket I/O.
//!
//! Contracts:
//! - `Connection::send` may be called from any task; it only queues.
//! - Send queue overflow (5 MiB) closes the connection; backpressure is not
//!   negotiated with a peer that will not read.
//! - The `Closed` event is delivered exactly once per connection regardless
//!   of how many error paths race.
//! - `close()` is idempotent and safe during pending I/O.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::types::{CONNECT_TIMEOUT_SECS, DEFAULT_SEND_QUEUE_SIZE};

/// Read chunk size for per-read allocations.
const RECV_CHUNK_SIZE: usize = 64 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// EVENTS
// =============================================================================

/// Everything the transport tells the reactor.
#[derive(Debug)]
pub enum TransportEvent {
    /// Inbound TCP connection accepted.
    Accepted { conn: Connection },
    /// Outbound attempt finished. `conn` is None on refusal or timeout.
    ConnectResult { attempt_id: u64, conn: Option<Connection> },
    /// Bytes arrived on an open connection, in socket order.
    Received { conn_id: u64, bytes: Vec<u8> },
    /// Connection fully closed. Fires exactly once per connection.
    Closed { conn_id: u64 },
}

// =============================================================================
// CONNECTION
// =============================================================================

/// Handle to one TCP connection. Cheap to clone; the socket halves live in
/// the reader/writer tasks and outlive every handle operation.
#[derive(Debug, Clone)]
pub struct Connection {
    id: u64,
    remote: SocketAddr,
    inbound: bool,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    queued_bytes: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    close_signal: Arc<Notify>,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Queue bytes for writing. Returns false iff the connection is closed
    /// or the queue cap would be exceeded (which also closes it).
    pub fn send(&self, bytes: Vec<u8>) -> bool {
        if bytes.is_empty() || self.closed.load(Ordering::Acquire) {
            return false;
        }
        let len = bytes.len();
        let queued = self.queued_bytes.fetch_add(len, Ordering::AcqRel) + len;
        if queued > DEFAULT_SEND_QUEUE_SIZE {
            self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
            debug!(conn = self.id, queued, "send queue overflow, closing connection");
            self.close();
            return false;
        }
        if self.outbox.send(bytes).is_err() {
            self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Idempotent close. The reader/writer tasks observe the signal, shut
    /// the socket down, and the reactor receives a single Closed event.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // notify_one stores a permit, so the reader cannot miss the
            // wakeup even if it is not parked in select yet
            self.close_signal.notify_one();
            // Empty sentinel unblocks the writer task
            let _ = self.outbox.send(Vec::new());
        }
    }
}

/// Wire up reader/writer tasks for an established socket and hand back the
/// reactor-facing handle.
fn spawn_connection(
    stream: TcpStream,
    remote: SocketAddr,
    inbound: bool,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> Connection {
    let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();

    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let conn = Connection {
        id,
        remote,
        inbound,
        outbox: outbox_tx,
        queued_bytes: Arc::new(AtomicUsize::new(0)),
        closed: Arc::new(AtomicBool::new(false)),
        close_signal: Arc::new(Notify::new()),
    };

    tokio::spawn(writer_task(
        write_half,
        outbox_rx,
        conn.queued_bytes.clone(),
        conn.closed.clone(),
    ));
    tokio::spawn(reader_task(
        read_half,
        id,
        events,
        conn.close_signal.clone(),
        conn.closed.clone(),
    ));
    conn
}

async fn writer_task(
    mut write_half: OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<Vec<u8>>,
    queued_bytes: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
) {
    while let Some(bytes) = outbox.recv().await {
        // Empty vec is the close sentinel from Connection::close
        if bytes.is_empty() || closed.load(Ordering::Acquire) {
            break;
        }
        let len = bytes.len();
        let result = write_half.write_all(&bytes).await;
        queued_bytes.fetch_sub(len, Ordering::AcqRel);
        if result.is_err() {
            break;
        }
    }
    // FIN the write side; the remote (and our reader) observe EOF
    let _ = write_half.shutdown().await;
}

async fn reader_task(
    mut read_half: OwnedReadHalf,
    conn_id: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
    close_signal: Arc<Notify>,
    closed: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; RECV_CHUNK_SIZE];
    loop {
        if closed.load(Ordering::Acquire) {
            break;
        }
        tokio::select! {
            read = read_half.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if events
                            .send(TransportEvent::Received { conn_id, bytes: buf[..n].to_vec() })
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            _ = close_signal.notified() => break,
        }
    }
    closed.store(true, Ordering::Release);
    // The reader is the sole emitter of Closed, and it runs this exactly once
    let _ = events.send(TransportEvent::Closed { conn_id });
    trace!(conn = conn_id, "connection reader finished");
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Connection factory: accept loop plus outbound dialing. Holds no peer
/// state; connections report back through the shared event channel.
pub struct Transport {
    events: mpsc::UnboundedSender<TransportEvent>,
    listener_task: Option<JoinHandle<()>>,
    listen_port: u16,
}

impl Transport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { events, listener_task: None, listen_port: 0 }
    }

    /// Bind and start accepting. Port 0 binds an ephemeral port; the bound
    /// port is returned so callers (and tests) can learn it.
    pub async fn listen(&mut self, port: u16) -> std::io::Result<u16> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_port = listener.local_addr()?.port();
        self.listen_port = local_port;

        let events = self.events.clone();
        self.listener_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        trace!(%remote, "accepted inbound connection");
                        let conn = spawn_connection(stream, remote, true, events.clone());
                        if events.send(TransportEvent::Accepted { conn }).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(%err, "accept failed");
                    }
                }
            }
        }));
        Ok(local_port)
    }

    pub fn listening_port(&self) -> u16 {
        self.listen_port
    }

    /// Dial `remote` with the bounded connect timeout. Completion arrives
    /// as a ConnectResult event carrying `attempt_id`.
    pub fn connect(&self, attempt_id: u64, remote: SocketAddr) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let attempt =
                tokio::time::timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), TcpStream::connect(remote))
                    .await;
            let conn = match attempt {
                Ok(Ok(stream)) => Some(spawn_connection(stream, remote, false, events.clone())),
                Ok(Err(err)) => {
                    debug!(%remote, %err, "connect failed");
                    None
                }
                Err(_) => {
                    debug!(%remote, "connect timed out");
                    None
                }
            };
            let _ = events.send(TransportEvent::ConnectResult { attempt_id, conn });
        });
    }

    /// Stop accepting new connections. Existing connections are closed by
    /// the peer manager, not here.
    pub fn stop(&mut self) {
        if let Some(task) = self.listener_task.take() {
            task.abort();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}
