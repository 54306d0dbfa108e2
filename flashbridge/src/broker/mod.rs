//! Serial connection broker.
//!
//! Owns at most one native handle per port and fans its traffic out to any
//! number of logical subscribers.
//!
//! ```text
//!  subscriber A ─┐                        ┌─ reader thread ── Port (native)
//!  subscriber B ─┼── SerialBroker ── Connection
//!  subscriber C ─┘     port map           └─ writer ──────────┘
//! ```
//!
//! The first subscriber of a port opens it; concurrent cold subscribers share
//! that single open. Every chunk read from the hardware is delivered to every
//! subscriber as a [`SerialEvent::Raw`] frame followed by the
//! [`SerialEvent::Line`] frames it completed, in hardware order. The last
//! unsubscribe, a native read error or [`SerialBroker::force_close`] tears the
//! connection down and removes it from the map.
//!
//! All check-then-act sequences on the port map run under one synchronous
//! lock with no `.await` inside. A per-port lease is held for the whole life
//! of a native handle, so a connection re-created right after an eviction
//! waits for the old handle to be released before opening.
//!
//! [`SerialBroker::claim_for_programming`] evicts a port's subscribers and
//! takes that same lease for the length of an upload job. While the returned
//! [`ProgramLease`] lives, subscribing to the port fails with
//! [`Error::PortBusy`].

pub mod framing;

use std::collections::{HashMap, HashSet};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, trace, warn};
use tokio::sync::{OnceCell, OwnedMutexGuard, mpsc};

use crate::error::{Error, Result};
use crate::port::{NativePortOpener, Port, PortOpener, SerialConfig};

pub use framing::LineFramer;

/// Baud rate used when a client does not ask for one.
pub const DEFAULT_BAUD: u32 = 115200;

/// Interval at which reader threads check for shutdown.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Identifier of a logical subscriber.
pub type SubscriberId = u64;

/// Sending half of a subscriber's event stream.
pub type EventSender = mpsc::UnboundedSender<SerialEvent>;

/// Receiving half of a subscriber's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<SerialEvent>;

/// Event delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialEvent {
    /// Subscription is live.
    Connected {
        /// Port name.
        port: String,
        /// Rate the port actually runs at.
        baud_rate: u32,
    },
    /// One decoded text line.
    Line {
        /// Port name.
        port: String,
        /// Line without its terminator.
        text: String,
        /// Read time in milliseconds since the Unix epoch.
        timestamp: u64,
    },
    /// One raw chunk as read from the hardware.
    Raw {
        /// Port name.
        port: String,
        /// Chunk contents.
        bytes: Vec<u8>,
        /// Read time in milliseconds since the Unix epoch.
        timestamp: u64,
    },
    /// Native read or write failure; a `Disconnected` follows.
    ConnectionError {
        /// Port name.
        port: String,
        /// Error text.
        error: String,
    },
    /// The port was taken over (e.g. for programming).
    Preempted {
        /// Port name.
        port: String,
    },
    /// The subscription ended.
    Disconnected {
        /// Port name.
        port: String,
    },
}

impl SerialEvent {
    /// Port the event belongs to.
    pub fn port(&self) -> &str {
        match self {
            Self::Connected { port, .. }
            | Self::Line { port, .. }
            | Self::Raw { port, .. }
            | Self::ConnectionError { port, .. }
            | Self::Preempted { port }
            | Self::Disconnected { port } => port,
        }
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Native open in progress.
    Opening,
    /// Handle open, reader running.
    Open,
    /// Teardown in progress.
    Closing,
    /// Handle released.
    Closed,
}

/// Milliseconds since the Unix epoch.
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Subscriber {
    tx: EventSender,
    /// `Connected` was delivered; data frames flow only after that.
    announced: bool,
}

/// Native side of an open connection.
struct ConnectionIo {
    writer: Mutex<Option<Box<dyn Port>>>,
    pending_reader: Mutex<Option<Box<dyn Read + Send>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    lease: Mutex<Option<OwnedMutexGuard<()>>>,
}

/// What [`Connection::release_io`] took out of the connection.
#[derive(Default)]
struct Released {
    reader: Option<JoinHandle<()>>,
    lease: Option<OwnedMutexGuard<()>>,
}

struct Connection {
    port: String,
    baud_rate: u32,
    state: Mutex<ConnectionState>,
    closed: AtomicBool,
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
    io: OnceCell<ConnectionIo>,
}

impl Connection {
    fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            state: Mutex::new(ConnectionState::Opening),
            closed: AtomicBool::new(false),
            subscribers: Mutex::new(HashMap::new()),
            io: OnceCell::new(),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Mark the connection closed. Returns `true` for the first caller.
    fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.set_state(ConnectionState::Closing);
        }
        first
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn add_subscriber(&self, id: SubscriberId, tx: EventSender) {
        lock(&self.subscribers).insert(
            id,
            Subscriber {
                tx,
                announced: false,
            },
        );
    }

    fn remove_subscriber(&self, id: SubscriberId) -> Option<Subscriber> {
        lock(&self.subscribers).remove(&id)
    }

    fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Send `Connected` to every subscriber that has not had it yet.
    fn announce_pending(&self) {
        for sub in lock(&self.subscribers).values_mut() {
            if !sub.announced {
                let _ = sub.tx.send(SerialEvent::Connected {
                    port: self.port.clone(),
                    baud_rate: self.baud_rate,
                });
                sub.announced = true;
            }
        }
    }

    /// Deliver `event` to every announced subscriber.
    fn broadcast(&self, event: &SerialEvent) {
        for sub in lock(&self.subscribers).values() {
            if sub.announced {
                let _ = sub.tx.send(event.clone());
            }
        }
    }

    /// Deliver `event` to every subscriber and forget them all.
    fn drain_subscribers(&self, event: &SerialEvent) {
        for (_, sub) in lock(&self.subscribers).drain() {
            let _ = sub.tx.send(event.clone());
        }
    }

    /// Stop the reader and close the writer. Safe to call more than once.
    fn release_io(&self) -> Released {
        let Some(io) = self.io.get() else {
            return Released::default();
        };
        io.shutdown.store(true, Ordering::SeqCst);
        lock(&io.pending_reader).take();
        if let Some(mut writer) = lock(&io.writer).take() {
            if let Err(e) = writer.close() {
                warn!("Failed to close {}: {e}", self.port);
            }
        }
        Released {
            reader: lock(&io.reader).take(),
            lease: lock(&io.lease).take(),
        }
    }

    /// Start the reader thread once the handle is open.
    fn start_reader(self: &Arc<Self>, broker: Weak<BrokerInner>) -> Result<()> {
        let Some(io) = self.io.get() else {
            return Ok(());
        };
        let Some(reader) = lock(&io.pending_reader).take() else {
            return Ok(());
        };

        let conn = Arc::clone(self);
        let shutdown = Arc::clone(&io.shutdown);
        let handle = std::thread::Builder::new()
            .name(format!("serial-{}", self.port))
            .spawn(move || read_loop(reader, &conn, &broker, &shutdown))?;
        *lock(&io.reader) = Some(handle);
        Ok(())
    }
}

/// Blocking read loop run on the connection's reader thread.
fn read_loop(
    mut reader: Box<dyn Read + Send>,
    conn: &Arc<Connection>,
    broker: &Weak<BrokerInner>,
    shutdown: &AtomicBool,
) {
    let mut framer = LineFramer::new();
    let mut buf = [0u8; 1024];

    let error = loop {
        if shutdown.load(Ordering::SeqCst) {
            trace!("Reader for {} stopping", conn.port);
            return;
        }
        match reader.read(&mut buf) {
            Ok(0) => {},
            Ok(n) => {
                let timestamp = timestamp_millis();
                conn.broadcast(&SerialEvent::Raw {
                    port: conn.port.clone(),
                    bytes: buf[..n].to_vec(),
                    timestamp,
                });
                for text in framer.push(&buf[..n]) {
                    conn.broadcast(&SerialEvent::Line {
                        port: conn.port.clone(),
                        text,
                        timestamp,
                    });
                }
            },
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {},
            Err(e) => break e,
        }
    };

    if shutdown.load(Ordering::SeqCst) {
        // closed underneath us
        return;
    }

    warn!("Serial read error on {}: {error}", conn.port);
    if let Some(text) = framer.flush() {
        conn.broadcast(&SerialEvent::Line {
            port: conn.port.clone(),
            text,
            timestamp: timestamp_millis(),
        });
    }
    conn.broadcast(&SerialEvent::ConnectionError {
        port: conn.port.clone(),
        error: error.to_string(),
    });
    drop(reader);

    conn.mark_closed();
    if let Some(inner) = broker.upgrade() {
        inner.detach(conn);
    }
    // our own JoinHandle is dropped, not joined
    let released = conn.release_io();
    conn.drain_subscribers(&SerialEvent::Disconnected {
        port: conn.port.clone(),
    });
    drop(released.lease);
    conn.set_state(ConnectionState::Closed);
}

struct BrokerInner {
    opener: Arc<dyn PortOpener>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    port_leases: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    programming: Mutex<HashSet<String>>,
    next_id: AtomicU64,
    read_timeout: Duration,
}

impl BrokerInner {
    /// Remove `conn` from the map if it is still the registered connection.
    fn detach(&self, conn: &Arc<Connection>) -> bool {
        let mut map = lock(&self.connections);
        match map.get(&conn.port) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                map.remove(&conn.port);
                true
            },
            _ => false,
        }
    }

    fn lease_for(&self, port: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(lock(&self.port_leases).entry(port.to_string()).or_default())
    }
}

/// Multiplexes serial ports between subscribers.
pub struct SerialBroker {
    inner: Arc<BrokerInner>,
}

impl SerialBroker {
    /// Create a broker over `opener`.
    pub fn new(opener: Arc<dyn PortOpener>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                opener,
                connections: Mutex::new(HashMap::new()),
                port_leases: Mutex::new(HashMap::new()),
                programming: Mutex::new(HashSet::new()),
                next_id: AtomicU64::new(1),
                read_timeout: READ_TIMEOUT,
            }),
        }
    }

    /// Create a broker over native serial ports.
    pub fn native() -> Self {
        Self::new(Arc::new(NativePortOpener))
    }

    /// Allocate a fresh subscriber id.
    pub fn next_subscriber_id(&self) -> SubscriberId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Subscribe `id` to `port`, opening it at `baud_rate` if needed.
    ///
    /// A port that is already open keeps its rate; the returned value (and the
    /// `Connected` event sent to `tx`) is the effective rate.
    pub async fn subscribe(
        &self,
        port: &str,
        baud_rate: u32,
        id: SubscriberId,
        tx: EventSender,
    ) -> Result<u32> {
        let conn = {
            let mut map = lock(&self.inner.connections);
            if lock(&self.inner.programming).contains(port) {
                debug!("Rejecting subscriber {id} on {port}: programming in progress");
                return Err(busy(port));
            }
            let conn = Arc::clone(map.entry(port.to_string()).or_insert_with(|| {
                debug!("New connection entry for {port} at {baud_rate} baud");
                Arc::new(Connection::new(port, baud_rate))
            }));
            conn.add_subscriber(id, tx);
            conn
        };

        if conn.baud_rate != baud_rate {
            warn!(
                "{port} is already open at {} baud; subscriber {id} asked for {baud_rate}",
                conn.baud_rate
            );
        }

        if let Err(e) = conn.io.get_or_try_init(|| self.open_io(&conn)).await {
            warn!("Failed to open {port}: {e}");
            self.abandon(&conn, id);
            return Err(e);
        }

        if conn.is_closed() {
            // evicted while the open was in flight
            conn.remove_subscriber(id);
            self.teardown(&conn).await;
            return Err(Error::NotConnected(format!(
                "{port} was closed while opening"
            )));
        }

        conn.announce_pending();
        if let Err(e) = conn.start_reader(Arc::downgrade(&self.inner)) {
            conn.broadcast(&SerialEvent::ConnectionError {
                port: port.to_string(),
                error: e.to_string(),
            });
            self.evict(&conn, &SerialEvent::Disconnected {
                port: port.to_string(),
            })
            .await;
            return Err(e);
        }

        debug!(
            "Subscriber {id} attached to {port} ({} total)",
            conn.subscriber_count()
        );
        Ok(conn.baud_rate)
    }

    async fn open_io(&self, conn: &Arc<Connection>) -> Result<ConnectionIo> {
        let lease = self.inner.lease_for(&conn.port).lock_owned().await;
        if conn.is_closed() {
            // evicted while waiting for the previous handle
            return Err(Error::NotConnected(format!(
                "{} was closed while opening",
                conn.port
            )));
        }

        let opener = Arc::clone(&self.inner.opener);
        let config =
            SerialConfig::new(&conn.port, conn.baud_rate).with_timeout(self.inner.read_timeout);
        let port = tokio::task::spawn_blocking(move || opener.open(&config))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        let reader = port.try_clone_reader()?;

        info!("Opened {} at {} baud", conn.port, conn.baud_rate);
        conn.set_state(ConnectionState::Open);
        Ok(ConnectionIo {
            writer: Mutex::new(Some(port)),
            pending_reader: Mutex::new(Some(reader)),
            reader: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            lease: Mutex::new(Some(lease)),
        })
    }

    /// Drop a subscriber whose open failed; remove the entry if it was the last.
    fn abandon(&self, conn: &Arc<Connection>, id: SubscriberId) {
        let mut map = lock(&self.inner.connections);
        conn.remove_subscriber(id);
        if conn.subscriber_count() == 0 {
            if let Some(current) = map.get(&conn.port) {
                if Arc::ptr_eq(current, conn) {
                    map.remove(&conn.port);
                    conn.mark_closed();
                }
            }
        }
    }

    /// Release the native side of a detached connection and wait for its reader.
    async fn teardown(&self, conn: &Arc<Connection>) {
        let released = conn.release_io();
        if let Some(handle) = released.reader {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!("Reader thread for {} did not exit cleanly", conn.port);
            }
        }
        drop(released.lease);
        conn.set_state(ConnectionState::Closed);
    }

    /// Detach `conn`, notify every subscriber with `event` and tear it down.
    async fn evict(&self, conn: &Arc<Connection>, event: &SerialEvent) {
        self.inner.detach(conn);
        conn.mark_closed();
        conn.drain_subscribers(event);
        self.teardown(conn).await;
    }

    /// Remove `id` from `port`; closes the port when it was the last subscriber.
    pub async fn unsubscribe(&self, port: &str, id: SubscriberId) -> Result<()> {
        let (conn, sub, last) = {
            let mut map = lock(&self.inner.connections);
            let conn = map
                .get(port)
                .cloned()
                .ok_or_else(|| Error::NotConnected(port.to_string()))?;
            let sub = conn
                .remove_subscriber(id)
                .ok_or_else(|| Error::NotConnected(port.to_string()))?;
            let last = conn.subscriber_count() == 0;
            if last {
                map.remove(port);
                conn.mark_closed();
            }
            (conn, sub, last)
        };

        if last {
            info!("Last subscriber left {port}, closing");
            self.teardown(&conn).await;
        } else {
            debug!("Subscriber {id} left {port}");
        }
        let _ = sub.tx.send(SerialEvent::Disconnected {
            port: port.to_string(),
        });
        Ok(())
    }

    /// Unsubscribe `id` from every port it is attached to.
    pub async fn unsubscribe_all(&self, id: SubscriberId) {
        let ports: Vec<String> = lock(&self.inner.connections)
            .iter()
            .filter(|(_, conn)| lock(&conn.subscribers).contains_key(&id))
            .map(|(port, _)| port.clone())
            .collect();
        for port in ports {
            if let Err(e) = self.unsubscribe(&port, id).await {
                debug!("Unsubscribe {id} from {port}: {e}");
            }
        }
    }

    /// Write `data` to an open port.
    pub fn send(&self, port: &str, data: &[u8]) -> Result<usize> {
        let conn = lock(&self.inner.connections)
            .get(port)
            .cloned()
            .ok_or_else(|| Error::NotConnected(port.to_string()))?;
        let io = conn
            .io
            .get()
            .ok_or_else(|| Error::NotConnected(port.to_string()))?;

        let mut writer = lock(&io.writer);
        let port_handle = writer
            .as_mut()
            .ok_or_else(|| Error::NotConnected(port.to_string()))?;
        port_handle.write_all(data)?;
        port_handle.flush()?;
        trace!("Sent {} bytes to {port}", data.len());
        Ok(data.len())
    }

    /// Evict every subscriber of `port` and release the handle.
    ///
    /// Subscribers receive [`SerialEvent::Preempted`]. Returns whether the
    /// port was open. The native handle is closed when this returns.
    pub async fn force_close(&self, port: &str) -> bool {
        let Some(conn) = lock(&self.inner.connections).remove(port) else {
            return false;
        };
        info!(
            "Preempting {port} ({} subscriber(s))",
            conn.subscriber_count()
        );
        conn.mark_closed();
        conn.drain_subscribers(&SerialEvent::Preempted {
            port: port.to_string(),
        });
        self.teardown(&conn).await;
        true
    }

    /// Take `port` away from its observers for a programming job.
    ///
    /// Current subscribers receive [`SerialEvent::Preempted`]. The call returns
    /// once no broker connection holds the native handle; from then until the
    /// lease is dropped, subscribing to `port` fails with [`Error::PortBusy`].
    /// A second claim on the same port fails the same way.
    pub async fn claim_for_programming(&self, port: &str) -> Result<ProgramLease> {
        {
            let _map = lock(&self.inner.connections);
            if !lock(&self.inner.programming).insert(port.to_string()) {
                return Err(busy(port));
            }
        }
        // dropping the lease from here on clears the mark again
        let mut lease = ProgramLease {
            port: port.to_string(),
            inner: Arc::clone(&self.inner),
            guard: None,
        };

        if self.force_close(port).await {
            info!("Closed serial observers of {port} for programming");
        }
        lease.guard = Some(self.inner.lease_for(port).lock_owned().await);
        debug!("Holding {port} for programming");
        Ok(lease)
    }

    /// Whether a programming job holds `port`.
    pub fn is_programming(&self, port: &str) -> bool {
        lock(&self.inner.programming).contains(port)
    }

    /// Close every connection.
    pub async fn shutdown(&self) {
        let conns: Vec<Arc<Connection>> = lock(&self.inner.connections)
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in conns {
            debug!("Closing {} for shutdown", conn.port);
            conn.mark_closed();
            conn.drain_subscribers(&SerialEvent::Disconnected {
                port: conn.port.clone(),
            });
            self.teardown(&conn).await;
        }
    }

    /// Ports with a live connection entry, sorted.
    pub fn open_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = lock(&self.inner.connections).keys().cloned().collect();
        ports.sort();
        ports
    }

    /// Number of subscribers attached to `port`.
    pub fn subscriber_count(&self, port: &str) -> usize {
        lock(&self.inner.connections)
            .get(port)
            .map_or(0, |conn| conn.subscriber_count())
    }

    /// Lifecycle state of `port`'s connection, if it has one.
    pub fn connection_state(&self, port: &str) -> Option<ConnectionState> {
        lock(&self.inner.connections)
            .get(port)
            .map(|conn| conn.state())
    }
}

fn busy(port: &str) -> Error {
    Error::PortBusy(format!("programming in progress on {port}"))
}

/// Exclusive hold on a port for the length of a programming job.
///
/// Native opens made through [`ProgramLease::opener`] run under the same
/// per-port lease the broker's connections use.
pub struct ProgramLease {
    port: String,
    inner: Arc<BrokerInner>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ProgramLease {
    /// Port held by this lease.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Opener for direct access to the held port (e.g. the reset sequence).
    pub fn opener(&self) -> Arc<dyn PortOpener> {
        Arc::clone(&self.inner.opener)
    }
}

impl Drop for ProgramLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        lock(&self.inner.programming).remove(&self.port);
        debug!("Released {} after programming", self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::testing::FakeOpener;

    const PORT: &str = "/dev/ttyUSB0";

    fn broker() -> (Arc<FakeOpener>, SerialBroker) {
        let opener = Arc::new(FakeOpener::default());
        let broker = SerialBroker::new(Arc::clone(&opener) as Arc<dyn PortOpener>);
        (opener, broker)
    }

    async fn next(rx: &mut EventReceiver) -> SerialEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_three_subscribers_share_one_open() {
        let (opener, broker) = broker();
        let mut rxs = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = broker.next_subscriber_id();
            assert_eq!(broker.subscribe(PORT, 9600, id, tx).await.unwrap(), 9600);
            rxs.push((id, rx));
        }

        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
        assert_eq!(broker.subscriber_count(PORT), 3);
        assert_eq!(broker.connection_state(PORT), Some(ConnectionState::Open));
        for (_, rx) in &mut rxs {
            assert_eq!(
                next(rx).await,
                SerialEvent::Connected {
                    port: PORT.into(),
                    baud_rate: 9600
                }
            );
        }

        for (i, (id, rx)) in rxs.iter_mut().enumerate() {
            broker.unsubscribe(PORT, *id).await.unwrap();
            assert_eq!(
                next(rx).await,
                SerialEvent::Disconnected { port: PORT.into() }
            );
            let remaining = 2 - i;
            assert_eq!(broker.subscriber_count(PORT), remaining);
            let expected_open = usize::from(remaining > 0);
            assert_eq!(opener.open_now.load(Ordering::SeqCst), expected_open);
        }
        assert!(broker.open_ports().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_cold_subscribes_coalesce() {
        let opener = Arc::new(FakeOpener {
            open_delay: Some(Duration::from_millis(50)),
            ..FakeOpener::default()
        });
        let broker = SerialBroker::new(Arc::clone(&opener) as Arc<dyn PortOpener>);

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let (tx3, _rx3) = mpsc::unbounded_channel();
        let (a, b, c) = tokio::join!(
            broker.subscribe(PORT, 115200, 1, tx1),
            broker.subscribe(PORT, 115200, 2, tx2),
            broker.subscribe(PORT, 115200, 3, tx3),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
        assert_eq!(broker.subscriber_count(PORT), 3);

        broker.unsubscribe_all(1).await;
        broker.unsubscribe_all(2).await;
        broker.unsubscribe_all(3).await;
        assert_eq!(opener.open_now.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_later_subscriber_bound_to_existing_baud() {
        let (opener, broker) = broker();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        broker.subscribe(PORT, 115200, 1, tx1).await.unwrap();
        let effective = broker.subscribe(PORT, 9600, 2, tx2).await.unwrap();

        assert_eq!(effective, 115200);
        assert_eq!(
            next(&mut rx2).await,
            SerialEvent::Connected {
                port: PORT.into(),
                baud_rate: 115200
            }
        );
        assert_eq!(opener.bauds.lock().unwrap().as_slice(), &[115200]);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_chunks_fan_out_in_order() {
        let (opener, broker) = broker();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        broker.subscribe(PORT, 115200, 1, tx1).await.unwrap();
        broker.subscribe(PORT, 115200, 2, tx2).await.unwrap();

        let wire = opener.wire(PORT);
        wire.push(b"boot\r\nrea");
        wire.push(b"dy\n");

        for rx in [&mut rx1, &mut rx2] {
            assert!(matches!(next(rx).await, SerialEvent::Connected { .. }));
            match next(rx).await {
                SerialEvent::Raw { bytes, .. } => assert_eq!(bytes, b"boot\r\nrea"),
                other => panic!("unexpected {other:?}"),
            }
            match next(rx).await {
                SerialEvent::Line { text, .. } => assert_eq!(text, "boot"),
                other => panic!("unexpected {other:?}"),
            }
            match next(rx).await {
                SerialEvent::Raw { bytes, .. } => assert_eq!(bytes, b"dy\n"),
                other => panic!("unexpected {other:?}"),
            }
            match next(rx).await {
                SerialEvent::Line { text, .. } => assert_eq!(text, "ready"),
                other => panic!("unexpected {other:?}"),
            }
        }
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_writes_to_port() {
        let (opener, broker) = broker();
        let (tx, _rx) = mpsc::unbounded_channel();
        broker.subscribe(PORT, 115200, 1, tx).await.unwrap();

        assert_eq!(broker.send(PORT, b"AT\r\n").unwrap(), 4);
        assert_eq!(opener.wire(PORT).written.lock().unwrap().as_slice(), b"AT\r\n");
        assert!(matches!(
            broker.send("/dev/ttyUSB9", b"x"),
            Err(Error::NotConnected(_))
        ));
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_force_close_preempts_every_subscriber() {
        let (opener, broker) = broker();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        broker.subscribe(PORT, 115200, 1, tx1).await.unwrap();
        broker.subscribe(PORT, 115200, 2, tx2).await.unwrap();

        assert!(broker.force_close(PORT).await);

        for rx in [&mut rx1, &mut rx2] {
            assert!(matches!(next(rx).await, SerialEvent::Connected { .. }));
            assert_eq!(
                next(rx).await,
                SerialEvent::Preempted { port: PORT.into() }
            );
        }
        assert_eq!(opener.open_now.load(Ordering::SeqCst), 0);
        assert!(broker.open_ports().is_empty());
        assert!(matches!(
            broker.unsubscribe(PORT, 1).await,
            Err(Error::NotConnected(_))
        ));
        assert!(!broker.force_close(PORT).await);
    }

    #[tokio::test]
    async fn test_unplug_reports_error_and_removes_entry() {
        let (opener, broker) = broker();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.subscribe(PORT, 115200, 1, tx).await.unwrap();
        assert!(matches!(next(&mut rx).await, SerialEvent::Connected { .. }));

        opener.wire(PORT).unplug();

        assert!(matches!(
            next(&mut rx).await,
            SerialEvent::ConnectionError { .. }
        ));
        assert_eq!(
            next(&mut rx).await,
            SerialEvent::Disconnected { port: PORT.into() }
        );
        assert!(broker.open_ports().is_empty());
        assert_eq!(opener.open_now.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_no_entry() {
        let opener = Arc::new(FakeOpener {
            fail_open: true,
            ..FakeOpener::default()
        });
        let broker = SerialBroker::new(opener as Arc<dyn PortOpener>);
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = broker.subscribe(PORT, 115200, 1, tx).await.unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::PermissionDenied);
        assert!(broker.open_ports().is_empty());
    }

    #[tokio::test]
    async fn test_resubscribe_after_close_reopens() {
        let (opener, broker) = broker();
        let (tx, _rx) = mpsc::unbounded_channel();
        broker.subscribe(PORT, 115200, 1, tx).await.unwrap();
        broker.unsubscribe(PORT, 1).await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        broker.subscribe(PORT, 115200, 2, tx).await.unwrap();
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
        assert_eq!(opener.open_now.load(Ordering::SeqCst), 1);
        broker.shutdown().await;
        assert_eq!(opener.open_now.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_programming_claim_excludes_observers() {
        let (opener, broker) = broker();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.subscribe(PORT, 115200, 1, tx).await.unwrap();

        let lease = broker.claim_for_programming(PORT).await.unwrap();
        assert_eq!(lease.port(), PORT);
        assert!(broker.is_programming(PORT));
        assert!(matches!(next(&mut rx).await, SerialEvent::Connected { .. }));
        assert_eq!(
            next(&mut rx).await,
            SerialEvent::Preempted { port: PORT.into() }
        );
        assert_eq!(opener.open_now.load(Ordering::SeqCst), 0);

        let (tx, mut rx2) = mpsc::unbounded_channel();
        let err = broker.subscribe(PORT, 115200, 2, tx).await.unwrap_err();
        assert!(matches!(err, Error::PortBusy(_)));
        assert!(err.to_string().contains("programming"));
        assert!(rx2.try_recv().is_err());
        assert!(broker.open_ports().is_empty());
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
        assert!(matches!(
            broker.claim_for_programming(PORT).await,
            Err(Error::PortBusy(_))
        ));

        // other ports are unaffected
        let (tx, _rx3) = mpsc::unbounded_channel();
        broker.subscribe("COM9", 115200, 3, tx).await.unwrap();

        drop(lease);
        assert!(!broker.is_programming(PORT));
        let (tx, _rx4) = mpsc::unbounded_channel();
        broker.subscribe(PORT, 115200, 4, tx).await.unwrap();
        assert_eq!(opener.open_now.load(Ordering::SeqCst), 2);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_claim_waits_for_inflight_open() {
        let opener = Arc::new(FakeOpener {
            open_delay: Some(Duration::from_millis(100)),
            ..FakeOpener::default()
        });
        let broker = SerialBroker::new(Arc::clone(&opener) as Arc<dyn PortOpener>);
        let (tx, _rx) = mpsc::unbounded_channel();

        let (subscribed, claimed) = tokio::join!(
            broker.subscribe(PORT, 115200, 1, tx),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let lease = broker.claim_for_programming(PORT).await;
                (lease, opener.open_now.load(Ordering::SeqCst))
            },
        );

        assert!(subscribed.is_err());
        let (lease, open_at_claim) = claimed;
        assert!(lease.is_ok());
        assert_eq!(open_at_claim, 0);
        assert!(broker.open_ports().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_port() {
        let (_opener, broker) = broker();
        assert!(matches!(
            broker.unsubscribe(PORT, 7).await,
            Err(Error::NotConnected(_))
        ));
    }
}
