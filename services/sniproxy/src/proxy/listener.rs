//! TCP listener and connection forwarding.
//!
//! Each accepted connection is handled in its own task:
//! 1. read one initial chunk from the client
//! 2. sniff a hostname from it (local IP address if none)
//! 3. resolve a destination against the active config snapshot
//! 4. dial the backend and replay the initial chunk
//! 5. relay both directions until either one finishes
//!
//! Failures at any step close the connection without sending anything to
//! the client. Nothing is retried.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn, Instrument};

use super::sniff::{sniff, DEFAULT_INITIAL_READ_SIZE};
use crate::store::SharedConfigStore;

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

const RELAY_BUFFER_SIZE: usize = 8192;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Size of the single read whose bytes are sniffed.
    pub initial_read_size: usize,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            initial_read_size: DEFAULT_INITIAL_READ_SIZE,
        }
    }

    /// Listen on all IPv4 interfaces.
    pub fn any_v4(port: u16) -> Self {
        Self::new(SocketAddr::from(([0, 0, 0, 0], port)))
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections where the sniffer found a hostname.
    pub sniffed: AtomicU64,
    /// Connections that resolved to a destination.
    pub routed: AtomicU64,
    /// Connections dropped for lack of a destination.
    pub unrouted: AtomicU64,
    /// Backend dials that succeeded.
    pub backend_connected: AtomicU64,
    /// Backend dials that failed.
    pub backend_failed: AtomicU64,
    /// Bytes written to backends, including replayed initial bytes.
    pub bytes_to_backend: AtomicU64,
    /// Bytes written back to clients.
    pub bytes_from_backend: AtomicU64,
}

/// Which relay direction finished first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    ClientToBackend,
    BackendToClient,
}

/// How a relay ended.
#[derive(Debug)]
pub struct RelayOutcome {
    /// Direction whose completion ended the relay.
    pub finished: RelayDirection,
    /// Result of that direction: bytes copied or the I/O error.
    pub result: io::Result<u64>,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

/// A TCP listener for one configured port.
pub struct Listener {
    listener: TcpListener,
    config: ListenerConfig,
    store: SharedConfigStore,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind to `config.bind_addr`.
    pub async fn bind(config: ListenerConfig, store: SharedConfigStore) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(bind_addr = %local_addr, "Listener bound");

        Ok(Self {
            listener,
            config,
            store,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get the listener's counters.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections forever.
    ///
    /// Accept errors are logged and retried; they never end the loop.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream).await {
                                debug!(error = %e, "Connection error");
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Forward a single client connection.
    async fn handle_connection(&self, mut client: TcpStream) -> io::Result<()> {
        let local_addr = client.local_addr()?;

        let mut initial = vec![0u8; self.config.initial_read_size];
        let n = client.read(&mut initial).await?;
        if n == 0 {
            debug!("Client closed before sending data");
            return Ok(());
        }
        initial.truncate(n);

        let sniffed = sniff(&initial);
        let source = sniffed.source();
        let identity = match sniffed.into_hostname() {
            Some(hostname) => {
                self.stats.sniffed.fetch_add(1, Ordering::Relaxed);
                hostname
            }
            None => local_addr.ip().to_string(),
        };

        let port = local_addr.port();
        let config = self.store.get();

        let Some(route) = config.route(&identity, port) else {
            self.stats.unrouted.fetch_add(1, Ordering::Relaxed);
            warn!(
                identity = %identity,
                source = source,
                port = port,
                "No destination and no default, closing"
            );
            return Ok(());
        };
        self.stats.routed.fetch_add(1, Ordering::Relaxed);
        let destination = route.destination;

        info!(
            identity = %identity,
            source = source,
            port = port,
            kind = %route.kind,
            destination = %destination,
            "Forward"
        );

        let mut backend = match TcpStream::connect(destination.as_str()).await {
            Ok(stream) => {
                self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                stream
            }
            Err(e) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(destination = %destination, error = %e, "Backend connect failed");
                return Ok(());
            }
        };

        // The backend must see the stream from its first byte.
        backend.write_all(&initial).await?;
        self.stats
            .bytes_to_backend
            .fetch_add(initial.len() as u64, Ordering::Relaxed);

        let outcome = relay(&mut client, &mut backend).await;

        self.stats
            .bytes_to_backend
            .fetch_add(outcome.bytes_to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(outcome.bytes_from_backend, Ordering::Relaxed);

        if let Err(e) = &outcome.result {
            debug!(direction = ?outcome.finished, error = %e, "Relay error");
        }

        debug!(
            finished = ?outcome.finished,
            bytes_to_backend = outcome.bytes_to_backend,
            bytes_from_backend = outcome.bytes_from_backend,
            "Connection closed"
        );

        Ok(())
    }
}

/// Relay bytes between client and backend until either direction ends.
///
/// Both directions are polled concurrently. As soon as one reaches EOF or
/// fails, the other is abandoned and the caller drops both sockets.
pub async fn relay<C, B>(client: &mut C, backend: &mut B) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let to_backend = AtomicU64::new(0);
    let from_backend = AtomicU64::new(0);

    let (finished, result) = tokio::select! {
        r = copy_counted(&mut client_read, &mut backend_write, &to_backend) => {
            (RelayDirection::ClientToBackend, r)
        }
        r = copy_counted(&mut backend_read, &mut client_write, &from_backend) => {
            (RelayDirection::BackendToClient, r)
        }
    };

    RelayOutcome {
        finished,
        result,
        bytes_to_backend: to_backend.load(Ordering::Relaxed),
        bytes_from_backend: from_backend.load(Ordering::Relaxed),
    }
}

/// Copy until EOF, keeping a running total visible to the caller even if
/// the copy is cancelled.
async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, total: &AtomicU64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total.fetch_add(n as u64, Ordering::Relaxed);
    }
    writer.flush().await?;
    Ok(total.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::any_v4(443);
        assert_eq!(config.bind_addr, "0.0.0.0:443".parse().unwrap());
        assert_eq!(config.initial_read_size, 1024);
    }

    #[tokio::test]
    async fn test_relay_ends_when_client_closes() {
        let (mut client, mut client_peer) = duplex(64);
        let (mut backend, mut backend_peer) = duplex(64);

        let relay_task =
            tokio::spawn(async move { relay(&mut client_peer, &mut backend_peer).await });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(client);

        let outcome = relay_task.await.unwrap();
        assert_eq!(outcome.finished, RelayDirection::ClientToBackend);
        assert_eq!(outcome.bytes_to_backend, 4);
        assert!(outcome.result.is_ok());
    }

    #[tokio::test]
    async fn test_relay_ends_when_backend_closes() {
        let (mut client, mut client_peer) = duplex(64);
        let (mut backend, mut backend_peer) = duplex(64);

        let relay_task =
            tokio::spawn(async move { relay(&mut client_peer, &mut backend_peer).await });

        backend.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        drop(backend);

        let outcome = relay_task.await.unwrap();
        assert_eq!(outcome.finished, RelayDirection::BackendToClient);
        assert_eq!(outcome.bytes_from_backend, 5);
        assert_eq!(outcome.bytes_to_backend, 0);
    }
}
