//! TCP server for accepting and managing client connections.
//!
//! Each accepted connection gets a reader task, which decodes frames and
//! forwards them as [`TransportEvent`]s, and a writer task fed by an
//! unbounded channel, so callers can queue frames without awaiting the peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::AbortHandle;

use crate::TransportEvent;
use crate::framing::{Frame, FrameConfig, FrameError, read_frame, write_frame};

/// Unique identifier for a TCP connection within a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

struct ConnectionHandle {
    frames: mpsc::UnboundedSender<Frame>,
    reader: AbortHandle,
    peer: SocketAddr,
}

/// Thread-safe map of active connections keyed by [`ConnectionId`].
pub struct ConnectionMap {
    inner: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    max_connections: usize,
}

impl ConnectionMap {
    /// Create a new map with the given capacity limit.
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    /// Queue a frame for a connection. Returns `false` if the connection is
    /// gone or its writer has stopped.
    pub async fn send(&self, id: ConnectionId, frame: Frame) -> bool {
        match self.inner.read().await.get(&id) {
            Some(handle) => handle.frames.send(frame).is_ok(),
            None => false,
        }
    }

    /// Close a connection from the server side. Frames already queued are
    /// still written before the socket shuts down. Returns `false` if the
    /// connection was not open.
    pub async fn close(&self, id: ConnectionId) -> bool {
        match self.inner.write().await.remove(&id) {
            Some(handle) => {
                handle.reader.abort();
                tracing::debug!("Closing connection {id:?} to {}", handle.peer);
                true
            }
            None => false,
        }
    }

    async fn remove(&self, id: ConnectionId) {
        self.inner.write().await.remove(&id);
    }

    /// Return the number of active connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Return whether the map is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Configuration for [`TcpServer`].
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    /// Maximum concurrent connections. Default: 256.
    pub max_connections: usize,
    /// Limits for inbound frames.
    pub frame: FrameConfig,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 256,
            frame: FrameConfig::default(),
        }
    }
}

/// Accepts TCP connections and forwards their frames as events.
pub struct TcpServer {
    config: TcpServerConfig,
    connections: Arc<ConnectionMap>,
    id_gen: Arc<IdGenerator>,
    events: mpsc::Sender<TransportEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TcpServer {
    /// Create a server that delivers events to `events` and stops when
    /// `shutdown_rx` turns `true`.
    pub fn new(
        config: TcpServerConfig,
        events: mpsc::Sender<TransportEvent>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connections: Arc::new(ConnectionMap::new(config.max_connections)),
            id_gen: Arc::new(IdGenerator::new()),
            config,
            events,
            shutdown_rx,
        }
    }

    /// Shared handle to the live connections, for sending and closing.
    pub fn connections(&self) -> Arc<ConnectionMap> {
        Arc::clone(&self.connections)
    }

    /// Run the accept loop on a bound listener until shutdown.
    pub async fn run(self, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                tracing::debug!("Failed to set TCP_NODELAY for {peer}: {e}");
                            }
                            self.accept(stream.into_split(), peer).await;
                        }
                        Err(e) => tracing::warn!("TCP accept failed: {e}"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("TCP server shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn accept(&self, (reader, writer): (OwnedReadHalf, OwnedWriteHalf), peer: SocketAddr) {
        // Hold the map lock until the handle is in, so a reader that exits
        // immediately cannot remove it first.
        let mut map = self.connections.inner.write().await;
        if map.len() >= self.connections.max_connections {
            tracing::warn!("Connection limit reached, rejecting {peer}");
            return;
        }

        let id = self.id_gen.next_id();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(id, writer, frames_rx));

        let reader_task = tokio::spawn(read_loop(
            id,
            reader,
            self.config.frame.clone(),
            self.events.clone(),
            self.shutdown_rx.clone(),
            Arc::clone(&self.connections),
        ));

        map.insert(
            id,
            ConnectionHandle {
                frames: frames_tx,
                reader: reader_task.abort_handle(),
                peer,
            },
        );
        tracing::info!("Accepted connection {id:?} from {peer}");
    }
}

/// Per-connection reader loop.
async fn read_loop(
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    config: FrameConfig,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    connections: Arc<ConnectionMap>,
) {
    loop {
        tokio::select! {
            result = read_frame(&mut reader, &config) => {
                match result {
                    Ok(frame) => {
                        tracing::trace!("Connection {id:?} received frame type {}", frame.kind);
                        if events.send(TransportEvent::TcpFrame { conn: id, frame }).await.is_err() {
                            break;
                        }
                    }
                    Err(FrameError::ConnectionClosed) => break,
                    Err(e) => {
                        tracing::warn!("Connection {id:?} dropped: {e}");
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    connections.remove(id).await;
    let _ = events.send(TransportEvent::TcpClosed { conn: id }).await;
    tracing::info!("Connection {id:?} closed");
}

/// Per-connection writer loop. Ends, shutting down the write half, once the
/// connection's handle is dropped and the queue is drained.
async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame, &FrameConfig::UNLIMITED).await {
            tracing::debug!("Write to connection {id:?} failed: {e}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    struct TestServer {
        addr: SocketAddr,
        connections: Arc<ConnectionMap>,
        events: mpsc::Receiver<TransportEvent>,
        shutdown_tx: watch::Sender<bool>,
    }

    /// Helper: start a server on an ephemeral port.
    async fn start_test_server(config: TcpServerConfig) -> TestServer {
        let (events_tx, events) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = TcpServer::new(config, events_tx, shutdown_rx);
        let connections = server.connections();
        tokio::spawn(server.run(listener));

        TestServer {
            addr,
            connections,
            events,
            shutdown_tx,
        }
    }

    async fn next_event(server: &mut TestServer) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), server.events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_frames_become_events() {
        let mut server = start_test_server(TcpServerConfig::default()).await;
        let mut stream = TcpStream::connect(server.addr).await.unwrap();

        write_frame(&mut stream, &Frame::new(0, "3"), &FrameConfig::default())
            .await
            .unwrap();

        match next_event(&mut server).await {
            TransportEvent::TcpFrame { frame, .. } => assert_eq!(frame, Frame::new(0, "3")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_reaches_client() {
        let mut server = start_test_server(TcpServerConfig::default()).await;
        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        write_frame(&mut stream, &Frame::new(2, ""), &FrameConfig::default())
            .await
            .unwrap();
        let TransportEvent::TcpFrame { conn, .. } = next_event(&mut server).await else {
            panic!("expected a frame event");
        };

        assert!(server.connections.send(conn, Frame::new(6, "1\t2\t3\t4")).await);
        let received = read_frame(&mut stream, &FrameConfig::default()).await.unwrap();
        assert_eq!(received, Frame::new(6, "1\t2\t3\t4"));
    }

    #[tokio::test]
    async fn test_client_disconnect_emits_closed() {
        let mut server = start_test_server(TcpServerConfig::default()).await;
        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        write_frame(&mut stream, &Frame::new(2, ""), &FrameConfig::default())
            .await
            .unwrap();
        let TransportEvent::TcpFrame { conn, .. } = next_event(&mut server).await else {
            panic!("expected a frame event");
        };
        drop(stream);

        match next_event(&mut server).await {
            TransportEvent::TcpClosed { conn: closed } => assert_eq!(closed, conn),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(server.connections.is_empty().await);
    }

    #[tokio::test]
    async fn test_oversized_frame_drops_connection() {
        let config = TcpServerConfig {
            frame: FrameConfig {
                max_payload_size: 8,
            },
            ..Default::default()
        };
        let mut server = start_test_server(config).await;
        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        write_frame(&mut stream, &Frame::new(5, "far too long"), &FrameConfig::default())
            .await
            .unwrap();

        assert!(matches!(
            next_event(&mut server).await,
            TransportEvent::TcpClosed { .. }
        ));
        assert!(server.connections.is_empty().await);
    }

    #[tokio::test]
    async fn test_server_close_sends_eof() {
        let mut server = start_test_server(TcpServerConfig::default()).await;
        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        write_frame(&mut stream, &Frame::new(2, ""), &FrameConfig::default())
            .await
            .unwrap();
        let TransportEvent::TcpFrame { conn, .. } = next_event(&mut server).await else {
            panic!("expected a frame event");
        };

        assert!(server.connections.close(conn).await);
        assert!(!server.connections.close(conn).await);
        assert!(!server.connections.send(conn, Frame::new(4, "")).await);

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0, "Client should receive EOF after close");
    }

    #[tokio::test]
    async fn test_max_connections_enforced() {
        let config = TcpServerConfig {
            max_connections: 2,
            ..Default::default()
        };
        let server = start_test_server(config).await;

        let _c1 = TcpStream::connect(server.addr).await.unwrap();
        let _c2 = TcpStream::connect(server.addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connections.len().await, 2);

        let _c3 = TcpStream::connect(server.addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connections.len().await, 2);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_closes_connections() {
        let server = start_test_server(TcpServerConfig::default()).await;
        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.shutdown_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "Client should receive EOF after server shutdown");
    }

    #[test]
    fn test_connection_id_uniqueness() {
        let id_gen = IdGenerator::new();
        let id1 = id_gen.next_id();
        let id2 = id_gen.next_id();
        let id3 = id_gen.next_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.0 + 1, id2.0);
        assert_eq!(id2.0 + 1, id3.0);
    }
}
