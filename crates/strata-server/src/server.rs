//! Server startup and the core task.
//!
//! One task owns the [`Dispatcher`]. Transports feed it through a single
//! event channel, administration goes through a command channel, and both
//! ticks fire on the same task, so all state changes are serialized without
//! locks. After each step the core flushes the outbox: UDP straight to the
//! socket, TCP into the per-connection writer queues.
//!
//! Region encoding and file writes never run on the core. They go to the
//! blocking pool with a detached copy of the data and report back through a
//! completion channel, so ticks and packets keep flowing while they run.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use strata_config::{Config, ConfigError};
use strata_net::{
    ConnectionMap, FrameConfig, TcpServer, TcpServerConfig, TransportEvent, run_udp_receiver,
    send_datagram,
};
use strata_voxel::{
    BlockCatalog, CatalogError, PlacedBlock, RegionCodecError, RegionCoord, RegionSnapshot,
    RegionSummary, SavedRegion, World, WorldLoadError, WorldSaveError,
};
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::dispatcher::{Dispatcher, DispatcherSettings, Outbox, Outgoing};
use crate::scheduler::Ticks;
use crate::session::SessionInfo;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Errors that stop the server or an administrative request.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    WorldLoad(#[from] WorldLoadError),
    #[error(transparent)]
    WorldSave(#[from] WorldSaveError),
    /// The core task is no longer running.
    #[error("server has stopped")]
    Stopped,
    #[error("server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

enum AdminCommand {
    ListSessions(oneshot::Sender<Vec<SessionInfo>>),
    Kick {
        index: u32,
        reply: oneshot::Sender<Option<String>>,
    },
    KickAll(oneshot::Sender<usize>),
    Region {
        coord: RegionCoord,
        reply: oneshot::Sender<Option<RegionSummary>>,
    },
    NonEmptyBlocks {
        coord: RegionCoord,
        reply: oneshot::Sender<Option<Vec<PlacedBlock>>>,
    },
    CreateRegion {
        coord: RegionCoord,
        reply: oneshot::Sender<bool>,
    },
    Save(SaveReply),
}

type SaveReply = oneshot::Sender<Result<usize, WorldSaveError>>;

/// Blocking work finished off the core.
enum Completion {
    Encoded {
        coord: RegionCoord,
        generation: u64,
        result: Result<Vec<u8>, RegionCodecError>,
    },
    Saved {
        result: Result<Vec<SavedRegion>, WorldSaveError>,
        reply: SaveReply,
    },
}

/// A configured server with its world loaded, ready to bind.
pub struct Server {
    config: Config,
    world: World,
    catalog: BlockCatalog,
}

impl Server {
    pub fn new(config: Config, world: World, catalog: BlockCatalog) -> Self {
        Self {
            config,
            world,
            catalog,
        }
    }

    /// Loads the block catalog and every region named by `config`.
    ///
    /// A missing catalog file yields an empty catalog: the server still runs,
    /// but every edit is rejected. An empty world gets an origin region when
    /// `seed_origin` is set.
    pub fn load(config: Config) -> Result<Self, ServerError> {
        let catalog = match BlockCatalog::load(&config.world.catalog_file) {
            Ok(catalog) => catalog,
            Err(CatalogError::Read(e)) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(
                    "Block catalog {} not found, starting with an empty catalog",
                    config.world.catalog_file.display()
                );
                BlockCatalog::default()
            }
            Err(e) => return Err(e.into()),
        };
        let mut world = World::load_dir(&config.world.world_dir)?;
        if world.is_empty() && config.world.seed_origin {
            world.create_region(RegionCoord::ORIGIN);
        }
        tracing::info!("Loaded {} regions", world.len());
        Ok(Self::new(config, world, catalog))
    }

    /// Binds both sockets on the same port and starts every task.
    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        let network = &self.config.network;
        let addr = format!("{}:{}", network.bind_address, network.port);

        // TCP first, so port 0 resolves to a concrete port UDP can reuse.
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let socket = UdpSocket::bind(local_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: local_addr.to_string(),
                source,
            })?;
        let socket = Arc::new(socket);
        tracing::info!("Listening on {local_addr} (UDP and TCP)");

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let tcp = TcpServer::new(
            TcpServerConfig {
                max_connections: network.max_connections,
                frame: FrameConfig {
                    max_payload_size: u32::try_from(network.max_tcp_payload).unwrap_or(u32::MAX),
                },
            },
            events_tx.clone(),
            shutdown_rx.clone(),
        );
        let connections = tcp.connections();
        tokio::spawn(tcp.run(listener));
        tokio::spawn(run_udp_receiver(
            Arc::clone(&socket),
            events_tx,
            shutdown_rx.clone(),
        ));

        let dispatcher = Dispatcher::new(
            self.world,
            self.catalog,
            DispatcherSettings {
                mode: self.config.world.mode,
                keepalive_grace: self.config.timing.keepalive_grace(),
                world_dir: self.config.world.world_dir.clone(),
            },
        );
        tracing::info!("World mode: {:?}", self.config.world.mode);

        let core = Core {
            dispatcher,
            socket,
            connections,
            ticks: Ticks::new(&self.config.timing),
            save_on_shutdown: self.config.world.save_on_shutdown,
            completions: completions_tx,
            saving: false,
            queued_saves: VecDeque::new(),
        };
        let task = tokio::spawn(core.run(events_rx, commands_rx, completions_rx, shutdown_rx));

        Ok(ServerHandle {
            local_addr,
            commands: commands_tx,
            shutdown_tx,
            task,
        })
    }
}

/// Control surface of a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    commands: mpsc::Sender<AdminCommand>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl ServerHandle {
    /// Address both sockets are bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> AdminCommand,
    ) -> Result<T, ServerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| ServerError::Stopped)?;
        reply_rx.await.map_err(|_| ServerError::Stopped)
    }

    /// Every connected session, in index order.
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ServerError> {
        self.request(AdminCommand::ListSessions).await
    }

    /// Disconnects one session. Returns the username it had, or `None` if
    /// the index was free.
    pub async fn kick(&self, index: u32) -> Result<Option<String>, ServerError> {
        self.request(|reply| AdminCommand::Kick { index, reply })
            .await
    }

    /// Disconnects every session. Returns how many there were.
    pub async fn kick_all(&self) -> Result<usize, ServerError> {
        self.request(AdminCommand::KickAll).await
    }

    pub async fn get_region(&self, coord: RegionCoord) -> Result<Option<RegionSummary>, ServerError> {
        self.request(|reply| AdminCommand::Region { coord, reply })
            .await
    }

    /// Every non-empty cell of one region with its absolute coordinates,
    /// or `None` if the region is not loaded.
    pub async fn non_empty_blocks(
        &self,
        coord: RegionCoord,
    ) -> Result<Option<Vec<PlacedBlock>>, ServerError> {
        self.request(|reply| AdminCommand::NonEmptyBlocks { coord, reply })
            .await
    }

    /// Adds an empty region. Returns `false` if one was already loaded.
    pub async fn create_region(&self, coord: RegionCoord) -> Result<bool, ServerError> {
        self.request(|reply| AdminCommand::CreateRegion { coord, reply })
            .await
    }

    /// Writes every region to disk. Returns how many files were written.
    pub async fn save_all(&self) -> Result<usize, ServerError> {
        Ok(self.request(AdminCommand::Save).await??)
    }

    /// Asks every task to stop. Use [`ServerHandle::join`] to wait.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Waits for the core task to finish, including the shutdown save.
    pub async fn join(self) -> Result<(), ServerError> {
        self.task.await?
    }
}

/// State owned by the core task.
struct Core {
    dispatcher: Dispatcher,
    socket: Arc<UdpSocket>,
    connections: Arc<ConnectionMap>,
    ticks: Ticks,
    save_on_shutdown: bool,
    completions: mpsc::UnboundedSender<Completion>,
    /// A save batch is being written.
    saving: bool,
    /// Save requests that arrived while one was being written.
    queued_saves: VecDeque<SaveReply>,
}

impl Core {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<TransportEvent>,
        mut commands: mpsc::Receiver<AdminCommand>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        let mut out = Outbox::new();

        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event, &mut out),
                Some(command) = commands.recv() => self.handle_command(command, &mut out),
                Some(done) = completions.recv() => self.handle_completion(done, &mut out),
                _ = self.ticks.position.tick() => self.dispatcher.position_tick(&mut out),
                _ = self.ticks.keepalive.tick() => {
                    let evicted = self.dispatcher.keepalive_tick(Instant::now(), &mut out);
                    if evicted > 0 {
                        tracing::info!("Evicted {evicted} silent sessions");
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
            self.flush(&mut out).await;
        }

        tracing::info!("Server shutting down");
        // Let a save already on disk finish before the last one starts.
        while self.saving {
            let Some(done) = completions.recv().await else {
                break;
            };
            self.handle_completion(done, &mut out);
        }
        if self.save_on_shutdown {
            let batch = self.dispatcher.save_batch();
            let saved = tokio::task::spawn_blocking(move || batch.write()).await??;
            let count = self.dispatcher.finish_save(&saved, &mut out);
            tracing::info!("Saved {count} regions");
        }
        Ok(())
    }

    fn handle_event(&mut self, event: TransportEvent, out: &mut Outbox) {
        let now = Instant::now();
        match event {
            TransportEvent::Datagram { from, payload } => {
                self.dispatcher.handle_datagram(from, &payload, now, out);
            }
            TransportEvent::TcpFrame { conn, frame } => {
                self.dispatcher.handle_tcp_frame(conn, &frame, now, out);
            }
            TransportEvent::TcpClosed { conn } => self.dispatcher.handle_tcp_closed(conn),
        }
    }

    fn handle_command(&mut self, command: AdminCommand, out: &mut Outbox) {
        // A dropped reply receiver means the caller gave up; nothing to do.
        match command {
            AdminCommand::ListSessions(reply) => {
                let _ = reply.send(self.dispatcher.list_sessions(Instant::now()));
            }
            AdminCommand::Kick { index, reply } => {
                let _ = reply.send(self.dispatcher.kick(index, out));
            }
            AdminCommand::KickAll(reply) => {
                let _ = reply.send(self.dispatcher.kick_all(out));
            }
            AdminCommand::Region { coord, reply } => {
                let _ = reply.send(self.dispatcher.region_summary(coord));
            }
            AdminCommand::NonEmptyBlocks { coord, reply } => {
                let _ = reply.send(self.dispatcher.non_empty_blocks(coord));
            }
            AdminCommand::CreateRegion { coord, reply } => {
                let _ = reply.send(self.dispatcher.create_region(coord));
            }
            AdminCommand::Save(reply) => {
                if self.saving {
                    self.queued_saves.push_back(reply);
                } else {
                    self.start_save(reply);
                }
            }
        }
    }

    fn handle_completion(&mut self, done: Completion, out: &mut Outbox) {
        match done {
            Completion::Encoded {
                coord,
                generation,
                result,
            } => self.dispatcher.finish_encode(coord, generation, result, out),
            Completion::Saved { result, reply } => {
                self.saving = false;
                let result = result.map(|saved| self.dispatcher.finish_save(&saved, out));
                match &result {
                    Ok(count) => tracing::info!("Saved {count} regions"),
                    Err(e) => tracing::error!("Save failed: {e}"),
                }
                let _ = reply.send(result);
                if let Some(next) = self.queued_saves.pop_front() {
                    self.start_save(next);
                }
            }
        }
    }

    /// Captures the world and writes it on the blocking pool.
    fn start_save(&mut self, reply: SaveReply) {
        let batch = self.dispatcher.save_batch();
        let completions = self.completions.clone();
        self.saving = true;
        tracing::debug!("Saving {} regions to {}", batch.len(), batch.dir().display());
        tokio::task::spawn_blocking(move || {
            let result = batch.write();
            let _ = completions.send(Completion::Saved { result, reply });
        });
    }

    /// Encodes a region snapshot on the blocking pool.
    fn spawn_encode(&self, snapshot: RegionSnapshot) {
        let completions = self.completions.clone();
        tokio::task::spawn_blocking(move || {
            let result = snapshot.encode();
            let _ = completions.send(Completion::Encoded {
                coord: snapshot.coord,
                generation: snapshot.generation,
                result,
            });
        });
    }

    /// Sends everything queued. Failures are logged and never stop the core.
    async fn flush(&self, out: &mut Outbox) {
        for snapshot in out.take_encodes() {
            self.spawn_encode(snapshot);
        }
        for item in out.drain() {
            match item {
                Outgoing::Udp { to, packet } => {
                    send_datagram(&self.socket, to, packet.to_datagram().as_bytes()).await;
                }
                Outgoing::Tcp { conn, reply } => {
                    if !self.connections.send(conn, reply.to_frame()).await {
                        tracing::debug!("Connection {conn:?} is gone, dropping reply");
                    }
                }
                Outgoing::CloseTcp(conn) => {
                    self.connections.close(conn).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use strata_config::WorldMode;
    use strata_net::{Frame, FrameError, read_frame, write_frame};
    use strata_voxel::Region;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config(world_dir: PathBuf) -> Config {
        let mut config = Config::default();
        config.network.bind_address = "127.0.0.1".to_string();
        config.network.port = 0;
        config.world.world_dir = world_dir;
        config.world.mode = WorldMode::Edit;
        config.timing.keepalive_tick_ms = 60_000;
        config
    }

    async fn start(dir: &tempfile::TempDir) -> ServerHandle {
        let mut world = World::new();
        world.insert(RegionCoord::ORIGIN, Region::new());
        let catalog = crate::dispatcher::tests::catalog();
        Server::new(test_config(dir.path().to_path_buf()), world, catalog)
            .start()
            .await
            .unwrap()
    }

    async fn recv_text(socket: &UdpSocket) -> String {
        let mut buf = vec![0u8; 2048];
        let (len, _) = timeout(WAIT, socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for a datagram")
            .unwrap();
        String::from_utf8(buf[..len].to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_udp_connect_tcp_bind_and_edit() {
        let dir = tempfile::tempdir().unwrap();
        let handle = start(&dir).await;
        let addr = handle.local_addr();
        let config = FrameConfig::default();

        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        udp.send_to(b"0\t-1\talice", addr).await.unwrap();
        assert_eq!(recv_text(&udp).await, "0\t0\t0\talice");
        assert_eq!(recv_text(&udp).await, "9\t0\talice");
        assert_eq!(recv_text(&udp).await, "5\t0\talice\talice has connected");

        let mut tcp = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut tcp, &Frame::new(0, "0"), &config).await.unwrap();
        let catalog = timeout(WAIT, read_frame(&mut tcp, &config)).await.unwrap().unwrap();
        assert_eq!(
            catalog,
            Frame::new(0, "000000000000\t5655135ebc9c\t2f9e4658c3f0")
        );

        write_frame(&mut tcp, &Frame::new(6, "0\t1\t1\t1\t1"), &config).await.unwrap();
        let relayed = timeout(WAIT, read_frame(&mut tcp, &config)).await.unwrap().unwrap();
        assert_eq!(relayed, Frame::new(6, "1\t1\t1\t1"));

        let summary = handle.get_region(RegionCoord::ORIGIN).await.unwrap().unwrap();
        assert_eq!(summary.header.len(), 2);
        let blocks = handle.non_empty_blocks(RegionCoord::ORIGIN).await.unwrap().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].position, [1, 1, 1]);
        assert_eq!(blocks[0].id.map(|id| id.to_string()).as_deref(), Some("5655135ebc9c"));

        let sessions = handle.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].username, "alice");
        assert!(sessions[0].tcp.is_some());

        assert_eq!(handle.kick(0).await.unwrap().as_deref(), Some("alice"));
        assert_eq!(recv_text(&udp).await, "1");
        let closed = timeout(WAIT, read_frame(&mut tcp, &config)).await.unwrap();
        assert!(matches!(closed, Err(FrameError::ConnectionClosed)));

        handle.shutdown();
        handle.join().await.unwrap();
        assert!(dir.path().join("0.0.0.dat").exists());
    }

    #[tokio::test]
    async fn test_tcp_world_listing() {
        let dir = tempfile::tempdir().unwrap();
        let handle = start(&dir).await;
        let addr = handle.local_addr();
        let config = FrameConfig::default();

        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        udp.send_to(b"0\t-1\tbob", addr).await.unwrap();
        recv_text(&udp).await;

        let mut tcp = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut tcp, &Frame::new(0, "0"), &config).await.unwrap();
        timeout(WAIT, read_frame(&mut tcp, &config)).await.unwrap().unwrap();

        write_frame(&mut tcp, &Frame::new(2, ""), &config).await.unwrap();
        let listing = timeout(WAIT, read_frame(&mut tcp, &config)).await.unwrap().unwrap();
        assert_eq!(listing.kind, 2);
        let text = String::from_utf8(listing.payload).unwrap();
        assert!(text.starts_with("0\t0\t0\t"));
        assert_eq!(text.split('\t').count(), 4);

        handle.shutdown();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_world_request_does_not_stall_positions() {
        let dir = tempfile::tempdir().unwrap();
        let handle = start(&dir).await;
        let addr = handle.local_addr();

        let alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        alice.send_to(b"0\t-1\talice", addr).await.unwrap();
        for _ in 0..3 {
            recv_text(&alice).await;
        }
        let bob = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        bob.send_to(b"0\t-1\tbob", addr).await.unwrap();
        assert_eq!(recv_text(&alice).await, "9\t1\tbob");
        assert_eq!(recv_text(&alice).await, "5\t1\tbob\tbob has connected");

        // The region encodes on the blocking pool while bob's move goes out
        // on the next position tick.
        alice.send_to(b"2\t0", addr).await.unwrap();
        bob.send_to(b"3\t1\t1\t2\t3\t0\t0\t0\t0", addr).await.unwrap();
        assert_eq!(recv_text(&alice).await, "3\t1\t1\t2\t3\t0\t0\t0\t0");
        assert_eq!(handle.list_sessions().await.unwrap().len(), 2);

        handle.shutdown();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_admin_save_and_stopped_server() {
        let dir = tempfile::tempdir().unwrap();
        let handle = start(&dir).await;

        assert!(handle.create_region(RegionCoord::new(0, 0, 1)).await.unwrap());
        assert!(!handle.create_region(RegionCoord::ORIGIN).await.unwrap());
        // Two saves in a row are written one after the other.
        let (first, second) = tokio::join!(handle.save_all(), handle.save_all());
        assert_eq!(first.unwrap(), 2);
        assert_eq!(second.unwrap(), 2);
        assert!(dir.path().join("0.0.1.dat").exists());
        assert_eq!(handle.kick_all().await.unwrap(), 0);
        assert!(handle.get_region(RegionCoord::new(3, 3, 3)).await.unwrap().is_none());

        handle.shutdown();
        // Give the core a moment to exit before asking it anything.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(handle.list_sessions().await, Err(ServerError::Stopped)));
        handle.join().await.unwrap();
    }

    #[test]
    fn test_load_tolerates_missing_catalog_and_world() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path().join("world"));
        config.world.catalog_file = dir.path().join("missing.json");

        let server = Server::load(config.clone()).unwrap();
        assert!(server.catalog.is_empty());
        assert_eq!(server.world.coords(), vec![RegionCoord::ORIGIN]);

        config.world.seed_origin = false;
        let server = Server::load(config).unwrap();
        assert!(server.world.is_empty());
    }

    #[test]
    fn test_load_does_not_seed_a_populated_world() {
        let dir = tempfile::tempdir().unwrap();
        let world_dir = dir.path().join("world");
        let mut world = World::new();
        world.insert(RegionCoord::new(2, 0, 0), Region::new());
        world.save_all(&world_dir).unwrap();

        let mut config = test_config(world_dir);
        config.world.catalog_file = dir.path().join("missing.json");
        let server = Server::load(config).unwrap();
        assert_eq!(server.world.coords(), vec![RegionCoord::new(2, 0, 0)]);
    }

    #[test]
    fn test_load_rejects_bad_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("data.json");
        std::fs::write(&catalog, "not json").unwrap();
        let mut config = test_config(dir.path().join("world"));
        config.world.catalog_file = catalog;

        assert!(matches!(Server::load(config), Err(ServerError::Catalog(_))));
    }
}
