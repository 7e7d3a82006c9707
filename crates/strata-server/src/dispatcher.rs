//! Protocol dispatcher: applies inbound packets to the session registry and
//! world, and queues the resulting outbound traffic.
//!
//! The dispatcher does no I/O. Every handler takes an [`Outbox`] and pushes
//! what should be sent; the server core flushes it after the handler
//! returns. That keeps each handler a short, synchronous step and lets the
//! tests drive the protocol without sockets.
//!
//! Region encodings are the one slow step. A request for a region without a
//! current encoding queues a [`RegionSnapshot`] in the outbox and parks the
//! reply; the core encodes the snapshot off-task and hands the bytes back
//! through [`Dispatcher::finish_encode`], which sends every reply that was
//! waiting on them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use strata_config::WorldMode;
use strata_net::{
    BlockEdit, ClientDatagram, ClientPacket, ConnectionId, Frame, RegionEntry, ServerPacket,
    TcpMessage, TcpReply, TcpRequest,
};
use rustc_hash::FxHashMap;
use strata_voxel::{
    BlockCatalog, PlacedBlock, RegionCodecError, RegionCoord, RegionSnapshot, RegionSummary,
    SaveBatch, SavedRegion, World,
};

use crate::session::{RegisterError, SessionInfo, SessionRegistry, User};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client sent DISCONNECT.
    Voluntary,
    /// An administrator kicked the user.
    Kicked,
    /// No keepalive within the grace period.
    Timeout,
}

/// One unit of outbound traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Udp { to: SocketAddr, packet: ServerPacket },
    Tcp { conn: ConnectionId, reply: TcpReply },
    /// Close a TCP connection after its queued frames.
    CloseTcp(ConnectionId),
}

/// Outbound traffic produced by one dispatcher step, in send order, plus
/// the region encodings the step asked for.
#[derive(Debug, Default)]
pub struct Outbox {
    items: Vec<Outgoing>,
    encodes: Vec<RegionSnapshot>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn udp(&mut self, to: SocketAddr, packet: ServerPacket) {
        self.items.push(Outgoing::Udp { to, packet });
    }

    pub fn tcp(&mut self, conn: ConnectionId, reply: TcpReply) {
        self.items.push(Outgoing::Tcp { conn, reply });
    }

    pub fn close_tcp(&mut self, conn: ConnectionId) {
        self.items.push(Outgoing::CloseTcp(conn));
    }

    pub fn encode(&mut self, snapshot: RegionSnapshot) {
        self.encodes.push(snapshot);
    }

    /// Takes everything queued so far.
    pub fn drain(&mut self) -> std::vec::Drain<'_, Outgoing> {
        self.items.drain(..)
    }

    /// Takes the queued encode jobs.
    pub fn take_encodes(&mut self) -> Vec<RegionSnapshot> {
        std::mem::take(&mut self.encodes)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.encodes.is_empty()
    }
}

/// A reply parked until the regions it carries are encoded.
#[derive(Debug)]
enum PendingReply {
    Region {
        index: u32,
        to: SocketAddr,
        coord: RegionCoord,
    },
    Listing {
        conn: ConnectionId,
        entries: Vec<(RegionCoord, Option<Arc<Vec<u8>>>)>,
    },
}

/// Dispatcher settings taken from the server config.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub mode: WorldMode,
    pub keepalive_grace: Duration,
    /// Where [`Dispatcher::save_batch`] writes region files.
    pub world_dir: PathBuf,
}

/// Owns all mutable server state.
pub struct Dispatcher {
    pub(crate) sessions: SessionRegistry,
    pub(crate) world: World,
    catalog: BlockCatalog,
    pub(crate) settings: DispatcherSettings,
    /// Generation of each region currently being encoded.
    in_flight: FxHashMap<RegionCoord, u64>,
    pending: Vec<PendingReply>,
}

impl Dispatcher {
    pub fn new(world: World, catalog: BlockCatalog, settings: DispatcherSettings) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            world,
            catalog,
            settings,
            in_flight: FxHashMap::default(),
            pending: Vec::new(),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    // --- UDP ---

    /// Handles one UDP datagram.
    pub fn handle_datagram(&mut self, from: SocketAddr, bytes: &[u8], now: Instant, out: &mut Outbox) {
        let datagram = match ClientDatagram::parse(bytes) {
            Ok(datagram) => datagram,
            Err(e) => {
                tracing::debug!("Dropping malformed datagram from {from}: {e}");
                return;
            }
        };

        if let ClientPacket::Connect { username } = &datagram.packet {
            self.handle_connect(from, username, now, out);
            return;
        }

        let Some(index) = datagram.session.filter(|&i| self.sessions.touch(i, now)) else {
            tracing::trace!("Dropping datagram from {from} for unknown session {:?}", datagram.session);
            return;
        };

        match datagram.packet {
            ClientPacket::Connect { .. } => {}
            ClientPacket::Disconnect => {
                self.drop_session(index, DisconnectReason::Voluntary, out);
            }
            ClientPacket::World => self.send_primary_region(index, out),
            ClientPacket::NewPosition(pose) => {
                self.sessions.update_pose(index, pose);
            }
            // The touch above is all a keepalive does.
            ClientPacket::KeepAlive => {}
            ClientPacket::Chat { text } => {
                let Some(user) = self.sessions.find_by_index(index) else {
                    return;
                };
                let packet = ServerPacket::Chat {
                    index,
                    username: user.username.clone(),
                    text,
                };
                self.broadcast(&packet, out);
            }
            ClientPacket::Script { payload } => {
                tracing::info!("Session {index} sent a script channel message: {payload}");
            }
        }
    }

    fn handle_connect(&mut self, from: SocketAddr, username: &str, now: Instant, out: &mut Outbox) {
        let index = match self.sessions.register(username, from, now) {
            Ok(user) => user.index,
            Err(RegisterError::Conflict(name)) => {
                tracing::info!("{name} is already connected, refusing {from}");
                out.udp(from, ServerPacket::Disconnect);
                return;
            }
        };
        tracing::info!("{username} connected from {from} as session {index}");

        out.udp(
            from,
            ServerPacket::Connect {
                assigned: index,
                roster: self.sessions.roster(),
            },
        );
        self.broadcast(
            &ServerPacket::UserConnect {
                index,
                username: username.to_string(),
            },
            out,
        );
        self.broadcast(
            &ServerPacket::Chat {
                index,
                username: username.to_string(),
                text: format!("{username} has connected"),
            },
            out,
        );
    }

    fn send_primary_region(&mut self, index: u32, out: &mut Outbox) {
        let Some(user) = self.sessions.find_by_index(index) else {
            return;
        };
        let endpoint = user.endpoint;
        let Some(coord) = self.world.primary_coord() else {
            tracing::warn!("Session {index} requested the world but no regions are loaded");
            return;
        };

        match self.request_encoding(coord, out) {
            Some(bytes) => out.udp(endpoint, world_packet(&bytes)),
            None => self.pending.push(PendingReply::Region {
                index,
                to: endpoint,
                coord,
            }),
        }
    }

    /// Ends a session and tells everyone else. Returns the removed user.
    pub fn drop_session(
        &mut self,
        index: u32,
        reason: DisconnectReason,
        out: &mut Outbox,
    ) -> Option<User> {
        let user = self.sessions.remove(index)?;
        tracing::info!("{} left ({reason:?})", user.username);

        if reason != DisconnectReason::Voluntary {
            out.udp(user.endpoint, ServerPacket::Disconnect);
        }
        if let Some(conn) = user.tcp {
            out.close_tcp(conn);
        }

        self.broadcast(&ServerPacket::UserDisconnect { index }, out);
        self.broadcast(
            &ServerPacket::Chat {
                index,
                username: user.username.clone(),
                text: format!("{} has disconnected", user.username),
            },
            out,
        );
        Some(user)
    }

    /// Queues `packet` for every connected user.
    pub(crate) fn broadcast(&self, packet: &ServerPacket, out: &mut Outbox) {
        for user in self.sessions.iter() {
            out.udp(user.endpoint, packet.clone());
        }
    }

    // --- TCP ---

    /// Handles one frame from a TCP connection.
    pub fn handle_tcp_frame(&mut self, conn: ConnectionId, frame: &Frame, now: Instant, out: &mut Outbox) {
        let message = match TcpMessage::parse(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Dropping malformed frame from {conn:?}: {e}");
                return;
            }
        };

        if message.request == TcpRequest::Connect {
            self.bind_connection(conn, message.session, now, out);
            return;
        }

        // Everything else must come from a bound connection.
        let Some(user) = self.sessions.find_by_tcp_conn(conn) else {
            tracing::debug!("Dropping frame from unbound connection {conn:?}");
            return;
        };
        let index = user.index;
        self.sessions.touch(index, now);

        match message.request {
            TcpRequest::Connect => {}
            TcpRequest::World => self.send_world_listing(index, conn, out),
            TcpRequest::SetBlock(edit) => self.apply_edit(index, edit, false, out),
            TcpRequest::SetMiniBlock(edit) => self.apply_edit(index, edit, true, out),
        }
    }

    fn bind_connection(
        &mut self,
        conn: ConnectionId,
        session: Option<u32>,
        now: Instant,
        out: &mut Outbox,
    ) {
        let Some(index) = session else {
            return;
        };
        let Some(user) = self.sessions.attach_tcp(index, conn) else {
            tracing::debug!("TCP connect from {conn:?} for unknown session {index}");
            return;
        };
        tracing::info!("{} connected via TCP", user.username);
        self.sessions.touch(index, now);

        let catalog = match self.settings.mode {
            WorldMode::Edit => Some(self.catalog.ids().iter().map(ToString::to_string).collect()),
            WorldMode::Play => None,
        };
        out.tcp(conn, TcpReply::Catalog(catalog));
    }

    fn send_world_listing(&mut self, index: u32, conn: ConnectionId, out: &mut Outbox) {
        tracing::info!("Session {index} requested world data");

        let entries: Vec<_> = self
            .world
            .coords()
            .into_iter()
            .map(|coord| (coord, self.request_encoding(coord, out)))
            .collect();
        if entries.iter().all(|(_, bytes)| bytes.is_some()) {
            out.tcp(conn, listing_reply(&entries));
        } else {
            self.pending.push(PendingReply::Listing { conn, entries });
        }
    }

    fn apply_edit(&mut self, index: u32, edit: BlockEdit, mini: bool, out: &mut Outbox) {
        if self.settings.mode == WorldMode::Play {
            tracing::debug!("Ignoring block edit from session {index} in play mode");
            return;
        }

        let BlockEdit { x, y, z, block } = edit;
        let result = if mini {
            self.world.set_mini_block(x, y, z, block, &self.catalog)
        } else {
            self.world.set_block(x, y, z, block, &self.catalog)
        };
        if let Err(e) = result {
            tracing::warn!("Rejected block edit from session {index}: {e}");
            return;
        }
        tracing::debug!("Session {index} set block {block} at ({x}, {y}, {z}), mini: {mini}");

        let reply = if mini {
            TcpReply::SetMiniBlock(edit)
        } else {
            TcpReply::SetBlock(edit)
        };
        for user in self.sessions.iter() {
            if let Some(conn) = user.tcp {
                out.tcp(conn, reply.clone());
            }
        }
    }

    // --- Region encodings ---

    /// The current encoding of `coord`, or `None` after queueing an encode
    /// job for it (unless one for the current generation is already out).
    fn request_encoding(&mut self, coord: RegionCoord, out: &mut Outbox) -> Option<Arc<Vec<u8>>> {
        if let Some(bytes) = self.world.cached_encoding(coord) {
            return Some(bytes);
        }
        let generation = self.world.generation(coord)?;
        if self.in_flight.get(&coord) != Some(&generation) {
            let snapshot = self.world.snapshot(coord)?;
            tracing::debug!("Queueing encode of region {coord} at generation {generation}");
            self.in_flight.insert(coord, generation);
            out.encode(snapshot);
        }
        None
    }

    /// Takes the result of an encode job queued by this dispatcher and
    /// sends every reply it completes. A result for a region edited since
    /// the snapshot is dropped and, if anyone is still waiting, the region
    /// is queued again.
    pub fn finish_encode(
        &mut self,
        coord: RegionCoord,
        generation: u64,
        result: Result<Vec<u8>, RegionCodecError>,
        out: &mut Outbox,
    ) {
        if self.in_flight.get(&coord) == Some(&generation) {
            self.in_flight.remove(&coord);
        }

        match result {
            Ok(bytes) => {
                tracing::debug!("Encoded region {coord} ({} bytes)", bytes.len());
                let stored = self.world.store_encoded(coord, generation, Arc::new(bytes));
                if !stored && self.is_waiting_on(coord) {
                    self.request_encoding(coord, out);
                }
            }
            Err(e) => {
                tracing::error!("Failed to encode region {coord}: {e}");
                self.abandon(coord);
            }
        }
        self.send_ready(out);
    }

    fn is_waiting_on(&self, coord: RegionCoord) -> bool {
        self.pending.iter().any(|reply| match reply {
            PendingReply::Region { coord: c, .. } => *c == coord,
            PendingReply::Listing { entries, .. } => {
                entries.iter().any(|(c, bytes)| *c == coord && bytes.is_none())
            }
        })
    }

    /// Gives up on `coord`: single-region replies are dropped and listings
    /// go out without it.
    fn abandon(&mut self, coord: RegionCoord) {
        self.pending.retain_mut(|reply| match reply {
            PendingReply::Region { coord: c, .. } => *c != coord,
            PendingReply::Listing { entries, .. } => {
                entries.retain(|(c, bytes)| *c != coord || bytes.is_some());
                true
            }
        });
    }

    /// Sends every parked reply whose regions are now encoded.
    fn send_ready(&mut self, out: &mut Outbox) {
        for reply in std::mem::take(&mut self.pending) {
            match reply {
                PendingReply::Region { index, to, coord } => {
                    let Some(bytes) = self.world.cached_encoding(coord) else {
                        self.pending.push(PendingReply::Region { index, to, coord });
                        continue;
                    };
                    // The session may have ended while the region was encoding.
                    if self.sessions.find_by_index(index).is_some_and(|u| u.endpoint == to) {
                        out.udp(to, world_packet(&bytes));
                    }
                }
                PendingReply::Listing { conn, mut entries } => {
                    for (coord, bytes) in &mut entries {
                        if bytes.is_none() {
                            *bytes = self.world.cached_encoding(*coord);
                        }
                    }
                    if entries.iter().any(|(_, bytes)| bytes.is_none()) {
                        self.pending.push(PendingReply::Listing { conn, entries });
                    } else if self.sessions.find_by_tcp_conn(conn).is_some() {
                        out.tcp(conn, listing_reply(&entries));
                    }
                }
            }
        }
    }

    /// Number of replies waiting on an encoding.
    pub fn pending_replies(&self) -> usize {
        self.pending.len()
    }

    /// A TCP connection ended: detach it from its user. The user stays
    /// registered.
    pub fn handle_tcp_closed(&mut self, conn: ConnectionId) {
        if let Some(index) = self.sessions.detach_tcp(conn) {
            tracing::info!("Session {index} lost its TCP connection");
        }
    }

    // --- Administration ---

    pub fn list_sessions(&self, now: Instant) -> Vec<SessionInfo> {
        self.sessions.snapshot(now)
    }

    /// Forcibly disconnects one user. Returns the username, or `None` if no
    /// such session exists.
    pub fn kick(&mut self, index: u32, out: &mut Outbox) -> Option<String> {
        self.drop_session(index, DisconnectReason::Kicked, out)
            .map(|user| user.username)
    }

    /// Forcibly disconnects every user. Returns how many were kicked.
    pub fn kick_all(&mut self, out: &mut Outbox) -> usize {
        let indices: Vec<u32> = self.sessions.iter().map(|u| u.index).collect();
        indices
            .into_iter()
            .filter(|&index| self.kick(index, out).is_some())
            .count()
    }

    pub fn region_summary(&self, coord: RegionCoord) -> Option<RegionSummary> {
        self.world.summary(coord)
    }

    /// Every non-empty cell of the region at `coord`.
    pub fn non_empty_blocks(&self, coord: RegionCoord) -> Option<Vec<PlacedBlock>> {
        self.world.non_empty_blocks(coord)
    }

    /// Adds an empty region at `coord`. Returns `false` if one is loaded.
    pub fn create_region(&mut self, coord: RegionCoord) -> bool {
        self.world.create_region(coord)
    }

    /// Captures every region for writing to the world directory. Run
    /// [`SaveBatch::write`] anywhere and pass the result to
    /// [`Dispatcher::finish_save`].
    pub fn save_batch(&self) -> SaveBatch {
        self.world.save_batch(&self.settings.world_dir)
    }

    /// Records a written batch. The encodings it produced also complete any
    /// reply waiting on them.
    pub fn finish_save(&mut self, saved: &[SavedRegion], out: &mut Outbox) -> usize {
        self.world.finish_save(saved);
        self.send_ready(out);
        saved.len()
    }
}

fn world_packet(bytes: &[u8]) -> ServerPacket {
    ServerPacket::World {
        region_base64: BASE64.encode(bytes),
    }
}

fn listing_reply(entries: &[(RegionCoord, Option<Arc<Vec<u8>>>)]) -> TcpReply {
    let entries = entries
        .iter()
        .filter_map(|(coord, bytes)| {
            let bytes = bytes.as_ref()?;
            Some(RegionEntry {
                x: coord.x,
                y: coord.y,
                z: coord.z,
                base64: BASE64.encode(bytes.as_slice()),
            })
        })
        .collect();
    TcpReply::WorldListing(entries)
}
