//! Typed packets for both transports.
//!
//! UDP datagrams are ASCII text with tab-separated fields:
//!
//! ```text
//! type \t session-index \t field...
//! ```
//!
//! Decimal fields use a comma as the decimal separator on the wire; parsing
//! and formatting translate it so the rest of the server sees ordinary
//! floats. TCP frames (see [`crate::framing`]) carry the type in the frame
//! header and the same tab-separated text, starting at the session index, in
//! the payload.
//!
//! TCP is framed in both directions. A client that writes bare
//! `type \t index \t ...` text to the TCP stream, without the length and
//! type header, is not understood: its first bytes are read as a frame
//! header and the connection is dropped once the claimed length is
//! oversized or the stream ends mid-frame.
//!
//! Inbound and outbound type codes are separate enumerations that happen to
//! share their first nine values.

use std::fmt;

use crate::framing::Frame;

/// Type codes of client → server packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ClientPacketType {
    Connect = 0,
    Disconnect = 1,
    World = 2,
    NewPosition = 3,
    KeepAlive = 4,
    Chat = 5,
    SetBlock = 6,
    SetMiniBlock = 7,
    Script = 8,
}

impl TryFrom<u16> for ClientPacketType {
    type Error = PacketError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Self::Connect,
            1 => Self::Disconnect,
            2 => Self::World,
            3 => Self::NewPosition,
            4 => Self::KeepAlive,
            5 => Self::Chat,
            6 => Self::SetBlock,
            7 => Self::SetMiniBlock,
            8 => Self::Script,
            other => return Err(PacketError::UnknownType(other)),
        })
    }
}

/// Type codes of server → client packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ServerPacketType {
    Connect = 0,
    Disconnect = 1,
    World = 2,
    NewPosition = 3,
    KeepAlive = 4,
    Chat = 5,
    SetBlock = 6,
    SetMiniBlock = 7,
    Script = 8,
    UserConnect = 9,
    UserDisconnect = 10,
}

impl ServerPacketType {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Errors produced when an inbound packet cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("packet is not valid UTF-8")]
    NotUtf8,
    #[error("invalid packet type {0:?}")]
    InvalidType(String),
    #[error("unknown packet type {0}")]
    UnknownType(u16),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid number in field {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("packet type {0:?} is not accepted on this channel")]
    WrongChannel(ClientPacketType),
}

/// A player's position, rotation and camera pitch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pose {
    pub position: [f64; 3],
    pub rotation: [f64; 3],
    pub camera_x: f64,
}

/// A block edit at absolute voxel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEdit {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    /// Wire-level block catalog index.
    pub block: u32,
}

/// A parsed client → server UDP packet body.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientPacket {
    Connect { username: String },
    Disconnect,
    World,
    NewPosition(Pose),
    KeepAlive,
    Chat { text: String },
    Script { payload: String },
}

/// A client datagram: the claimed session index and the packet.
///
/// `session` is `None` when the index field is negative, which clients send
/// before they have been assigned one.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientDatagram {
    pub session: Option<u32>,
    pub packet: ClientPacket,
}

impl ClientDatagram {
    /// Parses a raw UDP datagram.
    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        let text = std::str::from_utf8(bytes).map_err(|_| PacketError::NotUtf8)?;
        let mut fields = Fields::new(text)?;
        let kind = fields.packet_type()?;
        let session = fields.session()?;

        let packet = match kind {
            ClientPacketType::Connect => {
                let username = fields.next("username")?;
                if username.is_empty() {
                    return Err(PacketError::MissingField("username"));
                }
                ClientPacket::Connect {
                    username: username.to_string(),
                }
            }
            ClientPacketType::Disconnect => ClientPacket::Disconnect,
            ClientPacketType::World => ClientPacket::World,
            ClientPacketType::NewPosition => ClientPacket::NewPosition(Pose {
                position: [
                    fields.decimal("x")?,
                    fields.decimal("y")?,
                    fields.decimal("z")?,
                ],
                rotation: [
                    fields.decimal("rx")?,
                    fields.decimal("ry")?,
                    fields.decimal("rz")?,
                ],
                camera_x: fields.decimal("camera_x")?,
            }),
            ClientPacketType::KeepAlive => ClientPacket::KeepAlive,
            ClientPacketType::Chat => ClientPacket::Chat {
                text: fields.next("text")?.to_string(),
            },
            ClientPacketType::Script => ClientPacket::Script {
                payload: fields.next_or_empty().to_string(),
            },
            // Edits only travel over TCP.
            ClientPacketType::SetBlock | ClientPacketType::SetMiniBlock => {
                return Err(PacketError::WrongChannel(kind));
            }
        };

        Ok(Self { session, packet })
    }
}

/// A parsed client → server TCP request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpRequest {
    /// Bind this connection to the session in the message header.
    Connect,
    /// Request every loaded region.
    World,
    SetBlock(BlockEdit),
    SetMiniBlock(BlockEdit),
}

/// A client TCP frame: the claimed session index and the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpMessage {
    pub session: Option<u32>,
    pub request: TcpRequest,
}

impl TcpMessage {
    /// Parses a TCP frame from a client.
    pub fn parse(frame: &Frame) -> Result<Self, PacketError> {
        let kind = ClientPacketType::try_from(frame.kind)?;
        let text = std::str::from_utf8(&frame.payload).map_err(|_| PacketError::NotUtf8)?;

        // World requests are matched by connection, not index, so the
        // payload may be empty.
        if kind == ClientPacketType::World && text.is_empty() {
            return Ok(Self {
                session: None,
                request: TcpRequest::World,
            });
        }

        let mut fields = Fields::new(text)?;
        let session = fields.session()?;
        let request = match kind {
            ClientPacketType::Connect => TcpRequest::Connect,
            ClientPacketType::World => TcpRequest::World,
            ClientPacketType::SetBlock => TcpRequest::SetBlock(fields.block_edit()?),
            ClientPacketType::SetMiniBlock => TcpRequest::SetMiniBlock(fields.block_edit()?),
            other => return Err(PacketError::WrongChannel(other)),
        };

        Ok(Self { session, request })
    }
}

/// Cursor over the tab-separated fields of a packet.
struct Fields<'a> {
    inner: std::str::Split<'a, char>,
}

impl<'a> Fields<'a> {
    fn new(text: &'a str) -> Result<Self, PacketError> {
        if text.is_empty() {
            return Err(PacketError::Empty);
        }
        Ok(Self {
            inner: text.split('\t'),
        })
    }

    fn next(&mut self, field: &'static str) -> Result<&'a str, PacketError> {
        self.inner.next().ok_or(PacketError::MissingField(field))
    }

    fn next_or_empty(&mut self) -> &'a str {
        self.inner.next().unwrap_or_default()
    }

    fn packet_type(&mut self) -> Result<ClientPacketType, PacketError> {
        let raw = self.next("type")?;
        let code: u16 = raw
            .trim()
            .parse()
            .map_err(|_| PacketError::InvalidType(raw.to_string()))?;
        ClientPacketType::try_from(code)
    }

    fn session(&mut self) -> Result<Option<u32>, PacketError> {
        let index: i64 = self.integer("session")?;
        Ok(u32::try_from(index).ok())
    }

    fn integer<T: std::str::FromStr>(&mut self, field: &'static str) -> Result<T, PacketError> {
        let raw = self.next(field)?;
        raw.trim().parse().map_err(|_| PacketError::InvalidNumber {
            field,
            value: raw.to_string(),
        })
    }

    fn decimal(&mut self, field: &'static str) -> Result<f64, PacketError> {
        let raw = self.next(field)?;
        parse_decimal(raw).ok_or_else(|| PacketError::InvalidNumber {
            field,
            value: raw.to_string(),
        })
    }

    fn block_edit(&mut self) -> Result<BlockEdit, PacketError> {
        Ok(BlockEdit {
            x: self.integer("x")?,
            y: self.integer("y")?,
            z: self.integer("z")?,
            block: self.integer("block")?,
        })
    }
}

/// Parses a wire decimal (comma as decimal separator). Non-finite values are
/// rejected.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let value: f64 = raw.trim().replace(',', ".").parse().ok()?;
    value.is_finite().then_some(value)
}

/// Formats a float for the wire (comma as decimal separator).
pub fn format_decimal(value: f64) -> String {
    value.to_string().replace('.', ",")
}

/// A server → client UDP packet.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerPacket {
    /// Connection accepted: the assigned index and the full roster.
    Connect { assigned: u32, roster: Vec<(u32, String)> },
    /// Connection refused or ended by the server.
    Disconnect,
    /// Base64 of an encoded region.
    World { region_base64: String },
    /// Poses of every user that moved since the last broadcast.
    NewPosition(Vec<(u32, Pose)>),
    KeepAlive,
    Chat { index: u32, username: String, text: String },
    UserConnect { index: u32, username: String },
    UserDisconnect { index: u32 },
}

impl ServerPacket {
    pub fn packet_type(&self) -> ServerPacketType {
        match self {
            Self::Connect { .. } => ServerPacketType::Connect,
            Self::Disconnect => ServerPacketType::Disconnect,
            Self::World { .. } => ServerPacketType::World,
            Self::NewPosition(_) => ServerPacketType::NewPosition,
            Self::KeepAlive => ServerPacketType::KeepAlive,
            Self::Chat { .. } => ServerPacketType::Chat,
            Self::UserConnect { .. } => ServerPacketType::UserConnect,
            Self::UserDisconnect { .. } => ServerPacketType::UserDisconnect,
        }
    }

    /// Renders the datagram text.
    pub fn to_datagram(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ServerPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.packet_type().code())?;
        match self {
            Self::Connect { assigned, roster } => {
                write!(f, "\t{assigned}")?;
                for (index, username) in roster {
                    write!(f, "\t{index}\t{username}")?;
                }
            }
            Self::Disconnect | Self::KeepAlive => {}
            Self::World { region_base64 } => write!(f, "\t{region_base64}")?,
            Self::NewPosition(poses) => {
                for (index, pose) in poses {
                    write!(f, "\t{index}")?;
                    for value in pose.position.iter().chain(&pose.rotation) {
                        write!(f, "\t{}", format_decimal(*value))?;
                    }
                    write!(f, "\t{}", format_decimal(pose.camera_x))?;
                }
            }
            Self::Chat {
                index,
                username,
                text,
            } => write!(f, "\t{index}\t{username}\t{text}")?,
            Self::UserConnect { index, username } => write!(f, "\t{index}\t{username}")?,
            Self::UserDisconnect { index } => write!(f, "\t{index}")?,
        }
        Ok(())
    }
}

/// One region in a TCP world listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionEntry {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub base64: String,
}

/// A server → client TCP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpReply {
    /// Reply to a TCP connect: the block catalog as hex ids in edit mode,
    /// `None` in play mode.
    Catalog(Option<Vec<String>>),
    /// Every loaded region.
    WorldListing(Vec<RegionEntry>),
    SetBlock(BlockEdit),
    SetMiniBlock(BlockEdit),
}

impl TcpReply {
    pub fn packet_type(&self) -> ServerPacketType {
        match self {
            Self::Catalog(_) => ServerPacketType::Connect,
            Self::WorldListing(_) => ServerPacketType::World,
            Self::SetBlock(_) => ServerPacketType::SetBlock,
            Self::SetMiniBlock(_) => ServerPacketType::SetMiniBlock,
        }
    }

    /// Builds the frame for this message.
    pub fn to_frame(&self) -> Frame {
        let payload = match self {
            Self::Catalog(Some(ids)) => ids.join("\t"),
            Self::Catalog(None) => "0".to_string(),
            Self::WorldListing(entries) => entries
                .iter()
                .map(|e| format!("{}\t{}\t{}\t{}", e.x, e.y, e.z, e.base64))
                .collect::<Vec<_>>()
                .join("\t"),
            Self::SetBlock(edit) | Self::SetMiniBlock(edit) => {
                format!("{}\t{}\t{}\t{}", edit.x, edit.y, edit.z, edit.block)
            }
        };
        Frame::new(self.packet_type().code(), payload)
    }
}
