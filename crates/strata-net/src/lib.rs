//! Networking for the Strata server: the UDP text packet codec, TCP frame
//! codec, the TCP connection server and the UDP receive loop.
//!
//! Both transports deliver raw input to the server core as
//! [`TransportEvent`]s over one channel.

use std::net::SocketAddr;

pub mod framing;
pub mod packets;
pub mod tcp_server;
pub mod udp;

pub use framing::{FRAME_HEADER_LEN, Frame, FrameConfig, FrameError, read_frame, write_frame};
pub use packets::{
    BlockEdit, ClientDatagram, ClientPacket, ClientPacketType, PacketError, Pose, RegionEntry,
    ServerPacket, ServerPacketType, TcpMessage, TcpReply, TcpRequest, format_decimal,
    parse_decimal,
};
pub use tcp_server::{ConnectionId, ConnectionMap, IdGenerator, TcpServer, TcpServerConfig};
pub use udp::{MAX_DATAGRAM_SIZE, MAX_UDP_PAYLOAD, run_udp_receiver, send_datagram};

/// Input from a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A UDP datagram.
    Datagram { from: SocketAddr, payload: Vec<u8> },
    /// A complete frame from a TCP connection.
    TcpFrame { conn: ConnectionId, frame: Frame },
    /// A TCP connection ended (peer closed, I/O error, or oversized frame).
    TcpClosed { conn: ConnectionId },
}
