//! UDP receive loop and send helper.
//!
//! Datagrams are forwarded unparsed; the server core decodes them so that
//! malformed input is handled in one place.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::TransportEvent;

/// Largest datagram the loop will read.
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Largest payload one IPv4 UDP datagram can carry.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Sends one datagram. A payload over [`MAX_UDP_PAYLOAD`] is dropped with a
/// warning instead of being handed to the socket. Returns whether the
/// datagram was sent.
pub async fn send_datagram(socket: &UdpSocket, to: SocketAddr, payload: &[u8]) -> bool {
    if payload.len() > MAX_UDP_PAYLOAD {
        tracing::warn!(
            "Dropping {}-byte datagram to {to}: over the {MAX_UDP_PAYLOAD}-byte UDP limit",
            payload.len()
        );
        return false;
    }
    match socket.send_to(payload, to).await {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!("UDP send to {to} failed: {e}");
            false
        }
    }
}

/// Receive datagrams from `socket` until shutdown or until the event
/// channel closes. Receive errors are logged and do not stop the loop.
pub async fn run_udp_receiver(
    socket: Arc<UdpSocket>,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        let event = TransportEvent::Datagram {
                            from,
                            payload: buf[..len].to_vec(),
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    // ICMP port-unreachable from a departed client surfaces
                    // here on some platforms.
                    Err(e) => tracing::debug!("UDP receive failed: {e}"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!("UDP receiver stopped");
}
