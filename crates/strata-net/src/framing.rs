//! Length-prefixed, typed framing for TCP streams.
//!
//! Every message on the wire is a frame:
//!
//! ```text
//! +-------------------+------------------+--------------------+
//! | length (4 bytes)  | type (2 bytes)   |   payload          |
//! | u32 little-endian | u16 little-endian|   (length bytes)   |
//! +-------------------+------------------+--------------------+
//! ```
//!
//! The length counts only the payload, not the 6 header bytes. An empty
//! payload is valid.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Bytes before the payload: length plus type.
pub const FRAME_HEADER_LEN: usize = 6;

/// A single frame: a message-type code and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MB.
    pub max_payload_size: u32,
}

impl FrameConfig {
    /// No limit beyond what the length field can express. Used for
    /// server-built frames such as full world listings.
    pub const UNLIMITED: Self = Self {
        max_payload_size: u32::MAX,
    };
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: u64,
        /// The configured maximum.
        max: u32,
    },

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn closed_or_io(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read a single frame from the stream.
///
/// Returns [`FrameError::ConnectionClosed`] if the peer closes the connection
/// before the frame is complete, and [`FrameError::PayloadTooLarge`] without
/// reading the payload if the declared length is over the limit.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Frame, FrameError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(closed_or_io)?;

    let payload_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let kind = u16::from_le_bytes([header[4], header[5]]);

    if payload_len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: u64::from(payload_len),
            max: config.max_payload_size,
        });
    }

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await.map_err(closed_or_io)?;
    }

    Ok(Frame { kind, payload })
}

/// Write a single frame to the stream and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &Frame,
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let too_large = || FrameError::PayloadTooLarge {
        size: frame.payload.len() as u64,
        max: config.max_payload_size,
    };
    let len = u32::try_from(frame.payload.len()).map_err(|_| too_large())?;
    if len > config.max_payload_size {
        return Err(too_large());
    }

    let mut header = [0u8; FRAME_HEADER_LEN];
    header[..4].copy_from_slice(&len.to_le_bytes());
    header[4..].copy_from_slice(&frame.kind.to_le_bytes());

    writer.write_all(&header).await?;
    if !frame.payload.is_empty() {
        writer.write_all(&frame.payload).await?;
    }
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn default_config() -> FrameConfig {
        FrameConfig::default()
    }

    #[tokio::test]
    async fn test_single_frame_roundtrip() {
        let (mut client, mut server) = duplex(8192);
        let config = default_config();
        let frame = Frame::new(6, "100\t100\t100\t1");

        write_frame(&mut client, &frame, &config).await.unwrap();
        let received = read_frame(&mut server, &config).await.unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn test_header_layout() {
        let (mut client, mut server) = duplex(8192);

        write_frame(&mut client, &Frame::new(0x0102, "abc"), &default_config())
            .await
            .unwrap();
        drop(client);

        let mut raw = Vec::new();
        server.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw, [3, 0, 0, 0, 0x02, 0x01, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn test_partial_read_resumes_correctly() {
        // duplex with a tiny buffer forces partial writes/reads
        let (mut client, mut server) = duplex(8);
        let config = default_config();
        let frame = Frame::new(2, "this message is larger than the buffer");

        let write_config = config.clone();
        let sent = frame.clone();
        let write_task = tokio::spawn(async move {
            write_frame(&mut client, &sent, &write_config).await.unwrap();
        });

        let received = read_frame(&mut server, &config).await.unwrap();
        write_task.await.unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let (mut client, mut server) = duplex(8192);
        let config = FrameConfig {
            max_payload_size: 16,
        };

        client.write_all(&1024u32.to_le_bytes()).await.unwrap();
        client.write_all(&6u16.to_le_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let result = read_frame(&mut server, &config).await;
        assert!(
            matches!(result, Err(FrameError::PayloadTooLarge { size: 1024, max: 16 })),
            "Should reject oversized frame"
        );
    }

    #[tokio::test]
    async fn test_unframed_text_is_rejected() {
        let (mut client, mut server) = duplex(8192);

        // A request written as bare text, with no length and type header.
        client.write_all(b"2\t0\thi").await.unwrap();
        client.flush().await.unwrap();

        let result = read_frame(&mut server, &default_config()).await;
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_write() {
        let (mut client, _server) = duplex(8192);
        let config = FrameConfig {
            max_payload_size: 16,
        };

        let result = write_frame(&mut client, &Frame::new(2, vec![0u8; 1024]), &config).await;
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_empty_payload_handled() {
        let (mut client, mut server) = duplex(8192);
        let config = default_config();

        write_frame(&mut client, &Frame::new(4, Vec::new()), &config)
            .await
            .unwrap();
        let received = read_frame(&mut server, &config).await.unwrap();
        assert_eq!(received.kind, 4);
        assert!(received.payload.is_empty());
    }

    #[tokio::test]
    async fn test_back_to_back_frames_dont_merge() {
        let (mut client, mut server) = duplex(8192);
        let config = default_config();

        write_frame(&mut client, &Frame::new(5, "aaa"), &config).await.unwrap();
        write_frame(&mut client, &Frame::new(6, "bbb"), &config).await.unwrap();

        let first = read_frame(&mut server, &config).await.unwrap();
        let second = read_frame(&mut server, &config).await.unwrap();
        assert_eq!(first, Frame::new(5, "aaa"));
        assert_eq!(second, Frame::new(6, "bbb"));
    }

    #[tokio::test]
    async fn test_connection_closed_during_header_read() {
        let (client, mut server) = duplex(8192);
        drop(client);

        let result = read_frame(&mut server, &default_config()).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_connection_closed_mid_payload() {
        let (mut client, mut server) = duplex(8192);
        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(&0u16.to_le_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let result = read_frame(&mut server, &default_config()).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }
}
