//! Frame encoding and decoding for stream transports.
//!
//! Every frame is a 4-byte big-endian length prefix followed by that many
//! bytes of wire-encoded [`EncodedMessage`]: a fixed header carrying the
//! envelope metadata, then the payload bytes. Lengths are validated before
//! any allocation happens.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::envelope::{EncodedMessage, EncodingFormat, MessageMetadata};
use crate::error::ProtocolError;

/// Current wire protocol version.
pub const WIRE_VERSION: u16 = 1;

/// Maximum frame size (64 MiB). Larger frames close the channel.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Fixed header size without a correlation id.
///
/// Layout (big-endian): version (2) · format (1) · message id (16) ·
/// flags (1) · created-at Unix millis (8).
pub const FIXED_HEADER_SIZE: usize = 28;

const FLAG_CORRELATED: u8 = 0b0000_0001;

/// Serialises an encoded message into its frame body (header + payload).
#[must_use]
pub fn encode_frame_body(message: &EncodedMessage) -> Vec<u8> {
    let metadata = message.metadata();
    let correlated = metadata.correlation_id.is_some();
    let header_len = FIXED_HEADER_SIZE + if correlated { 16 } else { 0 };

    let mut buf = Vec::with_capacity(header_len + message.payload().len());
    buf.extend_from_slice(&WIRE_VERSION.to_be_bytes());
    buf.push(message.format().as_u8());
    buf.extend_from_slice(metadata.id.as_bytes());
    buf.push(if correlated { FLAG_CORRELATED } else { 0 });
    if let Some(correlation_id) = metadata.correlation_id {
        buf.extend_from_slice(correlation_id.as_bytes());
    }
    buf.extend_from_slice(&metadata.created_at_millis().to_be_bytes());
    buf.extend_from_slice(message.payload());
    buf
}

/// Deserialises a frame body back into an encoded message.
pub fn decode_frame_body(body: &[u8]) -> Result<EncodedMessage, ProtocolError> {
    if body.len() < FIXED_HEADER_SIZE {
        return Err(ProtocolError::InvalidFrame(format!(
            "frame body of {} bytes is shorter than the fixed header",
            body.len()
        )));
    }

    let version = u16::from_be_bytes([body[0], body[1]]);
    if version != WIRE_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let format = EncodingFormat::from_u8(body[2]).ok_or(ProtocolError::UnknownFormat(body[2]))?;

    let id = Uuid::from_slice(&body[3..19])
        .map_err(|e| ProtocolError::InvalidFrame(format!("bad message id: {e}")))?;

    let flags = body[19];
    let mut offset = 20;

    let correlation_id = if flags & FLAG_CORRELATED != 0 {
        if body.len() < offset + 16 {
            return Err(ProtocolError::InvalidFrame(
                "correlation flag set but frame too short".to_owned(),
            ));
        }
        let correlation = Uuid::from_slice(&body[offset..offset + 16])
            .map_err(|e| ProtocolError::InvalidFrame(format!("bad correlation id: {e}")))?;
        offset += 16;
        Some(correlation)
    } else {
        None
    };

    if body.len() < offset + 8 {
        return Err(ProtocolError::InvalidFrame(
            "frame too short for timestamp".to_owned(),
        ));
    }
    let mut timestamp = [0u8; 8];
    timestamp.copy_from_slice(&body[offset..offset + 8]);
    let created_at_ms = i64::from_be_bytes(timestamp);
    offset += 8;

    let metadata = MessageMetadata::from_wire(id, correlation_id, created_at_ms, format);
    Ok(EncodedMessage::from_parts(
        metadata,
        format,
        body[offset..].to_vec(),
    ))
}

/// Reads one frame from the stream.
///
/// Fails with [`ProtocolError::FrameTooLarge`] before allocating when the
/// length prefix exceeds [`MAX_FRAME_SIZE`], with
/// [`ProtocolError::InvalidFrame`] on a zero-length frame, and with
/// [`ProtocolError::TruncatedFrame`] when the stream ends mid-body.
pub async fn read_frame<R>(stream: &mut R) -> Result<EncodedMessage, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    stream.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(ProtocolError::InvalidFrame(
            "zero-length frame".to_owned(),
        ));
    }
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    match stream.read_exact(&mut body).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::TruncatedFrame);
        }
        Err(e) => return Err(e.into()),
    }

    decode_frame_body(&body)
}

/// Writes one frame to the stream as a single buffered write.
///
/// The caller guarantees mutual exclusion on the writer; interleaved calls
/// would corrupt the stream.
pub async fn write_frame<W>(stream: &mut W, message: &EncodedMessage) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let body = encode_frame_body(message);
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    #[allow(clippy::cast_possible_truncation)]
    let len = body.len() as u32;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);

    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Message;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    struct Ping {
        seq: u64,
    }

    fn encoded(seq: u64) -> EncodedMessage {
        Message::new(Ping { seq })
            .encode(EncodingFormat::Json)
            .unwrap()
    }

    #[test]
    fn frame_body_roundtrip() {
        let original = encoded(42);
        let body = encode_frame_body(&original);
        let restored = decode_frame_body(&body).unwrap();

        assert_eq!(restored.metadata().id, original.metadata().id);
        assert_eq!(restored.format(), original.format());
        assert_eq!(restored.payload(), original.payload());

        let ping: Ping = restored.decode().unwrap();
        assert_eq!(ping.seq, 42);
    }

    #[test]
    fn frame_body_roundtrip_with_correlation() {
        let correlation = Uuid::new_v4();
        let original = Message::correlated(Ping { seq: 1 }, correlation)
            .encode(EncodingFormat::Json)
            .unwrap();

        let restored = decode_frame_body(&encode_frame_body(&original)).unwrap();
        assert_eq!(restored.metadata().correlation_id, Some(correlation));
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let mut body = encode_frame_body(&encoded(1));
        body[0] = 0xFF;
        body[1] = 0xFF;

        assert!(matches!(
            decode_frame_body(&body),
            Err(ProtocolError::UnsupportedVersion(0xFFFF))
        ));
    }

    #[test]
    fn decode_rejects_unknown_format() {
        let mut body = encode_frame_body(&encoded(1));
        body[2] = 0x7F;

        assert!(matches!(
            decode_frame_body(&body),
            Err(ProtocolError::UnknownFormat(0x7F))
        ));
    }

    #[test]
    fn decode_rejects_short_body() {
        let body = encode_frame_body(&encoded(1));
        assert!(matches!(
            decode_frame_body(&body[..10]),
            Err(ProtocolError::InvalidFrame(_))
        ));
    }

    #[tokio::test]
    async fn stream_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let original = encoded(99);
        write_frame(&mut client, &original).await.unwrap();

        let restored = read_frame(&mut server).await.unwrap();
        assert_eq!(restored.metadata().id, original.metadata().id);

        let ping: Ping = restored.decode().unwrap();
        assert_eq!(ping.seq, 99);
    }

    #[tokio::test]
    async fn read_rejects_zero_length_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&0u32.to_be_bytes()).await.unwrap();

        assert!(matches!(
            read_frame(&mut server).await,
            Err(ProtocolError::InvalidFrame(_))
        ));
    }

    #[tokio::test]
    async fn read_rejects_oversized_frame_before_allocation() {
        let (mut client, mut server) = tokio::io::duplex(64);
        #[allow(clippy::cast_possible_truncation)]
        let len = (MAX_FRAME_SIZE + 1) as u32;
        client.write_all(&len.to_be_bytes()).await.unwrap();

        match read_frame(&mut server).await {
            Err(ProtocolError::FrameTooLarge { size, max }) => {
                assert_eq!(size, MAX_FRAME_SIZE + 1);
                assert_eq!(max, MAX_FRAME_SIZE);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_reports_truncated_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&16u32.to_be_bytes()).await.unwrap();
        client.write_all(&[0u8; 4]).await.unwrap();
        drop(client);

        assert!(matches!(
            read_frame(&mut server).await,
            Err(ProtocolError::TruncatedFrame)
        ));
    }

    #[tokio::test]
    async fn sequential_frames_preserve_order() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        for seq in 0..5u64 {
            write_frame(&mut client, &encoded(seq)).await.unwrap();
        }

        for seq in 0..5u64 {
            let frame = read_frame(&mut server).await.unwrap();
            let ping: Ping = frame.decode().unwrap();
            assert_eq!(ping.seq, seq);
        }
    }
}
