//! MQTT framing on top of `mqttrs`. Frames keep their wire bytes so they can
//! be relayed unmodified.

use bytes::{Bytes, BytesMut};
use mqttrs::{decode_slice, encode_slice, Packet};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest control packet the proxy ever builds itself (CONNACK, PINGRESP).
const MAX_CONTROL_PACKET: usize = 64;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed remaining length")]
    MalformedLength,

    #[error("frame of {size} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("connection closed in the middle of a frame")]
    UnexpectedEof,

    #[error("failed to decode packet: {0}")]
    Decode(String),

    #[error("failed to encode packet: {0}")]
    Encode(String),
}

/// Parse the total packet length (fixed header included) from the start of
/// `buffer`. Returns `Ok(None)` when more bytes are needed.
pub fn parse_packet_length(buffer: &[u8]) -> Result<Option<usize>, CodecError> {
    if buffer.is_empty() {
        return Ok(None);
    }

    let mut multiplier = 1;
    let mut value = 0usize;
    let mut offset = 1; // Skip fixed header byte

    loop {
        // Remaining length is at most 4 bytes
        if offset > 4 {
            return Err(CodecError::MalformedLength);
        }

        let Some(&byte) = buffer.get(offset) else {
            return Ok(None);
        };
        value += (byte as usize & 127) * multiplier;

        if byte & 128 == 0 {
            // 1 (fixed header) + offset (length bytes) + value (remaining length)
            return Ok(Some(1 + offset + value));
        }

        multiplier *= 128;
        offset += 1;
    }
}

/// One complete MQTT control packet, exactly as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Bytes,
}

impl Frame {
    /// Wrap bytes that are known to hold exactly one packet.
    pub fn from_bytes(bytes: Bytes) -> Result<Self, CodecError> {
        match parse_packet_length(&bytes)? {
            Some(len) if len == bytes.len() => Ok(Self { bytes }),
            _ => Err(CodecError::Decode(format!(
                "expected a single complete packet, got {} bytes",
                bytes.len()
            ))),
        }
    }

    /// Decode the packet, borrowing topic names and payloads from the frame.
    pub fn packet(&self) -> Result<Packet<'_>, CodecError> {
        match decode_slice(&self.bytes) {
            Ok(Some(packet)) => Ok(packet),
            Ok(None) => Err(CodecError::Decode("incomplete packet".to_string())),
            Err(e) => Err(CodecError::Decode(format!("{:?}", e))),
        }
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Encode a packet the proxy originates itself.
pub fn encode(packet: &Packet<'_>) -> Result<Frame, CodecError> {
    let mut buf = [0u8; MAX_CONTROL_PACKET];
    let written =
        encode_slice(packet, &mut buf).map_err(|e| CodecError::Encode(format!("{:?}", e)))?;
    Ok(Frame {
        bytes: Bytes::copy_from_slice(&buf[..written]),
    })
}

/// Short packet name for log lines.
pub fn packet_name(packet: &Packet<'_>) -> &'static str {
    match packet {
        Packet::Connect(_) => "CONNECT",
        Packet::Connack(_) => "CONNACK",
        Packet::Publish(_) => "PUBLISH",
        Packet::Puback(_) => "PUBACK",
        Packet::Pubrec(_) => "PUBREC",
        Packet::Pubrel(_) => "PUBREL",
        Packet::Pubcomp(_) => "PUBCOMP",
        Packet::Subscribe(_) => "SUBSCRIBE",
        Packet::Suback(_) => "SUBACK",
        Packet::Unsubscribe(_) => "UNSUBSCRIBE",
        Packet::Unsuback(_) => "UNSUBACK",
        Packet::Pingreq => "PINGREQ",
        Packet::Pingresp => "PINGRESP",
        Packet::Disconnect => "DISCONNECT",
    }
}

/// Reads whole frames from one leg of a session.
///
/// `next_frame` is cancel safe: bytes read before a cancelled call stay
/// buffered for the next one.
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_size: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    /// Returns `Ok(None)` on a clean end of stream between frames.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        loop {
            if let Some(len) = parse_packet_length(&self.buffer)? {
                if len > self.max_frame_size {
                    return Err(CodecError::FrameTooLarge {
                        size: len,
                        max: self.max_frame_size,
                    });
                }
                if self.buffer.len() >= len {
                    let bytes = self.buffer.split_to(len).freeze();
                    return Ok(Some(Frame { bytes }));
                }
                self.buffer.reserve(len - self.buffer.len());
            }

            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(CodecError::UnexpectedEof);
            }
        }
    }

    /// Buffer more input without handing out a frame, so a peer that goes
    /// away is noticed while its frames are not being taken. Returns
    /// `Ok(false)` at end of stream. Cancel safe.
    ///
    /// Pends once more than a maximum-size frame is buffered.
    pub async fn fill(&mut self) -> Result<bool, CodecError> {
        if self.buffer.len() > self.max_frame_size {
            return std::future::pending().await;
        }
        let n = self.reader.read_buf(&mut self.buffer).await?;
        Ok(n > 0)
    }
}
