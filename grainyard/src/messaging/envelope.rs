//! Wire envelope: binary framing for silo-to-silo and client links.
//!
//! Hand-written little-endian, length-prefixed layout; the `body` stays
//! opaque bytes from the serialization collaborator.

use crate::error::MessageError;
use crate::messaging::{Direction, Message, MessageFlags, RejectionInfo, RejectionKind};
use bytes::Bytes;
use grainyard_core::{CorrelationId, GrainId, SiloAddress};
use std::io::Cursor;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum frame size: 1 MiB.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Binary codec for [`Message`] frames.
///
/// # Layout
///
/// ```text
/// [direction: 1]              Request=1 Response=2 OneWay=3 Rejection=4
/// [correlation_id: 8]
/// [sender_silo: lp-string]    canonical "host:port@generation"
/// [sender_grain: lp-string]   canonical "namespace::kind/key"
/// [target_silo: 1 + lp?]      presence byte then string when present
/// [target_grain: lp-string]
/// [interface_id: 4]
/// [method_id: 4]
/// [flags: 2]
/// [hop_count: 1]
/// [retry_count: 1]
/// [cache_etag: 1 + 8?]        presence byte then u64 when present
/// [rejection: 1 + (1 + lp)?]  presence, then kind byte + reason string
/// [body: 4 + N]
/// ```
///
/// All integers little-endian; `lp-string` is a u32 length prefix followed
/// by UTF-8 bytes.
pub struct Envelope;

impl Envelope {
    /// Serialize a message to wire format.
    pub fn encode(message: &Message) -> Result<Vec<u8>, MessageError> {
        let mut buffer = Vec::with_capacity(256 + message.body.len());

        let direction: u8 = match message.direction {
            Direction::Request => 1,
            Direction::Response => 2,
            Direction::OneWay => 3,
            Direction::Rejection => 4,
        };
        std::io::Write::write_all(&mut buffer, &[direction])?;
        std::io::Write::write_all(&mut buffer, &message.correlation_id.as_u64().to_le_bytes())?;

        write_string(&mut buffer, &message.sender_silo.to_string())?;
        write_string(&mut buffer, &message.sender_grain.to_string())?;

        match &message.target_silo {
            Some(silo) => {
                std::io::Write::write_all(&mut buffer, &[1])?;
                write_string(&mut buffer, &silo.to_string())?;
            }
            None => std::io::Write::write_all(&mut buffer, &[0])?,
        }
        write_string(&mut buffer, &message.target_grain.to_string())?;

        std::io::Write::write_all(&mut buffer, &message.interface_id.to_le_bytes())?;
        std::io::Write::write_all(&mut buffer, &message.method_id.to_le_bytes())?;
        std::io::Write::write_all(&mut buffer, &message.flags.bits().to_le_bytes())?;
        std::io::Write::write_all(&mut buffer, &[message.hop_count, message.retry_count])?;

        match message.cache_etag {
            Some(etag) => {
                std::io::Write::write_all(&mut buffer, &[1])?;
                std::io::Write::write_all(&mut buffer, &etag.to_le_bytes())?;
            }
            None => std::io::Write::write_all(&mut buffer, &[0])?,
        }

        match &message.rejection {
            Some(info) => {
                std::io::Write::write_all(&mut buffer, &[1])?;
                let kind: u8 = match info.kind {
                    RejectionKind::Transient => 1,
                    RejectionKind::Unrecoverable => 2,
                    RejectionKind::Overloaded => 3,
                    RejectionKind::CacheInvalidation => 4,
                };
                std::io::Write::write_all(&mut buffer, &[kind])?;
                write_string(&mut buffer, &info.reason)?;
            }
            None => std::io::Write::write_all(&mut buffer, &[0])?,
        }

        std::io::Write::write_all(&mut buffer, &(message.body.len() as u32).to_le_bytes())?;
        std::io::Write::write_all(&mut buffer, &message.body)?;

        if buffer.len() > MAX_FRAME_SIZE {
            return Err(MessageError::FrameTooLarge {
                size: buffer.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(buffer)
    }

    /// Deserialize a message from wire format.
    pub fn decode(data: &[u8]) -> Result<Message, MessageError> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(MessageError::FrameTooLarge {
                size: data.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        let mut cursor = Cursor::new(data);

        let direction = match read_u8(&mut cursor)? {
            1 => Direction::Request,
            2 => Direction::Response,
            3 => Direction::OneWay,
            4 => Direction::Rejection,
            other => return Err(MessageError::Decode(format!("invalid direction: {other}"))),
        };
        let correlation_id = CorrelationId::new(read_u64(&mut cursor)?);

        let sender_silo = parse_silo(&read_string(&mut cursor)?)?;
        let sender_grain = parse_grain(&read_string(&mut cursor)?)?;

        let target_silo = match read_u8(&mut cursor)? {
            0 => None,
            _ => Some(parse_silo(&read_string(&mut cursor)?)?),
        };
        let target_grain = parse_grain(&read_string(&mut cursor)?)?;

        let interface_id = read_u32(&mut cursor)?;
        let method_id = read_u32(&mut cursor)?;
        let flags = MessageFlags::from_bits_truncate(read_u16(&mut cursor)?);
        let hop_count = read_u8(&mut cursor)?;
        let retry_count = read_u8(&mut cursor)?;

        let cache_etag = match read_u8(&mut cursor)? {
            0 => None,
            _ => Some(read_u64(&mut cursor)?),
        };

        let rejection = match read_u8(&mut cursor)? {
            0 => None,
            _ => {
                let kind = match read_u8(&mut cursor)? {
                    1 => RejectionKind::Transient,
                    2 => RejectionKind::Unrecoverable,
                    3 => RejectionKind::Overloaded,
                    4 => RejectionKind::CacheInvalidation,
                    other => {
                        return Err(MessageError::Decode(format!(
                            "invalid rejection kind: {other}"
                        )))
                    }
                };
                let reason = read_string(&mut cursor)?;
                Some(RejectionInfo { kind, reason })
            }
        };

        let body_len = read_u32(&mut cursor)? as usize;
        let mut body = vec![0u8; body_len];
        std::io::Read::read_exact(&mut cursor, &mut body)?;

        Ok(Message {
            correlation_id,
            direction,
            sender_silo,
            sender_grain,
            target_silo,
            target_grain,
            interface_id,
            method_id,
            flags,
            hop_count,
            retry_count,
            cache_etag,
            rejection,
            body: Bytes::from(body),
            time_to_expiry: None,
        })
    }

    /// Write one length-prefixed frame to an async stream.
    pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<(), MessageError>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let frame = Self::encode(message)?;
        writer.write_all(&(frame.len() as u32).to_le_bytes()).await?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one length-prefixed frame from an async stream.
    pub async fn read_frame<R>(reader: &mut R) -> Result<Message, MessageError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut length = [0u8; 4];
        reader.read_exact(&mut length).await?;
        let length = u32::from_le_bytes(length) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(MessageError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }
        let mut frame = vec![0u8; length];
        reader.read_exact(&mut frame).await?;
        Self::decode(&frame)
    }
}

fn write_string(buffer: &mut Vec<u8>, s: &str) -> Result<(), MessageError> {
    std::io::Write::write_all(&mut *buffer, &(s.len() as u32).to_le_bytes())?;
    std::io::Write::write_all(&mut *buffer, s.as_bytes())?;
    Ok(())
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String, MessageError> {
    let length = read_u32(cursor)? as usize;
    if length > MAX_FRAME_SIZE {
        return Err(MessageError::Decode(format!("string too long: {length}")));
    }
    let mut bytes = vec![0u8; length];
    std::io::Read::read_exact(&mut *cursor, &mut bytes)?;
    String::from_utf8(bytes).map_err(|e| MessageError::Decode(format!("invalid utf-8: {e}")))
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8, MessageError> {
    let mut buf = [0u8; 1];
    std::io::Read::read_exact(&mut *cursor, &mut buf)?;
    Ok(buf[0])
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16, MessageError> {
    let mut buf = [0u8; 2];
    std::io::Read::read_exact(&mut *cursor, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, MessageError> {
    let mut buf = [0u8; 4];
    std::io::Read::read_exact(&mut *cursor, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64, MessageError> {
    let mut buf = [0u8; 8];
    std::io::Read::read_exact(&mut *cursor, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn parse_silo(s: &str) -> Result<SiloAddress, MessageError> {
    SiloAddress::parse(s).map_err(|e| MessageError::Decode(format!("invalid silo address: {e}")))
}

fn parse_grain(s: &str) -> Result<GrainId, MessageError> {
    GrainId::parse(s).map_err(|e| MessageError::Decode(format!("invalid grain id: {e}")))
}
