use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::edgetunnel::tunnel::packet::{Packet, PacketKind};

pub const PROTOCOL_V1: u8 = 1;

pub const MAX_FRAME_BYTES: u32 = 16 << 20; // 16 MiB

// version + kind + src_cid + dest_cid
const FIXED_HEADER_BYTES: usize = 1 + 1 + 8 + 8;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("frame too large: {0}")]
    FrameTooLarge(u64),
    #[error("field {0} too long")]
    FieldTooLong(&'static str),
    #[error("truncated frame")]
    Truncated,
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes one packet as a length-prefixed frame (big-endian):
///
/// `u32 len | u8 version | u8 kind | i64 src_cid | i64 dest_cid |
///  u16+src | u16+dest | u16+error | u32+data`
pub fn encode_frame(pkt: &Packet) -> Result<Bytes, ProtocolError> {
    let src = short_field("src", &pkt.src)?;
    let dest = short_field("dest", &pkt.dest)?;
    let error = short_field("error", &pkt.error)?;

    let body_len = FIXED_HEADER_BYTES
        + 2
        + src.len()
        + 2
        + dest.len()
        + 2
        + error.len()
        + 4
        + pkt.data.len();
    if body_len > MAX_FRAME_BYTES as usize {
        return Err(ProtocolError::FrameTooLarge(body_len as u64));
    }

    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32(body_len as u32);
    buf.put_u8(PROTOCOL_V1);
    buf.put_u8(pkt.kind.as_u8());
    buf.put_i64(pkt.src_cid);
    buf.put_i64(pkt.dest_cid);
    for field in [src, dest, error] {
        buf.put_u16(field.len() as u16);
        buf.put_slice(field);
    }
    buf.put_u32(pkt.data.len() as u32);
    buf.put_slice(&pkt.data);
    Ok(buf.freeze())
}

fn short_field<'a>(name: &'static str, v: &'a str) -> Result<&'a [u8], ProtocolError> {
    if v.len() > u16::MAX as usize {
        return Err(ProtocolError::FieldTooLong(name));
    }
    Ok(v.as_bytes())
}

/// Decodes a frame body (everything after the `u32` length prefix).
pub fn decode_frame(mut body: Bytes) -> Result<Packet, ProtocolError> {
    if body.remaining() < FIXED_HEADER_BYTES {
        return Err(ProtocolError::Truncated);
    }
    let ver = body.get_u8();
    if ver != PROTOCOL_V1 {
        return Err(ProtocolError::BadVersion(ver));
    }
    let raw_kind = body.get_u8();
    let kind = PacketKind::from_u8(raw_kind).ok_or(ProtocolError::UnknownKind(raw_kind))?;
    let src_cid = body.get_i64();
    let dest_cid = body.get_i64();

    let src = take_string(&mut body, "src")?;
    let dest = take_string(&mut body, "dest")?;
    let error = take_string(&mut body, "error")?;

    if body.remaining() < 4 {
        return Err(ProtocolError::Truncated);
    }
    let n = body.get_u32() as usize;
    if body.remaining() < n {
        return Err(ProtocolError::Truncated);
    }
    let data = body.split_to(n);

    Ok(Packet {
        kind,
        src,
        dest,
        src_cid,
        dest_cid,
        data,
        error,
    })
}

fn take_string(body: &mut Bytes, name: &'static str) -> Result<String, ProtocolError> {
    if body.remaining() < 2 {
        return Err(ProtocolError::Truncated);
    }
    let n = body.get_u16() as usize;
    if body.remaining() < n {
        return Err(ProtocolError::Truncated);
    }
    let raw = body.split_to(n);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(name))
}

pub async fn read_packet<R: AsyncRead + Unpin>(r: &mut R) -> Result<Packet, ProtocolError> {
    let n = r.read_u32().await?;
    if n > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(n as u64));
    }

    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    decode_frame(Bytes::from(buf))
}
