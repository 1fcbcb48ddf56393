//! Wire framing and protocol negotiation.
//!
//! Every connection starts with a version handshake: the connecting side
//! sends `x_version_req` carrying its maximum protocol version, the
//! accepting side answers `x_version_reply` with the common maximum (or
//! `x_unknown_proto`, which aborts the connection). After that the stream
//! carries framed [`PaxMsg`] bodies.
//!
//! The frame is a fixed 16-byte header followed by the codec-encoded
//! body:
//!
//! ```text
//! ┌────────────┬────────────┬────────────┬────────────┬──────────┐
//! │ proto u32  │ length u32 │ tag u32    │ app_tag u32│ body ... │
//! └────────────┴────────────┴────────────┴────────────┴──────────┘
//! ```

use bytes::{Buf, BufMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use conclave_core::{JsonCodec, MessageCodec};

use crate::msg::{PaxMsg, ProtoVersion};

/// Size of the fixed message header.
pub const MSG_HDR_SIZE: usize = 16;

/// Upper bound on a message body; anything larger is garbage or abuse.
pub const MAX_MSG_SIZE: u32 = 64 * 1024 * 1024;

/// Header message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgTag {
    /// An ordinary protocol message.
    Normal,
    /// Handshake request carrying the sender's maximum protocol.
    VersionReq,
    /// Handshake answer carrying the common maximum protocol.
    VersionReply,
    /// Handshake answer: no common protocol, the connection is useless.
    UnknownProto,
}

impl MsgTag {
    fn to_u32(self) -> u32 {
        match self {
            MsgTag::Normal => 1,
            MsgTag::VersionReq => 2,
            MsgTag::VersionReply => 3,
            MsgTag::UnknownProto => 4,
        }
    }

    fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(MsgTag::Normal),
            2 => Some(MsgTag::VersionReq),
            3 => Some(MsgTag::VersionReply),
            4 => Some(MsgTag::UnknownProto),
            _ => None,
        }
    }
}

/// Errors on the wire.
#[derive(Debug, Error)]
pub enum WireError {
    /// Transport failure; the connection is dead.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The body did not decode to a known message.
    #[error("unknown or garbled operation")]
    UnknownOp,
    /// The header was malformed.
    #[error("malformed header")]
    BadHeader,
    /// Handshake failed: no common protocol version.
    #[error("no common protocol version")]
    UnknownProto,
    /// The peer announced a body larger than the sanity bound.
    #[error("oversized message: {0} bytes")]
    TooLarge(u32),
}

/// One parsed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    /// Protocol version of the sender.
    pub proto: ProtoVersion,
    /// Body length in bytes.
    pub length: u32,
    /// Message tag.
    pub tag: MsgTag,
    /// Application tag, opaque to the engine.
    pub app_tag: u32,
}

/// Encode a header into its fixed wire form.
pub fn encode_header(header: &WireHeader) -> [u8; MSG_HDR_SIZE] {
    let mut buf = [0u8; MSG_HDR_SIZE];
    let mut cursor = &mut buf[..];
    cursor.put_u32(header.proto.0 as u32);
    cursor.put_u32(header.length);
    cursor.put_u32(header.tag.to_u32());
    cursor.put_u32(header.app_tag);
    buf
}

/// Decode a header from its fixed wire form.
pub fn decode_header(raw: &[u8; MSG_HDR_SIZE]) -> Result<WireHeader, WireError> {
    let mut cursor = &raw[..];
    let proto = cursor.get_u32();
    let length = cursor.get_u32();
    let tag = MsgTag::from_u32(cursor.get_u32()).ok_or(WireError::BadHeader)?;
    let app_tag = cursor.get_u32();
    if proto > u16::MAX as u32 {
        return Err(WireError::BadHeader);
    }
    Ok(WireHeader {
        proto: ProtoVersion(proto as u16),
        length,
        tag,
        app_tag,
    })
}

async fn read_header<S: AsyncRead + Unpin>(stream: &mut S) -> Result<WireHeader, WireError> {
    let mut raw = [0u8; MSG_HDR_SIZE];
    stream.read_exact(&mut raw).await?;
    decode_header(&raw)
}

async fn write_header<S: AsyncWrite + Unpin>(
    stream: &mut S,
    header: &WireHeader,
) -> Result<(), WireError> {
    stream.write_all(&encode_header(header)).await?;
    Ok(())
}

// =============================================================================
// Handshake
// =============================================================================

/// Client side of the version handshake: advertise our maximum, accept
/// the common maximum the peer picks.
pub async fn client_handshake<S>(stream: &mut S) -> Result<ProtoVersion, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_header(
        stream,
        &WireHeader {
            proto: ProtoVersion::CURRENT,
            length: 0,
            tag: MsgTag::VersionReq,
            app_tag: 0,
        },
    )
    .await?;
    stream.flush().await?;

    let reply = read_header(stream).await?;
    match reply.tag {
        MsgTag::VersionReply if reply.proto >= ProtoVersion::BASE => Ok(reply.proto),
        MsgTag::UnknownProto => Err(WireError::UnknownProto),
        _ => Err(WireError::BadHeader),
    }
}

/// Server side of the version handshake: read the request, answer with
/// the common maximum.
pub async fn serve_handshake<S>(stream: &mut S) -> Result<ProtoVersion, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = read_header(stream).await?;
    if request.tag != MsgTag::VersionReq {
        return Err(WireError::BadHeader);
    }
    if request.proto < ProtoVersion::BASE {
        write_header(
            stream,
            &WireHeader {
                proto: ProtoVersion::CURRENT,
                length: 0,
                tag: MsgTag::UnknownProto,
                app_tag: 0,
            },
        )
        .await?;
        stream.flush().await?;
        return Err(WireError::UnknownProto);
    }
    let common = request.proto.min(ProtoVersion::CURRENT);
    write_header(
        stream,
        &WireHeader {
            proto: common,
            length: 0,
            tag: MsgTag::VersionReply,
            app_tag: 0,
        },
    )
    .await?;
    stream.flush().await?;
    Ok(common)
}

// =============================================================================
// Framed messages
// =============================================================================

/// Read one framed message.
pub async fn read_msg<S: AsyncRead + Unpin>(stream: &mut S) -> Result<PaxMsg, WireError> {
    let header = read_header(stream).await?;
    if header.tag != MsgTag::Normal {
        return Err(WireError::BadHeader);
    }
    if header.length > MAX_MSG_SIZE {
        return Err(WireError::TooLarge(header.length));
    }
    let mut body = vec![0u8; header.length as usize];
    stream.read_exact(&mut body).await?;
    JsonCodec.decode(&body).map_err(|_| WireError::UnknownOp)
}

/// Write one framed message.
pub async fn write_msg<S: AsyncWrite + Unpin>(
    stream: &mut S,
    msg: &PaxMsg,
) -> Result<(), WireError> {
    let body = JsonCodec.encode(msg).map_err(|_| WireError::UnknownOp)?;
    write_header(
        stream,
        &WireHeader {
            proto: ProtoVersion::CURRENT,
            length: body.len() as u32,
            tag: MsgTag::Normal,
            app_tag: 0,
        },
    )
    .await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}
