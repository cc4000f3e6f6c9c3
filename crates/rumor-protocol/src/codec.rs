//! Length-prefixed, magic-framed message codec.
//!
//! Every frame on the wire is `AB CD | len:u32le | tag:u8 | payload`, where
//! `len` counts the tag byte plus the protobuf payload. The magic prefix is
//! validated before anything past it is consumed, so a desynchronized
//! stream fails fast instead of mis-parsing garbage.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;
use crate::message::Message;

pub const MAGIC: [u8; 2] = [0xAB, 0xCD];

/// Upper bound on `len`. Anything larger is treated as a protocol error
/// rather than an allocation request.
pub const MAX_FRAME_LEN: u32 = 64 * 1024;

/// Encode `msg` and write one complete frame.
pub async fn write_message<W>(w: &mut W, msg: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let payload = msg.encode_payload();
    let len = payload.len() as u32 + 1;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge {
            len,
            limit: MAX_FRAME_LEN,
        });
    }
    let mut frame = Vec::with_capacity(2 + 4 + len as usize);
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.push(msg.tag());
    frame.extend_from_slice(&payload);
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Read one frame and decode it.
///
/// On `BadMagic` only the two magic bytes have been consumed.
pub async fn read_message<R>(r: &mut R) -> Result<Message, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut magic = [0u8; 2];
    r.read_exact(&mut magic).await?;
    if magic != MAGIC {
        return Err(WireError::BadMagic(magic));
    }

    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len == 0 {
        return Err(WireError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge {
            len,
            limit: MAX_FRAME_LEN,
        });
    }

    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;
    Message::decode_payload(body[0], &body[1..])
}
