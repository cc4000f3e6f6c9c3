use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("bad magic: {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("unknown message tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("frame length {len} exceeds {limit}")]
    FrameTooLarge { len: u32, limit: u32 },

    #[error("empty frame")]
    EmptyFrame,

    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
