pub mod codec;
pub mod error;
pub mod hash;
pub mod message;

pub use error::WireError;
pub use message::Message;
