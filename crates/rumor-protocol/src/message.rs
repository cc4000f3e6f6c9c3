//! The nine messages exchanged between rumor agents.
//!
//! Every message carries `id`, the sender's agent id, as field 1. Payloads
//! are protobuf-encoded with the field numbers below; implementations in
//! other languages must keep the schema byte-for-byte compatible.

use crate::error::WireError;

/// Neighbor request priority. A high-priority request is always admitted;
/// a low-priority one only when the receiver's active view has room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum Priority {
    Low = 0,
    High = 1,
}

/// A peer sample entry carried by Shuffle / ShuffleReply.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Candidate {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub addr: String,
}

/// Application payload flooded through the overlay. `id` stays the
/// originator's id as the message is forwarded; `ts` is the origin
/// wall-clock time in nanoseconds and bounds the message's life.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserMessage {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(int64, tag = "3")]
    pub ts: i64,
}

/// Request to enter the receiver's active view over this connection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Join {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub addr: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinReply {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(bool, tag = "2")]
    pub accept: bool,
}

/// Relays news of a newcomer on a bounded random walk.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ForwardJoin {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub source_id: u64,
    #[prost(string, tag = "3")]
    pub source_addr: String,
    #[prost(uint32, tag = "4")]
    pub ttl: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Neighbor {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub addr: String,
    #[prost(enumeration = "Priority", tag = "3")]
    pub priority: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NeighborReply {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(bool, tag = "2")]
    pub accept: bool,
}

/// Voluntary removal from the sender's active view.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Disconnect {
    #[prost(uint64, tag = "1")]
    pub id: u64,
}

/// Propagates a sample of the sender's views on a bounded random walk.
/// `id` is rewritten to the forwarder's id on every hop; `source_id` and
/// `addr` stay the originator's so the terminal node can reply directly.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Shuffle {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub source_id: u64,
    #[prost(string, tag = "3")]
    pub addr: String,
    #[prost(message, repeated, tag = "4")]
    pub candidates: Vec<Candidate>,
    #[prost(uint32, tag = "5")]
    pub ttl: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShuffleReply {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(message, repeated, tag = "2")]
    pub candidates: Vec<Candidate>,
}

// ============================================================================
// Tagged union
// ============================================================================

/// Every framed message, tagged by wire type.
///
/// Tags are assigned in fixed registration order; both ends of a connection
/// must agree on it. The order is frozen (UserMessage..ShuffleReply → 0..8)
/// and locked by a test below.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    User(UserMessage),
    Join(Join),
    JoinReply(JoinReply),
    ForwardJoin(ForwardJoin),
    Neighbor(Neighbor),
    NeighborReply(NeighborReply),
    Disconnect(Disconnect),
    Shuffle(Shuffle),
    ShuffleReply(ShuffleReply),
}

impl Message {
    /// The 8-bit wire tag for this message.
    pub fn tag(&self) -> u8 {
        match self {
            Message::User(_) => 0,
            Message::Join(_) => 1,
            Message::JoinReply(_) => 2,
            Message::ForwardJoin(_) => 3,
            Message::Neighbor(_) => 4,
            Message::NeighborReply(_) => 5,
            Message::Disconnect(_) => 6,
            Message::Shuffle(_) => 7,
            Message::ShuffleReply(_) => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::User(_) => "UserMessage",
            Message::Join(_) => "Join",
            Message::JoinReply(_) => "JoinReply",
            Message::ForwardJoin(_) => "ForwardJoin",
            Message::Neighbor(_) => "Neighbor",
            Message::NeighborReply(_) => "NeighborReply",
            Message::Disconnect(_) => "Disconnect",
            Message::Shuffle(_) => "Shuffle",
            Message::ShuffleReply(_) => "ShuffleReply",
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        use prost::Message as _;
        match self {
            Message::User(m) => m.encode_to_vec(),
            Message::Join(m) => m.encode_to_vec(),
            Message::JoinReply(m) => m.encode_to_vec(),
            Message::ForwardJoin(m) => m.encode_to_vec(),
            Message::Neighbor(m) => m.encode_to_vec(),
            Message::NeighborReply(m) => m.encode_to_vec(),
            Message::Disconnect(m) => m.encode_to_vec(),
            Message::Shuffle(m) => m.encode_to_vec(),
            Message::ShuffleReply(m) => m.encode_to_vec(),
        }
    }

    pub fn decode_payload(tag: u8, buf: &[u8]) -> Result<Message, WireError> {
        use prost::Message as _;
        Ok(match tag {
            0 => Message::User(UserMessage::decode(buf)?),
            1 => Message::Join(Join::decode(buf)?),
            2 => Message::JoinReply(JoinReply::decode(buf)?),
            3 => Message::ForwardJoin(ForwardJoin::decode(buf)?),
            4 => Message::Neighbor(Neighbor::decode(buf)?),
            5 => Message::NeighborReply(NeighborReply::decode(buf)?),
            6 => Message::Disconnect(Disconnect::decode(buf)?),
            7 => Message::Shuffle(Shuffle::decode(buf)?),
            8 => Message::ShuffleReply(ShuffleReply::decode(buf)?),
            other => return Err(WireError::UnknownTag(other)),
        })
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_order_is_frozen() {
        let all = [
            Message::User(UserMessage::default()),
            Message::Join(Join::default()),
            Message::JoinReply(JoinReply::default()),
            Message::ForwardJoin(ForwardJoin::default()),
            Message::Neighbor(Neighbor::default()),
            Message::NeighborReply(NeighborReply::default()),
            Message::Disconnect(Disconnect::default()),
            Message::Shuffle(Shuffle::default()),
            Message::ShuffleReply(ShuffleReply::default()),
        ];
        for (expected, msg) in all.iter().enumerate() {
            assert_eq!(msg.tag() as usize, expected, "{} moved", msg.name());
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(matches!(
            Message::decode_payload(9, &[]),
            Err(WireError::UnknownTag(9))
        ));
        assert!(matches!(
            Message::decode_payload(0xFF, &[]),
            Err(WireError::UnknownTag(0xFF))
        ));
    }

    #[test]
    fn priority_conversion() {
        let mut n = Neighbor {
            id: 1,
            addr: "127.0.0.1:8424".into(),
            priority: Priority::High as i32,
        };
        assert_eq!(n.priority(), Priority::High);
        n.priority = Priority::Low as i32;
        assert_eq!(n.priority(), Priority::Low);
        // Unknown wire values degrade to Low rather than failing the frame.
        n.priority = 7;
        assert_eq!(n.priority(), Priority::Low);
    }
}
