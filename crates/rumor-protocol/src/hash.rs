use sha1::{Digest, Sha1};

pub const DIGEST_LEN: usize = 20;

/// SHA-1 of a user payload; the duplicate-suppression key.
pub type PayloadDigest = [u8; DIGEST_LEN];

pub fn payload_digest(payload: &[u8]) -> PayloadDigest {
    let mut hasher = Sha1::new();
    hasher.update(payload);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // SHA-1("abc")
        let expected: PayloadDigest = [
            0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78, 0x50,
            0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d,
        ];
        assert_eq!(payload_digest(b"abc"), expected);
    }

    #[test]
    fn distinct_payloads_distinct_digests() {
        assert_ne!(payload_digest(b"one"), payload_digest(b"two"));
        assert_eq!(payload_digest(b""), payload_digest(b""));
    }
}
