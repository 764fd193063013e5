//! Server Dialback (XEP-0220) key handling.
//!
//! Dialback authenticates an asserting domain through a callback: the
//! receiving server connects back to the asserting domain's
//! DNS-resolved server and asks it to confirm a key it issued.
//!
//! The key is generated with HMAC-SHA256 over the stream id and the
//! two domains:
//! ```text
//! key = HMAC-SHA256(secret, stream_id || receiving_domain || originating_domain)
//! ```
//! The secret must stay stable for the lifetime of the process so keys
//! issued earlier on other streams still verify.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub use crate::parser::ns::{DIALBACK as NS_DIALBACK, DIALBACK_FEATURES as NS_DIALBACK_FEATURES};

/// Outcome of a dialback verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialbackResult {
    /// Verification successful.
    Valid,
    /// Verification failed.
    Invalid,
}

impl DialbackResult {
    /// The XEP-0220 `type` attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }

    /// Parse from the `type` attribute value.
    pub fn from_attr(s: &str) -> Option<Self> {
        match s {
            "valid" => Some(Self::Valid),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }
}

/// Dialback key generator.
#[derive(Clone)]
pub struct DialbackKey {
    secret: Vec<u8>,
}

impl DialbackKey {
    /// Create a generator with the given process secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Generate a dialback key for the given stream and domain pair.
    pub fn generate(
        &self,
        stream_id: &str,
        receiving_domain: &str,
        originating_domain: &str,
    ) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");

        mac.update(stream_id.as_bytes());
        mac.update(receiving_domain.as_bytes());
        mac.update(originating_domain.as_bytes());

        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a key received in a `db:verify` request.
    pub fn verify(
        &self,
        key: &str,
        stream_id: &str,
        receiving_domain: &str,
        originating_domain: &str,
    ) -> bool {
        let expected = self.generate(stream_id, receiving_domain, originating_domain);
        constant_time_eq(key.as_bytes(), expected.as_bytes())
    }
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Build the `db:result` challenge sent by the originating server.
pub fn build_db_result(from: &str, to: &str, key: &str) -> String {
    format!(
        "<db:result xmlns:db='{}' from='{}' to='{}'>{}</db:result>",
        NS_DIALBACK, from, to, key
    )
}

/// Build the `db:verify` request sent to the authoritative server.
pub fn build_db_verify(from: &str, to: &str, id: &str, key: &str) -> String {
    format!(
        "<db:verify xmlns:db='{}' from='{}' to='{}' id='{}'>{}</db:verify>",
        NS_DIALBACK, from, to, id, key
    )
}

/// Build a `db:verify` response (sent by the authoritative server).
pub fn build_db_verify_response(from: &str, to: &str, id: &str, result: DialbackResult) -> String {
    format!(
        "<db:verify xmlns:db='{}' from='{}' to='{}' id='{}' type='{}'/>",
        NS_DIALBACK,
        from,
        to,
        id,
        result.as_str()
    )
}

/// Helper module for hex encoding.
mod hex {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        let bytes = bytes.as_ref();
        let mut result = String::with_capacity(bytes.len() * 2);
        for byte in bytes {
            result.push(HEX_CHARS[(byte >> 4) as usize] as char);
            result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation_deterministic() {
        let key_gen = DialbackKey::new(b"test-secret-key");

        let key1 = key_gen.generate("stream-id-1", "b.example", "a.example");
        let key2 = key_gen.generate("stream-id-1", "b.example", "a.example");
        assert_eq!(key1, key2);

        let key3 = key_gen.generate("stream-id-2", "b.example", "a.example");
        assert_ne!(key1, key3);

        let key4 = key_gen.generate("stream-id-1", "other.example", "a.example");
        assert_ne!(key1, key4);
    }

    #[test]
    fn test_key_verification() {
        let key_gen = DialbackKey::new(b"verification-secret");

        let key = key_gen.generate("stream-123", "b.example", "a.example");

        assert!(key_gen.verify(&key, "stream-123", "b.example", "a.example"));
        assert!(!key_gen.verify(&key, "wrong-stream", "b.example", "a.example"));
        assert!(!key_gen.verify(&key, "stream-123", "wrong.example", "a.example"));

        let mut tampered = key.clone();
        if let Some(last) = tampered.pop() {
            tampered.push(if last == 'a' { 'b' } else { 'a' });
        }
        assert!(!key_gen.verify(&tampered, "stream-123", "b.example", "a.example"));
    }

    #[test]
    fn test_key_is_hex_sha256() {
        let key_gen = DialbackKey::new(b"hex-test");
        let key = key_gen.generate("stream", "to.example", "from.example");

        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_dialback_result_attr() {
        assert_eq!(DialbackResult::Valid.as_str(), "valid");
        assert_eq!(DialbackResult::from_attr("invalid"), Some(DialbackResult::Invalid));
        assert_eq!(DialbackResult::from_attr("maybe"), None);
    }

    #[test]
    fn test_build_db_result() {
        let xml = build_db_result("a.example", "b.example", "abc123");
        assert!(xml.contains("db:result"));
        assert!(xml.contains("from='a.example'"));
        assert!(xml.contains("to='b.example'"));
        assert!(xml.contains("abc123"));
    }

    #[test]
    fn test_build_db_verify() {
        let xml = build_db_verify("b.example", "a.example", "stream-123", "key456");
        assert!(xml.contains("db:verify"));
        assert!(xml.contains("id='stream-123'"));
        assert!(xml.contains("key456"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hell"));
        assert!(constant_time_eq(b"", b""));
    }
}
