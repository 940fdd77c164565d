//! Stream isolation
//!
//! Streams that must not be correlated are kept on distinct circuits. The
//! isolation key is a tagged value used as a map key by the circuit pool;
//! credentials and session tokens are stored only as SHA-256 digests so no
//! plaintext secret is retained.

use crate::config::IsolationMode;
use sha2::{Digest, Sha256};

/// Tagged isolation key. Equality is byte-wise over the tag and value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IsolationKey {
    /// Share circuits freely
    None,
    /// Isolated per (host, port) destination
    Destination(String),
    /// Isolated per SOCKS credential (pre-hashed)
    Credential([u8; 32]),
    /// Isolated per destination port
    Port(u16),
    /// Isolated per caller session token (pre-hashed)
    Session([u8; 32]),
}

impl IsolationKey {
    /// Destination key for `host:port` (host lowercased, trailing dot
    /// stripped)
    pub fn destination(host: &str, port: u16) -> Self {
        let host = host.trim_end_matches('.').to_lowercase();
        IsolationKey::Destination(format!("{}:{}", host, port))
    }

    /// Credential key; the plaintext is hashed immediately and not kept
    pub fn credential(username: &str, password: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((username.len() as u64).to_be_bytes());
        hasher.update(username.as_bytes());
        hasher.update(password.as_bytes());
        IsolationKey::Credential(hasher.finalize().into())
    }

    /// Session key from an opaque caller-supplied token
    pub fn session(token: &[u8]) -> Self {
        IsolationKey::Session(Sha256::digest(token).into())
    }

    /// Derive the key for a destination under the configured default mode
    pub fn for_mode(mode: IsolationMode, host: &str, port: u16) -> Self {
        match mode {
            IsolationMode::None => IsolationKey::None,
            IsolationMode::Destination => Self::destination(host, port),
            IsolationMode::Port => IsolationKey::Port(port),
            // Credential and session isolation need caller-supplied
            // secrets; with none provided they fall back to sharing
            IsolationMode::Credential | IsolationMode::Session => IsolationKey::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_normalisation() {
        assert_eq!(
            IsolationKey::destination("Example.COM.", 80),
            IsolationKey::destination("example.com", 80)
        );
        assert_ne!(
            IsolationKey::destination("example.com", 80),
            IsolationKey::destination("example.com", 443)
        );
    }

    #[test]
    fn test_credential_is_hashed() {
        let key = IsolationKey::credential("alice", "hunter2");
        match &key {
            IsolationKey::Credential(digest) => {
                // No plaintext survives in the key
                assert_ne!(&digest[..], b"alicehunter2".as_slice());
            }
            _ => panic!("expected Credential"),
        }
        assert_eq!(key, IsolationKey::credential("alice", "hunter2"));
        assert_ne!(key, IsolationKey::credential("alice", "hunter3"));
        // The length prefix keeps (ab, c) distinct from (a, bc)
        assert_ne!(
            IsolationKey::credential("ab", "c"),
            IsolationKey::credential("a", "bc")
        );
    }

    #[test]
    fn test_session_tokens() {
        let a = IsolationKey::session(b"session-1");
        let b = IsolationKey::session(b"session-2");
        assert_ne!(a, b);
        assert_eq!(a, IsolationKey::session(b"session-1"));
    }

    #[test]
    fn test_mode_mapping() {
        assert_eq!(
            IsolationKey::for_mode(IsolationMode::None, "example.com", 80),
            IsolationKey::None
        );
        assert_eq!(
            IsolationKey::for_mode(IsolationMode::Destination, "example.com", 80),
            IsolationKey::destination("example.com", 80)
        );
        assert_eq!(
            IsolationKey::for_mode(IsolationMode::Port, "example.com", 80),
            IsolationKey::Port(80)
        );
    }
}
