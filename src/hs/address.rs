//! v3 onion addresses
//!
//! A v3 address is 56 base32 characters encoding
//! `PUBKEY (32) | CHECKSUM (2) | VERSION (1)`, where the checksum is the
//! first two bytes of `SHA3-256(".onion checksum" | PUBKEY | VERSION)` and
//! the version byte is 0x03.

use crate::error::{Result, TorError};
use data_encoding::BASE32_NOPAD;
use sha3::{Digest, Sha3_256};

const CHECKSUM_PREFIX: &[u8] = b".onion checksum";
const ADDRESS_VERSION: u8 = 0x03;
const ADDRESS_CHARS: usize = 56;

/// A parsed and checksum-verified v3 onion address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OnionAddress {
    pubkey: [u8; 32],
}

impl OnionAddress {
    /// Parse an address, with or without the `.onion` suffix.
    pub fn parse(address: &str) -> Result<Self> {
        let body = address
            .trim()
            .trim_end_matches('.')
            .strip_suffix(".onion")
            .unwrap_or(address.trim());

        if body.len() != ADDRESS_CHARS {
            return Err(TorError::InvalidOnionAddress(format!(
                "expected {} base32 characters, got {}",
                ADDRESS_CHARS,
                body.len()
            )));
        }

        let decoded = BASE32_NOPAD
            .decode(body.to_uppercase().as_bytes())
            .map_err(|e| TorError::InvalidOnionAddress(format!("bad base32: {}", e)))?;
        if decoded.len() != 35 {
            return Err(TorError::InvalidOnionAddress(format!(
                "decoded to {} bytes, expected 35",
                decoded.len()
            )));
        }

        let version = decoded[34];
        if version != ADDRESS_VERSION {
            return Err(TorError::InvalidOnionAddress(format!(
                "unsupported version {}",
                version
            )));
        }

        let mut pubkey = [0u8; 32];
        pubkey.copy_from_slice(&decoded[0..32]);

        let expected = checksum(&pubkey);
        if decoded[32..34] != expected {
            return Err(TorError::InvalidOnionAddress("checksum mismatch".into()));
        }

        Ok(Self { pubkey })
    }

    /// Construct from a service identity key (checksum is computed)
    pub fn from_pubkey(pubkey: [u8; 32]) -> Self {
        Self { pubkey }
    }

    /// The service's Ed25519 identity key
    pub fn pubkey(&self) -> &[u8; 32] {
        &self.pubkey
    }

    /// Whether a hostname looks like a v3 onion address
    pub fn is_onion_host(host: &str) -> bool {
        host.trim_end_matches('.').ends_with(".onion")
    }
}

impl std::fmt::Display for OnionAddress {
    /// Renders as `<56 chars>.onion`
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut bytes = Vec::with_capacity(35);
        bytes.extend_from_slice(&self.pubkey);
        bytes.extend_from_slice(&checksum(&self.pubkey));
        bytes.push(ADDRESS_VERSION);
        write!(f, "{}.onion", BASE32_NOPAD.encode(&bytes).to_lowercase())
    }
}

fn checksum(pubkey: &[u8; 32]) -> [u8; 2] {
    let mut hasher = Sha3_256::new();
    hasher.update(CHECKSUM_PREFIX);
    hasher.update(pubkey);
    hasher.update([ADDRESS_VERSION]);
    let digest = hasher.finalize();
    [digest[0], digest[1]]
}

#[cfg(test)]
mod tests {
    use super::*;

    // A live v3 address with a valid checksum
    const KNOWN_ADDRESS: &str = "vww6ybal4bd7szmgncyruucpgfkqahzddi37ktceo3ah7ngmcopnpyyd.onion";

    #[test]
    fn test_known_address_parses() {
        let addr = OnionAddress::parse(KNOWN_ADDRESS).unwrap();
        assert_eq!(addr.to_string(), KNOWN_ADDRESS);
    }

    #[test]
    fn test_parse_without_suffix() {
        let bare = KNOWN_ADDRESS.strip_suffix(".onion").unwrap();
        let addr = OnionAddress::parse(bare).unwrap();
        assert_eq!(addr.to_string(), KNOWN_ADDRESS);
    }

    #[test]
    fn test_roundtrip_from_pubkey() {
        let addr = OnionAddress::parse(KNOWN_ADDRESS).unwrap();
        let rebuilt = OnionAddress::from_pubkey(*addr.pubkey());
        assert_eq!(rebuilt.to_string(), KNOWN_ADDRESS);
        assert_eq!(rebuilt.pubkey(), addr.pubkey());
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        // Flip one character in the checksum region
        let mut chars: Vec<char> = KNOWN_ADDRESS.chars().collect();
        let i = 53;
        chars[i] = if chars[i] == 'a' { 'b' } else { 'a' };
        let corrupted: String = chars.into_iter().collect();
        assert!(matches!(
            OnionAddress::parse(&corrupted),
            Err(TorError::InvalidOnionAddress(_))
        ));
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(OnionAddress::parse("tooshort.onion").is_err());
        assert!(OnionAddress::parse("").is_err());
    }

    #[test]
    fn test_bad_base32_rejected() {
        // '1' and '8' are not in the base32 alphabet
        let bad = format!("{}18.onion", &KNOWN_ADDRESS[..54]);
        assert!(OnionAddress::parse(&bad).is_err());
    }

    #[test]
    fn test_is_onion_host() {
        assert!(OnionAddress::is_onion_host(KNOWN_ADDRESS));
        assert!(OnionAddress::is_onion_host("example.onion."));
        assert!(!OnionAddress::is_onion_host("example.com"));
    }
}
